//! Interactive exec sessions. At most one session is attached to a container
//! at a time; input arrives line by line through a small buffered channel.

use crate::error::{Error, Result};
use crate::shared::ContainerId;
use bollard::Docker;
#[allow(deprecated)]
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::container::LogOutput;
use futures_util::{Stream, StreamExt};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

/// Lines of input that may be queued before the sender waits.
pub const INPUT_BUFFER: usize = 20;

const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Clone, Default)]
pub struct ExecSessions {
    sessions: Arc<Mutex<HashMap<ContainerId, mpsc::Sender<String>>>>,
}

/// Keeps a session registered; dropping it ends the session's input.
pub struct SessionGuard {
    sessions: ExecSessions,
    container: ContainerId,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.sessions
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.container);
        debug!("exec session on {} closed", self.container);
    }
}

impl ExecSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session on `container`. Fails with AlreadyExists while
    /// another session is attached.
    pub fn register(
        &self,
        container: &ContainerId,
    ) -> Result<(SessionGuard, mpsc::Receiver<String>)> {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if sessions.contains_key(container) {
            return Err(Error::already_exists("exec session", container.as_str()));
        }
        let (tx, rx) = mpsc::channel(INPUT_BUFFER);
        sessions.insert(container.clone(), tx);
        Ok((
            SessionGuard {
                sessions: self.clone(),
                container: container.clone(),
            },
            rx,
        ))
    }

    #[cfg(test)]
    pub fn is_active(&self, container: &ContainerId) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(container)
    }

    /// Queues one line of input for the session on `container`.
    pub async fn send_input(&self, container: &ContainerId, line: String) -> Result<()> {
        let sender = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(container)
            .cloned()
            .ok_or_else(|| Error::not_found("exec session", container.as_str()))?;
        sender
            .send(line)
            .await
            .map_err(|_| Error::not_found("exec session", container.as_str()))
    }
}

impl SessionGuard {
    pub fn container(&self) -> &ContainerId {
        &self.container
    }
}

/// Runs `cmd` (a shell by default) in the container of a registered session
/// and forwards its output line by line to `output` until the process exits
/// or the receiver of `output` is dropped. The session is released when this
/// returns.
#[allow(deprecated)]
pub async fn attach<T>(
    docker: &Docker,
    session: SessionGuard,
    mut input: mpsc::Receiver<String>,
    cmd: Vec<String>,
    output: mpsc::Sender<T>,
) -> Result<()>
where
    T: From<String> + Send,
{
    let container = session.container().clone();
    let cmd = if cmd.is_empty() {
        vec![DEFAULT_SHELL.to_string()]
    } else {
        cmd
    };

    let exec = docker
        .create_exec(
            container.as_str(),
            CreateExecOptions {
                cmd: Some(cmd),
                attach_stdin: Some(true),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                tty: Some(true),
                ..Default::default()
            },
        )
        .await?;
    let started = docker
        .start_exec(
            &exec.id,
            Some(StartExecOptions {
                detach: false,
                tty: true,
                ..Default::default()
            }),
        )
        .await?;
    let StartExecResults::Attached {
        output: stdout,
        input: mut stdin,
    } = started
    else {
        return Err(Error::Upstream(format!(
            "exec on {container} started detached"
        )));
    };
    info!("exec session attached to {container}");

    let writer = tokio::spawn(async move {
        while let Some(mut line) = input.recv().await {
            line.push('\n');
            if stdin.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdin.flush().await.is_err() {
                break;
            }
        }
    });

    let result = pump(stdout, &output).await;
    writer.abort();
    drop(session);
    result
}

/// Forwards process output as lines. Returns as soon as the receiver of
/// `output` is gone, even while the process is silent.
async fn pump<S, T>(mut stdout: S, output: &mpsc::Sender<T>) -> Result<()>
where
    S: Stream<Item = std::result::Result<LogOutput, bollard::errors::Error>> + Unpin,
    T: From<String>,
{
    let mut lines = LineSplitter::default();
    loop {
        let chunk = tokio::select! {
            _ = output.closed() => {
                debug!("exec output listener went away");
                return Ok(());
            }
            chunk = stdout.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        for line in lines.push(&chunk?.into_bytes()) {
            if output.send(T::from(line)).await.is_err() {
                return Ok(());
            }
        }
    }
    if let Some(rest) = lines.finish() {
        let _ = output.send(T::from(rest)).await;
    }
    Ok(())
}

/// Splits a byte stream into lines, tolerating `\r\n` from a tty.
#[derive(Default)]
struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.push_str(&String::from_utf8_lossy(bytes));
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=pos).collect();
            lines.push(line.trim_end_matches(['\r', '\n']).to_string());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn one_session_per_container() {
        let sessions = ExecSessions::new();
        let web = ContainerId::new("web");
        let (guard, _rx) = sessions.register(&web).unwrap();

        let err = sessions.register(&web).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        // other containers are independent
        let (_db, _db_rx) = sessions.register(&ContainerId::new("db")).unwrap();

        drop(guard);
        assert!(!sessions.is_active(&web));
        assert!(sessions.register(&web).is_ok());
    }

    #[tokio::test]
    async fn input_reaches_the_session() {
        let sessions = ExecSessions::new();
        let web = ContainerId::new("web");
        let (_guard, mut rx) = sessions.register(&web).unwrap();

        sessions.send_input(&web, "ls -la".to_string()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "ls -la");
    }

    #[tokio::test]
    async fn input_without_session_is_not_found() {
        let sessions = ExecSessions::new();
        let err = sessions
            .send_input(&ContainerId::new("ghost"), "ls".to_string())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn splits_tty_output_into_lines() {
        let mut lines = LineSplitter::default();
        assert_eq!(lines.push(b"total 0\r\ndr"), ["total 0"]);
        assert_eq!(lines.push(b"wx a\nb\n"), ["drwx a", "b"]);
        assert!(lines.push(b"$ ").is_empty());
        assert_eq!(lines.finish().as_deref(), Some("$ "));
        assert_eq!(lines.finish(), None);
    }

    #[tokio::test]
    async fn silent_process_stops_when_the_listener_leaves() {
        let (tx, rx) = mpsc::channel::<String>(4);
        drop(rx);
        let silent = futures_util::stream::pending::<
            std::result::Result<LogOutput, bollard::errors::Error>,
        >();
        tokio::time::timeout(std::time::Duration::from_secs(5), pump(silent, &tx))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn output_is_forwarded_until_the_process_exits() {
        let (tx, mut rx) = mpsc::channel::<String>(8);
        let chunks = futures_util::stream::iter(vec![
            Ok(LogOutput::Console {
                message: bytes::Bytes::from_static(b"hello\r\nwor"),
            }),
            Ok(LogOutput::Console {
                message: bytes::Bytes::from_static(b"ld\n$ "),
            }),
        ]);
        pump(chunks, &tx).await.unwrap();
        drop(tx);
        let mut got = Vec::new();
        while let Some(line) = rx.recv().await {
            got.push(line);
        }
        assert_eq!(got, ["hello", "world", "$ "]);
    }
}
