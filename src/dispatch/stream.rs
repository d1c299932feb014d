//! Line streaming for long running operations.
//!
//! An operation writes its progress into one end of an in-memory pipe; a
//! scanner task reads the other end line by line and forwards every line as
//! a [`LogsMessage`]. The operation runs on its own task, so a caller that
//! stops listening does not abort it halfway.

use crate::error::{Error, Result};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const PIPE_CAPACITY: usize = 64 * 1024;
pub const LINE_BUFFER: usize = 64;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LogsMessage {
    pub message: String,
}

impl From<String> for LogsMessage {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl LogsMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Lines of a running operation and its final result. The result is only
/// ready after every line has been handed to `lines`.
pub struct OperationStream {
    pub lines: mpsc::Receiver<LogsMessage>,
    pub done: JoinHandle<Result<()>>,
}

impl OperationStream {
    /// Waits for the operation, collecting its output.
    pub async fn collect(mut self) -> (Vec<String>, Result<()>) {
        let mut lines = Vec::new();
        while let Some(line) = self.lines.recv().await {
            lines.push(line.message);
        }
        let result = self
            .done
            .await
            .unwrap_or_else(|e| Err(Error::Upstream(format!("operation task failed: {e}"))));
        (lines, result)
    }
}

async fn scan_lines(reader: DuplexStream, lines: mpsc::Sender<LogsMessage>) {
    let mut reader = BufReader::new(reader).lines();
    loop {
        match reader.next_line().await {
            Ok(Some(line)) => {
                if lines.send(LogsMessage::new(line)).await.is_err() {
                    debug!("listener went away, dropping further output");
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                warn!("reading operation output failed: {e}");
                return;
            }
        }
    }
}

/// Runs `op` on a detached task with the writing end of a fresh pipe. A
/// failure is logged and sent as the last line.
pub fn spawn_operation<F, Fut>(name: &'static str, op: F) -> OperationStream
where
    F: FnOnce(DuplexStream) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    let scanner = tokio::spawn(scan_lines(reader, tx.clone()));
    let done = tokio::spawn(async move {
        // `op` owns the writer; the pipe closes when it returns
        let result = op(writer).await;
        if let Err(e) = scanner.await {
            warn!("{name}: output scanner failed: {e}");
        }
        if let Err(e) = &result {
            error!("{name} failed: {e}");
            let _ = tx.send(LogsMessage::new(format!("error: {e}"))).await;
        }
        result
    });
    OperationStream { lines: rx, done }
}

/// Forwards a byte stream as lines until it ends, fails or the receiver is
/// dropped. An error is sent as the last line. A dropped receiver is noticed
/// even while the stream is idle.
pub fn spawn_lines<S>(name: String, stream: S) -> mpsc::Receiver<LogsMessage>
where
    S: Stream<Item = Result<Bytes>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(LINE_BUFFER);
    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        let mut pending = String::new();
        loop {
            let chunk = tokio::select! {
                _ = tx.closed() => {
                    debug!("{name}: listener went away");
                    return;
                }
                chunk = stream.next() => chunk,
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!("{name}: {e}");
                    let _ = tx.send(LogsMessage::new(format!("error: {e}"))).await;
                    return;
                }
                None => break,
            };
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(pos) = pending.find('\n') {
                let line: String = pending.drain(..=pos).collect();
                let line = line.trim_end_matches(['\r', '\n']).to_string();
                if tx.send(LogsMessage::new(line)).await.is_err() {
                    debug!("{name}: listener went away");
                    return;
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(LogsMessage::new(pending)).await;
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::Progress;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn lines_arrive_before_the_result() {
        let stream = spawn_operation("test", |mut pipe| async move {
            let mut progress = Progress::new(&mut pipe);
            progress.line("pulling nginx").await;
            progress.line("container web-nginx-1 started").await;
            Ok(())
        });
        let (lines, result) = stream.collect().await;
        assert!(result.is_ok());
        assert_eq!(lines, ["pulling nginx", "container web-nginx-1 started"]);
    }

    #[tokio::test]
    async fn failure_is_the_last_line() {
        let stream = spawn_operation("test", |mut pipe| async move {
            Progress::new(&mut pipe).line("building").await;
            Err(Error::not_found("image", "nope"))
        });
        let (lines, result) = stream.collect().await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1], "error: image not found: nope");
    }

    #[tokio::test]
    async fn operation_finishes_without_a_listener() {
        let (finished_tx, finished_rx) = tokio::sync::oneshot::channel();
        let stream = spawn_operation("test", |mut pipe| async move {
            let mut progress = Progress::new(&mut pipe);
            for i in 0..1000 {
                progress.line(format!("line {i}")).await;
            }
            let _ = finished_tx.send(());
            Ok(())
        });
        drop(stream.lines);
        finished_rx.await.unwrap();
        assert!(stream.done.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn byte_streams_are_split_into_lines() {
        let chunks: Vec<Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"first\nsec")),
            Ok(Bytes::from_static(b"ond\r\nthird")),
        ];
        let mut rx = spawn_lines("logs".to_string(), futures_util::stream::iter(chunks));
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line.message);
        }
        assert_eq!(lines, ["first", "second", "third"]);
    }

    #[tokio::test]
    async fn idle_stream_stops_when_the_listener_leaves() {
        struct Dropped(Option<tokio::sync::oneshot::Sender<()>>);
        impl Drop for Dropped {
            fn drop(&mut self) {
                if let Some(tx) = self.0.take() {
                    let _ = tx.send(());
                }
            }
        }

        let (dropped_tx, dropped_rx) = tokio::sync::oneshot::channel();
        let marker = Dropped(Some(dropped_tx));
        // never yields, like a followed log of a quiet container
        let idle = futures_util::stream::pending::<Result<Bytes>>().map(move |chunk| {
            let _ = &marker;
            chunk
        });
        let rx = spawn_lines("logs".to_string(), idle);
        drop(rx);
        tokio::time::timeout(std::time::Duration::from_secs(5), dropped_rx)
            .await
            .unwrap()
            .unwrap();
    }
}
