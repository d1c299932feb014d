pub mod client;
pub mod containers;
pub mod exec;
pub mod images;
pub mod networks;
pub mod pool;
pub mod ports;
pub mod stats;
pub mod update;
pub mod volumes;

use crate::error::Result;
use log::debug;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Re-reads a docker model as one of our own views. The views only name the
/// fields they use, with the daemon's json keys, so they keep working across
/// client versions.
pub(crate) fn wire<V: DeserializeOwned>(model: impl Serialize) -> Result<V> {
    Ok(serde_json::from_value(serde_json::to_value(model)?)?)
}

/// Reads an explicit `null` as the default value.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Line sink for progress output of long running operations. Writes are best
/// effort: a reader that went away must not abort the operation.
pub struct Progress<'a> {
    out: Option<&'a mut (dyn AsyncWrite + Unpin + Send)>,
}

impl<'a> Progress<'a> {
    pub fn new(out: &'a mut (dyn AsyncWrite + Unpin + Send)) -> Self {
        Self { out: Some(out) }
    }

    pub fn none() -> Self {
        Self { out: None }
    }

    pub async fn line(&mut self, line: impl AsRef<str>) {
        let Some(out) = self.out.as_deref_mut() else {
            return;
        };
        let mut buf = line.as_ref().trim_end_matches('\n').to_string();
        buf.push('\n');
        if let Err(e) = out.write_all(buf.as_bytes()).await {
            debug!("progress reader went away: {e}");
            self.out = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn progress_writes_one_line_per_call() {
        let (mut writer, mut reader) = tokio::io::duplex(64);
        {
            let mut progress = Progress::new(&mut writer);
            progress.line("pulling nginx").await;
            progress.line("done\n").await;
        }
        drop(writer);
        let mut out = String::new();
        reader.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "pulling nginx\ndone\n");
    }

    #[tokio::test]
    async fn progress_survives_a_closed_reader() {
        let (mut writer, reader) = tokio::io::duplex(8);
        drop(reader);
        let mut progress = Progress::new(&mut writer);
        progress.line("first").await;
        progress.line("second").await;
        assert!(progress.out.is_none());
    }
}
