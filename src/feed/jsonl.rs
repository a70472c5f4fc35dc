use super::EventFeed;
use crate::types::Event;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{mpsc, Mutex};

/// Reads one JSON-encoded [`Event`] per line.
///
/// Blank lines and lines starting with `#` are skipped. Malformed lines are
/// logged and skipped; they never stop the feed.
pub struct JsonLinesFeed<R> {
    source: String,
    reader: Mutex<R>,
}

impl<R> JsonLinesFeed<R> {
    pub fn new(source: impl Into<String>, reader: R) -> Self {
        Self {
            source: source.into(),
            reader: Mutex::new(reader),
        }
    }
}

impl JsonLinesFeed<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new("stdin", tokio::io::stdin())
    }
}

#[async_trait]
impl<R> EventFeed for JsonLinesFeed<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    async fn monitor(&self, event_tx: mpsc::Sender<Event>) -> Result<()> {
        let mut reader = self.reader.lock().await;
        let mut lines = BufReader::new(&mut *reader).lines();
        let mut line_no = 0usize;

        info!("Reading events from {}", self.source);
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match serde_json::from_str::<Event>(line) {
                Ok(event) => {
                    debug!("{}:{}: {:?}", self.source, line_no, event);
                    if let Err(e) = event_tx.send(event).await {
                        warn!("Failed to forward event: {}", e);
                        return Err(anyhow!("Channel closed"));
                    }
                }
                Err(e) => {
                    warn!(
                        "{}:{}: ignoring malformed event: {}",
                        self.source, line_no, e
                    );
                }
            }
        }

        info!("{} reached end of input after {} lines", self.source, line_no);
        Ok(())
    }
}
