use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::Event;

pub mod jsonl;
pub use jsonl::JsonLinesFeed;

#[async_trait]
pub trait EventFeed {
    /// Start reading events from the source.
    /// Events should be sent to the provided channel.
    async fn monitor(&self, event_tx: mpsc::Sender<Event>) -> Result<()>;
}
