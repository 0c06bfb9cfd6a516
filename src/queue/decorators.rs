use super::{QueueMessage, QueueStorage};
use crate::decorators::{ClientFactory, ReloadingCell};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Reruns `$call` once against a rebuilt client after a 403
macro_rules! reconnecting {
    ($self:ident, |$queue:ident| $call:expr) => {{
        let (generation, $queue) = $self.cell.instance().await?;
        match $call {
            Err(e) if e.is_auth_failure() => {
                $self.cell.invalidate(generation);
                let (_, $queue) = $self.cell.instance().await?;
                $call
            }
            other => other,
        }
    }};
}

/// Queue counterpart of [`crate::decorators::ReconnectingTableStorage`]
pub struct ReconnectingQueueStorage {
    name: String,
    cell: ReloadingCell<dyn QueueStorage>,
}

impl ReconnectingQueueStorage {
    pub fn new(name: impl Into<String>, factory: ClientFactory<dyn QueueStorage>) -> Self {
        Self {
            name: name.into(),
            cell: ReloadingCell::new("queue", factory),
        }
    }

    pub fn generation(&self) -> u64 {
        self.cell.generation()
    }
}

#[async_trait]
impl QueueStorage for ReconnectingQueueStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_raw_message(&self, content: &str) -> Result<()> {
        reconnecting!(self, |queue| queue.put_raw_message(content).await)
    }

    async fn get_raw_message(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>> {
        reconnecting!(self, |queue| queue.get_raw_message(visibility_timeout).await)
    }

    async fn peek_raw_message(&self) -> Result<Option<QueueMessage>> {
        reconnecting!(self, |queue| queue.peek_raw_message().await)
    }

    async fn finish_raw_message(&self, message: &QueueMessage) -> Result<()> {
        reconnecting!(self, |queue| queue.finish_raw_message(message).await)
    }

    async fn release_raw_message(&self, message: &QueueMessage) -> Result<()> {
        reconnecting!(self, |queue| queue.release_raw_message(message).await)
    }

    async fn get_raw_messages(&self, max_count: usize) -> Result<Vec<QueueMessage>> {
        reconnecting!(self, |queue| queue.get_raw_messages(max_count).await)
    }

    async fn clear(&self) -> Result<()> {
        reconnecting!(self, |queue| queue.clear().await)
    }

    async fn count(&self) -> Result<usize> {
        reconnecting!(self, |queue| queue.count().await)
    }
}
