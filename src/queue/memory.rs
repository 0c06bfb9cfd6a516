use super::{normalize_queue_name, QueueMessage, QueueStorage, MAX_MESSAGES_PER_GET, MAX_MESSAGE_SIZE};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

struct StoredMessage {
    id: String,
    pop_receipt: String,
    content: String,
    dequeue_count: u32,
    inserted_at: DateTime<Utc>,
    visible_at: Instant,
}

impl StoredMessage {
    fn snapshot(&self) -> QueueMessage {
        QueueMessage {
            id: self.id.clone(),
            pop_receipt: self.pop_receipt.clone(),
            content: self.content.clone(),
            dequeue_count: self.dequeue_count,
            inserted_at: self.inserted_at,
        }
    }

    /// Mark as taken: new receipt, hidden until `visible_at`
    fn take(&mut self, visible_at: Instant) -> QueueMessage {
        self.pop_receipt = Uuid::new_v4().to_string();
        self.dequeue_count += 1;
        self.visible_at = visible_at;
        self.snapshot()
    }
}

type Messages = Arc<Mutex<VecDeque<StoredMessage>>>;

/// Process-local queue service. Queues are created on first use and shared
/// by every handle (and every clone of the service).
#[derive(Clone, Default)]
pub struct InMemoryQueueService {
    queues: Arc<Mutex<HashMap<String, Messages>>>,
    faults: Arc<Mutex<VecDeque<Error>>>,
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next call on any queue with `error`. Faults are consumed in order.
    pub fn inject(&self, error: Error) {
        self.faults.lock().push_back(error);
    }

    /// Handle to the queue called `name` (case-insensitive)
    pub fn queue(&self, name: &str) -> Result<InMemoryQueueStorage> {
        let name = normalize_queue_name(name)?;
        let messages = self.queues.lock().entry(name.clone()).or_default().clone();
        Ok(InMemoryQueueStorage {
            name,
            messages,
            faults: self.faults.clone(),
        })
    }
}

/// One queue of an [`InMemoryQueueService`]
#[derive(Clone)]
pub struct InMemoryQueueStorage {
    name: String,
    messages: Messages,
    faults: Arc<Mutex<VecDeque<Error>>>,
}

impl InMemoryQueueStorage {
    fn enter(&self, operation: &'static str) -> Result<()> {
        match self.faults.lock().pop_front() {
            Some(error) => {
                trace!(queue = %self.name, operation, %error, "Injected queue fault");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn stale_receipt(&self, message: &QueueMessage) -> Error {
        Error::NotFound(format!(
            "message {} in queue {} does not exist or its pop receipt is stale",
            message.id, self.name
        ))
    }
}

#[async_trait]
impl QueueStorage for InMemoryQueueStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_raw_message(&self, content: &str) -> Result<()> {
        self.enter("put_raw_message")?;
        if content.len() > MAX_MESSAGE_SIZE {
            return Err(Error::BadRequest(format!(
                "message of {} bytes exceeds the {} byte limit",
                content.len(),
                MAX_MESSAGE_SIZE
            )));
        }
        self.messages.lock().push_back(StoredMessage {
            id: Uuid::new_v4().to_string(),
            pop_receipt: String::new(),
            content: content.to_string(),
            dequeue_count: 0,
            inserted_at: Utc::now(),
            visible_at: Instant::now(),
        });
        Ok(())
    }

    async fn get_raw_message(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>> {
        self.enter("get_raw_message")?;
        let now = Instant::now();
        Ok(self
            .messages
            .lock()
            .iter_mut()
            .find(|m| m.visible_at <= now)
            .map(|m| m.take(now + visibility_timeout)))
    }

    async fn peek_raw_message(&self) -> Result<Option<QueueMessage>> {
        self.enter("peek_raw_message")?;
        let now = Instant::now();
        Ok(self
            .messages
            .lock()
            .iter()
            .find(|m| m.visible_at <= now)
            .map(|m| QueueMessage {
                pop_receipt: String::new(),
                ..m.snapshot()
            }))
    }

    async fn finish_raw_message(&self, message: &QueueMessage) -> Result<()> {
        self.enter("finish_raw_message")?;
        let mut messages = self.messages.lock();
        let position = messages
            .iter()
            .position(|m| m.id == message.id && m.pop_receipt == message.pop_receipt)
            .filter(|_| !message.pop_receipt.is_empty())
            .ok_or_else(|| self.stale_receipt(message))?;
        messages.remove(position);
        Ok(())
    }

    async fn release_raw_message(&self, message: &QueueMessage) -> Result<()> {
        self.enter("release_raw_message")?;
        let mut messages = self.messages.lock();
        let stored = messages
            .iter_mut()
            .find(|m| m.id == message.id && m.pop_receipt == message.pop_receipt)
            .filter(|_| !message.pop_receipt.is_empty())
            .ok_or_else(|| self.stale_receipt(message))?;
        stored.visible_at = Instant::now();
        Ok(())
    }

    async fn get_raw_messages(&self, max_count: usize) -> Result<Vec<QueueMessage>> {
        self.enter("get_raw_messages")?;
        if !(1..=MAX_MESSAGES_PER_GET).contains(&max_count) {
            return Err(Error::BadRequest(format!(
                "max_count must be within 1..={}, got {}",
                MAX_MESSAGES_PER_GET, max_count
            )));
        }

        let now = Instant::now();
        let mut messages = self.messages.lock();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(messages.len());
        for mut message in messages.drain(..) {
            if taken.len() < max_count && message.visible_at <= now {
                taken.push(message.take(now));
            } else {
                kept.push_back(message);
            }
        }
        *messages = kept;
        Ok(taken)
    }

    async fn clear(&self) -> Result<()> {
        self.enter("clear")?;
        self.messages.lock().clear();
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.enter("count")?;
        Ok(self.messages.lock().len())
    }
}
