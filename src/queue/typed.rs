use super::{QueueMessage, QueueStorage, DEFAULT_VISIBILITY_TIMEOUT, MAX_MESSAGES_PER_GET};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A taken message and its decoded payload. `item` is `None` when the
/// message's tag is unknown or its body does not decode as the requested type.
#[derive(Debug, Clone)]
pub struct TypedMessage<T> {
    pub message: QueueMessage,
    pub item: Option<T>,
}

/// Queue of tagged JSON payloads.
///
/// Each message body is `{tag}:{json}`, where the tag names the registered
/// Rust type that produced it. Readers skip messages whose tag they do not
/// know, so producers and consumers may register different subsets.
pub struct TypedQueue {
    queue: Arc<dyn QueueStorage>,
    tags: HashMap<TypeId, String>,
}

impl TypedQueue {
    pub fn new(queue: Arc<dyn QueueStorage>) -> Self {
        Self {
            queue,
            tags: HashMap::new(),
        }
    }

    /// Register `T` under `tag`. Tags must be unique and free of `:`.
    pub fn register<T: 'static>(mut self, tag: &str) -> Result<Self> {
        if tag.is_empty() || tag.contains(':') {
            return Err(Error::Configuration(format!("invalid message tag '{}'", tag)));
        }
        if self.tags.values().any(|t| t == tag) {
            return Err(Error::Configuration(format!(
                "message tag '{}' is already registered",
                tag
            )));
        }
        self.tags.insert(TypeId::of::<T>(), tag.to_string());
        Ok(self)
    }

    pub fn queue(&self) -> &Arc<dyn QueueStorage> {
        &self.queue
    }

    fn tag_of<T: 'static>(&self) -> Option<&str> {
        self.tags.get(&TypeId::of::<T>()).map(String::as_str)
    }

    /// Enqueue `item` and return the message body, or `None` (and enqueue
    /// nothing) when `T` is not registered.
    pub async fn put_message<T: Serialize + 'static>(&self, item: &T) -> Result<Option<String>> {
        let Some(tag) = self.tag_of::<T>() else {
            debug!(
                queue = self.queue.name(),
                message_type = std::any::type_name::<T>(),
                "Unregistered message type"
            );
            return Ok(None);
        };
        let json = serde_json::to_string(item).map_err(|e| Error::Serialization(e.to_string()))?;
        let body = format!("{}:{}", tag, json);
        self.queue.put_raw_message(&body).await?;
        Ok(Some(body))
    }

    /// Take the next message, hidden for the default visibility timeout
    pub async fn get_message<T: DeserializeOwned + 'static>(
        &self,
    ) -> Result<Option<TypedMessage<T>>> {
        let message = self.queue.get_raw_message(DEFAULT_VISIBILITY_TIMEOUT).await?;
        Ok(message.map(|message| TypedMessage {
            item: self.decode(&message.content),
            message,
        }))
    }

    pub async fn finish_message<T>(&self, message: &TypedMessage<T>) -> Result<()> {
        self.queue.finish_raw_message(&message.message).await
    }

    /// Take and delete up to `max_count` messages, keeping those that decode as `T`
    pub async fn get_messages<T: DeserializeOwned + 'static>(
        &self,
        max_count: usize,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut remaining = max_count;
        while remaining > 0 {
            let batch = self
                .queue
                .get_raw_messages(remaining.min(MAX_MESSAGES_PER_GET))
                .await?;
            if batch.is_empty() {
                break;
            }
            remaining -= batch.len();
            items.extend(batch.iter().filter_map(|m| self.decode::<T>(&m.content)));
        }
        Ok(items)
    }

    fn decode<T: DeserializeOwned + 'static>(&self, body: &str) -> Option<T> {
        let (tag, json) = body.split_once(':')?;
        if self.tag_of::<T>() != Some(tag) {
            return None;
        }
        serde_json::from_str(json).ok()
    }
}
