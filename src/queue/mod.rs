//! Queue storage contract, an in-process backend and its reconnect decorator.
//!
//! A [`QueueStorage`] is bound to one queue. Messages are plain strings;
//! [`TypedQueue`] layers tagged JSON payloads on top.

mod decorators;
mod memory;
mod typed;

pub use decorators::ReconnectingQueueStorage;
pub use memory::{InMemoryQueueService, InMemoryQueueStorage};
pub use typed::{TypedMessage, TypedQueue};

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// How long a taken message stays hidden unless the caller says otherwise
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for `get_raw_messages`
pub const MAX_MESSAGES_PER_GET: usize = 32;

/// Largest accepted message body, in bytes
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// A message read from a queue.
///
/// `pop_receipt` is issued when the message is taken and must accompany a
/// later finish or release; a peeked message carries an empty receipt.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub pop_receipt: String,
    pub content: String,
    pub dequeue_count: u32,
    pub inserted_at: DateTime<Utc>,
}

#[async_trait]
pub trait QueueStorage: Send + Sync {
    fn name(&self) -> &str;

    async fn put_raw_message(&self, content: &str) -> Result<()>;

    /// Take the next visible message and hide it for `visibility_timeout`.
    /// It reappears unless finished in time.
    async fn get_raw_message(&self, visibility_timeout: Duration) -> Result<Option<QueueMessage>>;

    /// Next visible message, left in place
    async fn peek_raw_message(&self) -> Result<Option<QueueMessage>>;

    /// Delete a taken message; `NotFound` once its receipt is stale
    async fn finish_raw_message(&self, message: &QueueMessage) -> Result<()>;

    /// Make a taken message visible again immediately
    async fn release_raw_message(&self, message: &QueueMessage) -> Result<()>;

    /// Take and delete up to `max_count` visible messages
    async fn get_raw_messages(&self, max_count: usize) -> Result<Vec<QueueMessage>>;

    async fn clear(&self) -> Result<()>;

    /// Messages in the queue, hidden ones included
    async fn count(&self) -> Result<usize>;
}

/// Lowercase `name` and check it against the service's naming rules:
/// 3 to 63 characters, ASCII letters, digits and single hyphens, starting and
/// ending with a letter or digit.
pub fn normalize_queue_name(name: &str) -> Result<String> {
    let name = name.to_ascii_lowercase();
    let fail = |reason: &str| Err(Error::Configuration(format!("queue name '{}' {}", name, reason)));

    if !(3..=63).contains(&name.len()) {
        return fail("must be 3 to 63 characters long");
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return fail("may only contain letters, digits and hyphens");
    }
    if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
        return fail("must not start or end with a hyphen or contain consecutive hyphens");
    }
    Ok(name)
}
