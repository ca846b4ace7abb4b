//! In-memory queue transport for testing and local development.
//!
//! [`InMemoryTransport`] emulates the parts of the queue service the lease
//! protocol depends on:
//! - visibility windows measured on tokio's clock, so paused-time tests can
//!   step through renewals deterministically
//! - long polling that wakes as soon as a message is sent or released
//! - a fresh receipt handle for every delivery
//! - stale receipts rejected by `change_visibility` and ignored by
//!   `delete_message`
//!
//! Queues are addressed by URLs of the form `memory://local/{name}`.

use crate::error::QueueError;
use crate::message::{
    QueueAttributes, QueueName, ReceiptHandle, ReceiveRequest, ReceivedMessage, SendReceipt,
};
use crate::transport::QueueTransport;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

const URL_PREFIX: &str = "memory://local/";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message stored in a queue with its delivery state
struct StoredMessage {
    message_id: String,
    body: String,
    /// Receipt of the most recent delivery
    receipt: Option<String>,
    visible_at: Instant,
}

impl StoredMessage {
    fn is_visible(&self, now: Instant) -> bool {
        now >= self.visible_at
    }
}

/// State and wake-up signal of a single queue
struct MemoryQueue {
    attributes: QueueAttributes,
    messages: Mutex<Vec<StoredMessage>>,
    /// Signalled whenever a message may have become receivable
    available: Notify,
}

impl MemoryQueue {
    fn new(attributes: QueueAttributes) -> Self {
        Self {
            attributes,
            messages: Mutex::new(Vec::new()),
            available: Notify::new(),
        }
    }

    fn messages(&self) -> MutexGuard<'_, Vec<StoredMessage>> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver the oldest visible message, hiding it for `visibility`
    fn try_receive(&self, visibility: Duration) -> Option<ReceivedMessage> {
        let now = Instant::now();
        let mut messages = self.messages();
        let message = messages.iter_mut().find(|m| m.is_visible(now))?;

        let receipt = Uuid::new_v4().to_string();
        message.receipt = Some(receipt.clone());
        message.visible_at = now + visibility;

        Some(ReceivedMessage {
            message_id: Some(message.message_id.clone()),
            receipt_handle: ReceiptHandle::new(receipt),
            body: message.body.clone(),
        })
    }

    /// Earliest instant after `now` at which a hidden message becomes visible
    fn next_visible_at(&self, now: Instant) -> Option<Instant> {
        self.messages()
            .iter()
            .map(|m| m.visible_at)
            .filter(|at| *at > now)
            .min()
    }
}

// ============================================================================
// InMemoryTransport
// ============================================================================

/// Queue transport backed by process memory
///
/// Cloning is cheap; clones share the same queues.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    queues: Arc<RwLock<HashMap<String, Arc<MemoryQueue>>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// URL under which a queue of the given name is addressed
    pub fn queue_url(name: &QueueName) -> String {
        format!("{}{}", URL_PREFIX, name)
    }

    /// Number of messages that a receive could return right now
    pub fn visible_count(&self, queue_url: &str) -> Result<usize, QueueError> {
        let queue = self.queue(queue_url)?;
        let now = Instant::now();
        let count = queue.messages().iter().filter(|m| m.is_visible(now)).count();
        Ok(count)
    }

    /// Number of messages currently hidden by a visibility window
    pub fn in_flight_count(&self, queue_url: &str) -> Result<usize, QueueError> {
        let queue = self.queue(queue_url)?;
        let now = Instant::now();
        let count = queue
            .messages()
            .iter()
            .filter(|m| !m.is_visible(now))
            .count();
        Ok(count)
    }

    fn queue(&self, queue_url: &str) -> Result<Arc<MemoryQueue>, QueueError> {
        let name = queue_url
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| non_existent_queue(queue_url))?;

        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| non_existent_queue(queue_url))
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queues = self.queues.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = queues.keys().collect();
        names.sort();
        f.debug_struct("InMemoryTransport")
            .field("queues", &names)
            .finish()
    }
}

fn non_existent_queue(queue_url: &str) -> QueueError {
    QueueError::Service {
        status: 400,
        code: "AWS.SimpleQueueService.NonExistentQueue".to_string(),
        message: format!("The specified queue does not exist: {}", queue_url),
    }
}

fn invalid_receipt(receipt: &ReceiptHandle) -> QueueError {
    QueueError::Service {
        status: 400,
        code: "ReceiptHandleIsInvalid".to_string(),
        message: format!(
            "The receipt handle '{}' does not belong to an in-flight message",
            receipt
        ),
    }
}

#[async_trait]
impl QueueTransport for InMemoryTransport {
    async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = queues.get(name.as_str()) {
            if existing.attributes != *attributes {
                return Err(QueueError::Service {
                    status: 400,
                    code: "QueueAlreadyExists".to_string(),
                    message: format!(
                        "A queue named '{}' already exists with different attributes",
                        name
                    ),
                });
            }
        } else {
            queues.insert(
                name.as_str().to_string(),
                Arc::new(MemoryQueue::new(attributes.clone())),
            );
            debug!(queue = %name, "Created in-memory queue");
        }

        Ok(Self::queue_url(name))
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        let queue = self.queue(queue_url)?;
        if let Some(name) = queue_url.strip_prefix(URL_PREFIX) {
            self.queues
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(name);
        }
        queue.available.notify_waiters();
        Ok(())
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> Result<SendReceipt, QueueError> {
        let queue = self.queue(queue_url)?;
        let message_id = Uuid::new_v4().to_string();

        queue.messages().push(StoredMessage {
            message_id: message_id.clone(),
            body: body.to_string(),
            receipt: None,
            visible_at: Instant::now(),
        });
        queue.available.notify_waiters();

        Ok(SendReceipt {
            message_id: Some(message_id),
            md5_of_message_body: None,
        })
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let queue = self.queue(queue_url)?;
        let visibility = Duration::from_secs(u64::from(request.visibility_timeout_secs));
        let deadline = Instant::now() + Duration::from_secs(u64::from(request.wait_time_secs));

        loop {
            // Register interest before looking so a send between the check
            // and the wait is not missed
            let notified = queue.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = queue.try_receive(visibility) {
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = queue
                .next_visible_at(now)
                .map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let queue = self.queue(queue_url)?;
        let now = Instant::now();

        {
            let mut messages = queue.messages();
            let message = messages
                .iter_mut()
                .find(|m| m.receipt.as_deref() == Some(receipt.as_str()) && !m.is_visible(now))
                .ok_or_else(|| invalid_receipt(receipt))?;
            message.visible_at = now + Duration::from_secs(u64::from(timeout_secs));
        }

        if timeout_secs == 0 {
            queue.available.notify_waiters();
        }
        Ok(())
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        let queue = self.queue(queue_url)?;
        let mut messages = queue.messages();
        let before = messages.len();
        messages.retain(|m| m.receipt.as_deref() != Some(receipt.as_str()));

        if messages.len() == before {
            debug!(receipt = %receipt, "Ignoring delete for a stale receipt");
        }
        Ok(())
    }
}
