//! Push/pop façade with automatic lease management.

use crate::codec::{decode_body, encode_body};
use crate::config::{ClientConfig, LeaseSettings, RetryPolicy};
use crate::error::{ConfigurationError, QueueError};
use crate::lease::{LeaseHandle, LeaseManager};
use crate::message::{QueueAttributes, QueueName, SendReceipt};
use crate::transport::{HttpQueueTransport, QueueTransport};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Queue client turning a visibility-timeout queue into push and pop
///
/// `pop` hands back the decoded body and keeps the message leased until the
/// supplied task settles: deleted when it succeeds, released for redelivery
/// when it fails.
pub struct QueueClient<T: QueueTransport = HttpQueueTransport> {
    transport: Arc<T>,
    leases: LeaseManager<T>,
    retry: RetryPolicy,
    queue_url: RwLock<Option<String>>,
}

impl QueueClient<HttpQueueTransport> {
    /// Create a client talking to the queue service over HTTP
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the configuration does not validate.
    pub fn new(config: ClientConfig) -> Result<Self, QueueError> {
        let transport = HttpQueueTransport::new(&config)?;
        Self::with_transport(transport, config.lease, config.retry, config.queue_url)
    }
}

impl<T: QueueTransport> QueueClient<T> {
    /// Create a client over any transport
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the lease settings do not validate
    /// or `queue_url` is blank.
    pub fn with_transport(
        transport: T,
        lease: LeaseSettings,
        retry: RetryPolicy,
        queue_url: Option<String>,
    ) -> Result<Self, QueueError> {
        lease.validate()?;
        let queue_url = queue_url.map(non_blank).transpose()?;

        let transport = Arc::new(transport);
        Ok(Self {
            leases: LeaseManager::new(Arc::clone(&transport), lease),
            transport,
            retry,
            queue_url: RwLock::new(queue_url),
        })
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn queue_url(&self) -> Option<String> {
        self.queue_url.read().await.clone()
    }

    /// Replace the cached queue URL; a blank URL is rejected
    pub async fn set_queue_url(&self, queue_url: impl Into<String>) -> Result<(), QueueError> {
        let queue_url = non_blank(queue_url.into())?;
        *self.queue_url.write().await = Some(queue_url);
        Ok(())
    }

    async fn require_queue_url(&self) -> Result<String, QueueError> {
        self.queue_url()
            .await
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| ConfigurationError::missing("queue_url").into())
    }

    /// Create a queue and remember its URL for push and pop
    pub async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        let queue_url = self.transport.create_queue(name, attributes).await?;
        debug!(queue = %name, queue_url = %queue_url, "Queue created");

        *self.queue_url.write().await = Some(queue_url.clone());
        Ok(queue_url)
    }

    /// Delete the given queue, or the cached one when `queue_url` is `None`
    ///
    /// The cached URL is cleared when it names the deleted queue.
    pub async fn delete_queue(&self, queue_url: Option<&str>) -> Result<(), QueueError> {
        let target = match queue_url {
            Some(url) => url.to_string(),
            None => self.require_queue_url().await?,
        };

        self.transport.delete_queue(&target).await?;
        debug!(queue_url = %target, "Queue deleted");

        let mut cached = self.queue_url.write().await;
        if cached.as_deref() == Some(target.as_str()) {
            *cached = None;
        }
        Ok(())
    }

    /// Send one message with no delivery delay
    pub async fn push<M>(&self, message: &M) -> Result<SendReceipt, QueueError>
    where
        M: Serialize + ?Sized,
    {
        let queue_url = self.require_queue_url().await?;
        let body = encode_body(message)?;

        let receipt = self.transport.send_message(&queue_url, &body).await?;
        debug!(
            queue_url = %queue_url,
            message_id = ?receipt.message_id,
            "Message pushed"
        );
        Ok(receipt)
    }

    /// Wait for a message and lease it until `task` settles
    ///
    /// Blocks until a message arrives; empty polls and failed receives are
    /// retried silently. The lease is settled in the background, so this
    /// returns as soon as the body is decoded.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Configuration`] when no queue URL is known
    /// - [`QueueError::Serialization`] when the body does not decode; the
    ///   message is released first, so the same undecodable message comes
    ///   back on the next `pop` until the queue's redrive policy moves it
    ///   aside
    /// - [`QueueError::ProtocolViolation`] when the service returns more than
    ///   one message
    pub async fn pop<M, F, E>(&self, task: F) -> Result<M, QueueError>
    where
        M: DeserializeOwned,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (body, _lease) = self.pop_with_lease(task).await?;
        Ok(body)
    }

    /// Same as [`pop`](Self::pop), also returning a handle on the lease
    pub async fn pop_with_lease<M, F, E>(&self, task: F) -> Result<(M, LeaseHandle), QueueError>
    where
        M: DeserializeOwned,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let queue_url = self.require_queue_url().await?;
        let request = self.leases.settings().receive_request();
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.transport.receive_message(&queue_url, &request).await {
                Ok(Some(message)) => {
                    let body = match decode_body::<M>(&message.body) {
                        Ok(body) => body,
                        Err(e) => {
                            warn!(
                                receipt = %message.receipt_handle,
                                error = %e,
                                "Releasing message with undecodable body"
                            );
                            if let Err(release_error) = self
                                .transport
                                .change_visibility(&queue_url, &message.receipt_handle, 0)
                                .await
                            {
                                warn!(
                                    receipt = %message.receipt_handle,
                                    error = %release_error,
                                    "Failed to release message"
                                );
                            }
                            return Err(e.into());
                        }
                    };

                    debug!(
                        queue_url = %queue_url,
                        message_id = ?message.message_id,
                        "Message popped"
                    );
                    let lease = self
                        .leases
                        .start(queue_url, message.receipt_handle, task);
                    return Ok((body, lease));
                }
                Ok(None) => {
                    consecutive_errors = 0;
                    debug!(queue_url = %queue_url, "No message available, polling again");
                }
                Err(e) if e.is_transient() => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    let delay = self.retry.backoff(consecutive_errors);
                    warn!(
                        queue_url = %queue_url,
                        error = %e,
                        attempt = consecutive_errors,
                        delay_ms = delay.as_millis() as u64,
                        "Receive failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Same as [`pop`](Self::pop), giving up once `timeout` has passed
    ///
    /// A receive cut short by the deadline may leave a message hidden until its
    /// visibility window lapses; it is then redelivered as usual.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DeadlineElapsed`] when no message arrived in time,
    /// otherwise the errors of [`pop`](Self::pop).
    pub async fn pop_with_deadline<M, F, E>(
        &self,
        task: F,
        timeout: Duration,
    ) -> Result<M, QueueError>
    where
        M: DeserializeOwned,
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        tokio::time::timeout(timeout, self.pop(task))
            .await
            .map_err(|_| QueueError::DeadlineElapsed { timeout })?
    }
}

fn non_blank(queue_url: String) -> Result<String, QueueError> {
    if queue_url.trim().is_empty() {
        return Err(ConfigurationError::Invalid {
            message: "queue_url must not be blank".to_string(),
        }
        .into());
    }
    Ok(queue_url)
}

impl<T: QueueTransport + std::fmt::Debug> std::fmt::Debug for QueueClient<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueClient")
            .field("transport", &self.transport)
            .field("leases", &self.leases)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
