//! Queue transport: the six primitive queue operations.
//!
//! [`QueueTransport`] is the seam between the lease protocol and the wire.
//! [`HttpQueueTransport`] implements it with signed GET requests against the
//! queue service's query API; [`InMemoryTransport`](crate::InMemoryTransport)
//! implements it in process.
//!
//! ## Request Shape
//!
//! Every request carries the common parameters below, followed by the
//! action-specific ones and finally the computed `Signature`:
//!
//! | Parameter          | Value                         |
//! |--------------------|-------------------------------|
//! | `Action`           | e.g. `ReceiveMessage`         |
//! | `AWSAccessKeyId`   | configured key id             |
//! | `Version`          | `2012-11-05`                  |
//! | `Timestamp`        | ISO-8601 UTC, milliseconds    |
//! | `SignatureVersion` | `2`                           |
//! | `SignatureMethod`  | `HmacSHA256`                  |

use crate::config::ClientConfig;
use crate::error::{ConfigurationError, QueueError};
use crate::message::{
    QueueAttributes, QueueName, ReceiptHandle, ReceiveRequest, ReceivedMessage, SendReceipt,
};
use crate::response::{
    parse_create_queue_response, parse_error_response, parse_receive_message_response,
    parse_send_message_response,
};
use crate::signer::{canonical_query, RequestSigner, SIGNATURE_METHOD, SIGNATURE_VERSION};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::header::ACCEPT;
use reqwest::Client as HttpClient;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;

/// API version sent with every request
pub const API_VERSION: &str = "2012-11-05";

/// Primitive operations of a visibility-timeout queue service
#[async_trait]
pub trait QueueTransport: Send + Sync + 'static {
    /// Create a queue and return its URL
    async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError>;

    /// Delete a queue and everything in it
    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError>;

    /// Send an already encoded body with no delivery delay
    async fn send_message(&self, queue_url: &str, body: &str) -> Result<SendReceipt, QueueError>;

    /// Long-poll for at most one message
    ///
    /// `Ok(None)` when nothing arrived within the wait time.
    async fn receive_message(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Option<ReceivedMessage>, QueueError>;

    /// Set the remaining invisibility window of one delivery
    ///
    /// The value replaces the current window rather than extending it; zero
    /// makes the message visible to other consumers immediately.
    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        timeout_secs: u32,
    ) -> Result<(), QueueError>;

    /// Permanently remove one delivery from the queue
    async fn delete_message(&self, queue_url: &str, receipt: &ReceiptHandle)
        -> Result<(), QueueError>;
}

// ============================================================================
// HTTP Transport
// ============================================================================

/// Transport issuing signed GET requests against the queue service
pub struct HttpQueueTransport {
    http_client: HttpClient,
    signer: RequestSigner,
    access_key_id: String,
    endpoint: Url,
}

impl HttpQueueTransport {
    /// Create new HTTP transport
    ///
    /// # Errors
    ///
    /// Returns a configuration error when credentials or region are missing
    /// or a URL does not parse, and a connection error when the HTTP client
    /// cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self, QueueError> {
        config.validate()?;

        let endpoint = config.endpoint_url()?;
        let access_key_id = config.access_key_id.clone().unwrap_or_default();
        let secret_access_key = config.secret_access_key.clone().unwrap_or_default();

        let http_client = HttpClient::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            signer: RequestSigner::new(secret_access_key),
            access_key_id,
            endpoint,
        })
    }

    /// Build the fully signed request URL for one action
    fn signed_url(
        &self,
        target: &Url,
        action: &str,
        action_params: Vec<(String, String)>,
        timestamp: DateTime<Utc>,
    ) -> Url {
        let mut params = HashMap::new();
        params.insert("Action".to_string(), action.to_string());
        params.insert("AWSAccessKeyId".to_string(), self.access_key_id.clone());
        params.insert("Version".to_string(), API_VERSION.to_string());
        params.insert(
            "Timestamp".to_string(),
            timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        params.insert(
            "SignatureVersion".to_string(),
            SIGNATURE_VERSION.to_string(),
        );
        params.insert("SignatureMethod".to_string(), SIGNATURE_METHOD.to_string());
        params.extend(action_params);

        let signature = self.signer.sign("GET", target, &params);
        params.insert("Signature".to_string(), signature);

        let mut url = target.clone();
        url.set_query(Some(&canonical_query(&params)));
        url
    }

    /// Make a signed GET request and return the body of a successful response
    async fn get(
        &self,
        target: &str,
        action: &str,
        action_params: Vec<(String, String)>,
    ) -> Result<String, QueueError> {
        let target = Url::parse(target).map_err(|e| ConfigurationError::Invalid {
            message: format!("queue URL '{}' is not valid: {}", target, e),
        })?;
        let url = self.signed_url(&target, action, action_params, Utc::now());

        debug!(action = action, target = %target, "Sending queue request");

        let response = self
            .http_client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    QueueError::ConnectionFailed {
                        message: format!("Request timeout: {}", e),
                    }
                } else if e.is_connect() {
                    QueueError::ConnectionFailed {
                        message: format!("Connection failed: {}", e),
                    }
                } else {
                    QueueError::ConnectionFailed {
                        message: format!("HTTP request failed: {}", e),
                    }
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to read response body: {}", e),
            })?;

        debug!(action = action, status = status.as_u16(), "Queue request completed");

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }

        Ok(body)
    }
}

impl fmt::Debug for HttpQueueTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpQueueTransport")
            .field("access_key_id", &self.access_key_id)
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}

#[async_trait]
impl QueueTransport for HttpQueueTransport {
    async fn create_queue(
        &self,
        name: &QueueName,
        attributes: &QueueAttributes,
    ) -> Result<String, QueueError> {
        let mut params = vec![("QueueName".to_string(), name.as_str().to_string())];
        params.extend(attributes.to_query_params());

        let body = self.get(self.endpoint.as_str(), "CreateQueue", params).await?;
        parse_create_queue_response(&body)
    }

    async fn delete_queue(&self, queue_url: &str) -> Result<(), QueueError> {
        self.get(queue_url, "DeleteQueue", Vec::new()).await?;
        Ok(())
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> Result<SendReceipt, QueueError> {
        let params = vec![
            ("MessageBody".to_string(), body.to_string()),
            ("DelaySeconds".to_string(), "0".to_string()),
        ];

        let response = self.get(queue_url, "SendMessage", params).await?;
        parse_send_message_response(&response)
    }

    async fn receive_message(
        &self,
        queue_url: &str,
        request: &ReceiveRequest,
    ) -> Result<Option<ReceivedMessage>, QueueError> {
        let params = vec![
            (
                "MaxNumberOfMessages".to_string(),
                request.max_messages.to_string(),
            ),
            (
                "VisibilityTimeout".to_string(),
                request.visibility_timeout_secs.to_string(),
            ),
            (
                "WaitTimeSeconds".to_string(),
                request.wait_time_secs.to_string(),
            ),
        ];

        let response = self.get(queue_url, "ReceiveMessage", params).await?;
        parse_receive_message_response(&response)
    }

    async fn change_visibility(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
        timeout_secs: u32,
    ) -> Result<(), QueueError> {
        let params = vec![
            ("ReceiptHandle".to_string(), receipt.as_str().to_string()),
            ("VisibilityTimeout".to_string(), timeout_secs.to_string()),
        ];

        self.get(queue_url, "ChangeMessageVisibility", params).await?;
        Ok(())
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt: &ReceiptHandle,
    ) -> Result<(), QueueError> {
        let params = vec![("ReceiptHandle".to_string(), receipt.as_str().to_string())];

        self.get(queue_url, "DeleteMessage", params).await?;
        Ok(())
    }
}
