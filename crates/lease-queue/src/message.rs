//! Message types for queue operations including core domain identifiers.

use crate::error::QueueError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

const FIFO_SUFFIX: &str = ".fifo";

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    ///
    /// 1-80 characters of ASCII alphanumerics, hyphens and underscores; the
    /// name may end in `.fifo`, which counts towards the length.
    pub fn new(name: String) -> Result<Self, QueueError> {
        if name.is_empty() || name.len() > 80 {
            return Err(QueueError::InvalidQueueName(format!(
                "'{}' must be 1-80 characters",
                name
            )));
        }

        let stem = name.strip_suffix(FIFO_SUFFIX).unwrap_or(&name);
        if stem.is_empty()
            || !stem
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(QueueError::InvalidQueueName(format!(
                "'{}' may only contain ASCII alphanumerics, hyphens and underscores",
                name
            )));
        }

        Ok(Self(name))
    }

    /// Check if the name designates a FIFO queue
    pub fn is_fifo(&self) -> bool {
        self.0.ends_with(FIFO_SUFFIX)
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Queue attributes passed on creation, e.g. `VisibilityTimeout` or
/// `ReceiveMessageWaitTimeSeconds`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueAttributes(BTreeMap<String, String>);

impl QueueAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace one attribute
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Attributes in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Flatten into indexed `Attribute.N.Name` / `Attribute.N.Value` pairs
    pub fn to_query_params(&self) -> Vec<(String, String)> {
        self.iter()
            .enumerate()
            .flat_map(|(idx, (name, value))| {
                [
                    (format!("Attribute.{}.Name", idx + 1), name.to_string()),
                    (format!("Attribute.{}.Value", idx + 1), value.to_string()),
                ]
            })
            .collect()
    }
}

impl<K, V> FromIterator<(K, V)> for QueueAttributes
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Opaque service token proving possession of one delivery of a message
///
/// A redelivered message carries a different handle. The handle is valid until
/// the visibility window granted with it expires or the message is deleted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Transport Payloads
// ============================================================================

/// A message returned by a receive call, body still in wire format
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub message_id: Option<String>,
    pub receipt_handle: ReceiptHandle,
    pub body: String,
}

/// Service acknowledgment of a sent message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub message_id: Option<String>,
    pub md5_of_message_body: Option<String>,
}

/// Parameters of a single receive call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveRequest {
    /// Upper bound on messages returned; the lease protocol always asks for one
    pub max_messages: u32,
    /// Invisibility window granted to the received message, in seconds
    pub visibility_timeout_secs: u32,
    /// Long-poll duration, in seconds
    pub wait_time_secs: u32,
}

impl Default for ReceiveRequest {
    fn default() -> Self {
        Self {
            max_messages: 1,
            visibility_timeout_secs: 30,
            wait_time_secs: 20,
        }
    }
}
