//! Decoding of queue service response documents.
//!
//! The service answers in JSON when asked to (`Accept: application/json`)
//! and falls back to XML for some endpoints and most error pages. Both forms
//! carry the same nested envelope:
//!
//! ```text
//! ReceiveMessageResponse
//! └── ReceiveMessageResult
//!     └── messages[]  (Message in XML)
//!         ├── MessageId
//!         ├── ReceiptHandle
//!         └── Body
//! ```
//!
//! A document starting with `<` is parsed as XML, anything else as JSON.

use crate::error::QueueError;
use crate::message::{ReceiptHandle, ReceivedMessage, SendReceipt};
use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

#[cfg(test)]
#[path = "response_tests.rs"]
mod tests;

// ============================================================================
// JSON Envelopes
// ============================================================================

#[derive(Debug, Deserialize)]
struct CreateQueueEnvelope {
    #[serde(rename = "CreateQueueResponse")]
    response: Option<CreateQueueResponse>,
}

#[derive(Debug, Deserialize)]
struct CreateQueueResponse {
    #[serde(rename = "CreateQueueResult")]
    result: Option<CreateQueueResult>,
}

#[derive(Debug, Deserialize)]
struct CreateQueueResult {
    #[serde(rename = "QueueUrl")]
    queue_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SendMessageEnvelope {
    #[serde(rename = "SendMessageResponse")]
    response: Option<SendMessageResponse>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    #[serde(rename = "SendMessageResult")]
    result: Option<SendMessageResult>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResult {
    #[serde(rename = "MessageId")]
    message_id: Option<String>,
    #[serde(rename = "MD5OfMessageBody")]
    md5_of_message_body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageEnvelope {
    #[serde(rename = "ReceiveMessageResponse")]
    response: Option<ReceiveMessageResponse>,
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageResponse {
    #[serde(rename = "ReceiveMessageResult")]
    result: Option<ReceiveMessageResult>,
}

#[derive(Debug, Deserialize)]
struct ReceiveMessageResult {
    #[serde(default, rename = "messages", alias = "Messages", alias = "Message")]
    messages: Option<Vec<WireMessage>>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(rename = "MessageId")]
    message_id: Option<String>,
    #[serde(rename = "ReceiptHandle")]
    receipt_handle: Option<String>,
    #[serde(rename = "Body")]
    body: Option<String>,
}

impl WireMessage {
    fn into_received(self) -> Result<ReceivedMessage, QueueError> {
        let receipt_handle = self
            .receipt_handle
            .ok_or_else(|| QueueError::malformed("message without ReceiptHandle"))?;
        let body = self
            .body
            .ok_or_else(|| QueueError::malformed("message without Body"))?;

        Ok(ReceivedMessage {
            message_id: self.message_id,
            receipt_handle: ReceiptHandle::new(receipt_handle),
            body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "Error")]
    error: Option<ErrorDetail>,
    #[serde(rename = "ErrorResponse")]
    error_response: Option<Box<ErrorEnvelope>>,
    #[serde(rename = "__type")]
    json_type: Option<String>,
    #[serde(alias = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(rename = "Code")]
    code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

impl ErrorEnvelope {
    fn into_code_and_message(self) -> (Option<String>, Option<String>) {
        if let Some(detail) = self.error {
            return (detail.code, detail.message);
        }
        if let Some(inner) = self.error_response {
            return inner.into_code_and_message();
        }
        // JSON protocol errors name the code as "namespace#Code"
        let code = self
            .json_type
            .map(|t| t.rsplit('#').next().unwrap_or_default().to_string());
        (code, self.message)
    }
}

// ============================================================================
// Public Parsers
// ============================================================================

fn is_xml(body: &str) -> bool {
    body.trim_start().starts_with('<')
}

/// Extract the queue URL from a CreateQueue response
pub(crate) fn parse_create_queue_response(body: &str) -> Result<String, QueueError> {
    let queue_url = if is_xml(body) {
        let nodes = xml_nodes(body)?;
        find_text(&nodes, "CreateQueueResult/QueueUrl")
    } else {
        let envelope: CreateQueueEnvelope =
            serde_json::from_str(body).map_err(QueueError::malformed)?;
        envelope
            .response
            .and_then(|r| r.result)
            .and_then(|r| r.queue_url)
    };

    queue_url.ok_or_else(|| QueueError::malformed("QueueUrl not found in response"))
}

/// Extract the acknowledgment from a SendMessage response
pub(crate) fn parse_send_message_response(body: &str) -> Result<SendReceipt, QueueError> {
    if is_xml(body) {
        let nodes = xml_nodes(body)?;
        if !nodes.iter().any(|n| n.path.ends_with("SendMessageResult")) {
            return Err(QueueError::malformed("SendMessageResult not found in response"));
        }
        return Ok(SendReceipt {
            message_id: find_text(&nodes, "SendMessageResult/MessageId"),
            md5_of_message_body: find_text(&nodes, "SendMessageResult/MD5OfMessageBody"),
        });
    }

    let envelope: SendMessageEnvelope =
        serde_json::from_str(body).map_err(QueueError::malformed)?;
    let result = envelope
        .response
        .and_then(|r| r.result)
        .ok_or_else(|| QueueError::malformed("SendMessageResult not found in response"))?;

    Ok(SendReceipt {
        message_id: result.message_id,
        md5_of_message_body: result.md5_of_message_body,
    })
}

/// Extract at most one message from a ReceiveMessage response
///
/// An absent or empty message collection means no message was available.
/// A missing envelope is malformed, and more than one message breaks the
/// single-message contract of the lease protocol.
pub(crate) fn parse_receive_message_response(
    body: &str,
) -> Result<Option<ReceivedMessage>, QueueError> {
    let messages = if is_xml(body) {
        parse_receive_xml(body)?
    } else {
        let envelope: ReceiveMessageEnvelope =
            serde_json::from_str(body).map_err(QueueError::malformed)?;
        envelope
            .response
            .and_then(|r| r.result)
            .ok_or_else(|| QueueError::malformed("ReceiveMessageResult not found in response"))?
            .messages
            .unwrap_or_default()
    };

    if messages.len() > 1 {
        return Err(QueueError::ProtocolViolation {
            message: format!("expected at most one message, received {}", messages.len()),
        });
    }

    messages
        .into_iter()
        .next()
        .map(WireMessage::into_received)
        .transpose()
}

/// Map a non-success response onto a service error
pub(crate) fn parse_error_response(body: &str, status: u16) -> QueueError {
    let (code, message) = if is_xml(body) {
        match xml_nodes(body) {
            Ok(nodes) => (
                find_text(&nodes, "Error/Code"),
                find_text(&nodes, "Error/Message"),
            ),
            Err(_) => (None, None),
        }
    } else {
        serde_json::from_str::<ErrorEnvelope>(body)
            .map(ErrorEnvelope::into_code_and_message)
            .unwrap_or((None, None))
    };

    QueueError::Service {
        status,
        code: code.unwrap_or_else(|| "Unknown".to_string()),
        message: message.unwrap_or_else(|| {
            if body.trim().is_empty() {
                format!("HTTP status {}", status)
            } else {
                body.trim().to_string()
            }
        }),
    }
}

// ============================================================================
// XML Walking
// ============================================================================

/// One element start or text run, addressed by its slash-separated path
#[derive(Debug)]
struct XmlNode {
    path: String,
    text: Option<String>,
}

fn xml_nodes(xml: &str) -> Result<Vec<XmlNode>, QueueError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<String> = Vec::new();
    let mut nodes = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                stack.push(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                nodes.push(XmlNode {
                    path: stack.join("/"),
                    text: None,
                });
            }
            Ok(Event::Empty(ref e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let path = if stack.is_empty() {
                    name
                } else {
                    format!("{}/{}", stack.join("/"), name)
                };
                nodes.push(XmlNode { path, text: None });
            }
            Ok(Event::End(_)) => {
                stack.pop();
            }
            Ok(Event::Text(e)) => {
                let text = e
                    .unescape()
                    .map_err(|e| QueueError::malformed(format!("XML parsing error: {}", e)))?;
                nodes.push(XmlNode {
                    path: stack.join("/"),
                    text: Some(text.into_owned()),
                });
            }
            Ok(Event::CData(e)) => {
                nodes.push(XmlNode {
                    path: stack.join("/"),
                    text: Some(String::from_utf8_lossy(&e.into_inner()).into_owned()),
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(QueueError::malformed(format!("XML parsing error: {}", e))),
            _ => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(QueueError::malformed("XML document ended inside an element"));
    }

    Ok(nodes)
}

fn find_text(nodes: &[XmlNode], suffix: &str) -> Option<String> {
    nodes
        .iter()
        .find(|n| n.text.is_some() && n.path.ends_with(suffix))
        .and_then(|n| n.text.clone())
}

fn parse_receive_xml(xml: &str) -> Result<Vec<WireMessage>, QueueError> {
    let nodes = xml_nodes(xml)?;
    if !nodes
        .iter()
        .any(|n| n.path.ends_with("ReceiveMessageResponse/ReceiveMessageResult"))
    {
        return Err(QueueError::malformed(
            "ReceiveMessageResult not found in response",
        ));
    }

    let mut messages: Vec<WireMessage> = Vec::new();
    for node in nodes {
        match (node.path.rsplit('/').next(), node.text) {
            (Some("Message"), None) if node.path.ends_with("ReceiveMessageResult/Message") => {
                messages.push(WireMessage::default());
            }
            (Some(field), Some(text)) if node.path.contains("ReceiveMessageResult/Message/") => {
                if let Some(current) = messages.last_mut() {
                    match field {
                        "MessageId" => current.message_id = Some(text),
                        "ReceiptHandle" => current.receipt_handle = Some(text),
                        "Body" => current.body = Some(text),
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    Ok(messages)
}
