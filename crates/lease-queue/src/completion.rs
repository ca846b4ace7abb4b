//! One-shot completion signal usable as a pop task.
//!
//! ```no_run
//! # async fn example(client: lease_queue::QueueClient<lease_queue::InMemoryTransport>) -> Result<(), lease_queue::QueueError> {
//! let (done, task) = lease_queue::completion();
//! let job: String = client.pop(task).await?;
//!
//! // ... process the job while the lease is renewed ...
//! done.succeed();
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

#[cfg(test)]
#[path = "completion_tests.rs"]
mod tests;

/// Why a [`Completion`] resolved with an error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompletionError {
    #[error("processing failed: {0}")]
    Failed(String),

    #[error("completion handle dropped before settling")]
    Abandoned,
}

/// Create a linked handle and future
///
/// The future resolves once the handle is settled or dropped.
pub fn completion() -> (CompletionHandle, Completion) {
    let (sender, receiver) = oneshot::channel();
    (CompletionHandle { sender }, Completion { receiver })
}

/// Settles the paired [`Completion`]
#[derive(Debug)]
pub struct CompletionHandle {
    sender: oneshot::Sender<Result<(), String>>,
}

impl CompletionHandle {
    pub fn succeed(self) {
        // Receiver gone means the lease was already torn down
        let _ = self.sender.send(Ok(()));
    }

    pub fn fail(self, reason: impl Into<String>) {
        let _ = self.sender.send(Err(reason.into()));
    }
}

/// Future side of [`completion`]
#[derive(Debug)]
pub struct Completion {
    receiver: oneshot::Receiver<Result<(), String>>,
}

impl Future for Completion {
    type Output = Result<(), CompletionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx).map(|received| match received {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(CompletionError::Failed(reason)),
            Err(_) => Err(CompletionError::Abandoned),
        })
    }
}
