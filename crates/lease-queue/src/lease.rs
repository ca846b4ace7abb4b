//! Visibility lease management for popped messages.
//!
//! While the caller's task runs, a [`RenewalTimer`] keeps the message hidden
//! by resetting its visibility window on a fixed period. When the task settles
//! the timer is stopped, in-flight renewals are drained and exactly one
//! terminal call is issued:
//!
//! | Task outcome        | Terminal call                  | Final state              |
//! |---------------------|--------------------------------|--------------------------|
//! | `Ok(())`            | `delete_message`               | [`LeaseState::Committed`] |
//! | `Err(_)` or a panic | `change_visibility(receipt, 0)` | [`LeaseState::Released`]  |
//!
//! The settlement runs on a detached task; [`LeaseHandle`] observes it.

use crate::config::LeaseSettings;
use crate::error::{LeaseOperation, QueueError};
use crate::message::ReceiptHandle;
use crate::transport::QueueTransport;
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

#[cfg(test)]
#[path = "lease_tests.rs"]
mod tests;

/// Lifecycle of a single lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Caller task still running, or terminal call not yet returned
    Active,
    /// Message deleted after the task succeeded
    Committed,
    /// Message made visible again after the task failed
    Released,
}

const ACTIVE: u8 = 0;
const COMMITTED: u8 = 1;
const RELEASED: u8 = 2;
// Terminal call issued but not yet returned; reported as Active
const COMMITTING: u8 = 3;
const RELEASING: u8 = 4;

impl LeaseState {
    fn from_u8(value: u8) -> Self {
        match value {
            COMMITTED => Self::Committed,
            RELEASED => Self::Released,
            _ => Self::Active,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Active => ACTIVE,
            Self::Committed => COMMITTED,
            Self::Released => RELEASED,
        }
    }
}

// ============================================================================
// Renewal Timer
// ============================================================================

/// Periodic visibility renewal for one receipt
///
/// The first renewal fires one period after start. Each renewal runs as its
/// own task, so a slow call never delays the next tick. Dropping the timer
/// without calling [`stop`](Self::stop) also ends it, without waiting.
pub struct RenewalTimer {
    stop_signal: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RenewalTimer {
    /// Start renewing `receipt` on the settings' period
    pub fn start<T: QueueTransport>(
        transport: Arc<T>,
        queue_url: String,
        receipt: ReceiptHandle,
        settings: LeaseSettings,
    ) -> Self {
        let (stop_signal, stop_requested) = watch::channel(false);
        let task = tokio::spawn(run_renewals(
            transport,
            queue_url,
            receipt,
            settings,
            stop_requested,
        ));

        Self {
            stop_signal,
            task: Mutex::new(Some(task)),
        }
    }

    /// Stop the timer and wait for in-flight renewals to finish
    ///
    /// Safe to call more than once; later calls return immediately.
    pub async fn stop(&self) {
        self.stop_signal.send_replace(true);

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Renewal timer task ended abnormally");
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_signal.borrow()
    }
}

impl std::fmt::Debug for RenewalTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenewalTimer")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn run_renewals<T: QueueTransport>(
    transport: Arc<T>,
    queue_url: String,
    receipt: ReceiptHandle,
    settings: LeaseSettings,
    mut stop_requested: watch::Receiver<bool>,
) {
    let period = settings.renewal_interval();
    let mut ticks = interval_at(Instant::now() + period, period);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut renewals = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            // Only `true` is ever sent; a dropped sender also stops the timer
            _ = stop_requested.changed() => break,

            _ = ticks.tick() => {
                let transport = Arc::clone(&transport);
                let queue_url = queue_url.clone();
                let receipt = receipt.clone();
                let visibility = settings.visibility_timeout_secs;

                renewals.spawn(async move {
                    match transport
                        .change_visibility(&queue_url, &receipt, visibility)
                        .await
                    {
                        Ok(()) => debug!(
                            receipt = %receipt,
                            visibility_timeout_secs = visibility,
                            "Renewed message visibility"
                        ),
                        Err(e) => warn!(
                            receipt = %receipt,
                            error = %e,
                            "Failed to renew message visibility"
                        ),
                    }
                });
            }

            Some(_) = renewals.join_next(), if !renewals.is_empty() => {}
        }
    }

    while renewals.join_next().await.is_some() {}
}

// ============================================================================
// Lease Manager
// ============================================================================

/// Starts and settles visibility leases against one transport
pub struct LeaseManager<T: QueueTransport> {
    transport: Arc<T>,
    settings: LeaseSettings,
}

impl<T: QueueTransport> Clone for LeaseManager<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            settings: self.settings,
        }
    }
}

impl<T: QueueTransport> LeaseManager<T> {
    pub fn new(transport: Arc<T>, settings: LeaseSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    /// Hold the lease on `receipt` until `task` settles
    ///
    /// Returns immediately. The task runs on its own tokio task; a panic inside
    /// it is treated as failure.
    pub fn start<F, E>(&self, queue_url: String, receipt: ReceiptHandle, task: F) -> LeaseHandle
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        debug!(receipt = %receipt, "Starting visibility lease");

        let timer = RenewalTimer::start(
            Arc::clone(&self.transport),
            queue_url.clone(),
            receipt.clone(),
            self.settings,
        );
        let state = Arc::new(AtomicU8::new(LeaseState::Active.as_u8()));
        let caller = tokio::spawn(task);

        let settlement = tokio::spawn(settle(
            Arc::clone(&self.transport),
            queue_url,
            receipt.clone(),
            timer,
            caller,
            Arc::clone(&state),
        ));

        LeaseHandle {
            receipt,
            state,
            settlement,
        }
    }
}

impl<T: QueueTransport> std::fmt::Debug for LeaseManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("settings", &self.settings)
            .finish()
    }
}

async fn settle<T, E>(
    transport: Arc<T>,
    queue_url: String,
    receipt: ReceiptHandle,
    timer: RenewalTimer,
    caller: JoinHandle<Result<(), E>>,
    state: Arc<AtomicU8>,
) -> Result<LeaseState, QueueError>
where
    T: QueueTransport,
    E: Display + Send + 'static,
{
    let outcome = match caller.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) if e.is_panic() => Err("task panicked".to_string()),
        Err(e) => Err(format!("task did not complete: {}", e)),
    };

    timer.stop().await;

    let (operation, final_state, pending) = match &outcome {
        Ok(()) => (LeaseOperation::Commit, LeaseState::Committed, COMMITTING),
        Err(reason) => {
            debug!(receipt = %receipt, reason = %reason, "Task failed, releasing message");
            (LeaseOperation::Release, LeaseState::Released, RELEASING)
        }
    };

    state.store(pending, Ordering::Release);
    let result = match operation {
        LeaseOperation::Commit => transport.delete_message(&queue_url, &receipt).await,
        LeaseOperation::Release => transport.change_visibility(&queue_url, &receipt, 0).await,
    };

    match result {
        Ok(()) => {
            state.store(final_state.as_u8(), Ordering::Release);
            debug!(receipt = %receipt, state = ?final_state, "Lease settled");
            Ok(final_state)
        }
        Err(e) => {
            error!(
                receipt = %receipt,
                operation = %operation,
                error = %e,
                "Terminal lease call failed"
            );
            Err(QueueError::LeaseCallbackFailure {
                operation,
                receipt: receipt.to_string(),
                message: e.to_string(),
            })
        }
    }
}

// ============================================================================
// Lease Handle
// ============================================================================

/// Observer of one lease's settlement
///
/// Dropping the handle does not affect the lease.
#[derive(Debug)]
pub struct LeaseHandle {
    receipt: ReceiptHandle,
    state: Arc<AtomicU8>,
    settlement: JoinHandle<Result<LeaseState, QueueError>>,
}

impl LeaseHandle {
    pub fn receipt(&self) -> &ReceiptHandle {
        &self.receipt
    }

    /// Current state; leaves `Active` once the terminal call has returned
    pub fn state(&self) -> LeaseState {
        LeaseState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.is_finished()
    }

    /// Wait for the terminal call and report its outcome
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::LeaseCallbackFailure`] when the delete or release
    /// call failed, or when the settlement task itself died. In the latter
    /// case the operation is the terminal call that was under way; a task that
    /// died before issuing one is reported as a release, since the message
    /// returns to the queue once its visibility window lapses.
    pub async fn settled(self) -> Result<LeaseState, QueueError> {
        match self.settlement.await {
            Ok(result) => result,
            Err(e) => {
                let (operation, message) = match self.state.load(Ordering::Acquire) {
                    COMMITTING | COMMITTED => (
                        LeaseOperation::Commit,
                        format!("settlement task did not complete: {}", e),
                    ),
                    RELEASING | RELEASED => (
                        LeaseOperation::Release,
                        format!("settlement task did not complete: {}", e),
                    ),
                    _ => (
                        LeaseOperation::Release,
                        format!(
                            "settlement task ended before the terminal call, \
                             message reappears after its visibility window: {}",
                            e
                        ),
                    ),
                };
                Err(QueueError::LeaseCallbackFailure {
                    operation,
                    receipt: self.receipt.to_string(),
                    message,
                })
            }
        }
    }
}
