//! Registration task: cancellation, progress reporting and single delivery
//! of the terminal outcome.

use std::sync::{Arc, Mutex};

use tokio::sync::{watch, OwnedSemaphorePermit};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::engine::RegistrationStateMachine;
use crate::error::{ProvisioningError, RegistrationFailure};
use crate::transport::ProvisioningTransport;
use crate::types::{RegistrationResult, RegistrationState};

/// Terminal outcome of one registration.
pub type RegistrationOutcome = Result<RegistrationResult, RegistrationFailure>;

/// Terminal callback; invoked exactly once per registration.
pub type RegistrationCallback = Box<dyn FnOnce(RegistrationOutcome) + Send + 'static>;

/// Progress observer; invoked on every state entered.
pub type StatusCallback = Arc<dyn Fn(RegistrationState) + Send + Sync + 'static>;

/// Cancellation flag that can also be awaited.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelSignal {
    /// Unfired signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `cancel` has been called (immediately if it already was).
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this only returns on cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Progress of one registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub state: RegistrationState,
    pub operation_id: Option<String>,
    pub polls: u32,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            state: RegistrationState::Unauthenticated,
            operation_id: None,
            polls: 0,
        }
    }
}

/// Publishes progress to the task handle and the optional status callback.
#[derive(Clone)]
pub struct StatusSink {
    tx: Arc<watch::Sender<Progress>>,
    observer: Option<StatusCallback>,
}

impl StatusSink {
    /// Sink starting at `Unauthenticated`, forwarding changes to `observer`.
    pub fn new(observer: Option<StatusCallback>) -> Self {
        let (tx, _rx) = watch::channel(Progress::default());
        Self {
            tx: Arc::new(tx),
            observer,
        }
    }

    /// Record a state transition; notifies the observer.
    pub fn enter(&self, state: RegistrationState) {
        self.tx.send_modify(|p| p.state = state);
        if let Some(observer) = &self.observer {
            observer(state);
        }
    }

    /// Record the operation id the service assigned.
    pub fn set_operation_id(&self, operation_id: &str) {
        self.tx
            .send_modify(|p| p.operation_id = Some(operation_id.to_string()));
    }

    /// Count one completed status poll.
    pub fn record_poll(&self) {
        self.tx.send_modify(|p| p.polls += 1);
    }

    /// Snapshot of the latest progress.
    pub fn current(&self) -> Progress {
        self.tx.borrow().clone()
    }

    /// Receiver that observes every progress update.
    pub fn subscribe(&self) -> watch::Receiver<Progress> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for StatusSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSink")
            .field("progress", &self.current())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

/// Hands the terminal outcome to the caller exactly once.
pub struct ResultDispatcher {
    callback: Mutex<Option<RegistrationCallback>>,
}

impl ResultDispatcher {
    /// Dispatcher that will hand exactly one outcome to `callback`.
    pub fn new(callback: RegistrationCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
        }
    }

    /// Deliver `outcome`. Returns `false` (and drops `outcome`) if a result
    /// was already delivered.
    pub fn deliver(&self, outcome: RegistrationOutcome) -> bool {
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match callback {
            Some(callback) => {
                callback(outcome);
                true
            }
            None => {
                debug!("registration outcome already delivered; dropping");
                false
            }
        }
    }

    /// Whether an outcome has been delivered.
    pub fn is_delivered(&self) -> bool {
        self.callback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

impl std::fmt::Debug for ResultDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultDispatcher")
            .field("delivered", &self.is_delivered())
            .finish()
    }
}

/// One in-flight registration.
pub struct RegistrationTask {
    cancel: CancelSignal,
    status: StatusSink,
    transport: Arc<dyn ProvisioningTransport>,
    dispatcher: Arc<ResultDispatcher>,
    handle: Option<JoinHandle<()>>,
}

impl RegistrationTask {
    /// Spawn `machine` on `runtime`. `permit` is held until the run ends.
    pub fn spawn(
        runtime: &tokio::runtime::Handle,
        machine: RegistrationStateMachine,
        dispatcher: Arc<ResultDispatcher>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        let cancel = machine.cancel_signal();
        let status = machine.status_sink();
        let transport = machine.transport();

        let task_dispatcher = Arc::clone(&dispatcher);
        let handle = runtime.spawn(async move {
            let _permit = permit;
            let outcome = machine.run().await;
            task_dispatcher.deliver(outcome);
        });

        Self {
            cancel,
            status,
            transport,
            dispatcher,
            handle: Some(handle),
        }
    }

    /// Latest progress of the running registration.
    pub fn progress(&self) -> Progress {
        self.status.current()
    }

    /// Whether the background task has completed.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Raise the cancellation flag without waiting. The task ends at its
    /// next suspension point and delivers the cancelled failure itself.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancel the registration.
    ///
    /// Closes the transport to unblock outstanding calls and delivers a
    /// cancelled failure unless the outcome was already delivered. Waits for
    /// the task to wind down.
    pub async fn cancel(&mut self) {
        self.cancel.cancel();
        self.transport.close().await;

        let progress = self.status.current();
        let failure = RegistrationFailure {
            state: RegistrationState::Error,
            last_state: progress.state,
            operation_id: progress.operation_id,
            polls: progress.polls,
            source: ProvisioningError::Cancelled,
        };
        if self.dispatcher.deliver(Err(failure)) {
            info!(last_state = %progress.state, "registration cancelled");
        }

        self.join().await;
    }

    /// Wait for the task to finish.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                debug!(error = %e, "registration task ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for RegistrationTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationTask")
            .field("progress", &self.progress())
            .field("cancelled", &self.cancel.is_cancelled())
            .field("finished", &self.is_finished())
            .finish()
    }
}
