//! Public provisioning client.
//!
//! Owns the identity, configuration and attestation provider of one device
//! and runs at most one registration at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info};

use crate::attestation::AttestationProvider;
use crate::config::ProvisioningConfig;
use crate::engine::RegistrationStateMachine;
use crate::error::{ProvisioningError, ProvisioningResult, RegistrationFailure};
use crate::request::RequestBuilder;
use crate::task::{
    Progress, RegistrationOutcome, RegistrationTask, ResultDispatcher, StatusCallback, StatusSink,
};
use crate::transport::{
    ProvisioningTransport, TransportFactory, TransportRegistry, TransportSettings,
};
use crate::types::{RegistrationIdentity, RegistrationResult, RegistrationState, TransportProtocol};

/// Device provisioning client.
pub struct ProvisioningDeviceClient {
    identity: RegistrationIdentity,
    builder: RequestBuilder,
    config: ProvisioningConfig,
    provider: AttestationProvider,
    transports: TransportRegistry,
    payload: Option<serde_json::Value>,
    status_callback: Option<StatusCallback>,
    slot: Arc<Semaphore>,
    task: Mutex<Option<RegistrationTask>>,
    closed: AtomicBool,
}

impl ProvisioningDeviceClient {
    /// Client for `endpoint` with default configuration.
    pub fn create(
        endpoint: &str,
        id_scope: &str,
        protocol: TransportProtocol,
        provider: AttestationProvider,
    ) -> ProvisioningResult<Self> {
        Self::with_config(
            ProvisioningConfig::default().with_global_endpoint(endpoint),
            id_scope,
            protocol,
            provider,
        )
    }

    /// Like [`Self::create`], with explicit configuration.
    pub fn with_config(
        config: ProvisioningConfig,
        id_scope: &str,
        protocol: TransportProtocol,
        provider: AttestationProvider,
    ) -> ProvisioningResult<Self> {
        config.validate()?;
        let builder = RequestBuilder::new(&config.global_endpoint, id_scope, &config.api_version)?;
        let registration_id = provider.registration_id()?;

        let identity = RegistrationIdentity {
            id_scope: builder.id_scope().to_string(),
            registration_id,
            attestation_type: provider.attestation_type(),
            protocol,
        };

        Ok(Self {
            identity,
            builder,
            config,
            provider,
            transports: TransportRegistry::default(),
            payload: None,
            status_callback: None,
            slot: Arc::new(Semaphore::new(1)),
            task: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Custom JSON payload sent with every registration request.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Observer invoked on every state a registration enters.
    pub fn with_status_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(RegistrationState) + Send + Sync + 'static,
    {
        self.status_callback = Some(Arc::new(callback));
        self
    }

    /// Use `transport` for this client's protocol.
    pub fn with_transport(mut self, transport: Arc<dyn ProvisioningTransport>) -> Self {
        self.transports
            .register_instance(self.identity.protocol, transport);
        self
    }

    /// Register a transport factory for `protocol`.
    pub fn with_transport_factory(
        mut self,
        protocol: TransportProtocol,
        factory: TransportFactory,
    ) -> Self {
        self.transports.register(protocol, factory);
        self
    }

    /// Scope and endpoint this client registers against.
    pub fn identity(&self) -> &RegistrationIdentity {
        &self.identity
    }

    /// Effective configuration.
    pub fn config(&self) -> &ProvisioningConfig {
        &self.config
    }

    /// Start a registration in the background.
    ///
    /// `callback` is invoked exactly once with the terminal outcome. When
    /// this returns an error the registration was not started and `callback`
    /// is never invoked. Must be called within a tokio runtime.
    pub fn register_device<F>(&self, callback: F) -> ProvisioningResult<()>
    where
        F: FnOnce(RegistrationOutcome) + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProvisioningError::ClientClosed);
        }

        let permit = Arc::clone(&self.slot)
            .try_acquire_owned()
            .map_err(|_| ProvisioningError::RegistrationInProgress)?;

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ProvisioningError::invalid("register_device must be called within a tokio runtime")
        })?;

        let settings = TransportSettings {
            builder: self.builder.clone(),
            config: self.config.clone(),
        };
        let transport = self.transports.create(self.identity.protocol, &settings)?;

        let machine = RegistrationStateMachine::new(
            self.builder.clone(),
            self.provider.clone(),
            transport,
            &self.config,
        )
        .with_payload(self.payload.clone())
        .with_status_sink(StatusSink::new(self.status_callback.clone()));

        info!(
            registration_id = %self.identity.registration_id,
            id_scope = %self.identity.id_scope,
            attestation = %self.identity.attestation_type,
            protocol = %self.identity.protocol,
            "starting device registration"
        );

        let dispatcher = Arc::new(ResultDispatcher::new(Box::new(callback)));
        let task = RegistrationTask::spawn(&runtime, machine, dispatcher, Some(permit));
        *self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
        Ok(())
    }

    /// Register and wait for the terminal outcome.
    pub async fn register_device_async(&self) -> Result<RegistrationResult, RegistrationFailure> {
        let (tx, rx) = oneshot::channel();
        self.register_device(move |outcome| {
            let _ = tx.send(outcome);
        })?;

        rx.await
            .unwrap_or_else(|_| Err(RegistrationFailure::from(ProvisioningError::Cancelled)))
    }

    /// Whether a registration is in flight.
    pub fn is_registering(&self) -> bool {
        self.slot.available_permits() == 0
    }

    /// Progress of the current or last registration.
    pub fn progress(&self) -> Option<Progress> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(RegistrationTask::progress)
    }

    /// Cancel the in-flight registration, if any. The client stays usable.
    pub async fn cancel_registration(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut task) = task {
            task.cancel().await;
        }
    }

    /// Cancel any in-flight registration and refuse new ones.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(registration_id = %self.identity.registration_id, "closing provisioning client");
        self.cancel_registration().await;
    }
}

impl Drop for ProvisioningDeviceClient {
    fn drop(&mut self) {
        let task = self
            .task
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(task) = task.as_ref() {
            if !task.is_finished() {
                task.request_cancel();
            }
        }
    }
}

impl std::fmt::Debug for ProvisioningDeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningDeviceClient")
            .field("identity", &self.identity)
            .field("builder", &self.builder)
            .field("transports", &self.transports)
            .field("registering", &self.is_registering())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
