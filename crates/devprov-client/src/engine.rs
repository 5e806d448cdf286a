//! Registration state machine.
//!
//! Drives one registration from `Unauthenticated` to a terminal state:
//!
//! ```text
//! UNAUTHENTICATED -> READY_TO_AUTHENTICATE -> AUTHENTICATED -> ASSIGNING -> ASSIGNED
//!                                                                        \-> FAILED | DISABLED
//! any state -> ERROR
//! ```
//!
//! TPM registrations take an extra challenge round-trip inside
//! `READY_TO_AUTHENTICATE`. Every transport and attestation call runs under a
//! per-call timeout, is retried with backoff while the error is transient, and
//! races the cancellation signal.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use tracing::{debug, info, warn};

use crate::attestation::{AttestationError, AttestationProvider, TpmDevice};
use crate::config::ProvisioningConfig;
use crate::error::{
    Phase, ProvisioningError, ProvisioningResult, RegistrationFailure, TransportError,
};
use crate::request::{registration_body, RequestBuilder};
use crate::retry::RetryPolicy;
use crate::sas;
use crate::task::{CancelSignal, RegistrationOutcome, StatusSink};
use crate::transport::{ProvisioningTransport, TransportResponse};
use crate::types::{
    RegistrationOperationStatus, RegistrationResult, RegistrationState, RequestData,
    ServiceStatus, TpmChallenge,
};

/// Credential activations allowed per registration.
const MAX_TPM_ACTIVATIONS: u32 = 2;

/// One registration attempt.
pub struct RegistrationStateMachine {
    builder: RequestBuilder,
    provider: AttestationProvider,
    transport: Arc<dyn ProvisioningTransport>,
    policy: RetryPolicy,
    call_timeout: Duration,
    sas_ttl_secs: u64,
    payload: Option<serde_json::Value>,
    cancel: CancelSignal,
    status: StatusSink,
    state: RegistrationState,
}

impl RegistrationStateMachine {
    /// Machine in `Unauthenticated` with policy and timeouts taken from `config`.
    pub fn new(
        builder: RequestBuilder,
        provider: AttestationProvider,
        transport: Arc<dyn ProvisioningTransport>,
        config: &ProvisioningConfig,
    ) -> Self {
        Self {
            builder,
            provider,
            transport,
            policy: RetryPolicy::from_config(config),
            call_timeout: config.request_timeout(),
            sas_ttl_secs: config.sas_token_ttl_secs,
            payload: None,
            cancel: CancelSignal::new(),
            status: StatusSink::new(None),
            state: RegistrationState::Unauthenticated,
        }
    }

    /// Override the retry policy derived from config.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Share a cancellation signal with the owner of the machine.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Publish progress through `status`.
    pub fn with_status_sink(mut self, status: StatusSink) -> Self {
        self.status = status;
        self
    }

    /// Custom JSON payload sent with the registration request.
    pub fn with_payload(mut self, payload: Option<serde_json::Value>) -> Self {
        self.payload = payload;
        self
    }

    /// Handle that cancels this machine.
    pub fn cancel_signal(&self) -> CancelSignal {
        self.cancel.clone()
    }

    /// Progress sink this machine publishes to.
    pub fn status_sink(&self) -> StatusSink {
        self.status.clone()
    }

    /// Transport the machine talks through.
    pub fn transport(&self) -> Arc<dyn ProvisioningTransport> {
        Arc::clone(&self.transport)
    }

    /// Run to a terminal state. Always closes the transport.
    pub async fn run(mut self) -> RegistrationOutcome {
        let outcome = self.drive().await;
        self.transport.close().await;

        match outcome {
            Ok(result) => {
                info!(
                    device_id = %result.device_id,
                    iothub_uri = %result.iothub_uri,
                    "device registration assigned"
                );
                Ok(result)
            }
            Err(source) => {
                let last_state = self.state;
                let terminal = match source {
                    ProvisioningError::RegistrationFailed { .. } => RegistrationState::Failed,
                    ProvisioningError::DeviceDisabled { .. } => RegistrationState::Disabled,
                    _ => RegistrationState::Error,
                };
                self.state = terminal;
                self.status.enter(terminal);

                let progress = self.status.current();
                info!(
                    state = %terminal,
                    last_state = %last_state,
                    error = %source,
                    "device registration ended"
                );
                Err(RegistrationFailure {
                    state: terminal,
                    last_state,
                    operation_id: progress.operation_id,
                    polls: progress.polls,
                    source,
                })
            }
        }
    }

    async fn drive(&mut self) -> ProvisioningResult<RegistrationResult> {
        self.enter(RegistrationState::Unauthenticated)?;

        let provider = &self.provider;
        let registration_id = self
            .retrying(Phase::Authenticate, || {
                attest(async move { provider.registration_id() })
            })
            .await?;
        let tls = self
            .retrying(Phase::Authenticate, || {
                attest(async move { provider.tls_context() })
            })
            .await?;
        let mut request = RequestData::new(registration_id, tls);
        request.payload = self.payload.clone();

        let tpm = match &self.provider {
            AttestationProvider::Tpm(device) => Some(Arc::clone(device)),
            _ => None,
        };
        if let Some(device) = &tpm {
            let ek = self
                .retrying(Phase::Authenticate, || {
                    attest(async move { device.endorsement_key() })
                })
                .await?;
            let srk = self
                .retrying(Phase::Authenticate, || {
                    attest(async move { device.storage_root_key() })
                })
                .await?;
            request.endorsement_key = Some(ek);
            request.storage_root_key = Some(srk);
        }
        let resource = self.builder.encoded_sas_resource(&request.registration_id)?;

        self.transport
            .open(&request)
            .await
            .map_err(|e| ProvisioningError::from_transport(e, Phase::Authenticate))?;

        self.enter(RegistrationState::ReadyToAuthenticate)?;

        let response = match tpm {
            Some(device) => {
                self.authenticate_tpm(device.as_ref(), &mut request, &resource)
                    .await?
            }
            None => {
                request.sas_token = self.sas_header(&resource).await?;
                let body = registration_body(&request)?;
                let req = &request;
                self.retrying(Phase::Authenticate, || {
                    classify(
                        Phase::Authenticate,
                        self.transport.authenticate(req, &body),
                    )
                })
                .await?
            }
        };

        self.enter(RegistrationState::Authenticated)?;

        let registration = RegistrationOperationStatus::from_slice(&response.body)?;
        let status = registration.service_status()?;
        if !status.is_pending() {
            debug!(status = ?status, "registration completed without polling");
            return self.finish(&request, registration, status);
        }

        let operation_id = registration
            .operation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| ProvisioningError::malformed("registration response has no operationId"))?;
        self.status.set_operation_id(&operation_id);
        request.operation_id = Some(operation_id);

        self.enter(RegistrationState::Assigning)?;
        self.poll(&request, response.retry_after).await
    }

    /// Challenge, activate, then authenticate with a signed token.
    async fn authenticate_tpm(
        &self,
        device: &dyn TpmDevice,
        request: &mut RequestData,
        resource: &str,
    ) -> ProvisioningResult<TransportResponse> {
        let mut activations = 0;
        loop {
            request.sas_token = None;
            let body = registration_body(request)?;
            let req: &RequestData = request;
            let response = self
                .retrying(Phase::Challenge, || {
                    classify(Phase::Challenge, self.transport.request_challenge(req, &body))
                })
                .await?;

            let challenge: TpmChallenge = serde_json::from_slice(&response.body)
                .map_err(|e| ProvisioningError::malformed(format!("invalid TPM challenge: {}", e)))?;
            let blob = base64::engine::general_purpose::STANDARD
                .decode(challenge.authentication_key.trim())
                .map_err(|e| {
                    ProvisioningError::malformed(format!("TPM challenge is not valid Base64: {}", e))
                })?;

            self.retrying(Phase::Challenge, || attest(device.decrypt_and_store_key(&blob)))
                .await?;
            activations += 1;
            debug!(activations, "TPM credential activated");

            request.sas_token = self.sas_header(resource).await?;
            let body = registration_body(request)?;
            let req: &RequestData = request;
            let result = self
                .retrying(Phase::Authenticate, || {
                    classify(
                        Phase::Authenticate,
                        self.transport.authenticate(req, &body),
                    )
                })
                .await;

            match result {
                Err(ProvisioningError::AttestationRejected { .. })
                    if activations < MAX_TPM_ACTIVATIONS =>
                {
                    warn!(activations, "TPM proof rejected; repeating credential activation");
                }
                other => return other,
            }
        }
    }

    async fn poll(
        &mut self,
        request: &RequestData,
        first_hint: Option<Duration>,
    ) -> ProvisioningResult<RegistrationResult> {
        let mut backoff = self.policy.poll_backoff();
        let mut hint = first_hint;
        let mut polls = 0u32;

        loop {
            if polls >= self.policy.max_poll_attempts() {
                return Err(ProvisioningError::Timeout {
                    message: format!("registration still assigning after {} polls", polls),
                });
            }

            let delay = backoff.next(hint);
            debug!(
                operation_id = ?request.operation_id,
                poll = polls + 1,
                delay_ms = delay.as_millis() as u64,
                "waiting before status poll"
            );
            self.sleep(delay).await?;

            let response = self
                .retrying(Phase::Poll, || {
                    classify(Phase::Poll, self.transport.registration_status(request))
                })
                .await?;
            polls += 1;
            self.status.record_poll();

            let registration = RegistrationOperationStatus::from_slice(&response.body)?;
            let status = registration.service_status()?;
            if status.is_pending() {
                hint = response.retry_after;
                continue;
            }
            return self.finish(request, registration, status);
        }
    }

    fn finish(
        &mut self,
        request: &RequestData,
        registration: RegistrationOperationStatus,
        status: ServiceStatus,
    ) -> ProvisioningResult<RegistrationResult> {
        match status {
            ServiceStatus::Assigned => {
                let iothub_uri = non_empty(registration.assigned_hub()).ok_or_else(|| {
                    ProvisioningError::malformed("assigned registration has no assignedHub")
                })?;
                let device_id = non_empty(registration.device_id()).ok_or_else(|| {
                    ProvisioningError::malformed("assigned registration has no deviceId")
                })?;
                self.enter(RegistrationState::Assigned)?;

                let state = registration.registration_state.unwrap_or_default();
                Ok(RegistrationResult {
                    iothub_uri,
                    device_id,
                    state: RegistrationState::Assigned,
                    registration_id: state
                        .registration_id
                        .or_else(|| Some(request.registration_id.clone())),
                    operation_id: registration
                        .operation_id
                        .or_else(|| request.operation_id.clone()),
                    substatus: state.substatus,
                    payload: state.payload,
                })
            }
            ServiceStatus::Failed => Err(ProvisioningError::RegistrationFailed {
                reason: registration.failure_reason(),
                error_code: registration.error_code(),
            }),
            ServiceStatus::Disabled => Err(ProvisioningError::DeviceDisabled {
                reason: registration.failure_reason(),
            }),
            ServiceStatus::Unassigned | ServiceStatus::Assigning => Err(
                ProvisioningError::malformed("registration is still pending"),
            ),
        }
    }

    /// SAS `Authorization` value, or `None` when proof travels over TLS.
    async fn sas_header(&self, resource: &str) -> ProvisioningResult<Option<String>> {
        let ttl = self.sas_ttl_secs;
        let token = self
            .retrying(Phase::Authenticate, || {
                sas::sign_token(&self.provider, resource, ttl)
            })
            .await?;
        Ok(token.map(|t| t.to_header()))
    }

    fn enter(&mut self, next: RegistrationState) -> ProvisioningResult<()> {
        if self.cancel.is_cancelled() {
            return Err(ProvisioningError::Cancelled);
        }
        debug_assert!(next >= self.state, "state moved backwards");
        if next != self.state {
            info!(from = %self.state, to = %next, "registration state changed");
        }
        self.state = next;
        self.status.enter(next);
        Ok(())
    }

    /// Run `op` until it succeeds, fails permanently, runs out of retries
    /// or is cancelled.
    async fn retrying<T, F, Fut>(&self, phase: Phase, mut op: F) -> ProvisioningResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ProvisioningResult<T>>,
    {
        let mut retries = 0u32;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ProvisioningError::Cancelled);
            }

            let result = tokio::select! {
                outcome = tokio::time::timeout(self.call_timeout, op()) => match outcome {
                    Ok(result) => result,
                    Err(_) => Err(ProvisioningError::Timeout {
                        message: format!(
                            "{} call did not complete within {}ms",
                            phase,
                            self.call_timeout.as_millis()
                        ),
                    }),
                },
                _ = self.cancel.cancelled() => Err(ProvisioningError::Cancelled),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(e) if self.policy.should_retry(&e, retries) => {
                    retries += 1;
                    let backoff = self.policy.next_delay(retries, e.retry_after());
                    warn!(
                        error = %e,
                        phase = %phase,
                        retry = retries,
                        max_retries = self.policy.max_retries(),
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying provisioning call"
                    );
                    self.sleep(backoff).await?;
                }
                Err(e) => {
                    if e.is_retryable() {
                        warn!(error = %e, phase = %phase, retries, "retry budget exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn sleep(&self, delay: Duration) -> ProvisioningResult<()> {
        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = self.cancel.cancelled() => Err(ProvisioningError::Cancelled),
        }
    }
}

impl std::fmt::Debug for RegistrationStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationStateMachine")
            .field("builder", &self.builder)
            .field("provider", &self.provider)
            .field("protocol", &self.transport.protocol())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

async fn classify<T>(
    phase: Phase,
    call: impl Future<Output = Result<T, TransportError>>,
) -> ProvisioningResult<T> {
    call.await
        .map_err(|e| ProvisioningError::from_transport(e, phase))
}

async fn attest<T>(call: impl Future<Output = Result<T, AttestationError>>) -> ProvisioningResult<T> {
    Ok(call.await?)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}
