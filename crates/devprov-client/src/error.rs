//! Error types for the provisioning client.
//!
//! Three layers:
//!
//! - [`TransportError`]: raw failures reported by a transport. Never handed to
//!   the caller.
//! - [`ProvisioningError`]: the classified taxonomy the engine retries on or
//!   surfaces.
//! - [`RegistrationFailure`]: the terminal error delivered through the
//!   registration callback, carrying the state reached and partial progress.

use std::time::Duration;

use crate::types::{RegistrationState, ServiceErrorBody};

/// Provisioning errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    /// Transport-level failure (connection reset, DNS, 5xx).
    #[error("connection error: {message}")]
    Connection { message: String },

    /// The service declined the proof of possession.
    #[error("attestation rejected{}: {message}", fmt_code(.error_code))]
    AttestationRejected {
        error_code: Option<String>,
        message: String,
    },

    /// Response could not be parsed or is missing required fields.
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    /// Service asked the client to back off.
    #[error("throttled: retry after {retry_after:?}")]
    Throttled { retry_after: Option<Duration> },

    /// Enrollment is disabled on the service.
    #[error("device disabled: {reason}")]
    DeviceDisabled { reason: String },

    /// Service refused a status query (unknown operation, bad request).
    #[error("service rejected request with HTTP {status}{}: {message}", fmt_code(.error_code))]
    ServiceRejected {
        status: u16,
        error_code: Option<String>,
        message: String,
    },

    /// Service reported the registration as failed.
    #[error("registration failed{}: {reason}", fmt_code(.error_code))]
    RegistrationFailed {
        reason: String,
        error_code: Option<String>,
    },

    /// Caller cancelled the registration.
    #[error("registration cancelled")]
    Cancelled,

    /// A call or the overall poll budget timed out.
    #[error("timed out: {message}")]
    Timeout { message: String },

    /// Input validation failed.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Attestation provider failure.
    #[error("attestation provider error: {message}")]
    Attestation { message: String, retryable: bool },

    /// No transport implementation for the requested protocol.
    #[error("unsupported transport protocol: {protocol}")]
    UnsupportedProtocol { protocol: String },

    /// A registration is already running on this client.
    #[error("a registration is already in progress")]
    RegistrationInProgress,

    /// The client was closed.
    #[error("client is closed")]
    ClientClosed,
}

fn fmt_code(code: &Option<String>) -> String {
    code.as_ref()
        .map(|c| format!(" ({})", c))
        .unwrap_or_default()
}

impl ProvisioningError {
    /// Whether the error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Throttled { .. } | Self::Timeout { .. } => true,
            Self::Attestation { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Service supplied backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: message.into(),
        }
    }

    /// Classify a transport failure for the protocol phase it happened in.
    pub(crate) fn from_transport(err: TransportError, phase: Phase) -> Self {
        match err {
            TransportError::Closed => Self::Cancelled,
            TransportError::Timeout { message } => Self::Timeout { message },
            TransportError::Connection { message } => Self::Connection { message },
            TransportError::Unsupported { protocol } => Self::UnsupportedProtocol { protocol },
            TransportError::InvalidRequest { message } => Self::InvalidArgument { message },
            TransportError::Status {
                status,
                body,
                retry_after,
            } => classify_status(status, &body, retry_after, phase),
        }
    }
}

fn classify_status(
    status: u16,
    body: &[u8],
    retry_after: Option<Duration>,
    phase: Phase,
) -> ProvisioningError {
    let service = ServiceErrorBody::parse(body);

    match status {
        429 => ProvisioningError::Throttled { retry_after },

        500..=599 => ProvisioningError::Connection {
            message: format!("HTTP {}: {}", status, service.describe(status)),
        },

        401 | 403 => ProvisioningError::AttestationRejected {
            error_code: service.error_code(),
            message: service.describe(status),
        },

        400..=499 => match phase {
            Phase::Challenge | Phase::Authenticate => ProvisioningError::AttestationRejected {
                error_code: service.error_code(),
                message: service.describe(status),
            },
            Phase::Poll => ProvisioningError::ServiceRejected {
                status,
                error_code: service.error_code(),
                message: service.describe(status),
            },
        },

        _ => ProvisioningError::MalformedResponse {
            message: format!("unexpected HTTP status {}", status),
        },
    }
}

/// Protocol phase a transport call belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Challenge,
    Authenticate,
    Poll,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Challenge => "challenge",
            Self::Authenticate => "authenticate",
            Self::Poll => "poll",
        })
    }
}

/// Raw transport failures, before classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or broke mid-request.
    #[error("connection failed: {message}")]
    Connection { message: String },

    /// The request did not complete in time.
    #[error("request timed out: {message}")]
    Timeout { message: String },

    /// The transport was closed while the call was outstanding.
    #[error("transport closed")]
    Closed,

    /// Service answered with a non-success status.
    #[error("service returned status {status}")]
    Status {
        status: u16,
        body: Vec<u8>,
        retry_after: Option<Duration>,
    },

    /// Protocol slot without an implementation.
    #[error("transport not implemented for {protocol}")]
    Unsupported { protocol: String },

    /// Request could not be built; nothing was sent.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
}

impl TransportError {
    pub(crate) fn invalid_request(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::InvalidArgument { message } => Self::InvalidRequest { message },
            other => Self::InvalidRequest {
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                message: err.to_string(),
            }
        } else {
            Self::Connection {
                message: err.to_string(),
            }
        }
    }
}

/// Terminal failure of one `register_device` call.
#[derive(Debug, Clone, thiserror::Error)]
#[error("registration ended in state {state} (last reached {last_state}): {source}")]
pub struct RegistrationFailure {
    /// Terminal state: `Failed`, `Disabled` or `Error`.
    pub state: RegistrationState,

    /// Last state reached before the terminal transition.
    pub last_state: RegistrationState,

    /// Operation id, if the service accepted the registration.
    pub operation_id: Option<String>,

    /// Number of status polls issued.
    pub polls: u32,

    #[source]
    pub source: ProvisioningError,
}

impl RegistrationFailure {
    /// Whether retrying the whole registration might succeed.
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }

    /// Whether the caller cancelled the registration.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, ProvisioningError::Cancelled)
    }
}

/// A failure before the registration left its initial state.
impl From<ProvisioningError> for RegistrationFailure {
    fn from(source: ProvisioningError) -> Self {
        Self {
            state: RegistrationState::Error,
            last_state: RegistrationState::Unauthenticated,
            operation_id: None,
            polls: 0,
            source,
        }
    }
}

/// Result type for provisioning operations.
pub type ProvisioningResult<T> = Result<T, ProvisioningError>;
