//! Device provisioning client.
//!
//! Registers a device with a provisioning service and reports the hub it was
//! assigned to. The crate provides:
//!
//! - A registration state machine (authenticate, then poll the assignment)
//! - Attestation by TPM, X.509 certificate, symmetric key or a custom mechanism
//! - An HTTPS transport, with other protocols pluggable through a registry
//! - Retry with jittered backoff and service `retry-after` hints
//! - Cancellable background registration with exactly-once result delivery
//!
//! # Quick Start
//!
//! ```no_run
//! use devprov_client::{AttestationProvider, ProvisioningDeviceClient, TransportProtocol};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = AttestationProvider::symmetric_key("dev1", "c2VjcmV0LWtleQ==")?;
//! let client = ProvisioningDeviceClient::create(
//!     "global.azure-devices-provisioning.net",
//!     "0ne00000A0A",
//!     TransportProtocol::Https,
//!     provider,
//! )?;
//!
//! let result = client.register_device_async().await?;
//! println!("assigned to {} as {}", result.iothub_uri, result.device_id);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! The client never reads the environment on its own. Callers can opt in with
//! [`ProvisioningConfig::from_env`]:
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `DEVPROV_GLOBAL_ENDPOINT` | Service endpoint (default: `global.azure-devices-provisioning.net`) |
//! | `DEVPROV_API_VERSION` | `api-version` query value (default: `2019-03-31`) |
//! | `DEVPROV_TIMEOUT_MS` | Per call timeout in milliseconds (default: 30000) |
//! | `DEVPROV_MAX_RETRIES` | Max retries for transient failures (default: 3) |
//! | `DEVPROV_MAX_POLL_ATTEMPTS` | Max status polls (default: 60) |

pub mod attestation;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod request;
pub mod retry;
pub mod sas;
pub mod task;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use attestation::{
    AttestationError, AttestationProvider, CustomAttestation, SymmetricKey, TlsContext, TpmDevice,
    X509Identity,
};
pub use client::ProvisioningDeviceClient;
pub use config::ProvisioningConfig;
pub use engine::RegistrationStateMachine;
pub use error::{ProvisioningError, ProvisioningResult, RegistrationFailure, TransportError};
pub use request::RequestBuilder;
pub use retry::RetryPolicy;
pub use task::{
    CancelSignal, Progress, RegistrationCallback, RegistrationOutcome, RegistrationTask,
    ResultDispatcher, StatusCallback,
};
pub use transport::{
    HttpTransport, ProvisioningTransport, TransportFactory, TransportRegistry, TransportResponse,
    TransportSettings,
};
pub use types::{
    AttestationType, RegistrationIdentity, RegistrationResult, RegistrationState, RequestData,
    TransportProtocol,
};
