//! Domain and wire types for the provisioning protocol.

use serde::{Deserialize, Serialize};

use crate::attestation::TlsContext;
use crate::error::{ProvisioningError, ProvisioningResult};

/// Proof-of-possession mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttestationType {
    Tpm,
    X509,
    SymmetricKey,
    ThirdParty,
}

impl std::fmt::Display for AttestationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Tpm => "tpm",
            Self::X509 => "x509",
            Self::SymmetricKey => "symmetric_key",
            Self::ThirdParty => "third_party",
        })
    }
}

/// Wire transport used to reach the provisioning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportProtocol {
    Https,
    Mqtt,
    MqttWs,
    Amqps,
    AmqpsWs,
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Https => "https",
            Self::Mqtt => "mqtt",
            Self::MqttWs => "mqtt_ws",
            Self::Amqps => "amqps",
            Self::AmqpsWs => "amqps_ws",
        })
    }
}

/// Registration state of one task.
///
/// Transitions only move forward; the last four variants are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationState {
    Unauthenticated,
    ReadyToAuthenticate,
    Authenticated,
    Assigning,
    Assigned,
    Failed,
    Disabled,
    Error,
}

impl RegistrationState {
    /// `Assigned`, `Failed`, `Disabled` or `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Assigned | Self::Failed | Self::Disabled | Self::Error
        )
    }
}

impl std::fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::ReadyToAuthenticate => "READY_TO_AUTHENTICATE",
            Self::Authenticated => "AUTHENTICATED",
            Self::Assigning => "ASSIGNING",
            Self::Assigned => "ASSIGNED",
            Self::Failed => "FAILED",
            Self::Disabled => "DISABLED",
            Self::Error => "ERROR",
        })
    }
}

/// Immutable identity of a provisioning client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationIdentity {
    pub id_scope: String,
    pub registration_id: String,
    pub attestation_type: AttestationType,
    pub protocol: TransportProtocol,
}

/// Successful assignment.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationResult {
    /// Assigned hub host name.
    pub iothub_uri: String,

    /// Device id on the assigned hub.
    pub device_id: String,

    /// Always `Assigned`.
    pub state: RegistrationState,

    pub registration_id: Option<String>,
    pub operation_id: Option<String>,
    pub substatus: Option<String>,

    /// Custom payload returned by the service, if any.
    pub payload: Option<serde_json::Value>,
}

/// Scratch state threaded through one registration attempt.
#[derive(Clone, Default)]
pub struct RequestData {
    pub registration_id: String,
    pub endorsement_key: Option<Vec<u8>>,
    pub storage_root_key: Option<Vec<u8>>,
    pub sas_token: Option<String>,
    pub operation_id: Option<String>,
    pub tls: TlsContext,
    pub payload: Option<serde_json::Value>,
}

impl RequestData {
    /// Request data for a fresh registration.
    pub fn new(registration_id: impl Into<String>, tls: TlsContext) -> Self {
        Self {
            registration_id: registration_id.into(),
            tls,
            ..Default::default()
        }
    }

    /// `Authorization` header value, if a SAS token is set.
    pub fn authorization(&self) -> Option<&str> {
        self.sas_token.as_deref()
    }
}

impl std::fmt::Debug for RequestData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestData")
            .field("registration_id", &self.registration_id)
            .field("has_endorsement_key", &self.endorsement_key.is_some())
            .field("has_storage_root_key", &self.storage_root_key.is_some())
            .field("sas_token", &self.sas_token.as_ref().map(|_| "<redacted>"))
            .field("operation_id", &self.operation_id)
            .field("tls", &self.tls)
            .field("payload", &self.payload)
            .finish()
    }
}

/// Body of the register PUT.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub registration_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tpm: Option<TpmAttestation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// TPM public key material (Base64).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TpmAttestation {
    pub endorsement_key: String,
    pub storage_root_key: String,
}

/// Body of the TPM challenge (HTTP 401 on the first register PUT).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TpmChallenge {
    pub authentication_key: String,
}

/// Service status of a registration operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Unassigned,
    Assigning,
    Assigned,
    Failed,
    Disabled,
}

impl ServiceStatus {
    pub fn parse(raw: &str) -> ProvisioningResult<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "unassigned" => Ok(Self::Unassigned),
            "assigning" => Ok(Self::Assigning),
            "assigned" => Ok(Self::Assigned),
            "failed" => Ok(Self::Failed),
            "disabled" => Ok(Self::Disabled),
            other => Err(ProvisioningError::malformed(format!(
                "unknown registration status: {}",
                other
            ))),
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, Self::Unassigned | Self::Assigning)
    }
}

/// Response of register and operation-status calls.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOperationStatus {
    #[serde(default)]
    pub operation_id: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub registration_state: Option<DeviceRegistrationState>,

    /// Flattened form: some services report these at top level.
    #[serde(default)]
    pub assigned_hub: Option<String>,

    #[serde(default)]
    pub device_id: Option<String>,
}

impl RegistrationOperationStatus {
    pub fn from_slice(body: &[u8]) -> ProvisioningResult<Self> {
        serde_json::from_slice(body).map_err(|e| {
            ProvisioningError::malformed(format!("failed to parse registration response: {}", e))
        })
    }

    pub fn service_status(&self) -> ProvisioningResult<ServiceStatus> {
        let raw = self
            .status
            .as_deref()
            .ok_or_else(|| ProvisioningError::malformed("registration response has no status"))?;
        ServiceStatus::parse(raw)
    }

    pub fn assigned_hub(&self) -> Option<&str> {
        self.registration_state
            .as_ref()
            .and_then(|s| s.assigned_hub.as_deref())
            .or(self.assigned_hub.as_deref())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.registration_state
            .as_ref()
            .and_then(|s| s.device_id.as_deref())
            .or(self.device_id.as_deref())
    }

    /// Service-reported reason for a failed or disabled registration.
    pub fn failure_reason(&self) -> String {
        self.registration_state
            .as_ref()
            .and_then(|s| s.error_message.clone())
            .unwrap_or_else(|| "no reason provided".to_string())
    }

    pub fn error_code(&self) -> Option<String> {
        self.registration_state
            .as_ref()
            .and_then(|s| s.error_code.as_ref())
            .map(code_to_string)
    }
}

/// `registrationState` object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistrationState {
    #[serde(default)]
    pub registration_id: Option<String>,

    #[serde(default)]
    pub created_date_time_utc: Option<String>,

    #[serde(default)]
    pub assigned_hub: Option<String>,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub status: Option<String>,

    #[serde(default)]
    pub substatus: Option<String>,

    #[serde(default)]
    pub error_code: Option<serde_json::Value>,

    #[serde(default)]
    pub error_message: Option<String>,

    #[serde(default)]
    pub last_updated_date_time_utc: Option<String>,

    #[serde(default)]
    pub etag: Option<String>,

    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// Error body returned with non-success statuses.
///
/// Expected format: `{"errorCode": 400209, "trackingId": "...", "message": "..."}`.
/// `errorCode` may be a number or a string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceErrorBody {
    #[serde(default)]
    pub error_code: Option<serde_json::Value>,

    #[serde(default)]
    pub tracking_id: Option<String>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(skip)]
    raw: String,
}

impl ServiceErrorBody {
    /// Parse leniently; falls back to the raw text.
    pub fn parse(body: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(body).into_owned();
        match serde_json::from_slice::<Self>(body) {
            Ok(mut parsed) => {
                parsed.raw = raw;
                parsed
            }
            Err(_) => Self {
                raw,
                ..Default::default()
            },
        }
    }

    pub fn error_code(&self) -> Option<String> {
        self.error_code.as_ref().map(code_to_string)
    }

    /// Human-readable message for the given status.
    pub fn describe(&self, status: u16) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        if self.raw.trim().is_empty() {
            format!("service returned HTTP {}", status)
        } else {
            self.raw.chars().take(200).collect()
        }
    }
}

fn code_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
