//! Attestation providers.
//!
//! The engine is mechanism-agnostic: it only talks to [`AttestationProvider`],
//! a tagged variant selected at construction:
//!
//! - `Tpm`: hardware-backed key, challenge/response with credential activation
//! - `X509`: client certificate presented during TLS
//! - `SymmetricKey`: pre-shared key, HMAC-signed SAS token
//! - `ThirdParty`: caller-supplied mechanism
//!
//! Concrete TPM and third-party mechanisms are supplied by the caller through
//! the [`TpmDevice`] and [`CustomAttestation`] traits.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{ProvisioningError, TransportError};
use crate::types::AttestationType;

type HmacSha256 = Hmac<Sha256>;

/// Failure reported by an attestation provider.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct AttestationError {
    pub message: String,
    /// Transient condition (e.g. HSM busy); the engine may retry.
    pub retryable: bool,
}

impl AttestationError {
    /// Permanent provider failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }

    /// Provider failure worth retrying (device busy, lock contention).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }
}

impl From<AttestationError> for ProvisioningError {
    fn from(err: AttestationError) -> Self {
        Self::Attestation {
            message: err.message,
            retryable: err.retryable,
        }
    }
}

/// TLS material used to secure the transport.
#[derive(Clone, Default)]
pub struct TlsContext {
    identity_pem: Option<Vec<u8>>,
    root_certificates_pem: Vec<Vec<u8>>,
}

impl TlsContext {
    /// Client identity: PEM certificate chain followed by the PEM private key.
    pub fn with_identity_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.identity_pem = Some(pem.into());
        self
    }

    /// Additional trusted root certificate (PEM).
    pub fn with_root_certificate_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_certificates_pem.push(pem.into());
        self
    }

    /// Whether a client certificate is presented during the handshake.
    pub fn has_client_identity(&self) -> bool {
        self.identity_pem.is_some()
    }

    /// Apply to a reqwest client builder.
    pub(crate) fn apply(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, TransportError> {
        for pem in &self.root_certificates_pem {
            let cert = reqwest::Certificate::from_pem(pem).map_err(|e| {
                TransportError::Connection {
                    message: format!("invalid root certificate: {}", e),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(pem) = &self.identity_pem {
            let identity =
                reqwest::Identity::from_pem(pem).map_err(|e| TransportError::Connection {
                    message: format!("invalid client identity: {}", e),
                })?;
            builder = builder.identity(identity);
        }

        Ok(builder)
    }
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("client_identity", &self.identity_pem.is_some())
            .field("root_certificates", &self.root_certificates_pem.len())
            .finish()
    }
}

/// Hardware security module holding the TPM keys.
#[async_trait]
pub trait TpmDevice: Send + Sync {
    /// Stable registration id for this device.
    fn registration_id(&self) -> Result<String, AttestationError>;

    /// Public endorsement key.
    fn endorsement_key(&self) -> Result<Vec<u8>, AttestationError>;

    /// Public storage root key.
    fn storage_root_key(&self) -> Result<Vec<u8>, AttestationError>;

    /// Activate the credential blob sent by the service, importing the
    /// device signing key into the TPM.
    async fn decrypt_and_store_key(&self, activation_blob: &[u8]) -> Result<(), AttestationError>;

    /// Sign with the activated key.
    async fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, AttestationError>;

    fn tls_context(&self) -> Result<TlsContext, AttestationError> {
        Ok(TlsContext::default())
    }
}

/// Caller-supplied attestation mechanism.
#[async_trait]
pub trait CustomAttestation: Send + Sync {
    fn registration_id(&self) -> Result<String, AttestationError>;

    fn tls_context(&self) -> Result<TlsContext, AttestationError>;

    /// Sign SAS token material. `None` means the proof is carried by TLS only.
    async fn sign_data(&self, _data: &[u8]) -> Result<Option<Vec<u8>>, AttestationError> {
        Ok(None)
    }
}

/// X.509 client certificate identity.
#[derive(Clone)]
pub struct X509Identity {
    registration_id: String,
    certificate_chain_pem: Vec<u8>,
    private_key_pem: Vec<u8>,
    root_certificates_pem: Vec<Vec<u8>>,
}

impl X509Identity {
    /// `registration_id` must match the leaf certificate's common name.
    pub fn new(
        registration_id: impl Into<String>,
        certificate_chain_pem: impl Into<Vec<u8>>,
        private_key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            registration_id: registration_id.into(),
            certificate_chain_pem: certificate_chain_pem.into(),
            private_key_pem: private_key_pem.into(),
            root_certificates_pem: Vec::new(),
        }
    }

    /// Trust an extra root certificate for the service.
    pub fn with_root_certificate_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.root_certificates_pem.push(pem.into());
        self
    }

    /// PEM certificate chain, leaf first.
    pub fn certificate_chain(&self) -> &[u8] {
        &self.certificate_chain_pem
    }

    /// PEM private key of the leaf certificate.
    pub fn private_key(&self) -> &[u8] {
        &self.private_key_pem
    }

    fn tls_context(&self) -> Result<TlsContext, AttestationError> {
        if self.certificate_chain_pem.is_empty() || self.private_key_pem.is_empty() {
            return Err(AttestationError::new(
                "X.509 identity requires a certificate chain and a private key",
            ));
        }

        let mut identity = self.certificate_chain_pem.clone();
        if !identity.ends_with(b"\n") {
            identity.push(b'\n');
        }
        identity.extend_from_slice(&self.private_key_pem);

        let mut ctx = TlsContext::default().with_identity_pem(identity);
        for root in &self.root_certificates_pem {
            ctx = ctx.with_root_certificate_pem(root.clone());
        }
        Ok(ctx)
    }
}

impl std::fmt::Debug for X509Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X509Identity")
            .field("registration_id", &self.registration_id)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Pre-shared symmetric key.
#[derive(Clone)]
pub struct SymmetricKey {
    registration_id: String,
    key: Vec<u8>,
}

impl SymmetricKey {
    /// Symmetric key from raw key bytes.
    pub fn new(registration_id: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            registration_id: registration_id.into(),
            key: key.into(),
        }
    }

    /// Key given as Base64, as handed out by the enrollment.
    pub fn from_base64(
        registration_id: impl Into<String>,
        key_b64: &str,
    ) -> Result<Self, AttestationError> {
        let key = base64::engine::general_purpose::STANDARD
            .decode(key_b64.trim())
            .map_err(|e| AttestationError::new(format!("symmetric key is not valid Base64: {}", e)))?;
        if key.is_empty() {
            return Err(AttestationError::new("symmetric key cannot be empty"));
        }
        Ok(Self::new(registration_id, key))
    }

    /// Derive a device key from an enrollment group key:
    /// `HMAC-SHA256(group_key, registration_id)`.
    pub fn derive_from_group(
        registration_id: impl Into<String>,
        group_key_b64: &str,
    ) -> Result<Self, AttestationError> {
        let registration_id = registration_id.into();
        let group = Self::from_base64(registration_id.clone(), group_key_b64)?;
        let device_key = group.sign_hmac(registration_id.as_bytes())?;
        Ok(Self::new(registration_id, device_key))
    }

    /// HMAC-SHA256 of `data` under the device key.
    pub fn sign_hmac(&self, data: &[u8]) -> Result<Vec<u8>, AttestationError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| AttestationError::new(format!("invalid HMAC key: {}", e)))?;
        mac.update(data);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey")
            .field("registration_id", &self.registration_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Attestation mechanism consumed by the registration engine.
#[derive(Clone)]
pub enum AttestationProvider {
    Tpm(Arc<dyn TpmDevice>),
    X509(X509Identity),
    SymmetricKey(SymmetricKey),
    ThirdParty(Arc<dyn CustomAttestation>),
}

impl AttestationProvider {
    /// TPM attestation backed by `device`.
    pub fn tpm(device: impl TpmDevice + 'static) -> Self {
        Self::Tpm(Arc::new(device))
    }

    /// X.509 attestation; proof travels in the TLS handshake.
    pub fn x509(identity: X509Identity) -> Self {
        Self::X509(identity)
    }

    /// Symmetric key attestation from a Base64 key.
    pub fn symmetric_key(
        registration_id: impl Into<String>,
        key_b64: &str,
    ) -> Result<Self, AttestationError> {
        Ok(Self::SymmetricKey(SymmetricKey::from_base64(
            registration_id,
            key_b64,
        )?))
    }

    /// Caller supplied attestation mechanism.
    pub fn third_party(provider: impl CustomAttestation + 'static) -> Self {
        Self::ThirdParty(Arc::new(provider))
    }

    /// Mechanism tag of this provider.
    pub fn attestation_type(&self) -> AttestationType {
        match self {
            Self::Tpm(_) => AttestationType::Tpm,
            Self::X509(_) => AttestationType::X509,
            Self::SymmetricKey(_) => AttestationType::SymmetricKey,
            Self::ThirdParty(_) => AttestationType::ThirdParty,
        }
    }

    /// Registration id; never empty.
    pub fn registration_id(&self) -> Result<String, AttestationError> {
        let id = match self {
            Self::Tpm(device) => device.registration_id()?,
            Self::X509(identity) => identity.registration_id.clone(),
            Self::SymmetricKey(key) => key.registration_id.clone(),
            Self::ThirdParty(custom) => custom.registration_id()?,
        };
        if id.trim().is_empty() {
            return Err(AttestationError::new("registration id cannot be empty"));
        }
        Ok(id)
    }

    /// TLS material the transport must present.
    pub fn tls_context(&self) -> Result<TlsContext, AttestationError> {
        match self {
            Self::Tpm(device) => device.tls_context(),
            Self::X509(identity) => identity.tls_context(),
            Self::SymmetricKey(_) => Ok(TlsContext::default()),
            Self::ThirdParty(custom) => custom.tls_context(),
        }
    }

    /// Sign SAS token material. `None` when the mechanism proves possession
    /// through TLS instead.
    pub async fn sign(&self, data: &[u8]) -> Result<Option<Vec<u8>>, AttestationError> {
        match self {
            Self::Tpm(device) => device.sign_data(data).await.map(Some),
            Self::X509(_) => Ok(None),
            Self::SymmetricKey(key) => key.sign_hmac(data).map(Some),
            Self::ThirdParty(custom) => custom.sign_data(data).await,
        }
    }
}

impl std::fmt::Debug for AttestationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tpm(_) => f.write_str("AttestationProvider::Tpm"),
            Self::X509(identity) => f.debug_tuple("AttestationProvider::X509").field(identity).finish(),
            Self::SymmetricKey(key) => f
                .debug_tuple("AttestationProvider::SymmetricKey")
                .field(key)
                .finish(),
            Self::ThirdParty(_) => f.write_str("AttestationProvider::ThirdParty"),
        }
    }
}
