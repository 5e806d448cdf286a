//! Shared access signature tokens.
//!
//! Token format:
//! `SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>&skn=registration`
//!
//! where `resource` is the URL-encoded `<idScope>/registrations/<registrationId>`,
//! `signature` is the URL-encoded Base64 signature of `<resource>\n<expiry>`
//! and `expiry` is in seconds since the Unix epoch.

use base64::Engine as _;

use crate::attestation::AttestationProvider;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::request::url_encode;

const KEY_NAME: &str = "registration";

/// A signed, time-boxed authorization token.
#[derive(Clone, PartialEq, Eq)]
pub struct SasToken {
    resource: String,
    signature: String,
    expiry: i64,
}

impl SasToken {
    /// Bytes to sign for `encoded_resource` expiring at `expiry`.
    pub fn string_to_sign(encoded_resource: &str, expiry: i64) -> String {
        format!("{}\n{}", encoded_resource, expiry)
    }

    /// Expiry `ttl_secs` from now, saturating at `i64::MAX`.
    pub fn expiry_from_now(ttl_secs: u64) -> i64 {
        let ttl = i64::try_from(ttl_secs).unwrap_or(i64::MAX);
        chrono::Utc::now().timestamp().saturating_add(ttl)
    }

    /// Token from a raw signature; Base64 and URL encoding applied here.
    pub fn new(encoded_resource: impl Into<String>, signature: &[u8], expiry: i64) -> Self {
        let b64 = base64::engine::general_purpose::STANDARD.encode(signature);
        Self {
            resource: encoded_resource.into(),
            signature: url_encode(&b64),
            expiry,
        }
    }

    /// Expiry as seconds since the Unix epoch.
    pub fn expiry(&self) -> i64 {
        self.expiry
    }

    /// `Authorization` header value.
    pub fn to_header(&self) -> String {
        format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            self.resource, self.signature, self.expiry, KEY_NAME
        )
    }
}

impl std::fmt::Debug for SasToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SasToken")
            .field("resource", &self.resource)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Sign a token with the provider.
///
/// Returns `Ok(None)` for mechanisms that prove possession through TLS.
pub async fn sign_token(
    provider: &AttestationProvider,
    encoded_resource: &str,
    ttl_secs: u64,
) -> ProvisioningResult<Option<SasToken>> {
    if ttl_secs == 0 {
        return Err(ProvisioningError::invalid("SAS token ttl must be positive"));
    }

    let expiry = SasToken::expiry_from_now(ttl_secs);
    let to_sign = SasToken::string_to_sign(encoded_resource, expiry);

    match provider.sign(to_sign.as_bytes()).await? {
        None => Ok(None),
        Some(sig) if sig.is_empty() => Err(ProvisioningError::Attestation {
            message: "provider returned an empty signature".to_string(),
            retryable: false,
        }),
        Some(sig) => Ok(Some(SasToken::new(encoded_resource, &sig, expiry))),
    }
}
