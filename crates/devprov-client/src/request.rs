//! Pure request construction: URLs, SAS resource, registration body.
//!
//! No I/O and no status logic.

use base64::Engine as _;
use url::Url;

use crate::error::{ProvisioningError, ProvisioningResult};
use crate::types::{DeviceRegistration, RequestData, TpmAttestation};

/// Builds provisioning URLs for one `(endpoint, id scope)` pair.
///
/// URL format:
/// - `https://<endpoint>/<idScope>/registrations/<registrationId>/register?api-version=<v>`
/// - `https://<endpoint>/<idScope>/registrations/<registrationId>/operations/<operationId>?api-version=<v>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBuilder {
    base_url: String,
    id_scope: String,
    api_version: String,
}

impl RequestBuilder {
    /// `endpoint` is a host name; an explicit `http://` or `https://` prefix
    /// is kept verbatim.
    pub fn new(
        endpoint: &str,
        id_scope: &str,
        api_version: &str,
    ) -> ProvisioningResult<Self> {
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return Err(ProvisioningError::invalid("endpoint cannot be empty"));
        }
        let id_scope = id_scope.trim();
        if id_scope.is_empty() {
            return Err(ProvisioningError::invalid("id scope cannot be empty"));
        }
        if api_version.trim().is_empty() {
            return Err(ProvisioningError::invalid("api version cannot be empty"));
        }

        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{}", endpoint)
        };
        Url::parse(&base_url).map_err(|e| {
            ProvisioningError::invalid(format!("invalid endpoint {}: {}", endpoint, e))
        })?;

        Ok(Self {
            base_url,
            id_scope: id_scope.to_string(),
            api_version: api_version.trim().to_string(),
        })
    }

    /// Scope identifier embedded in every path.
    pub fn id_scope(&self) -> &str {
        &self.id_scope
    }

    /// `PUT` target: `{base}/{scope}/registrations/{id}/register?api-version=..`.
    pub fn register_url(&self, registration_id: &str) -> ProvisioningResult<String> {
        let registration_id = require("registration id", registration_id)?;
        self.url(&[registration_id, "register"])
    }

    /// `GET` target for polling one operation.
    pub fn operation_status_url(
        &self,
        registration_id: &str,
        operation_id: &str,
    ) -> ProvisioningResult<String> {
        let registration_id = require("registration id", registration_id)?;
        let operation_id = require("operation id", operation_id)?;
        self.url(&[registration_id, "operations", operation_id])
    }

    /// SAS token resource: `<idScope>/registrations/<registrationId>`.
    pub fn sas_resource(&self, registration_id: &str) -> ProvisioningResult<String> {
        let registration_id = require("registration id", registration_id)?;
        Ok(format!("{}/registrations/{}", self.id_scope, registration_id))
    }

    /// URL-encoded SAS token resource (`/` becomes `%2F`).
    pub fn encoded_sas_resource(&self, registration_id: &str) -> ProvisioningResult<String> {
        Ok(url_encode(&self.sas_resource(registration_id)?))
    }

    fn url(&self, tail: &[&str]) -> ProvisioningResult<String> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ProvisioningError::invalid(format!("invalid endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| ProvisioningError::invalid("endpoint cannot be a base URL"))?
            .pop_if_empty()
            .push(&self.id_scope)
            .push("registrations")
            .extend(tail);
        url.query_pairs_mut()
            .append_pair("api-version", &self.api_version);
        Ok(url.into())
    }
}

/// JSON body of the register PUT.
///
/// Carries the TPM public keys when present and the custom payload when set.
pub fn registration_body(data: &RequestData) -> ProvisioningResult<Vec<u8>> {
    require("registration id", &data.registration_id)?;

    let tpm = match (&data.endorsement_key, &data.storage_root_key) {
        (Some(ek), Some(srk)) => Some(TpmAttestation {
            endorsement_key: base64::engine::general_purpose::STANDARD.encode(ek),
            storage_root_key: base64::engine::general_purpose::STANDARD.encode(srk),
        }),
        (None, None) => None,
        _ => {
            return Err(ProvisioningError::invalid(
                "endorsement key and storage root key must be provided together",
            ))
        }
    };

    let body = DeviceRegistration {
        registration_id: data.registration_id.clone(),
        tpm,
        payload: data.payload.clone(),
    };

    serde_json::to_vec(&body)
        .map_err(|e| ProvisioningError::invalid(format!("failed to encode registration: {}", e)))
}

pub(crate) fn url_encode(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

fn require<'a>(what: &str, value: &'a str) -> ProvisioningResult<&'a str> {
    if value.trim().is_empty() {
        Err(ProvisioningError::invalid(format!("{} cannot be empty", what)))
    } else {
        Ok(value)
    }
}
