//! Transport contract and protocol registry.
//!
//! The engine only sees [`ProvisioningTransport`]; concrete wire protocols are
//! looked up in a [`TransportRegistry`] by [`TransportProtocol`]. HTTPS is the
//! only built-in implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::ProvisioningConfig;
use crate::error::{ProvisioningError, ProvisioningResult, TransportError};
use crate::request::RequestBuilder;
use crate::types::{RequestData, TransportProtocol};

mod http;

pub use http::HttpTransport;

/// Raw response of a transport call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportResponse {
    pub body: Vec<u8>,
    /// Service backoff hint (`retry-after`).
    pub retry_after: Option<Duration>,
}

/// Channel to the provisioning service.
///
/// Each call completes exactly once, with a response or an error. `close`
/// must make outstanding calls fail with [`TransportError::Closed`].
#[async_trait]
pub trait ProvisioningTransport: Send + Sync {
    fn protocol(&self) -> TransportProtocol;

    /// Open a channel for the registration described by `request`.
    async fn open(&self, request: &RequestData) -> Result<(), TransportError>;

    /// First TPM round-trip; the response body carries the activation blob.
    async fn request_challenge(
        &self,
        request: &RequestData,
        payload: &[u8],
    ) -> Result<TransportResponse, TransportError>;

    /// Register with proof of possession (TLS identity or `request.sas_token`).
    async fn authenticate(
        &self,
        request: &RequestData,
        payload: &[u8],
    ) -> Result<TransportResponse, TransportError>;

    /// Query the operation in `request.operation_id`.
    async fn registration_status(
        &self,
        request: &RequestData,
    ) -> Result<TransportResponse, TransportError>;

    async fn close(&self);
}

/// Inputs handed to transport factories.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub builder: RequestBuilder,
    pub config: ProvisioningConfig,
}

pub type TransportFactory = Arc<
    dyn Fn(&TransportSettings) -> ProvisioningResult<Arc<dyn ProvisioningTransport>>
        + Send
        + Sync,
>;

/// Maps protocols to transport factories.
#[derive(Clone)]
pub struct TransportRegistry {
    factories: HashMap<TransportProtocol, TransportFactory>,
}

impl TransportRegistry {
    /// Registry without any transport.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Install or replace the factory for `protocol`.
    pub fn register(&mut self, protocol: TransportProtocol, factory: TransportFactory) {
        self.factories.insert(protocol, factory);
    }

    /// Always hand out the same transport instance for `protocol`.
    pub fn register_instance(
        &mut self,
        protocol: TransportProtocol,
        transport: Arc<dyn ProvisioningTransport>,
    ) {
        self.register(
            protocol,
            Arc::new(
                move |_: &TransportSettings| -> ProvisioningResult<Arc<dyn ProvisioningTransport>> {
                    Ok(Arc::clone(&transport))
                },
            ),
        );
    }

    /// Whether a factory is registered for `protocol`.
    pub fn supports(&self, protocol: TransportProtocol) -> bool {
        self.factories.contains_key(&protocol)
    }

    /// Build a transport for `protocol`.
    pub fn create(
        &self,
        protocol: TransportProtocol,
        settings: &TransportSettings,
    ) -> ProvisioningResult<Arc<dyn ProvisioningTransport>> {
        let factory =
            self.factories
                .get(&protocol)
                .ok_or_else(|| ProvisioningError::UnsupportedProtocol {
                    protocol: protocol.to_string(),
                })?;
        factory(settings)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            TransportProtocol::Https,
            Arc::new(
                |settings: &TransportSettings| -> ProvisioningResult<Arc<dyn ProvisioningTransport>> {
                    Ok(Arc::new(HttpTransport::new(
                        settings.builder.clone(),
                        &settings.config,
                    )))
                },
            ),
        );
        registry
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<_> = self.factories.keys().map(|p| p.to_string()).collect();
        protocols.sort();
        f.debug_struct("TransportRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TransportSettings {
        TransportSettings {
            builder: RequestBuilder::new("dps.example.net", "scope", "2019-03-31").unwrap(),
            config: ProvisioningConfig::default(),
        }
    }

    #[test]
    fn test_default_registry_has_https_only() {
        let registry = TransportRegistry::default();
        assert!(registry.supports(TransportProtocol::Https));
        for protocol in [
            TransportProtocol::Mqtt,
            TransportProtocol::MqttWs,
            TransportProtocol::Amqps,
            TransportProtocol::AmqpsWs,
        ] {
            assert!(!registry.supports(protocol));
            assert!(matches!(
                registry.create(protocol, &settings()),
                Err(ProvisioningError::UnsupportedProtocol { .. })
            ));
        }

        let transport = registry
            .create(TransportProtocol::Https, &settings())
            .unwrap();
        assert_eq!(transport.protocol(), TransportProtocol::Https);
    }

    #[test]
    fn test_register_instance_shares_transport() {
        let http: Arc<dyn ProvisioningTransport> = Arc::new(HttpTransport::new(
            settings().builder,
            &ProvisioningConfig::default(),
        ));
        let mut registry = TransportRegistry::empty();
        registry.register_instance(TransportProtocol::Mqtt, Arc::clone(&http));

        let a = registry.create(TransportProtocol::Mqtt, &settings()).unwrap();
        assert!(Arc::ptr_eq(&a, &http));
    }
}
