//! HTTPS transport: request preparation and status mapping.
//!
//! This is the ONLY place for HTTP status handling. The engine sees
//! [`TransportResponse`] or [`TransportError`], never a status code check.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use tracing::debug;

use crate::config::ProvisioningConfig;
use crate::error::TransportError;
use crate::request::RequestBuilder;
use crate::task::CancelSignal;
use crate::types::{RequestData, TpmChallenge, TransportProtocol};

use super::{ProvisioningTransport, TransportResponse};

const ACCEPT_VALUE: &str = "application/json";
const CONTENT_TYPE_VALUE: &str = "application/json; charset=utf-8";

/// One open channel: a client configured with the registration's TLS
/// material, and its close signal.
#[derive(Clone)]
struct Session {
    client: reqwest::Client,
    closed: CancelSignal,
}

/// HTTPS realization of the transport contract.
pub struct HttpTransport {
    builder: RequestBuilder,
    user_agent: String,
    timeout: Duration,
    session: Mutex<Option<Session>>,
}

impl HttpTransport {
    /// Unopened transport; `open` builds the HTTP client.
    pub fn new(builder: RequestBuilder, config: &ProvisioningConfig) -> Self {
        Self {
            builder,
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout(),
            session: Mutex::new(None),
        }
    }

    fn session(&self) -> Result<Session, TransportError> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(TransportError::Closed)
    }

    /// Send one request; cancelled by `close`.
    async fn send(
        &self,
        method: Method,
        url: &str,
        request: &RequestData,
        body: Option<&[u8]>,
    ) -> Result<(StatusCode, Vec<u8>, Option<Duration>), TransportError> {
        let session = self.session()?;

        let mut builder = session
            .client
            .request(method.clone(), url)
            .header(ACCEPT, ACCEPT_VALUE)
            .header(CONTENT_TYPE, CONTENT_TYPE_VALUE);

        if let Some(token) = request.authorization() {
            builder = builder.header(AUTHORIZATION, token);
        }
        if let Some(body) = body {
            builder = builder.body(body.to_vec());
        }

        debug!(method = %method, url = %url, "sending provisioning request");

        let exchange = async {
            let response = builder.send().await?;
            let status = response.status();
            let retry_after = parse_retry_after(response.headers());
            let body = response.bytes().await?.to_vec();
            Ok::<_, TransportError>((status, body, retry_after))
        };

        tokio::select! {
            result = exchange => {
                let (status, body, retry_after) = result?;
                debug!(status = status.as_u16(), retry_after = ?retry_after, "provisioning response");
                Ok((status, body, retry_after))
            }
            _ = session.closed.cancelled() => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl ProvisioningTransport for HttpTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Https
    }

    async fn open(&self, request: &RequestData) -> Result<(), TransportError> {
        let mut default_headers = HeaderMap::new();
        let user_agent =
            HeaderValue::from_str(&self.user_agent).map_err(|e| TransportError::Connection {
                message: format!("invalid user agent: {}", e),
            })?;
        default_headers.insert(USER_AGENT, user_agent);

        let builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(default_headers);
        let client = request
            .tls
            .apply(builder)?
            .build()
            .map_err(|e| TransportError::Connection {
                message: format!("failed to create HTTP client: {}", e),
            })?;

        let mut session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = session.take() {
            previous.closed.cancel();
        }
        *session = Some(Session {
            client,
            closed: CancelSignal::new(),
        });
        Ok(())
    }

    /// PUT without authorization; the service answers 401 with
    /// `{"authenticationKey": ...}`, which is the expected outcome here.
    async fn request_challenge(
        &self,
        request: &RequestData,
        payload: &[u8],
    ) -> Result<TransportResponse, TransportError> {
        let url = self
            .builder
            .register_url(&request.registration_id)
            .map_err(TransportError::invalid_request)?;

        let (status, body, retry_after) =
            self.send(Method::PUT, &url, request, Some(payload)).await?;

        if status == StatusCode::UNAUTHORIZED
            && serde_json::from_slice::<TpmChallenge>(&body).is_ok()
        {
            return Ok(TransportResponse { body, retry_after });
        }

        Err(TransportError::Status {
            status: status.as_u16(),
            body,
            retry_after,
        })
    }

    async fn authenticate(
        &self,
        request: &RequestData,
        payload: &[u8],
    ) -> Result<TransportResponse, TransportError> {
        let url = self
            .builder
            .register_url(&request.registration_id)
            .map_err(TransportError::invalid_request)?;

        let (status, body, retry_after) =
            self.send(Method::PUT, &url, request, Some(payload)).await?;
        into_response(status, body, retry_after)
    }

    async fn registration_status(
        &self,
        request: &RequestData,
    ) -> Result<TransportResponse, TransportError> {
        let operation_id = request.operation_id.as_deref().unwrap_or_default();
        let url = self
            .builder
            .operation_status_url(&request.registration_id, operation_id)
            .map_err(TransportError::invalid_request)?;

        let (status, body, retry_after) = self.send(Method::GET, &url, request, None).await?;
        into_response(status, body, retry_after)
    }

    async fn close(&self) {
        let session = self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(session) = session {
            debug!("closing HTTP transport");
            session.closed.cancel();
        }
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("builder", &self.builder)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

fn into_response(
    status: StatusCode,
    body: Vec<u8>,
    retry_after: Option<Duration>,
) -> Result<TransportResponse, TransportError> {
    if status.is_success() {
        Ok(TransportResponse { body, retry_after })
    } else {
        Err(TransportError::Status {
            status: status.as_u16(),
            body,
            retry_after,
        })
    }
}

/// `retry-after` in whole seconds.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}
