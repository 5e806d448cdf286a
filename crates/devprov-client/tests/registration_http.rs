//! Integration tests for ProvisioningDeviceClient over HTTPS.
//!
//! Uses wiremock for HTTP mocking. Tests cover the symmetric key and TPM
//! flows, status mapping (400/401/429/5xx), terminal service statuses,
//! progress callbacks, concurrent registration and close.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use devprov_client::config::USER_AGENT_VALUE;
use devprov_client::{
    AttestationError, AttestationProvider, ProvisioningConfig, ProvisioningDeviceClient,
    ProvisioningError, RegistrationState, SymmetricKey, TpmDevice, TransportProtocol,
};
use serde_json::json;
use wiremock::matchers::{body_json, header, header_exists, header_regex, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SCOPE: &str = "0ne00000A0A";
const REGISTER_PATH: &str = "/0ne00000A0A/registrations/dev1/register";
const OPERATION_PATH: &str = "/0ne00000A0A/registrations/dev1/operations/op1";

/// Log output for failing runs: `RUST_LOG=devprov_client=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(mock_server: &MockServer) -> ProvisioningConfig {
    ProvisioningConfig::default()
        .with_global_endpoint(mock_server.uri())
        .with_request_timeout_ms(2_000)
        .with_max_retries(2)
        .with_retry_base_delay_ms(10)
        .with_poll_delays(10, 10, 50)
}

fn symmetric_provider() -> AttestationProvider {
    AttestationProvider::SymmetricKey(SymmetricKey::new("dev1", b"secret-key".to_vec()))
}

fn create_test_client(mock_server: &MockServer) -> ProvisioningDeviceClient {
    ProvisioningDeviceClient::with_config(
        test_config(mock_server),
        SCOPE,
        TransportProtocol::Https,
        symmetric_provider(),
    )
    .expect("failed to create client")
}

fn assigning() -> serde_json::Value {
    json!({"operationId": "op1", "status": "assigning"})
}

fn assigned() -> serde_json::Value {
    json!({
        "operationId": "op1",
        "status": "assigned",
        "registrationState": {
            "registrationId": "dev1",
            "assignedHub": "myhub.azure-devices.net",
            "deviceId": "dev1",
            "status": "assigned",
            "substatus": "initialAssignment"
        }
    })
}

#[tokio::test]
async fn test_symmetric_key_registration_assigned() {
    init_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .and(query_param("api-version", "2019-03-31"))
        .and(header("accept", "application/json"))
        .and(header("content-type", "application/json; charset=utf-8"))
        .and(header("user-agent", USER_AGENT_VALUE))
        .and(header_regex(
            "authorization",
            r"^SharedAccessSignature sr=0ne00000A0A%2Fregistrations%2Fdev1&sig=[^&]+&se=\d+&skn=registration$",
        ))
        .and(body_json(json!({"registrationId": "dev1"})))
        .respond_with(ResponseTemplate::new(202).set_body_json(assigning()))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .and(query_param("api-version", "2019-03-31"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigning()))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "assigned",
            "deviceId": "dev1",
            "assignedHub": "myhub.azure-devices.net"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client
        .register_device_async()
        .await
        .expect("registration failed");

    assert_eq!(result.device_id, "dev1");
    assert_eq!(result.iothub_uri, "myhub.azure-devices.net");
    assert_eq!(result.state, RegistrationState::Assigned);
    assert_eq!(result.operation_id.as_deref(), Some("op1"));
}

#[tokio::test]
async fn test_invalid_attestation_no_retry() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errorCode": "InvalidAttestation",
            "trackingId": "t-1",
            "message": "attestation failed"
        })))
        .expect(1) // No retries
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let failure = client.register_device_async().await.unwrap_err();

    assert_eq!(failure.state, RegistrationState::Error);
    assert_eq!(failure.last_state, RegistrationState::ReadyToAuthenticate);
    assert!(!failure.is_retryable());
    match failure.source {
        ProvisioningError::AttestationRejected {
            error_code,
            message,
        } => {
            assert_eq!(error_code.as_deref(), Some("InvalidAttestation"));
            assert_eq!(message, "attestation failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_retry_on_503_then_success() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(503).set_body_string("service busy"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.register_device_async().await.expect("should retry");
    assert_eq!(result.substatus.as_deref(), Some("initialAssignment"));
}

#[tokio::test]
async fn test_throttled_poll_honors_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(202).set_body_json(assigning()))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "1"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let result = client.register_device_async().await.expect("should retry");
    assert_eq!(result.device_id, "dev1");
}

#[tokio::test]
async fn test_retry_budget_exhausted_on_5xx() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(3) // Initial + 2 retries
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let failure = client.register_device_async().await.unwrap_err();

    assert_eq!(failure.state, RegistrationState::Error);
    assert!(matches!(failure.source, ProvisioningError::Connection { .. }));
    assert!(failure.is_retryable());
}

#[tokio::test]
async fn test_disabled_registration() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operationId": "op1",
            "status": "disabled",
            "registrationState": {"status": "disabled", "errorMessage": "enrollment disabled"}
        })))
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let failure = client.register_device_async().await.unwrap_err();

    assert_eq!(failure.state, RegistrationState::Disabled);
    assert_eq!(
        failure.source,
        ProvisioningError::DeviceDisabled {
            reason: "enrollment disabled".into()
        }
    );
}

#[tokio::test]
async fn test_failed_registration_after_polling() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(202).set_body_json(assigning()))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "operationId": "op1",
            "status": "failed",
            "registrationState": {
                "status": "failed",
                "errorCode": 400207,
                "errorMessage": "custom allocation failed"
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = create_test_client(&mock_server);
    let failure = client.register_device_async().await.unwrap_err();

    assert_eq!(failure.state, RegistrationState::Failed);
    assert_eq!(failure.last_state, RegistrationState::Assigning);
    assert_eq!(failure.operation_id.as_deref(), Some("op1"));
    assert_eq!(failure.polls, 1);
    assert!(matches!(
        failure.source,
        ProvisioningError::RegistrationFailed { error_code: Some(ref code), .. } if code == "400207"
    ));
}

struct FakeTpm;

#[async_trait]
impl TpmDevice for FakeTpm {
    fn registration_id(&self) -> Result<String, AttestationError> {
        Ok("dev1".into())
    }

    fn endorsement_key(&self) -> Result<Vec<u8>, AttestationError> {
        Ok(b"endorsement".to_vec())
    }

    fn storage_root_key(&self) -> Result<Vec<u8>, AttestationError> {
        Ok(b"storage-root".to_vec())
    }

    async fn decrypt_and_store_key(&self, activation_blob: &[u8]) -> Result<(), AttestationError> {
        if activation_blob == b"activation-blob" {
            Ok(())
        } else {
            Err(AttestationError::new("unexpected activation blob"))
        }
    }

    async fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, AttestationError> {
        Ok(data.to_vec())
    }
}

#[tokio::test]
async fn test_tpm_challenge_flow() {
    init_tracing();
    let mock_server = MockServer::start().await;
    let b64 = base64::engine::general_purpose::STANDARD;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .and(body_json(json!({
            "registrationId": "dev1",
            "tpm": {
                "endorsementKey": b64.encode(b"endorsement"),
                "storageRootKey": b64.encode(b"storage-root")
            }
        })))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "authenticationKey": b64.encode(b"activation-blob")
        })))
        .up_to_n_times(1)
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .and(header_regex(
            "authorization",
            r"^SharedAccessSignature sr=0ne00000A0A%2Fregistrations%2Fdev1&",
        ))
        .respond_with(ResponseTemplate::new(202).set_body_json(assigning()))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned()))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = ProvisioningDeviceClient::with_config(
        test_config(&mock_server),
        SCOPE,
        TransportProtocol::Https,
        AttestationProvider::tpm(FakeTpm),
    )
    .expect("failed to create client");

    let result = client
        .register_device_async()
        .await
        .expect("TPM registration failed");
    assert_eq!(result.iothub_uri, "myhub.azure-devices.net");
}

#[tokio::test]
async fn test_status_callback_sequence() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(202).set_body_json(assigning()))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(assigned()))
        .mount(&mock_server)
        .await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&seen);
    let client = create_test_client(&mock_server)
        .with_status_callback(move |state| log.lock().unwrap().push(state));

    client.register_device_async().await.expect("registration failed");

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            RegistrationState::Unauthenticated,
            RegistrationState::ReadyToAuthenticate,
            RegistrationState::Authenticated,
            RegistrationState::Assigning,
            RegistrationState::Assigned,
        ]
    );
}

#[tokio::test]
async fn test_close_cancels_in_flight_registration() {
    init_tracing();
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path(REGISTER_PATH))
        .respond_with(ResponseTemplate::new(202).set_body_json(assigning()))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path(OPERATION_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(assigned())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&mock_server)
        .await;

    let client = ProvisioningDeviceClient::with_config(
        test_config(&mock_server).with_request_timeout_ms(30_000),
        SCOPE,
        TransportProtocol::Https,
        symmetric_provider(),
    )
    .expect("failed to create client");

    let (tx, rx) = tokio::sync::oneshot::channel();
    let calls = Arc::new(Mutex::new(0u32));
    let counter = Arc::clone(&calls);
    client
        .register_device(move |outcome| {
            *counter.lock().unwrap() += 1;
            let _ = tx.send(outcome);
        })
        .expect("registration should start");

    // Wait for the poll to be in flight.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let requests = mock_server.received_requests().await.unwrap_or_default();
        if requests.iter().any(|r| r.method.as_str() == "GET") {
            break;
        }
        assert!(Instant::now() < deadline, "poll never started");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = client.register_device(|_| {}).unwrap_err();
    assert_eq!(err, ProvisioningError::RegistrationInProgress);

    let started = Instant::now();
    client.close().await;
    let failure = rx.await.expect("callback dropped").unwrap_err();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(failure.is_cancelled());
    assert_eq!(failure.last_state, RegistrationState::Assigning);
    assert_eq!(*calls.lock().unwrap(), 1);

    let err = client.register_device(|_| {}).unwrap_err();
    assert_eq!(err, ProvisioningError::ClientClosed);
}

#[tokio::test]
async fn test_unreachable_endpoint_is_connection_error() {
    let config = ProvisioningConfig::default()
        .with_global_endpoint("http://127.0.0.1:1")
        .with_max_retries(1)
        .with_retry_base_delay_ms(10)
        .with_poll_delays(10, 10, 50);
    let client = ProvisioningDeviceClient::with_config(
        config,
        SCOPE,
        TransportProtocol::Https,
        symmetric_provider(),
    )
    .expect("failed to create client");

    let failure = client.register_device_async().await.unwrap_err();
    assert_eq!(failure.state, RegistrationState::Error);
    assert!(matches!(failure.source, ProvisioningError::Connection { .. }));
}
