//! Scripted transport and TPM doubles shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::attestation::{AttestationError, TpmDevice};
use crate::error::TransportError;
use crate::task::CancelSignal;
use crate::transport::{ProvisioningTransport, TransportResponse};
use crate::types::{RequestData, TransportProtocol};

/// One scripted transport answer.
#[derive(Debug, Clone)]
pub enum Step {
    Reply(TransportResponse),
    Fail(TransportError),
    /// Never answers until the transport is closed.
    Hang,
}

pub fn reply(body: serde_json::Value) -> Step {
    Step::Reply(TransportResponse {
        body: serde_json::to_vec(&body).unwrap(),
        retry_after: None,
    })
}

pub fn reply_after(body: serde_json::Value, secs: u64) -> Step {
    Step::Reply(TransportResponse {
        body: serde_json::to_vec(&body).unwrap(),
        retry_after: Some(Duration::from_secs(secs)),
    })
}

pub fn status(code: u16, body: &str) -> Step {
    Step::Fail(TransportError::Status {
        status: code,
        body: body.as_bytes().to_vec(),
        retry_after: None,
    })
}

pub fn connection_reset() -> Step {
    Step::Fail(TransportError::Connection {
        message: "connection reset".into(),
    })
}

/// Recorded call.
#[derive(Debug, Clone)]
pub struct Call {
    pub at: Instant,
    pub request: RequestData,
    pub payload: Option<serde_json::Value>,
}

#[derive(Default)]
pub struct MockTransport {
    challenge: Mutex<VecDeque<Step>>,
    authenticate: Mutex<VecDeque<Step>>,
    status: Mutex<VecDeque<Step>>,
    /// Answer for status calls once the script is used up.
    status_fallback: Mutex<Option<Step>>,
    pub challenge_calls: Mutex<Vec<Call>>,
    pub authenticate_calls: Mutex<Vec<Call>>,
    pub status_calls: Mutex<Vec<Call>>,
    pub opens: AtomicUsize,
    closed: AtomicBool,
    close_signal: CancelSignal,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_challenge(self, step: Step) -> Self {
        self.challenge.lock().unwrap().push_back(step);
        self
    }

    pub fn on_authenticate(self, step: Step) -> Self {
        self.authenticate.lock().unwrap().push_back(step);
        self
    }

    pub fn on_status(self, step: Step) -> Self {
        self.status.lock().unwrap().push_back(step);
        self
    }

    pub fn on_every_status(self, step: Step) -> Self {
        *self.status_fallback.lock().unwrap() = Some(step);
        self
    }

    pub fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_calls.lock().unwrap().len()
    }

    pub fn authenticate_count(&self) -> usize {
        self.authenticate_calls.lock().unwrap().len()
    }

    pub fn challenge_call(&self, index: usize) -> Call {
        self.challenge_calls.lock().unwrap()[index].clone()
    }

    pub fn authenticate_call(&self, index: usize) -> Call {
        self.authenticate_calls.lock().unwrap()[index].clone()
    }

    pub fn status_call(&self, index: usize) -> Call {
        self.status_calls.lock().unwrap()[index].clone()
    }

    async fn play(
        &self,
        script: &Mutex<VecDeque<Step>>,
        fallback: Option<Step>,
    ) -> Result<TransportResponse, TransportError> {
        let step = script.lock().unwrap().pop_front().or(fallback);
        match step {
            Some(Step::Reply(response)) => Ok(response),
            Some(Step::Fail(err)) => Err(err),
            Some(Step::Hang) => {
                self.close_signal.cancelled().await;
                Err(TransportError::Closed)
            }
            None => Err(TransportError::Connection {
                message: "script exhausted".into(),
            }),
        }
    }
}

fn record(log: &Mutex<Vec<Call>>, request: &RequestData, payload: Option<&[u8]>) {
    log.lock().unwrap().push(Call {
        at: Instant::now(),
        request: request.clone(),
        payload: payload.map(|p| serde_json::from_slice(p).unwrap()),
    });
}

#[async_trait]
impl ProvisioningTransport for MockTransport {
    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Https
    }

    async fn open(&self, _request: &RequestData) -> Result<(), TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_challenge(
        &self,
        request: &RequestData,
        payload: &[u8],
    ) -> Result<TransportResponse, TransportError> {
        record(&self.challenge_calls, request, Some(payload));
        self.play(&self.challenge, None).await
    }

    async fn authenticate(
        &self,
        request: &RequestData,
        payload: &[u8],
    ) -> Result<TransportResponse, TransportError> {
        record(&self.authenticate_calls, request, Some(payload));
        self.play(&self.authenticate, None).await
    }

    async fn registration_status(
        &self,
        request: &RequestData,
    ) -> Result<TransportResponse, TransportError> {
        record(&self.status_calls, request, None);
        let fallback = self.status_fallback.lock().unwrap().clone();
        self.play(&self.status, fallback).await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_signal.cancel();
    }
}

/// TPM double: fixed keys, records activation blobs.
#[derive(Default)]
pub struct MockTpm {
    pub activations: Mutex<Vec<Vec<u8>>>,
    pub signed: AtomicUsize,
    /// Endorsement key reads that fail with a transient error first.
    busy_reads: AtomicUsize,
    pub key_reads: AtomicUsize,
}

impl MockTpm {
    pub fn busy_for(reads: usize) -> Self {
        Self {
            busy_reads: AtomicUsize::new(reads),
            ..Self::default()
        }
    }
}

#[async_trait]
impl TpmDevice for MockTpm {
    fn registration_id(&self) -> Result<String, AttestationError> {
        Ok("tpm-dev".into())
    }

    fn endorsement_key(&self) -> Result<Vec<u8>, AttestationError> {
        self.key_reads.fetch_add(1, Ordering::SeqCst);
        let busy = self
            .busy_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if busy.is_ok() {
            return Err(AttestationError::transient("TPM busy"));
        }
        Ok(b"ek".to_vec())
    }

    fn storage_root_key(&self) -> Result<Vec<u8>, AttestationError> {
        Ok(b"srk".to_vec())
    }

    async fn decrypt_and_store_key(&self, activation_blob: &[u8]) -> Result<(), AttestationError> {
        self.activations.lock().unwrap().push(activation_blob.to_vec());
        Ok(())
    }

    async fn sign_data(&self, data: &[u8]) -> Result<Vec<u8>, AttestationError> {
        self.signed.fetch_add(1, Ordering::SeqCst);
        Ok(data.iter().rev().copied().collect())
    }
}
