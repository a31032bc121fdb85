//! # ChainClient: Ledger Submission Adapter
//!
//! Signs, sends and confirms attestation and integrity-warning
//! transactions through a trait-abstracted transport layer.
//!
//! ## Architecture
//!
//! ```text
//! Attestation / IntegrityWarning
//!      │
//!      ▼
//! ChainClient::submit_attestation() / emit_integrity_warning()
//!      │
//!      ├─ Encode v1 instruction
//!      ├─ Sign envelope via dyn TransactionSigner
//!      └─ send + poll confirmation via dyn ChainTransport
//!      │          (bounded by call_timeout)
//!      ▼
//! Ok(signature) | Err(ChainError { Network | Rejected | Timeout | ... })
//! ```
//!
//! ## Transport Abstraction
//!
//! [`ChainTransport`] decouples submission from any specific ledger client:
//!
//! - [`JsonRpcChainTransport`]: production JSON-RPC client (`reqwest`).
//! - [`MockChainTransport`]: in-memory ledger for tests, with scripted
//!   failures and stalled confirmations.
//!
//! ## No Implicit Retry
//!
//! `ChainClient` performs a single send per call. Attempt counting and the
//! retry cap belong to the proof submitter and state tracker.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

use securizz_common::{
    Attestation, AttestationRecord, Instruction, InstructionError, IntegrityWarning,
    attestation_address, SignedTransaction, TransactionSigner, HASH_LEN,
};

/// Default bound on a full send-and-confirm round trip.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Default delay between confirmation polls.
pub const DEFAULT_CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ════════════════════════════════════════════════════════════════════════════════
// ERROR
// ════════════════════════════════════════════════════════════════════════════════

/// Errors from ledger interaction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// Transport-level network failure.
    #[error("chain network error: {0}")]
    Network(String),

    /// The ledger explicitly refused the transaction.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// No confirmation within the configured bound.
    #[error("chain call timed out")]
    Timeout,

    /// The RPC answered with something that is not the documented shape.
    #[error("unexpected rpc response: {0}")]
    Protocol(String),

    /// The instruction could not be encoded.
    #[error("instruction encoding failed: {0}")]
    Encoding(#[from] InstructionError),
}

impl ChainError {
    /// Returns `true` if retrying the same transaction later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Encoding(_))
    }
}

/// Confirmation state of a sent transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// Included and confirmed.
    Confirmed,
    /// Not yet confirmed (unknown to the ledger or only processed).
    Pending,
    /// Included but failed execution.
    Failed(String),
}

// ════════════════════════════════════════════════════════════════════════════════
// TRANSPORT TRAIT
// ════════════════════════════════════════════════════════════════════════════════

/// Async transport abstraction for ledger interaction.
///
/// ## Contract
///
/// - Implementations MUST NOT modify the transaction.
/// - Implementations MUST NOT retry internally.
/// - Implementations MUST return [`ChainError::Rejected`] when the ledger
///   refuses a transaction and [`ChainError::Timeout`] for timeouts.
#[async_trait]
pub trait ChainTransport: Send + Sync {
    /// Sends a signed transaction. Returns the transaction signature.
    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, ChainError>;

    /// Queries the confirmation state of `signature`.
    async fn confirmation_status(&self, signature: &str)
        -> Result<ConfirmationStatus, ChainError>;

    /// Reads the attestation account at `address`, if it exists.
    async fn get_attestation(
        &self,
        address: &[u8; 32],
    ) -> Result<Option<AttestationRecord>, ChainError>;

    /// Checks that the ledger endpoint is reachable.
    async fn health_check(&self) -> Result<(), ChainError>;
}

// ════════════════════════════════════════════════════════════════════════════════
// CLIENT
// ════════════════════════════════════════════════════════════════════════════════

/// Ledger client that signs and submits oracle instructions through a
/// pluggable [`ChainTransport`].
///
/// ## Usage
///
/// ```rust,ignore
/// let transport = Arc::new(JsonRpcChainTransport::new(rpc_url, timeout));
/// let client = ChainClient::new(transport, Arc::new(keypair), program_id);
///
/// let signature = client.submit_attestation(&attestation).await?;
/// ```
#[derive(Clone)]
pub struct ChainClient {
    transport: Arc<dyn ChainTransport>,
    signer: Arc<dyn TransactionSigner>,
    program_id: String,
    call_timeout: Duration,
    confirm_poll_interval: Duration,
}

impl ChainClient {
    /// Creates a client with default timeouts.
    #[must_use]
    pub fn new(
        transport: Arc<dyn ChainTransport>,
        signer: Arc<dyn TransactionSigner>,
        program_id: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            signer,
            program_id: program_id.into(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
            confirm_poll_interval: DEFAULT_CONFIRM_POLL_INTERVAL,
        }
    }

    /// Overrides the send-and-confirm bound and the poll interval.
    #[must_use]
    pub fn with_timeouts(mut self, call_timeout: Duration, confirm_poll_interval: Duration) -> Self {
        self.call_timeout = call_timeout;
        self.confirm_poll_interval = confirm_poll_interval;
        self
    }

    /// Public key of the oracle signer.
    pub fn oracle_public_key(&self) -> [u8; 32] {
        self.signer.public_key()
    }

    /// Sends an attestation and waits for confirmation.
    pub async fn submit_attestation(&self, attestation: &Attestation) -> Result<String, ChainError> {
        self.send_and_confirm(Instruction::SubmitAttestation(attestation.clone()))
            .await
    }

    /// Sends an integrity warning and waits for confirmation.
    pub async fn emit_integrity_warning(
        &self,
        warning: &IntegrityWarning,
    ) -> Result<String, ChainError> {
        self.send_and_confirm(Instruction::IntegrityWarning(*warning))
            .await
    }

    /// Reads the attestation account for `contract_hash`.
    pub async fn find_attestation(
        &self,
        contract_hash: &[u8; HASH_LEN],
    ) -> Result<Option<AttestationRecord>, ChainError> {
        let address = attestation_address(&self.program_id, contract_hash);
        tokio::time::timeout(self.call_timeout, self.transport.get_attestation(&address))
            .await
            .map_err(|_| ChainError::Timeout)?
    }

    /// Checks ledger reachability within the call bound.
    pub async fn health_check(&self) -> Result<(), ChainError> {
        tokio::time::timeout(self.call_timeout, self.transport.health_check())
            .await
            .map_err(|_| ChainError::Timeout)?
    }

    async fn send_and_confirm(&self, instruction: Instruction) -> Result<String, ChainError> {
        let tx = SignedTransaction::sign(&self.program_id, &instruction, self.signer.as_ref())?;

        let round_trip = async {
            let signature = self.transport.send_transaction(&tx).await?;
            debug!(signature = %signature, "transaction sent, awaiting confirmation");
            loop {
                match self.transport.confirmation_status(&signature).await? {
                    ConfirmationStatus::Confirmed => return Ok(signature),
                    ConfirmationStatus::Failed(reason) => return Err(ChainError::Rejected(reason)),
                    ConfirmationStatus::Pending => {
                        tokio::time::sleep(self.confirm_poll_interval).await;
                    }
                }
            }
        };

        tokio::time::timeout(self.call_timeout, round_trip)
            .await
            .map_err(|_| ChainError::Timeout)?
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// JSON-RPC TRANSPORT
// ════════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// JSON-RPC ledger transport.
///
/// | Method | Params | Result |
/// |--------|--------|--------|
/// | `getHealth` | – | `"ok"` |
/// | `sendTransaction` | `[base64(tx), {"encoding":"base64"}]` | signature |
/// | `getSignatureStatuses` | `[[signature]]` | `{value:[null \| {err, confirmationStatus}]}` |
/// | `getAttestation` | `[hex(attestation_address)]` | `null` \| record |
#[derive(Clone)]
pub struct JsonRpcChainTransport {
    url: String,
    client: Client,
}

impl JsonRpcChainTransport {
    /// Creates a transport with a per-request timeout.
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self, ChainError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChainError::Network(format!("client build failed: {}", e)))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, ChainError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        let status = resp.status();
        if !status.is_success() {
            let t = resp.text().await.unwrap_or_default();
            return Err(ChainError::Network(format!("{} failed {} {}", method, status, t)));
        }
        let parsed = resp.json::<RpcResponse>().await.map_err(map_reqwest_error)?;
        if let Some(err) = parsed.error {
            return Err(ChainError::Rejected(format!("{} ({})", err.message, err.code)));
        }
        Ok(parsed.result.unwrap_or(Value::Null))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::Timeout
    } else if e.is_decode() {
        ChainError::Protocol(e.to_string())
    } else {
        ChainError::Network(e.to_string())
    }
}

#[async_trait]
impl ChainTransport for JsonRpcChainTransport {
    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, ChainError> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(tx.to_bytes()?);
        let result = self
            .call("sendTransaction", json!([encoded, {"encoding": "base64"}]))
            .await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChainError::Protocol(format!("sendTransaction returned {}", result)))
    }

    async fn confirmation_status(
        &self,
        signature: &str,
    ) -> Result<ConfirmationStatus, ChainError> {
        let result = self
            .call("getSignatureStatuses", json!([[signature]]))
            .await?;
        let entry = result
            .get("value")
            .and_then(|v| v.get(0))
            .cloned()
            .unwrap_or(Value::Null);
        if entry.is_null() {
            return Ok(ConfirmationStatus::Pending);
        }
        if let Some(err) = entry.get("err").filter(|e| !e.is_null()) {
            return Ok(ConfirmationStatus::Failed(err.to_string()));
        }
        match entry.get("confirmationStatus").and_then(Value::as_str) {
            Some("confirmed") | Some("finalized") => Ok(ConfirmationStatus::Confirmed),
            _ => Ok(ConfirmationStatus::Pending),
        }
    }

    async fn get_attestation(
        &self,
        address: &[u8; 32],
    ) -> Result<Option<AttestationRecord>, ChainError> {
        let result = self
            .call("getAttestation", json!([hex::encode(address)]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| ChainError::Protocol(format!("attestation record: {}", e)))
    }

    async fn health_check(&self) -> Result<(), ChainError> {
        let result = self.call("getHealth", json!([])).await?;
        match result.as_str() {
            Some("ok") => Ok(()),
            _ => Err(ChainError::Network(format!("ledger unhealthy: {}", result))),
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// MOCK TRANSPORT
// ════════════════════════════════════════════════════════════════════════════════

/// Scripted failure consumed by the next [`MockChainTransport::send_transaction`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    Network(String),
    Rejected(String),
    Timeout,
}

#[derive(Default)]
struct MockLedger {
    /// Keyed by attestation account address.
    attestations: HashMap<[u8; 32], AttestationRecord>,
    warnings: Vec<IntegrityWarning>,
    sent: Vec<SignedTransaction>,
    statuses: HashMap<String, ConfirmationStatus>,
    failures: VecDeque<MockFailure>,
    stall_confirmations: bool,
    unhealthy: bool,
    clock: i64,
}

/// In-memory ledger for testing without network access.
///
/// Behaves like the attestation program: verifies the envelope signature,
/// decodes the instruction, stores one attestation account per
/// `(program, contract)` address and refuses a second one. Scripted failures are consumed FIFO before
/// the ledger logic runs. With `stall_confirmations` set, sent
/// transactions stay `Pending` and never change ledger state.
#[derive(Default)]
pub struct MockChainTransport {
    ledger: Mutex<MockLedger>,
}

impl MockChainTransport {
    /// Creates an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a failure for a future send (FIFO).
    pub fn push_failure(&self, failure: MockFailure) {
        self.ledger.lock().failures.push_back(failure);
    }

    /// Keeps every sent transaction `Pending` while `stall` is set.
    pub fn set_stall_confirmations(&self, stall: bool) {
        self.ledger.lock().stall_confirmations = stall;
    }

    /// Makes `health_check` fail while `unhealthy` is set.
    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.ledger.lock().unhealthy = unhealthy;
    }

    /// Replaces the attestation account at `address` (test seeding).
    pub fn insert_attestation(&self, address: [u8; 32], record: AttestationRecord) {
        self.ledger.lock().attestations.insert(address, record);
    }

    /// Number of send calls that reached the ledger logic or a scripted failure.
    pub fn send_count(&self) -> usize {
        self.ledger.lock().sent.len()
    }

    /// Number of stored attestation accounts.
    pub fn attestation_count(&self) -> usize {
        self.ledger.lock().attestations.len()
    }

    /// Stored attestation for a contract, under any program.
    pub fn attestation(&self, contract_hash: &[u8; HASH_LEN]) -> Option<AttestationRecord> {
        let wanted = hex::encode(contract_hash);
        self.ledger
            .lock()
            .attestations
            .values()
            .find(|r| r.contract_hash == wanted)
            .cloned()
    }

    /// Integrity warnings accepted so far, in order.
    pub fn warnings(&self) -> Vec<IntegrityWarning> {
        self.ledger.lock().warnings.clone()
    }
}

#[async_trait]
impl ChainTransport for MockChainTransport {
    async fn send_transaction(&self, tx: &SignedTransaction) -> Result<String, ChainError> {
        let mut ledger = self.ledger.lock();
        ledger.sent.push(tx.clone());

        if let Some(failure) = ledger.failures.pop_front() {
            return Err(match failure {
                MockFailure::Network(msg) => ChainError::Network(msg),
                MockFailure::Rejected(msg) => ChainError::Rejected(msg),
                MockFailure::Timeout => ChainError::Timeout,
            });
        }

        if !tx.verify()? {
            return Err(ChainError::Rejected("signature verification failed".to_string()));
        }
        let signature = tx.signature_hex();
        let instruction = tx.decode_instruction()?;

        // A stalled transaction is accepted but never lands.
        if ledger.stall_confirmations {
            ledger.statuses.insert(signature.clone(), ConfirmationStatus::Pending);
            return Ok(signature);
        }

        ledger.clock += 1;
        let now = ledger.clock;

        match instruction {
            Instruction::SubmitAttestation(att) => {
                let address = attestation_address(&tx.program_id, &att.contract_hash);
                if ledger.attestations.contains_key(&address) {
                    return Err(ChainError::Rejected(
                        "attestation account already in use".to_string(),
                    ));
                }
                let record = AttestationRecord::from_attestation(&att, &signature, &tx.signer, now);
                ledger.attestations.insert(address, record);
            }
            Instruction::IntegrityWarning(w) => ledger.warnings.push(w),
        }

        ledger
            .statuses
            .insert(signature.clone(), ConfirmationStatus::Confirmed);
        Ok(signature)
    }

    async fn confirmation_status(
        &self,
        signature: &str,
    ) -> Result<ConfirmationStatus, ChainError> {
        let ledger = self.ledger.lock();
        if ledger.stall_confirmations {
            return Ok(ConfirmationStatus::Pending);
        }
        Ok(ledger
            .statuses
            .get(signature)
            .cloned()
            .unwrap_or(ConfirmationStatus::Pending))
    }

    async fn get_attestation(
        &self,
        address: &[u8; 32],
    ) -> Result<Option<AttestationRecord>, ChainError> {
        Ok(self.ledger.lock().attestations.get(address).cloned())
    }

    async fn health_check(&self) -> Result<(), ChainError> {
        if self.ledger.lock().unhealthy {
            return Err(ChainError::Network("mock ledger unhealthy".to_string()));
        }
        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════════════════
// COMPILE-TIME ASSERTIONS
// ════════════════════════════════════════════════════════════════════════════════

const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn check() {
        assert_send_sync::<ChainClient>();
        assert_send_sync::<MockChainTransport>();
        assert_send_sync::<JsonRpcChainTransport>();
    }
    let _ = check;
};

// ════════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════════
