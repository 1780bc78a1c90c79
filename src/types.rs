use alloy_primitives::U256;
use alloy_primitives::hex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Where the request source code lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodeLocation {
    /// Source text supplied inline in the request description
    #[default]
    Inline,
    /// Source fetched from a URL or file path at build time
    Remote,
}

/// Language of the request source.
///
/// The harness executes WebAssembly; inline sources are WebAssembly text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodeLanguage {
    #[default]
    Wasm,
}

/// Expected type of a successful execution result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// 32-byte big-endian encoding of a non-negative integer
    Uint256,
    /// Raw bytes passed through unmodified
    #[serde(alias = "buffer")]
    Bytes,
}

/// Opaque unique request identifier assigned by the submission interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub [u8; 32]);

impl RequestId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// Validated, normalized request configuration.
///
/// Produced by `RequestConfigBuilder::build` and consumed by the encoder;
/// immutable once built. `args` order is significant: it must match the
/// positional contract the source code expects. `secrets` holds resolved
/// cleartext values and must never be logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestConfig {
    pub code_location: CodeLocation,
    pub code_language: CodeLanguage,
    pub source: String,
    pub secrets: BTreeMap<String, String>,
    pub args: Vec<String>,
    pub expected_return_type: ReturnType,
    pub don_public_key: Option<[u8; 32]>,
}

/// Encrypted secrets envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecrets {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
}

/// Secrets as they travel with a built request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecretsPayload {
    /// No secrets declared
    Empty,
    /// Canonical plaintext serialization (no DON public key supplied)
    Plain(Vec<u8>),
    /// Encrypted under the DON public key
    Encrypted(EncryptedSecrets),
}

impl SecretsPayload {
    pub fn len(&self) -> usize {
        match self {
            SecretsPayload::Empty => 0,
            SecretsPayload::Plain(bytes) => bytes.len(),
            SecretsPayload::Encrypted(env) => env.ciphertext.len() + env.nonce.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// On-wire request built from a validated `RequestConfig`.
///
/// Immutable once built; building the same config with the same DON public
/// key yields a byte-identical value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Args in strict declaration order; positional semantics
    pub args: Vec<String>,
    /// Canonical length-prefixed encoding of `args`
    pub encoded_args: Vec<u8>,
    pub secrets: SecretsPayload,
    pub source: String,
    pub code_location: CodeLocation,
    pub expected_return_type: ReturnType,
}

impl Request {
    /// Total payload size used for simulated submission gas accounting
    pub fn payload_len(&self) -> usize {
        self.encoded_args.len() + self.secrets.len() + self.source.len()
    }
}

/// Lifecycle of a request accepted for simulated submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Sent,
    AwaitingFulfillment,
    Fulfilled,
    FulfillError,
    BillingReported,
}

/// Bookkeeping for one in-flight simulated request.
///
/// Status is mutated only by the orchestrator (single-writer discipline).
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: RequestId,
    pub subscription_id: u64,
    pub gas_limit: u64,
    pub status: RequestStatus,
}

impl PendingRequest {
    pub fn new(request_id: RequestId, subscription_id: u64, gas_limit: u64) -> Self {
        Self {
            request_id,
            subscription_id,
            gas_limit,
            status: RequestStatus::Sent,
        }
    }

    pub fn transition(&mut self, next: RequestStatus) {
        log::debug!(
            "request {}: {:?} -> {:?}",
            self.request_id,
            self.status,
            next
        );
        self.status = next;
    }
}

/// Outcome of executing a request source in the sandbox.
///
/// Exactly one of `result` / `error` is non-empty, and `success` is true
/// iff `result` is non-empty. Construct through `fulfilled` / `failed` to
/// preserve that invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResult {
    pub success: bool,
    pub result: Vec<u8>,
    pub error: Vec<u8>,
    /// Diagnostic output captured during execution; observability data,
    /// not protocol data
    pub execution_log: String,
}

impl FulfillmentResult {
    pub fn fulfilled(result: Vec<u8>, execution_log: String) -> Self {
        debug_assert!(!result.is_empty());
        Self {
            success: true,
            result,
            error: Vec::new(),
            execution_log,
        }
    }

    pub fn failed(error: impl Into<Vec<u8>>, execution_log: String) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = b"execution failed without a message".to_vec();
        }
        Self {
            success: false,
            result: Vec::new(),
            error,
            execution_log,
        }
    }

    /// Error bytes rendered for humans
    pub fn error_message(&self) -> String {
        String::from_utf8_lossy(&self.error).into_owned()
    }
}

/// Billing outcome computed once per request id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingRecord {
    pub request_id: RequestId,
    pub subscription_id: u64,
    pub signer_payment: U256,
    pub transmitter_payment: U256,
    pub total_cost: U256,
    pub success: bool,
}

/// Fulfillment-response signal emitted by the fulfillment interface.
///
/// Informational: it is validated and logged but does not resolve the
/// pending completion; the billing report is the authoritative terminal
/// signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentResponse {
    pub request_id: RequestId,
    pub result: Vec<u8>,
    pub error: Vec<u8>,
}

/// Everything one simulated round trip needs, threaded explicitly through
/// every stage instead of being captured from an enclosing scope.
#[derive(Debug, Clone)]
pub struct RequestParameters {
    pub request: Request,
    pub don_public_key: Option<[u8; 32]>,
    pub subscription_id: u64,
    pub consumer: String,
    pub gas_limit: u64,
    pub transmitter: String,
    pub signer_count: u32,
    pub quorum_size: u32,
    pub baseline_gas: u64,
}

/// Final caller-visible report for one simulated round trip
#[derive(Debug, Clone)]
pub struct SimulationReport {
    pub request_id: RequestId,
    pub fulfillment: FulfillmentResult,
    pub billing: BillingRecord,
    /// Gas consumed by the simulated submission transaction
    pub submission_gas_used: u64,
    /// Gas consumed by re-invoking the consumer callback on a fresh
    /// consumer with the same identity
    pub callback_gas_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fulfilled_result_invariant() {
        let result = FulfillmentResult::fulfilled(vec![0x01], String::new());
        assert!(result.success);
        assert!(!result.result.is_empty());
        assert!(result.error.is_empty());
    }

    #[test]
    fn test_failed_result_invariant() {
        let result = FulfillmentResult::failed("boom", "log line".to_string());
        assert!(!result.success);
        assert!(result.result.is_empty());
        assert_eq!(result.error_message(), "boom");
    }

    #[test]
    fn test_failed_result_never_empty() {
        let result = FulfillmentResult::failed(Vec::new(), String::new());
        assert!(!result.error.is_empty());
    }

    #[test]
    fn test_request_id_display() {
        let id = RequestId([0u8; 32]);
        let shown = id.to_string();
        assert!(shown.starts_with("0x"));
        assert_eq!(shown.len(), 2 + 64);
    }

    #[test]
    fn test_pending_request_transition() {
        let mut pending = PendingRequest::new(RequestId([1u8; 32]), 1, 100_000);
        assert_eq!(pending.status, RequestStatus::Sent);
        pending.transition(RequestStatus::AwaitingFulfillment);
        assert_eq!(pending.status, RequestStatus::AwaitingFulfillment);
    }

    #[test]
    fn test_return_type_accepts_buffer_alias() {
        let parsed: ReturnType = serde_json::from_str("\"buffer\"").unwrap();
        assert_eq!(parsed, ReturnType::Bytes);
        let parsed: ReturnType = serde_json::from_str("\"uint256\"").unwrap();
        assert_eq!(parsed, ReturnType::Uint256);
    }
}
