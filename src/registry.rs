//! In-process mock of the oracle/billing registry.
//!
//! Plays the role of the external submission and fulfillment interfaces:
//! subscription accounts, request-id assignment, simulated gas accounting,
//! the consumer callback, and emission of the two completion signal
//! classes the orchestrator correlates. Cost math is delegated to the
//! [`BillingSimulator`] so the observed billing reports carry
//! production-equivalent arithmetic.

use crate::billing::{BillingInputs, BillingSimulator};
use crate::errors::{BillingError, SubmissionError};
use crate::types::{BillingRecord, FulfillmentResponse, Request, RequestId};
use alloy_primitives::U256;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;

const REQUEST_ID_CONTEXT: &[u8] = b"don-harness-request";

// Deterministic simulated gas accounting: a base charge plus a per-byte
// charge, the shape of calldata pricing.
const SUBMIT_BASE_GAS: u64 = 96_000;
const SUBMIT_GAS_PER_BYTE: u64 = 16;
const CALLBACK_BASE_GAS: u64 = 30_000;
const CALLBACK_GAS_PER_BYTE: u64 = 12;

/// Errors raised by the mock registry while simulating a fulfillment
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Quorum of {quorum_size} cannot be met by {signer_count} signers")]
    InvalidQuorum { quorum_size: u32, signer_count: u32 },

    #[error("Billing failed: {0}")]
    Billing(#[from] BillingError),

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("No submitted request with id {0}")]
    UnknownRequest(RequestId),

    #[error("Completion signal receiver dropped")]
    SignalDropped,
}

/// Accepts `(Request, subscriptionId, gasLimit)` and assigns a request id
pub trait SubmissionInterface: Send + Sync {
    async fn submit(
        &self,
        request: &Request,
        subscription_id: u64,
        gas_limit: u64,
        consumer: &str,
    ) -> Result<SubmissionReceipt, SubmissionError>;
}

/// Accepts an encoded fulfillment and emits the completion signals
pub trait FulfillmentInterface: Send + Sync {
    async fn fulfill_and_bill(&self, call: FulfillmentCall) -> Result<(), RegistryError>;
}

/// Outcome of an accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReceipt {
    pub request_id: RequestId,
    /// Simulated gas consumed by the submission transaction
    pub gas_used: u64,
}

/// One simulated `fulfillAndBill` invocation
#[derive(Debug, Clone)]
pub struct FulfillmentCall {
    pub request_id: RequestId,
    pub result: Vec<u8>,
    pub error: Vec<u8>,
    pub transmitter: String,
    pub quorum: Vec<String>,
    pub quorum_size: u32,
    /// Fixed gas charged for report validation before the callback runs
    pub baseline_gas: u64,
    /// Gas limit available to the consumer callback
    pub callback_gas_limit: u64,
}

/// Outcome of one simulated consumer callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub gas_used: u64,
    pub ok: bool,
}

/// Simulated consumer contract: records what the oracle delivered and
/// charges a deterministic callback gas cost.
#[derive(Debug)]
pub struct MockConsumer {
    name: String,
    received: Mutex<Vec<FulfillmentResponse>>,
}

impl MockConsumer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Simulate `handleOracleFulfillment`. Runs out of gas (and reverts
    /// the delivery) when the deterministic cost exceeds `gas_limit`.
    pub fn handle_fulfillment(
        &self,
        request_id: RequestId,
        result: &[u8],
        error: &[u8],
        gas_limit: u64,
    ) -> CallbackOutcome {
        let payload_len = (result.len() + error.len()) as u64;
        let gas_needed = CALLBACK_BASE_GAS + CALLBACK_GAS_PER_BYTE * payload_len;

        if gas_needed > gas_limit {
            log::warn!(
                "consumer '{}' callback ran out of gas for request {request_id} \
                 (needed {gas_needed}, limit {gas_limit})",
                self.name
            );
            return CallbackOutcome {
                gas_used: gas_limit,
                ok: false,
            };
        }

        self.received
            .lock()
            .expect("consumer mutex poisoned")
            .push(FulfillmentResponse {
                request_id,
                result: result.to_vec(),
                error: error.to_vec(),
            });

        CallbackOutcome {
            gas_used: gas_needed,
            ok: true,
        }
    }

    pub fn received(&self) -> Vec<FulfillmentResponse> {
        self.received
            .lock()
            .expect("consumer mutex poisoned")
            .clone()
    }
}

/// Prepaid billing account authorizing specific consumers
#[derive(Debug, Default)]
struct Subscription {
    balance_juels: U256,
    consumers: HashSet<String>,
}

/// In-process oracle/billing registry twin
pub struct MockRegistry {
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    /// Which subscription each accepted request was submitted on
    requests: Mutex<HashMap<RequestId, u64>>,
    next_subscription_id: AtomicU64,
    request_nonce: AtomicU64,
    billing: BillingSimulator,
    consumer: MockConsumer,
    gas_price_wei: u128,
    price_age_seconds: u64,
    fulfillment_tx: mpsc::UnboundedSender<FulfillmentResponse>,
    billing_tx: mpsc::UnboundedSender<BillingRecord>,
}

impl MockRegistry {
    pub fn new(
        billing: BillingSimulator,
        consumer: MockConsumer,
        gas_price_wei: u128,
        price_age_seconds: u64,
        fulfillment_tx: mpsc::UnboundedSender<FulfillmentResponse>,
        billing_tx: mpsc::UnboundedSender<BillingRecord>,
    ) -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            request_nonce: AtomicU64::new(0),
            billing,
            consumer,
            gas_price_wei,
            price_age_seconds,
            fulfillment_tx,
            billing_tx,
        }
    }

    pub fn consumer(&self) -> &MockConsumer {
        &self.consumer
    }

    pub fn create_subscription(&self) -> u64 {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .lock()
            .expect("subscription mutex poisoned")
            .insert(id, Subscription::default());
        log::info!("created subscription {id}");
        id
    }

    pub fn fund_subscription(
        &self,
        subscription_id: u64,
        juels: U256,
    ) -> Result<(), SubmissionError> {
        let mut subs = self.subscriptions.lock().expect("subscription mutex poisoned");
        let sub = subs
            .get_mut(&subscription_id)
            .ok_or(SubmissionError::UnknownSubscription(subscription_id))?;
        sub.balance_juels += juels;
        Ok(())
    }

    pub fn add_consumer(
        &self,
        subscription_id: u64,
        consumer: &str,
    ) -> Result<(), SubmissionError> {
        let mut subs = self.subscriptions.lock().expect("subscription mutex poisoned");
        let sub = subs
            .get_mut(&subscription_id)
            .ok_or(SubmissionError::UnknownSubscription(subscription_id))?;
        sub.consumers.insert(consumer.to_string());
        Ok(())
    }

    pub fn subscription_balance(&self, subscription_id: u64) -> Result<U256, SubmissionError> {
        let subs = self.subscriptions.lock().expect("subscription mutex poisoned");
        subs.get(&subscription_id)
            .map(|s| s.balance_juels)
            .ok_or(SubmissionError::UnknownSubscription(subscription_id))
    }

    fn next_request_id(&self, subscription_id: u64) -> RequestId {
        let nonce = self.request_nonce.fetch_add(1, Ordering::SeqCst);
        let mut hasher = Sha256::new();
        hasher.update(REQUEST_ID_CONTEXT);
        hasher.update(subscription_id.to_be_bytes());
        hasher.update(nonce.to_be_bytes());
        RequestId(hasher.finalize().into())
    }
}

impl SubmissionInterface for MockRegistry {
    async fn submit(
        &self,
        request: &Request,
        subscription_id: u64,
        gas_limit: u64,
        consumer: &str,
    ) -> Result<SubmissionReceipt, SubmissionError> {
        {
            let subs = self.subscriptions.lock().expect("subscription mutex poisoned");
            let sub = subs
                .get(&subscription_id)
                .ok_or(SubmissionError::UnknownSubscription(subscription_id))?;
            if !sub.consumers.contains(consumer) {
                return Err(SubmissionError::UnauthorizedConsumer {
                    subscription_id,
                    consumer: consumer.to_string(),
                });
            }
            if sub.balance_juels.is_zero() {
                return Err(SubmissionError::InsufficientBalance { subscription_id });
            }
        }

        let request_id = self.next_request_id(subscription_id);
        self.requests
            .lock()
            .expect("request mutex poisoned")
            .insert(request_id, subscription_id);
        let gas_used = SUBMIT_BASE_GAS + SUBMIT_GAS_PER_BYTE * request.payload_len() as u64;

        log::info!(
            "accepted request {request_id} on subscription {subscription_id} \
             (gas limit {gas_limit})"
        );
        Ok(SubmissionReceipt {
            request_id,
            gas_used,
        })
    }
}

impl FulfillmentInterface for MockRegistry {
    async fn fulfill_and_bill(&self, call: FulfillmentCall) -> Result<(), RegistryError> {
        let signer_count = call.quorum.len() as u32;
        if call.quorum_size == 0 || call.quorum_size > signer_count {
            return Err(RegistryError::InvalidQuorum {
                quorum_size: call.quorum_size,
                signer_count,
            });
        }

        let subscription_id = self
            .requests
            .lock()
            .expect("request mutex poisoned")
            .get(&call.request_id)
            .copied()
            .ok_or(RegistryError::UnknownRequest(call.request_id))?;

        log::debug!(
            "transmitter '{}' fulfilling request {} with quorum of {}",
            call.transmitter,
            call.request_id,
            call.quorum_size
        );

        let outcome = self.consumer.handle_fulfillment(
            call.request_id,
            &call.result,
            &call.error,
            call.callback_gas_limit,
        );

        // Fulfillment-response signal first, matching the original event
        // order; the orchestrator must tolerate either order anyway.
        self.fulfillment_tx
            .send(FulfillmentResponse {
                request_id: call.request_id,
                result: call.result.clone(),
                error: call.error.clone(),
            })
            .map_err(|_| RegistryError::SignalDropped)?;

        let record = self.billing.compute_cost(&BillingInputs {
            request_id: call.request_id,
            subscription_id,
            gas_limit: call.callback_gas_limit,
            gas_used: call.baseline_gas + outcome.gas_used,
            gas_price_wei: self.gas_price_wei,
            price_age_seconds: self.price_age_seconds,
            signer_count,
            success: outcome.ok,
        })?;

        self.debit(record.subscription_id, record.total_cost);

        self.billing_tx
            .send(record)
            .map_err(|_| RegistryError::SignalDropped)?;
        Ok(())
    }
}

impl MockRegistry {
    fn debit(&self, subscription_id: u64, juels: U256) {
        let mut subs = self.subscriptions.lock().expect("subscription mutex poisoned");
        if let Some(sub) = subs.get_mut(&subscription_id) {
            if sub.balance_juels < juels {
                log::warn!(
                    "subscription {subscription_id} balance {} below cost {juels}; draining",
                    sub.balance_juels
                );
                sub.balance_juels = U256::ZERO;
            } else {
                sub.balance_juels -= juels;
            }
        }
    }
}
