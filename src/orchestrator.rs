//! End-to-end fulfillment orchestration.
//!
//! Drives one simulated round trip: submit the encoded request, execute
//! the source in the sandbox, push the outcome through the fulfillment
//! interface, then correlate the two asynchronous completion signal
//! channels by request id. The caller-visible completion resolves exactly
//! once, on the first matching billing report; a fulfillment-response
//! signal alone is informational. Signals for other request ids are
//! filtered, duplicates are no-ops, and a missing billing report fails the
//! run after the configured deadline.

use crate::billing::BillingConfig;
use crate::config::SimulationSettings;
use crate::errors::{BillingError, OrchestrationError, OrchestrationResult};
use crate::fetcher::SourceFetcher;
use crate::registry::{
    FulfillmentCall, FulfillmentInterface, MockConsumer, RegistryError, SubmissionInterface,
};
use crate::sandbox::SandboxExecutor;
use crate::types::{
    BillingRecord, FulfillmentResponse, PendingRequest, RequestId, RequestParameters,
    RequestStatus, SimulationReport,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Fixed request id used when re-invoking the consumer callback on a
/// fresh consumer to measure its gas cost
const CALLBACK_MEASUREMENT_REQUEST_ID: RequestId = RequestId([
    0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
    1,
]);

/// Single-resolution correlator for the two completion signal channels.
///
/// Non-matching signals are filtered, not errors. The resolved flag makes
/// duplicate billing reports (at-least-once delivery) no-ops.
pub struct SignalCorrelator {
    request_id: RequestId,
    resolved: AtomicBool,
}

impl SignalCorrelator {
    pub fn new(request_id: RequestId) -> Self {
        Self {
            request_id,
            resolved: AtomicBool::new(false),
        }
    }

    /// Whether a fulfillment-response signal belongs to this request
    pub fn offer_fulfillment(&self, signal: &FulfillmentResponse) -> bool {
        signal.request_id == self.request_id
    }

    /// Accept a billing report; returns the record only for the first
    /// matching delivery.
    pub fn offer_billing(&self, record: BillingRecord) -> Option<BillingRecord> {
        if record.request_id != self.request_id {
            log::debug!(
                "filtering billing report for {} (awaiting {})",
                record.request_id,
                self.request_id
            );
            return None;
        }
        if self.resolved.swap(true, Ordering::SeqCst) {
            log::debug!("duplicate billing report for {}; ignoring", record.request_id);
            return None;
        }
        Some(record)
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }
}

/// Drives the submit → execute → fulfill → correlate sequence.
///
/// Owns the receiving ends of both signal channels; the registry holds the
/// senders. One pending request runs to completion before another is
/// accepted, and the pending request's status has a single writer.
pub struct FulfillmentOrchestrator<R, F>
where
    R: SubmissionInterface + FulfillmentInterface,
    F: SourceFetcher,
{
    registry: Arc<R>,
    executor: SandboxExecutor<F>,
    settings: SimulationSettings,
    billing_config: BillingConfig,
    fulfillment_rx: mpsc::UnboundedReceiver<FulfillmentResponse>,
    billing_rx: mpsc::UnboundedReceiver<BillingRecord>,
}

impl<R, F> FulfillmentOrchestrator<R, F>
where
    R: SubmissionInterface + FulfillmentInterface,
    F: SourceFetcher,
{
    pub fn new(
        registry: Arc<R>,
        executor: SandboxExecutor<F>,
        settings: SimulationSettings,
        billing_config: BillingConfig,
        fulfillment_rx: mpsc::UnboundedReceiver<FulfillmentResponse>,
        billing_rx: mpsc::UnboundedReceiver<BillingRecord>,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
            billing_config,
            fulfillment_rx,
            billing_rx,
        }
    }

    /// Run one simulated round trip to completion
    pub async fn simulate(
        &mut self,
        params: &RequestParameters,
    ) -> OrchestrationResult<SimulationReport> {
        // Gas-limit violations are structural and abort before any
        // submission or execution happens.
        if params.gas_limit > self.billing_config.max_gas_limit {
            return Err(BillingError::GasLimitExceeded {
                gas_limit: params.gas_limit,
                max_gas_limit: self.billing_config.max_gas_limit,
            }
            .into());
        }

        let receipt = self
            .registry
            .submit(
                &params.request,
                params.subscription_id,
                params.gas_limit,
                &params.consumer,
            )
            .await?;
        let mut pending =
            PendingRequest::new(receipt.request_id, params.subscription_id, params.gas_limit);

        pending.transition(RequestStatus::AwaitingFulfillment);
        log::info!("executing request source for {}", pending.request_id);
        let fulfillment = self
            .executor
            .execute(
                &params.request,
                params.don_public_key.as_ref(),
                Duration::from_secs(self.settings.execution_timeout_secs),
            )
            .await?;

        if !fulfillment.success {
            log::warn!(
                "simulated execution failed for {}: {}",
                pending.request_id,
                fulfillment.error_message()
            );
        }

        let call = FulfillmentCall {
            request_id: pending.request_id,
            result: fulfillment.result.clone(),
            error: fulfillment.error.clone(),
            transmitter: params.transmitter.clone(),
            quorum: vec![params.transmitter.clone(); params.signer_count as usize],
            quorum_size: params.quorum_size,
            baseline_gas: params.baseline_gas,
            callback_gas_limit: params.gas_limit,
        };
        self.registry
            .fulfill_and_bill(call)
            .await
            .map_err(map_registry_error)?;

        let billing = self.await_billing_report(&mut pending, &fulfillment).await?;

        let callback_gas_used = measure_callback_gas(params, &fulfillment);
        log::info!(
            "request {} complete: submission gas {}, callback gas {}",
            pending.request_id,
            receipt.gas_used,
            callback_gas_used
        );

        Ok(SimulationReport {
            request_id: pending.request_id,
            fulfillment,
            billing,
            submission_gas_used: receipt.gas_used,
            callback_gas_used,
        })
    }

    /// Correlate completion signals until the matching billing report
    /// arrives or the registry deadline passes.
    ///
    /// Ordering between the two channels is not guaranteed; either may
    /// deliver first.
    async fn await_billing_report(
        &mut self,
        pending: &mut PendingRequest,
        expected: &crate::types::FulfillmentResult,
    ) -> OrchestrationResult<BillingRecord> {
        let correlator = SignalCorrelator::new(pending.request_id);
        let deadline =
            Instant::now() + Duration::from_secs(self.billing_config.request_timeout_seconds);

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(OrchestrationError::Timeout {
                        seconds: self.billing_config.request_timeout_seconds,
                    });
                }
                signal = self.fulfillment_rx.recv() => {
                    let signal = signal.ok_or(OrchestrationError::SignalChannelClosed)?;
                    if !correlator.offer_fulfillment(&signal) {
                        log::debug!(
                            "filtering fulfillment response for {} (awaiting {})",
                            signal.request_id,
                            pending.request_id
                        );
                        continue;
                    }
                    if signal.result != expected.result || signal.error != expected.error {
                        log::warn!(
                            "fulfillment response for {} does not match the simulated outcome",
                            signal.request_id
                        );
                    }
                    let next = if signal.error.is_empty() {
                        RequestStatus::Fulfilled
                    } else {
                        RequestStatus::FulfillError
                    };
                    pending.transition(next);
                }
                record = self.billing_rx.recv() => {
                    let record = record.ok_or(OrchestrationError::SignalChannelClosed)?;
                    if let Some(record) = correlator.offer_billing(record) {
                        if !record.success {
                            log::warn!(
                                "fulfillRequest did not succeed for {}; check the consumer \
                                 callback and the --gaslimit value",
                                record.request_id
                            );
                        }
                        pending.transition(RequestStatus::BillingReported);
                        return Ok(record);
                    }
                }
            }
        }
    }
}

fn map_registry_error(err: RegistryError) -> OrchestrationError {
    match err {
        RegistryError::Billing(billing) => OrchestrationError::Billing(billing),
        other => OrchestrationError::FulfillmentCall(other.to_string()),
    }
}

/// Re-invoke the consumer callback on a fresh consumer with the same
/// identity and report its deterministic gas cost.
fn measure_callback_gas(
    params: &RequestParameters,
    fulfillment: &crate::types::FulfillmentResult,
) -> u64 {
    let consumer = MockConsumer::new(params.consumer.clone());
    consumer
        .handle_fulfillment(
            CALLBACK_MEASUREMENT_REQUEST_ID,
            &fulfillment.result,
            &fulfillment.error,
            params.gas_limit,
        )
        .gas_used
}
