//! Billing cost simulation.
//!
//! Mirrors the arithmetic of the production billing registry using
//! fixed-point `U256` integer math only; no floating point anywhere. The
//! payment split is total and reproducible: the signer pool is half of the
//! total cost divided evenly across the signers, and the integer remainder
//! always goes to the transmitter.

use crate::errors::{BillingError, BillingResult};
use crate::types::{BillingRecord, RequestId};
use alloy_primitives::U256;
use serde::Deserialize;

/// Juels per LINK (10^18)
const JUELS_PER_LINK: u64 = 1_000_000_000_000_000_000;

/// Billing registry configuration surface.
///
/// Defaults match the mock registry configuration used by the original
/// harness.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BillingConfig {
    /// Upper bound on requested gas
    pub max_gas_limit: u64,
    /// Maximum age of price data accepted, in seconds
    pub staleness_seconds: u64,
    /// Fixed gas overhead charged post-computation
    pub gas_after_payment_calculation: u64,
    /// Price conversion constant (wei per LINK)
    pub wei_per_unit_link: u128,
    /// Fixed per-request gas overhead
    pub gas_overhead: u64,
    /// Deadline for billing-report correlation
    pub request_timeout_seconds: u64,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            max_gas_limit: 300_000,
            staleness_seconds: 86_400,
            gas_after_payment_calculation: 39_173,
            wei_per_unit_link: 5_000_000_000_000_000,
            gas_overhead: 519_719,
            request_timeout_seconds: 300,
        }
    }
}

/// Execution cost inputs for one billing computation
#[derive(Debug, Clone)]
pub struct BillingInputs {
    pub request_id: RequestId,
    pub subscription_id: u64,
    /// Gas limit declared by the request
    pub gas_limit: u64,
    /// Gas actually consumed by the fulfillment
    pub gas_used: u64,
    pub gas_price_wei: u128,
    /// Age of the price data backing `wei_per_unit_link`
    pub price_age_seconds: u64,
    /// Number of simulated signers sharing the signer payment
    pub signer_count: u32,
    /// Whether the consumer callback succeeded
    pub success: bool,
}

/// Computes billing records with production-equivalent arithmetic
#[derive(Debug, Clone, Default)]
pub struct BillingSimulator {
    config: BillingConfig,
}

impl BillingSimulator {
    pub fn new(config: BillingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    /// Compute the cost of one fulfilled request.
    ///
    /// Deterministic: identical inputs always yield an identical record,
    /// and `signer_payment + transmitter_payment == total_cost` exactly.
    pub fn compute_cost(&self, inputs: &BillingInputs) -> BillingResult<BillingRecord> {
        if inputs.gas_limit > self.config.max_gas_limit {
            return Err(BillingError::GasLimitExceeded {
                gas_limit: inputs.gas_limit,
                max_gas_limit: self.config.max_gas_limit,
            });
        }
        if inputs.price_age_seconds > self.config.staleness_seconds {
            return Err(BillingError::StalePriceData {
                age_seconds: inputs.price_age_seconds,
                staleness_seconds: self.config.staleness_seconds,
            });
        }
        if inputs.signer_count == 0 {
            return Err(BillingError::NoSigners);
        }

        let total_gas = U256::from(inputs.gas_used)
            + U256::from(self.config.gas_overhead)
            + U256::from(self.config.gas_after_payment_calculation);

        let cost_wei = total_gas
            .checked_mul(U256::from(inputs.gas_price_wei))
            .ok_or(BillingError::Overflow { stage: "gas cost" })?;

        let total_cost = cost_wei
            .checked_mul(U256::from(JUELS_PER_LINK))
            .ok_or(BillingError::Overflow {
                stage: "juels conversion",
            })?
            .checked_div(U256::from(self.config.wei_per_unit_link))
            .ok_or(BillingError::Overflow {
                stage: "juels conversion",
            })?;

        // Half the cost goes to the signer pool; the transmitter keeps the
        // other half plus the division remainder.
        let signer_pool = total_cost / U256::from(2);
        let per_signer = signer_pool / U256::from(inputs.signer_count);
        let signer_payment = per_signer * U256::from(inputs.signer_count);
        let transmitter_payment = total_cost - signer_payment;

        Ok(BillingRecord {
            request_id: inputs.request_id,
            subscription_id: inputs.subscription_id,
            signer_payment,
            transmitter_payment,
            total_cost,
            success: inputs.success,
        })
    }
}
