//! End-to-end simulation tests: request description through the sandbox,
//! the mock registry, and the orchestrator to a final report.

use alloy_primitives::U256;
use don_harness::billing::{BillingConfig, BillingSimulator};
use don_harness::config::{RawRequestConfig, RequestConfigBuilder, SecretStore, SimulationSettings};
use don_harness::encoder::RequestEncoder;
use don_harness::errors::{OrchestrationError, SubmissionError};
use don_harness::fetcher::RemoteSourceFetcher;
use don_harness::orchestrator::FulfillmentOrchestrator;
use don_harness::registry::{MockConsumer, MockRegistry};
use don_harness::sandbox::SandboxExecutor;
use don_harness::types::{
    BillingRecord, CodeLocation, FulfillmentResponse, Request, RequestConfig, RequestParameters,
};
use std::io::Write;
use std::sync::Arc;
use tokio::sync::mpsc;

const CONSUMER: &str = "test-consumer";
const TRANSMITTER: &str = "test-transmitter";
const TEN_LINK_JUELS: u128 = 10_000_000_000_000_000_000;

/// WAT module that writes `text` to the given fd and optionally traps
fn wat_writing(text: &str, fd: u32, trap_after: bool) -> String {
    let len = text.len();
    let tail = if trap_after { "unreachable" } else { "" };
    format!(
        r#"
        (module
            (import "wasi_snapshot_preview1" "fd_write"
                (func $fd_write (param i32 i32 i32 i32) (result i32)))
            (memory (export "memory") 1)
            (data (i32.const 64) "{text}")
            (func (export "_start")
                (i32.store (i32.const 0) (i32.const 64))
                (i32.store (i32.const 4) (i32.const {len}))
                (drop (call $fd_write (i32.const {fd}) (i32.const 0) (i32.const 1) (i32.const 16)))
                {tail})
        )
        "#
    )
}

fn request_config(source: &str, return_type: &str) -> RequestConfig {
    let raw = RawRequestConfig {
        source: Some(source.to_string()),
        expected_return_type: Some(return_type.to_string()),
        ..Default::default()
    };
    RequestConfigBuilder::new()
        .build(raw, &SecretStore::new())
        .unwrap()
}

struct Harness {
    registry: Arc<MockRegistry>,
    orchestrator: FulfillmentOrchestrator<MockRegistry, RemoteSourceFetcher>,
    subscription_id: u64,
}

fn harness() -> Harness {
    harness_with(BillingConfig::default(), SimulationSettings::default())
}

fn harness_with(billing: BillingConfig, settings: SimulationSettings) -> Harness {
    let (fulfillment_tx, fulfillment_rx) = mpsc::unbounded_channel();
    let (billing_tx, billing_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(MockRegistry::new(
        BillingSimulator::new(billing.clone()),
        MockConsumer::new(CONSUMER),
        settings.gas_price_wei,
        settings.price_age_seconds,
        fulfillment_tx,
        billing_tx,
    ));

    let subscription_id = registry.create_subscription();
    registry
        .fund_subscription(subscription_id, U256::from(TEN_LINK_JUELS))
        .unwrap();
    registry.add_consumer(subscription_id, CONSUMER).unwrap();

    let executor = SandboxExecutor::new(Arc::new(RemoteSourceFetcher::new().unwrap())).unwrap();
    let orchestrator = FulfillmentOrchestrator::new(
        Arc::clone(&registry),
        executor,
        settings,
        billing,
        fulfillment_rx,
        billing_rx,
    );

    Harness {
        registry,
        orchestrator,
        subscription_id,
    }
}

fn parameters(request: Request, config: &RequestConfig, harness: &Harness) -> RequestParameters {
    let settings = SimulationSettings::default();
    RequestParameters {
        request,
        don_public_key: config.don_public_key,
        subscription_id: harness.subscription_id,
        consumer: CONSUMER.to_string(),
        gas_limit: settings.gas_limit,
        transmitter: TRANSMITTER.to_string(),
        signer_count: settings.signer_count,
        quorum_size: settings.quorum_size,
        baseline_gas: settings.baseline_gas,
    }
}

#[tokio::test]
async fn simulates_successful_uint256_round_trip() {
    let config = request_config(&wat_writing("2", 1, false), "uint256");
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let params = parameters(request, &config, &h);
    let report = h.orchestrator.simulate(&params).await.unwrap();

    let mut expected = vec![0u8; 32];
    expected[31] = 2;
    assert!(report.fulfillment.success);
    assert_eq!(report.fulfillment.result, expected);
    assert!(report.fulfillment.error.is_empty());

    assert!(report.billing.success);
    assert_eq!(
        report.billing.signer_payment + report.billing.transmitter_payment,
        report.billing.total_cost
    );
    assert!(report.submission_gas_used > 0);
    assert!(report.callback_gas_used > 0);

    // The consumer contract saw exactly this fulfillment
    let received = h.registry.consumer().received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].request_id, report.request_id);
    assert_eq!(received[0].result, expected);

    // Billing was debited from the subscription
    let balance = h.registry.subscription_balance(h.subscription_id).unwrap();
    assert_eq!(
        balance,
        U256::from(TEN_LINK_JUELS) - report.billing.total_cost
    );
}

#[tokio::test]
async fn simulates_runtime_fault_as_recoverable_outcome() {
    let config = request_config(&wat_writing("boom", 2, true), "uint256");
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let params = parameters(request, &config, &h);
    let report = h.orchestrator.simulate(&params).await.unwrap();

    // Execution failed, but the simulation itself completed and billed
    assert!(!report.fulfillment.success);
    assert!(report.fulfillment.result.is_empty());
    assert!(report.fulfillment.error_message().contains("boom"));
    assert!(report.fulfillment.execution_log.contains("boom"));
    assert_eq!(
        report.billing.signer_payment + report.billing.transmitter_payment,
        report.billing.total_cost
    );
}

#[tokio::test]
async fn simulates_unencodable_result_as_error_bytes() {
    let config = request_config(&wat_writing("not-a-number", 1, false), "uint256");
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let params = parameters(request, &config, &h);
    let report = h.orchestrator.simulate(&params).await.unwrap();

    assert!(!report.fulfillment.success);
    assert!(
        report
            .fulfillment
            .error_message()
            .contains("not a non-negative integer")
    );
}

#[tokio::test]
async fn rejects_gas_limit_above_registry_maximum_before_submission() {
    let config = request_config(&wat_writing("2", 1, false), "uint256");
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let mut params = parameters(request, &config, &h);
    params.gas_limit = 300_001;

    let err = h.orchestrator.simulate(&params).await.unwrap_err();
    assert!(matches!(err, OrchestrationError::Billing(_)));

    // Nothing was submitted or billed
    assert!(h.registry.consumer().received().is_empty());
    assert_eq!(
        h.registry.subscription_balance(h.subscription_id).unwrap(),
        U256::from(TEN_LINK_JUELS)
    );
}

#[tokio::test]
async fn rejects_unfunded_subscription() {
    let config = request_config(&wat_writing("2", 1, false), "uint256");
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let unfunded = h.registry.create_subscription();
    h.registry.add_consumer(unfunded, CONSUMER).unwrap();

    let mut params = parameters(request, &config, &h);
    params.subscription_id = unfunded;

    let err = h.orchestrator.simulate(&params).await.unwrap_err();
    assert!(matches!(
        err,
        OrchestrationError::Submission(SubmissionError::InsufficientBalance { .. })
    ));
}

#[tokio::test]
async fn simulates_with_encrypted_secrets() {
    let mut raw = RawRequestConfig {
        source: Some(wat_writing("7", 1, false)),
        expected_return_type: Some("uint256".to_string()),
        don_public_key: Some(format!("0x{}", "1c".repeat(32))),
        ..Default::default()
    };
    raw.secrets = Some(std::collections::BTreeMap::from([(
        "apiKey".to_string(),
        "WEATHER_API_KEY".to_string(),
    )]));

    let mut store = SecretStore::new();
    store.insert("WEATHER_API_KEY", "s3cret-value");

    let config = RequestConfigBuilder::new().build(raw, &store).unwrap();
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let params = parameters(request, &config, &h);
    let report = h.orchestrator.simulate(&params).await.unwrap();

    assert!(report.fulfillment.success);
    assert_eq!(report.fulfillment.result[31], 7);
}

#[tokio::test]
async fn simulates_remote_source_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(wat_writing("9", 1, false).as_bytes()).unwrap();

    let raw = RawRequestConfig {
        code_location: Some(CodeLocation::Remote),
        source: Some(file.path().to_str().unwrap().to_string()),
        expected_return_type: Some("uint256".to_string()),
        ..Default::default()
    };
    let config = RequestConfigBuilder::new()
        .build(raw, &SecretStore::new())
        .unwrap();
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let params = parameters(request, &config, &h);
    let report = h.orchestrator.simulate(&params).await.unwrap();

    assert!(report.fulfillment.success);
    assert_eq!(report.fulfillment.result[31], 9);
}

#[tokio::test]
async fn billing_report_matches_registry_emission() {
    // Drive the registry directly and compare against what the
    // orchestrator reported for the same inputs.
    let config = request_config(&wat_writing("2", 1, false), "uint256");
    let request = RequestEncoder::new().encode(&config).unwrap();

    let mut h = harness();
    let params = parameters(request, &config, &h);
    let report = h.orchestrator.simulate(&params).await.unwrap();

    let record: &BillingRecord = &report.billing;
    assert_eq!(record.subscription_id, h.subscription_id);
    assert!(record.total_cost > U256::ZERO);

    let response: &FulfillmentResponse = &h.registry.consumer().received()[0];
    assert_eq!(response.error, Vec::<u8>::new());
}
