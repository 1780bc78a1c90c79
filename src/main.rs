use don_harness::billing::{BillingConfig, BillingSimulator};
use don_harness::config::{RawRequestConfig, RequestConfigBuilder, SecretStore, SimulationSettings};
use don_harness::encoder::RequestEncoder;
use don_harness::fetcher::RemoteSourceFetcher;
use don_harness::orchestrator::FulfillmentOrchestrator;
use don_harness::registry::{MockConsumer, MockRegistry};
use don_harness::sandbox::{SandboxExecutor, decode_result_log};
use don_harness::types::RequestParameters;

use alloy_primitives::U256;
use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Juels funded into the freshly created simulation subscription (10 LINK)
const SUBSCRIPTION_FUNDING_JUELS: u128 = 10_000_000_000_000_000_000;

const CONSUMER_NAME: &str = "don-harness-consumer";
const TRANSMITTER_NAME: &str = "don-harness-transmitter";

#[derive(Parser)]
#[command(name = "don-harness", about = "Local DON request simulation harness")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Simulate an end-to-end request fulfillment locally
    Simulate {
        /// Path to the request description file
        #[arg(long)]
        request_config: PathBuf,

        /// Maximum gas available to the simulated consumer callback
        #[arg(long)]
        gaslimit: Option<u64>,

        /// Optional billing registry configuration file
        #[arg(long)]
        billing_config: Option<PathBuf>,
    },
    /// Validate a request description file without executing anything
    CheckConfig {
        /// Path to the request description file
        #[arg(long)]
        request_config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            request_config,
            gaslimit,
            billing_config,
        } => simulate(request_config, gaslimit, billing_config).await,
        Command::CheckConfig { request_config } => check_config(request_config),
    }
}

fn load_request_config(path: &PathBuf) -> anyhow::Result<don_harness::types::RequestConfig> {
    let raw_text = std::fs::read_to_string(path)
        .with_context(|| format!("reading request config {}", path.display()))?;
    let raw = RawRequestConfig::from_json(&raw_text)
        .with_context(|| format!("parsing request config {}", path.display()))?;

    let store = SecretStore::from_env();
    Ok(RequestConfigBuilder::new().build(raw, &store)?)
}

async fn simulate(
    request_config: PathBuf,
    gaslimit: Option<u64>,
    billing_config: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_request_config(&request_config)?;

    let billing = match billing_config {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading billing config {}", path.display()))?;
            serde_json::from_str::<BillingConfig>(&text)
                .with_context(|| format!("parsing billing config {}", path.display()))?
        }
        None => BillingConfig::default(),
    };

    let mut settings = SimulationSettings::default();
    if let Some(gas_limit) = gaslimit {
        settings.gas_limit = gas_limit;
    }

    let request = RequestEncoder::new().encode(&config)?;
    info!(
        "built request: {} args, {} secret bytes, {} source bytes",
        request.args.len(),
        request.secrets.len(),
        request.source.len()
    );

    // Wire up the in-process registry playing the oracle and billing roles
    let (fulfillment_tx, fulfillment_rx) = mpsc::unbounded_channel();
    let (billing_tx, billing_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(MockRegistry::new(
        BillingSimulator::new(billing.clone()),
        MockConsumer::new(CONSUMER_NAME),
        settings.gas_price_wei,
        settings.price_age_seconds,
        fulfillment_tx,
        billing_tx,
    ));

    let subscription_id = registry.create_subscription();
    registry.fund_subscription(subscription_id, U256::from(SUBSCRIPTION_FUNDING_JUELS))?;
    registry.add_consumer(subscription_id, CONSUMER_NAME)?;
    info!("created and funded subscription {subscription_id}");

    let executor = SandboxExecutor::new(Arc::new(RemoteSourceFetcher::new()?))?;
    let mut orchestrator = FulfillmentOrchestrator::new(
        Arc::clone(&registry),
        executor,
        settings.clone(),
        billing,
        fulfillment_rx,
        billing_rx,
    );

    let params = RequestParameters {
        don_public_key: config.don_public_key,
        request,
        subscription_id,
        consumer: CONSUMER_NAME.to_string(),
        gas_limit: settings.gas_limit,
        transmitter: TRANSMITTER_NAME.to_string(),
        signer_count: settings.signer_count,
        quorum_size: settings.quorum_size,
        baseline_gas: settings.baseline_gas,
    };

    let report = orchestrator.simulate(&params).await?;

    if !report.fulfillment.execution_log.is_empty() {
        println!("__Execution log__");
        println!("{}", report.fulfillment.execution_log.trim_end());
        println!();
    }

    if report.fulfillment.success {
        println!(
            "Response returned to the consumer, decoded as {:?}: {}",
            config.expected_return_type,
            decode_result_log(&report.fulfillment.result, config.expected_return_type)
        );
    } else {
        println!(
            "Error message returned to the consumer: \"{}\"",
            report.fulfillment.error_message()
        );
    }

    println!();
    println!("__Simulated billing report__");
    println!("Total cost: {} Juels", report.billing.total_cost);
    println!("Signer payment: {} Juels", report.billing.signer_payment);
    println!(
        "Transmitter payment: {} Juels",
        report.billing.transmitter_payment
    );
    println!();
    println!("Gas used by sendRequest: {}", report.submission_gas_used);
    println!(
        "Gas used by client callback function: {}",
        report.callback_gas_used
    );

    Ok(())
}

fn check_config(request_config: PathBuf) -> anyhow::Result<()> {
    let config = load_request_config(&request_config)?;

    println!("Request config is valid");
    println!("  code location: {:?}", config.code_location);
    println!("  args: {}", config.args.len());
    // Secret names only; values never reach the console
    println!(
        "  secrets: [{}]",
        config
            .secrets
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  expected return type: {:?}", config.expected_return_type);
    Ok(())
}
