//! Centralized error handling for the DON simulation harness.
//!
//! Each stage of the pipeline has its own domain-specific error type; the
//! top-level `HarnessError` chains them so callers can match on the stage
//! that failed without losing the underlying cause.

use thiserror::Error;

/// Top-level harness error chaining all domain-specific errors
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Billing error: {0}")]
    Billing(#[from] BillingError),

    #[error("Submission error: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Orchestration error: {0}")]
    Orchestration(#[from] OrchestrationError),

    #[error("Harness error: {0}")]
    Application(String),
}

/// Request configuration validation errors.
///
/// These fail the run before any execution or submission happens; a config
/// that does not validate never reaches the sandbox.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Request source is empty")]
    EmptySource,

    #[error("Unrecognized expected return type: {value}")]
    UnknownReturnType { value: String },

    #[error("Secret '{name}' has no value in the secret store")]
    MissingSecretValue { name: String },

    #[error("Secret name '{name}' is reserved")]
    ReservedSecretName { name: String },

    #[error("Invalid DON public key: {reason}")]
    InvalidDonPublicKey { reason: String },

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors representing a value that cannot be put on the wire
#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingError {
    #[error("Result is not a non-negative integer: {value}")]
    NotAnInteger { value: String },

    #[error("Integer result does not fit in 256 bits: {value}")]
    ValueOutOfRange { value: String },

    #[error("Successful execution produced an empty result")]
    EmptyResult,

    #[error("Secrets encryption failed: {0}")]
    SecretsEncryption(String),

    #[error("Secrets decryption failed: {0}")]
    SecretsDecryption(String),
}

/// Errors fetching a remote request source
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported source location: {0}")]
    UnsupportedLocation(String),
}

/// Harness-level sandbox failures.
///
/// Faults raised by the executed source itself are not errors at this level:
/// they are folded into `FulfillmentResult` error bytes as valid simulated
/// outcomes. `SandboxError` covers only the cases where the harness could
/// not run the source at all.
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Failed to fetch source: {0}")]
    FetchFailed(#[from] FetchError),

    #[error("Invalid module: {reason}")]
    InvalidModule { reason: String },

    #[error("Module compilation failed: {0}")]
    CompilationFailed(String),

    #[error("Module instantiation failed: {0}")]
    InstantiationFailed(String),

    #[error("Entry point '_start' not found")]
    EntryPointNotFound,

    #[error("Memory limit too large: {0} MB (maximum {1} MB)")]
    MemoryLimitTooLarge(u32, u32),

    #[error("WASI setup failed: {0}")]
    WasiSetupFailed(String),

    #[error("Secrets decryption failed: {0}")]
    SecretsDecryption(#[from] EncodingError),

    #[error("Sandbox failure: {0}")]
    Internal(String),
}

/// Billing computation errors; fatal, raised before any simulated fulfillment
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BillingError {
    #[error("Gas limit {gas_limit} exceeds registry maximum {max_gas_limit}")]
    GasLimitExceeded { gas_limit: u64, max_gas_limit: u64 },

    #[error("Price data is {age_seconds}s old (maximum {staleness_seconds}s)")]
    StalePriceData {
        age_seconds: u64,
        staleness_seconds: u64,
    },

    #[error("Cannot split payment across zero signers")]
    NoSigners,

    #[error("Billing arithmetic overflowed computing {stage}")]
    Overflow { stage: &'static str },
}

/// Errors from the request submission interface
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SubmissionError {
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),

    #[error("Subscription {subscription_id} is not funded")]
    InsufficientBalance { subscription_id: u64 },

    #[error("Consumer '{consumer}' is not authorized for subscription {subscription_id}")]
    UnauthorizedConsumer {
        subscription_id: u64,
        consumer: String,
    },
}

/// Errors from the end-to-end fulfillment orchestration
#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("No billing report received within {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Submission failed: {0}")]
    Submission(#[from] SubmissionError),

    #[error("Sandbox failure: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Billing rejected the request: {0}")]
    Billing(#[from] BillingError),

    #[error("Unexpected error calling fulfillRequest: {0}")]
    FulfillmentCall(String),

    #[error("Signal channel closed before resolution")]
    SignalChannelClosed,
}

/// Result type aliases for common error combinations
pub type HarnessResult<T> = Result<T, HarnessError>;
pub type ValidationResult<T> = Result<T, ValidationError>;
pub type EncodingResult<T> = Result<T, EncodingError>;
pub type FetchResult<T> = Result<T, FetchError>;
pub type SandboxResult<T> = Result<T, SandboxError>;
pub type BillingResult<T> = Result<T, BillingError>;
pub type OrchestrationResult<T> = Result<T, OrchestrationError>;

impl ValidationError {
    /// Create an invalid-value error with context
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl From<String> for HarnessError {
    fn from(err: String) -> Self {
        HarnessError::Application(err)
    }
}
