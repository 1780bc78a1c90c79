//! Request description parsing and validation.
//!
//! A request description file is a JSON document with the loosely-typed
//! fields the caller supplies (`codeLocation`, `codeLanguage`, `source`,
//! `secrets`, `args`, `expectedReturnType`, `donPublicKey`). The builder
//! applies defaults, resolves secret values from a caller-provided store,
//! and validates everything before any execution or submission happens.

use crate::errors::{ValidationError, ValidationResult};
use crate::types::{CodeLanguage, CodeLocation, RequestConfig, ReturnType};
use alloy_primitives::hex;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Secret names the sandbox reserves for its own input injection
pub const RESERVED_SECRET_NAMES: &[&str] = &["source", "args", "secrets"];

/// Default gas limit for the simulated callback, matching the original
/// harness default
pub const DEFAULT_GAS_LIMIT: u64 = 100_000;

/// Raw, unvalidated request description as read from a file.
///
/// `secrets` maps a secret name (as the source sees it) to the key under
/// which its value is looked up in the [`SecretStore`]. Unknown fields are
/// ignored rather than rejected; older description files carry fields this
/// harness does not use.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRequestConfig {
    pub code_location: Option<CodeLocation>,
    pub code_language: Option<CodeLanguage>,
    pub source: Option<String>,
    pub secrets: Option<BTreeMap<String, String>>,
    pub args: Option<Vec<String>>,
    pub expected_return_type: Option<String>,
    pub don_public_key: Option<String>,
}

impl RawRequestConfig {
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Caller-provided key/value mapping backing secret values.
///
/// Values never appear in logs; only secret names do.
#[derive(Debug, Clone, Default)]
pub struct SecretStore {
    values: BTreeMap<String, String>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from the process environment
    pub fn from_env() -> Self {
        Self {
            values: std::env::vars().collect(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Look up a secret value; empty values count as missing
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Validates and normalizes a raw request description into a typed
/// [`RequestConfig`].
///
/// Pure transform: exhaustive validation happens here so a bad config
/// never reaches the sandbox.
#[derive(Debug, Default)]
pub struct RequestConfigBuilder;

impl RequestConfigBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(
        &self,
        raw: RawRequestConfig,
        store: &SecretStore,
    ) -> ValidationResult<RequestConfig> {
        let source = raw.source.unwrap_or_default();
        if source.trim().is_empty() {
            return Err(ValidationError::EmptySource);
        }

        let expected_return_type = parse_return_type(raw.expected_return_type)?;

        let mut secrets = BTreeMap::new();
        for (name, store_key) in raw.secrets.unwrap_or_default() {
            if RESERVED_SECRET_NAMES
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(&name))
            {
                return Err(ValidationError::ReservedSecretName { name });
            }
            let value = store
                .get(&store_key)
                .ok_or_else(|| ValidationError::MissingSecretValue { name: name.clone() })?;
            secrets.insert(name, value.to_string());
        }

        let don_public_key = raw
            .don_public_key
            .filter(|k| !k.is_empty())
            .map(|k| parse_don_public_key(&k))
            .transpose()?;

        Ok(RequestConfig {
            code_location: raw.code_location.unwrap_or_default(),
            code_language: raw.code_language.unwrap_or_default(),
            source,
            secrets,
            args: raw.args.unwrap_or_default(),
            expected_return_type,
            don_public_key,
        })
    }
}

fn parse_return_type(raw: Option<String>) -> ValidationResult<ReturnType> {
    let value = raw.ok_or_else(|| {
        ValidationError::invalid_value("expectedReturnType", "field is required")
    })?;
    match value.as_str() {
        "uint256" => Ok(ReturnType::Uint256),
        "bytes" | "buffer" | "Buffer" => Ok(ReturnType::Bytes),
        _ => Err(ValidationError::UnknownReturnType { value }),
    }
}

fn parse_don_public_key(raw: &str) -> ValidationResult<[u8; 32]> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped).map_err(|e| ValidationError::InvalidDonPublicKey {
        reason: e.to_string(),
    })?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ValidationError::InvalidDonPublicKey {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })
}

/// Knobs for one simulated round trip beyond the request description
/// itself. Defaults mirror the original harness: a quorum of 4 out of 31
/// simulated signers and a 100k callback gas limit.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationSettings {
    /// Gas limit for the simulated consumer callback
    pub gas_limit: u64,
    /// Gas price applied by the simulated billing computation
    pub gas_price_wei: u128,
    /// Age of the price data handed to billing; the mock feed is fresh
    pub price_age_seconds: u64,
    /// Number of simulated signers sharing the signer payment
    pub signer_count: u32,
    /// Quorum size backing the simulated fulfillment
    pub quorum_size: u32,
    /// Fixed gas charged for report validation before the callback runs
    pub baseline_gas: u64,
    /// Wall-clock timeout for sandbox execution
    pub execution_timeout_secs: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            gas_limit: DEFAULT_GAS_LIMIT,
            gas_price_wei: 1_000_000_000,
            price_age_seconds: 0,
            signer_count: 31,
            quorum_size: 4,
            baseline_gas: 100_000,
            execution_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_with_source(source: &str) -> RawRequestConfig {
        RawRequestConfig {
            source: Some(source.to_string()),
            expected_return_type: Some("uint256".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_applies_defaults() {
        let config = RequestConfigBuilder::new()
            .build(raw_with_source("(module)"), &SecretStore::new())
            .unwrap();

        assert_eq!(config.code_location, CodeLocation::Inline);
        assert_eq!(config.code_language, CodeLanguage::Wasm);
        assert!(config.secrets.is_empty());
        assert!(config.args.is_empty());
        assert!(config.don_public_key.is_none());
    }

    #[test]
    fn test_build_rejects_missing_source() {
        let raw = RawRequestConfig {
            expected_return_type: Some("uint256".to_string()),
            ..Default::default()
        };
        let err = RequestConfigBuilder::new()
            .build(raw, &SecretStore::new())
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptySource);
    }

    #[test]
    fn test_build_rejects_blank_source() {
        let err = RequestConfigBuilder::new()
            .build(raw_with_source("   \n"), &SecretStore::new())
            .unwrap_err();
        assert_eq!(err, ValidationError::EmptySource);
    }

    #[test]
    fn test_build_rejects_unknown_return_type() {
        let mut raw = raw_with_source("(module)");
        raw.expected_return_type = Some("int128".to_string());
        let err = RequestConfigBuilder::new()
            .build(raw, &SecretStore::new())
            .unwrap_err();
        assert!(matches!(err, ValidationError::UnknownReturnType { value } if value == "int128"));
    }

    #[test]
    fn test_build_accepts_buffer_alias() {
        let mut raw = raw_with_source("(module)");
        raw.expected_return_type = Some("Buffer".to_string());
        let config = RequestConfigBuilder::new()
            .build(raw, &SecretStore::new())
            .unwrap();
        assert_eq!(config.expected_return_type, ReturnType::Bytes);
    }

    #[test]
    fn test_build_resolves_secrets() {
        let mut raw = raw_with_source("(module)");
        raw.secrets = Some(BTreeMap::from([(
            "apiKey".to_string(),
            "WEATHER_API_KEY".to_string(),
        )]));

        let mut store = SecretStore::new();
        store.insert("WEATHER_API_KEY", "s3cret");

        let config = RequestConfigBuilder::new().build(raw, &store).unwrap();
        assert_eq!(config.secrets.get("apiKey").map(String::as_str), Some("s3cret"));
    }

    #[test]
    fn test_build_rejects_missing_secret_value() {
        let mut raw = raw_with_source("(module)");
        raw.secrets = Some(BTreeMap::from([(
            "apiKey".to_string(),
            "NOT_SET".to_string(),
        )]));

        let err = RequestConfigBuilder::new()
            .build(raw, &SecretStore::new())
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingSecretValue { name } if name == "apiKey"));
    }

    #[test]
    fn test_build_treats_empty_secret_value_as_missing() {
        let mut raw = raw_with_source("(module)");
        raw.secrets = Some(BTreeMap::from([(
            "apiKey".to_string(),
            "EMPTY_KEY".to_string(),
        )]));

        let mut store = SecretStore::new();
        store.insert("EMPTY_KEY", "");

        let err = RequestConfigBuilder::new().build(raw, &store).unwrap_err();
        assert!(matches!(err, ValidationError::MissingSecretValue { .. }));
    }

    #[test]
    fn test_build_rejects_reserved_secret_name() {
        let mut raw = raw_with_source("(module)");
        raw.secrets = Some(BTreeMap::from([(
            "Source".to_string(),
            "SOME_KEY".to_string(),
        )]));

        let mut store = SecretStore::new();
        store.insert("SOME_KEY", "value");

        let err = RequestConfigBuilder::new().build(raw, &store).unwrap_err();
        assert!(matches!(err, ValidationError::ReservedSecretName { .. }));
    }

    #[test]
    fn test_parse_don_public_key() {
        let mut raw = raw_with_source("(module)");
        raw.don_public_key = Some(format!("0x{}", "ab".repeat(32)));
        let config = RequestConfigBuilder::new()
            .build(raw, &SecretStore::new())
            .unwrap();
        assert_eq!(config.don_public_key, Some([0xab; 32]));
    }

    #[test]
    fn test_parse_don_public_key_wrong_length() {
        let mut raw = raw_with_source("(module)");
        raw.don_public_key = Some("0xabcd".to_string());
        let err = RequestConfigBuilder::new()
            .build(raw, &SecretStore::new())
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidDonPublicKey { .. }));
    }

    #[test]
    fn test_raw_config_from_json_camel_case() {
        let raw = RawRequestConfig::from_json(
            r#"{
                "codeLocation": "inline",
                "source": "(module)",
                "args": ["1684724400", "25761527"],
                "expectedReturnType": "uint256",
                "walletPrivateKey": "ignored-legacy-field"
            }"#,
        )
        .unwrap();
        assert_eq!(raw.code_location, Some(CodeLocation::Inline));
        assert_eq!(raw.args.as_deref(), Some(&["1684724400".to_string(), "25761527".to_string()][..]));
    }

    #[test]
    fn test_simulation_settings_defaults() {
        let settings = SimulationSettings::default();
        assert_eq!(settings.gas_limit, DEFAULT_GAS_LIMIT);
        assert_eq!(settings.signer_count, 31);
        assert_eq!(settings.quorum_size, 4);
    }
}
