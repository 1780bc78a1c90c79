//! Sandboxed execution of request source code.
//!
//! The executor runs the request's WebAssembly source under WASI with fuel
//! metering, a memory cap, and a wall-clock timeout. Inputs are injected
//! exclusively through the sandbox boundary: positional args become argv,
//! decrypted secrets become environment variables, and the canonical arg
//! encoding is available on stdin. The module's stdout is its return
//! value; stderr is captured as the execution log.
//!
//! Faults raised by the executed source (traps, nonzero exits, fuel
//! exhaustion, timeouts, unencodable results) are recoverable simulated
//! outcomes folded into [`FulfillmentResult`], never harness errors.

use crate::encoder::RequestEncoder;
use crate::errors::{EncodingError, EncodingResult, SandboxError, SandboxResult};
use crate::fetcher::SourceFetcher;
use crate::types::{CodeLocation, FulfillmentResult, Request, ReturnType};
use alloy_primitives::U256;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use wasmtime::{Config, Engine, Linker, Module, Store, StoreLimits, StoreLimitsBuilder};
use wasmtime_wasi::WasiCtxBuilder;
use wasmtime_wasi::preview1;

/// Default fuel limit for source execution (10 million instructions)
const DEFAULT_FUEL_LIMIT: u64 = 10_000_000;

/// Default memory limit in megabytes
const DEFAULT_MEMORY_LIMIT_MB: u32 = 64;

/// Maximum allowed memory limit in megabytes (1 GB)
const MAX_MEMORY_LIMIT_MB: u32 = 1024;

/// Captured output cap for each of stdout/stderr
const OUTPUT_PIPE_CAPACITY: usize = 64 * 1024;

/// Fuel consumed between forced yields back to the async executor.
/// Without a yield interval a compute-bound guest never reaches an await
/// point and the wall-clock timeout cannot fire.
const FUEL_YIELD_INTERVAL: u64 = 10_000;

/// Resource limits applied to each execution
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Maximum fuel (instructions) allowed
    pub fuel_limit: u64,
    /// Maximum memory in megabytes
    pub memory_limit_mb: u32,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            fuel_limit: DEFAULT_FUEL_LIMIT,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
        }
    }
}

/// Store data that holds both WASI context and resource limits
struct StoreData {
    wasi: preview1::WasiP1Ctx,
    limits: StoreLimits,
}

/// Runs request source in isolation and normalizes the outcome
pub struct SandboxExecutor<F: SourceFetcher> {
    engine: Engine,
    fetcher: Arc<F>,
    encoder: RequestEncoder,
    limits: SandboxLimits,
}

impl<F: SourceFetcher> std::fmt::Debug for SandboxExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<F: SourceFetcher> SandboxExecutor<F> {
    pub fn new(fetcher: Arc<F>) -> SandboxResult<Self> {
        Self::with_limits(fetcher, SandboxLimits::default())
    }

    pub fn with_limits(fetcher: Arc<F>, limits: SandboxLimits) -> SandboxResult<Self> {
        if limits.memory_limit_mb > MAX_MEMORY_LIMIT_MB {
            return Err(SandboxError::MemoryLimitTooLarge(
                limits.memory_limit_mb,
                MAX_MEMORY_LIMIT_MB,
            ));
        }

        let mut engine_config = Config::new();
        engine_config.async_support(true).consume_fuel(true);

        let engine = Engine::new(&engine_config)
            .map_err(|e| SandboxError::CompilationFailed(e.to_string()))?;

        Ok(Self {
            engine,
            fetcher,
            encoder: RequestEncoder::new(),
            limits,
        })
    }

    /// Execute a request's source with its args and decrypted secrets.
    ///
    /// Returns `Err` only for harness-level failures (unfetchable source,
    /// broken WASI setup). Everything the source itself does wrong comes
    /// back as a `FulfillmentResult` with `success = false`.
    pub async fn execute(
        &self,
        request: &Request,
        don_public_key: Option<&[u8; 32]>,
        timeout: Duration,
    ) -> SandboxResult<FulfillmentResult> {
        let module_bytes = self.resolve_source(request).await?;

        // A source that does not assemble is a simulated outcome, not a
        // harness failure.
        let module = match compile_module(&self.engine, &module_bytes) {
            Ok(module) => module,
            Err(fault) => return Ok(FulfillmentResult::failed(fault.to_string(), String::new())),
        };

        let secrets = self
            .encoder
            .decrypt_secrets(&request.secrets, don_public_key)?;
        let env: Vec<(String, String)> = secrets.into_iter().collect();

        let stdin_pipe =
            wasmtime_wasi::pipe::MemoryInputPipe::new(Bytes::from(request.encoded_args.clone()));
        let stdout_pipe = wasmtime_wasi::pipe::MemoryOutputPipe::new(OUTPUT_PIPE_CAPACITY);
        let stderr_pipe = wasmtime_wasi::pipe::MemoryOutputPipe::new(OUTPUT_PIPE_CAPACITY);

        let stdout_handle = stdout_pipe.clone();
        let stderr_handle = stderr_pipe.clone();

        let mut wasi_builder = WasiCtxBuilder::new();
        wasi_builder
            .stdin(stdin_pipe)
            .stdout(stdout_pipe)
            .stderr(stderr_pipe);

        if !request.args.is_empty() {
            wasi_builder.args(&request.args);
        }
        if !env.is_empty() {
            wasi_builder.envs(&env);
        }

        let wasi_ctx = wasi_builder.build_p1();

        let memory_limit_bytes = (self.limits.memory_limit_mb as usize) * 1024 * 1024;
        let limits = StoreLimitsBuilder::new()
            .memory_size(memory_limit_bytes)
            .build();

        let mut store = Store::new(
            &self.engine,
            StoreData {
                wasi: wasi_ctx,
                limits,
            },
        );
        store.limiter(|data| &mut data.limits as &mut dyn wasmtime::ResourceLimiter);
        store
            .set_fuel(self.limits.fuel_limit)
            .map_err(|e| SandboxError::Internal(format!("failed to set fuel: {e}")))?;
        store
            .fuel_async_yield_interval(Some(FUEL_YIELD_INTERVAL))
            .map_err(|e| SandboxError::Internal(format!("failed to set yield interval: {e}")))?;

        let mut linker = Linker::new(&self.engine);
        preview1::add_to_linker_async(&mut linker, |s: &mut StoreData| &mut s.wasi)
            .map_err(|e| SandboxError::WasiSetupFailed(e.to_string()))?;

        let instance = match linker.instantiate_async(&mut store, &module).await {
            Ok(instance) => instance,
            Err(e) => {
                let fault = SandboxError::InstantiationFailed(e.to_string());
                return Ok(FulfillmentResult::failed(fault.to_string(), String::new()));
            }
        };

        let start_func = match instance.get_typed_func::<(), ()>(&mut store, "_start") {
            Ok(func) => func,
            Err(_) => {
                let fault = SandboxError::EntryPointNotFound;
                return Ok(FulfillmentResult::failed(fault.to_string(), String::new()));
            }
        };

        let execution_result =
            tokio::time::timeout(timeout, start_func.call_async(&mut store, ())).await;

        let remaining_fuel = store.get_fuel().unwrap_or(0);
        let fuel_consumed = self.limits.fuel_limit.saturating_sub(remaining_fuel);

        let stdout = stdout_handle.contents().to_vec();
        let stderr = stderr_handle.contents().to_vec();
        let execution_log = String::from_utf8_lossy(&stderr).into_owned();

        let exit_code = match execution_result {
            Ok(Ok(())) => 0,
            Ok(Err(e)) => {
                let error_str = e.to_string();
                if error_str.contains("fuel") || error_str.contains("out of fuel") {
                    return Ok(FulfillmentResult::failed(
                        format!("source ran out of fuel after {fuel_consumed} units"),
                        execution_log,
                    ));
                }
                if error_str.contains("resource limit exceeded")
                    || (error_str.contains("memory") && error_str.contains("limit exceeded"))
                {
                    return Ok(FulfillmentResult::failed(
                        format!(
                            "source exceeded the {} MB memory limit",
                            self.limits.memory_limit_mb
                        ),
                        execution_log,
                    ));
                }
                if let Some(exit) = e.downcast_ref::<wasmtime_wasi::I32Exit>() {
                    exit.0
                } else {
                    // Trap; WAT traps carry no custom message, so the fault
                    // message the source printed to stderr is appended.
                    return Ok(FulfillmentResult::failed(
                        fault_message(&error_str, &execution_log),
                        execution_log,
                    ));
                }
            }
            Err(_elapsed) => {
                return Ok(FulfillmentResult::failed(
                    format!("execution timed out after {}s", timeout.as_secs_f64()),
                    execution_log,
                ));
            }
        };

        if exit_code != 0 {
            return Ok(FulfillmentResult::failed(
                fault_message(&format!("source exited with status {exit_code}"), &execution_log),
                execution_log,
            ));
        }

        log::debug!(
            "sandbox execution complete: {} stdout bytes, {fuel_consumed} fuel consumed",
            stdout.len()
        );

        match encode_result(&stdout, request.expected_return_type) {
            Ok(result) => Ok(FulfillmentResult::fulfilled(result, execution_log)),
            // An unrepresentable value is surfaced as error bytes, not thrown
            Err(encoding_err) => Ok(FulfillmentResult::failed(
                encoding_err.to_string(),
                execution_log,
            )),
        }
    }

    async fn resolve_source(&self, request: &Request) -> SandboxResult<Vec<u8>> {
        match request.code_location {
            CodeLocation::Inline => Ok(request.source.as_bytes().to_vec()),
            CodeLocation::Remote => Ok(self.fetcher.fetch(&request.source).await?),
        }
    }
}

fn compile_module(engine: &Engine, bytes: &[u8]) -> Result<Module, SandboxError> {
    // Sources may be WebAssembly text or an already-assembled binary
    // module, which `wat` passes through untouched.
    let wasm = wat::parse_bytes(bytes)
        .map_err(|e| SandboxError::InvalidModule {
            reason: e.to_string(),
        })?
        .into_owned();

    Module::new(engine, &wasm).map_err(|e| SandboxError::CompilationFailed(e.to_string()))
}

fn fault_message(fault: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        fault.to_string()
    } else {
        format!("{fault}: {stderr}")
    }
}

/// Encode a successful stdout value per the expected return type
pub fn encode_result(stdout: &[u8], return_type: ReturnType) -> EncodingResult<Vec<u8>> {
    match return_type {
        ReturnType::Bytes => {
            if stdout.is_empty() {
                Err(EncodingError::EmptyResult)
            } else {
                Ok(stdout.to_vec())
            }
        }
        ReturnType::Uint256 => {
            let text = std::str::from_utf8(stdout)
                .map_err(|_| EncodingError::NotAnInteger {
                    value: String::from_utf8_lossy(stdout).into_owned(),
                })?
                .trim();

            if text.is_empty() {
                return Err(EncodingError::EmptyResult);
            }

            let (digits, radix) = match text.strip_prefix("0x") {
                Some(hex_digits) => (hex_digits, 16u64),
                None => (text, 10u64),
            };

            let valid = !digits.is_empty()
                && digits.chars().all(|c| {
                    if radix == 16 {
                        c.is_ascii_hexdigit()
                    } else {
                        c.is_ascii_digit()
                    }
                });
            if !valid {
                return Err(EncodingError::NotAnInteger {
                    value: text.to_string(),
                });
            }

            let value =
                U256::from_str_radix(digits, radix).map_err(|_| EncodingError::ValueOutOfRange {
                    value: text.to_string(),
                })?;

            Ok(value.to_be_bytes::<32>().to_vec())
        }
    }
}

/// Render result bytes for humans per the expected return type
pub fn decode_result_log(result: &[u8], return_type: ReturnType) -> String {
    match return_type {
        ReturnType::Uint256 => U256::from_be_slice(result).to_string(),
        ReturnType::Bytes => format!("0x{}", alloy_primitives::hex::encode(result)),
    }
}
