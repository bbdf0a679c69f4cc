//! LaunchConfiguration and its resolver.
//!
//! The whole environment contract is validated in one pass here: defaults,
//! coercions, and recognized-enum checks all live in `resolve`. The caller
//! hands in an explicit key/value map, never the global process
//! environment, so resolution is a pure function.

use crate::error::Error;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// NUM_GPUS: devices to reserve, 0 for CPU-only.
pub const NUM_GPUS: &str = "NUM_GPUS";
/// MODEL_NAME: model identifier the engine loads.
pub const MODEL_NAME: &str = "MODEL_NAME";
/// REVISION: model revision, defaults to "main".
pub const REVISION: &str = "REVISION";
/// HUGGING_FACE_HUB_TOKEN: hub credential, secret.
pub const HUGGING_FACE_HUB_TOKEN: &str = "HUGGING_FACE_HUB_TOKEN";
/// QUANTIZATION: weight quantization mode.
pub const QUANTIZATION: &str = "QUANTIZATION";
/// KVCACHE: KV cache precision.
pub const KVCACHE: &str = "KVCACHE";
/// API_KEY: inbound request credential, secret.
pub const API_KEY: &str = "API_KEY";
/// CONTEXT_LENGTH: sequence length upper bound.
pub const CONTEXT_LENGTH: &str = "CONTEXT_LENGTH";
/// GPU_MEMORY_UTILIZATION: fraction of device memory in (0, 1].
pub const GPU_MEMORY_UTILIZATION: &str = "GPU_MEMORY_UTILIZATION";
/// ENFORCE_EAGER: disable graph-capture optimizations.
pub const ENFORCE_EAGER: &str = "ENFORCE_EAGER";

const DEFAULT_REVISION: &str = "main";
const DEFAULT_GPU_MEMORY_UTILIZATION: f64 = 0.9;

/// Weight quantization modes the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantization {
    /// Full precision weights.
    None,
    /// AWQ 4-bit.
    Awq,
    /// GPTQ 4-bit.
    Gptq,
    /// SqueezeLLM.
    SqueezeLlm,
}

impl Quantization {
    /// The engine's command-line vocabulary for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            Quantization::None => "none",
            Quantization::Awq => "awq",
            Quantization::Gptq => "gptq",
            Quantization::SqueezeLlm => "squeezellm",
        }
    }
}

impl FromStr for Quantization {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Quantization::None),
            "awq" => Ok(Quantization::Awq),
            "gptq" => Ok(Quantization::Gptq),
            "squeezellm" => Ok(Quantization::SqueezeLlm),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// KV cache precision/strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheMode {
    /// Follow the model dtype.
    Auto,
    /// Half precision cache.
    Fp16,
    /// 8-bit e5m2 float cache.
    Fp8E5m2,
}

impl KvCacheMode {
    /// The engine's command-line vocabulary for this mode.
    pub fn as_str(&self) -> &'static str {
        match self {
            KvCacheMode::Auto => "auto",
            KvCacheMode::Fp16 => "fp16",
            KvCacheMode::Fp8E5m2 => "fp8_e5m2",
        }
    }
}

impl FromStr for KvCacheMode {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(KvCacheMode::Auto),
            "fp16" => Ok(KvCacheMode::Fp16),
            "fp8_e5m2" => Ok(KvCacheMode::Fp8E5m2),
            _ => Err(()),
        }
    }
}

impl fmt::Display for KvCacheMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated, immutable parameters for one engine launch.
///
/// Resolved once at process start; the supervisor never mutates it.
#[derive(Debug, Clone)]
pub struct LaunchConfiguration {
    /// Devices to reserve, 0 for CPU-only mode.
    pub gpu_count: usize,
    /// Model identifier.
    pub model_name: String,
    /// Model revision.
    pub revision: String,
    /// Hub credential, forwarded to the engine via environment only.
    pub hub_token: Option<String>,
    /// Weight quantization mode.
    pub quantization: Quantization,
    /// KV cache precision.
    pub kv_cache: KvCacheMode,
    /// Inbound request credential, forwarded via environment only.
    pub api_key: Option<String>,
    /// Sequence length upper bound; engine default when unset.
    pub context_length: Option<u32>,
    /// Fraction of device memory the engine may reserve.
    pub gpu_memory_utilization: f64,
    /// Disable graph-capture optimizations.
    pub enforce_eager: bool,
}

fn invalid(field: &'static str, raw: &str, reason: &'static str) -> Error {
    Error::InvalidConfiguration {
        field,
        raw: raw.to_string(),
        reason,
    }
}

// Blank values behave like absent ones: `FOO=` in a compose file falls back
// to the documented default.
fn present<'a>(env: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    env.get(key).map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl LaunchConfiguration {
    /// Resolve and validate the launch configuration from an environment
    /// map. Reports every failure, not just the first.
    pub fn resolve(env: &HashMap<String, String>) -> Result<Self, Vec<Error>> {
        let mut errors = Vec::new();

        let model_name = match present(env, MODEL_NAME) {
            Some(v) => Some(v.to_string()),
            None => {
                errors.push(Error::MissingConfiguration(MODEL_NAME));
                None
            }
        };

        let gpu_count = match present(env, NUM_GPUS) {
            Some(raw) => match raw.parse::<i64>() {
                Ok(n) if n >= 0 => Some(n as usize),
                Ok(_) => {
                    errors.push(invalid(NUM_GPUS, raw, "must not be negative"));
                    None
                }
                Err(_) => {
                    errors.push(invalid(NUM_GPUS, raw, "not an integer"));
                    None
                }
            },
            None => {
                errors.push(Error::MissingConfiguration(NUM_GPUS));
                None
            }
        };

        let revision = present(env, REVISION)
            .unwrap_or(DEFAULT_REVISION)
            .to_string();

        let quantization = match present(env, QUANTIZATION) {
            Some(raw) => match raw.parse() {
                Ok(q) => q,
                Err(()) => {
                    errors.push(invalid(QUANTIZATION, raw, "unrecognized quantization mode"));
                    Quantization::None
                }
            },
            None => Quantization::None,
        };

        let kv_cache = match present(env, KVCACHE) {
            Some(raw) => match raw.parse() {
                Ok(k) => k,
                Err(()) => {
                    errors.push(invalid(KVCACHE, raw, "unrecognized kv cache mode"));
                    KvCacheMode::Auto
                }
            },
            None => KvCacheMode::Auto,
        };

        let context_length = match present(env, CONTEXT_LENGTH) {
            Some(raw) => match raw.parse::<u32>() {
                Ok(0) => {
                    errors.push(invalid(CONTEXT_LENGTH, raw, "must be positive"));
                    None
                }
                Ok(n) => Some(n),
                Err(_) => {
                    errors.push(invalid(CONTEXT_LENGTH, raw, "not a positive integer"));
                    None
                }
            },
            None => None,
        };

        let gpu_memory_utilization = match present(env, GPU_MEMORY_UTILIZATION) {
            Some(raw) => match raw.parse::<f64>() {
                Ok(f) if f.is_finite() && f > 0.0 && f <= 1.0 => f,
                Ok(_) => {
                    errors.push(invalid(
                        GPU_MEMORY_UTILIZATION,
                        raw,
                        "must lie in (0, 1]",
                    ));
                    DEFAULT_GPU_MEMORY_UTILIZATION
                }
                Err(_) => {
                    errors.push(invalid(GPU_MEMORY_UTILIZATION, raw, "not a number"));
                    DEFAULT_GPU_MEMORY_UTILIZATION
                }
            },
            None => DEFAULT_GPU_MEMORY_UTILIZATION,
        };

        let enforce_eager = match present(env, ENFORCE_EAGER) {
            Some(raw) => {
                if raw.eq_ignore_ascii_case("true") || raw == "1" {
                    true
                } else if raw.eq_ignore_ascii_case("false") || raw == "0" {
                    false
                } else {
                    errors.push(invalid(ENFORCE_EAGER, raw, "not a boolean"));
                    false
                }
            }
            None => false,
        };

        let hub_token = present(env, HUGGING_FACE_HUB_TOKEN).map(str::to_string);
        let api_key = present(env, API_KEY).map(str::to_string);

        if !errors.is_empty() {
            return Err(errors);
        }

        Ok(LaunchConfiguration {
            gpu_count: gpu_count.unwrap(),
            model_name: model_name.unwrap(),
            revision,
            hub_token,
            quantization,
            kv_cache,
            api_key,
            context_length,
            gpu_memory_utilization,
            enforce_eager,
        })
    }
}
