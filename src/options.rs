//! Per-call generation options. Numeric strings such as `"0"` are accepted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::GenerationDefaults;
use crate::error::ValidationError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub max_new_tokens: Option<usize>,
    pub repetition_penalty: Option<f32>,
    pub rng_seed: Option<u64>,
    pub do_sample: Option<bool>,
    pub stop_strings: Vec<String>,
    /// Unrecognized keys, passed through to the engine.
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// 0.0 means greedy decoding.
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub max_new_tokens: usize,
    pub repetition_penalty: f32,
    pub repeat_last_n: usize,
    pub seed: u64,
    pub stop_strings: Vec<String>,
    pub extra: Map<String, Value>,
}

impl SamplingParams {
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

impl GenerationOptions {
    // `null` counts as no options.
    pub fn from_value(value: Option<&Value>) -> Result<Self, ValidationError> {
        match value {
            None | Some(Value::Null) => Ok(Self::default()),
            Some(Value::Object(map)) => Self::from_map(map),
            Some(_) => Err(ValidationError::OptionsNotObject),
        }
    }

    pub fn from_map(map: &Map<String, Value>) -> Result<Self, ValidationError> {
        let mut opts = Self::default();

        for (key, value) in map {
            match key.as_str() {
                "temperature" => {
                    let parsed = coerce_f64(key, value)?;
                    if parsed < 0.0 {
                        return Err(ValidationError::invalid_option(key, "must be >= 0"));
                    }
                    opts.temperature = Some(parsed);
                }
                "top_p" => {
                    let parsed = coerce_f64(key, value)?;
                    if !(parsed > 0.0 && parsed <= 1.0) {
                        return Err(ValidationError::invalid_option(key, "must be in (0.0, 1.0]"));
                    }
                    opts.top_p = Some(parsed);
                }
                "top_k" => {
                    opts.top_k = Some(coerce_u64(key, value)? as usize);
                }
                "max_new_tokens" => {
                    let parsed = coerce_u64(key, value)? as usize;
                    if parsed == 0 {
                        return Err(ValidationError::invalid_option(key, "must be > 0"));
                    }
                    opts.max_new_tokens = Some(parsed);
                }
                "repetition_penalty" => {
                    let parsed = coerce_f64(key, value)?;
                    if parsed <= 0.0 {
                        return Err(ValidationError::invalid_option(key, "must be > 0"));
                    }
                    opts.repetition_penalty = Some(parsed as f32);
                }
                "rng_seed" => {
                    opts.rng_seed = Some(coerce_u64(key, value)?);
                }
                "do_sample" => {
                    opts.do_sample = Some(coerce_bool(key, value)?);
                }
                "stop_strings" => {
                    opts.stop_strings = coerce_strings(key, value)?;
                }
                _ => {
                    opts.extra.insert(key.clone(), value.clone());
                }
            }
        }

        Ok(opts)
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn resolve(&self, defaults: &GenerationDefaults) -> SamplingParams {
        let temperature = match self.do_sample {
            Some(false) => 0.0,
            _ => self.temperature.unwrap_or(defaults.temperature),
        };

        SamplingParams {
            temperature,
            top_p: self.top_p.or(Some(defaults.top_p)).filter(|p| *p < 1.0),
            top_k: self.top_k.or(defaults.top_k).filter(|k| *k > 0),
            max_new_tokens: self.max_new_tokens.unwrap_or(defaults.max_new_tokens),
            repetition_penalty: self
                .repetition_penalty
                .unwrap_or(defaults.repetition_penalty),
            repeat_last_n: defaults.repeat_last_n,
            seed: self.rng_seed.unwrap_or(defaults.seed),
            stop_strings: self.stop_strings.clone(),
            extra: self.extra.clone(),
        }
    }
}

fn coerce_f64(key: &str, value: &Value) -> Result<f64, ValidationError> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(ValidationError::invalid_option(key, "expected a number")),
    }
}

fn coerce_u64(key: &str, value: &Value) -> Result<u64, ValidationError> {
    if let Some(v) = value.as_u64() {
        return Ok(v);
    }

    let float = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if let Ok(v) = trimmed.parse::<u64>() {
                return Ok(v);
            }
            trimmed.parse::<f64>().ok()
        }
        _ => None,
    };

    match float {
        Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64 => Ok(f as u64),
        _ => Err(ValidationError::invalid_option(
            key,
            "expected a non-negative integer",
        )),
    }
}

fn coerce_bool(key: &str, value: &Value) -> Result<bool, ValidationError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            _ => Err(ValidationError::invalid_option(key, "expected a boolean")),
        },
        Value::Number(n) => match n.as_u64() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(ValidationError::invalid_option(key, "expected a boolean")),
        },
        _ => Err(ValidationError::invalid_option(key, "expected a boolean")),
    }
}

fn coerce_strings(key: &str, value: &Value) -> Result<Vec<String>, ValidationError> {
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| ValidationError::invalid_option(key, "expected strings"))
            })
            .collect(),
        _ => Err(ValidationError::invalid_option(
            key,
            "expected a string or an array of strings",
        )),
    }
}
