//! Typed configuration with enumerated, validated options.
//!
//! Hosts hand options over as key/value pairs (however they parsed them);
//! they are applied in one pass and every problem is reported in a
//! structured error list. Unknown keys follow an explicit policy instead of
//! being silently dropped.
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// How per-input token vectors are collapsed, for embedding-capable
/// contexts. Mirrors the runtime's pooling modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolingType {
    #[default]
    Unspecified,
    None,
    Mean,
    Cls,
    Last,
    Rank,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionType {
    #[default]
    Causal,
    NonCausal,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashAttention {
    #[default]
    Auto,
    On,
    Off,
}

/// Options recognized when creating an inference context.
///
/// Zero means "runtime default" for the numeric fields. When only
/// `context_size` is given, the batch size follows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOptions {
    pub context_size: u32,
    pub batch_size: u32,
    pub pooling_type: PoolingType,
    pub attention_type: AttentionType,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub flash_attention: FlashAttention,
}

/// Options recognized by the generation paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Upper bound on emitted tokens per turn; 0 means unlimited.
    pub max_tokens: u32,
}

/// What to do with a key no option struct recognizes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UnknownKeyPolicy {
    /// Accept and drop it. The permissive default.
    #[default]
    Ignore,
    /// Report it in the error list.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownKey(String),
    InvalidValue {
        key: String,
        value: String,
        expected: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownKey(k) => write!(f, "unrecognized option key `{k}`"),
            ConfigError::InvalidValue {
                key,
                value,
                expected,
            } => {
                write!(f, "invalid value `{value}` for `{key}`: expected {expected}")
            }
        }
    }
}

/// Every problem found while applying one batch of option pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl From<ConfigErrors> for EngineError {
    fn from(errors: ConfigErrors) -> Self {
        EngineError::Validation(errors.to_string())
    }
}

fn invalid(key: &str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn parse_u32(key: &str, value: &str, errors: &mut Vec<ConfigError>) -> Option<u32> {
    match value.trim().parse::<u32>() {
        Ok(v) => Some(v),
        Err(_) => {
            errors.push(invalid(key, value, "a non-negative integer"));
            None
        }
    }
}

fn parse_f32(key: &str, value: &str, errors: &mut Vec<ConfigError>) -> Option<f32> {
    match value.trim().parse::<f32>() {
        Ok(v) if v.is_finite() && v >= 0.0 => Some(v),
        _ => {
            errors.push(invalid(key, value, "a non-negative number"));
            None
        }
    }
}

impl ContextOptions {
    /// Apply key/value pairs in one pass. Keys are case-insensitive.
    /// Returns the structured set of everything that was wrong.
    pub fn apply_pairs<'a, I>(&mut self, pairs: I, policy: UnknownKeyPolicy) -> Result<(), ConfigErrors>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut errors = Vec::new();
        for (key, value) in pairs {
            let lowered = key.trim().to_ascii_lowercase();
            match lowered.as_str() {
                "context_size" => {
                    if let Some(v) = parse_u32(&lowered, value, &mut errors) {
                        self.context_size = v;
                        // batch follows context unless set explicitly
                        if self.batch_size == 0 {
                            self.batch_size = v;
                        }
                    }
                }
                "batch_size" => {
                    if let Some(v) = parse_u32(&lowered, value, &mut errors) {
                        self.batch_size = v;
                    }
                }
                "pooling_type" => match value.trim().to_ascii_lowercase().as_str() {
                    "unspecified" => self.pooling_type = PoolingType::Unspecified,
                    "none" => self.pooling_type = PoolingType::None,
                    "mean" => self.pooling_type = PoolingType::Mean,
                    "cls" => self.pooling_type = PoolingType::Cls,
                    "last" => self.pooling_type = PoolingType::Last,
                    "rank" => self.pooling_type = PoolingType::Rank,
                    _ => errors.push(invalid(
                        &lowered,
                        value,
                        "one of unspecified, none, mean, cls, last, rank",
                    )),
                },
                "attention_type" => match value.trim().to_ascii_lowercase().as_str() {
                    "causal" => self.attention_type = AttentionType::Causal,
                    "non_causal" | "noncausal" => self.attention_type = AttentionType::NonCausal,
                    _ => errors.push(invalid(&lowered, value, "causal or non_causal")),
                },
                "rope_freq_base" => {
                    if let Some(v) = parse_f32(&lowered, value, &mut errors) {
                        self.rope_freq_base = v;
                    }
                }
                "rope_freq_scale" => {
                    if let Some(v) = parse_f32(&lowered, value, &mut errors) {
                        self.rope_freq_scale = v;
                    }
                }
                "flash_attention" => match value.trim().to_ascii_lowercase().as_str() {
                    "auto" => self.flash_attention = FlashAttention::Auto,
                    "on" | "1" | "true" => self.flash_attention = FlashAttention::On,
                    "off" | "0" | "false" => self.flash_attention = FlashAttention::Off,
                    _ => errors.push(invalid(&lowered, value, "auto, on, or off")),
                },
                _ => {
                    if policy == UnknownKeyPolicy::Reject {
                        errors.push(ConfigError::UnknownKey(key.trim().to_string()));
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors(errors))
        }
    }
}

impl GenerateOptions {
    /// Apply key/value pairs in one pass. Keys are case-insensitive.
    pub fn apply_pairs<'a, I>(&mut self, pairs: I, policy: UnknownKeyPolicy) -> Result<(), ConfigErrors>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut errors = Vec::new();
        for (key, value) in pairs {
            let lowered = key.trim().to_ascii_lowercase();
            match lowered.as_str() {
                "max_tokens" => {
                    if let Some(v) = parse_u32(&lowered, value, &mut errors) {
                        self.max_tokens = v;
                    }
                }
                _ => {
                    if policy == UnknownKeyPolicy::Reject {
                        errors.push(ConfigError::UnknownKey(key.trim().to_string()));
                    }
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigErrors(errors))
        }
    }
}

mod tests;
