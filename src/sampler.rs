//! Composable token-sampling pipeline.
//!
//! A pipeline is an ordered, append-only chain of stages; stages are never
//! removed individually, only the whole chain is reset. The engine does not
//! evaluate distributions itself — the stage list is handed to the context's
//! pipeline-evaluation primitive each step.
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::runtime::{InferenceContext, LanguageModel, TokenId};

/// Seed value meaning "let the runtime pick".
pub const DEFAULT_SEED: u32 = 0xFFFF_FFFF;

/// One token-selection stage, evaluated in insertion order over the model's
/// next-token distribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SamplerStage {
    /// Arg-max selection.
    Greedy,
    /// Sample from the (filtered) distribution with a seeded RNG.
    Dist { seed: u32 },
    /// Keep the k most likely candidates.
    TopK { k: i32 },
    /// Nucleus sampling: retain cumulative probability >= p, with a floor
    /// on how many tokens survive.
    TopP { p: f32, min_keep: usize },
    /// Probability floor relative to the most likely token.
    MinP { p: f32, min_keep: usize },
    /// Locally-typical filtering by entropy proximity.
    Typical { p: f32, min_keep: usize },
    /// Linear temperature scaling.
    Temp { t: f32 },
    /// Dynamic temperature: exponential scaling inside [t-delta, t+delta].
    TempExt { t: f32, delta: f32, exponent: f32 },
    /// Exclude-top-choices: threshold + probability + seed.
    Xtc { p: f32, t: f32, min_keep: usize, seed: u32 },
    /// Keep tokens within n standard deviations of the max logit.
    TopNSigma { n: f32 },
    /// Entropy-target feedback loop, v1. Needs the vocabulary size.
    MirostatV1 { seed: u32, tau: f32, eta: f32, m: i32 },
    /// Entropy-target feedback loop, v2. Needs the vocabulary size.
    MirostatV2 { seed: u32, tau: f32, eta: f32 },
    /// Constrain output to a grammar, starting from `root`.
    Grammar { definition: String, root: String },
    /// Fill-in-middle token handling. Needs the vocabulary.
    Infill,
    /// Repetition, frequency, and presence penalties over the last `last_n`
    /// tokens.
    Penalties {
        last_n: i32,
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
}

impl SamplerStage {
    /// Stages the runtime can only build with vocabulary information.
    /// Mirostat v2 dropped the vocabulary parameter; v1 still takes it.
    pub fn needs_vocab(&self) -> bool {
        matches!(
            self,
            SamplerStage::MirostatV1 { .. } | SamplerStage::Grammar { .. } | SamplerStage::Infill
        )
    }

    pub fn needs_grammar(&self) -> bool {
        matches!(self, SamplerStage::Grammar { .. })
    }
}

/// Check a stage against what the model can actually provide, plus basic
/// range sanity. Called before a stage enters a pipeline, so a failure
/// never leaves a half-configured chain.
pub fn validate_stage(stage: &SamplerStage, model: &dyn LanguageModel) -> Result<()> {
    if stage.needs_vocab() && model.vocab_size().is_none() {
        return Err(EngineError::NotSupported(
            "sampler stage requires vocabulary information the model does not expose".into(),
        ));
    }
    if stage.needs_grammar() && !model.supports_grammar() {
        return Err(EngineError::NotSupported(
            "model runtime cannot compile grammar-constrained sampling".into(),
        ));
    }
    match stage {
        SamplerStage::TopP { p, .. }
        | SamplerStage::MinP { p, .. }
        | SamplerStage::Typical { p, .. } => {
            if !(*p > 0.0 && *p <= 1.0) {
                return Err(EngineError::Validation(format!(
                    "sampler probability {p} outside (0, 1]"
                )));
            }
        }
        SamplerStage::Temp { t } => {
            if *t < 0.0 || !t.is_finite() {
                return Err(EngineError::Validation(format!(
                    "temperature {t} must be a non-negative number"
                )));
            }
        }
        SamplerStage::TopK { k } => {
            if *k < 0 {
                return Err(EngineError::Validation(format!("top-k {k} must be >= 0")));
            }
        }
        SamplerStage::Grammar { definition, root } => {
            if definition.is_empty() || root.is_empty() {
                return Err(EngineError::Validation(
                    "grammar stage needs a non-empty definition and root rule".into(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// An ordered chain of sampler stages. Owned by the session; stages
/// transfer in on push and are only freed all together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SamplerPipeline {
    stages: Vec<SamplerStage>,
}

impl SamplerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default chain for interactive chat: light min-p filtering, mild
    /// temperature, seeded sampling.
    pub fn chat_default(seed: u32) -> Self {
        Self {
            stages: vec![
                SamplerStage::MinP { p: 0.05, min_keep: 1 },
                SamplerStage::Temp { t: 0.8 },
                SamplerStage::Dist { seed },
            ],
        }
    }

    /// Default chain for one-shot generation: penalties then arg-max.
    pub fn completion_default() -> Self {
        Self {
            stages: vec![
                SamplerStage::Penalties {
                    last_n: 64,
                    repeat: 1.0,
                    frequency: 0.0,
                    presence: 0.0,
                },
                SamplerStage::Greedy,
            ],
        }
    }

    /// Append one stage to the end of the chain.
    pub fn push(&mut self, stage: SamplerStage) {
        self.stages.push(stage);
    }

    /// Drop every stage at once.
    pub fn reset(&mut self) {
        self.stages.clear();
    }

    pub fn stages(&self) -> &[SamplerStage] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Pick the next token by delegating the full ordered stage list to the
    /// context's evaluation primitive.
    pub fn sample(&self, ctx: &mut dyn InferenceContext) -> Result<TokenId> {
        ctx.sample(&self.stages)
    }
}
