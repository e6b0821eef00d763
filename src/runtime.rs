//! The narrow seam to the external model runtime.
//!
//! The engine never sees model weights, attention math, or sampler
//! internals; it drives a [`LanguageModel`] and its [`InferenceContext`]
//! through these traits. A llama.cpp binding, a remote runtime, or the test
//! fake all plug in the same way.
//!
//! Tokenize and render keep the runtime's two-call shape: the caller offers
//! storage, the runtime either fills it or reports the capacity it needs,
//! and the caller grows and retries once. Both operations are idempotent.
use std::sync::Arc;

use crate::config::ContextOptions;
use crate::conversation::Message;
use crate::error::Result;
use crate::sampler::SamplerStage;

/// Token identifier in the model's vocabulary.
pub type TokenId = i32;

/// Token-scratch allocation floor, in ids.
pub const MIN_TOKEN_SCRATCH: usize = 512;

/// Shared, read-only handle to a loaded model. A context clones the handle,
/// so the model cannot be freed out from under it.
pub type ModelHandle = Arc<dyn LanguageModel>;

/// Outcome of a two-call operation writing into caller-owned storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The operation completed and wrote this many elements.
    Written(usize),
    /// The destination was too small; retry with at least this capacity.
    NeedsCapacity(usize),
}

/// One LoRA adapter slot: where to find it and how strongly to apply it.
#[derive(Debug, Clone, PartialEq)]
pub struct LoraAdapter {
    pub path: String,
    pub scale: f32,
}

/// A loaded model: vocabulary, tokenizer, chat template.
pub trait LanguageModel {
    /// The model's chat template, if it carries one. Chat is refused
    /// without it.
    fn chat_template(&self) -> Option<&str>;

    /// Render the full message list into `out`, optionally appending the
    /// prompt for the next assistant turn. Must be re-callable with a
    /// larger `out` after a `NeedsCapacity` outcome, producing identical
    /// bytes.
    fn render_chat_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
        out: &mut [u8],
    ) -> Result<WriteOutcome>;

    /// Tokenize `text` into `out`. `add_bos` must be set exactly when the
    /// destination KV cache is empty; `parse_special` controls whether
    /// template control tokens are recognized. Getting either flag wrong
    /// silently diverges from what filled the cache.
    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        parse_special: bool,
        out: &mut [TokenId],
    ) -> Result<WriteOutcome>;

    /// Raw bytes of one token's text. Fragments may split UTF-8 sequences;
    /// the streaming layer reassembles them.
    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>>;

    /// Whether this token terminates generation.
    fn is_end_of_generation(&self, token: TokenId) -> bool;

    /// Vocabulary size, when the model exposes one. Sampler stages that
    /// need it are refused when it is absent.
    fn vocab_size(&self) -> Option<u32>;

    /// Whether the runtime can compile grammar-constrained stages.
    fn supports_grammar(&self) -> bool;

    /// Create a fresh inference context (and KV cache) over this model.
    fn new_context(&self, options: &ContextOptions) -> Result<Box<dyn InferenceContext>>;
}

/// An inference context: the KV cache plus per-context runtime state.
/// Exclusively owned by one session; never shared between call paths.
pub trait InferenceContext {
    /// Advance the KV cache by one decode step over the whole batch.
    fn decode(&mut self, batch: &TokenBatch) -> Result<()>;

    /// Evaluate the ordered sampler stage list against the current logits
    /// and pick the next token.
    fn sample(&mut self, stages: &[SamplerStage]) -> Result<TokenId>;

    /// Tokens already held in the KV cache.
    fn used_tokens(&self) -> usize;

    /// Fixed token capacity of the context window.
    fn capacity(&self) -> usize;

    /// Drop all cached tokens.
    fn clear(&mut self);

    /// Replace the active adapter set with `adapters`, in order. Always the
    /// whole set; the runtime applies no incremental deltas.
    fn apply_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<()>;
}

/// Drive the two-call tokenize protocol against a reusable scratch vector,
/// growing it (never shrinking) when the tokenizer asks for more room.
/// Returns the number of ids written at the front of `scratch`.
pub fn tokenize_into(
    model: &dyn LanguageModel,
    text: &str,
    add_bos: bool,
    parse_special: bool,
    scratch: &mut Vec<TokenId>,
) -> Result<usize> {
    use crate::error::EngineError;

    if scratch.len() < MIN_TOKEN_SCRATCH {
        scratch.resize(MIN_TOKEN_SCRATCH, 0);
    }
    let mut attempts = 0;
    loop {
        match model.tokenize(text, add_bos, parse_special, scratch)? {
            WriteOutcome::Written(n) => {
                if n > scratch.len() {
                    return Err(EngineError::runtime(format!(
                        "tokenizer reported {n} tokens into a {} token buffer",
                        scratch.len()
                    )));
                }
                return Ok(n);
            }
            WriteOutcome::NeedsCapacity(n) if attempts == 0 => {
                scratch.resize(n.max(MIN_TOKEN_SCRATCH), 0);
                attempts += 1;
            }
            WriteOutcome::NeedsCapacity(_) => {
                return Err(EngineError::runtime(
                    "tokenizer kept reporting a larger required size",
                ));
            }
        }
    }
}

/// The pending batch fed to the next decode step: the turn delta at first,
/// then the single sampled token of each step. The allocation is reused
/// across steps and turns.
#[derive(Debug, Clone, Default)]
pub struct TokenBatch {
    tokens: Vec<TokenId>,
}

impl TokenBatch {
    pub fn from_tokens(tokens: &[TokenId]) -> Self {
        Self {
            tokens: tokens.to_vec(),
        }
    }

    /// Refill from a slice, reusing the allocation.
    pub fn refill(&mut self, tokens: &[TokenId]) {
        self.tokens.clear();
        self.tokens.extend_from_slice(tokens);
    }

    /// Shrink to exactly the one sampled token that feeds the next step.
    pub fn replace_with(&mut self, token: TokenId) {
        self.tokens.clear();
        self.tokens.push(token);
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn clear(&mut self) {
        self.tokens.clear();
    }
}
