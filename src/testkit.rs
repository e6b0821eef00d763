//! Scripted fake runtime for the test suites.
//!
//! The fake model tokenizes one character per token, renders chat as
//! `role:content\n` lines, and replies with whatever token script was
//! queued. Shared [`FakeState`] records every decode, sample, and adapter
//! application so tests can assert on exactly what reached the runtime.
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::config::ContextOptions;
use crate::conversation::Message;
use crate::error::{EngineError, Result};
use crate::runtime::{
    InferenceContext, LanguageModel, LoraAdapter, TokenBatch, TokenId, WriteOutcome,
};
use crate::sampler::SamplerStage;

/// Route engine traces to the test harness when `RUST_LOG` asks for them.
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const BOS_TOKEN: TokenId = 0;
pub const EOG_TOKEN: TokenId = 1;
const FIRST_VOCAB_TOKEN: TokenId = 2;

#[derive(Debug, Default)]
pub struct FakeState {
    /// Interned token texts; token id = index + FIRST_VOCAB_TOKEN.
    vocab: RefCell<Vec<Vec<u8>>>,
    /// Queued sample results, drained one per sample call.
    replies: RefCell<VecDeque<TokenId>>,
    /// Every token id decoded, in order, across all batches.
    pub decoded: RefCell<Vec<TokenId>>,
    /// The stage list passed to each sample call.
    pub sampled_stage_lists: RefCell<Vec<Vec<SamplerStage>>>,
    /// The adapter set passed to each apply call.
    pub adapter_sets: RefCell<Vec<Vec<LoraAdapter>>>,
    pub fail_next_tokenize: Cell<bool>,
    pub fail_next_decode: Cell<bool>,
    pub fail_adapters: Cell<bool>,
}

pub struct FakeModel {
    pub state: Rc<FakeState>,
    template: Option<String>,
    vocab_size: Option<u32>,
    grammar: bool,
}

impl FakeModel {
    pub fn new() -> Self {
        Self {
            state: Rc::new(FakeState::default()),
            template: Some("{{role}}:{{content}}".to_string()),
            vocab_size: Some(32_000),
            grammar: false,
        }
    }

    pub fn without_template(mut self) -> Self {
        self.template = None;
        self
    }

    pub fn without_vocab(mut self) -> Self {
        self.vocab_size = None;
        self
    }

    pub fn with_grammar(mut self) -> Self {
        self.grammar = true;
        self
    }

    fn intern(&self, bytes: &[u8]) -> TokenId {
        let mut vocab = self.state.vocab.borrow_mut();
        if let Some(pos) = vocab.iter().position(|v| v == bytes) {
            return pos as TokenId + FIRST_VOCAB_TOKEN;
        }
        vocab.push(bytes.to_vec());
        vocab.len() as TokenId - 1 + FIRST_VOCAB_TOKEN
    }

    /// A token for one character of text.
    pub fn char_token(&self, c: char) -> TokenId {
        let mut buf = [0u8; 4];
        self.intern(c.encode_utf8(&mut buf).as_bytes())
    }

    /// A token for an arbitrary byte slice, including partial UTF-8
    /// sequences for fragment-reassembly tests.
    pub fn byte_token(&self, bytes: &[u8]) -> TokenId {
        self.intern(bytes)
    }

    /// Queue a generation script: one token per character of `text`,
    /// terminated by the end-of-generation token.
    pub fn script_reply(&self, text: &str) {
        let mut replies = self.state.replies.borrow_mut();
        for c in text.chars() {
            replies.push_back(self.char_token(c));
        }
        replies.push_back(EOG_TOKEN);
    }

    /// Queue raw token ids, without a terminator.
    pub fn script_tokens(&self, tokens: &[TokenId]) {
        self.state.replies.borrow_mut().extend(tokens.iter().copied());
    }

    /// Decode a recorded token trace back to text, skipping markers.
    pub fn decode_text(&self, tokens: &[TokenId]) -> String {
        let vocab = self.state.vocab.borrow();
        let mut bytes = Vec::new();
        for &t in tokens {
            if t == BOS_TOKEN || t == EOG_TOKEN {
                continue;
            }
            bytes.extend_from_slice(&vocab[(t - FIRST_VOCAB_TOKEN) as usize]);
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn render_text(messages: &[Message], add_generation_prompt: bool) -> String {
        let mut out = String::new();
        for m in messages {
            out.push_str(m.role.as_str());
            out.push(':');
            out.push_str(&m.content);
            out.push('\n');
        }
        if add_generation_prompt {
            out.push_str("assistant:");
        }
        out
    }
}

impl Default for FakeModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for FakeModel {
    /// Clones share state: a kept clone can decode traces recorded through
    /// the handle that went into the session.
    fn clone(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            template: self.template.clone(),
            vocab_size: self.vocab_size,
            grammar: self.grammar,
        }
    }
}

impl LanguageModel for FakeModel {
    fn chat_template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    fn render_chat_template(
        &self,
        messages: &[Message],
        add_generation_prompt: bool,
        out: &mut [u8],
    ) -> Result<WriteOutcome> {
        let text = Self::render_text(messages, add_generation_prompt);
        let bytes = text.as_bytes();
        if bytes.len() > out.len() {
            return Ok(WriteOutcome::NeedsCapacity(bytes.len()));
        }
        out[..bytes.len()].copy_from_slice(bytes);
        Ok(WriteOutcome::Written(bytes.len()))
    }

    fn tokenize(
        &self,
        text: &str,
        add_bos: bool,
        _parse_special: bool,
        out: &mut [TokenId],
    ) -> Result<WriteOutcome> {
        if self.state.fail_next_tokenize.replace(false) {
            return Err(EngineError::runtime("scripted tokenize failure"));
        }
        let mut tokens = Vec::new();
        if add_bos {
            tokens.push(BOS_TOKEN);
        }
        for c in text.chars() {
            tokens.push(self.char_token(c));
        }
        if tokens.len() > out.len() {
            return Ok(WriteOutcome::NeedsCapacity(tokens.len()));
        }
        out[..tokens.len()].copy_from_slice(&tokens);
        Ok(WriteOutcome::Written(tokens.len()))
    }

    fn token_bytes(&self, token: TokenId) -> Result<Vec<u8>> {
        let vocab = self.state.vocab.borrow();
        vocab
            .get((token - FIRST_VOCAB_TOKEN) as usize)
            .cloned()
            .ok_or_else(|| EngineError::runtime(format!("unknown token {token}")))
    }

    fn is_end_of_generation(&self, token: TokenId) -> bool {
        token == EOG_TOKEN
    }

    fn vocab_size(&self) -> Option<u32> {
        self.vocab_size
    }

    fn supports_grammar(&self) -> bool {
        self.grammar
    }

    fn new_context(&self, options: &ContextOptions) -> Result<Box<dyn InferenceContext>> {
        let capacity = if options.context_size > 0 {
            options.context_size as usize
        } else {
            4096
        };
        Ok(Box::new(FakeContext {
            state: Rc::clone(&self.state),
            capacity,
            used: 0,
        }))
    }
}

pub struct FakeContext {
    state: Rc<FakeState>,
    capacity: usize,
    used: usize,
}

impl InferenceContext for FakeContext {
    fn decode(&mut self, batch: &TokenBatch) -> Result<()> {
        if self.state.fail_next_decode.replace(false) {
            return Err(EngineError::runtime("scripted decode failure"));
        }
        self.state
            .decoded
            .borrow_mut()
            .extend_from_slice(batch.tokens());
        self.used += batch.len();
        Ok(())
    }

    fn sample(&mut self, stages: &[SamplerStage]) -> Result<TokenId> {
        self.state
            .sampled_stage_lists
            .borrow_mut()
            .push(stages.to_vec());
        self.state
            .replies
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| EngineError::runtime("sample called with no scripted reply"))
    }

    fn used_tokens(&self) -> usize {
        self.used
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn clear(&mut self) {
        self.used = 0;
    }

    fn apply_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        if self.state.fail_adapters.get() {
            return Err(EngineError::runtime("scripted adapter failure"));
        }
        self.state.adapter_sets.borrow_mut().push(adapters.to_vec());
        Ok(())
    }
}

/// A model wrapped for session use.
pub fn model_handle(model: FakeModel) -> (crate::runtime::ModelHandle, Rc<FakeState>) {
    let state = Rc::clone(&model.state);
    let handle: crate::runtime::ModelHandle = std::sync::Arc::new(model);
    (handle, state)
}
