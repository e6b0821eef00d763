//! The session: one per host connection, passed explicitly to every
//! operation. Owns the inference context, sampler pipeline, conversation,
//! adapter table, and per-turn scratch; shares the model handle.
use rusqlite::Connection;
use uuid::Uuid;

use crate::buffer::GrowableBuffer;
use crate::config::{ContextOptions, GenerateOptions};
use crate::conversation::Conversation;
use crate::error::{EngineError, Result};
use crate::history;
use crate::runtime::{
    InferenceContext, LanguageModel, LoraAdapter, ModelHandle, TokenBatch, TokenId, tokenize_into,
};
use crate::sampler::{DEFAULT_SEED, SamplerPipeline, SamplerStage, validate_stage};
use crate::stream::GenerationStream;

/// Upper bound on attached LoRA adapters.
pub const MAX_ADAPTERS: usize = 8;

/// Per-turn scratch reused across turns: the pending batch, the raw
/// response accumulator, the bytes awaiting a complete UTF-8 scalar, and
/// the one-shot tokenize backing store.
#[derive(Debug, Default)]
pub(crate) struct TurnScratch {
    pub batch: TokenBatch,
    pub response: GrowableBuffer,
    pub pending: Vec<u8>,
    pub tokens: Vec<TokenId>,
}

impl TurnScratch {
    pub fn reset(&mut self) {
        self.batch.clear();
        self.response.reset();
        self.pending.clear();
    }
}

/// Split borrows over the session fields a decode step touches at once.
pub(crate) struct DecodeParts<'a> {
    pub ctx: &'a mut dyn InferenceContext,
    pub model: &'a dyn LanguageModel,
    pub sampler: &'a SamplerPipeline,
    pub scratch: &'a mut TurnScratch,
}

/// A stateful inference session. Not internally synchronized: the host
/// serializes access, one session per connection.
#[derive(Default)]
pub struct Session {
    model: Option<ModelHandle>,
    context: Option<Box<dyn InferenceContext>>,
    sampler: Option<SamplerPipeline>,
    conversation: Option<Conversation>,
    adapters: Vec<LoraAdapter>,
    options: GenerateOptions,
    scratch: TurnScratch,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("has_model", &self.model.is_some())
            .field("has_context", &self.context.is_some())
            .field("sampler_stages", &self.sampler.as_ref().map(SamplerPipeline::len))
            .field("conversation", &self.conversation.as_ref().map(Conversation::id))
            .field("adapters", &self.adapters.len())
            .finish()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Model and context lifecycle ─────────────────────────────────────

    /// Attach a loaded model and create a fresh inference context over it.
    /// Any previous conversation, sampler chain, and adapter set belonged
    /// to the previous model and are dropped.
    pub fn set_model(&mut self, model: ModelHandle, options: &ContextOptions) -> Result<()> {
        let context = model.new_context(options)?;
        tracing::info!(
            context_capacity = context.capacity(),
            "model attached, context created"
        );
        self.model = Some(model);
        self.context = Some(context);
        self.sampler = None;
        self.conversation = None;
        self.adapters.clear();
        self.scratch.reset();
        Ok(())
    }

    /// Release the model. The context, sampler, conversation, and adapters
    /// go with it — nothing may keep decoding against a model the host
    /// considers gone. No-op when nothing is loaded.
    pub fn free_model(&mut self) {
        if self.model.take().is_some() {
            tracing::info!("model released, session torn down");
        }
        self.context = None;
        self.sampler = None;
        self.conversation = None;
        self.adapters.clear();
        self.scratch.reset();
    }

    /// Release just the inference context. The conversation's text survives;
    /// generation fails with a misuse error until a context exists again.
    pub fn free_context(&mut self) {
        self.context = None;
        self.adapters.clear();
    }

    /// Create a fresh context over the attached model. The KV cache starts
    /// empty, so any existing conversation is re-fed in full on its next
    /// turn; a stale feed baseline would silently diverge.
    pub fn create_context(&mut self, options: &ContextOptions) -> Result<()> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::misuse("no model loaded"))?;
        let context = model.new_context(options)?;
        tracing::info!(context_capacity = context.capacity(), "context created");
        self.context = Some(context);
        self.adapters.clear();
        self.scratch.reset();
        if let Some(convo) = self.conversation.as_mut() {
            convo.reset_feed_baseline();
        }
        Ok(())
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn has_context(&self) -> bool {
        self.context.is_some()
    }

    // ── Sampler pipeline ────────────────────────────────────────────────

    /// Append one stage to the pipeline, creating an empty pipeline first
    /// if none exists. The stage is validated against the model before the
    /// pipeline is touched.
    pub fn push_sampler_stage(&mut self, stage: SamplerStage) -> Result<()> {
        let model = self
            .model
            .as_deref()
            .ok_or_else(|| EngineError::misuse("no model loaded"))?;
        validate_stage(&stage, model)?;
        self.sampler
            .get_or_insert_with(SamplerPipeline::new)
            .push(stage);
        Ok(())
    }

    /// Drop every stage. The next generation reinstalls a default chain.
    pub fn reset_sampler(&mut self) {
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
        }
    }

    pub fn sampler(&self) -> Option<&SamplerPipeline> {
        self.sampler.as_ref()
    }

    fn ensure_sampler(&mut self, default: fn() -> SamplerPipeline) {
        if self.sampler.as_ref().is_none_or(SamplerPipeline::is_empty) {
            tracing::debug!("installing default sampler pipeline");
            self.sampler = Some(default());
        }
    }

    // ── Generation ──────────────────────────────────────────────────────

    /// One-shot generation: tokenize `prompt` whole, decode from an empty
    /// KV cache, and sample until end-of-generation (or the `max_tokens`
    /// bound). Does not touch the conversation's messages, but any chat
    /// KV state is discarded, so the next turn re-feeds its full history.
    pub fn generate(&mut self, prompt: &str) -> Result<String> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::misuse("no model loaded"))?;
        if self.context.is_none() {
            return Err(EngineError::misuse("no active inference context"));
        }
        self.ensure_sampler(SamplerPipeline::completion_default);

        self.scratch.reset();
        let count = tokenize_into(model.as_ref(), prompt, true, true, &mut self.scratch.tokens)?;
        self.scratch.batch.refill(&self.scratch.tokens[..count]);

        let max_tokens = self.options.max_tokens as usize;
        let mut emitted = 0usize;
        {
            let parts = self.decode_parts()?;
            parts.ctx.clear();
        }
        loop {
            let parts = self.decode_parts()?;
            let needed = parts.ctx.used_tokens() + parts.scratch.batch.len();
            let capacity = parts.ctx.capacity();
            if needed > capacity {
                return Err(EngineError::ContextOverflow { needed, capacity });
            }
            parts.ctx.decode(&parts.scratch.batch)?;
            let token = parts.sampler.sample(parts.ctx)?;
            if parts.model.is_end_of_generation(token) {
                break;
            }
            let bytes = parts.model.token_bytes(token)?;
            parts.scratch.response.append(&bytes)?;
            parts.scratch.batch.replace_with(token);
            emitted += 1;
            if max_tokens > 0 && emitted >= max_tokens {
                break;
            }
        }

        let text = String::from_utf8_lossy(self.scratch.response.as_bytes()).into_owned();
        tracing::debug!(tokens = emitted, chars = text.len(), "one-shot generation done");
        self.scratch.reset();
        if let Some(ctx) = self.context.as_deref_mut() {
            ctx.clear();
        }
        if let Some(convo) = self.conversation.as_mut() {
            convo.reset_feed_baseline();
        }
        Ok(text)
    }

    /// Open a chat turn as a pull iterator yielding one text fragment per
    /// pull. Dropping or closing the stream finalizes the turn into the
    /// conversation, even when iteration stops early.
    pub fn stream(&mut self, user_text: &str) -> Result<GenerationStream<'_>> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::misuse("no model loaded"))?;
        if self.context.is_none() {
            return Err(EngineError::misuse("no active inference context"));
        }
        if model.chat_template().is_none() {
            return Err(EngineError::misuse(
                "model has no chat template; chat requires one",
            ));
        }
        self.ensure_sampler(|| SamplerPipeline::chat_default(DEFAULT_SEED));
        if self.conversation.is_none() {
            self.conversation = Some(Conversation::new()?);
        }

        let kv_cache_empty = self
            .context
            .as_deref()
            .map(|ctx| ctx.used_tokens() == 0)
            .unwrap_or(true);
        let convo = self
            .conversation
            .as_mut()
            .ok_or_else(|| EngineError::misuse("no open conversation"))?;
        let batch = convo.begin_turn(model.as_ref(), user_text, kv_cache_empty)?;

        self.scratch.reset();
        self.scratch.batch = batch;
        let max_tokens = self.options.max_tokens as usize;
        Ok(GenerationStream::open(self, max_tokens))
    }

    /// The streaming protocol driven to completion internally: same turn
    /// handling, same sampler defaults, whole response returned at once.
    pub fn respond(&mut self, user_text: &str) -> Result<String> {
        let mut stream = self.stream(user_text)?;
        let mut out = String::new();
        while let Some(fragment) = stream.advance()? {
            out.push_str(&fragment);
        }
        stream.close()?;
        Ok(out)
    }

    // ── Conversation and history ────────────────────────────────────────

    pub fn conversation(&self) -> Option<&Conversation> {
        self.conversation.as_ref()
    }

    /// Drop the in-memory conversation. The next chat turn starts a new
    /// one with a fresh identifier.
    pub fn free_conversation(&mut self) {
        self.conversation = None;
        if let Some(ctx) = self.context.as_deref_mut() {
            ctx.clear();
        }
    }

    /// Persist the conversation. Ok(None) when there is nothing to save.
    pub fn save_history(
        &self,
        conn: &mut Connection,
        title: Option<&str>,
        meta: Option<&serde_json::Value>,
    ) -> Result<Option<Uuid>> {
        match self.conversation.as_ref() {
            Some(convo) => history::save(conn, convo, title, meta),
            None => Ok(None),
        }
    }

    /// Replace the in-memory conversation with a saved one and clear the
    /// KV cache: the next turn re-feeds the restored history in full.
    /// Returns how many messages were restored (zero for an unknown id).
    pub fn restore_history(&mut self, conn: &Connection, id: Uuid) -> Result<usize> {
        let messages = history::load(conn, &id)?;
        let count = messages.len();
        self.conversation = Some(Conversation::restored(id, messages)?);
        if let Some(ctx) = self.context.as_deref_mut() {
            ctx.clear();
        }
        tracing::info!(conversation = %id, messages = count, "conversation restored");
        Ok(count)
    }

    // ── Adapters ────────────────────────────────────────────────────────

    /// Attach one adapter and re-apply the whole active set to the context.
    /// A failed application leaves the table as it was.
    pub fn attach_adapter(&mut self, adapter: LoraAdapter) -> Result<()> {
        if self.adapters.len() >= MAX_ADAPTERS {
            return Err(EngineError::AdapterTableFull { max: MAX_ADAPTERS });
        }
        let ctx = self
            .context
            .as_deref_mut()
            .ok_or_else(|| EngineError::misuse("no active inference context"))?;
        self.adapters.push(adapter);
        if let Err(e) = ctx.apply_adapters(&self.adapters) {
            self.adapters.pop();
            return Err(e);
        }
        Ok(())
    }

    /// Detach everything. No-op on the context when none exists.
    pub fn clear_adapters(&mut self) -> Result<()> {
        self.adapters.clear();
        if let Some(ctx) = self.context.as_deref_mut() {
            ctx.apply_adapters(&self.adapters)?;
        }
        Ok(())
    }

    pub fn adapters(&self) -> &[LoraAdapter] {
        &self.adapters
    }

    // ── Options ─────────────────────────────────────────────────────────

    pub fn options(&self) -> &GenerateOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut GenerateOptions {
        &mut self.options
    }

    // ── Internals shared with the streaming protocol ────────────────────

    pub(crate) fn decode_parts(&mut self) -> Result<DecodeParts<'_>> {
        let ctx = self
            .context
            .as_deref_mut()
            .ok_or_else(|| EngineError::misuse("no active inference context"))?;
        let model = self
            .model
            .as_deref()
            .ok_or_else(|| EngineError::misuse("no model loaded"))?;
        let sampler = self
            .sampler
            .as_ref()
            .ok_or_else(|| EngineError::misuse("no sampler pipeline"))?;
        Ok(DecodeParts {
            ctx,
            model,
            sampler,
            scratch: &mut self.scratch,
        })
    }

    pub(crate) fn scratch(&self) -> &TurnScratch {
        &self.scratch
    }

    pub(crate) fn scratch_mut(&mut self) -> &mut TurnScratch {
        &mut self.scratch
    }

    pub(crate) fn finalize_turn(&mut self, response: &str) -> Result<()> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| EngineError::misuse("no model loaded"))?;
        let convo = self
            .conversation
            .as_mut()
            .ok_or_else(|| EngineError::misuse("no open conversation"))?;
        convo.finish_turn(model.as_ref(), response)
    }
}
