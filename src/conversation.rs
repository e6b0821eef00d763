//! Conversation state and the incremental turn-diff algorithm.
//!
//! The whole message list is re-rendered through the model's chat template
//! every turn, but only the byte delta past the last baseline is tokenized
//! and fed — tokens from earlier turns are already in the KV cache.
use uuid::Uuid;

use crate::buffer::GrowableBuffer;
use crate::error::{EngineError, Result};
use crate::runtime::{
    LanguageModel, MIN_TOKEN_SCRATCH, TokenBatch, TokenId, WriteOutcome, tokenize_into,
};

/// Who said it. The two built-in roles render as shared static strings;
/// anything else owns its text.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Other(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "system" => Role::System,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            other => Role::Other(other.to_string()),
        }
    }
}

/// One turn entry. Immutable once created; owned by the conversation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A multi-turn conversation with template-diff bookkeeping.
///
/// Invariant: `rendered_len_prev <= rendered.len()` at all times; the bytes
/// past `rendered_len_prev` are exactly what still needs to be tokenized
/// and fed to the runtime.
#[derive(Debug)]
pub struct Conversation {
    id: Uuid,
    messages: Vec<Message>,
    rendered: GrowableBuffer,
    rendered_len_prev: usize,
    token_scratch: Vec<TokenId>,
}

impl Conversation {
    /// Fresh conversation with a time-ordered unique identifier.
    pub fn new() -> Result<Self> {
        Ok(Self {
            id: Uuid::now_v7(),
            messages: Vec::new(),
            rendered: GrowableBuffer::with_capacity(0)?,
            rendered_len_prev: 0,
            token_scratch: vec![0; MIN_TOKEN_SCRATCH],
        })
    }

    /// Rebuild a conversation from persisted messages. The render baseline
    /// starts at zero: the next turn re-feeds the whole history as if it
    /// were the first.
    pub fn restored(id: Uuid, messages: Vec<Message>) -> Result<Self> {
        Ok(Self {
            id,
            messages,
            rendered: GrowableBuffer::with_capacity(0)?,
            rendered_len_prev: 0,
            token_scratch: vec![0; MIN_TOKEN_SCRATCH],
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn rendered_len_prev(&self) -> usize {
        self.rendered_len_prev
    }

    /// The current rendered history (whatever the last render produced).
    pub fn rendered_text(&self) -> &str {
        std::str::from_utf8(self.rendered.as_bytes()).unwrap_or("")
    }

    /// Move the feed baseline back to zero, so the next turn re-renders and
    /// re-feeds the entire history. Required whenever the KV cache this
    /// conversation was fed into is gone.
    pub(crate) fn reset_feed_baseline(&mut self) {
        self.rendered_len_prev = 0;
    }

    /// Start a turn: append the user message, render the full template with
    /// a trailing generation prompt, tokenize only the delta past the
    /// baseline, and build the initial batch from it.
    ///
    /// `kv_cache_empty` decides whether a beginning-of-sequence marker is
    /// added; it must reflect the actual cache state or decoding diverges.
    /// On any failure the user message is popped and the prior state stands.
    pub fn begin_turn(
        &mut self,
        model: &dyn LanguageModel,
        user_text: &str,
        kv_cache_empty: bool,
    ) -> Result<TokenBatch> {
        if model.chat_template().is_none() {
            return Err(EngineError::misuse(
                "model has no chat template; chat requires one",
            ));
        }

        self.messages.push(Message::user(user_text));
        match self.tokenize_pending(model, kv_cache_empty) {
            Ok(batch) => Ok(batch),
            Err(e) => {
                self.messages.pop();
                Err(e)
            }
        }
    }

    /// Finish a turn: append the assistant reply and advance the baseline
    /// past it by re-rendering without a generation prompt. The baseline
    /// only moves on success.
    pub fn finish_turn(&mut self, model: &dyn LanguageModel, response: &str) -> Result<()> {
        self.messages.push(Message::assistant(response));
        let new_len = self.render(model, false)?;
        self.rendered_len_prev = new_len;
        tracing::debug!(
            conversation = %self.id,
            rendered_len = new_len,
            "turn finished, baseline advanced"
        );
        Ok(())
    }

    fn tokenize_pending(
        &mut self,
        model: &dyn LanguageModel,
        kv_cache_empty: bool,
    ) -> Result<TokenBatch> {
        let new_len = self.render(model, true)?;
        if new_len < self.rendered_len_prev {
            return Err(EngineError::runtime(format!(
                "template render shrank below the fed baseline ({new_len} < {})",
                self.rendered_len_prev
            )));
        }

        let delta = std::str::from_utf8(&self.rendered.as_bytes()[self.rendered_len_prev..])
            .map_err(|e| EngineError::runtime(format!("template produced invalid UTF-8: {e}")))?;
        tracing::trace!(
            conversation = %self.id,
            delta_bytes = delta.len(),
            first_turn = kv_cache_empty,
            "tokenizing turn delta"
        );

        // Special tokens stay on: the delta carries template control text.
        let count = tokenize_into(model, delta, kv_cache_empty, true, &mut self.token_scratch)?;
        Ok(TokenBatch::from_tokens(&self.token_scratch[..count]))
    }

    /// Render the whole message list into the rendered-history buffer,
    /// growing and retrying once when the renderer asks for more room.
    fn render(&mut self, model: &dyn LanguageModel, add_generation_prompt: bool) -> Result<usize> {
        let mut attempts = 0;
        loop {
            match model.render_chat_template(
                &self.messages,
                add_generation_prompt,
                self.rendered.space(),
            )? {
                WriteOutcome::Written(n) => {
                    self.rendered.set_used(n)?;
                    return Ok(n);
                }
                WriteOutcome::NeedsCapacity(n) if attempts == 0 => {
                    self.rendered.grow_to(n)?;
                    attempts += 1;
                }
                WriteOutcome::NeedsCapacity(_) => {
                    return Err(EngineError::runtime(
                        "template renderer kept reporting a larger required size",
                    ));
                }
            }
        }
    }
}

mod tests;
