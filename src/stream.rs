//! The pull-iterator streaming protocol over a chat turn.
//!
//! A [`GenerationStream`] borrows its session exclusively for the life of
//! the turn, yields one text fragment per pull, and finalizes the turn into
//! the conversation exactly once — through [`GenerationStream::close`], or
//! as a best effort on drop when the caller walks away early.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{EngineError, Result};
use crate::session::Session;

/// Cooperative cancellation flag, checked before every decode step. Cloned
/// handles share the flag, so a host can cancel from outside the pull loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    /// Open; the next pull runs a decode step.
    Running,
    /// Generation finished (end token, bound, or cancellation); pulls
    /// return end-of-stream until close.
    Done,
    /// Finalized. `close` consumed the stream, so no pull can observe this;
    /// it only keeps a second finalize (close then drop) from running.
    Closed,
}

/// An in-flight chat turn. Pull fragments with [`advance`] or the
/// [`Iterator`] impl; finish with [`close`].
///
/// [`advance`]: GenerationStream::advance
/// [`close`]: GenerationStream::close
pub struct GenerationStream<'s> {
    session: &'s mut Session,
    state: StreamState,
    cancel: CancelToken,
    tokens_emitted: usize,
    max_tokens: usize,
}

impl<'s> GenerationStream<'s> {
    pub(crate) fn open(session: &'s mut Session, max_tokens: usize) -> Self {
        Self {
            session,
            state: StreamState::Running,
            cancel: CancelToken::new(),
            tokens_emitted: 0,
            max_tokens,
        }
    }

    /// A handle the host can keep to cancel this turn from elsewhere.
    /// Cancellation ends the stream gracefully: the partial response still
    /// lands in the conversation on close.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_end(&self) -> bool {
        self.state != StreamState::Running
    }

    /// Pull the next fragment. `Ok(None)` means end-of-stream; the stream
    /// stays pullable (returning `None`) until closed. Fragments are never
    /// empty: bytes that do not yet complete a UTF-8 scalar are held back
    /// and decoding continues until something printable exists.
    pub fn advance(&mut self) -> Result<Option<String>> {
        if self.state != StreamState::Running {
            return Ok(None);
        }

        loop {
            if self.cancel.is_cancelled() {
                tracing::debug!(tokens = self.tokens_emitted, "generation cancelled");
                self.state = StreamState::Done;
                return Ok(None);
            }
            if self.max_tokens > 0 && self.tokens_emitted >= self.max_tokens {
                self.state = StreamState::Done;
                return Ok(None);
            }

            let parts = self.session.decode_parts()?;
            let needed = parts.ctx.used_tokens() + parts.scratch.batch.len();
            let capacity = parts.ctx.capacity();
            if needed > capacity {
                self.state = StreamState::Done;
                return Err(EngineError::ContextOverflow { needed, capacity });
            }
            if let Err(e) = parts.ctx.decode(&parts.scratch.batch) {
                self.state = StreamState::Done;
                return Err(e);
            }
            let token = match parts.sampler.sample(parts.ctx) {
                Ok(token) => token,
                Err(e) => {
                    self.state = StreamState::Done;
                    return Err(e);
                }
            };
            if parts.model.is_end_of_generation(token) {
                self.state = StreamState::Done;
                return Ok(None);
            }

            let bytes = match parts.model.token_bytes(token) {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.state = StreamState::Done;
                    return Err(e);
                }
            };
            parts.scratch.response.append(&bytes)?;
            parts.scratch.pending.extend_from_slice(&bytes);
            parts.scratch.batch.replace_with(token);
            self.tokens_emitted += 1;

            let ready = utf8_valid_prefix_len(&parts.scratch.pending);
            if ready > 0 {
                let fragment =
                    String::from_utf8(parts.scratch.pending.drain(..ready).collect())
                        .expect("prefix verified valid");
                return Ok(Some(fragment));
            }
            // Token ended mid-scalar; decode more before yielding.
        }
    }

    /// Finalize the turn: record the accumulated response (lossily decoded
    /// if a trailing fragment never completed) as the assistant message and
    /// release the session borrow. Consuming self makes double-close
    /// unrepresentable.
    pub fn close(mut self) -> Result<()> {
        self.finalize()
    }

    fn finalize(&mut self) -> Result<()> {
        if self.state == StreamState::Closed {
            return Ok(());
        }
        self.state = StreamState::Closed;
        let response =
            String::from_utf8_lossy(self.session.scratch().response.as_bytes()).into_owned();
        let result = self.session.finalize_turn(&response);
        self.session.scratch_mut().reset();
        result
    }
}

impl Drop for GenerationStream<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::warn!(error = %e, "failed to finalize dropped generation stream");
        }
    }
}

impl Iterator for GenerationStream<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(fragment)) => Some(Ok(fragment)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Length of the longest valid UTF-8 prefix of `bytes`. Whatever follows is
/// an incomplete (or invalid) trailing sequence still waiting for more
/// token bytes.
fn utf8_valid_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) => e.valid_up_to(),
    }
}
