//! Stateful LLM inference sessions for embedding in a relational host.
//!
//! A [`Session`] owns everything one connection needs to talk to a model:
//! the inference context and its KV cache, a composable sampler pipeline,
//! the running conversation, and the adapter table. Chat turns re-render
//! the whole history through the model's template but feed only the byte
//! delta since the last turn, so the cache never sees the same token twice.
//! Responses stream as a pull iterator; closed or dropped streams record
//! the turn either way. Conversations persist transactionally in the host
//! database and restore into fresh sessions later.
//!
//! The model runtime itself stays behind the [`runtime`] traits: this crate
//! does the bookkeeping, not the math.
//!
//! [`Session`]: session::Session

pub mod buffer;
pub mod config;
pub mod conversation;
pub mod error;
pub mod history;
pub mod runtime;
pub mod sampler;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testkit;

pub use config::{ContextOptions, GenerateOptions, UnknownKeyPolicy};
pub use conversation::{Conversation, Message, Role};
pub use error::{EngineError, Result};
pub use runtime::{InferenceContext, LanguageModel, LoraAdapter, ModelHandle, TokenId};
pub use sampler::{SamplerPipeline, SamplerStage};
pub use session::Session;
pub use stream::{CancelToken, GenerationStream};
