//! nimbus-ai: chat completion client for nimbus
//!
//! This crate talks to OpenAI-compatible chat completion backends and decodes
//! their server-sent-event streams into text deltas.

pub mod error;
pub mod providers;
pub mod sse;
pub mod stream;
pub mod types;

pub use error::{Error, Result};
pub use providers::LlmProvider;
pub use stream::{TokenCallback, TokenStream, collect_completion, token_stream};
pub use types::*;
