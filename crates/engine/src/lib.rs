//! The Relay core engine — admission, prompt assembly, the bounded
//! reason–act loop, tool dispatch, SSE streaming, and background memory
//! digestion, wired over the storage gateway.
//!
//! Entry points: [`runtime::engine::run`] (unary) and
//! [`runtime::engine::sse_stream`] (streaming), both driven off an
//! [`state::EngineState`].

pub mod prompts;
pub mod runtime;
pub mod state;
pub mod workspace;

pub use runtime::engine::{run, sse_stream};
pub use state::EngineState;
