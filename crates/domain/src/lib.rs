//! Shared domain types for the Relay engine: configuration, errors, chat
//! and event models, and the token estimator.

pub mod chat;
pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod request;
pub mod tokens;

pub use error::{Error, Result};
