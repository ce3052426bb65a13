//! turnward: a turn-based agent runtime.
//!
//! A [`host::HostLoop`] drives an agent model through envelopes exchanged
//! with an LLM provider. The agent acts only through ACTIONS blocks run in
//! per-turn sandbox clones, every tool call passes the policy gate, and each
//! turn must end with a signed control token bound to that turn.

pub mod catalog;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod host;
pub mod llm;
pub mod policy;
pub mod sandbox;
pub mod script;
pub mod token;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Error, ErrorKind, Result};
