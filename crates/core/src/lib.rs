//! # RLM Core
//!
//! Domain types, traits, and error definitions for the recursive
//! language-model runtime. This crate defines the domain model that all
//! other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every pluggable subsystem is a trait here: model backends implement
//! [`ModelClient`], code-execution backends implement [`Environment`].
//! Implementations live in their respective crates, so they can be swapped
//! via configuration and replaced by stubs in tests.

pub mod client;
pub mod environment;
pub mod error;
pub mod message;

// Re-export key types at crate root for ergonomics
pub use client::{CostSummary, CostTracker, ModelClient, spawn_completion};
pub use environment::{CodeBlock, Environment, ExecutionResult, Isolation, Iteration};
pub use error::{EnvironmentError, Error, HandlerError, ProtocolError, ProviderError, Result};
pub use message::{Message, Prompt, Role};
