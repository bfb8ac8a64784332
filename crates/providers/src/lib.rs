//! Model client implementations for RLM.
//!
//! All clients implement the `rlm_core::ModelClient` trait.
//! The registry selects and builds clients from configuration.

pub mod openai_compat;
pub mod registry;

pub use openai_compat::{AuthScheme, OpenAiCompatClient, Pricing};
pub use registry::{BackendRegistry, BackendOptions, ConfiguredClients, build_from_config, default_base_url};
