//! Code execution environments for RLM.
//!
//! All environments implement `rlm_core::Environment`. The local
//! environment runs code in a subprocess on this machine; the remote one
//! ships it to a sandbox service on another machine.

pub mod local;
pub mod registry;
pub mod remote;

pub use local::LocalEnvironment;
pub use registry::{EnvironmentFactory, EnvironmentRegistry};
pub use remote::RemoteEnvironment;
