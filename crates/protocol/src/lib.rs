//! # RLM Protocol
//!
//! The wire protocol shared by the orchestration loop, the request router and
//! execution environments. Every message is a 4-byte big-endian length
//! followed by a UTF-8 JSON object. A request exchange is strictly one
//! request and one response per connection.

pub mod client;
pub mod frame;
pub mod message;

pub use client::{DEFAULT_TIMEOUT, send_request, send_request_async};
pub use frame::{
    MAX_FRAME_LEN, encode_frame, read_frame, read_frame_blocking, write_frame,
    write_frame_blocking,
};
pub use message::{CompletionRequest, CompletionResponse};
