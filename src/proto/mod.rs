//! RESP wire model used to talk to cluster nodes.
//!
//! - [`codec`] - Encoder and streaming decoder
//! - [`error`] - Crate-wide error type
//! - [`frame`] - Frame types representing RESP data structures

pub mod codec;
/// Error types.
pub mod error;
pub mod frame;
