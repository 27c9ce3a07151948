//! RESP frame types.
//!
//! Replies and requests exchanged with a cluster node are modelled as
//! [`Frame`] values.

/// Frame type definitions.
pub mod types;

pub use types::Frame;
