//! # Core
//!
//! Per-node connection handling and multiplexing.
//!
//! ## Modules
//!
//! - [`connection`] - Framed RESP stream to a single node
//! - [`command`] - Command builders and reply converters
//! - [`future`] - Handles for dispatched commands
//! - [`multiplexed`] - Pipelined connection shared by concurrent callers
//!

pub use crate::proto::error::{Error, Result};

/// Command construction helpers.
pub mod command;
/// Low-level connection management.
pub mod connection;
/// Command handles and bulk waiting.
pub mod future;
/// Multiplexing logic.
pub mod multiplexed;

pub use future::{await_all, CommandFuture};
pub use multiplexed::{ConnectOptions, ConnectionState, MultiplexedConnection};
