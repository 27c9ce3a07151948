//! Cluster management command builders.
//!
//! Used for topology discovery and redirect handling.

use crate::core::command::Cmd;

/// Creates a CLUSTER NODES command.
///
/// Returns one text line per node with its ID, address, flags, master,
/// link state and served slots.
pub fn cluster_nodes() -> Cmd {
    Cmd::new("CLUSTER").arg("NODES")
}

/// Creates a CLUSTER MYID command.
pub fn cluster_myid() -> Cmd {
    Cmd::new("CLUSTER").arg("MYID")
}

/// Creates an ASKING command.
///
/// Sent right before retrying a command that received an ASK redirect.
/// The flag only covers the immediately following command.
pub fn asking() -> Cmd {
    Cmd::new("ASKING")
}
