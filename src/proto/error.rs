use std::io;

use thiserror::Error;

/// Result type alias for slotmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while routing and executing commands against a cluster.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An IO error occurred.
    #[error("IO error: {source}")]
    Io {
        /// The underlying IO error.
        #[from]
        source: io::Error,
    },

    /// A protocol error occurred.
    #[error("protocol error: {message}")]
    Protocol {
        /// Description of the error.
        message: String,
    },

    /// The server returned an error reply.
    #[error("server error: {message}")]
    Server {
        /// Error message from server.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of invalid argument.
        message: String,
    },

    /// The requested node id is not part of the partition table.
    #[error("unknown node id {node_id}")]
    UnknownNode {
        /// The node id that was requested.
        node_id: String,
    },

    /// The address could not be reached or is not a valid endpoint.
    #[error("unable to connect to {address}: {message}")]
    Connection {
        /// The address (`host:port`) that was dialed.
        address: String,
        /// Reason reported by the transport.
        message: String,
    },

    /// The address is valid but not a member of the current topology.
    #[error("connection to {address} not allowed: not a known cluster member")]
    Membership {
        /// The rejected address.
        address: String,
    },

    /// An unsplittable command's keys map to more than one slot.
    #[error("CROSSSLOT keys in request don't hash to the same slot")]
    CrossSlot,

    /// No node owns the slot the key hashes to.
    #[error("slot {slot} is not served by any known node")]
    SlotUnassigned {
        /// The unowned slot.
        slot: u16,
    },

    /// MOVED/ASK redirects kept bouncing without converging.
    #[error("too many cluster redirections ({attempts})")]
    RedirectExhausted {
        /// Number of redirects followed before giving up.
        attempts: usize,
    },

    /// Key moved to another node (permanent redirect).
    #[error("MOVED to slot {slot} at {address}")]
    Moved {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node owning this slot (e.g., "127.0.0.1:7001").
        address: String,
    },

    /// Temporary redirect while a slot is being migrated.
    #[error("ASK to slot {slot} at {address}")]
    Ask {
        /// The slot number (0-16383).
        slot: u16,
        /// The address of the node temporarily handling this slot.
        address: String,
    },

    /// The cluster reported itself unavailable.
    #[error("CLUSTERDOWN cluster is down")]
    ClusterDown,

    /// The connection was closed while the command was outstanding.
    #[error("connection closed")]
    ConnectionClosed,

    /// An operation did not complete in time.
    #[error("operation timed out")]
    Timeout,
}

impl Error {
    /// Builds a [`Error::Connection`] for the given address.
    pub fn connection(address: impl Into<String>, message: impl ToString) -> Self {
        Self::Connection {
            address: address.into(),
            message: message.to_string(),
        }
    }

    /// Returns true if this error is a MOVED or ASK redirect.
    pub fn is_redirect(&self) -> bool {
        matches!(self, Error::Moved { .. } | Error::Ask { .. })
    }
}
