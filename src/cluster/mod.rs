//! # Cluster
//!
//! Slot routing, topology tracking and fan-out over cluster nodes.
//!
//! ## Overview
//!
//! - [`Partitions`] holds the node list and the slot lookup as a
//!   copy-on-write snapshot.
//! - A connection registry opens and caches one connection per node id or
//!   `host:port`, optionally refusing addresses outside the topology.
//! - [`NodeSelection`] picks nodes by predicate, either once or live.
//! - [`ClusterClient`] routes commands by key, splits multi-key commands per
//!   slot, fans admin commands out and follows `MOVED`/`ASK` redirects.
//!
//! ## Hash tags
//!
//! Only the part of a key between the first `{` and the following `}` is
//! hashed, so `{user:1}:name` and `{user:1}:email` always share a slot.
//!
//! ```
//! use slotmux::key_slot;
//!
//! assert_eq!(key_slot("{user:1}:name"), key_slot("{user:1}:email"));
//! ```

pub mod aggregate;
mod builder;
mod client;
pub mod commands;
mod executions;
mod node;
mod partitions;
mod redirect;
mod registry;
mod router;
mod selection;
mod slot;
mod topology;


pub use builder::{ClusterClientBuilder, ClusterOptions};
pub use client::ClusterClient;
pub use executions::AsyncExecutions;
pub use node::NodeConnection;
pub use partitions::{PartitionTable, Partitions};
pub use redirect::DEFAULT_MAX_REDIRECTS;
pub use selection::{predicates, NodePredicate, NodeSelection, SelectionCommands};
pub use slot::{key_slot, SLOT_COUNT};
pub use topology::{parse_cluster_nodes, ClusterNode, NodeFlag, NodeFlags, NodeId, SlotRange};
