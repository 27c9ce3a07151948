//! # Slotmux
//!
//! Cluster-aware Redis client with hash-slot routing, predicate-based node
//! selections and pipelined fan-out over multiplexed node connections.
//!
//! ## Features
//!
//! - `test-utils` - In-process mock cluster for integration tests
//!
//! ## Example
//!
//! ```no_run
//! use slotmux::ClusterClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ClusterClient::connect("127.0.0.1:7000").await?;
//!
//!     client.mset([("a", "1"), ("b", "2")]).await?;
//!     let removed = client.del(["a", "b"]).await?;
//!     assert_eq!(removed, 2);
//!
//!     let masters = client.masters();
//!     for node in &masters {
//!         println!("{} serves {} slots", node.id, node.slot_count());
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]

pub mod cluster;
pub mod core;
pub mod proto;

#[cfg(test)]
mod stress;

cfg_if::cfg_if! {
    if #[cfg(any(test, feature = "test-utils"))] {
        pub mod testing;
    }
}

pub use crate::cluster::{key_slot, ClusterClient, ClusterClientBuilder, ClusterOptions};
pub use crate::core::{CommandFuture, Error, Result};
