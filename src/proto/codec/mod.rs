//! RESP encoder and streaming decoder.
//!
//! - [`encoder`] - Frame encoding to bytes, single frames or whole batches
//! - [`decoder`] - Incremental frame decoder over a growing buffer

pub mod decoder;
pub mod encoder;

pub use decoder::Decoder;
pub use encoder::Encoder;
