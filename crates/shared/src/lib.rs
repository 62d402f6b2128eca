//! Shared types for the phantomias relay server and upstream client.

pub mod error;
pub mod metrics;
pub mod protocol;

pub use error::*;
pub use protocol::*;
