//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream: unified async I/O abstraction
//! - Metadata: connection context for routing
//! - Address / Destination: network address representation
//! - Error: unified error types

mod address;
mod destination;
mod metadata;
mod stream;

pub use address::Address;
pub use destination::Destination;
pub use metadata::{Metadata, Network};
pub use stream::{AsyncReadWrite, PrefixedStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
