//! Shared helpers.
//!
//! - [`trigram`] - 3-byte sequence extraction and the index case fold
//! - [`host`] - local host detection and peer endpoints

pub mod host;
pub mod trigram;

pub use host::{Endpoint, LocalHosts};
pub use trigram::*;
