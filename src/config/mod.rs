//! Configuration module
//!
//! Loads the relay's listening address from an optional TOML file.

mod relay;

pub use relay::*;
