//! Configuration Module
//!
//! Handles configuration loading, validation, and the process-wide socket
//! defaults used by [`TransportConfig`].

pub mod manager;
pub mod types;

pub use manager::ConfigManager;
pub use types::*;
