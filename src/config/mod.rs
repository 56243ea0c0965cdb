//! Configuration Module
//!
//! Loads the host and tunnel records from disk and parses addresses.

pub mod address;
pub mod error;
pub mod storage;
pub mod types;

pub use address::{Address, AddressError, Scope};
pub use error::{ConfigError, ValidationErrors};
pub use storage::{config_dir, default_config_file, expand_tilde, ConfigFormat};
pub use types::{Configuration, HostConfig, TunnelConfig};
