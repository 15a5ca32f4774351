#![forbid(unsafe_code)]

//! Bauta core utilities: the error taxonomy, shared identifier types, IP prefix
//! helpers, and the TOML configuration model shared by the client and server
//! daemons.

pub mod config;
pub mod error;
pub mod ip;
pub mod types;

pub use config::{ClientConfig, FecSettings, ServerConfig};
pub use error::{Error, Result};
pub use types::ClientId;
