//! shellgate-config: configuration for the shellgate WebSocket gateway
//!
//! This crate provides TOML configuration parsing and validation for the
//! listener, the upstream gateway, and the logging stack.

pub mod config;

pub use config::*;
