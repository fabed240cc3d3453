//! Configuration module for the peak normaliser
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;

pub use config::*;
