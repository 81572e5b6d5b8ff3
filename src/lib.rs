//! Hypothesis Economy Library
//!
//! Exposes the engine and its configuration for the CLI and tests.

pub mod config;
pub mod economy;

pub use config::EngineConfig;
