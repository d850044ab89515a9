//! Core types for Bull Vision.
//!
//! Configuration shared by the host binary and the application context.

mod config;

pub use config::{AgentConfig, Config, ServerEntry, SessionConfig};
