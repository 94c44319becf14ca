//! Sortie – mission orchestration for multi-agent simulated worlds
//!
//! This crate coordinates agent processes with a simulated-world host:
//! - A generic state-machine/episode engine driven from one home thread
//! - The mission owner and mission participant state machines
//! - The handshake by which participants find or start a mission
//! - Turn scheduling for turn-based multi-agent missions
//! - Length-prefixed socket framing, a listener pool, and a session
//!   gateway that multiplexes experiment resets over one port

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Orchestration runtime modules
pub mod runtime;

// Re-export key types for convenience
pub use runtime::{OrchestratorConfig, RuntimeError};

/// Current version of the Sortie crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version spoken on the gateway and handshake wires
pub const PROTOCOL_VERSION: &str = "1.0.0";
