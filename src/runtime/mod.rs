//! Orchestration runtime and shared configuration
//!
//! This module wires together the episode engine, the owner and participant
//! state machines, the network plumbing they talk over, and the session
//! gateway. `OrchestratorConfig` carries every tunable the subsystems read.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// Submodules
pub mod episode;
pub mod error;
pub mod framing;
pub mod gateway;
pub mod handlers;
pub mod handshake;
pub mod host;
pub mod listener;
pub mod machine;
pub mod messages;
pub mod mission;
pub mod owner;
pub mod participant;
pub mod schedule;
pub mod storage;
pub mod tokens;

pub use error::{Result, RuntimeError};

/// Configuration shared by the owner, participant and gateway
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Address the listeners bind to
    pub bind_address: String,

    /// Fixed mission-control port for a participant (0 allocates one)
    pub mission_control_port: u16,

    /// Lowest port probed when allocating a mission-control port
    pub min_mission_control_port: u16,

    /// Lowest port probed when allocating a free port
    pub min_free_port: u16,

    /// Highest port probed when allocating any port
    pub max_free_port: u16,

    /// Bounded connect timeout for outbound framed channels
    pub connect_timeout_ms: u64,

    /// Home-thread tick period used by drivers
    pub tick_interval_ms: u64,

    /// Ticks between liveness pings while waiting for the owner
    pub ping_interval_ticks: u32,

    /// Period between agent pings while running
    pub agent_ping_interval_ms: u64,

    /// Consecutive send failures tolerated before a peer is declared lost
    pub failed_send_tolerance: u32,

    /// Largest frame or command accepted from the wire
    pub max_frame_len: usize,

    /// Abort assembly if not every participant has joined within this time
    pub assembly_timeout_ms: Option<u64>,

    /// Abort if the owner has not released the participant within this many ticks
    pub server_ready_timeout_ticks: Option<u64>,

    /// Port the session gateway listens on
    pub gateway_port: u16,

    /// Longest a gateway request waits on the shared mission state
    pub gateway_wait_ms: u64,

    /// Lifetime of a rendezvous token
    pub token_shelf_life_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            mission_control_port: 0,
            min_mission_control_port: listener::MIN_MISSION_CONTROL_PORT,
            min_free_port: listener::MIN_FREE_PORT,
            max_free_port: listener::MAX_FREE_PORT,
            connect_timeout_ms: 1000,
            tick_interval_ms: 50,
            ping_interval_ticks: 10,
            agent_ping_interval_ms: 1000,
            failed_send_tolerance: 3,
            max_frame_len: framing::MAX_FRAME_LEN,
            assembly_timeout_ms: None,
            server_ready_timeout_ticks: None,
            gateway_port: 9000,
            gateway_wait_ms: 3000,
            token_shelf_life_secs: 600,
        }
    }
}

impl OrchestratorConfig {
    /// Connect timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Tick period as a `Duration`
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Agent ping period as a `Duration`
    pub fn agent_ping_interval(&self) -> Duration {
        Duration::from_millis(self.agent_ping_interval_ms)
    }

    /// Assembly timeout, if any
    pub fn assembly_timeout(&self) -> Option<Duration> {
        self.assembly_timeout_ms.map(Duration::from_millis)
    }

    /// Gateway wait bound as a `Duration`
    pub fn gateway_wait(&self) -> Duration {
        Duration::from_millis(self.gateway_wait_ms)
    }

    /// Token shelf life as a `Duration`
    pub fn token_shelf_life(&self) -> Duration {
        Duration::from_secs(self.token_shelf_life_secs)
    }

    /// Check the port ranges and limits for obvious mistakes
    pub fn validate(&self) -> Result<()> {
        if self.min_free_port > self.max_free_port {
            return Err(RuntimeError::Config(format!(
                "free port range is empty: {}..={}",
                self.min_free_port, self.max_free_port
            )));
        }
        if self.min_mission_control_port > self.max_free_port {
            return Err(RuntimeError::Config(format!(
                "mission control range is empty: {}..={}",
                self.min_mission_control_port, self.max_free_port
            )));
        }
        if self.max_frame_len == 0 {
            return Err(RuntimeError::Config("max_frame_len must be positive".into()));
        }
        Ok(())
    }
}
