//! Messages exchanged between the mission owner and its participants
//!
//! Messages travel as JSON documents. Each fan-out builds one encoded copy
//! per recipient; encoders never hand out a shared buffer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reward values keyed by dimension
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultidimensionalReward {
    values: BTreeMap<u32, f64>,
}

impl MultidimensionalReward {
    /// Empty reward
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `value` to `dimension`
    pub fn add(&mut self, dimension: u32, value: f64) {
        *self.values.entry(dimension).or_insert(0.0) += value;
    }

    /// Accumulate every dimension of `other`
    pub fn add_all(&mut self, other: &MultidimensionalReward) {
        for (dimension, value) in &other.values {
            self.add(*dimension, *value);
        }
    }

    /// Value for one dimension
    pub fn get(&self, dimension: u32) -> Option<f64> {
        self.values.get(&dimension).copied()
    }

    /// Whether no dimension has been touched
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sum over every dimension
    pub fn total(&self) -> f64 {
        self.values.values().sum()
    }

    /// Forget every dimension
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// `dim:value` pairs joined by commas, as streamed to agents
    pub fn to_wire_string(&self) -> String {
        self.values
            .iter()
            .map(|(dimension, value)| format!("{}:{}", dimension, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Messages between the owner and its participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum MissionMessage {
    /// A participant has built its handlers and is waiting to start
    AgentReady {
        /// Participant name from the mission description
        agent_name: String,
        /// Identity the host knows the participant by
        username: String,
        /// Requested turn position, if the participant takes turns
        turn_position: Option<u32>,
    },
    /// A participant has entered its running state
    AgentRunning {
        /// Identity the host knows the participant by
        username: String,
    },
    /// Every participant is ready; carries late-bound extra handlers
    AllPlayersJoined {
        /// Extra handler configuration keyed by handler name
        extra_handlers: BTreeMap<String, String>,
    },
    /// The owner is running; participants may act
    Go,
    /// The recipient may take its turn
    YourTurn,
    /// A participant has finished its turn
    TurnTaken {
        /// Identity of the participant that finished
        username: String,
    },
    /// A participant has finished the mission on its own
    AgentFinishedMission {
        /// Participant name from the mission description
        agent_name: String,
        /// Identity the host knows the participant by
        username: String,
    },
    /// A reward to be shared with every participant
    ShareReward {
        /// Participant that earned the reward
        agent_name: String,
        /// The reward
        reward: MultidimensionalReward,
    },
    /// The mission is over; participants should stop
    StopAgents {
        /// Why the mission ended
        quit_code: String,
    },
    /// A participant has stopped
    AgentStopped {
        /// Participant name from the mission description
        agent_name: String,
    },
    /// Every participant has stopped
    MissionOver,
    /// The owner aborted the mission
    Abort {
        /// Why the mission was aborted
        message: String,
    },
    /// A participant gave up on the mission
    ClientBailed {
        /// Identity of the participant
        username: String,
        /// What went wrong
        error: String,
    },
    /// Liveness probe
    Ping,
}

impl MissionMessage {
    /// Encode as JSON
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Decode from JSON
    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Short name of the message kind
    pub fn kind(&self) -> &'static str {
        match self {
            MissionMessage::AgentReady { .. } => "AgentReady",
            MissionMessage::AgentRunning { .. } => "AgentRunning",
            MissionMessage::AllPlayersJoined { .. } => "AllPlayersJoined",
            MissionMessage::Go => "Go",
            MissionMessage::YourTurn => "YourTurn",
            MissionMessage::TurnTaken { .. } => "TurnTaken",
            MissionMessage::AgentFinishedMission { .. } => "AgentFinishedMission",
            MissionMessage::ShareReward { .. } => "ShareReward",
            MissionMessage::StopAgents { .. } => "StopAgents",
            MissionMessage::AgentStopped { .. } => "AgentStopped",
            MissionMessage::MissionOver => "MissionOver",
            MissionMessage::Abort { .. } => "Abort",
            MissionMessage::ClientBailed { .. } => "ClientBailed",
            MissionMessage::Ping => "Ping",
        }
    }
}

/// How a participant's mission ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissionResult {
    /// Ended normally
    Ended,
    /// Content handlers could not be built
    HandlersFailed,
    /// The local world server could not be reached
    ServerUnreachable,
    /// No world was available to run in
    NoWorldLoaded,
    /// The world could not be created
    WorldCreationFailed,
    /// The agent could not be started
    AgentUnavailable,
    /// Connecting to the owner failed or the connection dropped
    ConnectionFailed,
    /// The owner aborted the mission
    AbortedByOwner,
    /// The owner did not release the participant in time
    TimedOut,
    /// The agent stopped responding
    AgentLost,
}

impl MissionResult {
    /// Human-readable description
    pub fn description(self) -> &'static str {
        match self {
            MissionResult::Ended => "Mission ended normally",
            MissionResult::HandlersFailed => "Failed to instantiate mission handlers",
            MissionResult::ServerUnreachable => "Could not reach the world server",
            MissionResult::NoWorldLoaded => "No world is loaded",
            MissionResult::WorldCreationFailed => "Failed to create the world",
            MissionResult::AgentUnavailable => "The agent could not be started",
            MissionResult::ConnectionFailed => "Lost or failed connection to the mission owner",
            MissionResult::AbortedByOwner => "The mission owner aborted the mission",
            MissionResult::TimedOut => "Timed out waiting for the mission to start",
            MissionResult::AgentLost => "Lost contact with the agent",
        }
    }
}

impl fmt::Display for MissionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Report sent to an agent when its mission ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionEndedReport {
    /// Outcome
    pub status: MissionResult,
    /// Quit code followed by accumulated error text
    pub human_readable_status: String,
    /// Reward still owed to the agent
    pub reward: MultidimensionalReward,
    /// When the mission ended
    pub ended_at: DateTime<Utc>,
}

impl MissionEndedReport {
    /// Report stamped with the current time
    pub fn new(status: MissionResult, report: String, reward: MultidimensionalReward) -> Self {
        Self {
            status,
            human_readable_status: report,
            reward,
            ended_at: Utc::now(),
        }
    }
}
