//! The MissionInit document and the control-port envelope that carries it
//!
//! The mission description itself stays opaque: the runtime reads the
//! experiment id, role, reset counter, participant names, and connection
//! details, and fingerprints the rest to decide whether two requests refer
//! to the same mission.

use super::error::{MissionError, MissionResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Envelope `type` tag for a MissionInit control message
pub const MISSION_INIT_TYPE: &str = "MissionInit";

/// Where the mission owner's world server can be reached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnection {
    /// Host address
    pub address: String,
    /// Port
    pub port: u16,
}

/// Endpoints of the agent process driving one participant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConnection {
    /// Address the agent listens on
    pub agent_address: String,
    /// Address the participant is reachable at
    pub client_address: String,
    /// Agent's mission-control port
    pub mission_control_port: u16,
    /// Participant's command port (0 allocates one)
    pub commands_port: u16,
    /// Agent's observation port
    pub observations_port: u16,
    /// Agent's reward port
    pub rewards_port: u16,
    /// Agent's video port
    pub video_port: u16,
}

/// One named participant in the mission description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Participant name
    pub name: String,
    /// Opaque per-participant handler configuration
    #[serde(default)]
    pub handlers: Value,
}

/// The opaque mission description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionDescription {
    /// Human-readable mission name
    #[serde(default)]
    pub name: String,
    /// Participants, indexed by role
    pub agents: Vec<AgentSection>,
    /// Opaque world and server handler configuration
    #[serde(default)]
    pub content: Value,
}

/// Everything a participant needs to join one run of a mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionInit {
    /// Experiment this run belongs to
    pub experiment_id: String,
    /// Index of this participant in the agent list
    pub role: usize,
    /// How many times the experiment has been reset
    #[serde(default)]
    pub reset: u64,
    /// Version of the platform that produced the document
    #[serde(default)]
    pub platform_version: String,
    /// The mission description
    pub mission: MissionDescription,
    /// Owner's world server, once known
    #[serde(default)]
    pub server_connection: Option<ServerConnection>,
    /// Agent endpoints for this participant
    #[serde(default)]
    pub agent_connection: AgentConnection,
}

#[derive(Serialize)]
struct ControlEnvelopeRef<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    mission_init: &'a MissionInit,
}

impl MissionInit {
    /// Build a document for `role` in a fresh experiment
    pub fn new(mission: MissionDescription, role: usize) -> Self {
        Self {
            experiment_id: Uuid::new_v4().to_string(),
            role,
            reset: 0,
            platform_version: crate::PROTOCOL_VERSION.to_string(),
            mission,
            server_connection: None,
            agent_connection: AgentConnection::default(),
        }
    }

    /// Decode and validate a bare document
    pub fn from_bytes(bytes: &[u8]) -> MissionResult<Self> {
        let init: Self = serde_json::from_slice(bytes)?;
        init.validate()?;
        Ok(init)
    }

    /// Encode as a bare document
    pub fn to_bytes(&self) -> MissionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Check the structural rules the runtime relies on
    pub fn validate(&self) -> MissionResult<()> {
        if self.experiment_id.trim().is_empty() {
            return Err(MissionError::Invalid("experiment id is empty".into()));
        }
        if self.mission.agents.is_empty() {
            return Err(MissionError::Invalid("mission declares no agents".into()));
        }
        if self.role >= self.mission.agents.len() {
            return Err(MissionError::Invalid(format!(
                "role {} out of range for {} agents",
                self.role,
                self.mission.agents.len()
            )));
        }
        if let Some(name) = self.mission.agents.iter().find(|a| a.name.is_empty()) {
            return Err(MissionError::Invalid(format!(
                "agent with empty name in {:?}",
                name
            )));
        }
        Ok(())
    }

    /// Experiment id
    pub fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    /// Role of the participant this document was issued to
    pub fn role(&self) -> usize {
        self.role
    }

    /// Reset counter
    pub fn reset(&self) -> u64 {
        self.reset
    }

    /// Number of declared participants
    pub fn agent_count(&self) -> usize {
        self.mission.agents.len()
    }

    /// Names of every declared participant, in role order
    pub fn agent_names(&self) -> Vec<String> {
        self.mission.agents.iter().map(|a| a.name.clone()).collect()
    }

    /// Name of the participant this document was issued to
    pub fn agent_name(&self) -> Option<&str> {
        self.mission.agents.get(self.role).map(|a| a.name.as_str())
    }

    /// Agent section for this participant
    pub fn agent_section(&self) -> Option<&AgentSection> {
        self.mission.agents.get(self.role)
    }

    /// Owner's world server, if known
    pub fn server_connection(&self) -> Option<&ServerConnection> {
        self.server_connection.as_ref()
    }

    /// Record where the owner's world server can be reached
    pub fn set_server_connection(&mut self, address: impl Into<String>, port: u16) {
        self.server_connection = Some(ServerConnection {
            address: address.into(),
            port,
        });
    }

    /// Whether the mission has more than one participant
    pub fn is_multi_agent(&self) -> bool {
        self.agent_count() > 1
    }

    /// Hash of the mission description
    pub fn fingerprint(&self) -> String {
        let bytes = serde_json::to_vec(&self.mission).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    /// Same experiment and same mission content
    pub fn matches(&self, other: &MissionInit) -> bool {
        self.experiment_id == other.experiment_id && self.fingerprint() == other.fingerprint()
    }

    /// Wrap the document in a control-port envelope
    pub fn to_control_bytes(&self) -> MissionResult<Vec<u8>> {
        Ok(serde_json::to_vec(&ControlEnvelopeRef {
            kind: MISSION_INIT_TYPE,
            mission_init: self,
        })?)
    }

    /// Decode a control-port envelope
    ///
    /// Unparseable input or any other `type` yields `NotUnderstood`; a
    /// MissionInit that fails to decode or validate yields `Json` or `Invalid`.
    pub fn from_control_bytes(bytes: &[u8]) -> MissionResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| MissionError::NotUnderstood(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MissionError::NotUnderstood("missing message type".into()))?;
        if kind != MISSION_INIT_TYPE {
            return Err(MissionError::NotUnderstood(kind.to_string()));
        }
        let body = value
            .get("mission_init")
            .cloned()
            .ok_or_else(|| MissionError::Invalid("missing mission_init body".into()))?;
        let init: Self = serde_json::from_value(body)?;
        init.validate()?;
        Ok(init)
    }
}
