//! Interfaces to the simulated-world host
//!
//! The owner needs to know who is connected and to message them; the
//! participant needs to message its owner and to ask the host to create,
//! pause, close, or join worlds. `FramedOwnerHost` and `drain_inbox`
//! carry `MissionMessage`s over framed sockets between processes.

use super::episode::Machine;
use super::framing::FramedChannel;
use super::listener::ListenerPool;
use super::machine::StateMachine;
use super::messages::MissionMessage;
use super::mission::{MissionInit, ServerConnection};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// What the owner machine needs from its host
pub trait OwnerHost: Send {
    /// Identities currently connected to the owner's world
    fn connected_identities(&self) -> Vec<String>;

    /// Send one message to one identity
    fn send_to(&mut self, identity: &str, message: &MissionMessage) -> bool;

    /// Send a message to every connected identity, one copy per recipient
    fn broadcast(&mut self, message: &MissionMessage) {
        for identity in self.connected_identities() {
            let copy = message.clone();
            if !self.send_to(&identity, &copy) {
                tracing::warn!("Failed to send {} to {}", copy.kind(), identity);
            }
        }
    }
}

/// What the participant machine needs from its host
pub trait ParticipantHost: Send {
    /// Identity the owner knows this participant by
    fn username(&self) -> String;

    /// Send a message to the mission owner
    fn send_to_owner(&mut self, message: &MissionMessage) -> bool;

    /// Whether a world is currently loaded
    fn world_exists(&self) -> bool;

    /// Name of the player in the loaded world, if any
    fn player_name(&self) -> Option<String>;

    /// Ask the loaded world's server to pause
    fn pause_world(&mut self) -> anyhow::Result<()>;

    /// Whether the paused world's server has stopped ticking
    fn world_paused(&self) -> bool {
        true
    }

    /// Close the loaded world
    fn close_world(&mut self) -> anyhow::Result<()>;

    /// Start serving the freshly created world
    fn start_world_server(&mut self, mission: &MissionInit) -> anyhow::Result<()>;

    /// Hand the mission to the owner running in this host
    fn hand_to_local_owner(&mut self, mission: &MissionInit) -> anyhow::Result<()>;

    /// Open the local world to other participants
    fn open_to_peers(&mut self) -> anyhow::Result<ServerConnection>;

    /// Join the owner's world
    fn connect_to_server(&mut self, server: &ServerConnection) -> anyhow::Result<()>;

    /// Whether the area around the start position has loaded
    fn start_position_ready(&self) -> bool {
        true
    }
}

/// A message tagged with its sender, as carried between processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender identity
    pub from: String,
    /// The message
    pub message: MissionMessage,
}

impl Envelope {
    /// Encode as JSON
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// Owner host that reaches each participant over its own framed channel
#[derive(Debug)]
pub struct FramedOwnerHost {
    sender: String,
    connect_timeout: Duration,
    peers: BTreeMap<String, FramedChannel>,
}

impl FramedOwnerHost {
    /// Host that signs outgoing envelopes as `sender`
    pub fn new(sender: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            sender: sender.into(),
            connect_timeout,
            peers: BTreeMap::new(),
        }
    }

    /// Register where a participant's inbox listens
    pub fn register(&mut self, identity: impl Into<String>, address: &str, port: u16) {
        let identity = identity.into();
        tracing::debug!("Registered participant {} at {}:{}", identity, address, port);
        self.peers.insert(
            identity,
            FramedChannel::new(address, port, self.connect_timeout),
        );
    }

    /// Forget a participant
    pub fn unregister(&mut self, identity: &str) {
        if let Some(mut channel) = self.peers.remove(identity) {
            channel.close();
        }
    }
}

impl OwnerHost for FramedOwnerHost {
    fn connected_identities(&self) -> Vec<String> {
        self.peers.keys().cloned().collect()
    }

    fn send_to(&mut self, identity: &str, message: &MissionMessage) -> bool {
        let Some(channel) = self.peers.get_mut(identity) else {
            return false;
        };
        let envelope = Envelope {
            from: self.sender.clone(),
            message: message.clone(),
        };
        match envelope.to_bytes() {
            Ok(bytes) => channel.send(&bytes),
            Err(e) => {
                tracing::error!("Failed to encode {}: {}", message.kind(), e);
                false
            }
        }
    }
}

/// Deliver every queued envelope in `inbox` to `machine`
///
/// Returns how many messages were delivered. Undecodable commands are
/// logged and dropped.
pub fn drain_inbox<M>(inbox: &ListenerPool, machine: &StateMachine<M>) -> usize
where
    M: Machine<Message = MissionMessage>,
{
    let mut delivered = 0;
    while let Some(received) = inbox.pop_command_with_peer() {
        match serde_json::from_str::<Envelope>(&received.command) {
            Ok(envelope) => {
                machine.deliver(&envelope.from, &envelope.message);
                delivered += 1;
            }
            Err(e) => tracing::warn!(
                "{}: dropping undecodable message from {}: {}",
                inbox.name(),
                received.peer,
                e
            ),
        }
    }
    delivered
}
