//! Shared fixtures: recording hosts, a scripted handler factory, and
//! helpers for driving machines from a test thread.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use sortie::runtime::OrchestratorConfig;
use sortie::runtime::episode::Machine;
use sortie::runtime::handlers::{
    CommandHandler, HandlerFactory, MissionBehaviour, ObservationProducer, QuitProducer,
    RewardProducer, VideoFrame, VideoProducer, WorldGenerator,
};
use sortie::runtime::host::{OwnerHost, ParticipantHost};
use sortie::runtime::machine::StateMachine;
use sortie::runtime::messages::{MissionMessage, MultidimensionalReward};
use sortie::runtime::mission::{AgentSection, MissionDescription, MissionInit, ServerConnection};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

pub fn config() -> OrchestratorConfig {
    OrchestratorConfig {
        bind_address: "127.0.0.1".into(),
        connect_timeout_ms: 200,
        ping_interval_ticks: 0,
        agent_ping_interval_ms: 0,
        gateway_port: 0,
        gateway_wait_ms: 50,
        ..OrchestratorConfig::default()
    }
}

pub fn mission(agents: &[&str], role: usize) -> MissionInit {
    MissionInit::new(
        MissionDescription {
            name: "capture-the-flag".into(),
            agents: agents
                .iter()
                .map(|name| AgentSection {
                    name: name.to_string(),
                    handlers: Value::Null,
                })
                .collect(),
            content: json!({"seed": 7}),
        },
        role,
    )
}

/// Tick until `done` holds or five seconds pass
pub fn tick_until<M: Machine>(machine: &StateMachine<M>, mut done: impl FnMut(&StateMachine<M>) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        machine.tick();
        machine.pump();
        if done(machine) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

// ---- owner host ----

#[derive(Clone, Default)]
pub struct OwnerWire {
    pub connected: Arc<Mutex<Vec<String>>>,
    pub sent: Arc<Mutex<Vec<(String, MissionMessage)>>>,
}

impl OwnerWire {
    pub fn connect(&self, identity: &str) {
        self.connected.lock().push(identity.to_string());
    }

    pub fn disconnect(&self, identity: &str) {
        self.connected.lock().retain(|id| id != identity);
    }

    /// Messages of one kind, with their recipients
    pub fn sent_of(&self, kind: &str) -> Vec<(String, MissionMessage)> {
        self.sent
            .lock()
            .iter()
            .filter(|(_, message)| message.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn host(&self) -> Box<dyn OwnerHost> {
        Box::new(RecordingOwnerHost { wire: self.clone() })
    }
}

struct RecordingOwnerHost {
    wire: OwnerWire,
}

impl OwnerHost for RecordingOwnerHost {
    fn connected_identities(&self) -> Vec<String> {
        self.wire.connected.lock().clone()
    }

    fn send_to(&mut self, identity: &str, message: &MissionMessage) -> bool {
        if !self.wire.connected.lock().iter().any(|id| id == identity) {
            return false;
        }
        self.wire
            .sent
            .lock()
            .push((identity.to_string(), message.clone()));
        true
    }
}

// ---- participant host ----

#[derive(Clone, Default)]
pub struct ParticipantWire {
    pub to_owner: Arc<Mutex<Vec<MissionMessage>>>,
    pub world_exists: Arc<AtomicBool>,
    pub worlds_started: Arc<AtomicUsize>,
    pub joined: Arc<Mutex<Vec<ServerConnection>>>,
}

impl ParticipantWire {
    pub fn sent_of(&self, kind: &str) -> Vec<MissionMessage> {
        self.to_owner
            .lock()
            .iter()
            .filter(|message| message.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn host(&self, username: &str) -> Box<dyn ParticipantHost> {
        Box::new(RecordingParticipantHost {
            username: username.to_string(),
            wire: self.clone(),
        })
    }
}

struct RecordingParticipantHost {
    username: String,
    wire: ParticipantWire,
}

impl ParticipantHost for RecordingParticipantHost {
    fn username(&self) -> String {
        self.username.clone()
    }

    fn send_to_owner(&mut self, message: &MissionMessage) -> bool {
        self.wire.to_owner.lock().push(message.clone());
        true
    }

    fn world_exists(&self) -> bool {
        self.wire.world_exists.load(Ordering::SeqCst)
    }

    fn player_name(&self) -> Option<String> {
        None
    }

    fn pause_world(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn close_world(&mut self) -> anyhow::Result<()> {
        self.wire.world_exists.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn start_world_server(&mut self, _mission: &MissionInit) -> anyhow::Result<()> {
        self.wire.worlds_started.fetch_add(1, Ordering::SeqCst);
        self.wire.world_exists.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn hand_to_local_owner(&mut self, _mission: &MissionInit) -> anyhow::Result<()> {
        Ok(())
    }

    fn open_to_peers(&mut self) -> anyhow::Result<ServerConnection> {
        Ok(ServerConnection {
            address: "10.0.0.1".into(),
            port: 25565,
        })
    }

    fn connect_to_server(&mut self, server: &ServerConnection) -> anyhow::Result<()> {
        self.wire.joined.lock().push(server.clone());
        Ok(())
    }
}

// ---- handlers ----

/// Knobs and records shared between a test and the handlers it creates
#[derive(Default)]
pub struct Script {
    pub quit: AtomicBool,
    pub fail_agent_handlers: AtomicBool,
    pub turn_position: Mutex<Option<u32>>,
    pub executed: Mutex<Vec<String>>,
}

pub struct ScriptedFactory(pub Arc<Script>);

impl ScriptedFactory {
    pub fn new() -> (Arc<Script>, Arc<dyn HandlerFactory>) {
        let script = Arc::new(Script::default());
        (Arc::clone(&script), Arc::new(ScriptedFactory(script)))
    }
}

struct FlatWorld;

impl WorldGenerator for FlatWorld {
    fn create_world(&mut self, _mission: &MissionInit) -> anyhow::Result<()> {
        Ok(())
    }
}

struct FlagQuit(Arc<Script>);

impl QuitProducer for FlagQuit {
    fn do_i_want_to_quit(&mut self, _mission: &MissionInit) -> bool {
        self.0.quit.load(Ordering::SeqCst)
    }

    fn outcome(&self) -> String {
        "flag raised".into()
    }
}

struct OnePerTick;

impl RewardProducer for OnePerTick {
    fn get_reward(&mut self, _mission: &MissionInit, reward: &mut MultidimensionalReward) {
        reward.add(0, 1.0);
    }
}

#[derive(Default)]
struct TickCounter(u64);

impl ObservationProducer for TickCounter {
    fn write_observation(&mut self, _mission: &MissionInit, out: &mut Map<String, Value>) {
        self.0 += 1;
        out.insert("ticks".into(), json!(self.0));
    }
}

struct Recorder(Arc<Script>);

impl CommandHandler for Recorder {
    fn execute(&mut self, command: &str, _mission: &MissionInit) -> bool {
        self.0.executed.lock().push(command.to_string());
        true
    }
}

struct Stripes;

impl VideoProducer for Stripes {
    fn width(&self) -> u32 {
        2
    }

    fn height(&self) -> u32 {
        1
    }

    fn frame(&mut self, _mission: &MissionInit) -> Option<VideoFrame> {
        Some(VideoFrame {
            header: vec![0; 4],
            pixels: vec![7, 7, 7, 9, 9, 9],
        })
    }
}

impl HandlerFactory for ScriptedFactory {
    fn owner_behaviour(&self, _mission: &MissionInit) -> anyhow::Result<MissionBehaviour> {
        Ok(MissionBehaviour {
            world_generator: Some(Box::new(FlatWorld)),
            quit_producer: Some(Box::new(FlagQuit(Arc::clone(&self.0)))),
            ..MissionBehaviour::default()
        })
    }

    fn agent_behaviour(&self, _mission: &MissionInit) -> anyhow::Result<MissionBehaviour> {
        if self.0.fail_agent_handlers.load(Ordering::SeqCst) {
            anyhow::bail!("no such handler: TeleportCommands");
        }
        Ok(MissionBehaviour {
            quit_producer: Some(Box::new(FlagQuit(Arc::clone(&self.0)))),
            reward_producer: Some(Box::new(OnePerTick)),
            observation_producer: Some(Box::new(TickCounter::default())),
            command_handler: Some(Box::new(Recorder(Arc::clone(&self.0)))),
            video_producer: Some(Box::new(Stripes)),
            turn_position: *self.0.turn_position.lock(),
            ..MissionBehaviour::default()
        })
    }
}
