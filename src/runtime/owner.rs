//! The mission owner state machine
//!
//! The owner hosts the shared world. It takes a MissionInit (handed over
//! directly or accepted through the handshake), builds the world, waits for
//! every declared participant to report ready and then running, runs the
//! mission, and waits for every participant to stop before cleaning up.
//! Any failure goes through `Error` and `CleanUp` back to `Dormant`.

use super::OrchestratorConfig;
use super::episode::{Episode, EpisodeContext, Lifecycle, Machine, MachineState};
use super::error::ListenerResult;
use super::handlers::{HandlerFactory, MissionBehaviour};
use super::handshake::{HandshakeHook, MissionSlot};
use super::host::OwnerHost;
use super::listener::{CommandFraming, ListenerOptions, ListenerPool, PortSpec};
use super::machine::StateMachine;
use super::messages::MissionMessage;
use super::mission::{MissionInit, ServerConnection};
use super::schedule::{TurnSchedule, TurnScheduleBuilder};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Quit code used when every participant finished on its own
pub const ALL_AGENTS_FINISHED: &str = "All agents finished";

/// States of the mission owner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerState {
    /// Waiting for the host to finish starting
    WaitingForModReady,
    /// Idle, accepting a new mission
    Dormant,
    /// Decorating the world for the mission
    BuildingWorld,
    /// Waiting for every participant to report ready and running
    WaitingForAgentsToAssemble,
    /// The mission is running
    Running,
    /// Waiting for every participant to stop
    WaitingForAgentsToQuit,
    /// The mission ended; passes straight to clean-up
    MissionEnded,
    /// The mission was aborted; passes through the error path
    MissionAborted,
    /// Something failed; passes straight to clean-up
    Error,
    /// Forgetting the mission
    CleanUp,
}

impl fmt::Display for OwnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl MachineState for OwnerState {}

/// Machine data for the mission owner
pub struct Owner {
    config: OrchestratorConfig,
    slot: Arc<MissionSlot>,
    control: Option<ListenerPool>,
    host: Box<dyn OwnerHost>,
    factory: Arc<dyn HandlerFactory>,
    queued: VecDeque<MissionInit>,
    mission: Option<MissionInit>,
    behaviour: MissionBehaviour,
    quit_code: String,
    watch_list: Vec<String>,
    user_to_agent: BTreeMap<String, String>,
    schedule: TurnSchedule,
}

impl Owner {
    /// Owner without a control port; missions arrive via `queue_mission`
    pub fn new(
        config: OrchestratorConfig,
        host: Box<dyn OwnerHost>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            config,
            slot: Arc::new(MissionSlot::new()),
            control: None,
            host,
            factory,
            queued: VecDeque::new(),
            mission: None,
            behaviour: MissionBehaviour::default(),
            quit_code: String::new(),
            watch_list: Vec::new(),
            user_to_agent: BTreeMap::new(),
            schedule: TurnSchedule::default(),
        }
    }

    /// Also answer handshakes on a control port
    pub fn with_control_port(mut self, spec: PortSpec) -> ListenerResult<Self> {
        let options = ListenerOptions {
            bind_address: self.config.bind_address.clone(),
            framing: CommandFraming::Length,
            max_command_len: self.config.max_frame_len,
        };
        let hook = Arc::new(HandshakeHook::new("owner", Arc::clone(&self.slot)));
        let pool = ListenerPool::start("owner-control", spec, options, hook);
        pool.wait_for_port()?;
        self.control = Some(pool);
        Ok(self)
    }

    /// Start the machine on the calling thread
    pub fn start(self) -> StateMachine<Owner> {
        StateMachine::new(self, OwnerState::WaitingForModReady)
    }

    /// Port the handshake listener is bound to
    pub fn control_port(&self) -> Option<u16> {
        self.control.as_ref().and_then(ListenerPool::port)
    }

    /// Hand a mission over directly
    pub fn queue_mission(&mut self, mission: MissionInit) {
        self.queued.push_back(mission);
    }

    /// Publish where participants can reach the world server
    pub fn set_server_connection(&mut self, server: ServerConnection) {
        if let Some(mission) = self.mission.as_mut() {
            mission.server_connection = Some(server.clone());
        }
        self.slot
            .update_current(|mission| mission.server_connection = Some(server));
    }

    /// Mission being run, if any
    pub fn current_mission(&self) -> Option<&MissionInit> {
        self.mission.as_ref()
    }

    /// Shared mission record read by the handshake hook
    pub fn slot(&self) -> Arc<MissionSlot> {
        Arc::clone(&self.slot)
    }

    /// Identities whose disconnection aborts the mission
    pub fn watch_list(&self) -> &[String] {
        &self.watch_list
    }

    /// Agent name reported by a connected identity
    pub fn agent_for(&self, username: &str) -> Option<&str> {
        self.user_to_agent.get(username).map(String::as_str)
    }

    /// Current turn order
    pub fn turn_schedule(&self) -> &TurnSchedule {
        &self.schedule
    }

    /// Why the last mission ended
    pub fn quit_code(&self) -> &str {
        &self.quit_code
    }

    fn take_next_mission(&mut self) -> Option<MissionInit> {
        if let Some(mission) = self.queued.pop_front() {
            return Some(mission);
        }
        let control = self.control.as_ref()?;
        while let Some(received) = control.pop_command_with_peer() {
            match MissionInit::from_control_bytes(received.command.as_bytes()) {
                Ok(mission) => return Some(mission),
                Err(e) => {
                    tracing::warn!("owner: dropping request from {}: {}", received.peer, e);
                    self.slot.set_idle(true);
                }
            }
        }
        None
    }

    fn discard_stale_missions(&mut self) {
        let mut stale = self.queued.len();
        self.queued.clear();
        if let Some(control) = self.control.as_ref() {
            stale += control.clear_commands();
        }
        if stale > 0 {
            tracing::warn!("owner: discarded {} stale mission request(s)", stale);
        }
    }

    fn lost_watched_identity(&self) -> Option<String> {
        if self.watch_list.is_empty() {
            return None;
        }
        let connected = self.host.connected_identities();
        self.watch_list
            .iter()
            .find(|id| !connected.contains(id))
            .cloned()
    }

    fn give_turn(&mut self, identity: &str) -> bool {
        if self.host.send_to(identity, &MissionMessage::YourTurn) {
            return true;
        }
        match self.behaviour.world_decorator.as_mut() {
            Some(decorator) => decorator.targeted_update(identity),
            None => false,
        }
    }
}

impl Machine for Owner {
    type State = OwnerState;
    type Message = MissionMessage;

    fn name(&self) -> &'static str {
        "owner"
    }

    fn episode_for(&mut self, state: OwnerState) -> Box<dyn Episode<Self>> {
        match state {
            OwnerState::WaitingForModReady => Box::new(InitialiseOwner),
            OwnerState::Dormant => Box::new(Dormant),
            OwnerState::BuildingWorld => Box::new(BuildingWorld),
            OwnerState::WaitingForAgentsToAssemble => Box::new(WaitingForAgentsToAssemble::default()),
            OwnerState::Running => Box::new(Running::default()),
            OwnerState::WaitingForAgentsToQuit => Box::new(WaitingForAgentsToQuit::default()),
            OwnerState::MissionEnded => Box::new(Conclude { aborted: false }),
            OwnerState::MissionAborted => Box::new(Conclude { aborted: true }),
            OwnerState::Error => Box::new(ErrorState),
            OwnerState::CleanUp => Box::new(CleanUp),
        }
    }

    fn on_pre_state_change(&mut self, from: OwnerState, to: OwnerState) {
        tracing::debug!("owner: leaving {} for {}", from, to);
        self.slot.set_idle(false);
    }
}

// Abort the mission for everyone and head for the error state.
fn fail(cx: &mut EpisodeContext<'_, Owner>, reason: &str) {
    tracing::error!("owner: {}", reason);
    cx.save_error_details(reason);
    cx.machine.host.broadcast(&MissionMessage::Abort {
        message: reason.to_string(),
    });
    cx.complete(OwnerState::Error);
}

fn on_client_bailed(cx: &mut EpisodeContext<'_, Owner>, message: &MissionMessage) -> bool {
    if let MissionMessage::ClientBailed { username, error } = message {
        fail(cx, &format!("{} bailed: {}", username, error));
        return true;
    }
    false
}

fn check_watch_list(cx: &mut EpisodeContext<'_, Owner>) -> bool {
    match cx.machine.lost_watched_identity() {
        Some(identity) => {
            fail(cx, &format!("Lost contact with {}", identity));
            true
        }
        None => false,
    }
}

struct InitialiseOwner;

impl Episode<Owner> for InitialiseOwner {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        cx.machine.slot.set_idle(false);
        Ok(())
    }

    fn on_lifecycle(
        &mut self,
        cx: &mut EpisodeContext<'_, Owner>,
        event: &Lifecycle,
    ) -> anyhow::Result<()> {
        if *event == Lifecycle::HostReady {
            cx.complete(OwnerState::Dormant);
        }
        Ok(())
    }
}

struct Dormant;

impl Episode<Owner> for Dormant {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        cx.clear_error_details();
        cx.machine.discard_stale_missions();
        cx.machine.slot.set_current(None);
        cx.machine.slot.set_idle(true);
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        let Some(mission) = cx.machine.take_next_mission() else {
            return Ok(());
        };
        cx.machine.slot.set_idle(false);
        tracing::info!(
            "owner: received mission for experiment {} (reset {})",
            mission.experiment_id(),
            mission.reset()
        );
        cx.machine.slot.set_current(Some(mission.clone()));
        match cx.machine.factory.owner_behaviour(&mission) {
            Ok(behaviour) => {
                cx.machine.behaviour = behaviour;
                cx.machine.mission = Some(mission);
                cx.complete(OwnerState::BuildingWorld);
            }
            Err(e) => {
                cx.machine.mission = Some(mission);
                fail(cx, &format!("Could not create mission handlers: {:#}", e));
            }
        }
        Ok(())
    }
}

struct BuildingWorld;

impl Episode<Owner> for BuildingWorld {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        let Owner {
            behaviour, mission, ..
        } = &mut *cx.machine;
        let result = match (behaviour.world_decorator.as_mut(), mission.as_ref()) {
            (Some(decorator), Some(mission)) => decorator.build_on_world(mission),
            _ => Ok(()),
        };
        match result {
            Ok(()) => {
                cx.complete(OwnerState::WaitingForAgentsToAssemble);
            }
            Err(e) => fail(cx, &format!("Failed to decorate the world: {:#}", e)),
        }
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Owner>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        on_client_bailed(cx, message);
        Ok(())
    }
}

#[derive(Default)]
struct WaitingForAgentsToAssemble {
    pending_ready: Vec<String>,
    pending_running: Vec<String>,
    assembled: bool,
    turns: TurnScheduleBuilder,
    started: Option<Instant>,
}

impl WaitingForAgentsToAssemble {
    fn on_cast_assembled(&mut self, cx: &mut EpisodeContext<'_, Owner>) {
        let mut extra_handlers = BTreeMap::new();
        if let Some(decorator) = cx.machine.behaviour.world_decorator.as_ref() {
            extra_handlers = decorator.extra_agent_handlers();
            for (identity, position) in decorator.turn_participants() {
                self.turns.request(identity, Some(position));
            }
        }
        cx.machine.schedule = self.turns.build();
        tracing::info!(
            "owner: all {} agents joined, turn order {:?}",
            self.pending_running.len(),
            cx.machine.schedule.as_slice()
        );
        cx.machine
            .host
            .broadcast(&MissionMessage::AllPlayersJoined { extra_handlers });
        self.assembled = true;
    }
}

impl Episode<Owner> for WaitingForAgentsToAssemble {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        cx.machine.watch_list.clear();
        cx.machine.user_to_agent.clear();
        cx.machine.schedule.clear();
        self.pending_ready = cx
            .machine
            .mission
            .as_ref()
            .map(MissionInit::agent_names)
            .unwrap_or_default();
        self.started = Some(Instant::now());
        tracing::info!("owner: waiting for agents {:?}", self.pending_ready);
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Owner>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::AgentReady {
                agent_name,
                username,
                turn_position,
            } => {
                let Some(index) = self.pending_ready.iter().position(|a| a == agent_name) else {
                    tracing::debug!("owner: ignoring ready from {} ({})", agent_name, username);
                    return Ok(());
                };
                self.pending_ready.remove(index);
                cx.machine
                    .user_to_agent
                    .insert(username.clone(), agent_name.clone());
                self.pending_running.push(username.clone());
                cx.machine.watch_list.push(username.clone());
                if turn_position.is_some() {
                    self.turns.request(username.clone(), *turn_position);
                }
                if self.pending_ready.is_empty() && !self.assembled {
                    self.on_cast_assembled(cx);
                }
            }
            MissionMessage::AgentRunning { username } => {
                self.pending_running.retain(|u| u != username);
                if self.assembled && self.pending_running.is_empty() {
                    cx.complete(OwnerState::Running);
                }
            }
            other => {
                on_client_bailed(cx, other);
            }
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        if check_watch_list(cx) {
            return Ok(());
        }
        let timed_out = match (cx.machine.config.assembly_timeout(), self.started) {
            (Some(limit), Some(started)) => started.elapsed() > limit,
            _ => false,
        };
        if timed_out {
            fail(cx, "Timed out waiting for agents to assemble");
        }
        Ok(())
    }
}

#[derive(Default)]
struct Running {
    running_agents: Vec<String>,
}

impl Episode<Owner> for Running {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        let Owner {
            behaviour,
            mission,
            host,
            ..
        } = &mut *cx.machine;
        if let Some(mission) = mission.as_ref() {
            self.running_agents = mission.agent_names();
            if let Some(quit) = behaviour.quit_producer.as_mut() {
                quit.prepare(mission);
            }
            if let Some(decorator) = behaviour.world_decorator.as_mut() {
                decorator.prepare(mission);
            }
        }
        host.broadcast(&MissionMessage::Go);

        let first = cx.machine.schedule.first().map(str::to_string);
        if let Some(first) = first {
            if !cx.machine.give_turn(&first) {
                fail(cx, &format!("Could not give the first turn to {}", first));
            }
        }
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Owner>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::AgentFinishedMission {
                agent_name,
                username,
            } => {
                self.running_agents.retain(|a| a != agent_name);
                cx.machine.schedule.remove(username);
                tracing::info!("owner: {} finished the mission", agent_name);
            }
            MissionMessage::ShareReward { .. } => {
                cx.machine.host.broadcast(message);
            }
            MissionMessage::TurnTaken { username } => {
                let next = cx.machine.schedule.successor(username).map(str::to_string);
                match next {
                    None => fail(cx, &format!("Cannot find the successor of {}", username)),
                    Some(next) => {
                        if !cx.machine.give_turn(&next) {
                            fail(cx, &format!("Could not give the turn to {}", next));
                        }
                    }
                }
            }
            other => {
                on_client_bailed(cx, other);
            }
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        if check_watch_list(cx) {
            return Ok(());
        }
        let Owner {
            behaviour,
            mission,
            quit_code,
            ..
        } = &mut *cx.machine;
        if let Some(decorator) = behaviour.world_decorator.as_mut() {
            decorator.update();
        }
        let requested = mission
            .as_ref()
            .and_then(|mission| behaviour.quit_requested(mission));
        let outcome = match requested {
            Some(outcome) => Some(outcome),
            None if self.running_agents.is_empty() => Some(ALL_AGENTS_FINISHED.to_string()),
            None => None,
        };
        if let Some(outcome) = outcome {
            tracing::info!("owner: mission over: {}", outcome);
            *quit_code = outcome;
            cx.complete(OwnerState::WaitingForAgentsToQuit);
        }
        Ok(())
    }

    fn cleanup(&mut self, machine: &mut Owner) {
        if let Some(quit) = machine.behaviour.quit_producer.as_mut() {
            quit.cleanup();
        }
        if let Some(decorator) = machine.behaviour.world_decorator.as_mut() {
            decorator.cleanup();
        }
    }
}

#[derive(Default)]
struct WaitingForAgentsToQuit {
    stopped: BTreeMap<String, bool>,
}

impl Episode<Owner> for WaitingForAgentsToQuit {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        self.stopped = cx
            .machine
            .mission
            .as_ref()
            .map(MissionInit::agent_names)
            .unwrap_or_default()
            .into_iter()
            .map(|agent| (agent, false))
            .collect();
        let quit_code = cx.machine.quit_code.clone();
        cx.machine
            .host
            .broadcast(&MissionMessage::StopAgents { quit_code });
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Owner>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::AgentStopped { agent_name } => {
                if let Some(stopped) = self.stopped.get_mut(agent_name) {
                    *stopped = true;
                }
                if self.stopped.values().all(|stopped| *stopped) {
                    cx.machine.host.broadcast(&MissionMessage::MissionOver);
                    cx.complete(OwnerState::CleanUp);
                }
            }
            other => {
                on_client_bailed(cx, other);
            }
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        check_watch_list(cx);
        Ok(())
    }
}

struct Conclude {
    aborted: bool,
}

impl Episode<Owner> for Conclude {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        if self.aborted {
            fail(cx, "Mission aborted");
        } else {
            cx.complete(OwnerState::CleanUp);
        }
        Ok(())
    }
}

struct ErrorState;

impl Episode<Owner> for ErrorState {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        tracing::error!("owner: mission failed:\n{}", cx.error_details().trim_end());
        cx.complete(OwnerState::CleanUp);
        Ok(())
    }
}

struct CleanUp;

impl Episode<Owner> for CleanUp {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Owner>) -> anyhow::Result<()> {
        let machine = &mut *cx.machine;
        machine.behaviour = MissionBehaviour::default();
        machine.mission = None;
        machine.slot.set_current(None);
        machine.watch_list.clear();
        machine.user_to_agent.clear();
        machine.schedule.clear();
        cx.complete(OwnerState::Dormant);
        Ok(())
    }
}
