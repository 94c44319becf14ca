//! The participant state machine
//!
//! A participant drives one agent through one mission. It accepts a
//! MissionInit from its mission-control port (or by direct hand-off),
//! builds its handlers, prepares or joins the world, reports ready to the
//! owner, and only starts acting once the owner says `Go`. However the
//! mission ends, the agent gets a `MissionEndedReport` and the participant
//! returns to `Dormant`.

use super::OrchestratorConfig;
use super::episode::{Episode, EpisodeContext, Lifecycle, Machine, MachineState};
use super::error::ListenerResult;
use super::framing::FramedChannel;
use super::gateway::SessionGateway;
use super::handlers::{HandlerFactory, MissionBehaviour};
use super::handshake::{HandshakeHook, MissionSlot};
use super::host::ParticipantHost;
use super::listener::{CommandFraming, ListenerOptions, ListenerPool, PortSpec, QueueAll};
use super::machine::StateMachine;
use super::messages::{MissionEndedReport, MissionMessage, MissionResult, MultidimensionalReward};
use super::mission::MissionInit;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Quit code used when the agent stops accepting data
pub const AGENT_UNRESPONSIVE: &str = "Agent unresponsive";

/// Quit code used when the gateway session asks to quit
pub const GATEWAY_QUIT: &str = "Quit requested by the session gateway";

/// Liveness probe sent to the agent's mission-control port
pub const AGENT_PING: &[u8] = br#"{"type":"Ping"}"#;

/// States of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantState {
    /// Waiting for the host to finish starting
    WaitingForModReady,
    /// Idle, accepting a new mission
    Dormant,
    /// Building handlers and the command port
    CreatingHandlers,
    /// Deciding whether the world can be reused
    EvaluatingWorldRequirements,
    /// Pausing the old world before closing it
    PausingOldServer,
    /// Closing the old world
    ClosingOldServer,
    /// Creating a fresh world
    CreatingNewWorld,
    /// Reporting ready until the owner releases the participant
    WaitingForServerReady,
    /// The mission is running
    Running,
    /// Finished on its own; waiting for the owner to stop everyone
    Idling,
    /// The mission ended normally
    MissionEnded,
    /// The owner aborted the mission
    MissionAborted,
    /// Waiting for the owner to declare the mission over
    WaitingForServerMissionEnd,
    /// Handlers could not be built
    ErrorDuffHandlers,
    /// The local world server could not be reached
    ErrorIntegratedServerUnreachable,
    /// No world to play in
    ErrorNoWorld,
    /// The world could not be created
    ErrorCannotCreateWorld,
    /// The agent could not be started
    ErrorCannotStartAgent,
    /// The agent stopped answering pings
    ErrorLostAgent,
    /// The connection to the owner dropped mid-mission
    ErrorLostNetworkConnection,
    /// The owner's world could not be joined
    ErrorCannotConnectToServer,
    /// The owner never released the participant
    ErrorTimedOutWaitingForEpisodeStart,
}

impl fmt::Display for ParticipantState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl MachineState for ParticipantState {}

// A failed step: where to go and what to record.
struct Failure {
    state: ParticipantState,
    reason: String,
}

fn failure(state: ParticipantState, reason: impl Into<String>) -> Failure {
    Failure {
        state,
        reason: reason.into(),
    }
}

/// Machine data for a participant
pub struct Participant {
    config: OrchestratorConfig,
    slot: Arc<MissionSlot>,
    mission_poller: Option<Arc<ListenerPool>>,
    command_poller: Option<ListenerPool>,
    host: Box<dyn ParticipantHost>,
    factory: Arc<dyn HandlerFactory>,
    gateway: Option<Arc<SessionGateway>>,
    queued: VecDeque<MissionInit>,
    mission: Option<MissionInit>,
    behaviour: MissionBehaviour,
    world: MissionBehaviour,
    agent: Option<FramedChannel>,
    quit_code: String,
    final_reward: MultidimensionalReward,
    shared_reward: MultidimensionalReward,
    my_turn: bool,
}

impl Participant {
    /// Participant without a mission-control port
    pub fn new(
        config: OrchestratorConfig,
        host: Box<dyn ParticipantHost>,
        factory: Arc<dyn HandlerFactory>,
    ) -> Self {
        Self {
            config,
            slot: Arc::new(MissionSlot::new()),
            mission_poller: None,
            command_poller: None,
            host,
            factory,
            gateway: None,
            queued: VecDeque::new(),
            mission: None,
            behaviour: MissionBehaviour::default(),
            world: MissionBehaviour::default(),
            agent: None,
            quit_code: String::new(),
            final_reward: MultidimensionalReward::new(),
            shared_reward: MultidimensionalReward::new(),
            my_turn: false,
        }
    }

    /// Accept missions on the configured mission-control port
    ///
    /// A fixed port is used when configured; otherwise the first free port
    /// from the mission-control range.
    pub fn with_mission_control(mut self) -> ListenerResult<Self> {
        let spec = match self.config.mission_control_port {
            0 => PortSpec::Range {
                min: self.config.min_mission_control_port,
                max: self.config.max_free_port,
                randomize: false,
            },
            port => PortSpec::Fixed(port),
        };
        let options = ListenerOptions {
            bind_address: self.config.bind_address.clone(),
            framing: CommandFraming::Length,
            max_command_len: self.config.max_frame_len,
        };
        let hook = Arc::new(HandshakeHook::new("participant", Arc::clone(&self.slot)));
        let pool = ListenerPool::start("mission-control", spec, options, hook);
        let port = pool.wait_for_port()?;
        tracing::info!("participant: accepting missions on port {}", port);
        self.mission_poller = Some(Arc::new(pool));
        Ok(self)
    }

    /// Route commands, frames, rewards and the done flag through a gateway session
    pub fn bind_gateway(mut self, gateway: Arc<SessionGateway>) -> Self {
        self.gateway = Some(gateway);
        self
    }

    /// Start the machine on the calling thread
    pub fn start(self) -> StateMachine<Participant> {
        StateMachine::new(self, ParticipantState::WaitingForModReady)
    }

    /// Port missions are accepted on
    pub fn mission_control_port(&self) -> Option<u16> {
        self.mission_poller.as_ref().and_then(|pool| pool.port())
    }

    /// The mission-control listener, for submitting requests in-process
    pub fn mission_poller(&self) -> Option<Arc<ListenerPool>> {
        self.mission_poller.clone()
    }

    /// Port agent commands are accepted on
    pub fn command_port(&self) -> Option<u16> {
        self.command_poller.as_ref().and_then(ListenerPool::port)
    }

    /// Hand a mission over directly
    pub fn queue_mission(&mut self, mission: MissionInit) {
        self.queued.push_back(mission);
    }

    /// Shared mission record read by the handshake hook
    pub fn slot(&self) -> Arc<MissionSlot> {
        Arc::clone(&self.slot)
    }

    /// Mission being run, if any
    pub fn current_mission(&self) -> Option<&MissionInit> {
        self.mission.as_ref()
    }

    /// Why the last mission ended
    pub fn quit_code(&self) -> &str {
        &self.quit_code
    }

    fn agent_name(&self) -> String {
        self.mission
            .as_ref()
            .and_then(MissionInit::agent_name)
            .unwrap_or_default()
            .to_string()
    }

    fn take_next_mission(&mut self) -> Option<MissionInit> {
        if let Some(mission) = self.queued.pop_front() {
            return Some(mission);
        }
        let poller = self.mission_poller.as_ref()?;
        while let Some(received) = poller.pop_command_with_peer() {
            match MissionInit::from_control_bytes(received.command.as_bytes()) {
                Ok(mut mission) => {
                    if mission.agent_connection.agent_address.is_empty() {
                        mission.agent_connection.agent_address = received.peer;
                    }
                    return Some(mission);
                }
                Err(e) => {
                    tracing::warn!("participant: dropping request from {}: {}", received.peer, e);
                    self.slot.set_idle(true);
                }
            }
        }
        None
    }

    fn channel_to(&self, address: &str, port: u16) -> Option<FramedChannel> {
        if port == 0 {
            return None;
        }
        Some(
            FramedChannel::new(address, port, self.config.connect_timeout())
                .with_max_frame_len(self.config.max_frame_len),
        )
    }

    fn open_agent_channel(&mut self) {
        let Some(mission) = self.mission.as_ref() else {
            return;
        };
        let connection = &mission.agent_connection;
        let reusable = self.agent.as_ref().is_some_and(|channel| {
            channel.address() == connection.agent_address
                && channel.port() == connection.mission_control_port
        });
        if !reusable {
            if let Some(mut old) = self.agent.take() {
                old.close();
            }
            self.agent =
                self.channel_to(&connection.agent_address, connection.mission_control_port);
        }
    }

    fn send_to_agent(&mut self, payload: &[u8]) -> bool {
        match self.agent.as_mut() {
            Some(channel) => channel.send(payload),
            None => true,
        }
    }

    fn ping_agent(&mut self) -> bool {
        self.send_to_agent(AGENT_PING)
    }

    fn ensure_command_poller(&mut self, requested: u16) -> ListenerResult<u16> {
        let pool = match self.command_poller.take() {
            Some(pool)
                if pool.port().is_some() && (requested == 0 || pool.port() == Some(requested)) =>
            {
                pool
            }
            stale => {
                if let Some(stale) = stale {
                    stale.stop_server();
                }
                let spec = match requested {
                    0 => PortSpec::Range {
                        min: self.config.min_free_port,
                        max: self.config.max_free_port,
                        randomize: true,
                    },
                    port => PortSpec::Fixed(port),
                };
                let options = ListenerOptions {
                    bind_address: self.config.bind_address.clone(),
                    framing: CommandFraming::Line,
                    max_command_len: self.config.max_frame_len,
                };
                ListenerPool::start("commands", spec, options, Arc::new(QueueAll))
            }
        };
        let port = pool.wait_for_port();
        self.command_poller = Some(pool);
        port
    }

    fn create_handlers(&mut self) -> Result<bool, Failure> {
        let mission = self
            .mission
            .as_ref()
            .ok_or_else(|| failure(ParticipantState::ErrorDuffHandlers, "No current mission"))?;
        let requested = mission.agent_connection.commands_port;
        let is_owner = mission.role() == 0;
        self.behaviour = self.factory.agent_behaviour(mission).map_err(|e| {
            failure(
                ParticipantState::ErrorDuffHandlers,
                format!("Could not create mission handlers: {:#}", e),
            )
        })?;

        let port = self.ensure_command_poller(requested).map_err(|e| {
            failure(
                ParticipantState::ErrorDuffHandlers,
                format!("Could not open the command port: {}", e),
            )
        })?;
        if let Some(mission) = self.mission.as_mut() {
            mission.agent_connection.commands_port = port;
        }
        self.slot
            .update_current(|mission| mission.agent_connection.commands_port = port);
        Ok(is_owner)
    }

    fn evaluate_world(&mut self) -> Result<ParticipantState, Failure> {
        let mission = self
            .mission
            .clone()
            .ok_or_else(|| failure(ParticipantState::ErrorDuffHandlers, "No current mission"))?;
        self.world = self.factory.owner_behaviour(&mission).map_err(|e| {
            failure(
                ParticipantState::ErrorDuffHandlers,
                format!("Could not create world handlers: {:#}", e),
            )
        })?;

        let exists = self.host.world_exists();
        let mut needs_new = self
            .world
            .world_generator
            .as_ref()
            .is_some_and(|generator| generator.should_create_world(&mission, exists));
        if exists {
            // The player must be the agent this mission asks for.
            if let (Some(player), Some(agent)) = (self.host.player_name(), mission.agent_name()) {
                if player != agent {
                    needs_new = true;
                }
            }
        }

        match (needs_new, exists) {
            (true, true) => Ok(ParticipantState::PausingOldServer),
            (true, false) => Ok(ParticipantState::CreatingNewWorld),
            (false, true) => {
                self.host.hand_to_local_owner(&mission).map_err(|e| {
                    failure(
                        ParticipantState::ErrorIntegratedServerUnreachable,
                        format!("Could not hand the mission to the local owner: {:#}", e),
                    )
                })?;
                Ok(ParticipantState::WaitingForServerReady)
            }
            (false, false) => Err(failure(
                ParticipantState::ErrorNoWorld,
                "There is no world to play in; the mission needs a world generator",
            )),
        }
    }

    fn create_world(&mut self) -> Result<(), Failure> {
        let mission = self
            .mission
            .clone()
            .ok_or_else(|| failure(ParticipantState::ErrorCannotCreateWorld, "No current mission"))?;
        let generator = self.world.world_generator.as_mut().ok_or_else(|| {
            failure(
                ParticipantState::ErrorCannotCreateWorld,
                "The mission has no world generator",
            )
        })?;
        generator.create_world(&mission).map_err(|e| {
            failure(
                ParticipantState::ErrorCannotCreateWorld,
                format!("World generator failed to create a world: {:#}", e),
            )
        })?;
        self.host.start_world_server(&mission).map_err(|e| {
            failure(
                ParticipantState::ErrorIntegratedServerUnreachable,
                format!("Could not start the world server: {:#}", e),
            )
        })?;
        self.host.hand_to_local_owner(&mission).map_err(|e| {
            failure(
                ParticipantState::ErrorIntegratedServerUnreachable,
                format!("Could not hand the mission to the local owner: {:#}", e),
            )
        })
    }

    fn join_world(&mut self) -> Result<(), Failure> {
        let Some(mission) = self.mission.as_mut() else {
            return Err(failure(
                ParticipantState::ErrorCannotConnectToServer,
                "No current mission",
            ));
        };
        if !mission.is_multi_agent() {
            return Ok(());
        }
        if mission.role() == 0 {
            let mut server = self.host.open_to_peers().map_err(|e| {
                failure(
                    ParticipantState::ErrorCannotConnectToServer,
                    format!("Could not open the world to other participants: {:#}", e),
                )
            })?;
            if server.address.is_empty() {
                server.address = mission.agent_connection.client_address.clone();
            }
            tracing::info!(
                "participant: world open to peers at {}:{}",
                server.address,
                server.port
            );
            mission.server_connection = Some(server.clone());
            let port = server.port;
            self.slot
                .update_current(|current| current.server_connection = Some(server));
            if let Some(gateway) = self.gateway.as_ref() {
                gateway.notify_server_started(port);
            }
            return Ok(());
        }
        let server = mission.server_connection.clone().ok_or_else(|| {
            failure(
                ParticipantState::ErrorCannotConnectToServer,
                "The mission does not say where the owner's world is",
            )
        })?;
        self.host.connect_to_server(&server).map_err(|e| {
            failure(
                ParticipantState::ErrorCannotConnectToServer,
                format!(
                    "Unable to connect to the world at {}:{}: {:#}",
                    server.address, server.port, e
                ),
            )
        })
    }
}

impl Machine for Participant {
    type State = ParticipantState;
    type Message = MissionMessage;

    fn name(&self) -> &'static str {
        "participant"
    }

    fn episode_for(&mut self, state: ParticipantState) -> Box<dyn Episode<Self>> {
        use ParticipantState as S;
        match state {
            S::WaitingForModReady => Box::new(InitialiseParticipant),
            S::Dormant => Box::new(Dormant),
            S::CreatingHandlers => Box::new(CreatingHandlers),
            S::EvaluatingWorldRequirements => Box::new(EvaluatingWorldRequirements),
            S::PausingOldServer => Box::new(PausingOldServer),
            S::ClosingOldServer => Box::new(ClosingOldServer),
            S::CreatingNewWorld => Box::new(CreatingNewWorld),
            S::WaitingForServerReady => Box::new(WaitingForServerReady::default()),
            S::Running => Box::new(Running::default()),
            S::Idling => Box::new(Idling),
            S::WaitingForServerMissionEnd => Box::new(WaitingForServerMissionEnd),
            S::MissionEnded => Box::new(Conclude::new(MissionResult::Ended, false, false, true)),
            S::ErrorDuffHandlers => Box::new(Conclude::new(MissionResult::HandlersFailed, true, true, true)),
            S::ErrorIntegratedServerUnreachable => {
                Box::new(Conclude::new(MissionResult::ServerUnreachable, true, true, true))
            }
            S::ErrorNoWorld => Box::new(Conclude::new(MissionResult::NoWorldLoaded, true, true, true)),
            S::ErrorCannotCreateWorld => {
                Box::new(Conclude::new(MissionResult::WorldCreationFailed, true, true, true))
            }
            S::ErrorCannotStartAgent => {
                Box::new(Conclude::new(MissionResult::AgentUnavailable, true, true, false))
            }
            S::ErrorLostAgent => Box::new(Conclude::new(MissionResult::AgentLost, true, true, false)),
            // The owner is unreachable, so it is not told.
            S::ErrorLostNetworkConnection | S::ErrorCannotConnectToServer => {
                Box::new(Conclude::new(MissionResult::ConnectionFailed, true, false, true))
            }
            S::ErrorTimedOutWaitingForEpisodeStart => {
                Box::new(Conclude::new(MissionResult::TimedOut, true, true, true))
            }
            // The owner sent the abort, so it already knows.
            S::MissionAborted => Box::new(Conclude::new(MissionResult::AbortedByOwner, true, false, true)),
        }
    }

    fn on_pre_state_change(&mut self, from: ParticipantState, to: ParticipantState) {
        tracing::debug!("participant: leaving {} for {}", from, to);
        self.slot.set_idle(false);
    }
}

fn fail(cx: &mut EpisodeContext<'_, Participant>, failure: Failure) {
    tracing::error!("participant: {}", failure.reason);
    cx.save_error_details(&failure.reason);
    cx.complete(failure.state);
}

// Shared by every episode that can be interrupted by the owner.
fn on_abort(cx: &mut EpisodeContext<'_, Participant>, message: &MissionMessage) -> bool {
    if let MissionMessage::Abort { message } = message {
        tracing::warn!("participant: mission aborted by the owner: {}", message);
        cx.save_error_details(&format!("Mission was aborted by the owner: {}", message));
        cx.complete(ParticipantState::MissionAborted);
        return true;
    }
    false
}

struct InitialiseParticipant;

impl Episode<Participant> for InitialiseParticipant {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        cx.machine.slot.set_idle(false);
        Ok(())
    }

    fn on_lifecycle(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        event: &Lifecycle,
    ) -> anyhow::Result<()> {
        if *event == Lifecycle::HostReady {
            cx.complete(ParticipantState::Dormant);
        }
        Ok(())
    }
}

struct Dormant;

impl Episode<Participant> for Dormant {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        cx.clear_error_details();
        let machine = &mut *cx.machine;
        machine.mission = None;
        machine.behaviour = MissionBehaviour::default();
        machine.world = MissionBehaviour::default();
        machine.quit_code.clear();
        machine.final_reward.clear();
        machine.shared_reward.clear();
        machine.my_turn = false;
        if let Some(poller) = machine.command_poller.as_ref() {
            poller.clear_commands();
        }
        machine.slot.set_current(None);
        machine.slot.set_idle(true);
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        let machine = &mut *cx.machine;
        let Some(mission) = machine.take_next_mission() else {
            return Ok(());
        };
        machine.slot.set_idle(false);
        machine.slot.cancel_reservation();
        tracing::info!(
            "participant: received mission {:?} as role {} of experiment {}",
            mission.mission.name,
            mission.role(),
            mission.experiment_id()
        );
        machine.slot.set_current(Some(mission.clone()));
        machine.mission = Some(mission);
        machine.open_agent_channel();
        cx.complete(ParticipantState::CreatingHandlers);
        Ok(())
    }
}

struct CreatingHandlers;

impl Episode<Participant> for CreatingHandlers {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        match cx.machine.create_handlers() {
            Ok(true) => {
                cx.complete(ParticipantState::EvaluatingWorldRequirements);
            }
            Ok(false) => {
                cx.complete(ParticipantState::WaitingForServerReady);
            }
            Err(f) => fail(cx, f),
        }
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        on_abort(cx, message);
        Ok(())
    }
}

struct EvaluatingWorldRequirements;

impl Episode<Participant> for EvaluatingWorldRequirements {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        match cx.machine.evaluate_world() {
            Ok(next) => {
                cx.complete(next);
            }
            Err(f) => fail(cx, f),
        }
        Ok(())
    }
}

struct PausingOldServer;

impl Episode<Participant> for PausingOldServer {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        if let Err(e) = cx.machine.host.pause_world() {
            fail(
                cx,
                failure(
                    ParticipantState::ErrorCannotCreateWorld,
                    format!("Could not pause the old world: {:#}", e),
                ),
            );
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        if cx.machine.host.world_paused() {
            cx.complete(ParticipantState::ClosingOldServer);
        }
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        on_abort(cx, message);
        Ok(())
    }
}

struct ClosingOldServer;

impl Episode<Participant> for ClosingOldServer {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        match cx.machine.host.close_world() {
            Ok(()) => {
                cx.complete(ParticipantState::CreatingNewWorld);
            }
            Err(e) => fail(
                cx,
                failure(
                    ParticipantState::ErrorCannotCreateWorld,
                    format!("Could not close the old world: {:#}", e),
                ),
            ),
        }
        Ok(())
    }
}

struct CreatingNewWorld;

impl Episode<Participant> for CreatingNewWorld {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        match cx.machine.create_world() {
            Ok(()) => {
                cx.complete(ParticipantState::WaitingForServerReady);
            }
            Err(f) => fail(cx, f),
        }
        Ok(())
    }
}

#[derive(Default)]
struct WaitingForServerReady {
    agent_name: String,
    ticks_until_ping: u32,
    ticks_waited: u64,
    failed_pings: u32,
    joined: bool,
}

impl WaitingForServerReady {
    fn proceed(&mut self, cx: &mut EpisodeContext<'_, Participant>) {
        let bytes = match cx.machine.mission.as_ref().map(MissionInit::to_bytes) {
            Some(Ok(bytes)) => bytes,
            Some(Err(e)) => {
                let reason = format!("Failed to send MissionInit back to agent: {}", e);
                fail(cx, failure(ParticipantState::ErrorCannotStartAgent, reason));
                return;
            }
            None => {
                fail(cx, failure(ParticipantState::ErrorCannotStartAgent, "No current mission"));
                return;
            }
        };
        if cx.machine.send_to_agent(&bytes) {
            cx.complete(ParticipantState::Running);
        } else {
            fail(
                cx,
                failure(
                    ParticipantState::ErrorCannotStartAgent,
                    "Failed to send MissionInit back to agent",
                ),
            );
        }
    }
}

impl Episode<Participant> for WaitingForServerReady {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        self.agent_name = cx.machine.agent_name();
        if let Err(f) = cx.machine.join_world() {
            fail(cx, f);
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        self.ticks_waited += 1;
        if let Some(limit) = cx.machine.config.server_ready_timeout_ticks {
            if self.ticks_waited > limit {
                fail(
                    cx,
                    failure(
                        ParticipantState::ErrorTimedOutWaitingForEpisodeStart,
                        "Timed out waiting for the mission to start",
                    ),
                );
                return Ok(());
            }
        }

        if self.ticks_until_ping == 0 {
            // Repeated because the owner may not be listening yet.
            if !self.joined {
                let ready = MissionMessage::AgentReady {
                    agent_name: self.agent_name.clone(),
                    username: cx.machine.host.username(),
                    turn_position: cx.machine.behaviour.turn_position,
                };
                cx.machine.host.send_to_owner(&ready);
            }
            if cx.machine.ping_agent() {
                self.failed_pings = 0;
            } else {
                self.failed_pings += 1;
                if self.failed_pings > cx.machine.config.failed_send_tolerance {
                    fail(
                        cx,
                        failure(ParticipantState::ErrorLostAgent, "Lost contact with the agent"),
                    );
                    return Ok(());
                }
            }
            self.ticks_until_ping = cx.machine.config.ping_interval_ticks;
        } else {
            self.ticks_until_ping -= 1;
        }

        if self.joined && cx.machine.host.start_position_ready() {
            self.proceed(cx);
        }
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::AllPlayersJoined { extra_handlers } => {
                let machine = &mut *cx.machine;
                if let Some(mission) = machine.mission.as_ref() {
                    match machine.factory.extra_behaviour(mission, extra_handlers) {
                        Ok(extra) => machine.behaviour.merge(extra),
                        Err(e) => tracing::warn!("participant: could not create extra handlers: {:#}", e),
                    }
                }
                self.joined = true;
            }
            other => {
                on_abort(cx, other);
            }
        }
        Ok(())
    }

    fn on_lifecycle(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        event: &Lifecycle,
    ) -> anyhow::Result<()> {
        if let Lifecycle::ConnectionLost(reason) = event {
            fail(
                cx,
                failure(
                    ParticipantState::ErrorCannotConnectToServer,
                    format!("Unable to connect to the mission's world: {}", reason),
                ),
            );
        }
        Ok(())
    }
}

fn note_send(sent: bool, failures: &mut u32) {
    if sent {
        *failures = 0;
    } else {
        *failures += 1;
    }
}

#[derive(Default)]
struct Running {
    go: bool,
    wants_to_quit: bool,
    quit_code: String,
    observations: Option<FramedChannel>,
    rewards: Option<FramedChannel>,
    video: Option<FramedChannel>,
    failed_observations: u32,
    failed_rewards: u32,
    failed_video: u32,
    last_ping: Option<Instant>,
}

impl Running {
    fn quit(&mut self, code: &str) {
        if !self.wants_to_quit {
            self.wants_to_quit = true;
            self.quit_code = code.to_string();
        }
    }

    fn collect_final_reward(machine: &mut Participant) {
        if let Some(mission) = machine.mission.as_ref() {
            let reward = machine.behaviour.collect_reward(mission);
            machine.final_reward.add_all(&reward);
        }
    }

    fn finish(&mut self, cx: &mut EpisodeContext<'_, Participant>) {
        let machine = &mut *cx.machine;
        Self::collect_final_reward(machine);
        let finished = MissionMessage::AgentFinishedMission {
            agent_name: machine.agent_name(),
            username: machine.host.username(),
        };
        machine.host.send_to_owner(&finished);
        machine.quit_code = self.quit_code.clone();
        tracing::info!("participant: finished the mission: {}", self.quit_code);
        cx.complete(ParticipantState::Idling);
    }

    fn send_data(&mut self, machine: &mut Participant) {
        let Some(mission) = machine.mission.as_ref() else {
            return;
        };

        let observation = machine.behaviour.observation_json(mission);
        // An empty document is "{}"; those are not sent.
        if observation.len() > 2 {
            if let Some(channel) = self.observations.as_mut() {
                note_send(channel.send(observation.as_bytes()), &mut self.failed_observations);
            }
            if let Some(gateway) = machine.gateway.as_ref() {
                gateway.set_info(observation);
            }
        }

        let mut reward = machine.behaviour.collect_reward(mission);
        reward.add_all(&machine.shared_reward);
        machine.shared_reward.clear();
        if !reward.is_empty() {
            if let Some(channel) = self.rewards.as_mut() {
                note_send(
                    channel.send(reward.to_wire_string().as_bytes()),
                    &mut self.failed_rewards,
                );
            }
            if let Some(gateway) = machine.gateway.as_ref() {
                gateway.add_reward(reward.total());
            }
        }

        if let Some(producer) = machine.behaviour.video_producer.as_mut() {
            if let Some(frame) = producer.frame(mission) {
                if let Some(channel) = self.video.as_mut() {
                    note_send(
                        channel.send_parts(&[&frame.header, &frame.pixels]),
                        &mut self.failed_video,
                    );
                }
                if let Some(gateway) = machine.gateway.as_ref() {
                    gateway.add_frame(frame.pixels);
                }
            }
        }

        let worst = self
            .failed_observations
            .max(self.failed_rewards)
            .max(self.failed_video);
        if worst > machine.config.failed_send_tolerance {
            tracing::error!("participant: agent is not receiving data; quitting the mission");
            self.quit(AGENT_UNRESPONSIVE);
        }
    }

    fn next_command(machine: &Participant) -> Option<String> {
        if let Some(command) = machine.gateway.as_ref().and_then(|g| g.next_command()) {
            return Some(command);
        }
        machine.command_poller.as_ref().and_then(ListenerPool::pop_command)
    }

    fn handle_commands(&mut self, machine: &mut Participant) {
        loop {
            // Turn-takers hold their commands until it is their turn.
            if machine.behaviour.turn_position.is_some() && !machine.my_turn {
                return;
            }
            let Some(command) = Self::next_command(machine) else {
                return;
            };
            if command.trim().is_empty() {
                continue;
            }
            let Some(mission) = machine.mission.as_ref() else {
                return;
            };
            if !machine.behaviour.execute_command(&command, mission) {
                tracing::debug!("participant: no handler took command {:?}", command);
                continue;
            }
            if machine.my_turn {
                machine.my_turn = false;
                let taken = MissionMessage::TurnTaken {
                    username: machine.host.username(),
                };
                machine.host.send_to_owner(&taken);
            }
            // Commands may arrive faster than ticks; stop as soon as the mission is over.
            if let Some(outcome) = machine.behaviour.quit_requested(mission) {
                self.quit(&outcome);
                return;
            }
        }
    }
}

impl Episode<Participant> for Running {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        let machine = &mut *cx.machine;
        let Some(mission) = machine.mission.as_ref() else {
            anyhow::bail!("entered the running state without a mission");
        };
        let connection = &mission.agent_connection;
        self.observations = machine.channel_to(&connection.agent_address, connection.observations_port);
        self.rewards = machine.channel_to(&connection.agent_address, connection.rewards_port);
        if machine.behaviour.video_producer.is_some() {
            self.video = machine.channel_to(&connection.agent_address, connection.video_port);
        }
        machine.behaviour.prepare_agent(mission);

        let running = MissionMessage::AgentRunning {
            username: machine.host.username(),
        };
        if !machine.host.send_to_owner(&running) {
            tracing::warn!("participant: could not tell the owner we are running");
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        let due = self
            .last_ping
            .is_none_or(|sent| sent.elapsed() >= cx.machine.config.agent_ping_interval());
        if due {
            self.last_ping = Some(Instant::now());
            if !cx.machine.ping_agent() {
                // Before Go the quit flag does nothing, so abort outright.
                if !self.go {
                    fail(
                        cx,
                        failure(ParticipantState::ErrorLostAgent, "Lost contact with the agent"),
                    );
                    return Ok(());
                }
                tracing::warn!("participant: agent is not responding to pings");
                self.quit(AGENT_UNRESPONSIVE);
            }
        }

        if !self.go {
            return Ok(());
        }

        if cx.machine.gateway.as_ref().is_some_and(|g| g.wants_to_quit()) {
            self.quit(GATEWAY_QUIT);
        }
        let machine = &mut *cx.machine;
        if let Some(mission) = machine.mission.as_ref() {
            if let Some(outcome) = machine.behaviour.quit_requested(mission) {
                self.quit(&outcome);
            }
        }

        if self.wants_to_quit {
            self.finish(cx);
            return Ok(());
        }
        self.send_data(cx.machine);
        self.handle_commands(cx.machine);
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::Go => {
                tracing::info!("participant: go");
                self.go = true;
            }
            MissionMessage::YourTurn => {
                cx.machine.my_turn = true;
            }
            MissionMessage::ShareReward { agent_name, reward } => {
                if *agent_name != cx.machine.agent_name() {
                    cx.machine.shared_reward.add_all(reward);
                }
            }
            MissionMessage::StopAgents { quit_code } => {
                self.quit_code = quit_code.clone();
                cx.machine.quit_code = quit_code.clone();
                Self::collect_final_reward(cx.machine);
                cx.complete(ParticipantState::MissionEnded);
            }
            other => {
                on_abort(cx, other);
            }
        }
        Ok(())
    }

    fn on_lifecycle(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        event: &Lifecycle,
    ) -> anyhow::Result<()> {
        if let Lifecycle::ConnectionLost(reason) = event {
            fail(
                cx,
                failure(
                    ParticipantState::ErrorLostNetworkConnection,
                    format!("Kicked from the mission's world: {}", reason),
                ),
            );
        }
        Ok(())
    }

    fn cleanup(&mut self, machine: &mut Participant) {
        if let Some(mission) = machine.mission.as_ref() {
            machine.behaviour.cleanup_agent(mission);
        }
        machine.my_turn = false;
        for channel in [&mut self.observations, &mut self.rewards, &mut self.video] {
            if let Some(channel) = channel.as_mut() {
                channel.close();
            }
        }
    }
}

struct Idling;

impl Episode<Participant> for Idling {
    fn execute(&mut self, _cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::StopAgents { quit_code } => {
                if cx.machine.quit_code.is_empty() {
                    cx.machine.quit_code = quit_code.clone();
                }
                cx.complete(ParticipantState::MissionEnded);
            }
            other => {
                on_abort(cx, other);
            }
        }
        Ok(())
    }
}

struct Conclude {
    result: MissionResult,
    aborting: bool,
    inform_owner: bool,
    inform_agent: bool,
}

impl Conclude {
    fn new(result: MissionResult, aborting: bool, inform_owner: bool, inform_agent: bool) -> Self {
        Self {
            result,
            aborting,
            inform_owner,
            inform_agent,
        }
    }
}

impl Episode<Participant> for Conclude {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        let details = cx.error_details();
        let errors = details.trim_end();
        let machine = &mut *cx.machine;
        let separator = if !machine.quit_code.is_empty() && !errors.is_empty() {
            ";\n"
        } else {
            ""
        };
        let report = format!("{}{}{}", machine.quit_code, separator, errors);

        if self.inform_owner {
            let bailed = MissionMessage::ClientBailed {
                username: machine.host.username(),
                error: errors.to_string(),
            };
            machine.host.send_to_owner(&bailed);
        }

        if self.inform_agent {
            let reward = std::mem::take(&mut machine.final_reward);
            let ended = MissionEndedReport::new(self.result, report, reward);
            match serde_json::to_vec(&ended) {
                Ok(bytes) => {
                    if !machine.send_to_agent(&bytes) {
                        tracing::warn!(
                            "participant: could not send the mission-ended report; the agent may need resetting"
                        );
                    }
                }
                Err(e) => tracing::error!("participant: could not encode the mission-ended report: {}", e),
            }
        }
        machine.final_reward.clear();
        if let Some(gateway) = machine.gateway.as_ref() {
            gateway.end_mission();
        }
        tracing::info!("participant: mission over ({})", self.result);

        if self.aborting {
            cx.complete(ParticipantState::Dormant);
        }
        Ok(())
    }

    fn on_tick(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        if !self.aborting {
            cx.complete(ParticipantState::WaitingForServerMissionEnd);
        }
        Ok(())
    }
}

struct WaitingForServerMissionEnd;

impl Episode<Participant> for WaitingForServerMissionEnd {
    fn execute(&mut self, cx: &mut EpisodeContext<'_, Participant>) -> anyhow::Result<()> {
        let stopped = MissionMessage::AgentStopped {
            agent_name: cx.machine.agent_name(),
        };
        cx.machine.host.send_to_owner(&stopped);
        Ok(())
    }

    fn on_message(
        &mut self,
        cx: &mut EpisodeContext<'_, Participant>,
        _from: &str,
        message: &MissionMessage,
    ) -> anyhow::Result<()> {
        match message {
            MissionMessage::MissionOver => {
                cx.complete(ParticipantState::Dormant);
            }
            other => {
                on_abort(cx, other);
            }
        }
        Ok(())
    }
}
