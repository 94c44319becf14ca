//! Session gateway: the step/peek/find surface external agents drive
//!
//! One `SessionGateway` fronts one participant. External agents connect
//! over framed TCP, say hello, then issue tagged text commands. The
//! participant's home thread feeds observations, rewards and info in
//! through the hook methods (`add_frame`, `add_reward`, `set_info`, ...)
//! and drains queued actions with `next_command`.
//!
//! Two locks guard the shared state: the rendezvous token table and the
//! per-session mission state. Each has its own condvar, and no code path
//! holds both at once.

use super::OrchestratorConfig;
use super::error::{ClientError, ClientResult, GatewayError, GatewayResult};
use super::framing;
use super::handshake::HandshakeReply;
use super::listener::{ListenerPool, accept_until_stopped};
use super::mission::MissionInit;
use super::tokens::{TokenKey, TokenTable};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Prefix every client hello must start with
pub fn hello_prefix() -> String {
    format!("<SortieEnv{}", crate::PROTOCOL_VERSION)
}

// Slack allowed after the hello prefix (closing tag, whitespace).
const HELLO_SLACK: usize = 8;

/// Size of the step reply's reward frame: f64 reward, done flag, sent flag
const STEP_STATUS_LEN: usize = 10;

/// Mission state shared between the gateway connections and the participant
#[derive(Debug, Default)]
struct MissionState {
    done: bool,
    quit: bool,
    reward: f64,
    frame: Option<Vec<u8>>,
    info: String,
    commands: VecDeque<String>,
    turn_key: String,
    last_turn_key: String,
    token: Option<TokenKey>,
    agent_count: usize,
}

impl MissionState {
    fn restart(&mut self, token: TokenKey, agent_count: usize) {
        *self = MissionState {
            token: Some(token),
            agent_count,
            ..MissionState::default()
        };
    }
}

/// One decoded gateway command
#[derive(Debug, Clone, PartialEq)]
enum Command {
    Init,
    Find(String),
    MissionInit(String),
    Step { option: u8, actions: String },
    Peek,
    Quit,
    Close(String),
    Status,
    Echo(String),
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let body = text.strip_prefix(open)?;
    Some(body.strip_suffix(close).unwrap_or(body))
}

impl Command {
    fn parse(text: &str) -> GatewayResult<Command> {
        if text.starts_with("<Init") {
            return Ok(Command::Init);
        }
        if text.starts_with("<Peek") {
            return Ok(Command::Peek);
        }
        if text.starts_with("<Quit") {
            return Ok(Command::Quit);
        }
        if text.starts_with("<Status") {
            return Ok(Command::Status);
        }
        if text.starts_with("<Echo") {
            return Ok(Command::Echo(text.to_string()));
        }
        if let Some(token) = between(text, "<Find>", "</Find>") {
            return Ok(Command::Find(token.to_string()));
        }
        if let Some(token) = between(text, "<Close>", "</Close>") {
            return Ok(Command::Close(token.to_string()));
        }
        if let Some(mission) = between(text, "<MissionInit>", "</MissionInit>") {
            return Ok(Command::MissionInit(mission.to_string()));
        }
        if let Some(rest) = text.strip_prefix("<Step") {
            let mut chars = rest.chars();
            let option = chars
                .next()
                .and_then(|c| c.to_digit(10))
                .ok_or_else(|| GatewayError::UnknownCommand(text.to_string()))?;
            let body = chars
                .as_str()
                .strip_prefix('>')
                .ok_or_else(|| GatewayError::UnknownCommand(text.to_string()))?;
            let actions = match body.rfind("</Step") {
                Some(end) => &body[..end],
                None => body,
            };
            return Ok(Command::Step {
                option: option as u8,
                actions: actions.to_string(),
            });
        }
        Err(GatewayError::UnknownCommand(text.to_string()))
    }
}

/// Parse the `experiment:role:reset:agent_count` frame that follows a MissionInit
pub fn parse_session_token(text: &str) -> GatewayResult<(TokenKey, usize)> {
    let bad = || GatewayError::BadToken(text.to_string());
    let (key, count) = text.trim().rsplit_once(':').ok_or_else(bad)?;
    let count = count.parse().map_err(|_| bad())?;
    Ok((key.parse()?, count))
}

/// Pull the `turn_key` field out of an info document, if it has one
fn turn_key_of(info: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(info).ok()?;
    value
        .get("turn_key")
        .and_then(|key| key.as_str())
        .map(str::to_string)
}

/// Reply to a step request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StepReply {
    /// Latest observation bytes, empty if none
    pub observation: Vec<u8>,
    /// Reward accumulated since the previous pickup
    pub reward: f64,
    /// Whether the mission has ended
    pub done: bool,
    /// Whether the actions were queued for the participant
    pub sent: bool,
    /// Info document, when requested
    pub info: Option<String>,
    /// Turn key to use next, when requested
    pub next_turn_key: Option<String>,
}

/// Shared state behind the gateway
pub struct SessionGateway {
    config: OrchestratorConfig,
    poller: Option<Arc<ListenerPool>>,
    tokens: Mutex<TokenTable>,
    tokens_changed: Condvar,
    state: Mutex<MissionState>,
    state_changed: Condvar,
}

impl std::fmt::Debug for SessionGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGateway")
            .field("gateway_port", &self.config.gateway_port)
            .field("tokens", &self.tokens.lock().len())
            .finish()
    }
}

impl SessionGateway {
    /// Gateway that forwards MissionInit requests to `poller`
    pub fn new(config: OrchestratorConfig, poller: Option<Arc<ListenerPool>>) -> Arc<Self> {
        let shelf_life = config.token_shelf_life();
        Arc::new(Self {
            config,
            poller,
            tokens: Mutex::new(TokenTable::new(shelf_life)),
            tokens_changed: Condvar::new(),
            state: Mutex::new(MissionState::default()),
            state_changed: Condvar::new(),
        })
    }

    // ---- participant side ----

    /// Publish the integrated server's port for every role of the current session
    pub fn notify_server_started(&self, port: u16) {
        let session = {
            let state = self.state.lock();
            state.token.clone().map(|token| (token, state.agent_count))
        };
        let Some((token, agent_count)) = session else {
            tracing::warn!("Server started on {} with no gateway session", port);
            return;
        };
        let mut tokens = self.tokens.lock();
        tokens.insert(token.clone(), port);
        for role in 1..agent_count {
            tokens.insert(token.with_role(role), port);
        }
        tracing::info!("Session {} server on port {}", token, port);
        self.tokens_changed.notify_all();
    }

    /// Record the latest info document; a fresh `turn_key` makes it this agent's turn
    pub fn set_info(&self, info: String) {
        let mut state = self.state.lock();
        if let Some(key) = turn_key_of(&info) {
            if key != state.last_turn_key {
                state.turn_key = key;
            }
        }
        state.info = info;
        self.state_changed.notify_all();
    }

    /// Accumulate reward until the next pickup
    pub fn add_reward(&self, reward: f64) {
        self.state.lock().reward += reward;
    }

    /// Replace the latest observation
    pub fn add_frame(&self, frame: Vec<u8>) {
        let mut state = self.state.lock();
        state.frame = Some(frame);
        self.state_changed.notify_all();
    }

    /// Mark the session done and release its token
    pub fn end_mission(&self) {
        let token = {
            let mut state = self.state.lock();
            state.done = true;
            state.quit = false;
            state.turn_key.clear();
            state.last_turn_key.clear();
            state.agent_count = 0;
            let token = state.token.take();
            self.state_changed.notify_all();
            token
        };
        if let Some(token) = token {
            self.tokens.lock().remove(&token);
            self.tokens_changed.notify_all();
        }
    }

    /// Next queued action for the participant
    pub fn next_command(&self) -> Option<String> {
        self.state.lock().commands.pop_front()
    }

    /// Whether the agent has asked to quit
    pub fn wants_to_quit(&self) -> bool {
        self.state.lock().quit
    }

    // ---- agent side ----

    /// Forget every rendezvous token
    pub fn init(&self) {
        self.tokens.lock().reset();
        self.tokens_changed.notify_all();
    }

    /// Resolve a rendezvous token to a port (0 if unknown)
    pub fn find(&self, key: &TokenKey) -> u16 {
        let mut tokens = self.tokens.lock();
        if tokens.purge_previous(key) {
            self.tokens_changed.notify_all();
        }
        if let Some(port) = tokens.lookup(key) {
            return port;
        }
        let wait = self.config.gateway_wait();
        let _ = self.tokens_changed.wait_for(&mut tokens, wait);
        tokens.lookup(key).unwrap_or(0)
    }

    /// Drop a rendezvous token
    pub fn close(&self, key: &TokenKey) {
        self.tokens.lock().remove(key);
        self.tokens_changed.notify_all();
    }

    /// Ask the participant to quit unless the mission is already done; returns `done`
    pub fn quit(&self) -> bool {
        let mut state = self.state.lock();
        if !state.done {
            state.quit = true;
        }
        state.done
    }

    /// Latest observation and the done flag, without consuming anything
    pub fn peek(&self) -> (Vec<u8>, bool) {
        let state = self.state.lock();
        (state.frame.clone().unwrap_or_default(), state.done)
    }

    /// Start (or join) a mission; returns whether it started and every follower
    /// has let go of the previous reset
    pub fn mission_init(&self, mission: &MissionInit, key: &TokenKey, agent_count: usize) -> bool {
        if key.role != 0 {
            return self.start_up(mission, key, agent_count);
        }

        let needs_start = {
            let mut tokens = self.tokens.lock();
            tokens.purge_previous(key);
            !tokens.contains(key)
        };
        let started = if needs_start {
            let started = self.start_up(mission, key, agent_count);
            if started {
                self.tokens.lock().insert(key.clone(), 0);
                self.tokens_changed.notify_all();
            }
            started
        } else {
            true
        };

        let mut tokens = self.tokens.lock();
        let mut consumed = previous_reset_consumed(&tokens, key, agent_count);
        if !consumed {
            let _ = self
                .tokens_changed
                .wait_for(&mut tokens, self.config.gateway_wait());
            consumed = previous_reset_consumed(&tokens, key, agent_count);
        }
        started && consumed
    }

    fn start_up(&self, mission: &MissionInit, key: &TokenKey, agent_count: usize) -> bool {
        self.state.lock().restart(key.clone(), agent_count);

        let Some(poller) = &self.poller else {
            tracing::warn!("Gateway has no mission poller; cannot start {}", key);
            return false;
        };
        let request = match mission.to_control_bytes() {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                tracing::error!("Cannot encode mission for {}: {}", key, e);
                return false;
            }
        };
        let (_, reply) = poller.submit(&request, "gateway");
        let answer = framing::decode_frame(&reply)
            .ok()
            .and_then(|body| String::from_utf8_lossy(body).parse::<HandshakeReply>().ok());
        match answer {
            Some(HandshakeReply::Ok) => true,
            Some(HandshakeReply::Busy) => {
                tracing::info!("Participant busy; session {} will quit", key);
                self.state.lock().quit = true;
                false
            }
            other => {
                tracing::warn!("Mission start for {} refused: {:?}", key, other);
                false
            }
        }
    }

    /// Queue actions and pick up the results of the last ones
    pub fn step(&self, option: u8, actions: &str, step_key: &str) -> StepReply {
        let with_turn_key = option < 2;
        let with_info = option == 0 || option == 2;
        let wait = self.config.gateway_wait();

        let mut state = self.state.lock();
        let done = state.done;
        if state.frame.is_none() && !done {
            let _ = self.state_changed.wait_for(&mut state, wait);
        }
        let mut observation = state.frame.clone().unwrap_or_default();

        let mut sent = false;
        let mut out_of_turn = true;
        let mut next_turn_key = state.turn_key.clone();
        if !done && !observation.is_empty() {
            if state.turn_key.is_empty() {
                if step_key.is_empty() {
                    state.commands.extend(
                        actions
                            .split('\n')
                            .filter(|action| !action.is_empty())
                            .map(str::to_string),
                    );
                    out_of_turn = false;
                    sent = true;
                } else {
                    next_turn_key = step_key.to_string();
                }
            } else if !step_key.is_empty() && state.turn_key == step_key {
                state.commands.push_back(format!("{} {}", step_key, actions));
                state.turn_key.clear();
                state.last_turn_key = step_key.to_string();
                out_of_turn = false;
                sent = true;
            }
        }

        let mut reward = 0.0;
        let mut info = String::new();
        if done || (!observation.is_empty() && !out_of_turn) {
            reward = std::mem::take(&mut state.reward);
            if with_info {
                info = std::mem::take(&mut state.info);
                if info.is_empty() && !done {
                    let _ = self.state_changed.wait_for(&mut state, wait);
                    info = std::mem::take(&mut state.info);
                    if let Some(newer) = state.frame.clone() {
                        observation = newer;
                    }
                }
            }
            state.frame = None;
        }

        StepReply {
            observation,
            reward,
            done,
            sent,
            info: with_info.then_some(info),
            next_turn_key: with_turn_key.then_some(next_turn_key),
        }
    }

    /// Gateway status document
    pub fn status(&self) -> serde_json::Value {
        let (done, token) = {
            let state = self.state.lock();
            (state.done, state.token.as_ref().map(ToString::to_string))
        };
        serde_json::json!({
            "version": crate::PROTOCOL_VERSION,
            "session": token,
            "done": done,
            "tokens": self.tokens.lock().len(),
            "time": chrono::Utc::now().to_rfc3339(),
        })
    }

    fn set_quit_if_running(&self) {
        let mut state = self.state.lock();
        if state.token.is_some() && !state.done {
            tracing::info!("Agent disconnected mid-mission; asking participant to quit");
            state.quit = true;
        }
    }

    // ---- serving ----

    /// Bind the gateway port and start accepting agents
    pub fn serve(self: &Arc<Self>) -> GatewayResult<GatewayServer> {
        let listener = TcpListener::bind((self.config.bind_address.as_str(), self.config.gateway_port))?;
        let addr = listener.local_addr()?;
        tracing::info!("Session gateway listening on {}", addr);

        let stop = Arc::new(AtomicBool::new(false));
        let gateway = Arc::clone(self);
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            accept_until_stopped("gateway", listener, &flag, |stream| {
                let gateway = Arc::clone(&gateway);
                thread::spawn(move || {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "unknown".into());
                    if let Err(e) = gateway.serve_connection(stream) {
                        tracing::debug!("Gateway connection {} ended: {}", peer, e);
                    }
                });
            });
        });

        Ok(GatewayServer {
            addr,
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    fn serve_connection(&self, mut stream: TcpStream) -> GatewayResult<()> {
        let max_len = self.config.max_frame_len;
        let hello = framing::read_frame(&mut stream, max_len)?;
        let prefix = hello_prefix();
        let text = String::from_utf8_lossy(&hello);
        if hello.len() > prefix.len() + HELLO_SLACK || !text.starts_with(&prefix) {
            return Err(GatewayError::BadHello(text.into_owned()));
        }

        let mut running = false;
        loop {
            let frame = match framing::read_frame(&mut stream, max_len) {
                Ok(frame) => frame,
                Err(e) => {
                    if running {
                        self.set_quit_if_running();
                    }
                    return Err(e.into());
                }
            };
            let text = String::from_utf8_lossy(&frame).into_owned();
            match self.dispatch(&text, &mut stream, &mut running) {
                Ok(()) => {}
                Err(GatewayError::UnknownCommand(command)) => {
                    tracing::warn!("Unknown gateway command: {}", command);
                    let _ = stream.shutdown(Shutdown::Both);
                    return Err(GatewayError::UnknownCommand(command));
                }
                Err(e) => {
                    if running {
                        self.set_quit_if_running();
                    }
                    return Err(e);
                }
            }
        }
    }

    fn dispatch(&self, text: &str, stream: &mut TcpStream, running: &mut bool) -> GatewayResult<()> {
        let max_len = self.config.max_frame_len;
        match Command::parse(text)? {
            Command::Init => {
                self.init();
                framing::write_i32_frame(stream, 1)?;
            }
            Command::Find(token) => {
                let port = self.find(&token.parse()?);
                framing::write_i32_frame(stream, i32::from(port))?;
            }
            Command::MissionInit(body) => {
                let token_frame = framing::read_frame(stream, max_len)?;
                let (key, agent_count) =
                    parse_session_token(&String::from_utf8_lossy(&token_frame))?;
                let ok = match MissionInit::from_bytes(body.as_bytes()) {
                    Ok(mission) => self.mission_init(&mission, &key, agent_count),
                    Err(e) => {
                        tracing::warn!("Malformed mission from agent for {}: {}", key, e);
                        false
                    }
                };
                *running = ok;
                framing::write_i32_frame(stream, i32::from(ok))?;
                framing::write_frame(stream, b"")?;
            }
            Command::Step { option, actions } => {
                let step_key = if option < 2 {
                    String::from_utf8_lossy(&framing::read_frame(stream, max_len)?).into_owned()
                } else {
                    String::new()
                };
                let reply = self.step(option, &actions, &step_key);
                let mut status = Vec::with_capacity(STEP_STATUS_LEN);
                status.extend_from_slice(&reply.reward.to_be_bytes());
                status.push(u8::from(reply.done));
                status.push(u8::from(reply.sent));
                framing::write_frame(stream, &reply.observation)?;
                framing::write_frame(stream, &status)?;
                if let Some(info) = &reply.info {
                    framing::write_frame(stream, info.as_bytes())?;
                }
                if let Some(key) = &reply.next_turn_key {
                    framing::write_frame(stream, key.as_bytes())?;
                }
            }
            Command::Peek => {
                let (observation, done) = self.peek();
                framing::write_frame(stream, &observation)?;
                framing::write_frame(stream, &[u8::from(done)])?;
            }
            Command::Quit => {
                let done = self.quit();
                framing::write_i32_frame(stream, i32::from(done))?;
            }
            Command::Close(token) => {
                self.close(&token.parse()?);
                framing::write_i32_frame(stream, 1)?;
            }
            Command::Status => {
                framing::write_frame(stream, self.status().to_string().as_bytes())?;
            }
            Command::Echo(command) => {
                framing::write_frame(stream, format!("<Echo>{}</Echo>", command).as_bytes())?;
            }
        }
        stream.flush()?;
        Ok(())
    }
}

fn previous_reset_consumed(tokens: &TokenTable, key: &TokenKey, agent_count: usize) -> bool {
    (1..agent_count).all(|role| match key.with_role(role).previous() {
        Some(previous) => !tokens.contains(&previous),
        None => true,
    })
}

/// Handle to a running gateway accept loop
#[derive(Debug)]
pub struct GatewayServer {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayServer {
    /// Port the gateway is bound to
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Stop accepting new agents; open connections run until they close
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Gateway accept thread panicked");
            }
        }
    }
}

impl Drop for GatewayServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Agent-side client for the gateway protocol
#[derive(Debug)]
pub struct GatewayClient {
    stream: TcpStream,
    max_frame_len: usize,
}

impl GatewayClient {
    /// Connect and say hello
    pub fn connect(address: &str, port: u16, timeout: Duration) -> ClientResult<Self> {
        let target = (address, port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ClientError::MalformedResponse(format!("cannot resolve {}", address)))?;
        let mut stream = TcpStream::connect_timeout(&target, timeout)?;
        stream.set_nodelay(true)?;
        framing::write_frame(&mut stream, format!("{}/>", hello_prefix()).as_bytes())?;
        Ok(Self {
            stream,
            max_frame_len: framing::MAX_FRAME_LEN,
        })
    }

    /// Bound how long a reply may take
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> ClientResult<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    fn send(&mut self, command: &str) -> ClientResult<()> {
        framing::write_frame(&mut self.stream, command.as_bytes())?;
        Ok(())
    }

    fn read(&mut self) -> ClientResult<Vec<u8>> {
        Ok(framing::read_frame(&mut self.stream, self.max_frame_len)?)
    }

    fn read_text(&mut self) -> ClientResult<String> {
        Ok(String::from_utf8_lossy(&self.read()?).into_owned())
    }

    /// Reset the gateway's tokens
    pub fn init(&mut self) -> ClientResult<bool> {
        self.send("<Init/>")?;
        Ok(framing::read_i32_frame(&mut self.stream)? == 1)
    }

    /// Resolve a rendezvous token; 0 means not (yet) published
    pub fn find(&mut self, key: &TokenKey) -> ClientResult<u16> {
        self.send(&format!("<Find>{}</Find>", key))?;
        let port = framing::read_i32_frame(&mut self.stream)?;
        u16::try_from(port).map_err(|_| ClientError::MalformedResponse(port.to_string()))
    }

    /// Start a mission for `key`; returns whether it started and the initial turn key
    pub fn mission_init(
        &mut self,
        mission: &MissionInit,
        key: &TokenKey,
        agent_count: usize,
    ) -> ClientResult<(bool, String)> {
        let body = String::from_utf8_lossy(&mission.to_bytes()?).into_owned();
        self.send(&format!("<MissionInit>{}</MissionInit>", body))?;
        self.send(&format!("{}:{}", key, agent_count))?;
        let ok = framing::read_i32_frame(&mut self.stream)? == 1;
        let turn_key = self.read_text()?;
        Ok((ok, turn_key))
    }

    /// Send actions; `option` picks which extra frames come back (0..=3)
    pub fn step(&mut self, option: u8, actions: &str, turn_key: &str) -> ClientResult<StepReply> {
        let option = option.min(3);
        self.send(&format!("<Step{}>{}</Step{}>", option, actions, option))?;
        if option < 2 {
            self.send(turn_key)?;
        }
        let observation = self.read()?;
        let status = self.read()?;
        if status.len() != STEP_STATUS_LEN {
            return Err(ClientError::MalformedResponse(format!(
                "step status of {} bytes",
                status.len()
            )));
        }
        let mut reward = [0u8; 8];
        reward.copy_from_slice(&status[..8]);
        let info = if option == 0 || option == 2 {
            Some(self.read_text()?)
        } else {
            None
        };
        let next_turn_key = if option < 2 { Some(self.read_text()?) } else { None };
        Ok(StepReply {
            observation,
            reward: f64::from_be_bytes(reward),
            done: status[8] == 1,
            sent: status[9] == 1,
            info,
            next_turn_key,
        })
    }

    /// Latest observation and done flag
    pub fn peek(&mut self) -> ClientResult<(Vec<u8>, bool)> {
        self.send("<Peek/>")?;
        let observation = self.read()?;
        let done = self.read()?;
        Ok((observation, done.first() == Some(&1)))
    }

    /// Ask to quit; returns whether the mission was already done
    pub fn quit(&mut self) -> ClientResult<bool> {
        self.send("<Quit/>")?;
        Ok(framing::read_i32_frame(&mut self.stream)? == 1)
    }

    /// Drop a rendezvous token
    pub fn close(&mut self, key: &TokenKey) -> ClientResult<bool> {
        self.send(&format!("<Close>{}</Close>", key))?;
        Ok(framing::read_i32_frame(&mut self.stream)? == 1)
    }

    /// Gateway status document
    pub fn status(&mut self) -> ClientResult<serde_json::Value> {
        self.send("<Status/>")?;
        let text = self.read_text()?;
        serde_json::from_str(&text).map_err(|_| ClientError::MalformedResponse(text))
    }

    /// Round-trip a command through the gateway's echo
    pub fn echo(&mut self, text: &str) -> ClientResult<String> {
        self.send(&format!("<Echo>{}", text))?;
        self.read_text()
    }
}
