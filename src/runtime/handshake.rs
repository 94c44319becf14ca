//! Mission handshake: reply codes, control requests and the decision table
//!
//! A participant sends a framed control request to a machine's control
//! port: a MissionInit to launch or join a mission, a reservation request
//! or cancellation, or a lookup of an experiment's world server. The
//! listener hook answers from the machine's `MissionSlot` and queues the
//! request only when a MissionInit gets a plain `OK`; the machine itself
//! picks it up later on its home thread.

use super::error::{ClientError, ClientResult, MissionError, MissionResult};
use super::framing::{self, MAX_FRAME_LEN};
use super::listener::CommandHook;
use super::mission::{MISSION_INIT_TYPE, MissionInit, ServerConnection};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Reply to a handshake request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeReply {
    /// Request accepted
    Ok,
    /// The mission is already running; join its server here
    OkServer(ServerConnection),
    /// Cannot take the request right now
    Busy,
    /// No mission to join
    NoMission,
    /// The experiment is running here but its world server is not open yet
    NoServerYet,
    /// This machine is not running that experiment
    NoServer,
    /// Not a message this runtime understands
    NotUnderstood,
    /// Malformed request
    Error(String),
}

impl HandshakeReply {
    /// Whether the request was accepted in either form
    pub fn is_accepted(&self) -> bool {
        matches!(self, HandshakeReply::Ok | HandshakeReply::OkServer(_))
    }
}

impl fmt::Display for HandshakeReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeReply::Ok => write!(f, "OK"),
            HandshakeReply::OkServer(server) => write!(f, "OK:{}:{}", server.address, server.port),
            HandshakeReply::Busy => write!(f, "BUSY"),
            HandshakeReply::NoMission => write!(f, "NOMISSION"),
            HandshakeReply::NoServerYet => write!(f, "NOSERVERYET"),
            HandshakeReply::NoServer => write!(f, "NOSERVER"),
            HandshakeReply::NotUnderstood => write!(f, "NOTUNDERSTOOD"),
            HandshakeReply::Error(details) => write!(f, "ERROR:{}", details),
        }
    }
}

impl FromStr for HandshakeReply {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OK" => return Ok(HandshakeReply::Ok),
            "BUSY" => return Ok(HandshakeReply::Busy),
            "NOMISSION" => return Ok(HandshakeReply::NoMission),
            "NOSERVERYET" => return Ok(HandshakeReply::NoServerYet),
            "NOSERVER" => return Ok(HandshakeReply::NoServer),
            "NOTUNDERSTOOD" => return Ok(HandshakeReply::NotUnderstood),
            _ => {}
        }
        if let Some(details) = s.strip_prefix("ERROR") {
            let details = details.strip_prefix(':').unwrap_or(details);
            return Ok(HandshakeReply::Error(details.to_string()));
        }
        if let Some(endpoint) = s.strip_prefix("OK:") {
            let (address, port) = endpoint
                .rsplit_once(':')
                .ok_or_else(|| ClientError::MalformedResponse(s.to_string()))?;
            let port = port
                .parse()
                .map_err(|_| ClientError::MalformedResponse(s.to_string()))?;
            return Ok(HandshakeReply::OkServer(ServerConnection {
                address: address.to_string(),
                port,
            }));
        }
        Err(ClientError::MalformedResponse(s.to_string()))
    }
}

const REQUEST_CLIENT_TYPE: &str = "RequestClient";
const CANCEL_REQUEST_TYPE: &str = "CancelRequest";
const FIND_SERVER_TYPE: &str = "FindServer";

/// A request arriving on a control port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlRequest {
    /// Launch or join a mission
    MissionInit {
        /// The mission
        mission_init: MissionInit,
    },
    /// Hold this machine for one experiment for a while
    RequestClient {
        /// Protocol version of the requester
        version: String,
        /// How long the reservation lasts
        reservation_ms: u64,
        /// Experiment the machine is held for
        experiment_id: String,
    },
    /// Drop the current reservation
    CancelRequest,
    /// Ask where an experiment's world server is
    FindServer {
        /// Experiment to look up
        experiment_id: String,
    },
}

impl ControlRequest {
    /// Reservation request at this runtime's protocol version
    pub fn reserve(experiment_id: impl Into<String>, duration: Duration) -> Self {
        ControlRequest::RequestClient {
            version: crate::PROTOCOL_VERSION.to_string(),
            reservation_ms: duration.as_millis() as u64,
            experiment_id: experiment_id.into(),
        }
    }

    /// Encode as a control-port envelope
    pub fn to_bytes(&self) -> MissionResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a control-port envelope
    ///
    /// Unparseable input or an unknown `type` yields `NotUnderstood`; a
    /// known request with a bad body, or a MissionInit that fails
    /// validation, yields `Json` or `Invalid`.
    pub fn from_bytes(bytes: &[u8]) -> MissionResult<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| MissionError::NotUnderstood(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| MissionError::NotUnderstood("missing message type".into()))?;
        let known = [
            MISSION_INIT_TYPE,
            REQUEST_CLIENT_TYPE,
            CANCEL_REQUEST_TYPE,
            FIND_SERVER_TYPE,
        ];
        if !known.contains(&kind) {
            return Err(MissionError::NotUnderstood(kind.to_string()));
        }
        let request: Self = serde_json::from_value(value)?;
        if let ControlRequest::MissionInit { mission_init } = &request {
            mission_init.validate()?;
        }
        Ok(request)
    }
}

/// A machine held for one experiment until `expires`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// Experiment the machine is held for
    pub experiment_id: String,
    /// When the hold lapses
    pub expires: Instant,
}

impl Reservation {
    /// Hold for `experiment_id` lasting `duration` from now
    pub fn new(experiment_id: impl Into<String>, duration: Duration) -> Self {
        Self {
            experiment_id: experiment_id.into(),
            expires: Instant::now() + duration,
        }
    }

    /// Whether the hold has not lapsed yet
    pub fn is_active(&self) -> bool {
        Instant::now() < self.expires
    }
}

/// What the handshake needs to know about the machine it guards
#[derive(Debug, Clone, Default)]
pub struct HandshakeView {
    /// Whether the machine can take a new mission right now
    pub idle: bool,
    /// Mission currently being run, if any
    pub current_mission: Option<MissionInit>,
    /// Active reservation, if any
    pub reservation: Option<Reservation>,
}

impl HandshakeView {
    /// Whether a mission for `experiment_id` may use this machine
    pub fn available_for(&self, experiment_id: &str) -> bool {
        match &self.reservation {
            None => true,
            Some(held) => held.experiment_id == experiment_id || !held.is_active(),
        }
    }
}

fn version_mismatch(got: &str) -> String {
    format!(
        "VERSIONMISMATCH (got {}, expected {})",
        got,
        crate::PROTOCOL_VERSION
    )
}

/// Shared record of a machine's mission, readable from listener threads
#[derive(Debug, Default)]
pub struct MissionSlot {
    idle: AtomicBool,
    current: RwLock<Option<MissionInit>>,
    // Also serializes handshake decisions.
    reservation: Mutex<Option<Reservation>>,
}

impl MissionSlot {
    /// Empty, busy slot
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark whether the machine can take a new mission
    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::SeqCst);
    }

    /// Whether the machine can take a new mission
    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst)
    }

    /// Move from idle to busy; fails if someone else got there first
    pub fn try_claim(&self) -> bool {
        self.idle
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Copy of the current mission
    pub fn current(&self) -> Option<MissionInit> {
        self.current.read().clone()
    }

    /// Replace the current mission
    pub fn set_current(&self, mission: Option<MissionInit>) {
        *self.current.write() = mission;
    }

    /// Edit the current mission in place, if there is one
    pub fn update_current<F: FnOnce(&mut MissionInit)>(&self, edit: F) -> bool {
        match self.current.write().as_mut() {
            Some(mission) => {
                edit(mission);
                true
            }
            None => false,
        }
    }

    /// Active reservation, if any
    pub fn reservation(&self) -> Option<Reservation> {
        self.reservation
            .lock()
            .as_ref()
            .filter(|held| held.is_active())
            .cloned()
    }

    /// Drop any reservation; returns whether an active one was held
    pub fn cancel_reservation(&self) -> bool {
        self.reservation
            .lock()
            .take()
            .is_some_and(|held| held.is_active())
    }

    /// Snapshot for the decision table
    pub fn view(&self) -> HandshakeView {
        HandshakeView {
            idle: self.is_idle(),
            current_mission: self.current(),
            reservation: self.reservation(),
        }
    }

    /// Answer one raw control request
    ///
    /// Returns the reply and whether the request should be queued for the
    /// machine. A MissionInit that would be answered `OK` claims the slot
    /// first; if the claim fails the answer is `BUSY`.
    pub fn answer(&self, command: &[u8]) -> (HandshakeReply, bool) {
        let request = match ControlRequest::from_bytes(command) {
            Ok(request) => request,
            Err(MissionError::NotUnderstood(_)) => return (HandshakeReply::NotUnderstood, false),
            Err(e) => return (HandshakeReply::Error(e.to_string()), false),
        };

        let mut reservation = self.reservation.lock();
        if reservation.as_ref().is_some_and(|held| !held.is_active()) {
            *reservation = None;
        }
        match request {
            ControlRequest::MissionInit { mission_init } => {
                let view = HandshakeView {
                    idle: self.is_idle(),
                    current_mission: self.current(),
                    reservation: reservation.clone(),
                };
                match decide(&mission_init, &view) {
                    HandshakeReply::Ok if self.try_claim() => {
                        *reservation = None;
                        (HandshakeReply::Ok, true)
                    }
                    HandshakeReply::Ok => (HandshakeReply::Busy, false),
                    other => (other, false),
                }
            }
            ControlRequest::RequestClient {
                version,
                reservation_ms,
                experiment_id,
            } => {
                if version != crate::PROTOCOL_VERSION {
                    return (HandshakeReply::Error(version_mismatch(&version)), false);
                }
                if !self.is_idle() || reservation.is_some() {
                    return (HandshakeReply::Busy, false);
                }
                *reservation = Some(Reservation::new(
                    experiment_id,
                    Duration::from_millis(reservation_ms),
                ));
                (HandshakeReply::Ok, false)
            }
            ControlRequest::CancelRequest => match reservation.take() {
                Some(_) => (HandshakeReply::Ok, false),
                None => (
                    HandshakeReply::Error("Attempt to cancel a reservation that was never made".into()),
                    false,
                ),
            },
            ControlRequest::FindServer { experiment_id } => {
                let reply = match self.current() {
                    Some(mission) if mission.experiment_id() == experiment_id => {
                        match mission.server_connection() {
                            Some(server) => HandshakeReply::OkServer(server.clone()),
                            None => HandshakeReply::NoServerYet,
                        }
                    }
                    _ => HandshakeReply::NoServer,
                };
                (reply, false)
            }
        }
    }
}

/// Apply the decision table to a decoded MissionInit
pub fn decide(request: &MissionInit, view: &HandshakeView) -> HandshakeReply {
    if request.platform_version != crate::PROTOCOL_VERSION {
        return HandshakeReply::Error(version_mismatch(&request.platform_version));
    }
    let is_owner = request.role() == 0;
    let free = view.idle && view.available_for(request.experiment_id());
    match (request.server_connection(), is_owner) {
        (Some(_), true) => {
            HandshakeReply::Error("role 0 request must not carry a server connection".into())
        }
        (Some(_), false) | (None, true) => {
            if free {
                HandshakeReply::Ok
            } else {
                HandshakeReply::Busy
            }
        }
        (None, false) => match &view.current_mission {
            None => HandshakeReply::NoMission,
            Some(current) if current.matches(request) => match current.server_connection() {
                Some(server) => HandshakeReply::OkServer(server.clone()),
                None => HandshakeReply::Busy,
            },
            Some(_) => HandshakeReply::Busy,
        },
    }
}

/// Listener hook that answers handshakes from a `MissionSlot`
#[derive(Debug)]
pub struct HandshakeHook {
    name: &'static str,
    slot: Arc<MissionSlot>,
}

impl HandshakeHook {
    /// Hook for the machine called `name`
    pub fn new(name: &'static str, slot: Arc<MissionSlot>) -> Self {
        Self { name, slot }
    }
}

impl CommandHook for HandshakeHook {
    fn on_command(&self, command: &str, peer: &str, reply: &mut dyn Write) -> bool {
        let (answer, queue) = self.slot.answer(command.as_bytes());
        tracing::info!("{}: handshake from {} answered {}", self.name, peer, answer);
        let mut writer = reply;
        if let Err(e) = framing::write_frame(&mut writer, answer.to_string().as_bytes()) {
            tracing::warn!("{}: failed to reply to {}: {}", self.name, peer, e);
            if queue {
                self.slot.set_idle(true);
            }
            return false;
        }
        queue
    }
}

/// Send any control request to a control port and wait for the reply
pub fn request_control(
    address: &str,
    port: u16,
    request: &ControlRequest,
    timeout: Duration,
) -> ClientResult<HandshakeReply> {
    let target: SocketAddr = (address, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| ClientError::MalformedResponse(format!("cannot resolve {}", address)))?;
    let mut stream = TcpStream::connect_timeout(&target, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    framing::write_frame(&mut stream, &request.to_bytes()?)?;
    let reply = framing::read_frame(&mut stream, MAX_FRAME_LEN)?;
    String::from_utf8_lossy(&reply).parse()
}

/// Send a MissionInit to a control port and wait for the reply
pub fn request_handshake(
    address: &str,
    port: u16,
    mission: &MissionInit,
    timeout: Duration,
) -> ClientResult<HandshakeReply> {
    let request = ControlRequest::MissionInit {
        mission_init: mission.clone(),
    };
    request_control(address, port, &request, timeout)
}
