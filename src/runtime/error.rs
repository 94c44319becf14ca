//! Error types for the orchestration runtime
//!
//! Each subsystem owns a `thiserror` enum; the top-level `RuntimeError`
//! wraps them so construction-time failures can be reported in one place.

use std::io;
use thiserror::Error;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Framing errors
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// Listener errors
    #[error("Listener error: {0}")]
    Listener(#[from] ListenerError),

    /// State machine errors
    #[error("State machine error: {0}")]
    Machine(#[from] MachineError),

    /// Mission document errors
    #[error("Mission error: {0}")]
    Mission(#[from] MissionError),

    /// Gateway errors
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Framing-specific errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before the declared frame length was read
    #[error("Truncated frame: expected {expected} bytes, received {received}")]
    Truncated {
        /// Declared length
        expected: usize,
        /// Bytes actually available
        received: usize,
    },

    /// The declared frame length exceeds the configured maximum
    #[error("Frame of {len} bytes exceeds limit of {max}")]
    TooLarge {
        /// Declared length
        len: usize,
        /// Configured maximum
        max: usize,
    },

    /// The channel has no open connection and could not open one
    #[error("Not connected to {0}")]
    NotConnected(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for framing operations
pub type FrameResult<T> = std::result::Result<T, FrameError>;

/// Listener-pool errors
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The requested range contains no ports
    #[error("Port range {min}..={max} is empty")]
    EmptyRange {
        /// Lower bound
        min: u16,
        /// Upper bound
        max: u16,
    },

    /// Every port in the range was unavailable
    #[error("No free port in range {min}..={max}")]
    NoFreePort {
        /// Lower bound
        min: u16,
        /// Upper bound
        max: u16,
    },

    /// Binding the fixed port failed
    #[error("Failed to bind port {port}: {source}")]
    BindFailed {
        /// Requested port
        port: u16,
        /// Underlying failure
        source: io::Error,
    },

    /// The pool failed before reporting a port
    #[error("Listener '{0}' failed to start")]
    StartFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for listener operations
pub type ListenerResult<T> = std::result::Result<T, ListenerError>;

/// State machine errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MachineError {
    /// A transition was requested while another one was still pending
    #[error("{machine}: transition to {requested} requested while transition to {pending} is pending")]
    TransitionAlreadyPending {
        /// Machine name
        machine: String,
        /// Transition already queued
        pending: String,
        /// Transition that was refused
        requested: String,
    },

    /// A home-thread-only operation was attempted from another thread
    #[error("{0}: operation is only permitted on the home thread")]
    NotHomeThread(String),
}

/// Convenience result alias for state machine operations
pub type MachineResult<T> = std::result::Result<T, MachineError>;

/// Mission document errors
#[derive(Debug, Error)]
pub enum MissionError {
    /// The document is not valid JSON or does not match the schema
    #[error("Malformed mission document: {0}")]
    Json(#[from] serde_json::Error),

    /// The document decoded but violates a structural rule
    #[error("Invalid mission document: {0}")]
    Invalid(String),

    /// The control message is not a kind this runtime understands
    #[error("Unrecognized control message: {0}")]
    NotUnderstood(String),
}

/// Convenience result alias for mission document operations
pub type MissionResult<T> = std::result::Result<T, MissionError>;

/// Session gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The first frame on a connection was not the expected hello
    #[error("Bad hello: {0}")]
    BadHello(String),

    /// A rendezvous token could not be parsed
    #[error("Bad token '{0}'")]
    BadToken(String),

    /// The command is not one the gateway accepts
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Framing error on the connection
    #[error("Framing error: {0}")]
    Frame(#[from] FrameError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for gateway operations
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Errors produced by the handshake and gateway clients
#[derive(Debug, Error)]
pub enum ClientError {
    /// I/O error while talking to the remote side
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Framing error
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// Mission document error
    #[error("mission error: {0}")]
    Mission(#[from] MissionError),

    /// The remote side returned something that does not parse
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

/// Convenience result alias for client operations
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Convenience result alias for runtime-level operations
pub type Result<T> = std::result::Result<T, RuntimeError>;
