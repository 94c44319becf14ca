//! Listener pool: bind, accept, and queue inbound commands
//!
//! A pool owns one listening socket, bound either to a fixed port or to a
//! port allocated from a range. The accept loop runs on its own thread and
//! every accepted connection gets a reader thread. Readers hand each command
//! to a `CommandHook` and, if the hook accepts it, append it to a queue the
//! owning state machine drains from its home thread.

use super::error::{ListenerError, ListenerResult};
use super::framing::{self, MAX_FRAME_LEN};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

/// Lowest port probed for a participant's mission-control listener
pub const MIN_MISSION_CONTROL_PORT: u16 = 10000;

/// Lowest port probed for other dynamically allocated listeners
pub const MIN_FREE_PORT: u16 = 10100;

/// Highest port probed for any dynamically allocated listener
pub const MAX_FREE_PORT: u16 = 11000;

/// Reply written to a line client whose command exceeds the limit
pub const INPUT_TOO_LONG: &str = "ERROR Input too long";

const BIND_POLL: Duration = Duration::from_millis(10);

const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Which port a pool should listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpec {
    /// Exactly this port
    Fixed(u16),
    /// First free port in `min..=max`, probed in order or shuffled
    Range {
        /// Lower bound
        min: u16,
        /// Upper bound
        max: u16,
        /// Probe in random order
        randomize: bool,
    },
}

/// How commands are delimited on a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFraming {
    /// One command per newline-terminated line
    Line,
    /// One command per length-prefixed frame
    Length,
}

/// Options for a listener pool
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Address to bind
    pub bind_address: String,
    /// Command delimiting
    pub framing: CommandFraming,
    /// Longest accepted command
    pub max_command_len: usize,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            framing: CommandFraming::Line,
            max_command_len: MAX_FRAME_LEN,
        }
    }
}

/// A command taken off the wire together with where it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    /// Command text
    pub command: String,
    /// IP address of the sender
    pub peer: String,
}

/// Hook invoked synchronously for every inbound command
///
/// The hook may write a reply to `reply`. Returning `true` queues the
/// command; returning `false` drops it after the reply.
pub trait CommandHook: Send + Sync {
    /// Inspect one command
    fn on_command(&self, command: &str, peer: &str, reply: &mut dyn Write) -> bool;
}

/// Hook that queues every command without replying
#[derive(Debug, Default, Clone, Copy)]
pub struct QueueAll;

impl CommandHook for QueueAll {
    fn on_command(&self, _command: &str, _peer: &str, _reply: &mut dyn Write) -> bool {
        true
    }
}

/// Bind the first free port in `min..=max`
///
/// Sequential probing starts at `min`; randomized probing visits every
/// port in the range exactly once in shuffled order.
pub fn allocate_port(
    bind_address: &str,
    min: u16,
    max: u16,
    randomize: bool,
) -> ListenerResult<TcpListener> {
    if min > max {
        return Err(ListenerError::EmptyRange { min, max });
    }
    let mut candidates: Vec<u16> = (min..=max).collect();
    if randomize {
        candidates.shuffle(&mut rand::rng());
    }
    for port in candidates {
        match TcpListener::bind((bind_address, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::trace!("Port {} unavailable: {}", port, e),
        }
    }
    Err(ListenerError::NoFreePort { min, max })
}

fn bind_spec(bind_address: &str, spec: PortSpec) -> ListenerResult<TcpListener> {
    match spec {
        PortSpec::Fixed(port) => TcpListener::bind((bind_address, port))
            .map_err(|source| ListenerError::BindFailed { port, source }),
        PortSpec::Range { min, max, randomize } => allocate_port(bind_address, min, max, randomize),
    }
}

#[derive(Debug, Clone)]
enum BindState {
    Pending,
    Bound(SocketAddr),
    Failed(String),
}

struct PoolShared {
    name: String,
    options: ListenerOptions,
    hook: Arc<dyn CommandHook>,
    queue: Mutex<VecDeque<ReceivedCommand>>,
    bind: Mutex<BindState>,
    stop: AtomicBool,
    connections: Mutex<HashMap<Uuid, TcpStream>>,
}

impl PoolShared {
    fn enqueue(&self, command: String, peer: String) {
        self.queue.lock().push_back(ReceivedCommand { command, peer });
    }
}

/// A listening socket plus its queue of accepted commands
pub struct ListenerPool {
    shared: Arc<PoolShared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ListenerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerPool")
            .field("name", &self.shared.name)
            .field("bind", &*self.shared.bind.lock())
            .finish()
    }
}

impl ListenerPool {
    /// Start listening; binding happens on the accept thread
    pub fn start(
        name: impl Into<String>,
        spec: PortSpec,
        options: ListenerOptions,
        hook: Arc<dyn CommandHook>,
    ) -> Self {
        let shared = Arc::new(PoolShared {
            name: name.into(),
            options,
            hook,
            queue: Mutex::new(VecDeque::new()),
            bind: Mutex::new(BindState::Pending),
            stop: AtomicBool::new(false),
            connections: Mutex::new(HashMap::new()),
        });

        let worker = Arc::clone(&shared);
        let handle = thread::spawn(move || accept_loop(worker, spec));

        Self {
            shared,
            accept_thread: Mutex::new(Some(handle)),
        }
    }

    /// Pool name used in log lines
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Bound port, if binding has completed
    pub fn port(&self) -> Option<u16> {
        match &*self.shared.bind.lock() {
            BindState::Bound(addr) => Some(addr.port()),
            _ => None,
        }
    }

    /// Wait until the pool is bound or has failed to bind
    pub fn get_port_blocking(&self) -> Option<u16> {
        loop {
            let state = self.shared.bind.lock().clone();
            match state {
                BindState::Pending => thread::sleep(BIND_POLL),
                BindState::Bound(addr) => return Some(addr.port()),
                BindState::Failed(_) => return None,
            }
        }
    }

    /// Like `get_port_blocking`, but reports why binding failed
    pub fn wait_for_port(&self) -> ListenerResult<u16> {
        self.get_port_blocking()
            .ok_or_else(|| ListenerError::StartFailed(self.shared.name.clone()))
    }

    /// Take the oldest queued command
    pub fn pop_command(&self) -> Option<String> {
        self.pop_command_with_peer().map(|received| received.command)
    }

    /// Take the oldest queued command along with its sender
    pub fn pop_command_with_peer(&self) -> Option<ReceivedCommand> {
        self.shared.queue.lock().pop_front()
    }

    /// Queue a command directly, bypassing the hook
    pub fn push_command(&self, command: impl Into<String>, peer: impl Into<String>) {
        self.shared.enqueue(command.into(), peer.into());
    }

    /// Run a command through the hook as if it had arrived on a connection
    ///
    /// Returns whether the command was queued and the reply bytes the hook wrote.
    pub fn submit(&self, command: &str, peer: &str) -> (bool, Vec<u8>) {
        let mut reply = Vec::new();
        let accepted = self.shared.hook.on_command(command, peer, &mut reply);
        if accepted {
            self.shared.enqueue(command.to_string(), peer.to_string());
        }
        (accepted, reply)
    }

    /// Discard all queued commands, returning how many were dropped
    pub fn clear_commands(&self) -> usize {
        let mut queue = self.shared.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Number of queued commands
    pub fn queued_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Close the listening socket and any open connections
    ///
    /// Joins the accept thread, which drops the listening socket on its way
    /// out, so the port is released when this returns.
    pub fn stop_server(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Listener '{}' accept thread panicked", self.shared.name);
            }
        }
        for (_, stream) in self.shared.connections.lock().drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        tracing::info!("Listener '{}' stopped", self.shared.name);
    }
}

impl Drop for ListenerPool {
    fn drop(&mut self) {
        self.stop_server();
    }
}

fn accept_loop(shared: Arc<PoolShared>, spec: PortSpec) {
    let listener = match bind_spec(&shared.options.bind_address, spec) {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Listener '{}' failed to bind: {}", shared.name, e);
            *shared.bind.lock() = BindState::Failed(e.to_string());
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            *shared.bind.lock() = BindState::Failed(e.to_string());
            return;
        }
    };
    tracing::info!("Listener '{}' bound to port {}", shared.name, addr.port());
    *shared.bind.lock() = BindState::Bound(addr);

    accept_until_stopped(&shared.name, listener, &shared.stop, |stream| {
        let connection = Uuid::new_v4();
        if let Ok(clone) = stream.try_clone() {
            shared.connections.lock().insert(connection, clone);
        }
        let worker = Arc::clone(&shared);
        thread::spawn(move || {
            if let Err(e) = serve_connection(&worker, stream, connection) {
                tracing::debug!(
                    "Listener '{}' connection {} ended: {}",
                    worker.name,
                    connection,
                    e
                );
            }
            if let Some(stream) = worker.connections.lock().remove(&connection) {
                let _ = stream.shutdown(Shutdown::Both);
            }
        });
    });
}

/// Accept connections until `stop` is set, then close the listening socket
///
/// The socket is polled in non-blocking mode so a stop request is seen
/// within one poll period whether or not anyone connects.
pub(crate) fn accept_until_stopped<F>(
    name: &str,
    listener: TcpListener,
    stop: &AtomicBool,
    mut on_stream: F,
) where
    F: FnMut(TcpStream),
{
    if let Err(e) = listener.set_nonblocking(true) {
        tracing::error!("Listener '{}' cannot poll for connections: {}", name, e);
        return;
    }
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!("Listener '{}' dropped a connection: {}", name, e);
                    continue;
                }
                on_stream(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                tracing::warn!("Listener '{}' accept failed: {}", name, e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
    drop(listener);
}

fn serve_connection(
    shared: &PoolShared,
    stream: TcpStream,
    connection: Uuid,
) -> std::io::Result<()> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    tracing::debug!("Listener '{}' accepted {} from {}", shared.name, connection, peer);

    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);
    while !shared.stop.load(Ordering::SeqCst) {
        let command = match shared.options.framing {
            CommandFraming::Line => {
                match read_line_command(&mut reader, shared.options.max_command_len)? {
                    LineRead::Eof => break,
                    LineRead::TooLong => {
                        writer.write_all(INPUT_TOO_LONG.as_bytes())?;
                        writer.write_all(b"\n")?;
                        writer.flush()?;
                        break;
                    }
                    LineRead::Line(line) if line.is_empty() => continue,
                    LineRead::Line(line) => line,
                }
            }
            CommandFraming::Length => {
                match framing::read_frame(&mut reader, shared.options.max_command_len) {
                    Ok(payload) => String::from_utf8_lossy(&payload).into_owned(),
                    Err(e) => {
                        tracing::debug!("Listener '{}' frame read ended: {}", shared.name, e);
                        break;
                    }
                }
            }
        };
        if shared.hook.on_command(&command, &peer, &mut writer) {
            shared.enqueue(command, peer.clone());
        }
    }
    Ok(())
}

enum LineRead {
    Line(String),
    TooLong,
    Eof,
}

fn read_line_command<R: BufRead>(reader: &mut R, max_len: usize) -> std::io::Result<LineRead> {
    let mut buf = Vec::new();
    let limit = (max_len as u64).saturating_add(2);
    let read = reader.by_ref().take(limit).read_until(b'\n', &mut buf)?;
    if read == 0 {
        return Ok(LineRead::Eof);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    if buf.len() > max_len {
        return Ok(LineRead::TooLong);
    }
    Ok(LineRead::Line(String::from_utf8_lossy(&buf).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::time::Instant;

    fn local_options(framing: CommandFraming) -> ListenerOptions {
        ListenerOptions {
            bind_address: "127.0.0.1".to_string(),
            framing,
            ..ListenerOptions::default()
        }
    }

    fn wait_for_queue(pool: &ListenerPool, len: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.queued_len() < len && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    struct RejectPings;

    impl CommandHook for RejectPings {
        fn on_command(&self, command: &str, _peer: &str, reply: &mut dyn Write) -> bool {
            if command == "ping" {
                let _ = reply.write_all(b"pong\n");
                return false;
            }
            true
        }
    }

    #[test]
    fn test_empty_range_fails_immediately() {
        assert!(matches!(
            allocate_port("127.0.0.1", 10105, 10100, false),
            Err(ListenerError::EmptyRange { .. })
        ));
    }

    #[test]
    fn test_line_commands_are_queued_with_peer() {
        let pool = ListenerPool::start(
            "test-lines",
            PortSpec::Fixed(0),
            local_options(CommandFraming::Line),
            Arc::new(QueueAll),
        );
        let port = pool.get_port_blocking().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"move 1\r\nturn 0.5\n\n").unwrap();
        wait_for_queue(&pool, 2);

        let first = pool.pop_command_with_peer().unwrap();
        assert_eq!(first.command, "move 1");
        assert_eq!(first.peer, "127.0.0.1");
        assert_eq!(pool.pop_command().as_deref(), Some("turn 0.5"));
        assert_eq!(pool.pop_command(), None);
    }

    #[test]
    fn test_hook_can_short_circuit() {
        let pool = ListenerPool::start(
            "test-hook",
            PortSpec::Fixed(0),
            local_options(CommandFraming::Line),
            Arc::new(RejectPings),
        );
        let port = pool.get_port_blocking().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping\n").unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong\n");
        assert_eq!(pool.queued_len(), 0);

        let (queued, bytes) = pool.submit("jump", "10.0.0.1");
        assert!(queued);
        assert!(bytes.is_empty());
        assert_eq!(pool.clear_commands(), 1);
    }

    #[test]
    fn test_overlong_line_is_rejected() {
        let options = ListenerOptions {
            max_command_len: 8,
            ..local_options(CommandFraming::Line)
        };
        let pool = ListenerPool::start("test-long", PortSpec::Fixed(0), options, Arc::new(QueueAll));
        let port = pool.get_port_blocking().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"0123456789abcdef\n").unwrap();
        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(reply.trim_end(), INPUT_TOO_LONG);
        assert_eq!(pool.queued_len(), 0);
    }

    #[test]
    fn test_length_framed_commands() {
        let pool = ListenerPool::start(
            "test-frames",
            PortSpec::Fixed(0),
            local_options(CommandFraming::Length),
            Arc::new(QueueAll),
        );
        let port = pool.get_port_blocking().unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        framing::write_frame(&mut client, b"line one\nline two").unwrap();
        wait_for_queue(&pool, 1);
        assert_eq!(pool.pop_command().as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn test_stop_server_releases_port() {
        let pool = ListenerPool::start(
            "test-stop",
            PortSpec::Fixed(0),
            local_options(CommandFraming::Line),
            Arc::new(QueueAll),
        );
        let port = pool.get_port_blocking().unwrap();
        pool.stop_server();
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[test]
    fn test_stop_right_after_start_returns() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            for _ in 0..50 {
                let pool = ListenerPool::start(
                    "test-restart",
                    PortSpec::Fixed(0),
                    local_options(CommandFraming::Line),
                    Arc::new(QueueAll),
                );
                pool.stop_server();
            }
            let _ = done_tx.send(());
        });
        assert!(done_rx.recv_timeout(Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_bind_failure_reports_none() {
        let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = occupied.local_addr().unwrap().port();
        let pool = ListenerPool::start(
            "test-busy",
            PortSpec::Fixed(port),
            local_options(CommandFraming::Line),
            Arc::new(QueueAll),
        );
        assert_eq!(pool.get_port_blocking(), None);
        assert!(pool.wait_for_port().is_err());
    }
}
