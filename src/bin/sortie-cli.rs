//! Sortie CLI - workspace setup and wire diagnostics
//!
//! Manages the on-disk configuration and mission documents, and talks to
//! running control ports and session gateways.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sortie::runtime::gateway::{GatewayClient, SessionGateway};
use sortie::runtime::handshake::{self, ControlRequest, HandshakeHook, MissionSlot};
use sortie::runtime::listener::{CommandFraming, ListenerOptions, ListenerPool, PortSpec};
use sortie::runtime::storage;
use sortie::runtime::tokens::TokenKey;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "sortie")]
#[command(about = "Mission orchestration for multi-agent simulated worlds", long_about = None)]
struct Cli {
    /// Workspace root holding config and saved missions
    #[arg(short, long, default_value = ".sortie")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the workspace and write a config
    Init {
        /// Port the session gateway listens on
        #[arg(long)]
        gateway_port: Option<u16>,

        /// Fixed mission-control port (0 allocates one)
        #[arg(long)]
        mission_control_port: Option<u16>,
    },

    /// Print the effective config
    Config,

    /// Validate a mission document and save it to the workspace
    Save {
        /// Path to a MissionInit JSON document
        mission: PathBuf,
    },

    /// List saved missions
    Missions,

    /// Send a mission to a control port and print the reply
    Handshake {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long)]
        port: u16,

        /// Path to a MissionInit JSON document
        #[arg(long)]
        mission: PathBuf,
    },

    /// Hold a machine for one experiment
    Reserve {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long)]
        port: u16,

        #[arg(long)]
        experiment: String,

        /// How long the reservation lasts
        #[arg(long, default_value = "60000")]
        ms: u64,
    },

    /// Drop a machine's reservation
    Cancel {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long)]
        port: u16,
    },

    /// Ask a machine where an experiment's world server is
    FindServer {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long)]
        port: u16,

        #[arg(long)]
        experiment: String,
    },

    /// Answer handshakes on a port as an idle machine, printing what arrives
    Listen {
        /// Port to listen on (0 allocates from the mission-control range)
        #[arg(long, default_value = "0")]
        port: u16,
    },

    /// Run a standalone session gateway for token rendezvous
    Serve,

    /// Talk to a session gateway
    Gateway {
        #[arg(long, default_value = "127.0.0.1")]
        address: String,

        #[arg(long)]
        port: Option<u16>,

        #[command(subcommand)]
        action: GatewayAction,
    },
}

#[derive(Subcommand)]
enum GatewayAction {
    /// Print the gateway status document
    Status,

    /// Resolve a rendezvous token (experiment:role:reset)
    Find { token: String },

    /// Drop a rendezvous token
    Close { token: String },

    /// Reset every token
    Init,

    /// Ask the running session to quit
    Quit,

    /// Print the latest observation and done flag
    Peek,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    let config = storage::load_config(&cli.root)?;

    match cli.command {
        Commands::Init {
            gateway_port,
            mission_control_port,
        } => {
            let mut config = config;
            if let Some(port) = gateway_port {
                config.gateway_port = port;
            }
            if let Some(port) = mission_control_port {
                config.mission_control_port = port;
            }
            storage::init_storage(&cli.root)?;
            storage::write_config(&cli.root, &config)?;
            println!("Initialized sortie workspace at {:?}", cli.root);
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }

        Commands::Save { mission } => {
            let init = storage::read_mission(&mission)?;
            let fingerprint = storage::save_mission(&cli.root, &init)?;
            println!("Saved mission '{}' as {}", init.mission.name, fingerprint);
        }

        Commands::Missions => {
            let store = storage::Storage::new(&cli.root);
            for fingerprint in store.list_missions()? {
                let init = storage::read_mission(&store.mission_path(&fingerprint))?;
                println!(
                    "{}  {}  ({} agents)",
                    fingerprint,
                    init.mission.name,
                    init.agent_count()
                );
            }
        }

        Commands::Handshake {
            address,
            port,
            mission,
        } => {
            let init = storage::read_mission(&mission)?;
            let reply =
                handshake::request_handshake(&address, port, &init, config.connect_timeout())
                    .with_context(|| format!("Handshake with {}:{} failed", address, port))?;
            println!("{}", reply);
        }

        Commands::Reserve {
            address,
            port,
            experiment,
            ms,
        } => {
            let request = ControlRequest::reserve(experiment, Duration::from_millis(ms));
            send_control(&address, port, &request, config.connect_timeout())?;
        }

        Commands::Cancel { address, port } => {
            send_control(
                &address,
                port,
                &ControlRequest::CancelRequest,
                config.connect_timeout(),
            )?;
        }

        Commands::FindServer {
            address,
            port,
            experiment,
        } => {
            let request = ControlRequest::FindServer {
                experiment_id: experiment,
            };
            send_control(&address, port, &request, config.connect_timeout())?;
        }

        Commands::Listen { port } => {
            let slot = Arc::new(MissionSlot::new());
            slot.set_idle(true);
            let spec = if port == 0 {
                PortSpec::Range {
                    min: config.min_mission_control_port,
                    max: config.max_free_port,
                    randomize: false,
                }
            } else {
                PortSpec::Fixed(port)
            };
            let pool = ListenerPool::start(
                "listen",
                spec,
                ListenerOptions {
                    bind_address: config.bind_address.clone(),
                    framing: CommandFraming::Length,
                    max_command_len: config.max_frame_len,
                },
                Arc::new(HandshakeHook::new("listen", Arc::clone(&slot))),
            );
            let bound = pool.wait_for_port()?;
            println!("Answering handshakes on port {}", bound);
            loop {
                while let Some(received) = pool.pop_command_with_peer() {
                    println!("{}: {}", received.peer, received.command);
                    slot.set_idle(true);
                }
                thread::sleep(Duration::from_millis(100));
            }
        }

        Commands::Serve => {
            let gateway = SessionGateway::new(config, None);
            let server = gateway.serve()?;
            println!("Session gateway on port {}", server.port());
            loop {
                thread::sleep(Duration::from_secs(1));
            }
        }

        Commands::Gateway {
            address,
            port,
            action,
        } => {
            let port = port.unwrap_or(config.gateway_port);
            let mut client = GatewayClient::connect(&address, port, config.connect_timeout())
                .with_context(|| format!("Cannot reach gateway at {}:{}", address, port))?;
            client.set_read_timeout(Some(config.gateway_wait() * 2))?;
            match action {
                GatewayAction::Status => {
                    println!("{}", serde_json::to_string_pretty(&client.status()?)?);
                }
                GatewayAction::Find { token } => {
                    let key: TokenKey = token.parse()?;
                    match client.find(&key)? {
                        0 => bail!("Token {} is not published", key),
                        port => println!("{}", port),
                    }
                }
                GatewayAction::Close { token } => {
                    let key: TokenKey = token.parse()?;
                    client.close(&key)?;
                    println!("Closed {}", key);
                }
                GatewayAction::Init => {
                    client.init()?;
                    println!("Tokens reset");
                }
                GatewayAction::Quit => {
                    let done = client.quit()?;
                    println!("{}", if done { "already done" } else { "quit requested" });
                }
                GatewayAction::Peek => {
                    let (observation, done) = client.peek()?;
                    println!("done: {}", done);
                    println!("{}", String::from_utf8_lossy(&observation));
                }
            }
        }
    }

    Ok(())
}

fn send_control(address: &str, port: u16, request: &ControlRequest, timeout: Duration) -> Result<()> {
    let reply = handshake::request_control(address, port, request, timeout)
        .with_context(|| format!("Control request to {}:{} failed", address, port))?;
    println!("{}", reply);
    Ok(())
}
