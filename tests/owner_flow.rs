//! Integration tests for the mission owner state machine
//!
//! Drives an owner through assembly, running, shutdown and the failure
//! paths with a recording host standing in for the network.

mod common;

use common::{OwnerWire, ScriptedFactory, config, mission, tick_until};
use sortie::runtime::episode::Lifecycle;
use sortie::runtime::machine::StateMachine;
use sortie::runtime::messages::{MissionMessage, MultidimensionalReward};
use sortie::runtime::owner::{ALL_AGENTS_FINISHED, Owner, OwnerState};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

fn ready(agent: &str, turn_position: Option<u32>) -> MissionMessage {
    MissionMessage::AgentReady {
        agent_name: agent.to_string(),
        username: format!("u-{}", agent),
        turn_position,
    }
}

fn running(agent: &str) -> MissionMessage {
    MissionMessage::AgentRunning {
        username: format!("u-{}", agent),
    }
}

fn dormant_owner(wire: &OwnerWire) -> (std::sync::Arc<common::Script>, StateMachine<Owner>) {
    let (script, factory) = ScriptedFactory::new();
    let owner = Owner::new(config(), wire.host(), factory).start();
    assert_eq!(owner.state(), OwnerState::WaitingForModReady);
    owner.notify(&Lifecycle::HostReady);
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
    (script, owner)
}

/// Owner with a two-agent mission, waiting for the agents
fn assembling_owner(wire: &OwnerWire) -> (std::sync::Arc<common::Script>, StateMachine<Owner>) {
    wire.connect("u-alice");
    wire.connect("u-bob");
    let (script, owner) = dormant_owner(wire);
    owner.machine().queue_mission(mission(&["alice", "bob"], 0));
    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::WaitingForAgentsToAssemble);
    (script, owner)
}

fn assemble(owner: &StateMachine<Owner>, positions: [Option<u32>; 2]) {
    owner.deliver("u-alice", &ready("alice", positions[0]));
    owner.deliver("u-bob", &ready("bob", positions[1]));
    owner.deliver("u-alice", &running("alice"));
    owner.deliver("u-bob", &running("bob"));
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Running);
}

#[test]
fn test_full_mission_lifecycle() {
    let wire = OwnerWire::default();
    let (script, owner) = assembling_owner(&wire);
    assert!(!owner.machine().slot().is_idle());

    owner.deliver("u-alice", &ready("alice", None));
    assert!(wire.sent_of("AllPlayersJoined").is_empty());
    owner.deliver("u-bob", &ready("bob", None));
    assert_eq!(wire.sent_of("AllPlayersJoined").len(), 2);
    assert_eq!(owner.machine().agent_for("u-bob"), Some("bob"));
    assert_eq!(owner.machine().watch_list(), ["u-alice", "u-bob"]);

    owner.deliver("u-alice", &running("alice"));
    owner.pump();
    assert_eq!(owner.state(), OwnerState::WaitingForAgentsToAssemble);
    owner.deliver("u-bob", &running("bob"));
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Running);
    assert_eq!(wire.sent_of("Go").len(), 2);

    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Running);

    script.quit.store(true, Ordering::SeqCst);
    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::WaitingForAgentsToQuit);
    let stops = wire.sent_of("StopAgents");
    assert_eq!(stops.len(), 2);
    assert_eq!(
        stops[0].1,
        MissionMessage::StopAgents {
            quit_code: "flag raised".into()
        }
    );

    owner.deliver("u-alice", &MissionMessage::AgentStopped { agent_name: "alice".into() });
    assert!(wire.sent_of("MissionOver").is_empty());
    owner.deliver("u-bob", &MissionMessage::AgentStopped { agent_name: "bob".into() });
    assert_eq!(wire.sent_of("MissionOver").len(), 2);

    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
    let machine = owner.machine();
    assert_eq!(machine.quit_code(), "flag raised");
    assert!(machine.current_mission().is_none());
    assert!(machine.watch_list().is_empty());
    assert!(machine.slot().is_idle());
}

#[test]
fn test_duplicate_ready_is_ignored() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);

    owner.deliver("u-alice", &ready("alice", None));
    owner.deliver("u-alice", &ready("alice", None));
    owner.deliver("u-carol", &ready("carol", None));
    assert!(wire.sent_of("AllPlayersJoined").is_empty());

    owner.deliver("u-bob", &ready("bob", None));
    owner.deliver("u-bob", &ready("bob", None));
    assert_eq!(wire.sent_of("AllPlayersJoined").len(), 2);
}

#[test]
fn test_every_agent_finishing_ends_the_mission() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);
    assemble(&owner, [None, None]);

    for agent in ["alice", "bob"] {
        owner.deliver(
            &format!("u-{}", agent),
            &MissionMessage::AgentFinishedMission {
                agent_name: agent.into(),
                username: format!("u-{}", agent),
            },
        );
    }
    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::WaitingForAgentsToQuit);
    assert_eq!(owner.machine().quit_code(), ALL_AGENTS_FINISHED);
}

#[test]
fn test_turns_follow_requested_positions() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);
    assemble(&owner, [Some(1), Some(0)]);
    assert_eq!(owner.machine().turn_schedule().as_slice(), ["u-bob", "u-alice"]);

    let turns = || {
        wire.sent_of("YourTurn")
            .into_iter()
            .map(|(to, _)| to)
            .collect::<Vec<_>>()
    };
    assert_eq!(turns(), ["u-bob"]);

    owner.deliver("u-bob", &MissionMessage::TurnTaken { username: "u-bob".into() });
    owner.deliver("u-alice", &MissionMessage::TurnTaken { username: "u-alice".into() });
    assert_eq!(turns(), ["u-bob", "u-alice", "u-bob"]);

    owner.deliver("u-zed", &MissionMessage::TurnTaken { username: "u-zed".into() });
    assert_eq!(wire.sent_of("Abort").len(), 2);
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
}

#[test]
fn test_shared_reward_is_rebroadcast() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);
    assemble(&owner, [None, None]);

    let mut reward = MultidimensionalReward::new();
    reward.add(1, 2.5);
    let share = MissionMessage::ShareReward {
        agent_name: "alice".into(),
        reward,
    };
    owner.deliver("u-alice", &share);
    let shared = wire.sent_of("ShareReward");
    assert_eq!(shared.len(), 2);
    assert!(shared.iter().all(|(_, message)| *message == share));
}

#[test]
fn test_lost_watched_identity_aborts_assembly() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);
    owner.deliver("u-alice", &ready("alice", None));

    wire.disconnect("u-alice");
    owner.tick();
    let aborts = wire.sent_of("Abort");
    assert_eq!(aborts.len(), 1);
    assert_eq!(aborts[0].0, "u-bob");
    assert_eq!(
        aborts[0].1,
        MissionMessage::Abort {
            message: "Lost contact with u-alice".into()
        }
    );

    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
    assert!(owner.machine().slot().is_idle());
}

#[test]
fn test_client_bailing_aborts_the_mission() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);
    assemble(&owner, [None, None]);

    owner.deliver(
        "u-bob",
        &MissionMessage::ClientBailed {
            username: "u-bob".into(),
            error: "world unreachable".into(),
        },
    );
    assert_eq!(wire.sent_of("Abort").len(), 2);
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
}

#[test]
fn test_assembly_timeout() {
    let wire = OwnerWire::default();
    wire.connect("u-alice");
    let (_script, factory) = ScriptedFactory::new();
    let config = sortie::runtime::OrchestratorConfig {
        assembly_timeout_ms: Some(0),
        ..config()
    };
    let owner = Owner::new(config, wire.host(), factory).start();
    owner.notify(&Lifecycle::HostReady);
    owner.pump();
    owner.machine().queue_mission(mission(&["alice", "bob"], 0));
    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::WaitingForAgentsToAssemble);

    std::thread::sleep(std::time::Duration::from_millis(5));
    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
    assert_eq!(wire.sent_of("Abort").len(), 1);
}

#[test]
fn test_missions_queued_before_dormant_are_discarded() {
    let wire = OwnerWire::default();
    let (_script, factory) = ScriptedFactory::new();
    let owner = Owner::new(config(), wire.host(), factory).start();
    owner.machine().queue_mission(mission(&["alice"], 0));

    owner.notify(&Lifecycle::HostReady);
    owner.pump();
    owner.tick();
    owner.pump();
    assert_eq!(owner.state(), OwnerState::Dormant);
    assert!(owner.machine().current_mission().is_none());
}

#[test]
fn test_agents_report_from_network_threads() {
    let wire = OwnerWire::default();
    let (_script, owner) = assembling_owner(&wire);
    let owner = Arc::new(owner);
    let stop = Arc::new(AtomicBool::new(false));

    let senders: Vec<_> = ["alice", "bob"]
        .into_iter()
        .map(|agent| {
            let owner = Arc::clone(&owner);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let user = format!("u-{}", agent);
                owner.deliver(&user, &ready(agent, None));
                // Keep talking while the home thread moves the owner on.
                while !stop.load(Ordering::SeqCst) {
                    owner.deliver(&user, &running(agent));
                    owner.deliver(&user, &MissionMessage::Ping);
                }
            })
        })
        .collect();

    let home: &StateMachine<Owner> = &owner;
    let reached = tick_until(home, |o| o.state() == OwnerState::Running);
    stop.store(true, Ordering::SeqCst);
    for sender in senders {
        sender.join().unwrap();
    }
    assert!(reached);
    assert_eq!(wire.sent_of("AllPlayersJoined").len(), 2);
    assert_eq!(wire.sent_of("Go").len(), 2);
}
