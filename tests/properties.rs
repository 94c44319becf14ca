//! Property tests for framing, tokens, turn schedules, the assembly
//! barrier and the handshake decision table.

mod common;

use common::{OwnerWire, ScriptedFactory, config, mission};
use proptest::prelude::*;
use sortie::runtime::episode::Lifecycle;
use sortie::runtime::framing::{HEADER_LEN, decode_frame, encode_frame};
use sortie::runtime::handshake::{HandshakeReply, HandshakeView, decide};
use sortie::runtime::messages::MissionMessage;
use sortie::runtime::owner::{Owner, OwnerState};
use sortie::runtime::schedule::TurnScheduleBuilder;
use sortie::runtime::tokens::{TokenKey, TokenTable};
use std::time::Duration;

proptest! {
    #[test]
    fn prop_frame_is_header_plus_payload(payload in proptest::collection::vec(any::<u8>(), 0..512)) {
        let frame = encode_frame(&payload);
        prop_assert_eq!(frame.len(), HEADER_LEN + payload.len());
        prop_assert_eq!(&frame[..HEADER_LEN], &(payload.len() as u32).to_be_bytes()[..]);
        prop_assert_eq!(decode_frame(&frame).unwrap(), &payload[..]);
        if !payload.is_empty() {
            prop_assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
        }
    }

    #[test]
    fn prop_older_resets_never_resolve(inserts in proptest::collection::vec((0usize..3, 0u64..6), 1..40)) {
        let mut table = TokenTable::new(Duration::from_secs(60));
        for (role, reset) in inserts {
            table.insert(TokenKey::new("exp", role, reset), 10000 + reset as u16);
            for older in 0..reset {
                prop_assert!(!table.contains(&TokenKey::new("exp", role, older)));
            }
        }
    }

    #[test]
    fn prop_schedule_cycles_through_everyone(
        requests in proptest::collection::vec(proptest::option::of(0u32..4), 1..8)
    ) {
        let mut builder = TurnScheduleBuilder::new();
        for (index, position) in requests.iter().enumerate() {
            builder.request(format!("agent-{}", index), *position);
        }
        let schedule = builder.build();
        prop_assert_eq!(schedule.len(), requests.len());

        let first = schedule.first().unwrap().to_string();
        let mut seen = vec![first.clone()];
        let mut current = first.clone();
        for _ in 1..schedule.len() {
            current = schedule.successor(&current).unwrap().to_string();
            prop_assert!(!seen.contains(&current));
            seen.push(current.clone());
        }
        prop_assert_eq!(schedule.successor(&current).unwrap(), first.as_str());
    }

    #[test]
    fn prop_handshake_table(
        role_zero in any::<bool>(),
        has_server in any::<bool>(),
        idle in any::<bool>(),
        current in 0u8..3,
        current_has_server in any::<bool>(),
    ) {
        let leader = mission(&["leader", "follower"], 0);
        let mut request = leader.clone();
        request.role = if role_zero { 0 } else { 1 };
        if has_server {
            request.set_server_connection("10.0.0.1", 25565);
        }
        // 0: no mission, 1: the same mission, 2: some other mission
        let current_mission = match current {
            0 => None,
            1 => Some(leader.clone()),
            _ => Some(mission(&["leader", "follower"], 0)),
        }
        .map(|mut m| {
            if current_has_server {
                m.set_server_connection("10.0.0.2", 30000);
            }
            m
        });
        let view = HandshakeView { idle, current_mission, reservation: None };

        let reply = decide(&request, &view);
        let expected = match (role_zero, has_server) {
            (true, true) => None,
            (false, true) | (true, false) => Some(if idle { HandshakeReply::Ok } else { HandshakeReply::Busy }),
            (false, false) => Some(match (current, current_has_server) {
                (0, _) => HandshakeReply::NoMission,
                (1, true) => HandshakeReply::OkServer(view.current_mission.as_ref().unwrap().server_connection.clone().unwrap()),
                _ => HandshakeReply::Busy,
            }),
        };
        match expected {
            Some(expected) => prop_assert_eq!(reply, expected),
            None => prop_assert!(matches!(reply, HandshakeReply::Error(_))),
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_assembly_barrier_fires_once(
        order in Just(vec!["a", "b", "c"]).prop_shuffle(),
        duplicates in proptest::collection::vec(0usize..3, 0..4),
    ) {
        let wire = OwnerWire::default();
        wire.connect("observer");
        let (_script, factory) = ScriptedFactory::new();
        let owner = Owner::new(config(), wire.host(), factory).start();
        owner.notify(&Lifecycle::HostReady);
        owner.pump();
        owner.machine().queue_mission(mission(&["a", "b", "c"], 0));
        owner.tick();
        owner.pump();
        prop_assert_eq!(owner.state(), OwnerState::WaitingForAgentsToAssemble);

        let ready = |agent: &str| MissionMessage::AgentReady {
            agent_name: agent.to_string(),
            username: format!("u-{}", agent),
            turn_position: None,
        };
        for (step, agent) in order.iter().enumerate() {
            owner.deliver(agent, &ready(agent));
            for &dup in &duplicates {
                if dup <= step {
                    owner.deliver(order[dup], &ready(order[dup]));
                }
            }
        }
        prop_assert_eq!(wire.sent_of("AllPlayersJoined").len(), 1);
    }
}
