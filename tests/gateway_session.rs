//! End-to-end: an agent drives a participant through the session gateway

mod common;

use common::{ParticipantWire, ScriptedFactory, config, mission, tick_until};
use sortie::runtime::episode::Lifecycle;
use sortie::runtime::gateway::{GatewayClient, SessionGateway, hello_prefix};
use sortie::runtime::messages::{MissionMessage, MultidimensionalReward};
use sortie::runtime::framing;
use sortie::runtime::participant::{Participant, ParticipantState};
use sortie::runtime::tokens::TokenKey;
use std::collections::BTreeMap;
use std::net::TcpStream;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(2);

#[test]
fn test_agent_steps_through_a_mission() {
    let wire = ParticipantWire::default();
    let (script, factory) = ScriptedFactory::new();
    let participant = Participant::new(config(), wire.host("u-solo"), factory)
        .with_mission_control()
        .unwrap();
    let gateway = SessionGateway::new(config(), participant.mission_poller());
    let participant = participant.bind_gateway(gateway.clone()).start();
    participant.notify(&Lifecycle::HostReady);
    participant.pump();

    let server = gateway.serve().unwrap();
    let mut agent = GatewayClient::connect("127.0.0.1", server.port(), TIMEOUT).unwrap();
    agent.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert!(agent.init().unwrap());
    assert_eq!(agent.echo("hi").unwrap(), "<Echo><Echo>hi</Echo>");

    let init = mission(&["solo"], 0);
    let key = TokenKey::new(init.experiment_id.clone(), 0, 0);
    let (started, turn_key) = agent.mission_init(&init, &key, 1).unwrap();
    assert!(started);
    assert!(turn_key.is_empty());
    assert_eq!(agent.status().unwrap()["session"], key.to_string());

    assert!(tick_until(&participant, |p| {
        p.state() == ParticipantState::WaitingForServerReady
    }));
    participant.deliver(
        "owner",
        &MissionMessage::AllPlayersJoined {
            extra_handlers: BTreeMap::new(),
        },
    );
    participant.tick();
    participant.pump();
    assert_eq!(participant.state(), ParticipantState::Running);
    participant.deliver("owner", &MissionMessage::Go);

    // Another agent's shared reward rides along with ours.
    let mut shared = MultidimensionalReward::new();
    shared.add(0, 10.0);
    participant.deliver(
        "owner",
        &MissionMessage::ShareReward {
            agent_name: "someone".into(),
            reward: shared,
        },
    );
    participant.tick();

    let reply = agent.step(2, "jump", "").unwrap();
    assert!(reply.sent);
    assert!(!reply.done);
    assert_eq!(reply.observation, [7, 7, 7, 9, 9, 9]);
    assert_eq!(reply.reward, 11.0);
    assert_eq!(reply.info.as_deref(), Some(r#"{"ticks":1}"#));
    assert_eq!(reply.next_turn_key, None);

    assert!(tick_until(&participant, |_| !script.executed.lock().is_empty()));
    assert_eq!(*script.executed.lock(), ["jump"]);

    let (observation, done) = agent.peek().unwrap();
    assert!(!observation.is_empty());
    assert!(!done);

    assert!(!agent.quit().unwrap());
    participant.tick();
    participant.pump();
    assert_eq!(participant.state(), ParticipantState::Idling);

    participant.deliver(
        "owner",
        &MissionMessage::StopAgents {
            quit_code: "Quit requested".into(),
        },
    );
    participant.pump();
    assert_eq!(participant.state(), ParticipantState::MissionEnded);
    let (_, done) = agent.peek().unwrap();
    assert!(done);
    assert!(agent.quit().unwrap());
    assert!(agent.step(3, "jump", "").unwrap().done);

    server.stop();
}

#[test]
fn test_followers_find_the_leaders_server() {
    let gateway = SessionGateway::new(config(), None);
    let server = gateway.serve().unwrap();
    let mut leader = GatewayClient::connect("127.0.0.1", server.port(), TIMEOUT).unwrap();
    let mut follower = GatewayClient::connect("127.0.0.1", server.port(), TIMEOUT).unwrap();

    let init = mission(&["leader", "follower"], 0);
    let key = TokenKey::new(init.experiment_id.clone(), 0, 3);
    // No mission poller behind this gateway, so the start is refused.
    let (started, _) = leader.mission_init(&init, &key, 2).unwrap();
    assert!(!started);

    let follower_key = key.with_role(1);
    assert_eq!(follower.find(&follower_key).unwrap(), 0);

    gateway.notify_server_started(31000);
    assert_eq!(follower.find(&follower_key).unwrap(), 31000);
    assert!(follower.close(&follower_key).unwrap());
    assert_eq!(follower.find(&follower_key).unwrap(), 0);
}

#[test]
fn test_bad_hello_is_dropped() {
    let gateway = SessionGateway::new(config(), None);
    let server = gateway.serve().unwrap();

    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    framing::write_frame(&mut stream, b"<MalmoEnv0.37/>").unwrap();
    let _ = framing::write_frame(&mut stream, b"<Init/>");
    assert!(framing::read_i32_frame(&mut stream).is_err());

    let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
    stream.set_read_timeout(Some(TIMEOUT)).unwrap();
    framing::write_frame(&mut stream, format!("{}/>", hello_prefix()).as_bytes()).unwrap();
    framing::write_frame(&mut stream, b"<Dance/>").unwrap();
    assert!(framing::read_i32_frame(&mut stream).is_err());
}
