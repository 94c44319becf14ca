//! Interfaces to mission content handlers
//!
//! World generation, world decoration, quit decisions, rewards,
//! observations, command execution and video all live outside this crate.
//! The state machines only call these narrow traits, plus the
//! `prepare`/`cleanup` lifecycle around the states that use them.

use super::messages::MultidimensionalReward;
use super::mission::MissionInit;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Produces the world a mission runs in
pub trait WorldGenerator: Send {
    /// Create the world
    fn create_world(&mut self, mission: &MissionInit) -> anyhow::Result<()>;

    /// Whether a new world is needed given whether one already exists
    fn should_create_world(&self, mission: &MissionInit, world_exists: bool) -> bool {
        let _ = mission;
        !world_exists
    }
}

/// Decorates an existing world and takes part in the owner's running state
pub trait WorldDecorator: Send {
    /// Build mission content onto the world
    fn build_on_world(&mut self, mission: &MissionInit) -> anyhow::Result<()>;

    /// Extra participant handlers to announce once everyone has joined
    fn extra_agent_handlers(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Non-agent identities that take turns, with requested positions
    fn turn_participants(&self) -> Vec<(String, u32)> {
        Vec::new()
    }

    /// Called on entering the running state
    fn prepare(&mut self, _mission: &MissionInit) {}

    /// Called every tick while running
    fn update(&mut self) {}

    /// Give `identity` its turn directly; returns false if it is not ours
    fn targeted_update(&mut self, _identity: &str) -> bool {
        false
    }

    /// Called when the mission ends
    fn cleanup(&mut self) {}
}

/// Decides when the mission is over
pub trait QuitProducer: Send {
    /// Called on entering the running state
    fn prepare(&mut self, _mission: &MissionInit) {}

    /// Whether the mission should end now
    fn do_i_want_to_quit(&mut self, mission: &MissionInit) -> bool;

    /// Why the mission ended
    fn outcome(&self) -> String;

    /// Called when the mission ends
    fn cleanup(&mut self) {}
}

/// Produces rewards
pub trait RewardProducer: Send {
    /// Called on entering the running state
    fn prepare(&mut self, _mission: &MissionInit) {}

    /// Add any reward earned since the last call
    fn get_reward(&mut self, mission: &MissionInit, reward: &mut MultidimensionalReward);

    /// Called when the mission ends
    fn cleanup(&mut self) {}
}

/// Produces observation documents
pub trait ObservationProducer: Send {
    /// Called on entering the running state
    fn prepare(&mut self, _mission: &MissionInit) {}

    /// Add fields to the observation document
    fn write_observation(&mut self, mission: &MissionInit, out: &mut Map<String, Value>);

    /// Called when the mission ends
    fn cleanup(&mut self) {}
}

/// Executes agent commands, possibly overriding the host's own input
pub trait CommandHandler: Send {
    /// Hook into the host
    fn install(&mut self, _mission: &MissionInit) {}

    /// Unhook from the host
    fn deinstall(&mut self, _mission: &MissionInit) {}

    /// Execute one command; returns whether it was understood
    fn execute(&mut self, command: &str, mission: &MissionInit) -> bool;

    /// Take over from the host's own input
    fn set_overriding(&mut self, _overriding: bool) {}
}

/// One video frame: a fixed-size header followed by pixel data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Pose header
    pub header: Vec<u8>,
    /// Pixel data
    pub pixels: Vec<u8>,
}

/// Produces video frames
pub trait VideoProducer: Send {
    /// Called on entering the running state
    fn prepare(&mut self, _mission: &MissionInit) {}

    /// Frame width in pixels
    fn width(&self) -> u32;

    /// Frame height in pixels
    fn height(&self) -> u32;

    /// Render the next frame, if one is ready
    fn frame(&mut self, mission: &MissionInit) -> Option<VideoFrame>;

    /// Called when the mission ends
    fn cleanup(&mut self) {}
}

/// The set of content handlers for one side of one mission
#[derive(Default)]
pub struct MissionBehaviour {
    /// World generator
    pub world_generator: Option<Box<dyn WorldGenerator>>,
    /// World decorator
    pub world_decorator: Option<Box<dyn WorldDecorator>>,
    /// Quit producer
    pub quit_producer: Option<Box<dyn QuitProducer>>,
    /// Reward producer
    pub reward_producer: Option<Box<dyn RewardProducer>>,
    /// Observation producer
    pub observation_producer: Option<Box<dyn ObservationProducer>>,
    /// Command handler
    pub command_handler: Option<Box<dyn CommandHandler>>,
    /// Video producer
    pub video_producer: Option<Box<dyn VideoProducer>>,
    /// Requested turn position, if this participant takes turns
    pub turn_position: Option<u32>,
}

impl std::fmt::Debug for MissionBehaviour {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissionBehaviour")
            .field("world_generator", &self.world_generator.is_some())
            .field("world_decorator", &self.world_decorator.is_some())
            .field("quit_producer", &self.quit_producer.is_some())
            .field("reward_producer", &self.reward_producer.is_some())
            .field("observation_producer", &self.observation_producer.is_some())
            .field("command_handler", &self.command_handler.is_some())
            .field("video_producer", &self.video_producer.is_some())
            .field("turn_position", &self.turn_position)
            .finish()
    }
}

impl MissionBehaviour {
    /// Fill empty handler slots from `extra`
    pub fn merge(&mut self, extra: MissionBehaviour) {
        macro_rules! fill {
            ($($slot:ident),*) => {
                $(if self.$slot.is_none() { self.$slot = extra.$slot; })*
            };
        }
        fill!(
            world_generator,
            world_decorator,
            quit_producer,
            reward_producer,
            observation_producer,
            command_handler,
            video_producer,
            turn_position
        );
    }

    /// Prepare the producers and install the command handler
    pub fn prepare_agent(&mut self, mission: &MissionInit) {
        if let Some(quit) = self.quit_producer.as_mut() {
            quit.prepare(mission);
        }
        if let Some(reward) = self.reward_producer.as_mut() {
            reward.prepare(mission);
        }
        if let Some(observation) = self.observation_producer.as_mut() {
            observation.prepare(mission);
        }
        if let Some(video) = self.video_producer.as_mut() {
            video.prepare(mission);
        }
        if let Some(commands) = self.command_handler.as_mut() {
            commands.install(mission);
            commands.set_overriding(true);
        }
    }

    /// Undo `prepare_agent`
    pub fn cleanup_agent(&mut self, mission: &MissionInit) {
        if let Some(quit) = self.quit_producer.as_mut() {
            quit.cleanup();
        }
        if let Some(reward) = self.reward_producer.as_mut() {
            reward.cleanup();
        }
        if let Some(observation) = self.observation_producer.as_mut() {
            observation.cleanup();
        }
        if let Some(video) = self.video_producer.as_mut() {
            video.cleanup();
        }
        if let Some(commands) = self.command_handler.as_mut() {
            commands.set_overriding(false);
            commands.deinstall(mission);
        }
    }

    /// The quit producer's outcome if it wants to quit
    pub fn quit_requested(&mut self, mission: &MissionInit) -> Option<String> {
        let quit = self.quit_producer.as_mut()?;
        quit.do_i_want_to_quit(mission).then(|| quit.outcome())
    }

    /// Observation document as JSON text (`{}` when there is nothing)
    pub fn observation_json(&mut self, mission: &MissionInit) -> String {
        let mut out = Map::new();
        if let Some(observation) = self.observation_producer.as_mut() {
            observation.write_observation(mission, &mut out);
        }
        Value::Object(out).to_string()
    }

    /// Reward earned since the last call
    pub fn collect_reward(&mut self, mission: &MissionInit) -> MultidimensionalReward {
        let mut reward = MultidimensionalReward::new();
        if let Some(producer) = self.reward_producer.as_mut() {
            producer.get_reward(mission, &mut reward);
        }
        reward
    }

    /// Execute a command; returns whether any handler understood it
    pub fn execute_command(&mut self, command: &str, mission: &MissionInit) -> bool {
        match self.command_handler.as_mut() {
            Some(handler) => handler.execute(command, mission),
            None => false,
        }
    }
}

/// Builds content handlers from mission documents
pub trait HandlerFactory: Send + Sync {
    /// Owner-side handlers: world generator, decorator, quit producer
    fn owner_behaviour(&self, mission: &MissionInit) -> anyhow::Result<MissionBehaviour>;

    /// Participant-side handlers for the participant's own role
    fn agent_behaviour(&self, mission: &MissionInit) -> anyhow::Result<MissionBehaviour>;

    /// Late-bound handlers announced once every participant has joined
    fn extra_behaviour(
        &self,
        _mission: &MissionInit,
        _extra: &BTreeMap<String, String>,
    ) -> anyhow::Result<MissionBehaviour> {
        Ok(MissionBehaviour::default())
    }
}
