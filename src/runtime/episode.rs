//! Episodes and the live-episode dispatcher
//!
//! An `Episode` owns the behaviour of one state. The dispatcher holds the
//! single live episode and forwards every external event to it. Swapping
//! the live episode takes the write side of the dispatcher lock, so an
//! in-flight dispatch always finishes before the old episode is retired.

use super::machine::MachineHandle;
use parking_lot::{Mutex, RwLock};
use std::fmt;

/// A state value owned by exactly one machine type
pub trait MachineState: Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static {}

/// Notifications from the host that are neither ticks nor messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// The host has finished starting up
    HostReady,
    /// The network connection to the rest of the mission dropped
    ConnectionLost(String),
}

/// Per-machine data plus the state-to-episode mapping
pub trait Machine: Send + Sized + 'static {
    /// States this machine moves through
    type State: MachineState;
    /// Messages delivered to episodes
    type Message: Send + Sync + fmt::Debug;

    /// Name used in log lines
    fn name(&self) -> &'static str;

    /// Construct the episode for `state`
    fn episode_for(&mut self, state: Self::State) -> Box<dyn Episode<Self>>;

    /// Called before every transition, ahead of the old episode's cleanup
    fn on_pre_state_change(&mut self, from: Self::State, to: Self::State) {
        tracing::debug!("{}: leaving {} for {}", self.name(), from, to);
    }
}

/// Behaviour bound to exactly one state
///
/// All callbacks run with the machine data locked. Returning `Err` is
/// logged and recorded in the error text; it never unwinds the machine.
pub trait Episode<M: Machine>: Send {
    /// Entry action, run once when the state is entered
    fn execute(&mut self, cx: &mut EpisodeContext<'_, M>) -> anyhow::Result<()>;

    /// Periodic tick from the home thread
    fn on_tick(&mut self, _cx: &mut EpisodeContext<'_, M>) -> anyhow::Result<()> {
        Ok(())
    }

    /// A message from another participant in the mission
    fn on_message(
        &mut self,
        _cx: &mut EpisodeContext<'_, M>,
        _from: &str,
        _message: &M::Message,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// A host lifecycle notification
    fn on_lifecycle(
        &mut self,
        _cx: &mut EpisodeContext<'_, M>,
        _event: &Lifecycle,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    /// Exit action, run once when a different state is entered
    fn cleanup(&mut self, _machine: &mut M) {}
}

/// What an episode callback can see and do
pub struct EpisodeContext<'a, M: Machine> {
    /// Machine data
    pub machine: &'a mut M,
    handle: &'a MachineHandle<M::State>,
    live: &'a mut bool,
}

impl<M: Machine> EpisodeContext<'_, M> {
    /// Finish this episode and queue the next state
    ///
    /// The episode receives no further callbacks after this call. Returns
    /// `false` if another transition was already pending: that transition
    /// stands, and this episode stays finished.
    pub fn complete(&mut self, next: M::State) -> bool {
        *self.live = false;
        self.handle.queue_state_change(next).is_ok()
    }

    /// Whether this episode is still receiving callbacks
    pub fn is_live(&self) -> bool {
        *self.live
    }

    /// Current state of the machine
    pub fn state(&self) -> M::State {
        self.handle.state()
    }

    /// Append to the machine's error text
    pub fn save_error_details(&self, text: &str) {
        self.handle.save_error_details(text);
    }

    /// Reset the machine's error text
    pub fn clear_error_details(&self) {
        self.handle.clear_error_details();
    }

    /// Accumulated error text
    pub fn error_details(&self) -> String {
        self.handle.error_details()
    }
}

struct LiveEpisode<M: Machine> {
    state: M::State,
    episode: Box<dyn Episode<M>>,
    live: bool,
}

/// Holds the one live episode of a machine
pub(crate) struct Dispatcher<M: Machine> {
    current: RwLock<Option<Mutex<LiveEpisode<M>>>>,
}

impl<M: Machine> Dispatcher<M> {
    pub(crate) fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// Remove the live episode, waiting for in-flight dispatches
    ///
    /// The dispatcher lock is released before the machine is locked for
    /// cleanup; `dispatch` takes them in the order dispatcher then machine.
    pub(crate) fn retire(&self, machine: &Mutex<M>) -> Option<M::State> {
        let slot = self.current.write().take()?;
        let mut entry = slot.into_inner();
        entry.live = false;
        entry.episode.cleanup(&mut machine.lock());
        Some(entry.state)
    }

    /// Install a freshly constructed episode as live
    pub(crate) fn install(&self, state: M::State, episode: Box<dyn Episode<M>>) {
        *self.current.write() = Some(Mutex::new(LiveEpisode {
            state,
            episode,
            live: true,
        }));
    }

    /// Forward one event to the live episode, if there is one and it is live
    pub(crate) fn dispatch<F>(
        &self,
        machine: &Mutex<M>,
        handle: &MachineHandle<M::State>,
        what: &str,
        callback: F,
    ) -> bool
    where
        F: FnOnce(&mut dyn Episode<M>, &mut EpisodeContext<'_, M>) -> anyhow::Result<()>,
    {
        let guard = self.current.read();
        let Some(slot) = guard.as_ref() else {
            return false;
        };
        let mut entry = slot.lock();
        let LiveEpisode {
            state,
            episode,
            live,
        } = &mut *entry;
        if !*live {
            return false;
        }
        let mut data = machine.lock();
        let mut cx = EpisodeContext {
            machine: &mut *data,
            handle,
            live,
        };
        if let Err(e) = callback(episode.as_mut(), &mut cx) {
            tracing::error!("{}: {} failed in {}: {:#}", handle.name(), what, state, e);
            handle.save_error_details(&format!("{} failed in {}: {:#}", what, state, e));
        }
        true
    }
}
