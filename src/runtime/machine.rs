//! Generic state machine driven from one home thread
//!
//! A `StateMachine` owns a current state, a single pending-transition slot,
//! the accumulated error text, and the live episode. Any thread may queue a
//! transition, deliver a message, or append error text; only the home
//! thread (the one that constructed the machine) applies transitions.

use super::episode::{Dispatcher, Episode, Lifecycle, Machine, MachineState};
use super::error::{MachineError, MachineResult};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

// Bound on transitions chained from entry actions within one pump.
const MAX_CHAINED_TRANSITIONS: usize = 32;

#[derive(Debug)]
struct Transition<S> {
    pending: Option<S>,
    applying: bool,
}

/// Thread-safe view of a machine's state, transition slot and error text
#[derive(Debug)]
pub struct MachineHandle<S: MachineState> {
    name: &'static str,
    home: ThreadId,
    state: RwLock<S>,
    transition: Mutex<Transition<S>>,
    errors: Mutex<String>,
    violations: AtomicUsize,
}

impl<S: MachineState> MachineHandle<S> {
    fn new(name: &'static str, initial: S) -> Self {
        Self {
            name,
            home: thread::current().id(),
            state: RwLock::new(initial),
            transition: Mutex::new(Transition {
                pending: None,
                applying: false,
            }),
            errors: Mutex::new(String::new()),
            violations: AtomicUsize::new(0),
        }
    }

    /// Machine name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the calling thread is the home thread
    pub fn is_home_thread(&self) -> bool {
        thread::current().id() == self.home
    }

    /// Current state, even if a transition is pending
    pub fn state(&self) -> S {
        *self.state.read()
    }

    /// Current state, or `None` while a transition is pending or being applied
    pub fn stable_state(&self) -> Option<S> {
        let transition = self.transition.lock();
        if transition.pending.is_some() || transition.applying {
            return None;
        }
        Some(*self.state.read())
    }

    /// Queue a transition to be applied by the next `pump`
    ///
    /// A second request while one is pending is refused: the first request
    /// stays queued, the refusal is logged and appended to the error text.
    pub fn queue_state_change(&self, next: S) -> MachineResult<()> {
        let mut transition = self.transition.lock();
        if let Some(pending) = transition.pending {
            drop(transition);
            self.violations.fetch_add(1, Ordering::SeqCst);
            let error = MachineError::TransitionAlreadyPending {
                machine: self.name.to_string(),
                pending: pending.to_string(),
                requested: next.to_string(),
            };
            tracing::error!("{}", error);
            self.save_error_details(&error.to_string());
            return Err(error);
        }
        tracing::debug!("{}: queued transition to {}", self.name, next);
        transition.pending = Some(next);
        Ok(())
    }

    /// Number of refused transition requests since construction
    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    /// Append to the error text, followed by a newline
    pub fn save_error_details(&self, text: &str) {
        let mut errors = self.errors.lock();
        errors.push_str(text);
        errors.push('\n');
    }

    /// Reset the error text
    pub fn clear_error_details(&self) {
        self.errors.lock().clear();
    }

    /// Accumulated error text
    pub fn error_details(&self) -> String {
        self.errors.lock().clone()
    }

    fn begin_transition(&self) -> Option<S> {
        let mut transition = self.transition.lock();
        let next = transition.pending.take()?;
        transition.applying = true;
        Some(next)
    }

    fn end_transition(&self) {
        self.transition.lock().applying = false;
    }
}

/// A machine, its live episode, and its transition slot
pub struct StateMachine<M: Machine> {
    handle: Arc<MachineHandle<M::State>>,
    machine: Mutex<M>,
    dispatcher: Dispatcher<M>,
}

impl<M: Machine> StateMachine<M> {
    /// Build the machine and enter `initial` on the calling thread
    ///
    /// The calling thread becomes the home thread.
    pub fn new(machine: M, initial: M::State) -> Self {
        let handle = Arc::new(MachineHandle::new(machine.name(), initial));
        let this = Self {
            handle,
            machine: Mutex::new(machine),
            dispatcher: Dispatcher::new(),
        };
        tracing::info!("{}: starting in {}", this.handle.name(), initial);
        this.enter(initial);
        this
    }

    /// Shared handle usable from any thread
    pub fn handle(&self) -> Arc<MachineHandle<M::State>> {
        Arc::clone(&self.handle)
    }

    /// Current state, even if a transition is pending
    pub fn state(&self) -> M::State {
        self.handle.state()
    }

    /// Current state, or `None` while a transition is pending
    pub fn stable_state(&self) -> Option<M::State> {
        self.handle.stable_state()
    }

    /// Queue a transition to be applied by the next `pump`
    pub fn queue_state_change(&self, next: M::State) -> MachineResult<()> {
        self.handle.queue_state_change(next)
    }

    /// Append to the error text
    pub fn save_error_details(&self, text: &str) {
        self.handle.save_error_details(text);
    }

    /// Reset the error text
    pub fn clear_error_details(&self) {
        self.handle.clear_error_details();
    }

    /// Accumulated error text
    pub fn error_details(&self) -> String {
        self.handle.error_details()
    }

    /// Lock the machine data for inspection
    ///
    /// Must not be called from inside an episode callback.
    pub fn machine(&self) -> MutexGuard<'_, M> {
        self.machine.lock()
    }

    /// Apply pending transitions; returns whether any was applied
    ///
    /// Only the home thread may pump. Transitions queued by entry actions
    /// are applied in the same pump.
    pub fn pump(&self) -> bool {
        if !self.handle.is_home_thread() {
            tracing::warn!(
                "{}",
                MachineError::NotHomeThread(self.handle.name().to_string())
            );
            return false;
        }
        let mut applied = false;
        for _ in 0..MAX_CHAINED_TRANSITIONS {
            let Some(next) = self.handle.begin_transition() else {
                break;
            };
            self.apply(next);
            self.handle.end_transition();
            applied = true;
        }
        applied
    }

    /// Pump, then deliver a tick to the live episode
    pub fn tick(&self) {
        self.pump();
        self.dispatcher
            .dispatch(&self.machine, &self.handle, "tick", |episode, cx| {
                episode.on_tick(cx)
            });
    }

    /// Deliver a message to the live episode; callable from any thread
    pub fn deliver(&self, from: &str, message: &M::Message) -> bool {
        self.dispatcher
            .dispatch(&self.machine, &self.handle, "message", |episode, cx| {
                episode.on_message(cx, from, message)
            })
    }

    /// Deliver a lifecycle notification; callable from any thread
    pub fn notify(&self, event: &Lifecycle) -> bool {
        self.dispatcher
            .dispatch(&self.machine, &self.handle, "lifecycle", |episode, cx| {
                episode.on_lifecycle(cx, event)
            })
    }

    fn apply(&self, next: M::State) {
        let current = self.handle.state();
        if current == next {
            tracing::debug!("{}: already in {}", self.handle.name(), next);
            return;
        }
        tracing::info!("{}: {} -> {}", self.handle.name(), current, next);
        {
            let mut machine = self.machine.lock();
            machine.on_pre_state_change(current, next);
        }
        self.enter(next);
    }

    fn enter(&self, next: M::State) {
        self.dispatcher.retire(&self.machine);
        *self.handle.state.write() = next;
        let episode: Box<dyn Episode<M>> = self.machine.lock().episode_for(next);
        self.dispatcher.install(next, episode);
        self.dispatcher
            .dispatch(&self.machine, &self.handle, "entry", |episode, cx| {
                episode.execute(cx)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::episode::EpisodeContext;
    use std::fmt;
    use std::sync::atomic::AtomicBool;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Light {
        Red,
        Green,
        Amber,
    }

    impl fmt::Display for Light {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            fmt::Debug::fmt(self, f)
        }
    }

    impl MachineState for Light {}

    #[derive(Default)]
    struct Signal {
        ticks: Arc<AtomicUsize>,
        entries: Vec<Light>,
        cleanups: Vec<Light>,
        refused: usize,
        fail_entry: bool,
    }

    struct Phase {
        state: Light,
        ticks: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Episode<Signal> for Phase {
        fn execute(&mut self, cx: &mut EpisodeContext<'_, Signal>) -> anyhow::Result<()> {
            cx.machine.entries.push(self.state);
            if self.fail {
                anyhow::bail!("bulb blown");
            }
            Ok(())
        }

        fn on_tick(&mut self, _cx: &mut EpisodeContext<'_, Signal>) -> anyhow::Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_message(
            &mut self,
            cx: &mut EpisodeContext<'_, Signal>,
            _from: &str,
            message: &String,
        ) -> anyhow::Result<()> {
            if message == "next" {
                let queued = cx.complete(match self.state {
                    Light::Red => Light::Green,
                    Light::Green => Light::Amber,
                    Light::Amber => Light::Red,
                });
                if !queued {
                    cx.machine.refused += 1;
                }
            }
            Ok(())
        }

        fn cleanup(&mut self, machine: &mut Signal) {
            machine.cleanups.push(self.state);
        }
    }

    impl Machine for Signal {
        type State = Light;
        type Message = String;

        fn name(&self) -> &'static str {
            "signal"
        }

        fn episode_for(&mut self, state: Light) -> Box<dyn Episode<Self>> {
            Box::new(Phase {
                state,
                ticks: Arc::clone(&self.ticks),
                fail: self.fail_entry && state == Light::Green,
            })
        }
    }

    #[test]
    fn test_initial_state_is_entered() {
        let sm = StateMachine::new(Signal::default(), Light::Red);
        assert_eq!(sm.stable_state(), Some(Light::Red));
        assert_eq!(sm.machine().entries, vec![Light::Red]);
    }

    #[test]
    fn test_second_pending_transition_is_refused() {
        let sm = StateMachine::new(Signal::default(), Light::Red);
        sm.queue_state_change(Light::Green).unwrap();
        let err = sm.queue_state_change(Light::Amber).unwrap_err();
        assert!(matches!(err, MachineError::TransitionAlreadyPending { .. }));
        assert_eq!(sm.handle().violations(), 1);
        assert!(sm.error_details().contains("Amber"));

        assert_eq!(sm.stable_state(), None);
        assert!(sm.pump());
        assert_eq!(sm.stable_state(), Some(Light::Green));
    }

    #[test]
    fn test_transition_to_same_state_is_noop() {
        let sm = StateMachine::new(Signal::default(), Light::Red);
        sm.queue_state_change(Light::Red).unwrap();
        sm.pump();
        assert_eq!(sm.machine().entries, vec![Light::Red]);
        assert!(sm.machine().cleanups.is_empty());
    }

    #[test]
    fn test_completed_episode_gets_no_more_callbacks() {
        let sm = StateMachine::new(Signal::default(), Light::Red);
        assert!(sm.deliver("test", &"next".to_string()));
        // Red completed itself but Green is not yet applied.
        assert!(!sm.deliver("test", &"next".to_string()));
        sm.pump();
        assert_eq!(sm.state(), Light::Green);
        assert_eq!(sm.machine().cleanups, vec![Light::Red]);
    }

    #[test]
    fn test_refused_completion_keeps_earlier_transition() {
        let sm = StateMachine::new(Signal::default(), Light::Red);
        sm.queue_state_change(Light::Amber).unwrap();
        assert!(sm.deliver("test", &"next".to_string()));
        assert_eq!(sm.machine().refused, 1);
        assert_eq!(sm.handle().violations(), 1);

        // Red finished itself even though its own request was refused.
        assert!(!sm.deliver("test", &"next".to_string()));
        sm.pump();
        assert_eq!(sm.state(), Light::Amber);
    }

    #[test]
    fn test_events_from_another_thread_during_transitions() {
        let sm = Arc::new(StateMachine::new(Signal::default(), Light::Red));
        let stop = Arc::new(AtomicBool::new(false));
        let delivered = Arc::new(AtomicUsize::new(0));

        let sender = {
            let sm = Arc::clone(&sm);
            let stop = Arc::clone(&stop);
            let delivered = Arc::clone(&delivered);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    sm.deliver("net", &"hi".to_string());
                    sm.notify(&Lifecycle::HostReady);
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            })
        };
        while delivered.load(Ordering::SeqCst) == 0 {
            thread::yield_now();
        }

        for round in 0..2000 {
            let next = if round % 2 == 0 { Light::Green } else { Light::Red };
            sm.queue_state_change(next).unwrap();
            assert!(sm.pump());
        }
        stop.store(true, Ordering::SeqCst);
        sender.join().unwrap();

        let machine = sm.machine();
        assert_eq!(machine.entries.len(), 2001);
        assert_eq!(machine.cleanups.len(), 2000);
        assert_eq!(machine.cleanups.last(), Some(&Light::Green));
    }

    #[test]
    fn test_entry_failure_is_contained() {
        let signal = Signal {
            fail_entry: true,
            ..Signal::default()
        };
        let sm = StateMachine::new(signal, Light::Red);
        sm.queue_state_change(Light::Green).unwrap();
        sm.tick();
        assert_eq!(sm.stable_state(), Some(Light::Green));
        assert!(sm.error_details().contains("bulb blown"));
        // Still live: the tick after the failed entry reached it.
        assert_eq!(sm.machine().ticks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pump_refused_off_home_thread() {
        let sm = Arc::new(StateMachine::new(Signal::default(), Light::Red));
        sm.queue_state_change(Light::Green).unwrap();
        let remote = Arc::clone(&sm);
        let pumped = thread::spawn(move || remote.pump()).join().unwrap();
        assert!(!pumped);
        assert_eq!(sm.state(), Light::Red);
        assert!(sm.pump());
        assert_eq!(sm.state(), Light::Green);
    }

    #[test]
    fn test_error_details_append() {
        let sm = StateMachine::new(Signal::default(), Light::Red);
        sm.save_error_details("first");
        sm.handle().save_error_details("second");
        assert_eq!(sm.error_details(), "first\nsecond\n");
        sm.clear_error_details();
        assert!(sm.error_details().is_empty());
    }
}
