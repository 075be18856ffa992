//! Shared Lifecycle State
//!
//! Everything the controller, the signal router and the escalation timers
//! need to agree on lives in one [`SupervisorState`] behind one mutex:
//!
//! - the current generation and the per-generation guard flags
//! - the published dataplane process handle
//! - the Termination Intent (`internal_kill`) and the shutdown request
//!
//! A single condition variable is notified on every publication, reap and
//! retraction. The router waits on it for a live process, the escalation
//! timer waits on it for a reap.
//!
//! ## Mutex Poison Handling
//!
//! A panic while holding the lock must not stop signal delivery to the
//! dataplane, so every lock acquisition ignores poisoning.

use crate::process::DataplaneProcess;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// One attempt at running the dataplane with one uplink strategy.
pub type Generation = u64;

/// Idempotence guards for one generation.
///
/// Each flag only ever goes from `false` to `true`. Retiring a generation
/// forces all of them to `true` so that late events become no-ops.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationFlags {
    pub reaped: bool,
    pub timed_out: bool,
    pub escalation_armed: bool,
}

impl GenerationFlags {
    fn retired() -> Self {
        Self {
            reaped: true,
            timed_out: true,
            escalation_armed: true,
        }
    }
}

/// State guarded by the supervisor lock.
pub struct SupervisorState {
    generation: Generation,
    flags: HashMap<Generation, GenerationFlags>,
    process: Option<Arc<dyn DataplaneProcess>>,
    internal_kill: bool,
    shutdown_requested: bool,
}

impl SupervisorState {
    fn new() -> Self {
        let mut flags = HashMap::new();
        // Generation 0 never runs a process
        flags.insert(0, GenerationFlags::retired());
        Self {
            generation: 0,
            flags,
            process: None,
            internal_kill: false,
            shutdown_requested: false,
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Flags of `generation`; unknown generations read as retired.
    pub fn flags(&self, generation: Generation) -> GenerationFlags {
        self.flags
            .get(&generation)
            .copied()
            .unwrap_or_else(GenerationFlags::retired)
    }

    pub(crate) fn flags_mut(&mut self, generation: Generation) -> &mut GenerationFlags {
        self.flags
            .entry(generation)
            .or_insert_with(GenerationFlags::retired)
    }

    /// Published handle, whether or not it has been reaped.
    pub fn process(&self) -> Option<&Arc<dyn DataplaneProcess>> {
        self.process.as_ref()
    }

    /// Published handle of the current generation, if it has not been reaped.
    ///
    /// A reaped pid may already belong to someone else, so nothing is ever
    /// delivered through a handle this returns `None` for.
    pub fn live_process(&self) -> Option<Arc<dyn DataplaneProcess>> {
        if self.flags(self.generation).reaped {
            return None;
        }
        self.process.clone()
    }

    /// True when `generation` is current and its process is not yet reaped.
    pub fn is_live_generation(&self, generation: Generation) -> bool {
        generation == self.generation && !self.flags(generation).reaped
    }

    pub fn internal_kill(&self) -> bool {
        self.internal_kill
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    pub(crate) fn request_shutdown(&mut self) -> bool {
        let first = !self.shutdown_requested;
        self.shutdown_requested = true;
        first
    }
}

/// The lock and condition variable shared by every supervisor thread.
pub struct SharedState {
    state: Mutex<SupervisorState>,
    changed: Condvar,
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SupervisorState::new()),
            changed: Condvar::new(),
        }
    }

    /// Lock the state, ignoring poison.
    pub fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake every thread waiting on the state.
    pub fn notify(&self) {
        self.changed.notify_all();
    }

    /// Block until a live process is published and return the guard.
    pub fn wait_live<'a>(
        &self,
        guard: MutexGuard<'a, SupervisorState>,
    ) -> MutexGuard<'a, SupervisorState> {
        self.changed
            .wait_while(guard, |s| s.live_process().is_none())
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Block until `generation` is reaped or superseded, or `timeout` elapses.
    ///
    /// Returns the guard and `true` if the timeout elapsed with the
    /// generation still live.
    pub fn wait_reaped(
        &self,
        generation: Generation,
        timeout: Duration,
    ) -> (MutexGuard<'_, SupervisorState>, bool) {
        let (guard, result) = self
            .changed
            .wait_timeout_while(self.lock(), timeout, |s| s.is_live_generation(generation))
            .unwrap_or_else(|e| e.into_inner());
        (guard, result.timed_out())
    }

    /// Retire the current generation and start the next one.
    ///
    /// The previous handle must already be retracted; any stragglers for the
    /// old generation see retired flags and do nothing.
    pub fn advance_generation(&self) -> Generation {
        let mut state = self.lock();
        let previous = state.generation;
        state.flags.insert(previous, GenerationFlags::retired());
        state.process = None;
        state.generation = previous + 1;
        let next = state.generation;
        state.flags.insert(next, GenerationFlags::default());
        drop(state);
        self.notify();
        next
    }

    /// Publish the process of `generation` and wake the router.
    pub fn publish(&self, generation: Generation, process: Arc<dyn DataplaneProcess>) {
        let mut state = self.lock();
        debug_assert_eq!(state.generation, generation, "publishing a stale generation");
        debug_assert!(state.process.is_none(), "two dataplane handles published");
        state.process = Some(process);
        drop(state);
        self.notify();
    }

    /// Set the Termination Intent for the current generation.
    pub fn mark_internal_kill(&self) {
        self.lock().internal_kill = true;
    }

    /// Retract the handle and clear the Termination Intent.
    ///
    /// Returns whether an external shutdown was requested, which is the
    /// only thing the retry loop looks at.
    pub fn retract(&self) -> bool {
        let mut state = self.lock();
        state.process = None;
        state.internal_kill = false;
        let external = state.shutdown_requested;
        drop(state);
        self.notify();
        external
    }

    pub fn current_generation(&self) -> Generation {
        self.lock().generation
    }

    pub fn is_published(&self) -> bool {
        self.lock().process.is_some()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.lock().shutdown_requested
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::FakeProcess;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_generations_are_monotonic() {
        let shared = SharedState::new();
        assert_eq!(shared.current_generation(), 0);
        assert_eq!(shared.advance_generation(), 1);
        assert_eq!(shared.advance_generation(), 2);
        assert_eq!(shared.current_generation(), 2);
    }

    #[test]
    fn test_advance_retires_previous_flags() {
        let shared = SharedState::new();
        let first = shared.advance_generation();
        assert_eq!(shared.lock().flags(first), GenerationFlags::default());

        shared.advance_generation();
        let state = shared.lock();
        assert!(state.flags(first).reaped);
        assert!(state.flags(first).timed_out);
    }

    #[test]
    fn test_unknown_generation_reads_retired() {
        let shared = SharedState::new();
        assert!(shared.lock().flags(42).reaped);
    }

    #[test]
    fn test_live_process_hidden_after_reap() {
        let shared = SharedState::new();
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(100));
        assert!(shared.lock().live_process().is_some());

        shared.lock().flags_mut(generation).reaped = true;
        assert!(shared.lock().live_process().is_none());
        assert!(shared.is_published());
    }

    #[test]
    fn test_retract_clears_intent() {
        let shared = SharedState::new();
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(7));
        shared.mark_internal_kill();
        assert!(shared.lock().internal_kill());

        assert!(!shared.retract());
        assert!(!shared.lock().internal_kill());
        assert!(!shared.is_published());
    }

    #[test]
    fn test_retract_reports_shutdown() {
        let shared = SharedState::new();
        assert!(shared.lock().request_shutdown());
        assert!(!shared.lock().request_shutdown());
        assert!(shared.retract());
    }

    #[test]
    fn test_wait_live_wakes_on_publish() {
        let shared = Arc::new(SharedState::new());
        let generation = shared.advance_generation();

        let waiter = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                let guard = shared.wait_live(shared.lock());
                guard.live_process().map(|p| p.pid().as_raw())
            })
        };

        thread::sleep(Duration::from_millis(20));
        shared.publish(generation, FakeProcess::arc(55));
        assert_eq!(waiter.join().unwrap(), Some(55));
    }

    #[test]
    fn test_wait_reaped_returns_early() {
        let shared = Arc::new(SharedState::new());
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(9));

        let reaper = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                shared.lock().flags_mut(generation).reaped = true;
                shared.notify();
            })
        };

        let start = Instant::now();
        let (_guard, timed_out) = shared.wait_reaped(generation, Duration::from_secs(5));
        assert!(!timed_out);
        assert!(start.elapsed() < Duration::from_secs(5));
        reaper.join().unwrap();
    }

    #[test]
    fn test_wait_reaped_times_out() {
        let shared = SharedState::new();
        let generation = shared.advance_generation();
        shared.publish(generation, FakeProcess::arc(9));

        let (_guard, timed_out) = shared.wait_reaped(generation, Duration::from_millis(20));
        assert!(timed_out);
    }
}
