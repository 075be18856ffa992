//! Signal Router
//!
//! Every signal the supervisor cares about funnels into one queue and is
//! handled by one dedicated thread:
//!
//! - OS signals, pumped in from `signal-hook` by [`install_os_signals`]
//! - signals injected by the controller (retry kills, reap checks) and by
//!   the escalation timer
//!
//! Injected deliveries carry the generation they were meant for and are
//! dropped once that generation is reaped or superseded, so a kill aimed at
//! one dataplane can never land on the next one.
//!
//! ## Routing
//!
//! - SIGCHLD: reap the published pid; the first exit of a generation emits
//!   the death notification. Dropped while nothing is published.
//! - SIGPIPE: ignored.
//! - SIGTERM: rewritten to SIGINT (VPP is slow to honour SIGTERM).
//! - SIGINT / SIGQUIT / SIGSTOP: forwarded, escalation timer armed.
//! - anything else: forwarded.
//!
//! Non-SIGCHLD signals wait until a live process is published.

use crate::escalation;
use crate::lifecycle::{Generation, SharedState};
use crate::process::{ChildExit, Reaper};
use crossbeam_channel::{unbounded, Receiver, Sender, TrySendError};
use nix::sys::signal::Signal;
use signal_hook::consts::FORBIDDEN;
use signal_hook::iterator::{Handle, Signals};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Catchable signals left at their default disposition.
///
/// SIGURG is runtime noise; the others are synchronous faults of the
/// supervisor itself and must not be turned into queued deliveries.
const UNROUTED: [Signal; 4] = [
    Signal::SIGURG,
    Signal::SIGBUS,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

/// Every OS signal the supervisor consumes and routes.
pub fn routed_signals() -> Vec<i32> {
    Signal::iterator()
        .filter(|signal| !UNROUTED.contains(signal))
        .map(|signal| signal as i32)
        .filter(|raw| !FORBIDDEN.contains(raw))
        .collect()
}

/// Who produced a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Delivered by the kernel to the supervisor
    Os,
    /// Injected by the lifecycle controller
    Controller,
    /// Injected by an escalation timer
    Escalation,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Origin::Os => "os",
            Origin::Controller => "controller",
            Origin::Escalation => "escalation",
        };
        f.write_str(name)
    }
}

/// One entry of the router queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub signal: Signal,
    pub origin: Origin,
    /// Generation the delivery is bound to; `None` for OS signals.
    pub target: Option<Generation>,
}

impl Delivery {
    pub fn os(signal: Signal) -> Self {
        Self {
            signal,
            origin: Origin::Os,
            target: None,
        }
    }

    pub fn targeted(signal: Signal, origin: Origin, generation: Generation) -> Self {
        Self {
            signal,
            origin,
            target: Some(generation),
        }
    }
}

/// Cloneable sending side of the router queue.
#[derive(Clone)]
pub struct SignalInjector {
    tx: Sender<Delivery>,
}

impl SignalInjector {
    pub fn send(&self, delivery: Delivery) {
        if self.tx.send(delivery).is_err() {
            warn!(signal = %delivery.signal, "signal router is gone, delivery dropped");
        }
    }
}

/// Create the router queue.
pub fn channel() -> (SignalInjector, Receiver<Delivery>) {
    let (tx, rx) = unbounded();
    (SignalInjector { tx }, rx)
}

/// Register [`routed_signals`] and pump them into the router queue.
///
/// The pump thread is a daemon; closing the returned handle stops it.
pub fn install_os_signals(injector: SignalInjector) -> io::Result<Handle> {
    let mut signals = Signals::new(routed_signals())?;
    let handle = signals.handle();

    thread::Builder::new()
        .name("signal-pump".into())
        .spawn(move || {
            for raw in signals.forever() {
                match Signal::try_from(raw) {
                    Ok(signal) => injector.send(Delivery::os(signal)),
                    Err(e) => warn!(raw, "unrecognised signal number: {}", e),
                }
            }
        })?;

    Ok(handle)
}

/// Why a generation's process died, as known when it was reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCause {
    /// The controller was terminating it to retry
    ControllerKill,
    /// An operator or orchestrator asked the supervisor to stop
    ExternalStop,
    /// Nobody asked: crash or self-exit
    Unexpected,
}

/// Single-slot death notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Death {
    pub generation: Generation,
    pub exit: ChildExit,
    pub cause: ExitCause,
}

/// Termination-class signals that arm the escalation timer.
fn escalates(signal: Signal) -> bool {
    matches!(signal, Signal::SIGINT | Signal::SIGQUIT | Signal::SIGSTOP)
}

/// Signals an operator uses to ask the supervisor to stop.
fn requests_shutdown(signal: Signal) -> bool {
    matches!(signal, Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT)
}

/// The router thread's state.
pub struct SignalRouter<R: Reaper> {
    shared: Arc<SharedState>,
    queue: Receiver<Delivery>,
    injector: SignalInjector,
    reaper: R,
    deaths: Sender<Death>,
    escalation_timeout: Duration,
}

impl<R: Reaper + 'static> SignalRouter<R> {
    pub fn new(
        shared: Arc<SharedState>,
        queue: Receiver<Delivery>,
        injector: SignalInjector,
        reaper: R,
        deaths: Sender<Death>,
        escalation_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            queue,
            injector,
            reaper,
            deaths,
            escalation_timeout,
        }
    }

    /// Run the router on its own thread until the queue closes.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("signal-router".into())
            .spawn(move || self.run())
    }

    pub fn run(mut self) {
        while let Ok(delivery) = self.queue.recv() {
            self.handle(delivery);
        }
        debug!("signal queue closed, router exiting");
    }

    /// Route one delivery.
    pub fn handle(&mut self, delivery: Delivery) {
        let Delivery {
            signal,
            origin,
            target,
        } = delivery;

        if signal == Signal::SIGPIPE {
            return;
        }

        let mut state = self.shared.lock();

        if let Some(generation) = target {
            if !state.is_live_generation(generation) {
                debug!(generation, %signal, %origin, "dropping delivery for finished generation");
                return;
            }
        }

        if signal == Signal::SIGCHLD && state.live_process().is_none() {
            // Exit of an earlier generation or of a helper command
            debug!(%origin, "ignoring SIGCHLD, no live dataplane");
            return;
        }

        if origin == Origin::Os && requests_shutdown(signal) && state.request_shutdown() {
            info!(%signal, "shutdown requested, no further uplink drivers will be tried");
        }

        state = self.shared.wait_live(state);
        if let Some(generation) = target {
            if !state.is_live_generation(generation) {
                debug!(generation, %signal, %origin, "dropping delivery for finished generation");
                return;
            }
        }

        let generation = state.generation();
        let process = match state.live_process() {
            Some(process) => process,
            None => return,
        };
        info!(generation, %signal, %origin, "received signal");

        if signal == Signal::SIGCHLD {
            drop(state);
            self.reap(generation, process.pid());
            return;
        }

        let signal = if signal == Signal::SIGTERM {
            Signal::SIGINT
        } else {
            signal
        };

        let arm = escalates(signal) && origin != Origin::Escalation && {
            let flags = state.flags_mut(generation);
            let first = !flags.escalation_armed;
            flags.escalation_armed = true;
            first
        };
        drop(state);

        // The router is the only reaper, so the pid stays ours until it reaps it.
        match process.signal(signal) {
            Ok(()) => info!(generation, pid = %process.pid(), %signal, "signaled dataplane"),
            Err(e) => warn!(generation, pid = %process.pid(), %signal, "failed to signal dataplane: {}", e),
        }

        if arm {
            if let Err(e) = escalation::arm(
                Arc::clone(&self.shared),
                self.injector.clone(),
                generation,
                self.escalation_timeout,
            ) {
                error!(generation, "failed to start escalation timer: {}", e);
            }
        }
    }

    fn reap(&mut self, generation: Generation, pid: nix::unistd::Pid) {
        let exit = match self.reaper.reap(pid) {
            Ok(Some(exit)) => exit,
            Ok(None) => return,
            Err(e) => {
                error!(generation, %pid, "wait error: {}", e);
                return;
            }
        };

        let mut state = self.shared.lock();
        let process = match state.process() {
            Some(process) if process.pid() == exit.pid && state.generation() == generation => {
                Arc::clone(process)
            }
            _ => {
                info!(generation, pid = %exit.pid, "ignoring SIGCHLD for unrelated pid");
                return;
            }
        };

        let flags = state.flags_mut(generation);
        if flags.reaped {
            warn!(generation, "this dataplane was already reaped");
            return;
        }
        flags.reaped = true;

        let cause = if state.internal_kill() {
            ExitCause::ControllerKill
        } else if state.shutdown_requested() {
            ExitCause::ExternalStop
        } else {
            ExitCause::Unexpected
        };
        drop(state);
        self.shared.notify();

        process.release();
        info!(generation, ?cause, "dataplane exited: {}", exit);

        let death = Death {
            generation,
            exit,
            cause,
        };
        match self.deaths.try_send(death) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                error!(generation, "death notification slot already full")
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!(generation, "controller gone, death notification dropped")
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{FakeProcess, ScriptedReaper};
    use crate::process::DataplaneProcess;
    use crossbeam_channel::bounded;
    use nix::sys::wait::WaitStatus;
    use nix::unistd::Pid;
    use std::sync::Mutex;

    struct Harness {
        shared: Arc<SharedState>,
        router: SignalRouter<ScriptedReaper>,
        injector: SignalInjector,
        exits: Arc<Mutex<Vec<ChildExit>>>,
        deaths: Receiver<Death>,
        _queue: Receiver<Delivery>,
    }

    fn harness(timeout: Duration) -> Harness {
        let shared = Arc::new(SharedState::new());
        let (injector, queue) = channel();
        let (death_tx, deaths) = bounded(1);
        let reaper = ScriptedReaper::default();
        let exits = Arc::clone(&reaper.exits);
        let router = SignalRouter::new(
            Arc::clone(&shared),
            queue.clone(),
            injector.clone(),
            reaper,
            death_tx,
            timeout,
        );
        Harness {
            shared,
            router,
            injector,
            exits,
            deaths,
            _queue: queue,
        }
    }

    fn publish(h: &Harness, pid: i32) -> (Generation, Arc<FakeProcess>) {
        let generation = h.shared.advance_generation();
        let process = Arc::new(FakeProcess::new(pid));
        h.shared
            .publish(generation, Arc::clone(&process) as Arc<dyn DataplaneProcess>);
        (generation, process)
    }

    fn exit_of(pid: i32) -> ChildExit {
        let pid = Pid::from_raw(pid);
        ChildExit {
            pid,
            status: WaitStatus::Exited(pid, 0),
        }
    }

    #[test]
    fn test_sigchld_before_publication_is_dropped() {
        let mut h = harness(Duration::from_secs(60));
        h.exits.lock().unwrap().push(exit_of(10));
        h.router.handle(Delivery::os(Signal::SIGCHLD));
        assert!(h.deaths.try_recv().is_err());
        // The reaper was never consulted
        assert_eq!(h.exits.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_matching_sigchld_emits_death() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);
        h.exits.lock().unwrap().push(exit_of(10));

        h.router.handle(Delivery::os(Signal::SIGCHLD));

        let death = h.deaths.try_recv().expect("death notification");
        assert_eq!(death.generation, generation);
        assert_eq!(death.cause, ExitCause::Unexpected);
        assert!(h.shared.lock().flags(generation).reaped);
        assert!(*process.released.lock().unwrap());
    }

    #[test]
    fn test_mismatched_pid_never_notifies() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, _process) = publish(&h, 10);
        h.exits.lock().unwrap().push(exit_of(11));

        h.router.handle(Delivery::os(Signal::SIGCHLD));

        assert!(h.deaths.try_recv().is_err());
        assert!(!h.shared.lock().flags(generation).reaped);
    }

    #[test]
    fn test_duplicate_sigchld_is_noop() {
        let mut h = harness(Duration::from_secs(60));
        publish(&h, 10);
        h.exits.lock().unwrap().push(exit_of(10));
        h.exits.lock().unwrap().push(exit_of(10));

        h.router.handle(Delivery::os(Signal::SIGCHLD));
        h.router.handle(Delivery::os(Signal::SIGCHLD));

        assert!(h.deaths.try_recv().is_ok());
        assert!(h.deaths.try_recv().is_err());
    }

    #[test]
    fn test_sigterm_forwarded_as_sigint() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);

        h.router.handle(Delivery::os(Signal::SIGTERM));

        assert_eq!(process.received(), vec![Signal::SIGINT]);
        let state = h.shared.lock();
        assert!(state.shutdown_requested());
        assert!(state.flags(generation).escalation_armed);
    }

    #[test]
    fn test_sigpipe_ignored() {
        let mut h = harness(Duration::from_secs(60));
        let (_, process) = publish(&h, 10);
        h.router.handle(Delivery::os(Signal::SIGPIPE));
        assert!(process.received().is_empty());
    }

    #[test]
    fn test_other_signals_forwarded_without_escalation() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);

        h.router.handle(Delivery::os(Signal::SIGHUP));

        assert_eq!(process.received(), vec![Signal::SIGHUP]);
        let state = h.shared.lock();
        assert!(!state.flags(generation).escalation_armed);
        assert!(!state.shutdown_requested());
    }

    #[test]
    fn test_controller_kill_is_not_a_shutdown() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);
        h.shared.mark_internal_kill();

        h.router.handle(Delivery::targeted(
            Signal::SIGINT,
            Origin::Controller,
            generation,
        ));
        h.exits.lock().unwrap().push(exit_of(10));
        h.router.handle(Delivery::os(Signal::SIGCHLD));

        assert_eq!(process.received(), vec![Signal::SIGINT]);
        assert!(!h.shared.shutdown_requested());
        let death = h.deaths.try_recv().unwrap();
        assert_eq!(death.cause, ExitCause::ControllerKill);
    }

    #[test]
    fn test_stale_targeted_delivery_dropped() {
        let mut h = harness(Duration::from_secs(60));
        let (old, _) = publish(&h, 10);
        h.shared.retract();
        let (_, current) = publish(&h, 20);

        h.router
            .handle(Delivery::targeted(Signal::SIGKILL, Origin::Escalation, old));

        assert!(current.received().is_empty());
    }

    #[test]
    fn test_reaped_generation_gets_no_signals() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);
        h.exits.lock().unwrap().push(exit_of(10));
        h.router.handle(Delivery::os(Signal::SIGCHLD));

        h.router.handle(Delivery::targeted(
            Signal::SIGINT,
            Origin::Controller,
            generation,
        ));

        assert!(process.received().is_empty());
    }

    #[test]
    fn test_every_catchable_signal_is_routed() {
        let routed = routed_signals();
        for signal in [
            Signal::SIGCHLD,
            Signal::SIGTERM,
            Signal::SIGHUP,
            Signal::SIGWINCH,
            Signal::SIGALRM,
            Signal::SIGPWR,
            Signal::SIGTTIN,
            Signal::SIGTTOU,
            Signal::SIGXCPU,
        ] {
            assert!(routed.contains(&(signal as i32)), "{} not routed", signal);
        }
        for signal in [
            Signal::SIGKILL,
            Signal::SIGSTOP,
            Signal::SIGSEGV,
            Signal::SIGURG,
        ] {
            assert!(!routed.contains(&(signal as i32)), "{} routed", signal);
        }
    }

    #[test]
    fn test_uncommon_signals_are_forwarded() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);

        h.router.handle(Delivery::os(Signal::SIGWINCH));
        h.router.handle(Delivery::os(Signal::SIGALRM));

        assert_eq!(process.received(), vec![Signal::SIGWINCH, Signal::SIGALRM]);
        let state = h.shared.lock();
        assert!(!state.flags(generation).escalation_armed);
        assert!(!state.shutdown_requested());
    }

    #[test]
    fn test_signal_held_until_publication() {
        let Harness {
            shared,
            router,
            injector,
            _queue,
            ..
        } = harness(Duration::from_secs(60));
        router.spawn().unwrap();

        injector.send(Delivery::os(Signal::SIGHUP));
        // Give the router time to pick it up while nothing is published
        thread::sleep(Duration::from_millis(100));

        let generation = shared.advance_generation();
        let process = Arc::new(FakeProcess::new(77));
        shared.publish(generation, Arc::clone(&process) as Arc<dyn DataplaneProcess>);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while process.received().is_empty() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(process.received(), vec![Signal::SIGHUP]);
    }

    #[test]
    fn test_escalation_armed_once() {
        let mut h = harness(Duration::from_secs(60));
        let (generation, process) = publish(&h, 10);

        h.router.handle(Delivery::os(Signal::SIGINT));
        h.router.handle(Delivery::os(Signal::SIGQUIT));

        assert_eq!(process.received(), vec![Signal::SIGINT, Signal::SIGQUIT]);
        assert!(h.shared.lock().flags(generation).escalation_armed);
    }
}
