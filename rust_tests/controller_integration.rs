//! Controller Integration Tests
//!
//! Runs the real controller and signal router against in-memory fakes:
//! - FakeProcess dies (and raises SIGCHLD) on the signals its behaviour allows
//! - FakeReaper hands the recorded exits back to the router
//! - FakeStrategy records every capability call

use anyhow::bail;
use crossbeam_channel::bounded;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use vpp_manager::controller::{Controller, RunOutcome};
use vpp_manager::error::ManagerError;
use vpp_manager::lifecycle::SharedState;
use vpp_manager::process::{ChildExit, DataplaneProcess, Launcher, Reaper};
use vpp_manager::signals::{self, Delivery, ExitCause, SignalInjector, SignalRouter};
use vpp_manager::uplink::{Selection, UplinkDriver, UplinkStrategy};
use vpp_manager::vppapi::{AfPacketCreate, AfXdpCreate, VppApi, VppApiError};

// =============================================================================
// Fakes
// =============================================================================

#[derive(Clone, Copy, PartialEq)]
enum Behavior {
    /// Exits on SIGINT/SIGQUIT/SIGKILL
    Graceful,
    /// Only SIGKILL works
    Stubborn,
}

/// Exits waiting to be reaped.
#[derive(Default)]
struct ExitTable {
    exits: Mutex<Vec<ChildExit>>,
}

struct FakeProcess {
    pid: Pid,
    behavior: Behavior,
    dead: AtomicBool,
    received: Mutex<Vec<Signal>>,
    exits: Arc<ExitTable>,
    injector: SignalInjector,
}

impl FakeProcess {
    fn die(&self, status: WaitStatus) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        self.exits.exits.lock().unwrap().push(ChildExit {
            pid: self.pid,
            status,
        });
        self.injector.send(Delivery::os(Signal::SIGCHLD));
    }

    /// Exit on its own, as a crash would.
    fn crash(&self) {
        self.die(WaitStatus::Signaled(self.pid, Signal::SIGSEGV, true));
    }

    fn received(&self) -> Vec<Signal> {
        self.received.lock().unwrap().clone()
    }
}

impl DataplaneProcess for FakeProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn signal(&self, signal: Signal) -> nix::Result<()> {
        self.received.lock().unwrap().push(signal);
        let fatal = match signal {
            Signal::SIGKILL => true,
            Signal::SIGINT | Signal::SIGQUIT => self.behavior == Behavior::Graceful,
            _ => false,
        };
        if fatal {
            self.die(WaitStatus::Signaled(self.pid, signal, false));
        }
        Ok(())
    }

    fn release(&self) {}
}

struct FakeReaper {
    exits: Arc<ExitTable>,
}

impl Reaper for FakeReaper {
    fn reap(&mut self, pid: Pid) -> nix::Result<Option<ChildExit>> {
        let mut exits = self.exits.exits.lock().unwrap();
        match exits.iter().position(|e| e.pid == pid) {
            Some(index) => Ok(Some(exits.remove(index))),
            None => Ok(None),
        }
    }
}

type Launched = Arc<Mutex<Vec<Arc<FakeProcess>>>>;

struct FakeLauncher {
    next_pid: AtomicI32,
    behavior: Behavior,
    shared: Arc<SharedState>,
    exits: Arc<ExitTable>,
    injector: SignalInjector,
    launched: Launched,
    overlap: Arc<AtomicBool>,
}

impl Launcher for FakeLauncher {
    fn launch(&mut self, _generation: u64) -> anyhow::Result<Arc<dyn DataplaneProcess>> {
        if self.shared.is_published() {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let process = Arc::new(FakeProcess {
            pid: Pid::from_raw(self.next_pid.fetch_add(1, Ordering::SeqCst)),
            behavior: self.behavior,
            dead: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            exits: Arc::clone(&self.exits),
            injector: self.injector.clone(),
        });
        self.launched.lock().unwrap().push(Arc::clone(&process));
        Ok(process)
    }
}

struct FakeVpp;

impl VppApi for FakeVpp {
    fn wait_ready(&self, _timeout: Duration) -> Result<(), VppApiError> {
        Ok(())
    }

    fn create_af_packet(&self, _request: &AfPacketCreate) -> Result<u32, VppApiError> {
        Ok(1)
    }

    fn create_af_xdp(&self, _request: &AfXdpCreate) -> Result<u32, VppApiError> {
        Ok(1)
    }
}

type CallLog = Arc<Mutex<Vec<String>>>;
type AttachHook = Box<dyn Fn() + Send>;

struct FakeStrategy {
    label: &'static str,
    fail_preconfigure: bool,
    fail_attach: bool,
    on_attach: Option<AttachHook>,
    calls: CallLog,
}

impl FakeStrategy {
    fn new(label: &'static str, calls: &CallLog) -> Self {
        Self {
            label,
            fail_preconfigure: false,
            fail_attach: false,
            on_attach: None,
            calls: Arc::clone(calls),
        }
    }

    fn record(&self, step: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, step));
    }
}

impl UplinkStrategy for FakeStrategy {
    fn driver(&self) -> UplinkDriver {
        UplinkDriver::AfPacket
    }

    fn is_supported(&self, _warn: bool) -> bool {
        true
    }

    fn preconfigure_linux(&mut self) -> anyhow::Result<()> {
        self.record("preconfigure");
        if self.fail_preconfigure {
            bail!("link missing");
        }
        Ok(())
    }

    fn create_main_vpp_interface(&mut self, _vpp: &dyn VppApi, _pid: Pid) -> anyhow::Result<()> {
        self.record("attach");
        if let Some(hook) = &self.on_attach {
            hook();
        }
        if self.fail_attach {
            bail!("protocol error: retval -1");
        }
        Ok(())
    }

    fn restore_linux(&mut self) {
        self.record("restore");
    }
}

// =============================================================================
// Rig
// =============================================================================

struct Rig {
    shared: Arc<SharedState>,
    injector: SignalInjector,
    launched: Launched,
    overlap: Arc<AtomicBool>,
    calls: CallLog,
    controller: Option<Controller<FakeLauncher>>,
}

impl Rig {
    fn new(behavior: Behavior, escalation_timeout: Duration) -> Self {
        let shared = Arc::new(SharedState::new());
        let (injector, queue) = signals::channel();
        let (death_tx, death_rx) = bounded(1);
        let exits = Arc::new(ExitTable::default());

        SignalRouter::new(
            Arc::clone(&shared),
            queue,
            injector.clone(),
            FakeReaper {
                exits: Arc::clone(&exits),
            },
            death_tx,
            escalation_timeout,
        )
        .spawn()
        .unwrap();

        let launched: Launched = Arc::new(Mutex::new(Vec::new()));
        let overlap = Arc::new(AtomicBool::new(false));
        let launcher = FakeLauncher {
            next_pid: AtomicI32::new(1000),
            behavior,
            shared: Arc::clone(&shared),
            exits,
            injector: injector.clone(),
            launched: Arc::clone(&launched),
            overlap: Arc::clone(&overlap),
        };
        let controller = Controller::new(
            Arc::clone(&shared),
            injector.clone(),
            death_rx,
            launcher,
            Arc::new(FakeVpp),
            Duration::from_secs(1),
        );

        Self {
            shared,
            injector,
            launched,
            overlap,
            calls: Arc::new(Mutex::new(Vec::new())),
            controller: Some(controller),
        }
    }

    /// Hook that plays the operator: an OS SIGTERM to the supervisor.
    fn operator_sigterm(&self) -> AttachHook {
        let injector = self.injector.clone();
        Box::new(move || injector.send(Delivery::os(Signal::SIGTERM)))
    }

    /// Run the selection on a thread, failing the test if it hangs.
    fn run(&mut self, selection: Selection) -> Result<Vec<RunOutcome>, ManagerError> {
        let mut controller = self.controller.take().expect("rig runs once");
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = tx.send(controller.run_all(selection));
        });
        rx.recv_timeout(Duration::from_secs(10))
            .expect("supervisor run did not finish")
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn process(&self, index: usize) -> Arc<FakeProcess> {
        Arc::clone(&self.launched.lock().unwrap()[index])
    }

    fn launch_count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_external_stop_halts_retry_loop() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut first = FakeStrategy::new("a", &rig.calls);
    first.on_attach = Some(rig.operator_sigterm());
    let second = FakeStrategy::new("b", &rig.calls);

    let outcomes = rig
        .run(Selection::Ordered(vec![Box::new(first), Box::new(second)]))
        .expect("external stop is a clean exit");

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].attached);
    assert!(outcomes[0].externally_stopped);
    assert_eq!(outcomes[0].cause, Some(ExitCause::ExternalStop));
    assert_eq!(rig.calls(), vec!["a:preconfigure", "a:attach", "a:restore"]);
    assert_eq!(rig.launch_count(), 1);
    // SIGTERM is delivered to the dataplane as SIGINT
    assert_eq!(rig.process(0).received(), vec![Signal::SIGINT]);
}

#[test]
fn test_attach_failure_moves_to_next_strategy() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut first = FakeStrategy::new("a", &rig.calls);
    first.fail_attach = true;
    let mut second = FakeStrategy::new("b", &rig.calls);
    second.on_attach = Some(rig.operator_sigterm());

    let outcomes = rig
        .run(Selection::Ordered(vec![Box::new(first), Box::new(second)]))
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].attached);
    assert!(!outcomes[0].externally_stopped);
    assert_eq!(outcomes[0].cause, Some(ExitCause::ControllerKill));
    assert_eq!(outcomes[1].generation, outcomes[0].generation + 1);
    assert!(outcomes[1].externally_stopped);
    assert_eq!(
        rig.calls(),
        vec![
            "a:preconfigure",
            "a:attach",
            "a:restore",
            "b:preconfigure",
            "b:attach",
            "b:restore"
        ]
    );
    assert_eq!(rig.process(0).received(), vec![Signal::SIGINT]);
    assert!(!rig.overlap.load(Ordering::SeqCst));
    // Termination Intent is cleared once the generation is retracted
    assert!(!rig.shared.lock().internal_kill());
}

#[test]
fn test_stubborn_dataplane_is_killed_once() {
    let mut rig = Rig::new(Behavior::Stubborn, Duration::from_millis(50));
    let mut strategy = FakeStrategy::new("a", &rig.calls);
    let injector = rig.injector.clone();
    // Two graceful requests must still produce a single SIGKILL
    strategy.on_attach = Some(Box::new(move || {
        injector.send(Delivery::os(Signal::SIGTERM));
        injector.send(Delivery::os(Signal::SIGQUIT));
    }));

    let outcomes = rig.run(Selection::Explicit(Box::new(strategy))).unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].cause, Some(ExitCause::ExternalStop));
    let received = rig.process(0).received();
    assert_eq!(
        received,
        vec![Signal::SIGINT, Signal::SIGQUIT, Signal::SIGKILL]
    );
    assert_eq!(rig.calls(), vec!["a:preconfigure", "a:attach", "a:restore"]);
}

#[test]
fn test_no_escalation_after_prompt_exit() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_millis(100));
    let mut strategy = FakeStrategy::new("a", &rig.calls);
    strategy.on_attach = Some(rig.operator_sigterm());

    let outcomes = rig.run(Selection::Explicit(Box::new(strategy))).unwrap();
    let generation = outcomes[0].generation;

    // Let the escalation deadline pass
    thread::sleep(Duration::from_millis(250));
    assert!(!rig.shared.lock().flags(generation).timed_out);
    assert!(!rig.process(0).received().contains(&Signal::SIGKILL));
}

#[test]
fn test_explicit_preconfigure_failure_is_fatal() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut strategy = FakeStrategy::new("a", &rig.calls);
    strategy.fail_preconfigure = true;

    let err = rig
        .run(Selection::Explicit(Box::new(strategy)))
        .unwrap_err();

    assert!(matches!(err, ManagerError::ExplicitDriverFailed { .. }));
    assert_eq!(rig.launch_count(), 0);
    assert_eq!(rig.calls(), vec!["a:preconfigure", "a:restore"]);
}

#[test]
fn test_explicit_attach_failure_is_not_retried() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut strategy = FakeStrategy::new("a", &rig.calls);
    strategy.fail_attach = true;

    let err = rig
        .run(Selection::Explicit(Box::new(strategy)))
        .unwrap_err();

    assert!(matches!(err, ManagerError::ExplicitDriverFailed { .. }));
    assert_eq!(rig.launch_count(), 1);
    assert_eq!(rig.calls(), vec!["a:preconfigure", "a:attach", "a:restore"]);
}

#[test]
fn test_crash_is_retried_with_next_strategy() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut first = FakeStrategy::new("a", &rig.calls);
    let launched = Arc::clone(&rig.launched);
    first.on_attach = Some(Box::new(move || {
        let process = Arc::clone(launched.lock().unwrap().last().unwrap());
        process.crash();
    }));
    let mut second = FakeStrategy::new("b", &rig.calls);
    second.on_attach = Some(rig.operator_sigterm());

    let outcomes = rig
        .run(Selection::Ordered(vec![Box::new(first), Box::new(second)]))
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes[0].attached);
    assert_eq!(outcomes[0].cause, Some(ExitCause::Unexpected));
    assert!(!outcomes[0].externally_stopped);
    assert!(outcomes[1].externally_stopped);
    // Nobody signalled the crashed process
    assert!(rig.process(0).received().is_empty());
}

#[test]
fn test_exhausted_strategies_are_fatal() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut first = FakeStrategy::new("a", &rig.calls);
    first.fail_preconfigure = true;
    let mut second = FakeStrategy::new("b", &rig.calls);
    second.fail_attach = true;

    let err = rig
        .run(Selection::Ordered(vec![Box::new(first), Box::new(second)]))
        .unwrap_err();

    assert!(matches!(err, ManagerError::DriversExhausted { attempted: 2 }));
    assert_eq!(rig.launch_count(), 1);
    // Restore runs once for every generation that reached preconfigure
    let restores = rig
        .calls()
        .iter()
        .filter(|c| c.ends_with(":restore"))
        .count();
    assert_eq!(restores, 2);
    assert!(!rig.overlap.load(Ordering::SeqCst));
}

#[test]
fn test_external_stop_during_retry_kill_is_honoured() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut first = FakeStrategy::new("a", &rig.calls);
    first.on_attach = Some(rig.operator_sigterm());
    first.fail_attach = true;
    let second = FakeStrategy::new("b", &rig.calls);

    let outcomes = rig
        .run(Selection::Ordered(vec![Box::new(first), Box::new(second)]))
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].externally_stopped);
    assert!(!rig.calls().iter().any(|c| c.starts_with("b:")));
}

#[test]
fn test_generations_never_overlap() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    let mut strategies: Vec<Box<dyn UplinkStrategy>> = Vec::new();
    for label in ["a", "b", "c"] {
        let mut strategy = FakeStrategy::new(label, &rig.calls);
        strategy.fail_attach = true;
        strategies.push(Box::new(strategy));
    }

    let err = rig.run(Selection::Ordered(strategies)).unwrap_err();

    assert!(matches!(err, ManagerError::DriversExhausted { attempted: 3 }));
    assert_eq!(rig.launch_count(), 3);
    assert!(!rig.overlap.load(Ordering::SeqCst));
    assert!(!rig.shared.is_published());
    assert_eq!(rig.shared.current_generation(), 3);
}

#[test]
fn test_stop_before_start_spawns_nothing() {
    let mut rig = Rig::new(Behavior::Graceful, Duration::from_secs(30));
    rig.injector.send(Delivery::os(Signal::SIGTERM));
    for _ in 0..500 {
        if rig.shared.shutdown_requested() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(rig.shared.shutdown_requested());
    let strategy = FakeStrategy::new("a", &rig.calls);

    let outcomes = rig.run(Selection::Explicit(Box::new(strategy))).unwrap();

    assert!(outcomes.is_empty());
    assert_eq!(rig.launch_count(), 0);
    assert!(rig.calls().is_empty());
    assert_eq!(rig.shared.current_generation(), 0);
}
