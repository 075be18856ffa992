//! Process Integration Tests
//!
//! Real children, real signals: `/bin/sh -c <script>` stands in for VPP
//! (the launcher runs `<binary> -c <config>`), and the test process raises
//! SIGTERM on itself to play the operator.
//!
//! Signal handlers are process-wide, so every test holds `SERIAL`.

use crossbeam_channel::bounded;
use nix::sys::signal::{raise, Signal};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use vpp_manager::config::VppSection;
use vpp_manager::controller::{Controller, RunOutcome};
use vpp_manager::error::ManagerError;
use vpp_manager::lifecycle::SharedState;
use vpp_manager::process::{OsReaper, Reaper, VppLauncher};
use vpp_manager::signals::{self, ExitCause, SignalRouter};
use vpp_manager::uplink::{Selection, UplinkDriver, UplinkStrategy};
use vpp_manager::vppapi::{AfPacketCreate, AfXdpCreate, VppApi, VppApiError};

static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

struct ReadyVpp;

impl VppApi for ReadyVpp {
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

/// Leaves the host alone; optionally signals the supervisor once attached.
struct HostlessStrategy {
    sigterm_on_attach: bool,
}

impl UplinkStrategy for HostlessStrategy {
    fn driver(&self) -> UplinkDriver {
        UplinkDriver::AfPacket
    }

    fn is_supported(&self, _warn: bool) -> bool {
        true
    }

    fn preconfigure_linux(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn create_main_vpp_interface(&mut self, _vpp: &dyn VppApi, _pid: Pid) -> anyhow::Result<()> {
        if self.sigterm_on_attach {
            raise(Signal::SIGTERM)?;
        }
        Ok(())
    }

    fn restore_linux(&mut self) {}
}

fn shell_launcher(script: &str) -> VppLauncher {
    VppLauncher::new(&VppSection {
        binary: PathBuf::from("/bin/sh"),
        config_file: PathBuf::from(script),
        ..VppSection::default()
    })
}

struct Supervisor {
    shared: Arc<SharedState>,
    controller: Controller<VppLauncher>,
    signals: signal_hook::iterator::Handle,
}

fn supervisor(script: &str, escalation_timeout: Duration) -> Supervisor {
    let shared = Arc::new(SharedState::new());
    let (injector, queue) = signals::channel();
    let signals = signals::install_os_signals(injector.clone()).unwrap();
    let (death_tx, death_rx) = bounded(1);
    SignalRouter::new(
        Arc::clone(&shared),
        queue,
        injector.clone(),
        OsReaper,
        death_tx,
        escalation_timeout,
    )
    .spawn()
    .unwrap();

    let controller = Controller::new(
        Arc::clone(&shared),
        injector,
        death_rx,
        shell_launcher(script),
        Arc::new(ReadyVpp),
        Duration::from_secs(1),
    );
    Supervisor {
        shared,
        controller,
        signals,
    }
}

fn run_bounded(
    mut controller: Controller<VppLauncher>,
    selection: Selection,
) -> Result<Vec<RunOutcome>, ManagerError> {
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let _ = tx.send(controller.run_all(selection));
    });
    rx.recv_timeout(Duration::from_secs(20))
        .expect("supervisor run did not finish")
}

#[test]
fn test_operator_sigterm_stops_dataplane() {
    let _guard = serial();
    let Supervisor {
        shared,
        controller,
        signals,
    } = supervisor("exec sleep 30", Duration::from_secs(10));

    let started = Instant::now();
    let outcomes = run_bounded(
        controller,
        Selection::Explicit(Box::new(HostlessStrategy {
            sigterm_on_attach: true,
        })),
    )
    .unwrap();
    signals.close();

    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].externally_stopped);
    assert_eq!(outcomes[0].cause, Some(ExitCause::ExternalStop));
    // SIGINT worked; the SIGKILL deadline was never reached
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!shared.lock().flags(outcomes[0].generation).timed_out);
    assert!(!shared.is_published());
}

#[test]
fn test_sigint_ignoring_dataplane_is_killed() {
    let _guard = serial();
    let Supervisor {
        shared,
        controller,
        signals,
    } = supervisor("trap '' INT QUIT TERM; exec sleep 30", Duration::from_millis(300));

    let started = Instant::now();
    let outcomes = run_bounded(
        controller,
        Selection::Explicit(Box::new(HostlessStrategy {
            sigterm_on_attach: true,
        })),
    )
    .unwrap();
    signals.close();

    assert_eq!(outcomes[0].cause, Some(ExitCause::ExternalStop));
    assert!(shared.lock().flags(outcomes[0].generation).timed_out);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_early_exit_is_observed() {
    let _guard = serial();
    let Supervisor {
        shared,
        mut controller,
        signals,
    } = supervisor("exit 3", Duration::from_secs(10));

    // The shell may be gone before its handle is published
    let generation = shared.advance_generation();
    let (tx, rx) = bounded(1);
    thread::spawn(move || {
        let mut strategy = HostlessStrategy {
            sigterm_on_attach: false,
        };
        let _ = tx.send(controller.run_one(generation, &mut strategy));
    });
    let outcome = rx
        .recv_timeout(Duration::from_secs(20))
        .expect("early exit was never observed");
    signals.close();

    assert!(outcome.spawned);
    assert_eq!(outcome.cause, Some(ExitCause::Unexpected));
    assert!(!outcome.externally_stopped);
    assert!(shared.lock().flags(generation).reaped);
}

#[test]
fn test_missing_binary_ends_explicit_run() {
    let _guard = serial();
    let shared = Arc::new(SharedState::new());
    let (injector, _queue) = signals::channel();
    let (_death_tx, death_rx) = bounded(1);
    let launcher = VppLauncher::new(&VppSection {
        binary: PathBuf::from("/nonexistent/vpp"),
        ..VppSection::default()
    });
    let controller = Controller::new(
        Arc::clone(&shared),
        injector,
        death_rx,
        launcher,
        Arc::new(ReadyVpp),
        Duration::from_secs(1),
    );

    let err = run_bounded(
        controller,
        Selection::Explicit(Box::new(HostlessStrategy {
            sigterm_on_attach: false,
        })),
    )
    .unwrap_err();

    assert!(matches!(err, ManagerError::ExplicitDriverFailed { generation: 1, .. }));
    assert!(!shared.is_published());
}

#[test]
fn test_os_reaper_collects_exit_status() {
    let _guard = serial();
    let child = Command::new("/bin/sh").args(["-c", "exit 7"]).spawn().unwrap();
    let pid = Pid::from_raw(child.id() as i32);
    let mut reaper = OsReaper;

    let deadline = Instant::now() + Duration::from_secs(5);
    let exit = loop {
        if let Some(exit) = reaper.reap(pid).unwrap() {
            break exit;
        }
        assert!(Instant::now() < deadline, "child never exited");
        thread::sleep(Duration::from_millis(20));
    };

    assert_eq!(exit.pid, pid);
    assert_eq!(exit.status, WaitStatus::Exited(pid, 7));
    // Already collected: nothing left to reap
    assert!(reaper.reap(pid).is_err());
}
