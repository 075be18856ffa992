//! Dataplane process handle, launcher and reaper
//!
//! The controller owns the handle; the router only borrows it (through
//! [`SharedState`](crate::lifecycle::SharedState)) to deliver signals and to
//! match reaped pids.

use crate::config::VppSection;
use crate::error::ManagerError;
use crate::lifecycle::Generation;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};

/// Control capability over one running dataplane process.
pub trait DataplaneProcess: Send + Sync {
    fn pid(&self) -> Pid;

    /// Deliver `signal` to the process.
    fn signal(&self, signal: Signal) -> nix::Result<()>;

    /// Drop OS resources held for the process once it has been reaped.
    fn release(&self);
}

/// Starts one dataplane process per generation.
pub trait Launcher: Send {
    fn launch(&mut self, generation: Generation) -> anyhow::Result<Arc<dyn DataplaneProcess>>;
}

/// Exit status of a reaped child.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: WaitStatus,
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            WaitStatus::Exited(pid, code) => write!(f, "pid {} exited with status {}", pid, code),
            WaitStatus::Signaled(pid, signal, core_dumped) => write!(
                f,
                "pid {} terminated by {} (core dumped: {})",
                pid, signal, core_dumped
            ),
            other => write!(f, "pid {} changed state: {:?}", self.pid, other),
        }
    }
}

/// Non-blocking reaping of the published child.
pub trait Reaper: Send {
    /// Collect `pid` if it has exited. `Ok(None)` means it is still running.
    fn reap(&mut self, pid: Pid) -> nix::Result<Option<ChildExit>>;
}

/// `waitpid(pid, WNOHANG)` against the real process table.
///
/// Only the published pid is waited for, so helper commands run by the
/// uplink strategies keep their exit statuses.
#[derive(Debug, Default)]
pub struct OsReaper;

impl Reaper for OsReaper {
    fn reap(&mut self, pid: Pid) -> nix::Result<Option<ChildExit>> {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG))? {
            WaitStatus::StillAlive => Ok(None),
            status => Ok(status.pid().map(|pid| ChildExit { pid, status })),
        }
    }
}

/// A VPP process spawned by [`VppLauncher`].
pub struct VppProcess {
    pid: Pid,
    child: Mutex<Option<Child>>,
}

impl VppProcess {
    fn new(child: Child) -> Self {
        Self {
            pid: Pid::from_raw(child.id() as i32),
            child: Mutex::new(Some(child)),
        }
    }
}

impl DataplaneProcess for VppProcess {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn signal(&self, signal: Signal) -> nix::Result<()> {
        kill(self.pid, signal)
    }

    fn release(&self) {
        // The router already waited for the pid; dropping the Child only
        // closes our ends of its stdio.
        let mut child = self.child.lock().unwrap_or_else(|e| e.into_inner());
        child.take();
    }
}

/// Spawns `vpp -c <startup config>`.
pub struct VppLauncher {
    binary: PathBuf,
    config_file: PathBuf,
}

impl VppLauncher {
    pub fn new(vpp: &VppSection) -> Self {
        Self {
            binary: vpp.binary.clone(),
            config_file: vpp.config_file.clone(),
        }
    }
}

impl Launcher for VppLauncher {
    fn launch(&mut self, generation: Generation) -> anyhow::Result<Arc<dyn DataplaneProcess>> {
        let child = Command::new(&self.binary)
            .arg("-c")
            .arg(&self.config_file)
            // Own process group: terminal signals reach VPP only through the router
            .process_group(0)
            .spawn()
            .map_err(|source| ManagerError::Spawn {
                binary: self.binary.clone(),
                generation,
                source,
            })?;
        Ok(Arc::new(VppProcess::new(child)))
    }
}

// =============================================================================
// Test Support
// =============================================================================

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Records signals instead of delivering them.
    pub struct FakeProcess {
        pid: Pid,
        pub signals: Mutex<Vec<Signal>>,
        pub released: Mutex<bool>,
    }

    impl FakeProcess {
        pub fn new(pid: i32) -> Self {
            Self {
                pid: Pid::from_raw(pid),
                signals: Mutex::new(Vec::new()),
                released: Mutex::new(false),
            }
        }

        pub fn arc(pid: i32) -> Arc<dyn DataplaneProcess> {
            Arc::new(Self::new(pid))
        }

        pub fn received(&self) -> Vec<Signal> {
            self.signals.lock().unwrap().clone()
        }
    }

    impl DataplaneProcess for FakeProcess {
        fn pid(&self) -> Pid {
            self.pid
        }

        fn signal(&self, signal: Signal) -> nix::Result<()> {
            self.signals.lock().unwrap().push(signal);
            Ok(())
        }

        fn release(&self) {
            *self.released.lock().unwrap() = true;
        }
    }

    /// Hands out queued exits, one per call.
    #[derive(Default)]
    pub struct ScriptedReaper {
        pub exits: Arc<Mutex<Vec<ChildExit>>>,
    }

    impl Reaper for ScriptedReaper {
        fn reap(&mut self, _pid: Pid) -> nix::Result<Option<ChildExit>> {
            let mut exits = self.exits.lock().unwrap();
            if exits.is_empty() {
                Ok(None)
            } else {
                Ok(Some(exits.remove(0)))
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
