//! Lifecycle Controller
//!
//! Drives one generation per uplink strategy:
//!
//! 1. preconfigure the host side
//! 2. spawn the dataplane and publish its handle
//! 3. attach the uplink inside the dataplane
//! 4. wait for the router's death notification
//! 5. restore the host side
//! 6. retract the handle
//!
//! Failures inside a generation stay inside [`Controller::run_one`]; the
//! retry loop only learns whether an external shutdown was requested.

use crate::error::ManagerError;
use crate::lifecycle::{Generation, SharedState};
use crate::process::Launcher;
use crate::signals::{Death, Delivery, ExitCause, Origin, SignalInjector};
use crate::uplink::{Selection, UplinkDriver, UplinkStrategy};
use crate::vppapi::VppApi;
use crossbeam_channel::Receiver;
use nix::sys::signal::Signal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What happened to one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub generation: Generation,
    pub driver: UplinkDriver,
    /// A dataplane process was started
    pub spawned: bool,
    /// The uplink was attached inside the dataplane
    pub attached: bool,
    /// How the dataplane died, if it was started and reaped
    pub cause: Option<ExitCause>,
    /// An operator or orchestrator asked the supervisor to stop
    pub externally_stopped: bool,
}

pub struct Controller<L: Launcher> {
    shared: Arc<SharedState>,
    injector: SignalInjector,
    deaths: Receiver<Death>,
    launcher: L,
    vpp: Arc<dyn VppApi>,
    ready_timeout: Duration,
}

impl<L: Launcher> Controller<L> {
    pub fn new(
        shared: Arc<SharedState>,
        injector: SignalInjector,
        deaths: Receiver<Death>,
        launcher: L,
        vpp: Arc<dyn VppApi>,
        ready_timeout: Duration,
    ) -> Self {
        Self {
            shared,
            injector,
            deaths,
            launcher,
            vpp,
            ready_timeout,
        }
    }

    /// Run generations until an external stop, or until the candidates run out.
    ///
    /// Returns `Ok` only when the run ended because it was asked to stop.
    pub fn run_all(&mut self, selection: Selection) -> Result<Vec<RunOutcome>, ManagerError> {
        match selection {
            Selection::Explicit(mut strategy) => {
                if self.shutdown_before_start() {
                    return Ok(Vec::new());
                }
                let generation = self.shared.advance_generation();
                let outcome = self.run_one(generation, strategy.as_mut());
                if outcome.externally_stopped {
                    Ok(vec![outcome])
                } else {
                    Err(ManagerError::ExplicitDriverFailed {
                        driver: outcome.driver,
                        generation,
                    })
                }
            }
            Selection::Ordered(strategies) => {
                let attempted = strategies.len();
                let mut outcomes = Vec::with_capacity(attempted);
                for mut strategy in strategies {
                    if self.shutdown_before_start() {
                        return Ok(outcomes);
                    }
                    let generation = self.shared.advance_generation();
                    let outcome = self.run_one(generation, strategy.as_mut());
                    outcomes.push(outcome);
                    if outcome.externally_stopped {
                        info!(generation, "External Kill, not restarting VPP");
                        return Ok(outcomes);
                    }
                    warn!(generation, driver = %outcome.driver, "uplink driver failed, trying the next one");
                }
                Err(ManagerError::DriversExhausted { attempted })
            }
        }
    }

    fn shutdown_before_start(&self) -> bool {
        let requested = self.shared.shutdown_requested();
        if requested {
            info!("shutdown requested, not starting another generation");
        }
        requested
    }

    /// Run one generation with `strategy` to completion.
    pub fn run_one(
        &mut self,
        generation: Generation,
        strategy: &mut dyn UplinkStrategy,
    ) -> RunOutcome {
        let driver = strategy.driver();
        let mut outcome = RunOutcome {
            generation,
            driver,
            spawned: false,
            attached: false,
            cause: None,
            externally_stopped: false,
        };

        info!(generation, %driver, "preconfiguring host");
        if let Err(e) = strategy.preconfigure_linux() {
            error!(generation, %driver, "preconfigure failed: {:#}", e);
            return self.finish(outcome, strategy);
        }

        let process = match self.launcher.launch(generation) {
            Ok(process) => process,
            Err(e) => {
                error!(generation, %driver, "{:#}", e);
                return self.finish(outcome, strategy);
            }
        };
        let pid = process.pid();
        self.shared.publish(generation, process);
        outcome.spawned = true;
        info!(generation, %pid, "dataplane started");

        // Catch an exit that happened before the handle was published
        self.injector.send(Delivery::targeted(
            Signal::SIGCHLD,
            Origin::Controller,
            generation,
        ));

        let attach = self
            .vpp
            .wait_ready(self.ready_timeout)
            .map_err(anyhow::Error::from)
            .and_then(|()| strategy.create_main_vpp_interface(self.vpp.as_ref(), pid));
        match attach {
            Ok(()) => {
                outcome.attached = true;
                info!(generation, %driver, "uplink attached, dataplane running");
            }
            Err(e) => self.terminate(generation, &e),
        }

        outcome.cause = self.await_death(generation);
        self.finish(outcome, strategy)
    }

    /// Kill the current dataplane so the next strategy can be tried.
    fn terminate(&self, generation: Generation, reason: &anyhow::Error) {
        error!(generation, "{:#}", reason);
        info!(generation, "Terminating Vpp (SIGINT)");
        self.shared.mark_internal_kill();
        self.injector.send(Delivery::targeted(
            Signal::SIGINT,
            Origin::Controller,
            generation,
        ));
    }

    fn await_death(&self, generation: Generation) -> Option<ExitCause> {
        loop {
            match self.deaths.recv() {
                Ok(death) if death.generation == generation => return Some(death.cause),
                Ok(death) => {
                    debug!(generation, stale = death.generation, "ignoring death of an older generation")
                }
                Err(_) => {
                    error!(generation, "signal router is gone, cannot observe dataplane exit");
                    return None;
                }
            }
        }
    }

    /// Restore, then retract; shared by every exit path of `run_one`.
    fn finish(&self, mut outcome: RunOutcome, strategy: &mut dyn UplinkStrategy) -> RunOutcome {
        info!(generation = outcome.generation, driver = %outcome.driver, "restoring host");
        strategy.restore_linux();
        outcome.externally_stopped = self.shared.retract();
        info!(
            generation = outcome.generation,
            externally_stopped = outcome.externally_stopped,
            "generation finished"
        );
        outcome
    }
}
