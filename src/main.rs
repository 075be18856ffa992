use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::bounded;
use std::sync::Arc;
use tracing::{error, info};
use vpp_manager::config::{Cli, ManagerConfig};
use vpp_manager::controller::Controller;
use vpp_manager::lifecycle::SharedState;
use vpp_manager::logging;
use vpp_manager::process::{OsReaper, VppLauncher};
use vpp_manager::signals::{self, SignalRouter};
use vpp_manager::uplink::{self, UplinkParams};
use vpp_manager::vppapi::VppCtl;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ManagerConfig::load(&cli)?;
    logging::init(&config.log_level);
    config.log_summary();

    // Signals must be routed before the first child exists
    let shared = Arc::new(SharedState::new());
    let (injector, queue) = signals::channel();
    let _signals = signals::install_os_signals(injector.clone())
        .context("Failed to install signal handlers")?;
    let (death_tx, death_rx) = bounded(1);
    SignalRouter::new(
        Arc::clone(&shared),
        queue,
        injector.clone(),
        OsReaper,
        death_tx,
        config.sigkill_timeout(),
    )
    .spawn()
    .context("Failed to start signal router")?;

    let params = Arc::new(UplinkParams::from(&config));
    let selection = uplink::select(config.native_driver, params)?;

    let vpp = Arc::new(VppCtl::new(
        config.vpp.ctl_binary.clone(),
        config.vpp.cli_socket.clone(),
    ));
    let mut controller = Controller::new(
        shared,
        injector,
        death_rx,
        VppLauncher::new(&config.vpp),
        vpp,
        config.ready_timeout(),
    );

    match controller.run_all(selection) {
        Ok(outcomes) => {
            info!(generations = outcomes.len(), "vpp-manager exiting");
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}
