//! `devctl`: command-line control of motion devices.
//!
//! ```bash
//! devctl config/devices/mask_wheel.toml status
//! devctl config/devices/mask_wheel.toml Open
//! devctl config/devices/camfocus.toml goto 12.5
//! devctl --no-wait config/devices/trombone.toml --axis x nudge -0.25
//! devctl config/devices/beamsplitter.toml save --index 3 --name Halpha
//! ```
//!
//! Ctrl-C during a command stops the device before exiting.

mod cli;
mod commands;
mod devices;
mod logging;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use devctl_core::{DeviceError, PortRegistry, RuntimeSettings};
use devices::Target;
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    devctl_driver_newport::link();
    devctl_driver_thorlabs::link();
    devctl_driver_zaber::link();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = RuntimeSettings::load(cli.settings.as_deref()).context("Failed to load runtime settings")?;
    logging::init(&settings.logging)?;

    let ports = PortRegistry::init_global(settings.arbiter.clone());
    let drivers = devices::driver_registry(ports.clone());
    let target = Target::open(&cli.config, &drivers, &settings)
        .await
        .with_context(|| format!("Failed to open {}", cli.config.display()))?;
    tracing::debug!(device = %target.name(), command = ?cli.command, "Running command");

    let axis = cli.axis.as_deref();
    let outcome = tokio::select! {
        result = commands::execute(&target, axis, &cli.command, !cli.no_wait) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let result = match outcome {
        Some(result) => result,
        None => {
            tracing::warn!(device = %target.name(), "Interrupted, stopping");
            target.stop(axis).await?;
            anyhow::bail!("interrupted; {} stopped", target.name());
        }
    };

    ports.close_all();
    for line in result? {
        println!("{}", line);
    }
    Ok(())
}

fn report(err: &anyhow::Error) {
    match err.downcast_ref::<DeviceError>() {
        Some(device_err) => eprintln!(
            "error: {} {} failed [{}]: {}",
            device_err.device(),
            device_err.operation(),
            device_err.kind(),
            device_err
        ),
        None => eprintln!("error: {:#}", err),
    }
}
