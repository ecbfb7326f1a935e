//! Command execution. Every command returns the lines to print.

use crate::cli::Command;
use crate::devices::Target;
use anyhow::{anyhow, Result};
use devctl_core::{CompositeDevice, ConfigurationEntry, JointValue, MotionDevice};

fn require_axis<'a>(axis: Option<&'a str>, command: &str) -> Result<&'a str> {
    axis.ok_or_else(|| anyhow!("'{}' on a composite device needs --axis", command))
}

fn with_unit(value: f64, unit: Option<String>) -> String {
    match unit {
        Some(unit) => format!("{} {}", value, unit),
        None => value.to_string(),
    }
}

fn scalar_line(entry: &ConfigurationEntry<f64>, unit: Option<&str>) -> String {
    match unit {
        Some(unit) => format!("{}: {} {{{} {}}}", entry.idx, entry.name, entry.value, unit),
        None => format!("{}: {} {{{}}}", entry.idx, entry.name, entry.value),
    }
}

fn joint_line(entry: &ConfigurationEntry<JointValue>) -> String {
    let values: Vec<String> = entry
        .value
        .iter()
        .map(|(axis, value)| format!("{}={}", axis, value))
        .collect();
    format!("{}: {} {{{}}}", entry.idx, entry.name, values.join(", "))
}

/// Run `command` against `target`.
pub async fn execute(target: &Target, axis: Option<&str>, command: &Command, wait: bool) -> Result<Vec<String>> {
    match (target, axis) {
        (Target::Single(device), None) => single(device, command, wait).await,
        (Target::Composite(composite), None) => composite_wide(composite, command, wait).await,
        (_, Some(axis)) => {
            let device = target.axis(axis)?;
            let mut lines = single(device, command, wait).await?;
            // Axis presets live in the composite's file.
            if matches!(command, Command::Save { .. }) {
                if let Target::Composite(composite) = target {
                    composite.save_config()?;
                }
            }
            if let (Target::Composite(composite), true) = (target, command.moves() && wait) {
                lines.push(composite.get_status().await?.status_line());
            }
            Ok(lines)
        }
    }
}

async fn single(device: &MotionDevice, command: &Command, wait: bool) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match command {
        Command::Status => lines.push(device.get_status().await?.status_line()),
        Command::Position => lines.push(with_unit(device.get_position().await?, device.unit())),
        Command::Target => lines.push(with_unit(device.get_target_position().await?, device.unit())),
        Command::Home => device.home(wait).await?,
        Command::Goto { value } => device.move_absolute(*value, wait).await?,
        Command::Nudge { delta } => device.move_relative(*delta, wait).await?,
        Command::Stop => device.stop().await?,
        Command::Reset => device.reset().await?,
        Command::Configs => {
            let unit = device.unit();
            lines.extend(
                device
                    .configurations()
                    .iter()
                    .map(|entry| scalar_line(entry, unit.as_deref())),
            );
        }
        Command::Save { index, name } => {
            let idx = device
                .save_configuration(None, *index, name.as_deref(), None)
                .await?;
            lines.push(format!("saved configuration {}", idx));
        }
        Command::Select(_) => {
            let selector = command
                .selector()
                .ok_or_else(|| anyhow!("no configuration given"))?;
            device.move_configuration(&selector, wait).await?;
        }
    }
    if command.moves() && wait {
        lines.push(device.get_status().await?.status_line());
    }
    Ok(lines)
}

async fn composite_wide(composite: &CompositeDevice, command: &Command, wait: bool) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match command {
        Command::Status => lines.push(composite.get_status().await?.status_line()),
        Command::Position => {
            for (axis, position) in composite.get_positions().await? {
                lines.push(format!("{} = {}", axis, position));
            }
        }
        Command::Stop => composite.stop(None).await?,
        Command::Configs => lines.extend(composite.configurations().iter().map(joint_line)),
        Command::Save { index, name } => {
            let idx = composite
                .save_configuration(None, *index, name.as_deref(), None)
                .await?;
            lines.push(format!("saved configuration {}", idx));
        }
        Command::Select(_) => {
            let selector = command
                .selector()
                .ok_or_else(|| anyhow!("no configuration given"))?;
            composite.move_configuration(&selector, wait).await?;
            if wait {
                lines.push(composite.get_status().await?.status_line());
            }
        }
        Command::Target => {
            require_axis(None, "target")?;
        }
        Command::Home => {
            require_axis(None, "home")?;
        }
        Command::Goto { .. } => {
            require_axis(None, "goto")?;
        }
        Command::Nudge { .. } => {
            require_axis(None, "nudge")?;
        }
        Command::Reset => {
            require_axis(None, "reset")?;
        }
    }
    Ok(lines)
}
