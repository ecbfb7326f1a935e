//! Command-line definition.

use clap::{Parser, Subcommand};
use devctl_core::ConfigSelector;
use std::path::PathBuf;

/// Parsed command line.
#[derive(Parser, Debug)]
#[command(name = "devctl")]
#[command(version, about = "Query and move motion devices described by TOML files", long_about = None)]
pub struct Cli {
    /// Runtime settings file (retry, arbiter, motion, logging)
    #[arg(long, value_name = "FILE")]
    pub settings: Option<PathBuf>,

    /// Return once the controller has accepted a move
    #[arg(long, global = true)]
    pub no_wait: bool,

    /// Device or composite configuration file
    pub config: PathBuf,

    /// Axis of a composite device
    #[arg(long, value_name = "NAME", global = true)]
    pub axis: Option<String>,

    /// What to do with the device.
    #[command(subcommand)]
    pub command: Command,
}

/// Device command.
#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Position and matching configuration
    Status,

    /// Live position
    Position,

    /// Commanded target position
    Target,

    /// Run the reference search
    Home,

    /// Move to an absolute position
    Goto {
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },

    /// Move by a relative step
    Nudge {
        #[arg(allow_negative_numbers = true)]
        delta: f64,
    },

    /// Stop motion (every axis of a composite unless --axis is given)
    Stop,

    /// Reset the controller
    Reset,

    /// List saved configurations
    Configs,

    /// Save the current position as a configuration
    Save {
        /// Index to write (default: the configuration matching the position)
        #[arg(long)]
        index: Option<u32>,

        /// Name for the configuration
        #[arg(long)]
        name: Option<String>,
    },

    /// Move to a saved configuration, by name or index
    #[command(external_subcommand)]
    Select(Vec<String>),
}

impl Command {
    /// Whether this command starts motion.
    pub fn moves(&self) -> bool {
        matches!(
            self,
            Command::Home | Command::Goto { .. } | Command::Nudge { .. } | Command::Select(_)
        )
    }

    /// Selector of a bare configuration argument; words are joined with spaces.
    pub fn selector(&self) -> Option<ConfigSelector> {
        match self {
            Command::Select(words) => Some(ConfigSelector::from(words.join(" ").as_str())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("devctl").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_negative_goto() {
        let cli = parse(&["stage.toml", "goto", "-1.5"]);
        assert_eq!(cli.command, Command::Goto { value: -1.5 });
        assert!(!cli.no_wait);
    }

    #[test]
    fn test_axis_and_no_wait_anywhere() {
        let cli = parse(&["--no-wait", "bench.toml", "--axis", "x", "nudge", "0.25"]);
        assert_eq!(cli.axis.as_deref(), Some("x"));
        assert!(cli.no_wait);

        let cli = parse(&["bench.toml", "home", "--axis", "y", "--no-wait"]);
        assert_eq!(cli.axis.as_deref(), Some("y"));
        assert!(cli.no_wait);
    }

    #[test]
    fn test_bare_configuration() {
        let cli = parse(&["wheel.toml", "3"]);
        assert_eq!(cli.command.selector(), Some(ConfigSelector::Index(3)));
        assert!(cli.command.moves());

        let cli = parse(&["wheel.toml", "Open"]);
        assert_eq!(cli.command.selector(), Some(ConfigSelector::Name("Open".to_string())));
    }

    #[test]
    fn test_save_options() {
        let cli = parse(&["--settings", "devctl.toml", "stage.toml", "save", "--index", "4", "--name", "slit"]);
        assert_eq!(cli.settings, Some(PathBuf::from("devctl.toml")));
        assert_eq!(
            cli.command,
            Command::Save {
                index: Some(4),
                name: Some("slit".to_string())
            }
        );
        assert!(!cli.command.moves());
    }

    #[test]
    fn test_config_required() {
        assert!(Cli::try_parse_from(["devctl"]).is_err());
    }
}
