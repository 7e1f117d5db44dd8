//! Crate implementing the CLI commands.

mod cli;
mod config;
mod run;

pub use self::cli::{CliAction, CliOpts};
pub use self::config::{ScenarioConfig, ScenarioProcess};
pub use self::run::evaluate_watch;
