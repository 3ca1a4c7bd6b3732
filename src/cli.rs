use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(name = "knob-tuner")]
#[command(version)]
#[command(about = "Adaptive knob tuning service with live WebSocket fan-out")]
pub struct Cli {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Address to bind (overrides [server].bind)
    #[arg(long, global = true)]
    pub bind: Option<String>,

    /// Port to listen on (overrides [server].port)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// tracing filter directive, e.g. "knob_tuner=debug" (RUST_LOG wins)
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    /// Start with only the knobs declared in the config file
    #[arg(long, global = true)]
    pub no_builtin_knobs: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the tuning service (default)
    Serve,
    /// Print the knob schema and exit
    Knobs,
    /// Print shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Cli {
    /// The chosen subcommand, `serve` when none is given.
    pub fn selected(&self) -> Command {
        self.command.clone().unwrap_or(Command::Serve)
    }
}
