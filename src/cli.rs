use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "cncfans")]
#[command(about = "Fan outputs for a CNC controller, run on a simulated board")]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v = info, -vv = debug, -vvv = trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Board profile (JSON); built-in defaults when omitted
    #[arg(long, global = true)]
    pub profile: Option<PathBuf>,

    /// File backing the non-volatile storage image; in-memory when omitted
    #[arg(long, global = true)]
    pub nvs: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a script of commands ('-' reads stdin)
    Run {
        /// Script file
        script: PathBuf,
    },

    /// Run the given lines, e.g. `exec "M106 P1" "?"`
    Exec {
        /// Lines in script syntax
        #[arg(required = true)]
        lines: Vec<String>,
    },

    /// Show every fan with its port and state
    Fans,

    /// List the settings table with current values
    Settings,

    /// Print the options report
    Options,
}
