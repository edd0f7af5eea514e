// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line arguments for `launchpad`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "launchpad",
    version,
    about = "Upload build artifacts and run them in ephemeral environments.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Launchpad.toml` in the current working directory. Built-in
    /// defaults apply when that file does not exist.
    #[arg(long, global = true, value_name = "PATH", default_value = "Launchpad.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `LAUNCHPAD_LOG` or a default level will be used.
    #[arg(long, global = true, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Upload an artifact, launch it and follow the job until it finishes.
    Run {
        /// File to upload.
        #[arg(long, value_name = "FILE")]
        artifact: PathBuf,

        /// Command to start inside the environment.
        #[arg(long = "cmd", value_name = "COMMAND")]
        start_command: String,

        /// Identity the artifact and job are recorded under.
        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Serve the status API as JSON lines over stdin/stdout.
    Serve {
        /// Owner used for requests that do not carry one.
        #[arg(long, default_value = "local")]
        owner: String,
    },

    /// Parse and validate the config, print the effective settings, exit.
    Check,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_global_flags() {
        let args = CliArgs::try_parse_from([
            "launchpad",
            "run",
            "--artifact",
            "bundle.zip",
            "--cmd",
            "./run.sh",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(args.config, "Launchpad.toml");
        assert!(matches!(args.log_level, Some(LogLevel::Debug)));
        match args.command {
            Command::Run {
                artifact,
                start_command,
                owner,
            } => {
                assert_eq!(artifact, PathBuf::from("bundle.zip"));
                assert_eq!(start_command, "./run.sh");
                assert_eq!(owner, "local");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(CliArgs::try_parse_from(["launchpad"]).is_err());
    }
}
