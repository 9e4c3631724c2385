//! sqlgated — the sqlgate daemon.
//!
//! Loads `sqlgate.toml`, prewarms the admin and readonly backend pools and
//! serves MySQL clients until Ctrl-C or SIGTERM.
//!
//! # Usage
//!
//! ```text
//! sqlgated init --path sqlgate.toml
//! sqlgated run --config sqlgate.toml --log-format json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

mod commands;

#[derive(Parser)]
#[command(
    name = "sqlgated",
    about = "sqlgate — MySQL-protocol proxy daemon",
    version,
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy until interrupted.
    Run {
        /// Path to the configuration file.
        #[arg(short, long, default_value = "sqlgate.toml")]
        config: PathBuf,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
    /// Write a starter configuration file.
    Init {
        #[arg(short, long, default_value = "sqlgate.toml")]
        path: PathBuf,

        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlgate=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run { config, log_format } => {
            init_tracing(log_format);
            commands::run::run(&config).await
        }
        Command::Init { path, force } => {
            init_tracing(LogFormat::Text);
            commands::init::init(&path, force)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_json_logs() {
        let cli = Cli::try_parse_from([
            "sqlgated",
            "run",
            "--config",
            "/etc/sqlgate.toml",
            "--log-format",
            "json",
        ])
        .unwrap();
        match cli.command {
            Command::Run { config, log_format } => {
                assert_eq!(config, PathBuf::from("/etc/sqlgate.toml"));
                assert_eq!(log_format, LogFormat::Json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn run_defaults() {
        let cli = Cli::try_parse_from(["sqlgated", "run"]).unwrap();
        match cli.command {
            Command::Run { config, log_format } => {
                assert_eq!(config, PathBuf::from("sqlgate.toml"));
                assert_eq!(log_format, LogFormat::Text);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["sqlgated", "run", "--log-format", "xml"]).is_err());
    }
}
