//! Command Line and Logging
//!
//! CLI definition for the `camstream` binary and tracing initialisation.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// Camstream command-line interface
#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(about = "Multi-camera stream client and capture server control", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, default_value = "true")]
    pub timestamps: bool,

    /// Configuration file (defaults to the user config directory)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Override the server base URL, e.g. http://localhost:8006
    #[arg(long, value_name = "URL")]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect and print per-camera liveness until interrupted
    Watch {
        /// Seconds between status tables
        #[arg(short, long, default_value = "1")]
        interval: u64,

        /// Number of tables to print (0 = until interrupted)
        #[arg(short, long, default_value = "0")]
        count: usize,

        /// Compile this overlay for every observation (built-in name or file)
        #[arg(long, value_name = "TOPOLOGY")]
        overlay: Option<String>,

        /// Acknowledge every delivered frame
        #[arg(long)]
        ack: bool,
    },

    /// Check whether the server is up
    Health,

    /// Ask the server to shut down
    Shutdown,

    /// Detect attached cameras
    Detect {
        /// Include virtual cameras
        #[arg(long)]
        include_virtual: bool,
    },

    /// Open a camera group from a JSON file of camera configs
    CreateGroup {
        /// JSON object keyed by camera id
        configs: PathBuf,
    },

    /// Close every camera
    CloseAll,

    /// Update camera configs from a JSON file
    Update {
        /// JSON object keyed by camera id
        configs: PathBuf,
    },

    /// Start recording
    RecordStart {
        /// Recording name
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Stop recording
    RecordStop,

    /// Toggle pause on every camera
    PauseUnpause,

    /// Show the effective configuration
    DumpConfig,

    /// Compile an overlay offline and print the primitives as JSON
    CompileOverlay {
        /// Built-in topology name or TOML/JSON topology file
        topology: String,

        /// Observation JSON (a single observation or a bundle keyed by camera)
        observation: PathBuf,

        /// Also print resolution gaps
        #[arg(long)]
        gaps: bool,
    },

    /// Show version and build information
    Version,
}

/// Initialize logging based on CLI configuration
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}

/// Print version information
pub fn print_version() {
    println!("camstream {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol crate: camstream-protocol {}", env!("CARGO_PKG_VERSION"));
    println!("Wire version: {}", camstream_protocol::WIRE_VERSION);
    println!("Target: {}-{}", std::env::consts::ARCH, std::env::consts::OS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_watch() {
        let cli = Cli::try_parse_from(["camstream", "watch", "--interval", "2", "--overlay", "charuco"])
            .unwrap();
        match cli.command {
            Command::Watch {
                interval, overlay, ..
            } => {
                assert_eq!(interval, 2);
                assert_eq!(overlay.as_deref(), Some("charuco"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_parse_record_start() {
        let cli = Cli::try_parse_from([
            "camstream",
            "--server",
            "http://10.0.0.2:8006",
            "record-start",
            "--name",
            "take1",
        ])
        .unwrap();
        assert_eq!(cli.server.as_deref(), Some("http://10.0.0.2:8006"));
        assert!(matches!(
            cli.command,
            Command::RecordStart { name: Some(ref n) } if n == "take1"
        ));
    }

    #[test]
    fn test_subcommand_required() {
        assert!(Cli::try_parse_from(["camstream"]).is_err());
    }
}
