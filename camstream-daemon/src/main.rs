mod config;
mod diagnostics;
mod monitor;
mod topology;

use anyhow::{Context, Result};
use camstream_protocol::overlay::OverlayCompiler;
use camstream_protocol::{ControlClient, ServerEndpoints};
use clap::Parser;
use config::Config;
use diagnostics::{Cli, Command};
use monitor::WatchOptions;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    diagnostics::init_logging(&cli).context("Failed to initialize logging")?;

    if let Command::Version = cli.command {
        diagnostics::print_version();
        return Ok(());
    }

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    let (endpoints, ws_url) = match &cli.server {
        Some(url) => {
            let endpoints = ServerEndpoints::new(url.clone()).context("Invalid --server URL")?;
            let ws_url = endpoints.ws_url_with_path(&config.server.websocket_path);
            (endpoints, ws_url)
        }
        None => (config.server.endpoints()?, config.server.ws_url()?),
    };

    run(&cli.command, &config, endpoints, &ws_url).await
}

async fn run(
    command: &Command,
    config: &Config,
    endpoints: ServerEndpoints,
    ws_url: &str,
) -> Result<()> {
    match command {
        Command::Watch {
            interval,
            count,
            overlay,
            ack,
        } => {
            let source = overlay.as_ref().or(config.overlay.topology.as_ref());
            let overlay = match source {
                Some(source) => {
                    let topology = topology::load_topology(source)?;
                    info!("Compiling overlay '{}'", topology.name);
                    Some(OverlayCompiler::new(topology).with_policy(config.overlay.visibility))
                }
                None => None,
            };

            info!("Watching {}", ws_url);
            monitor::watch(
                config,
                ws_url,
                WatchOptions {
                    interval: Duration::from_secs((*interval).max(1)),
                    count: *count,
                    overlay,
                    ack: *ack,
                },
            )
            .await
        }

        Command::Health => {
            let client = ControlClient::new(endpoints)?;
            match client.health().await {
                Ok(true) => println!("Server at {} is healthy", client.endpoints().base_url()),
                Ok(false) => println!("Server at {} is unhealthy", client.endpoints().base_url()),
                Err(e) => println!("{}", e.user_message()),
            }
            Ok(())
        }

        Command::Shutdown => {
            ControlClient::new(endpoints)?
                .shutdown()
                .await
                .context("Shutdown request failed")?;
            println!("Shutdown requested");
            Ok(())
        }

        Command::Detect { include_virtual } => {
            let cameras = ControlClient::new(endpoints)?
                .detect_cameras(!include_virtual)
                .await
                .context("Camera detection failed")?;
            print_json(&cameras)
        }

        Command::CreateGroup { configs } => {
            let configs = read_json_file(configs)?;
            let response = ControlClient::new(endpoints)?
                .create_group(configs)
                .await
                .context("Failed to create camera group")?;
            print_json(&response)
        }

        Command::CloseAll => {
            ControlClient::new(endpoints)?
                .close_all()
                .await
                .context("Failed to close cameras")?;
            println!("All cameras closed");
            Ok(())
        }

        Command::Update { configs } => {
            let configs = read_json_file(configs)?;
            let response = ControlClient::new(endpoints)?
                .update_configs(configs)
                .await
                .context("Failed to update camera configs")?;
            print_json(&response)
        }

        Command::RecordStart { name } => {
            let response = ControlClient::new(endpoints)?
                .start_recording(name.as_deref())
                .await
                .context("Failed to start recording")?;
            print_json(&response)
        }

        Command::RecordStop => {
            let response = ControlClient::new(endpoints)?
                .stop_recording()
                .await
                .context("Failed to stop recording")?;
            print_json(&response)
        }

        Command::PauseUnpause => {
            let response = ControlClient::new(endpoints)?
                .pause_unpause()
                .await
                .context("Failed to pause/unpause cameras")?;
            print_json(&response)
        }

        Command::DumpConfig => {
            println!("\n=== Configuration ===");
            println!("Control API: {}", endpoints.base_url());
            println!("Stream: {}\n", ws_url);
            print!("{}", config.to_toml()?);
            Ok(())
        }

        Command::CompileOverlay {
            topology: source,
            observation,
            gaps,
        } => {
            let topology = topology::load_topology(source)?;
            let bundle = topology::load_observations(observation)?;
            let reports = topology::compile_bundle(topology, config.overlay.visibility, &bundle);
            print_json(&topology::reports_to_json(&reports, *gaps))
        }

        Command::Version => {
            diagnostics::print_version();
            Ok(())
        }
    }
}

fn read_json_file(path: &Path) -> Result<Value> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to format response")?
    );
    Ok(())
}
