// Edgecast - camera to SRT/recording streamer
// Main library entry point

pub mod audio;
pub mod backend;
pub mod config;
pub mod devices;
pub mod encoding;
pub mod gstreamer_init;
pub mod mux;
pub mod pipeline;
pub mod transport;

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::Sender;

use config::Config;
use pipeline::{Command, StreamerApp};

/// Command line options
#[derive(Debug, Parser)]
#[command(name = "edgecast", version, about = "Capture, encode and push a camera feed over SRT")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Write the default configuration to this path and exit
    #[arg(long, value_name = "PATH")]
    pub write_config: Option<PathBuf>,
}

/// Parse arguments, build the pipeline and run it until stopped
pub fn run() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Some(path) = cli.write_config {
        Config::default()
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        log::info!("[App] Default config written to {}", path.display());
        return Ok(());
    }

    let config_path = cli.config.unwrap_or_else(config::default_config_path);
    let config = Config::load_or_default(&config_path);

    gstreamer_init::init_gstreamer().context("GStreamer init failed")?;

    let hardware = backend::open_hardware(&config, None).context("hardware init failed")?;
    let services = backend::services(&config);
    let mut app = StreamerApp::new(config, hardware, services).context("pipeline init failed")?;

    let stop = app.stop_handle();
    ctrlc::set_handler(move || stop.request_stop()).context("installing signal handler")?;

    let (tx, rx) = crossbeam_channel::unbounded();
    spawn_console(tx).context("starting console reader")?;
    log::info!("[App] Keys: a = toggle AI overlay, s = status, q = quit");

    app.start().context("pipeline start failed")?;
    app.run(&rx)?;
    Ok(())
}

/// Read single-letter commands from stdin and forward them to the main loop
fn spawn_console(tx: Sender<Command>) -> std::io::Result<()> {
    std::thread::Builder::new()
        .name("edgecast-console".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                let command = match line.trim() {
                    "a" => Command::ToggleAi,
                    "s" => Command::Status,
                    "q" => Command::Stop,
                    "" => continue,
                    other => {
                        log::warn!("[App] Unknown command '{}'", other);
                        continue;
                    }
                };
                let quit = command == Command::Stop;
                if tx.send(command).is_err() || quit {
                    break;
                }
            }
        })?;
    Ok(())
}
