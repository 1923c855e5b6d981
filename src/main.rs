//! beagle-link daemon
//!
//! Connects to the board's I2C proxy, brings up every configured peripheral
//! and logs state changes and polled register values until Ctrl-C.

use beagle_link::config::Config;
use beagle_link::error::{Error, Result};
use beagle_link::robot::Robot;
use crossbeam_channel::RecvTimeoutError;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "beagle-link.toml";

/// Config file from `[path]`, `--config <path>` or `-c <path>`
fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                if let Some(path) = args.next() {
                    return PathBuf::from(path);
                }
            }
            _ if !arg.starts_with('-') => return PathBuf::from(arg),
            _ => {}
        }
    }
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

/// Load `path`, falling back to the stock board when the file is missing
fn load_config(path: &Path) -> Result<(Config, bool)> {
    if path.exists() {
        Ok((Config::load(path)?, true))
    } else {
        Ok((Config::default(), false))
    }
}

fn main() -> Result<()> {
    let path = config_path(env::args().skip(1));
    let (config, loaded) = load_config(&path)?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.logging.level))
        .init();

    log::info!("beagle-link v{} starting...", env!("CARGO_PKG_VERSION"));
    if loaded {
        log::info!("Using config: {}", path.display());
    } else {
        log::info!("No config at {}, using defaults", path.display());
    }
    log::info!(
        "I2C proxy: {}:{} (poll {})",
        config.proxy.host,
        config.proxy.command_port,
        config.proxy.poll_port()
    );

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running_handler.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::Other(format!("Failed to set Ctrl-C handler: {e}")))?;

    let robot = Robot::from_config(&config)?;
    let events = robot.subscribe();
    robot.init()?;
    robot.connect()?;

    while running.load(Ordering::SeqCst) {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => log::info!("{} {} = {}", event.source, event.property, event.value),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    log::info!("Shutting down...");
    robot.dispose();
    log::info!("beagle-link stopped");
    Ok(())
}
