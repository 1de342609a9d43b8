//! DSU Bridge - Main Application
//!
//! Loads the configuration, starts the DSU server and keeps it running
//! until the process is stopped. DS3 sessions are attached through the
//! library API by the platform HID layer.

use anyhow::Context;
use dsu_bridge::{Bridge, Config};
use std::thread;
use std::time::Duration;

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    println!("=== DSU Bridge ===");
    println!();

    // Optional config path as the first argument
    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).with_context(|| format!("loading {}", path))?,
        None => Config::load_default().context("loading configs/default.toml")?,
    };

    let mut bridge = Bridge::new(config);
    let addr = bridge.start().context("starting bridge")?;

    println!("Serving DSU clients on {}", addr);
    println!("Press Ctrl+C to stop");
    println!();

    // Keep the main thread alive
    loop {
        thread::sleep(Duration::from_secs(1));

        if !bridge.is_running() {
            println!("Bridge stopped");
            break;
        }
    }

    Ok(())
}
