//! dsu-bridge: DualShock 3 to DSU (cemuhook) Bridge
//!
//! This library drives Bluetooth DS3 sessions, calibrates their motion
//! sensors and serves the resulting pad data to DSU clients over UDP.

pub mod bridge;
pub mod config;
pub mod ds3;
pub mod server;

// Re-export commonly used items
pub use bridge::{Bridge, BridgeError, SlotTable};
pub use config::{Config, ConfigError};
pub use ds3::{Ds3Session, NormalizedReport, PadId};
pub use server::ProtocolServer;
