//! DualShock 3 controller support
//!
//! This module provides the Bluetooth session, motion calibration and the
//! calibration cache for DS3 pads.

pub mod calibration;
pub mod constants;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use calibration::{CalibrationEngine, CalibrationError, CalibrationService, DriftCalibrator};
pub use session::{Ds3Session, SessionConfig, SessionError, SessionState};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore, StoreError, Table};
pub use transport::{HidChannel, HidTransport, MockHidTransport, TransportError};
pub use types::{DeviceAddress, NormalizedReport, PadId, PadMeta};
