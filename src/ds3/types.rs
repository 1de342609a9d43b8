//! DualShock type definitions
//!
//! This module defines the basic data types shared by the controller session
//! and the protocol server: slot and state enums, device addresses, motion
//! data and the normalized report itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Bluetooth device address of a controller (6 bytes, most significant first)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct DeviceAddress(pub [u8; 6]);

impl DeviceAddress {
    /// The all-zero address reported for empty slots
    pub const ZERO: DeviceAddress = DeviceAddress([0; 6]);

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Lowercase hex without separators, used as a storage key
    pub fn to_key(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 6]> for DeviceAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Error returned when parsing a device address string fails
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid device address: {0}")]
pub struct ParseAddressError(pub String);

impl FromStr for DeviceAddress {
    type Err = ParseAddressError;

    /// Accepts "AA:BB:CC:DD:EE:FF", "AA-BB-..." or the bare 12-digit key form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        if digits.len() != 12 {
            return Err(ParseAddressError(s.to_string()));
        }

        let mut bytes = [0u8; 6];
        hex::decode_to_slice(&digits, &mut bytes).map_err(|_| ParseAddressError(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Output slot a pad occupies on the protocol server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PadId {
    One = 0,
    Two = 1,
    Three = 2,
    Four = 3,
    None = 0xFF,
}

impl PadId {
    pub const ALL: [PadId; 4] = [PadId::One, PadId::Two, PadId::Three, PadId::Four];

    /// Map a wire byte to a slot, `None` for anything outside 0..=3
    pub fn from_byte(value: u8) -> Option<PadId> {
        match value {
            0 => Some(PadId::One),
            1 => Some(PadId::Two),
            2 => Some(PadId::Three),
            3 => Some(PadId::Four),
            _ => None,
        }
    }

    /// Slot index 0..=3, `None` for the unassigned id
    pub fn index(self) -> Option<usize> {
        match self {
            PadId::None => None,
            other => Some(other as usize),
        }
    }
}

impl Default for PadId {
    fn default() -> Self {
        Self::None
    }
}

/// Connection state of a pad slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PadState {
    #[default]
    Disconnected = 0,
    Reserved = 1,
    Connected = 2,
}

/// Controller family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Model {
    #[default]
    None = 0,
    DS3 = 1,
    DS4 = 2,
}

/// Physical link the pad is attached through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    #[default]
    None = 0,
    Usb = 1,
    Bluetooth = 2,
}

/// Battery tier as reported by the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Battery {
    #[default]
    None = 0x00,
    Dying = 0x01,
    Low = 0x02,
    Medium = 0x03,
    High = 0x04,
    Full = 0x05,
    Charging = 0xEE,
    Charged = 0xEF,
}

impl From<u8> for Battery {
    fn from(value: u8) -> Self {
        match value {
            0x01 => Battery::Dying,
            0x02 => Battery::Low,
            0x03 => Battery::Medium,
            0x04 => Battery::High,
            0x05 => Battery::Full,
            0xEE => Battery::Charging,
            0xEF => Battery::Charged,
            _ => Battery::None,
        }
    }
}

/// Digital buttons; the discriminant is the bit position in [`NormalizedReport::buttons`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    /// Select on DS3, Share on DS4
    Select = 0,
    L3 = 1,
    R3 = 2,
    /// Start on DS3, Options on DS4
    Start = 3,
    Up = 4,
    Right = 5,
    Down = 6,
    Left = 7,
    L2 = 8,
    R2 = 9,
    L1 = 10,
    R1 = 11,
    Triangle = 12,
    Circle = 13,
    Cross = 14,
    Square = 15,
    Ps = 16,
    TouchPad = 17,
}

impl Button {
    pub fn mask(self) -> u32 {
        1 << (self as u32)
    }
}

/// Analog channels; the discriminant is the index into [`NormalizedReport::axes`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    Lx = 0,
    Ly = 1,
    Rx = 2,
    Ry = 3,
    Up = 4,
    Right = 5,
    Down = 6,
    Left = 7,
    L2 = 8,
    R2 = 9,
    L1 = 10,
    R1 = 11,
    Triangle = 12,
    Circle = 13,
    Cross = 14,
    Square = 15,
}

pub const AXIS_COUNT: usize = 16;

/// Neutral stick position
pub const STICK_CENTER: u8 = 0x80;

/// A single touchpad contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TouchPoint {
    pub active: bool,
    pub id: u8,
    pub x: u16,
    pub y: u16,
}

/// Accelerometer data (linear acceleration in Gs)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Accelerometer {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Gyroscope data (angular velocity in degrees per second)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Gyroscope {
    pub pitch: f32,
    pub yaw: f32,
    pub roll: f32,
}

/// Per-slot metadata answered to list-ports requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PadMeta {
    pub pad_id: PadId,
    pub state: PadState,
    pub model: Model,
    pub connection_type: ConnectionType,
    pub address: DeviceAddress,
    pub battery: Battery,
}

impl PadMeta {
    /// Snapshot for a slot with nothing attached
    pub fn disconnected(pad_id: PadId) -> Self {
        Self {
            pad_id,
            ..Self::default()
        }
    }
}

/// Calibrated telemetry for one sampling instant of one controller
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedReport {
    pub pad_id: PadId,
    pub state: PadState,
    pub model: Model,
    pub connection_type: ConnectionType,
    pub address: DeviceAddress,
    pub battery: Battery,

    /// Increments by one per accepted frame, wraps at 32 bits
    pub packet_counter: u32,

    /// Microseconds on a monotonic clock, never decreasing within a session
    pub timestamp: u64,

    /// Bitset of [`Button`] masks
    pub buttons: u32,

    /// Stick positions and pressure values, indexed by [`Axis`]
    pub axes: [u8; AXIS_COUNT],

    pub touches: [Option<TouchPoint>; 2],
    pub accelerometer: Option<Accelerometer>,
    pub gyroscope: Option<Gyroscope>,
}

impl Default for NormalizedReport {
    fn default() -> Self {
        let mut axes = [0u8; AXIS_COUNT];
        for stick in [Axis::Lx, Axis::Ly, Axis::Rx, Axis::Ry] {
            axes[stick as usize] = STICK_CENTER;
        }

        Self {
            pad_id: PadId::None,
            state: PadState::Disconnected,
            model: Model::None,
            connection_type: ConnectionType::None,
            address: DeviceAddress::ZERO,
            battery: Battery::None,
            packet_counter: 0,
            timestamp: 0,
            buttons: 0,
            axes,
            touches: [None, None],
            accelerometer: None,
            gyroscope: None,
        }
    }
}

impl NormalizedReport {
    pub fn is_pressed(&self, button: Button) -> bool {
        self.buttons & button.mask() != 0
    }

    pub fn set(&mut self, button: Button, pressed: bool) {
        if pressed {
            self.buttons |= button.mask();
        } else {
            self.buttons &= !button.mask();
        }
    }

    pub fn unset(&mut self, button: Button) {
        self.set(button, false);
    }

    pub fn axis(&self, axis: Axis) -> u8 {
        self.axes[axis as usize]
    }

    pub fn set_axis(&mut self, axis: Axis, value: u8) {
        self.axes[axis as usize] = value;
    }

    /// Button value as an analog byte (0 or 0xFF), used for pads without pressure sensors
    pub fn button_value(&self, button: Button) -> u8 {
        if self.is_pressed(button) {
            0xFF
        } else {
            0x00
        }
    }

    /// True while the user is touching anything on the pad
    pub fn is_pad_active(&self) -> bool {
        const STICK_IDLE_BAND: i16 = 10;

        if self.buttons != 0 {
            return true;
        }

        let sticks = [Axis::Lx, Axis::Ly, Axis::Rx, Axis::Ry];
        if sticks
            .iter()
            .any(|a| (self.axis(*a) as i16 - STICK_CENTER as i16).abs() > STICK_IDLE_BAND)
        {
            return true;
        }

        self.axes[Axis::Up as usize..].iter().any(|v| *v != 0)
    }

    pub fn meta(&self) -> PadMeta {
        PadMeta {
            pad_id: self.pad_id,
            state: self.state,
            model: self.model,
            connection_type: self.connection_type,
            address: self.address,
            battery: self.battery,
        }
    }
}
