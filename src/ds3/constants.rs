//! DualShock 3 protocol constants
//!
//! This module contains all the constants needed for DS3 Bluetooth communication:
//! - HID init and enable command frames
//! - Output report template and byte offsets
//! - Input frame offsets
//! - Storage layout sizes

// ============================================================================
// HID Commands
// ============================================================================

/// Enable command sent on the HID control channel when the session starts
pub const HID_COMMAND_ENABLE: [u8; 6] = [0x53, 0xF4, 0x42, 0x03, 0x00, 0x00];

/// Service-record queries sent one per acknowledged step during HID init
pub const HID_INIT_REPORTS: [&[u8]; 7] = [
    &[0x02, 0x00, 0x0F, 0x00, 0x08, 0x35, 0x03, 0x19, 0x12, 0x00, 0x00, 0x03, 0x00],
    &[
        0x04, 0x00, 0x10, 0x00, 0x0F, 0x00, 0x01, 0x00, 0x01, 0x00, 0x10, 0x35, 0x06, 0x09, 0x02,
        0x01, 0x09, 0x02, 0x02, 0x00,
    ],
    &[
        0x06, 0x00, 0x11, 0x00, 0x0D, 0x35, 0x03, 0x19, 0x11, 0x24, 0x01, 0x90, 0x35, 0x03, 0x09,
        0x02, 0x06, 0x00,
    ],
    &[
        0x06, 0x00, 0x12, 0x00, 0x0F, 0x35, 0x03, 0x19, 0x11, 0x24, 0x01, 0x90, 0x35, 0x03, 0x09,
        0x02, 0x06, 0x02, 0x00, 0x7F,
    ],
    &[
        0x06, 0x00, 0x13, 0x00, 0x0F, 0x35, 0x03, 0x19, 0x11, 0x24, 0x01, 0x90, 0x35, 0x03, 0x09,
        0x02, 0x06, 0x02, 0x00, 0x59,
    ],
    &[
        0x06, 0x00, 0x14, 0x00, 0x0F, 0x35, 0x03, 0x19, 0x11, 0x24, 0x01, 0x80, 0x35, 0x03, 0x09,
        0x02, 0x06, 0x02, 0x00, 0x33,
    ],
    &[
        0x06, 0x00, 0x15, 0x00, 0x0F, 0x35, 0x03, 0x19, 0x11, 0x24, 0x01, 0x90, 0x35, 0x03, 0x09,
        0x02, 0x06, 0x02, 0x00, 0x0D,
    ],
];

// ============================================================================
// Output Report
// ============================================================================

/// Length of the Bluetooth output command: HIDP header plus the 49-byte report
pub const OUTPUT_REPORT_LEN: usize = 50;

/// Rumble/LED output command (HIDP SET_REPORT 0x52, report id 0x01)
/// Bytes 12..32 are four LED timing blocks (on/off duty for LED 1-4)
#[rustfmt::skip]
pub const OUTPUT_REPORT_TEMPLATE: [u8; OUTPUT_REPORT_LEN] = [
    0x52, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
    0xFF, 0x27, 0x10, 0x00, 0x32,
    0xFF, 0x27, 0x10, 0x00, 0x32,
    0xFF, 0x27, 0x10, 0x00, 0x32,
    0xFF, 0x27, 0x10, 0x00, 0x32,
    0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00,
];

/// Small motor on/off marker and value
pub const RUMBLE_SMALL_MARKER: usize = 3;
pub const RUMBLE_SMALL_VALUE: usize = 4;

/// Large motor marker and strength; the marker byte is shared with calibration
pub const RUMBLE_LARGE_MARKER: usize = 5;
pub const RUMBLE_LARGE_VALUE: usize = 6;

/// LED bitmask byte
pub const LED_INDEX: usize = 11;

/// Offset handed to the calibration engine when stamping the output report
pub const OUTPUT_CALIBRATION_OFFSET: usize = 2;

/// LED bits for pads 1-4
pub const LED_OFFSETS: [u8; 4] = [0x02, 0x04, 0x08, 0x10];

// ============================================================================
// Input Frame
// ============================================================================

/// Start of the DS3 HID payload inside a Bluetooth input frame
pub const BTH_PAYLOAD_OFFSET: usize = 9;

/// Size of the DS3 HID payload copied into the report
pub const PAYLOAD_LEN: usize = 49;

/// Minimum Bluetooth input frame length
pub const BTH_FRAME_MIN_LEN: usize = BTH_PAYLOAD_OFFSET + PAYLOAD_LEN;

/// Frame byte that reads 0xFF while the controller has nothing to report
pub const IDLE_MARKER_INDEX: usize = 10;

pub const PLUG_STATUS_INDEX: usize = 38;
pub const BATTERY_INDEX: usize = 39;
pub const CABLE_STATUS_INDEX: usize = 40;

/// Payload-relative offsets (identical to the USB report layout)
pub mod payload {
    pub const BUTTONS_1: usize = 2;
    pub const BUTTONS_2: usize = 3;
    pub const PS_BUTTON: usize = 4;
    pub const LX: usize = 6;
    pub const LY: usize = 7;
    pub const RX: usize = 8;
    pub const RY: usize = 9;
    /// Twelve pressure bytes: Up, Right, Down, Left, L2, R2, L1, R1, Triangle, Circle, Cross, Square
    pub const PRESSURE_START: usize = 14;
    /// Accel X, Y, Z then gyro, each a 16-bit word
    pub const MOTION_START: usize = 0x29;
    pub const GYRO: usize = 0x2F;
}

// ============================================================================
// Storage Layout
// ============================================================================

/// Size of the EEPROM dump and of the status snapshot cached over USB
pub const EEPROM_LEN: usize = 49;
pub const STATUS_LEN: usize = 49;

/// A `Ds3Data` row is EEPROM followed by status
pub const SNAPSHOT_LEN: usize = EEPROM_LEN + STATUS_LEN;

// ============================================================================
// Timing Constants
// ============================================================================

/// Interval between LED refreshes (milliseconds)
pub const LED_TICK_MS: u64 = 500;
