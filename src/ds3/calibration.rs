//! Motion sensor calibration
//!
//! The DS3 ships with factory constants for its accelerometer and gyro in
//! EEPROM. Those are only readable over USB, so a snapshot is cached in the
//! store and reused by Bluetooth sessions. The engine maps raw accelerometer
//! samples through the two-point constants and drives a [`CalibrationService`]
//! that keeps the single-axis gyro calibrated at runtime. The service state is
//! persisted whenever the calibration byte it produces changes.

use crate::ds3::constants::{payload, EEPROM_LEN, STATUS_LEN};
use crate::ds3::store::{KeyValueStore, Table};
use crate::ds3::types::{ConnectionType, DeviceAddress};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Offset of the eight big-endian calibration words in the EEPROM dump
const EEPROM_CALIBRATION_OFFSET: usize = 0x11;

/// Calibration byte used until the service produces one
pub const DEFAULT_CALIBRATION_BYTE: u8 = 0x80;

/// Status bytes 8..12 read 0x18 on the legacy motor-profile revision
const LEGACY_REVISION_MARKER: u8 = 0x18;

/// Start of the calibration field list in the status snapshot; the byte before holds the count
const STATUS_CALIBRATION_FIELDS: usize = 0x26;

/// Field value announcing the gyro calibration uses the second output slot
const GYRO_SLOT_B_FIELD: u8 = 7;

/// Accelerometer counts per g after calibration
pub const ACCEL_COUNTS_PER_G: i32 = 113;

/// Centre of the 10-bit motion range
pub const MOTION_CENTER: i32 = 512;

/// Largest 10-bit motion value
pub const MOTION_MAX: i32 = 1023;

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Calibration service returned status {0}")]
    Service(i32),

    #[error("Calibration blob has {actual} bytes, expected {expected}")]
    BlobLength { expected: usize, actual: usize },

    #[error("Unsupported calibration blob version {0}")]
    BlobVersion(u8),

    #[error("{what} has {actual} bytes, expected at least {expected}")]
    TooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

/// Two-point calibration constant pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CalPair {
    pub val1: u16,
    pub val2: u16,
}

/// Factory constants for the three accelerometer axes and the gyro
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromCalibration {
    pub x: CalPair,
    pub y: CalPair,
    pub z: CalPair,
    pub gyro: CalPair,
}

impl Default for EepromCalibration {
    /// Neutral constants: accelerometer passes through, gyro centred
    fn default() -> Self {
        Self {
            x: CalPair::default(),
            y: CalPair::default(),
            z: CalPair::default(),
            gyro: CalPair {
                val1: MOTION_CENTER as u16,
                val2: DEFAULT_CALIBRATION_BYTE as u16,
            },
        }
    }
}

impl EepromCalibration {
    /// Parse the constants from an EEPROM dump
    pub fn parse(eeprom: &[u8]) -> Result<Self, CalibrationError> {
        let end = EEPROM_CALIBRATION_OFFSET + 16;
        if eeprom.len() < end {
            return Err(CalibrationError::TooShort {
                what: "EEPROM snapshot",
                expected: end,
                actual: eeprom.len(),
            });
        }

        let word = |i: usize| {
            let idx = EEPROM_CALIBRATION_OFFSET + i * 2;
            u16::from_be_bytes([eeprom[idx], eeprom[idx + 1]])
        };
        let pair = |i: usize| CalPair {
            val1: word(i * 2),
            val2: word(i * 2 + 1),
        };

        Ok(Self {
            x: pair(0),
            y: pair(1),
            z: pair(2),
            gyro: pair(3),
        })
    }
}

/// Map a raw accelerometer sample through its constant pair.
///
/// Integer division truncates toward zero. Equal constants mean the axis is
/// uncalibrated and the sample passes through.
pub fn calibrate_axis(raw: u16, pair: CalPair) -> u16 {
    if pair.val1 == pair.val2 {
        return raw;
    }

    let val_diff = pair.val1 as i32 - pair.val2 as i32;
    let axis_diff = raw as i32 - pair.val1 as i32;
    let acc = ACCEL_COUNTS_PER_G * ((axis_diff * 1024) / val_diff) / 1024 + MOTION_CENTER;
    acc.clamp(0, MOTION_MAX) as u16
}

/// Which transform variants apply after initial calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReportFlags {
    /// Status snapshot carries the legacy sub-revision marker
    pub legacy_revision: bool,
    /// The motor bytes are free for rumble (controller carries its own calibration marker)
    pub motor_free: bool,
    /// Gyro calibration rides in the second output slot and the gyro is sign-inverted
    pub gyro_slot_b: bool,
}

/// Lifecycle of a calibration engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationPhase {
    Uninitialized,
    Initialized,
    SteadyState,
}

/// Outbound half of the engine, shared with the session's output path
#[derive(Debug)]
pub struct CalibrationStamp {
    motor_free: AtomicBool,
    gyro_slot_b: AtomicBool,
    calibration_byte: AtomicU8,
}

impl Default for CalibrationStamp {
    fn default() -> Self {
        Self {
            motor_free: AtomicBool::new(false),
            gyro_slot_b: AtomicBool::new(false),
            calibration_byte: AtomicU8::new(DEFAULT_CALIBRATION_BYTE),
        }
    }
}

impl CalibrationStamp {
    pub fn calibration_byte(&self) -> u8 {
        self.calibration_byte.load(Ordering::Acquire)
    }

    fn set_calibration_byte(&self, value: u8) {
        self.calibration_byte.store(value, Ordering::Release);
    }

    fn set_flags(&self, flags: ReportFlags) {
        self.motor_free.store(flags.motor_free, Ordering::Release);
        self.gyro_slot_b.store(flags.gyro_slot_b, Ordering::Release);
    }

    /// Stamp marker and calibration bytes into an output command
    pub fn apply(&self, buffer: &mut [u8], offset: usize) {
        if buffer.len() < offset + 7 {
            return;
        }

        let value = self.calibration_byte();

        // Without its own marker the pad expects calibration in the motor slot
        if !self.motor_free.load(Ordering::Acquire) {
            buffer[offset + 3] = 0xFF;
            buffer[offset + 4] = value;
        }

        if self.gyro_slot_b.load(Ordering::Acquire) {
            buffer[offset + 5] = 0xFF;
            buffer[offset + 6] = value;
        }
    }
}

/// Gyro calibration routine, seeded once per session and refined per frame
pub trait CalibrationService: Send {
    /// Produce the initial calibration byte from the factory gyro constants
    fn seed(&mut self, gyro_bias: u16, gyro_zero: u16) -> Result<u8, CalibrationError>;

    /// Feed one raw gyro sample and return the refined calibration byte
    fn refine(&mut self, raw_gyro: u16) -> Result<u8, CalibrationError>;

    /// Opaque runtime state
    fn serialize(&self) -> Vec<u8>;

    /// Replace the runtime state, returning the calibration byte it encodes
    fn restore(&mut self, blob: &[u8]) -> Result<u8, CalibrationError>;

    /// Length of the serialized state
    fn state_len(&self) -> usize;
}

/// Native gyro calibration: tracks the zero-rate output while the pad rests
/// and nudges the calibration byte one step per [`DriftCalibrator::COUNTS_PER_STEP`]
/// counts of drift away from centre.
#[derive(Debug, Clone)]
pub struct DriftCalibrator {
    base_byte: u8,
    calibration_byte: u8,
    zero_rate: f32,
    samples: u32,
}

impl DriftCalibrator {
    const BLOB_VERSION: u8 = 1;
    const BLOB_LEN: usize = 16;

    /// Samples further than this from the zero-rate estimate count as motion
    pub const REST_BAND: f32 = 8.0;

    /// Drift counts per calibration byte step
    pub const COUNTS_PER_STEP: f32 = 4.0;

    /// Weight cap of the running average
    const MAX_WINDOW: u32 = 64;

    pub fn new() -> Self {
        Self {
            base_byte: DEFAULT_CALIBRATION_BYTE,
            calibration_byte: DEFAULT_CALIBRATION_BYTE,
            zero_rate: MOTION_CENTER as f32,
            samples: 0,
        }
    }

    pub fn zero_rate(&self) -> f32 {
        self.zero_rate
    }

    fn recompute_byte(&mut self) {
        let steps = ((self.zero_rate - MOTION_CENTER as f32) / Self::COUNTS_PER_STEP).round();
        self.calibration_byte = (self.base_byte as f32 + steps).clamp(0.0, 255.0) as u8;
    }
}

impl Default for DriftCalibrator {
    fn default() -> Self {
        Self::new()
    }
}

impl CalibrationService for DriftCalibrator {
    fn seed(&mut self, gyro_bias: u16, gyro_zero: u16) -> Result<u8, CalibrationError> {
        if gyro_zero as i32 > MOTION_MAX {
            return Err(CalibrationError::Service(1));
        }

        self.base_byte = gyro_bias.min(u8::MAX as u16) as u8;
        self.zero_rate = gyro_zero as f32;
        self.samples = 0;
        self.recompute_byte();
        Ok(self.calibration_byte)
    }

    fn refine(&mut self, raw_gyro: u16) -> Result<u8, CalibrationError> {
        if raw_gyro as i32 > MOTION_MAX {
            return Err(CalibrationError::Service(2));
        }

        let sample = raw_gyro as f32;
        if (sample - self.zero_rate).abs() < Self::REST_BAND {
            self.samples = self.samples.saturating_add(1);
            let window = self.samples.min(Self::MAX_WINDOW) as f32;
            self.zero_rate += (sample - self.zero_rate) / window;
            self.recompute_byte();
        }

        Ok(self.calibration_byte)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut blob = Vec::with_capacity(Self::BLOB_LEN);
        blob.push(Self::BLOB_VERSION);
        blob.push(self.calibration_byte);
        blob.push(self.base_byte);
        blob.push(0);
        blob.extend_from_slice(&self.zero_rate.to_le_bytes());
        blob.extend_from_slice(&self.samples.to_le_bytes());
        blob.extend_from_slice(&[0; 4]);
        blob
    }

    fn restore(&mut self, blob: &[u8]) -> Result<u8, CalibrationError> {
        if blob.len() != Self::BLOB_LEN {
            return Err(CalibrationError::BlobLength {
                expected: Self::BLOB_LEN,
                actual: blob.len(),
            });
        }
        if blob[0] != Self::BLOB_VERSION {
            return Err(CalibrationError::BlobVersion(blob[0]));
        }

        self.calibration_byte = blob[1];
        self.base_byte = blob[2];
        self.zero_rate = f32::from_le_bytes([blob[4], blob[5], blob[6], blob[7]]);
        self.samples = u32::from_le_bytes([blob[8], blob[9], blob[10], blob[11]]);
        Ok(self.calibration_byte)
    }

    fn state_len(&self) -> usize {
        Self::BLOB_LEN
    }
}

/// Per-device calibration engine
pub struct CalibrationEngine {
    address: DeviceAddress,
    constants: EepromCalibration,
    has_eeprom: bool,
    service: Box<dyn CalibrationService>,
    store: Arc<dyn KeyValueStore>,
    flags: ReportFlags,
    stamp: Arc<CalibrationStamp>,
    last_persisted: Option<u8>,
    phase: CalibrationPhase,
}

impl CalibrationEngine {
    /// Create an engine from an EEPROM snapshot, or neutral constants when none is cached
    pub fn new(
        address: DeviceAddress,
        eeprom: Option<&[u8]>,
        service: Box<dyn CalibrationService>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let parsed = match eeprom {
            Some(bytes) => match EepromCalibration::parse(bytes) {
                Ok(constants) => Some(constants),
                Err(e) => {
                    warn!("Ignoring EEPROM snapshot for {}: {}", address, e);
                    None
                }
            },
            None => {
                warn!(
                    "No EEPROM snapshot for {}, motion data stays uncalibrated",
                    address
                );
                None
            }
        };

        Self {
            address,
            has_eeprom: parsed.is_some(),
            constants: parsed.unwrap_or_default(),
            service,
            store,
            flags: ReportFlags::default(),
            stamp: Arc::new(CalibrationStamp::default()),
            last_persisted: None,
            phase: CalibrationPhase::Uninitialized,
        }
    }

    /// Classify the pad from its status snapshot and seed the gyro calibration.
    ///
    /// Flags are committed only on success; a failed seed leaves the engine
    /// uninitialized with default flags, and the session discards it.
    pub fn initial_calibrate(&mut self, status: Option<&[u8]>) -> Result<(), CalibrationError> {
        let mut flags = ReportFlags::default();

        match status {
            None => {
                // Nothing to classify by, assume the full variant set
                flags = ReportFlags {
                    legacy_revision: true,
                    motor_free: true,
                    gyro_slot_b: true,
                };
                self.seed()?;
            }
            Some(status) => {
                if status.len() < STATUS_LEN {
                    return Err(CalibrationError::TooShort {
                        what: "status snapshot",
                        expected: STATUS_LEN,
                        actual: status.len(),
                    });
                }

                flags.legacy_revision = status[8..12].iter().all(|b| *b == LEGACY_REVISION_MARKER);

                let c = STATUS_CALIBRATION_FIELDS;
                let marked = (status[c] == 1 && status[c + 1] == 2)
                    || (status[c + 1] == 1 && status[c + 2] == 2);
                if marked {
                    flags.motor_free = true;
                } else {
                    self.seed()?;
                }

                let field_count = status[c - 1] as usize;
                let slot_b = status[c..STATUS_LEN]
                    .iter()
                    .take(field_count)
                    .any(|field| *field == GYRO_SLOT_B_FIELD);
                if slot_b {
                    flags.motor_free = true;
                    flags.gyro_slot_b = true;
                    self.seed()?;
                }
            }
        }

        self.flags = flags;
        self.stamp.set_flags(flags);
        debug!("Calibration flags for {}: {:?}", self.address, flags);

        self.recover_persisted();
        self.phase = CalibrationPhase::Initialized;
        Ok(())
    }

    fn seed(&mut self) -> Result<(), CalibrationError> {
        let gyro = self.constants.gyro;
        let value = self.service.seed(gyro.val2, gyro.val1)?;
        self.stamp.set_calibration_byte(value);
        Ok(())
    }

    fn recover_persisted(&mut self) {
        match self.store.get(Table::Ds3Calibration, &self.address) {
            Ok(Some(blob)) => match self.service.restore(&blob) {
                Ok(value) => {
                    self.stamp.set_calibration_byte(value);
                    self.last_persisted = Some(value);
                    info!(
                        "Recovered gyro calibration for {} (byte 0x{:02X})",
                        self.address, value
                    );
                }
                Err(e) => warn!("Discarding stored calibration for {}: {}", self.address, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Calibration store unavailable for {}: {}", self.address, e),
        }
    }

    /// Calibrate the motion words of an inbound report in place.
    ///
    /// `offset` points at the start of the HID payload. Values are written back
    /// as 10-bit words, little-endian on Bluetooth and big-endian on USB.
    pub fn apply_to_inbound_report(
        &mut self,
        frame: &mut [u8],
        offset: usize,
        connection: ConnectionType,
    ) -> Result<(), CalibrationError> {
        let end = offset + payload::GYRO + 2;
        if frame.len() < end {
            return Err(CalibrationError::TooShort {
                what: "input report",
                expected: end,
                actual: frame.len(),
            });
        }

        let mut idx = offset + payload::MOTION_START;
        for pair in [self.constants.x, self.constants.y, self.constants.z] {
            let raw = u16::from_be_bytes([frame[idx], frame[idx + 1]]);
            write_motion_word(frame, idx, calibrate_axis(raw, pair), connection);
            idx += 2;
        }

        let raw = u16::from_be_bytes([frame[idx], frame[idx + 1]]);
        let mut gyro = raw as i32;

        if self.flags.motor_free && !self.flags.gyro_slot_b {
            gyro = (self.constants.gyro.val1 as i32 - gyro + MOTION_CENTER).clamp(0, MOTION_MAX);
        }

        if !self.flags.motor_free || self.flags.gyro_slot_b {
            match self.service.refine(gyro as u16) {
                Ok(value) => self.stamp.set_calibration_byte(value),
                Err(e) => debug!("Gyro refine failed for {}: {}", self.address, e),
            }
        }

        if self.flags.gyro_slot_b {
            gyro = (MOTION_MAX - gyro).clamp(0, MOTION_MAX);
        }

        write_motion_word(frame, idx, gyro as u16, connection);

        self.phase = CalibrationPhase::SteadyState;
        self.persist_if_changed();
        Ok(())
    }

    /// Stamp marker and calibration bytes into the periodic output command
    pub fn apply_to_outbound_report(&self, buffer: &mut [u8], offset: usize) {
        self.stamp.apply(buffer, offset);
    }

    /// Upsert the service state when the calibration byte moved since the last write
    fn persist_if_changed(&mut self) {
        let current = self.stamp.calibration_byte();
        if !self.has_eeprom || self.last_persisted == Some(current) {
            return;
        }

        let blob = self.service.serialize();
        match self.store.get(Table::Ds3Calibration, &self.address) {
            Ok(Some(existing)) if existing == blob => {
                self.last_persisted = Some(current);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Skipping calibration save for {}: {}", self.address, e);
                return;
            }
        }

        match self.store.upsert(Table::Ds3Calibration, &self.address, &blob) {
            Ok(()) => {
                debug!(
                    "Persisted gyro calibration for {} (byte 0x{:02X})",
                    self.address, current
                );
                self.last_persisted = Some(current);
            }
            Err(e) => warn!("Skipping calibration save for {}: {}", self.address, e),
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn constants(&self) -> &EepromCalibration {
        &self.constants
    }

    pub fn has_eeprom(&self) -> bool {
        self.has_eeprom
    }

    pub fn flags(&self) -> ReportFlags {
        self.flags
    }

    pub fn phase(&self) -> CalibrationPhase {
        self.phase
    }

    pub fn calibration_byte(&self) -> u8 {
        self.stamp.calibration_byte()
    }

    pub fn last_persisted(&self) -> Option<u8> {
        self.last_persisted
    }

    /// Handle for stamping output commands without borrowing the engine
    pub fn stamp(&self) -> Arc<CalibrationStamp> {
        Arc::clone(&self.stamp)
    }
}

/// Write a 10-bit motion value in the byte order of the frame's transport
fn write_motion_word(frame: &mut [u8], idx: usize, value: u16, connection: ConnectionType) {
    let low = (value & 0xFF) as u8;
    let high = ((value >> 8) & 0x3F) as u8;
    match connection {
        ConnectionType::Usb => {
            frame[idx] = high;
            frame[idx + 1] = low;
        }
        ConnectionType::Bluetooth | ConnectionType::None => {
            frame[idx] = low;
            frame[idx + 1] = high;
        }
    }
}

/// Size check helper for callers holding a cached EEPROM+status row
pub fn split_snapshot(row: &[u8]) -> Option<(&[u8], &[u8])> {
    if row.len() < EEPROM_LEN + STATUS_LEN {
        return None;
    }
    Some((&row[..EEPROM_LEN], &row[EEPROM_LEN..EEPROM_LEN + STATUS_LEN]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ds3::store::MemoryStore;
    use std::collections::VecDeque;

    const ADDR: DeviceAddress = DeviceAddress([0x00, 0x1B, 0xDC, 0x01, 0x02, 0x03]);

    /// Service returning canned calibration bytes
    struct ScriptedService {
        seed_result: Result<u8, i32>,
        refine_results: VecDeque<u8>,
        seeds: usize,
    }

    impl ScriptedService {
        fn new(seed: u8, refine: &[u8]) -> Self {
            Self {
                seed_result: Ok(seed),
                refine_results: refine.iter().copied().collect(),
                seeds: 0,
            }
        }
    }

    impl CalibrationService for ScriptedService {
        fn seed(&mut self, _bias: u16, _zero: u16) -> Result<u8, CalibrationError> {
            self.seeds += 1;
            self.seed_result.map_err(CalibrationError::Service)
        }

        fn refine(&mut self, _raw: u16) -> Result<u8, CalibrationError> {
            self.refine_results.pop_front().ok_or(CalibrationError::Service(5))
        }

        fn serialize(&self) -> Vec<u8> {
            vec![0xCA, self.refine_results.len() as u8]
        }

        fn restore(&mut self, blob: &[u8]) -> Result<u8, CalibrationError> {
            blob.get(1).copied().ok_or(CalibrationError::BlobLength {
                expected: 2,
                actual: blob.len(),
            })
        }

        fn state_len(&self) -> usize {
            2
        }
    }

    fn eeprom_with(pairs: [(u16, u16); 4]) -> Vec<u8> {
        let mut eeprom = vec![0u8; EEPROM_LEN];
        let mut idx = EEPROM_CALIBRATION_OFFSET;
        for (v1, v2) in pairs {
            eeprom[idx..idx + 2].copy_from_slice(&v1.to_be_bytes());
            eeprom[idx + 2..idx + 4].copy_from_slice(&v2.to_be_bytes());
            idx += 4;
        }
        eeprom
    }

    /// Status snapshot with the explicit calibration marker present
    fn marked_status() -> Vec<u8> {
        let mut status = vec![0u8; STATUS_LEN];
        status[0x25] = 2;
        status[0x26] = 1;
        status[0x27] = 2;
        status
    }

    fn frame_with_motion(accel: [u16; 3], gyro: u16) -> Vec<u8> {
        let mut frame = vec![0u8; 49];
        let mut idx = payload::MOTION_START;
        for v in accel.iter().chain(std::iter::once(&gyro)) {
            frame[idx..idx + 2].copy_from_slice(&v.to_be_bytes());
            idx += 2;
        }
        frame
    }

    #[test]
    fn test_calibrate_axis_linear_map() {
        let pair = CalPair { val1: 600, val2: 400 };
        // 113 * ((500 - 600) * 1024 / 200) / 1024 + 512 = 113 * -512 / 1024 + 512
        assert_eq!(calibrate_axis(500, pair), 456);
        assert_eq!(calibrate_axis(600, pair), 512);
    }

    #[test]
    fn test_calibrate_axis_clamps_and_passes_through() {
        let pair = CalPair { val1: 600, val2: 590 };
        assert_eq!(calibrate_axis(0, pair), 0);
        assert_eq!(calibrate_axis(1023, pair), 1023);

        let equal = CalPair { val1: 500, val2: 500 };
        assert_eq!(calibrate_axis(777, equal), 777);
    }

    #[test]
    fn test_eeprom_parse() {
        let eeprom = eeprom_with([(600, 400), (610, 410), (620, 420), (500, 0x7E)]);
        let parsed = EepromCalibration::parse(&eeprom).unwrap();
        assert_eq!(parsed.x, CalPair { val1: 600, val2: 400 });
        assert_eq!(parsed.z, CalPair { val1: 620, val2: 420 });
        assert_eq!(parsed.gyro, CalPair { val1: 500, val2: 0x7E });

        assert!(EepromCalibration::parse(&eeprom[..20]).is_err());
    }

    #[test]
    fn test_missing_eeprom_uses_defaults() {
        let engine = CalibrationEngine::new(
            ADDR,
            None,
            Box::new(DriftCalibrator::new()),
            Arc::new(MemoryStore::new()),
        );
        assert!(!engine.has_eeprom());
        assert_eq!(*engine.constants(), EepromCalibration::default());
        assert_eq!(engine.phase(), CalibrationPhase::Uninitialized);
    }

    #[test]
    fn test_initial_calibrate_with_marker_skips_seed() {
        let eeprom = eeprom_with([(600, 400); 4]);
        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom),
            Box::new(ScriptedService::new(0x90, &[])),
            Arc::new(MemoryStore::new()),
        );

        engine.initial_calibrate(Some(&marked_status())).unwrap();
        let flags = engine.flags();
        assert!(flags.motor_free);
        assert!(!flags.gyro_slot_b);
        assert!(!flags.legacy_revision);
        assert_eq!(engine.calibration_byte(), DEFAULT_CALIBRATION_BYTE);
        assert_eq!(engine.phase(), CalibrationPhase::Initialized);
    }

    #[test]
    fn test_initial_calibrate_without_marker_seeds() {
        let mut status = vec![0u8; STATUS_LEN];
        status[8..12].copy_from_slice(&[0x18; 4]);

        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(600, 400); 4])),
            Box::new(ScriptedService::new(0x91, &[])),
            Arc::new(MemoryStore::new()),
        );
        engine.initial_calibrate(Some(&status)).unwrap();

        assert!(engine.flags().legacy_revision);
        assert!(!engine.flags().motor_free);
        assert_eq!(engine.calibration_byte(), 0x91);

        let mut out = [0u8; 10];
        engine.apply_to_outbound_report(&mut out, 2);
        assert_eq!(out[5], 0xFF);
        assert_eq!(out[6], 0x91);
        assert_eq!(out[7], 0x00);
    }

    #[test]
    fn test_gyro_slot_b_field() {
        let mut status = marked_status();
        status[0x25] = 3;
        status[0x28] = GYRO_SLOT_B_FIELD;

        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(600, 400); 4])),
            Box::new(ScriptedService::new(0x84, &[])),
            Arc::new(MemoryStore::new()),
        );
        engine.initial_calibrate(Some(&status)).unwrap();

        assert!(engine.flags().motor_free);
        assert!(engine.flags().gyro_slot_b);

        let mut out = [0u8; 10];
        engine.apply_to_outbound_report(&mut out, 2);
        assert_eq!(&out[5..9], &[0x00, 0x00, 0xFF, 0x84]);
    }

    #[test]
    fn test_seed_failure_propagates() {
        let mut service = ScriptedService::new(0, &[]);
        service.seed_result = Err(3);

        let mut engine = CalibrationEngine::new(
            ADDR,
            None,
            Box::new(service),
            Arc::new(MemoryStore::new()),
        );
        let err = engine.initial_calibrate(None).unwrap_err();
        assert!(matches!(err, CalibrationError::Service(3)));
        assert_eq!(engine.phase(), CalibrationPhase::Uninitialized);
    }

    #[test]
    fn test_seed_failure_discards_partial_flags() {
        let mut service = ScriptedService::new(0, &[]);
        service.seed_result = Err(4);

        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(0, 0); 4])),
            Box::new(service),
            Arc::new(MemoryStore::new()),
        );

        // legacy revision, no calibration marker
        let mut status = vec![0u8; STATUS_LEN];
        status[8..12].fill(LEGACY_REVISION_MARKER);
        assert!(engine.initial_calibrate(Some(&status)).is_err());

        assert_eq!(engine.flags(), ReportFlags::default());
        assert_eq!(engine.stamp().calibration_byte(), DEFAULT_CALIBRATION_BYTE);

        let mut out = [0u8; 12];
        engine.stamp().apply(&mut out, 2);
        assert_eq!(&out[5..7], &[0xFF, DEFAULT_CALIBRATION_BYTE]);
    }

    #[test]
    fn test_inbound_writes_little_endian_on_bluetooth() {
        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(600, 400), (500, 500), (600, 400), (512, 0x80)])),
            Box::new(ScriptedService::new(0x80, &[])),
            Arc::new(MemoryStore::new()),
        );
        engine.initial_calibrate(Some(&marked_status())).unwrap();

        let mut frame = frame_with_motion([500, 700, 600], 520);
        engine
            .apply_to_inbound_report(&mut frame, 0, ConnectionType::Bluetooth)
            .unwrap();

        let idx = payload::MOTION_START;
        assert_eq!(u16::from_le_bytes([frame[idx], frame[idx + 1]]), 456);
        assert_eq!(u16::from_le_bytes([frame[idx + 2], frame[idx + 3]]), 700);
        assert_eq!(u16::from_le_bytes([frame[idx + 4], frame[idx + 5]]), 512);
        // motor-free gyro: 512 - 520 + 512
        assert_eq!(u16::from_le_bytes([frame[idx + 6], frame[idx + 7]]), 504);
        assert_eq!(engine.phase(), CalibrationPhase::SteadyState);
    }

    #[test]
    fn test_inbound_keeps_big_endian_on_usb() {
        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(600, 400); 4])),
            Box::new(ScriptedService::new(0x80, &[])),
            Arc::new(MemoryStore::new()),
        );
        engine.initial_calibrate(Some(&marked_status())).unwrap();

        let mut frame = frame_with_motion([500, 500, 500], 600);
        engine
            .apply_to_inbound_report(&mut frame, 0, ConnectionType::Usb)
            .unwrap();

        let idx = payload::MOTION_START;
        assert_eq!(u16::from_be_bytes([frame[idx], frame[idx + 1]]), 456);
    }

    #[test]
    fn test_refined_byte_is_persisted_once() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(600, 400); 4])),
            Box::new(ScriptedService::new(0x80, &[0x81, 0x81, 0x82])),
            store.clone(),
        );
        engine.initial_calibrate(Some(&vec![0u8; STATUS_LEN])).unwrap();
        assert_eq!(engine.last_persisted(), None);

        let mut frame = frame_with_motion([512; 3], 512);
        engine
            .apply_to_inbound_report(&mut frame, 0, ConnectionType::Bluetooth)
            .unwrap();
        assert_eq!(engine.last_persisted(), Some(0x81));
        let first = store.get(Table::Ds3Calibration, &ADDR).unwrap().unwrap();

        let mut frame = frame_with_motion([512; 3], 512);
        engine
            .apply_to_inbound_report(&mut frame, 0, ConnectionType::Bluetooth)
            .unwrap();
        assert_eq!(store.get(Table::Ds3Calibration, &ADDR).unwrap().unwrap(), first);

        let mut frame = frame_with_motion([512; 3], 512);
        engine
            .apply_to_inbound_report(&mut frame, 0, ConnectionType::Bluetooth)
            .unwrap();
        assert_eq!(engine.last_persisted(), Some(0x82));
        assert_ne!(store.get(Table::Ds3Calibration, &ADDR).unwrap().unwrap(), first);
    }

    #[test]
    fn test_no_persistence_without_eeprom() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = CalibrationEngine::new(
            ADDR,
            None,
            Box::new(ScriptedService::new(0x80, &[0x90])),
            store.clone(),
        );
        engine.initial_calibrate(Some(&vec![0u8; STATUS_LEN])).unwrap();

        let mut frame = frame_with_motion([512; 3], 512);
        engine
            .apply_to_inbound_report(&mut frame, 0, ConnectionType::Bluetooth)
            .unwrap();
        assert_eq!(engine.calibration_byte(), 0x90);
        assert_eq!(store.len(Table::Ds3Calibration), 0);
    }

    #[test]
    fn test_persisted_blob_is_recovered() {
        let store = Arc::new(MemoryStore::new());
        store.upsert(Table::Ds3Calibration, &ADDR, &[0xCA, 0x87]).unwrap();

        let mut engine = CalibrationEngine::new(
            ADDR,
            Some(&eeprom_with([(600, 400); 4])),
            Box::new(ScriptedService::new(0x80, &[])),
            store,
        );
        engine.initial_calibrate(Some(&vec![0u8; STATUS_LEN])).unwrap();

        assert_eq!(engine.calibration_byte(), 0x87);
        assert_eq!(engine.last_persisted(), Some(0x87));
    }

    #[test]
    fn test_drift_calibrator_tracks_rest_and_round_trips() {
        let mut cal = DriftCalibrator::new();
        assert_eq!(cal.seed(0x80, 512).unwrap(), 0x80);

        for _ in 0..200 {
            cal.refine(516).unwrap();
        }
        assert!((cal.zero_rate() - 516.0).abs() < 0.5);
        assert_eq!(cal.refine(516).unwrap(), 0x81);

        // motion outside the rest band leaves the estimate alone
        let before = cal.zero_rate();
        cal.refine(900).unwrap();
        assert_eq!(cal.zero_rate(), before);

        let blob = cal.serialize();
        assert_eq!(blob.len(), cal.state_len());

        let mut restored = DriftCalibrator::new();
        assert_eq!(restored.restore(&blob).unwrap(), 0x81);
        assert_eq!(restored.zero_rate(), cal.zero_rate());

        assert!(restored.restore(&blob[..4]).is_err());
        assert!(matches!(cal.seed(0x80, 2000), Err(CalibrationError::Service(1))));
    }

    #[test]
    fn test_split_snapshot() {
        let row = vec![1u8; EEPROM_LEN + STATUS_LEN];
        let (eeprom, status) = split_snapshot(&row).unwrap();
        assert_eq!(eeprom.len(), EEPROM_LEN);
        assert_eq!(status.len(), STATUS_LEN);
        assert!(split_snapshot(&row[..50]).is_none());
    }
}
