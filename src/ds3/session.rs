//! DualShock 3 Bluetooth session
//!
//! One session per connected pad. Handles:
//! - HID enable and the service-record init handshake
//! - Inbound frame parsing into [`NormalizedReport`]s (calibration applied in place)
//! - Rumble and LED output with latency-limited send scheduling
//! - Quick-disconnect chord and idle tracking for external collaborators
//!
//! Inbound state and the outbound command buffer sit behind separate locks.
//! Lock order is inbound before outbound; the periodic tick never blocks on
//! the outbound buffer.

use crate::config::{LedMode, PadSettings};
use crate::ds3::calibration::{
    split_snapshot, CalibrationEngine, CalibrationError, CalibrationService, CalibrationStamp,
    DriftCalibrator, ACCEL_COUNTS_PER_G, MOTION_CENTER,
};
use crate::ds3::constants::*;
use crate::ds3::store::{KeyValueStore, Table};
use crate::ds3::transport::{HidChannel, HidTransport, TransportError};
use crate::ds3::types::{
    Accelerometer, Axis, Battery, Button, ConnectionType, DeviceAddress, Gyroscope, Model,
    NormalizedReport, PadId, PadState,
};
use crossbeam_channel::{Sender, TrySendError};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, TryLockError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Gyro output in deg/s per count away from centre
pub const GYRO_DPS_PER_COUNT: f32 = 90.0 / 123.0;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Input frame has {len} bytes, expected at least {min}")]
    FrameTooShort { len: usize, min: usize },

    #[error("Calibration failed: {0}")]
    Calibration(#[from] CalibrationError),

    #[error("HID send failed: {0}")]
    Transport(#[from] TransportError),

    #[error("Session state lock poisoned")]
    Poisoned,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connected = 1,
    /// Service-record frames still being sent
    HidInitPending = 2,
    /// Handshake finished, input reports flowing
    HidActive = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connected,
            2 => SessionState::HidInitPending,
            3 => SessionState::HidActive,
            _ => SessionState::Disconnected,
        }
    }

    pub fn is_connected(self) -> bool {
        self != SessionState::Disconnected
    }
}

/// Per-session view of the pad settings
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub latency: Duration,
    pub led_mode: LedMode,
    pub flash_leds_on_low_battery: bool,
    pub custom_leds: [bool; 4],
    pub disable_rumble: bool,
    pub disconnect_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&PadSettings::default())
    }
}

impl From<&PadSettings> for SessionConfig {
    fn from(pads: &PadSettings) -> Self {
        Self {
            latency: Duration::from_millis(pads.latency_ms),
            led_mode: pads.led_mode,
            flash_leds_on_low_battery: pads.flash_leds_on_low_battery,
            custom_leds: pads.custom_leds,
            disable_rumble: pads.disable_rumble,
            disconnect_timeout: Duration::from_millis(pads.disconnect_timeout_ms),
        }
    }
}

struct Inbound {
    packet: u32,
    engine: Option<CalibrationEngine>,
    service: Option<Box<dyn CalibrationService>>,
    init_step: usize,
    idle_since: Option<Instant>,
    disconnect_armed: Option<Instant>,
    last_timestamp: u64,
}

struct Outbound {
    buffer: [u8; OUTPUT_REPORT_LEN],
    led_status: u8,
    led_counter: u8,
    queued: u8,
    blocked: bool,
    last_send: Instant,
    tick: Instant,
    stamp: Option<Arc<CalibrationStamp>>,
}

/// Bluetooth DS3 controller session
pub struct Ds3Session<T: HidTransport> {
    address: DeviceAddress,
    synthetic: bool,
    transport: T,
    store: Arc<dyn KeyValueStore>,
    config: SessionConfig,
    reports: Option<Sender<NormalizedReport>>,

    state: AtomicU8,
    slot: AtomicU8,
    battery: AtomicU8,
    plug_status: AtomicU8,
    cable_status: AtomicU8,
    packets: AtomicU32,

    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
}

impl<T: HidTransport> Ds3Session<T> {
    pub fn new(
        address: DeviceAddress,
        transport: T,
        store: Arc<dyn KeyValueStore>,
        config: SessionConfig,
    ) -> Self {
        let now = Instant::now();

        Self {
            address,
            synthetic: false,
            transport,
            store,
            config,
            reports: None,
            state: AtomicU8::new(SessionState::Disconnected as u8),
            slot: AtomicU8::new(PadId::None as u8),
            battery: AtomicU8::new(Battery::None as u8),
            plug_status: AtomicU8::new(0),
            cable_status: AtomicU8::new(0),
            packets: AtomicU32::new(0),
            inbound: Mutex::new(Inbound {
                packet: 0,
                engine: None,
                service: None,
                init_step: 0,
                idle_since: None,
                disconnect_armed: None,
                last_timestamp: 0,
            }),
            outbound: Mutex::new(Outbound {
                buffer: OUTPUT_REPORT_TEMPLATE,
                led_status: 0,
                led_counter: 0,
                queued: 0,
                blocked: false,
                last_send: now,
                tick: now,
                stamp: None,
            }),
        }
    }

    /// Forward every accepted report to a channel
    pub fn with_report_sender(mut self, sender: Sender<NormalizedReport>) -> Self {
        self.reports = Some(sender);
        self
    }

    /// Use a specific calibration service instead of [`DriftCalibrator`]
    pub fn with_calibration_service(self, service: Box<dyn CalibrationService>) -> Self {
        if let Ok(mut inbound) = self.inbound.lock() {
            inbound.service = Some(service);
        }
        self
    }

    /// Mark the peer as a synthetic or clone device (no EEPROM advisory)
    pub fn synthetic(mut self, synthetic: bool) -> Self {
        self.synthetic = synthetic;
        self
    }

    fn lock_inbound(&self) -> Result<MutexGuard<'_, Inbound>, SessionError> {
        self.inbound.lock().map_err(|_| SessionError::Poisoned)
    }

    fn lock_outbound(&self) -> Result<MutexGuard<'_, Outbound>, SessionError> {
        self.outbound.lock().map_err(|_| SessionError::Poisoned)
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Bring the session up and send the HID enable command.
    ///
    /// A calibration failure still leaves the session running uncalibrated;
    /// the error is returned so the caller can decide what to do with it.
    pub fn start(&self) -> Result<(), SessionError> {
        self.set_state(SessionState::Connected);

        let mut calibration_error = None;
        let stamp = {
            let mut inbound = self.lock_inbound()?;

            let row = match self.store.get(Table::Ds3Data, &self.address) {
                Ok(row) => row,
                Err(e) => {
                    warn!("Failed to load EEPROM snapshot for {}: {}", self.address, e);
                    None
                }
            };

            if let Some((eeprom, status)) = row.as_deref().and_then(split_snapshot) {
                let service = inbound
                    .service
                    .take()
                    .unwrap_or_else(|| Box::new(DriftCalibrator::new()));
                let mut engine =
                    CalibrationEngine::new(self.address, Some(eeprom), service, self.store.clone());

                match engine.initial_calibrate(Some(status)) {
                    Ok(()) => inbound.engine = Some(engine),
                    Err(e) => {
                        warn!("Initial calibration failed for {}: {}", self.address, e);
                        calibration_error = Some(e);
                    }
                }
            }

            if !self.synthetic && inbound.engine.is_none() {
                warn!(
                    "EEPROM data for DS3 controller {} not present, connect it via USB first",
                    self.address
                );
            }

            inbound.engine.as_ref().map(|engine| engine.stamp())
        };

        {
            let mut outbound = self.lock_outbound()?;
            outbound.stamp = stamp;
            outbound.queued = 1;
            outbound.blocked = true;
            outbound.last_send = Instant::now();
        }

        if let Err(e) = self.transport.send(HidChannel::Command, &HID_COMMAND_ENABLE) {
            if let Ok(mut outbound) = self.outbound.lock() {
                outbound.blocked = false;
            }
            return Err(e.into());
        }
        info!("DS3 {} connected", self.address);

        match calibration_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Advance the init handshake by one acknowledged step.
    ///
    /// Returns `true` exactly once, after the last service frame went out.
    pub fn init_hid_report(&self) -> Result<bool, SessionError> {
        let mut inbound = self.lock_inbound()?;
        let step = inbound.init_step;

        if step < HID_INIT_REPORTS.len() {
            self.set_state(SessionState::HidInitPending);
            self.transport.send(HidChannel::Service, HID_INIT_REPORTS[step])?;
            inbound.init_step += 1;
            debug!("DS3 {} init step {}/{}", self.address, step + 1, HID_INIT_REPORTS.len());
            Ok(false)
        } else if step == HID_INIT_REPORTS.len() {
            inbound.init_step += 1;
            self.set_state(SessionState::HidActive);
            info!("DS3 {} HID init complete", self.address);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Transport acknowledged the last output command
    pub fn send_completed(&self) {
        if let Ok(mut outbound) = self.outbound.lock() {
            outbound.blocked = false;
        }
    }

    /// Parse one Bluetooth input frame.
    ///
    /// Returns `Ok(None)` for idle frames the controller sends while it has nothing to report.
    pub fn parse_hid_report(&self, frame: &[u8]) -> Result<Option<NormalizedReport>, SessionError> {
        if frame.len() < BTH_FRAME_MIN_LEN {
            return Err(SessionError::FrameTooShort {
                len: frame.len(),
                min: BTH_FRAME_MIN_LEN,
            });
        }

        if frame[IDLE_MARKER_INDEX] == 0xFF {
            return Ok(None);
        }

        let now = Instant::now();

        self.plug_status.store(frame[PLUG_STATUS_INDEX], Ordering::Relaxed);
        self.battery.store(frame[BATTERY_INDEX], Ordering::Relaxed);
        self.cable_status.store(frame[CABLE_STATUS_INDEX], Ordering::Relaxed);

        let mut inbound = self.lock_inbound()?;

        if inbound.packet == 0 {
            if let Err(e) = self.rumble(0, 0) {
                warn!("Motor reset for {} failed: {}", self.address, e);
            }
        }
        inbound.packet = inbound.packet.wrapping_add(1);
        self.packets.store(inbound.packet, Ordering::Release);

        let mut frame = frame.to_vec();
        let calibrated = match inbound.engine.as_mut() {
            Some(engine) => {
                match engine.apply_to_inbound_report(&mut frame, BTH_PAYLOAD_OFFSET, ConnectionType::Bluetooth) {
                    Ok(()) => true,
                    Err(e) => {
                        debug!("Skipping motion calibration for {}: {}", self.address, e);
                        false
                    }
                }
            }
            None => false,
        };

        let mut report = NormalizedReport {
            pad_id: self.slot(),
            state: PadState::Connected,
            model: Model::DS3,
            connection_type: ConnectionType::Bluetooth,
            address: self.address,
            battery: self.battery(),
            packet_counter: inbound.packet,
            ..NormalizedReport::default()
        };
        decode_payload(
            &frame[BTH_PAYLOAD_OFFSET..BTH_PAYLOAD_OFFSET + PAYLOAD_LEN],
            calibrated,
            &mut report,
        );

        report.timestamp = monotonic_micros().max(inbound.last_timestamp);
        inbound.last_timestamp = report.timestamp;

        // Quick disconnect
        let trigger = report.is_pressed(Button::L1)
            && report.is_pressed(Button::R1)
            && report.is_pressed(Button::Ps);
        if trigger {
            report.unset(Button::Ps);
        }

        if report.is_pad_active() {
            inbound.idle_since = None;
        } else if inbound.idle_since.is_none() {
            inbound.idle_since = Some(now);
        }

        if trigger && inbound.disconnect_armed.is_none() {
            debug!("DS3 {} disconnect chord held", self.address);
            inbound.disconnect_armed = Some(now);
        } else if !trigger && inbound.disconnect_armed.is_some() {
            inbound.disconnect_armed = None;
        }

        drop(inbound);

        if let Some(sender) = &self.reports {
            match sender.try_send(report.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => debug!("Report channel full, dropping report"),
                Err(TrySendError::Disconnected(_)) => debug!("Report channel closed"),
            }
        }

        Ok(Some(report))
    }

    /// Set motor strengths; `small` is on/off on the DS3
    pub fn rumble(&self, large: u8, small: u8) -> Result<(), SessionError> {
        let mut outbound = self.lock_outbound()?;
        let out = &mut *outbound;

        out.buffer[RUMBLE_SMALL_MARKER..=RUMBLE_LARGE_VALUE].fill(0);

        if let Some(stamp) = &out.stamp {
            stamp.apply(&mut out.buffer, OUTPUT_CALIBRATION_OFFSET);
        }

        // Calibration owns the large-motor marker when it has stamped it
        if out.buffer[RUMBLE_LARGE_MARKER] != 0xFF {
            out.buffer[RUMBLE_SMALL_MARKER] = 0xFF;
            out.buffer[RUMBLE_LARGE_MARKER] = 0xFF;

            if self.config.disable_rumble {
                out.buffer[RUMBLE_SMALL_VALUE] = 0;
                out.buffer[RUMBLE_LARGE_VALUE] = 0;
            } else {
                out.buffer[RUMBLE_SMALL_VALUE] = u8::from(small > 0);
                out.buffer[RUMBLE_LARGE_VALUE] = large;
            }
        }

        out.buffer[LED_INDEX] = out.led_status;

        if out.blocked || !self.config.latency.is_zero() {
            out.queued = 1;
            return Ok(());
        }

        if let Err(e) = self.transport.send(HidChannel::Command, &out.buffer) {
            // retried on the next tick
            out.queued = 1;
            return Err(e.into());
        }
        out.last_send = Instant::now();
        out.blocked = true;

        Ok(())
    }

    /// Periodic tick: refresh LEDs and flush a queued output command.
    ///
    /// Returns `true` when a command was sent. Skips the tick when the
    /// output buffer is busy.
    pub fn process(&self, now: Instant) -> bool {
        let mut outbound = match self.outbound.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return false,
            Err(TryLockError::Poisoned(_)) => return false,
        };

        if !self.state().is_connected() {
            return false;
        }

        let out = &mut *outbound;
        let slot = self.slot().index();

        if now.saturating_duration_since(out.tick) >= Duration::from_millis(LED_TICK_MS)
            && self.packets.load(Ordering::Acquire) > 0
        {
            if let Some(slot) = slot {
                out.tick = now;
                if out.queued == 0 {
                    out.queued = 1;
                }

                out.led_status = led_status(&self.config, slot, self.battery(), &mut out.led_counter);
                out.buffer[LED_INDEX] = out.led_status;
            }
        }

        if let Some(stamp) = &out.stamp {
            stamp.apply(&mut out.buffer, OUTPUT_CALIBRATION_OFFSET);
        }

        if out.blocked || out.queued == 0 {
            return false;
        }

        if now.saturating_duration_since(out.last_send) < self.config.latency {
            return false;
        }

        match self.transport.send(HidChannel::Command, &out.buffer) {
            Ok(()) => {
                out.last_send = now;
                out.blocked = true;
                out.queued -= 1;
                true
            }
            Err(e) => {
                warn!("Output command to {} failed: {}", self.address, e);
                false
            }
        }
    }

    /// Bind the session to an output slot
    pub fn set_slot(&self, slot: PadId) {
        self.slot.store(slot as u8, Ordering::Release);
    }

    pub fn slot(&self) -> PadId {
        PadId::from_byte(self.slot.load(Ordering::Acquire)).unwrap_or(PadId::None)
    }

    pub fn close(&self) {
        self.set_state(SessionState::Disconnected);
        info!("DS3 {} disconnected", self.address);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn battery(&self) -> Battery {
        Battery::from(self.battery.load(Ordering::Relaxed))
    }

    pub fn plug_status(&self) -> u8 {
        self.plug_status.load(Ordering::Relaxed)
    }

    pub fn cable_status(&self) -> u8 {
        self.cable_status.load(Ordering::Relaxed)
    }

    pub fn packet_count(&self) -> u32 {
        self.packets.load(Ordering::Acquire)
    }

    pub fn is_calibrated(&self) -> bool {
        self.inbound.lock().map(|i| i.engine.is_some()).unwrap_or(false)
    }

    /// When the disconnect chord was first seen, if it is still held
    pub fn pending_disconnect(&self) -> Option<Instant> {
        self.inbound.lock().ok().and_then(|i| i.disconnect_armed)
    }

    /// True once the chord has been held for the configured timeout
    pub fn disconnect_due(&self, now: Instant) -> bool {
        self.pending_disconnect()
            .is_some_and(|armed| now.saturating_duration_since(armed) >= self.config.disconnect_timeout)
    }

    /// When the pad went idle, `None` while it is in use
    pub fn idle_since(&self) -> Option<Instant> {
        self.inbound.lock().ok().and_then(|i| i.idle_since)
    }

    /// Current output command, for inspection
    pub fn output_report(&self) -> [u8; OUTPUT_REPORT_LEN] {
        self.outbound
            .lock()
            .map(|o| o.buffer)
            .unwrap_or(OUTPUT_REPORT_TEMPLATE)
    }
}

/// LED byte for the configured mode
fn led_status(config: &SessionConfig, slot: usize, battery: Battery, counter: &mut u8) -> u8 {
    let mut toggle = || {
        *counter = (*counter + 1) % 2;
        *counter == 1
    };

    match config.led_mode {
        LedMode::Off => 0,
        LedMode::PadId => {
            if config.flash_leds_on_low_battery && battery == Battery::Low {
                if toggle() {
                    LED_OFFSETS[slot]
                } else {
                    0
                }
            } else {
                LED_OFFSETS[slot]
            }
        }
        LedMode::Battery => match battery {
            Battery::None => LED_OFFSETS[0] | LED_OFFSETS[3],
            Battery::Dying => LED_OFFSETS[1] | LED_OFFSETS[2],
            Battery::Low => {
                if toggle() {
                    LED_OFFSETS[0]
                } else {
                    0
                }
            }
            Battery::Medium => LED_OFFSETS[0] | LED_OFFSETS[1],
            Battery::High => LED_OFFSETS[0] | LED_OFFSETS[1] | LED_OFFSETS[2],
            Battery::Full => LED_OFFSETS.iter().fold(0, |acc, bit| acc | bit),
            Battery::Charging | Battery::Charged => 0,
        },
        LedMode::Custom => config
            .custom_leds
            .iter()
            .zip(LED_OFFSETS)
            .filter(|(on, _)| **on)
            .fold(0, |acc, (_, bit)| acc | bit),
    }
}

/// Decode a 49-byte DS3 payload into the report.
///
/// Motion words are little-endian after calibration wrote them back,
/// otherwise they keep the controller's big-endian order.
fn decode_payload(data: &[u8], calibrated: bool, report: &mut NormalizedReport) {
    report.buttons = data[payload::BUTTONS_1] as u32 | (data[payload::BUTTONS_2] as u32) << 8;
    report.set(Button::Ps, data[payload::PS_BUTTON] & 0x01 != 0);

    report.set_axis(Axis::Lx, data[payload::LX]);
    report.set_axis(Axis::Ly, data[payload::LY]);
    report.set_axis(Axis::Rx, data[payload::RX]);
    report.set_axis(Axis::Ry, data[payload::RY]);

    // Pressure bytes follow the Axis order from Up to Square
    let pressures = &data[payload::PRESSURE_START..payload::PRESSURE_START + 12];
    report.axes[Axis::Up as usize..].copy_from_slice(pressures);

    let word = |idx: usize| {
        let bytes = [data[idx], data[idx + 1]];
        let value = if calibrated {
            u16::from_le_bytes(bytes)
        } else {
            u16::from_be_bytes(bytes)
        };
        value as i32 - MOTION_CENTER
    };

    let m = payload::MOTION_START;
    let g = |counts: i32| counts as f32 / ACCEL_COUNTS_PER_G as f32;
    report.accelerometer = Some(Accelerometer {
        x: -g(word(m)),
        y: g(word(m + 2)),
        z: g(word(m + 4)),
    });
    report.gyroscope = Some(Gyroscope {
        pitch: 0.0,
        yaw: word(payload::GYRO) as f32 * GYRO_DPS_PER_COUNT,
        roll: 0.0,
    });
}

/// Microseconds since the first call in this process
fn monotonic_micros() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}
