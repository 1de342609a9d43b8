//! Pad-data packet encoding
//!
//! Layout after the 16-byte header (100 bytes total):
//! - message type, slot id, state, model, connection type, address, battery
//! - pad-active flag and packet counter
//! - two button bytes, PS and touchpad-click bytes
//! - four stick bytes, twelve analog pressure bytes
//! - two touch points, u64 motion timestamp
//! - accelerometer and gyroscope as f32 triples

use crate::config::PadSettings;
use crate::ds3::types::{Axis, Button, Model, NormalizedReport, TouchPoint};
use crate::server::codec::{self, Magic, MessageType};

pub const PAD_DATA_PACKET_LEN: usize = 100;

/// Value both stick bytes take inside the dead zone
const DEAD_ZONE_CENTER: u8 = 0x7F;

/// Encoder knobs taken from the pad settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WireSettings {
    pub dead_zone_left: u8,
    pub dead_zone_right: u8,
    pub flip_lx: bool,
    pub flip_ly: bool,
    pub flip_rx: bool,
    pub flip_ry: bool,
    pub swap_triggers: bool,
}

impl From<&PadSettings> for WireSettings {
    fn from(pads: &PadSettings) -> Self {
        Self {
            dead_zone_left: pads.dead_zone_left,
            dead_zone_right: pads.dead_zone_right,
            flip_lx: pads.flip_lx,
            flip_ly: pads.flip_ly,
            flip_rx: pads.flip_rx,
            flip_ry: pads.flip_ry,
            swap_triggers: pads.swap_triggers,
        }
    }
}

/// True when the stick sits inside a circle of radius `radius` around centre
pub fn in_dead_zone(radius: u8, x: u8, y: u8) -> bool {
    let dx = x as i32 - 0x80;
    let dy = y as i32 - 0x80;
    dx * dx + dy * dy <= radius as i32 * radius as i32
}

/// Encode a report into a finalized pad-data packet.
///
/// Returns `None` for models the wire format has no layout for.
pub fn encode_pad_data(report: &NormalizedReport, settings: &WireSettings, server_id: u32) -> Option<Vec<u8>> {
    let mut body = Vec::with_capacity(PAD_DATA_PACKET_LEN - codec::HEADER_LEN - 4);

    body.push(report.pad_id as u8);
    body.push(report.state as u8);
    body.push(report.model as u8);
    body.push(report.connection_type as u8);
    body.extend_from_slice(report.address.as_bytes());
    body.push(report.battery as u8);
    body.push(u8::from(report.is_pad_active()));
    body.extend_from_slice(&report.packet_counter.to_le_bytes());

    encode_controls(report, settings, &mut body)?;

    for touch in report.touches {
        encode_touch(touch, &mut body);
    }

    body.extend_from_slice(&report.timestamp.to_le_bytes());

    match report.accelerometer {
        Some(a) => [a.x, a.y, a.z].iter().for_each(|v| body.extend_from_slice(&v.to_le_bytes())),
        None => body.extend_from_slice(&[0; 12]),
    }
    match report.gyroscope {
        Some(g) => [g.pitch, g.yaw, g.roll]
            .iter()
            .for_each(|v| body.extend_from_slice(&v.to_le_bytes())),
        None => body.extend_from_slice(&[0; 12]),
    }

    Some(codec::message(Magic::Server, server_id, MessageType::PadData, &body))
}

/// Buttons, sticks and pressures
fn encode_controls(report: &NormalizedReport, settings: &WireSettings, out: &mut Vec<u8>) -> Option<()> {
    if !matches!(report.model, Model::DS3 | Model::DS4) {
        return None;
    }

    out.push(button_bits(report, &[
        (Button::Left, 0x80),
        (Button::Down, 0x40),
        (Button::Right, 0x20),
        (Button::Up, 0x10),
        (Button::Start, 0x08),
        (Button::R3, 0x04),
        (Button::L3, 0x02),
        (Button::Select, 0x01),
    ]));
    out.push(button_bits(report, &[
        (Button::Square, 0x80),
        (Button::Cross, 0x40),
        (Button::Circle, 0x20),
        (Button::Triangle, 0x10),
        (Button::R1, 0x08),
        (Button::L1, 0x04),
        (Button::R2, 0x02),
        (Button::L2, 0x01),
    ]));

    out.push(u8::from(report.is_pressed(Button::Ps)));
    out.push(match report.model {
        Model::DS4 => u8::from(report.is_pressed(Button::TouchPad)),
        _ => 0,
    });

    encode_stick(
        report.axis(Axis::Lx),
        report.axis(Axis::Ly),
        settings.dead_zone_left,
        settings.flip_lx,
        settings.flip_ly,
        out,
    );
    encode_stick(
        report.axis(Axis::Rx),
        report.axis(Axis::Ry),
        settings.dead_zone_right,
        settings.flip_rx,
        settings.flip_ry,
        out,
    );

    let (first_trigger, second_trigger) = if settings.swap_triggers {
        (Axis::L2, Axis::R2)
    } else {
        (Axis::R2, Axis::L2)
    };

    match report.model {
        Model::DS3 => {
            for axis in [
                Axis::Left,
                Axis::Down,
                Axis::Right,
                Axis::Up,
                Axis::Square,
                Axis::Cross,
                Axis::Circle,
                Axis::Triangle,
                Axis::R1,
                Axis::L1,
            ] {
                out.push(report.axis(axis));
            }
        }
        // No pressure sensors, digital buttons stand in
        _ => {
            for button in [
                Button::Left,
                Button::Down,
                Button::Right,
                Button::Up,
                Button::Square,
                Button::Cross,
                Button::Circle,
                Button::Triangle,
                Button::R1,
                Button::L1,
            ] {
                out.push(report.button_value(button));
            }
        }
    }
    out.push(report.axis(first_trigger));
    out.push(report.axis(second_trigger));

    Some(())
}

fn button_bits(report: &NormalizedReport, pairs: &[(Button, u8)]) -> u8 {
    pairs
        .iter()
        .filter(|(button, _)| report.is_pressed(*button))
        .fold(0, |acc, (_, bit)| acc | bit)
}

/// X inverts when its flag is set, Y inverts when its flag is clear
fn encode_stick(x: u8, y: u8, dead_zone: u8, flip_x: bool, flip_y: bool, out: &mut Vec<u8>) {
    if in_dead_zone(dead_zone, x, y) {
        out.extend_from_slice(&[DEAD_ZONE_CENTER, DEAD_ZONE_CENTER]);
        return;
    }

    out.push(if flip_x { 255 - x } else { x });
    out.push(if flip_y { y } else { 255 - y });
}

fn encode_touch(touch: Option<TouchPoint>, out: &mut Vec<u8>) {
    match touch {
        Some(t) => {
            out.push(u8::from(t.active));
            out.push(t.id);
            out.extend_from_slice(&t.x.to_le_bytes());
            out.extend_from_slice(&t.y.to_le_bytes());
        }
        None => out.extend_from_slice(&[0; 6]),
    }
}
