//! DSU packet framing
//!
//! Every datagram starts with a 16-byte header:
//!
//! | bytes  | field                                   |
//! |--------|-----------------------------------------|
//! | 0..4   | magic, `DSUC` from clients, `DSUS` from servers |
//! | 4..6   | protocol version, u16 LE                |
//! | 6..8   | payload length (total - 16), u16 LE     |
//! | 8..12  | CRC32 of the packet with this field zeroed, u32 LE |
//! | 12..16 | sender id, u32 LE                       |
//!
//! The payload starts with the u32 LE message type.

use crate::ds3::types::{DeviceAddress, PadId};
use thiserror::Error;

pub const HEADER_LEN: usize = 16;
pub const MAX_PROTOCOL_VERSION: u16 = 1001;

const CRC_RANGE: std::ops::Range<usize> = 8..12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Packet has {0} bytes, shorter than the header")]
    TooShort(usize),

    #[error("Unexpected magic {0:?}")]
    BadMagic([u8; 4]),

    #[error("Unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("Packet declares {declared} bytes but only {actual} arrived")]
    Truncated { declared: usize, actual: usize },

    #[error("CRC mismatch: packet carries {expected:08X}, computed {actual:08X}")]
    Checksum { expected: u32, actual: u32 },

    #[error("Unknown message type {0:#08X}")]
    UnknownMessage(u32),

    #[error("Malformed request: {0}")]
    BadRequest(String),
}

/// Direction marker at the start of every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Client,
    Server,
}

impl Magic {
    pub fn bytes(self) -> &'static [u8; 4] {
        match self {
            Magic::Client => b"DSUC",
            Magic::Server => b"DSUS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    Version = 0x100000,
    PortInfo = 0x100001,
    PadData = 0x100002,
}

impl MessageType {
    pub fn from_u32(value: u32) -> Option<MessageType> {
        match value {
            0x100000 => Some(MessageType::Version),
            0x100001 => Some(MessageType::PortInfo),
            0x100002 => Some(MessageType::PadData),
            _ => None,
        }
    }
}

/// A validated packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub version: u16,
    pub sender_id: u32,
    /// Everything after the header, starting with the message type
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn message_type(&self) -> Option<u32> {
        read_u32(&self.payload, 0)
    }
}

/// Header plus payload with the CRC field zeroed.
///
/// The length field is 16 bits wide. DSU messages are at most a few hundred
/// bytes; a longer payload saturates the field at `u16::MAX`, which no peer
/// will accept.
pub fn build(magic: Magic, version: u16, sender_id: u32, payload: &[u8]) -> Vec<u8> {
    let declared = u16::try_from(payload.len()).unwrap_or(u16::MAX);

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(magic.bytes());
    buf.extend_from_slice(&version.to_le_bytes());
    buf.extend_from_slice(&declared.to_le_bytes());
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(&sender_id.to_le_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Compute the CRC over the whole buffer and store it in the header
pub fn finalize(buf: &mut [u8]) {
    if buf.len() < HEADER_LEN {
        return;
    }
    buf[CRC_RANGE].fill(0);
    let crc = crc32fast::hash(buf);
    buf[CRC_RANGE].copy_from_slice(&crc.to_le_bytes());
}

/// Build and finalize a message at the highest supported version
pub fn message(magic: Magic, sender_id: u32, message_type: MessageType, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + body.len());
    payload.extend_from_slice(&(message_type as u32).to_le_bytes());
    payload.extend_from_slice(body);

    let mut buf = build(magic, MAX_PROTOCOL_VERSION, sender_id, &payload);
    finalize(&mut buf);
    buf
}

/// Validate a datagram. Trailing bytes past the declared length are ignored.
pub fn parse(buf: &[u8], expected: Magic) -> Result<Packet, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::TooShort(buf.len()));
    }

    let magic = [buf[0], buf[1], buf[2], buf[3]];
    if &magic != expected.bytes() {
        return Err(CodecError::BadMagic(magic));
    }

    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version > MAX_PROTOCOL_VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let declared = HEADER_LEN + u16::from_le_bytes([buf[6], buf[7]]) as usize;
    if declared > buf.len() {
        return Err(CodecError::Truncated {
            declared,
            actual: buf.len(),
        });
    }

    let mut packet = buf[..declared].to_vec();
    let expected_crc = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    packet[CRC_RANGE].fill(0);
    let actual_crc = crc32fast::hash(&packet);
    if expected_crc != actual_crc {
        return Err(CodecError::Checksum {
            expected: expected_crc,
            actual: actual_crc,
        });
    }

    Ok(Packet {
        version,
        sender_id: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        payload: packet.split_off(HEADER_LEN),
    })
}

/// Client requests the server answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Version,
    ListPorts(Vec<PadId>),
    PadData {
        flags: u8,
        slot: u8,
        address: DeviceAddress,
    },
}

impl Request {
    /// Decode a validated payload
    pub fn decode(payload: &[u8]) -> Result<Request, CodecError> {
        let raw_type =
            read_u32(payload, 0).ok_or_else(|| CodecError::BadRequest("missing message type".into()))?;
        let message_type = MessageType::from_u32(raw_type).ok_or(CodecError::UnknownMessage(raw_type))?;
        let body = &payload[4..];

        match message_type {
            MessageType::Version => Ok(Request::Version),
            MessageType::PortInfo => {
                let count = read_u32(body, 0)
                    .map(|c| c as i32)
                    .ok_or_else(|| CodecError::BadRequest("missing port count".into()))?;
                if !(0..=4).contains(&count) {
                    return Err(CodecError::BadRequest(format!("port count {}", count)));
                }

                let ids = body
                    .get(4..4 + count as usize)
                    .ok_or_else(|| CodecError::BadRequest("port list truncated".into()))?;

                // One bad id drops the whole request
                ids.iter()
                    .map(|id| {
                        PadId::from_byte(*id)
                            .ok_or_else(|| CodecError::BadRequest(format!("slot {}", id)))
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map(Request::ListPorts)
            }
            MessageType::PadData => {
                if body.len() < 8 {
                    return Err(CodecError::BadRequest("pad data request truncated".into()));
                }
                let mut address = [0u8; 6];
                address.copy_from_slice(&body[2..8]);
                Ok(Request::PadData {
                    flags: body[0],
                    slot: body[1],
                    address: DeviceAddress(address),
                })
            }
        }
    }

    /// Client-side encoding, used by tools and tests
    pub fn encode(&self, client_id: u32) -> Vec<u8> {
        match self {
            Request::Version => message(Magic::Client, client_id, MessageType::Version, &[]),
            Request::ListPorts(slots) => {
                let mut body = (slots.len() as i32).to_le_bytes().to_vec();
                body.extend(slots.iter().map(|s| *s as u8));
                message(Magic::Client, client_id, MessageType::PortInfo, &body)
            }
            Request::PadData {
                flags,
                slot,
                address,
            } => {
                let mut body = vec![*flags, *slot];
                body.extend_from_slice(address.as_bytes());
                message(Magic::Client, client_id, MessageType::PadData, &body)
            }
        }
    }
}

fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalized(magic: Magic, payload: &[u8]) -> Vec<u8> {
        let mut buf = build(magic, MAX_PROTOCOL_VERSION, 0xDEADBEEF, payload);
        finalize(&mut buf);
        buf
    }

    #[test]
    fn test_build_layout() {
        let buf = build(Magic::Server, 1001, 0x01020304, &[9, 9, 9]);
        assert_eq!(&buf[0..4], b"DSUS");
        assert_eq!(u16::from_le_bytes([buf[4], buf[5]]), 1001);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), 3);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
        assert_eq!(&buf[12..16], &[4, 3, 2, 1]);
        assert_eq!(buf.len(), HEADER_LEN + 3);
    }

    #[test]
    fn test_oversized_payload_saturates_length() {
        let payload = vec![0u8; u16::MAX as usize + 10];
        let mut buf = build(Magic::Server, 1001, 1, &payload);
        assert_eq!(u16::from_le_bytes([buf[6], buf[7]]), u16::MAX);

        // declared length no longer covers the payload, so the CRC cannot match
        finalize(&mut buf);
        assert!(parse(&buf, Magic::Server).is_err());
    }

    #[test]
    fn test_crc_round_trip() {
        for payload in [vec![], vec![0u8], (0..=255u8).collect::<Vec<_>>()] {
            let buf = finalized(Magic::Client, &payload);
            let packet = parse(&buf, Magic::Client).unwrap();
            assert_eq!(packet.payload, payload);
            assert_eq!(packet.sender_id, 0xDEADBEEF);
            assert_eq!(packet.version, MAX_PROTOCOL_VERSION);
        }
    }

    #[test]
    fn test_single_bit_flip_rejected() {
        let buf = finalized(Magic::Client, &[0x00, 0x00, 0x10, 0x00, 0x55, 0xAA]);

        for byte in (0..buf.len()).filter(|i| !CRC_RANGE.contains(i)) {
            for bit in 0..8 {
                let mut tampered = buf.clone();
                tampered[byte] ^= 1 << bit;
                assert!(
                    parse(&tampered, Magic::Client).is_err(),
                    "flip of byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_rejections() {
        let buf = finalized(Magic::Client, &[1, 2, 3, 4]);

        assert_eq!(parse(&buf[..10], Magic::Client), Err(CodecError::TooShort(10)));
        assert_eq!(
            parse(&buf, Magic::Server),
            Err(CodecError::BadMagic(*b"DSUC"))
        );
        assert!(matches!(
            parse(&buf[..HEADER_LEN + 2], Magic::Client),
            Err(CodecError::Truncated { declared: 20, actual: 18 })
        ));

        let mut newer = build(Magic::Client, 1002, 0, &[]);
        finalize(&mut newer);
        assert_eq!(
            parse(&newer, Magic::Client),
            Err(CodecError::UnsupportedVersion(1002))
        );
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut buf = finalized(Magic::Client, &[7, 7, 7, 7]);
        buf.extend_from_slice(&[0xEE; 5]);
        assert_eq!(parse(&buf, Magic::Client).unwrap().payload, vec![7, 7, 7, 7]);
    }

    #[test]
    fn test_request_decode() {
        let decode = |req: &Request| {
            let buf = req.encode(1);
            Request::decode(&parse(&buf, Magic::Client).unwrap().payload)
        };

        assert_eq!(decode(&Request::Version), Ok(Request::Version));

        let list = Request::ListPorts(vec![PadId::Two, PadId::Four]);
        assert_eq!(decode(&list), Ok(list.clone()));

        let pad = Request::PadData {
            flags: 0x03,
            slot: 2,
            address: DeviceAddress([1, 2, 3, 4, 5, 6]),
        };
        assert_eq!(decode(&pad), Ok(pad.clone()));
    }

    #[test]
    fn test_list_ports_validation() {
        let body = |count: i32, ids: &[u8]| {
            let mut payload = (MessageType::PortInfo as u32).to_le_bytes().to_vec();
            payload.extend_from_slice(&count.to_le_bytes());
            payload.extend_from_slice(ids);
            payload
        };

        assert_eq!(Request::decode(&body(0, &[])), Ok(Request::ListPorts(vec![])));
        assert!(Request::decode(&body(5, &[0, 1, 2, 3, 0])).is_err());
        assert!(Request::decode(&body(-1, &[])).is_err());
        assert!(Request::decode(&body(2, &[1, 4])).is_err());
        assert!(Request::decode(&body(3, &[1, 2])).is_err());
    }

    #[test]
    fn test_unknown_message_type() {
        let payload = 0x200000u32.to_le_bytes();
        assert_eq!(
            Request::decode(&payload),
            Err(CodecError::UnknownMessage(0x200000))
        );
        assert!(Request::decode(&[0x00, 0x00]).is_err());
    }
}
