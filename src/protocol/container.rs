//! Container framing: the on-wire unit written to or notified from a channel.
//!
//! Three container kinds share a common prefix:
//! ```text
//! ┌─────────┬─────────┬─────────┬──────────────────────────────┐
//! │ tid     │ seq     │ flags   │ variant body                 │
//! │ 1 byte  │ 1 byte  │ 1 byte  │                              │
//! └─────────┴─────────┴─────────┴──────────────────────────────┘
//! flags: bits 7:6 = type, bits 5:2 = control cmd, bits 1:0 reserved (0)
//!
//! FIRST:      total_length (u16 LE) | payload_len (u8) | payload
//! SUBSEQUENT: payload_len (u8) | payload
//! CONTROL:    payload_len (u8) | payload
//! ```
//!
//! All multi-byte integers are Little Endian.
//!
//! # Example
//!
//! ```
//! use blerpc::protocol::{Container, ContainerKind};
//!
//! // FIRST container carrying the whole payload "hello"
//! let bytes = [0x01, 0x00, 0x00, 0x05, 0x00, 0x05, b'h', b'e', b'l', b'l', b'o'];
//! let c = Container::parse(&bytes).unwrap();
//! assert_eq!(c.transaction_id, 1);
//! assert_eq!(c.kind, ContainerKind::First { total_length: 5 });
//! assert_eq!(c.payload, b"hello");
//! ```

use crate::error::{BlerpcError, Result};

/// FIRST container header size (tid, seq, flags, total_length, payload_len).
pub const FIRST_HEADER_SIZE: usize = 6;

/// SUBSEQUENT and CONTROL container header size (tid, seq, flags, payload_len).
pub const SHORT_HEADER_SIZE: usize = 4;

/// ATT protocol overhead subtracted from the MTU to get the effective
/// container size.
pub const ATT_OVERHEAD: usize = 3;

/// Error code carried in a CONTROL/ERROR payload: response exceeds the
/// peripheral's max_response_payload_size.
pub const ERROR_RESPONSE_TOO_LARGE: u8 = 0x01;

/// Error code carried in a CONTROL/ERROR payload: peripheral busy with
/// another request.
pub const ERROR_BUSY: u8 = 0x02;

/// Capability flag: peripheral supports the key-exchange handshake and
/// encrypted payloads.
pub const CAPABILITY_FLAG_ENCRYPTION_SUPPORTED: u16 = 0x0001;

const TYPE_FIRST: u8 = 0;
const TYPE_SUBSEQUENT: u8 = 1;
const TYPE_CONTROL: u8 = 3;

/// Control command carried in the flags byte of a CONTROL container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlCmd {
    /// Timeout negotiation request/response (payload: u16 LE milliseconds).
    Timeout = 1,
    /// Peripheral-to-central stream finished.
    StreamEndP2c = 2,
    /// Central-to-peripheral stream finished.
    StreamEndC2p = 3,
    /// Capability record request/response.
    Capabilities = 4,
    /// Peripheral-side error (payload: 1 error code byte).
    Error = 5,
    /// Key-exchange handshake message.
    KeyExchange = 6,
}

impl ControlCmd {
    fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Timeout),
            2 => Some(Self::StreamEndP2c),
            3 => Some(Self::StreamEndC2p),
            4 => Some(Self::Capabilities),
            5 => Some(Self::Error),
            6 => Some(Self::KeyExchange),
            _ => None,
        }
    }
}

/// Container variant, discriminated by the type bits of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    /// First container of a payload; carries the payload length across all
    /// containers of the transaction.
    First { total_length: u16 },
    /// Continuation container.
    Subsequent,
    /// Out-of-band control signaling; never enters the assembler.
    Control(ControlCmd),
}

/// A parsed or to-be-serialized container frame.
///
/// The payload borrows from the parse input; no copy is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Container<'a> {
    /// Caller-chosen identifier, consistent across all containers of one
    /// logical payload. Not a multiplexing key.
    pub transaction_id: u8,
    /// 0 for FIRST, strictly +1 for each SUBSEQUENT of the same payload.
    pub sequence_number: u8,
    /// Variant and variant-specific fields.
    pub kind: ContainerKind,
    /// Payload bytes of this container.
    pub payload: &'a [u8],
}

impl<'a> Container<'a> {
    /// Header size for this container's kind.
    #[inline]
    pub fn header_size(&self) -> usize {
        match self.kind {
            ContainerKind::First { .. } => FIRST_HEADER_SIZE,
            _ => SHORT_HEADER_SIZE,
        }
    }

    /// Total serialized size (header + payload).
    #[inline]
    pub fn wire_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    fn flags_byte(&self) -> u8 {
        match self.kind {
            ContainerKind::First { .. } => TYPE_FIRST << 6,
            ContainerKind::Subsequent => TYPE_SUBSEQUENT << 6,
            ContainerKind::Control(cmd) => (TYPE_CONTROL << 6) | ((cmd as u8) << 2),
        }
    }

    /// Parse a container from a complete notification or write frame.
    ///
    /// Rejects truncated buffers, a `payload_len` that exceeds the remaining
    /// bytes, reserved bits that are not zero, the reserved type value, and
    /// unknown control commands.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < SHORT_HEADER_SIZE {
            return Err(BlerpcError::MalformedFrame("container shorter than header"));
        }

        let transaction_id = buf[0];
        let sequence_number = buf[1];
        let flags = buf[2];

        if flags & 0b0000_0011 != 0 {
            return Err(BlerpcError::MalformedFrame("reserved flag bits set"));
        }

        let type_bits = flags >> 6;
        let cmd_bits = (flags >> 2) & 0x0F;

        let (kind, header_size) = match type_bits {
            TYPE_FIRST => {
                if cmd_bits != 0 {
                    return Err(BlerpcError::MalformedFrame("control bits set on FIRST"));
                }
                if buf.len() < FIRST_HEADER_SIZE {
                    return Err(BlerpcError::MalformedFrame("FIRST container truncated"));
                }
                let total_length = u16::from_le_bytes([buf[3], buf[4]]);
                (ContainerKind::First { total_length }, FIRST_HEADER_SIZE)
            }
            TYPE_SUBSEQUENT => {
                if cmd_bits != 0 {
                    return Err(BlerpcError::MalformedFrame("control bits set on SUBSEQUENT"));
                }
                (ContainerKind::Subsequent, SHORT_HEADER_SIZE)
            }
            TYPE_CONTROL => {
                let cmd = ControlCmd::from_bits(cmd_bits)
                    .ok_or(BlerpcError::MalformedFrame("unknown control command"))?;
                (ContainerKind::Control(cmd), SHORT_HEADER_SIZE)
            }
            _ => return Err(BlerpcError::MalformedFrame("reserved container type")),
        };

        let payload_len = buf[header_size - 1] as usize;
        if buf.len() < header_size + payload_len {
            return Err(BlerpcError::MalformedFrame("payload_len exceeds frame"));
        }

        Ok(Self {
            transaction_id,
            sequence_number,
            kind,
            payload: &buf[header_size..header_size + payload_len],
        })
    }

    /// Serialize into `out`, returning the number of bytes written.
    ///
    /// Fails with `BufferTooSmall` if `out` cannot hold the frame.
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize> {
        let need = self.wire_size();
        if self.payload.len() > u8::MAX as usize {
            return Err(BlerpcError::MalformedFrame("container payload exceeds 255 bytes"));
        }
        if out.len() < need {
            return Err(BlerpcError::BufferTooSmall { need, have: out.len() });
        }

        out[0] = self.transaction_id;
        out[1] = self.sequence_number;
        out[2] = self.flags_byte();

        let header_size = match self.kind {
            ContainerKind::First { total_length } => {
                out[3..5].copy_from_slice(&total_length.to_le_bytes());
                out[5] = self.payload.len() as u8;
                FIRST_HEADER_SIZE
            }
            ContainerKind::Subsequent | ContainerKind::Control(_) => {
                out[3] = self.payload.len() as u8;
                SHORT_HEADER_SIZE
            }
        };

        out[header_size..need].copy_from_slice(self.payload);
        Ok(need)
    }

    /// Serialize into a freshly allocated `Vec<u8>`.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.wire_size()];
        let n = self
            .serialize(&mut buf)
            .expect("buffer sized from wire_size");
        debug_assert_eq!(n, buf.len());
        buf
    }
}

fn control(tid: u8, cmd: ControlCmd, payload: &[u8]) -> Vec<u8> {
    Container {
        transaction_id: tid,
        sequence_number: 0,
        kind: ContainerKind::Control(cmd),
        payload,
    }
    .to_vec()
}

/// Build a serialized CONTROL/TIMEOUT request frame.
pub fn make_timeout_request(tid: u8) -> Vec<u8> {
    control(tid, ControlCmd::Timeout, &[])
}

/// Build a serialized CONTROL/TIMEOUT response carrying milliseconds (u16 LE).
pub fn make_timeout_response(tid: u8, timeout_ms: u16) -> Vec<u8> {
    control(tid, ControlCmd::Timeout, &timeout_ms.to_le_bytes())
}

/// Build a serialized CONTROL/CAPABILITIES request frame.
pub fn make_capabilities_request(tid: u8) -> Vec<u8> {
    control(tid, ControlCmd::Capabilities, &[])
}

/// Build a serialized CONTROL/STREAM_END_C2P frame.
pub fn make_stream_end_c2p(tid: u8) -> Vec<u8> {
    control(tid, ControlCmd::StreamEndC2p, &[])
}

/// Build a serialized CONTROL/STREAM_END_P2C frame.
pub fn make_stream_end_p2c(tid: u8) -> Vec<u8> {
    control(tid, ControlCmd::StreamEndP2c, &[])
}

/// Build a serialized CONTROL/ERROR frame carrying one code byte.
pub fn make_error(tid: u8, code: u8) -> Vec<u8> {
    control(tid, ControlCmd::Error, &[code])
}

/// Build a serialized CONTROL/KEY_EXCHANGE frame carrying a handshake message.
pub fn make_key_exchange(tid: u8, payload: &[u8]) -> Vec<u8> {
    control(tid, ControlCmd::KeyExchange, payload)
}

/// Capability record exchanged via CONTROL/CAPABILITIES.
///
/// The peripheral is the source of truth; the central caches the record
/// after session init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Largest request payload (command packet, possibly encrypted) the
    /// peripheral will reassemble.
    pub max_request_payload_size: u16,
    /// Largest response payload the peripheral will emit.
    pub max_response_payload_size: u16,
    /// Capability flags; bit 0 = encryption supported.
    pub flags: u16,
}

impl Capabilities {
    /// Parse a CONTROL/CAPABILITIES payload.
    ///
    /// Accepts both the current 6-byte format and the legacy 4-byte format
    /// emitted by pre-encryption peripherals; a missing flags field reads
    /// as 0.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < 4 {
            return Err(BlerpcError::MalformedFrame("capabilities payload too short"));
        }
        let flags = if payload.len() >= 6 {
            u16::from_le_bytes([payload[4], payload[5]])
        } else {
            0
        };
        Ok(Self {
            max_request_payload_size: u16::from_le_bytes([payload[0], payload[1]]),
            max_response_payload_size: u16::from_le_bytes([payload[2], payload[3]]),
            flags,
        })
    }

    /// Encode as the current 6-byte payload.
    pub fn encode(&self) -> [u8; 6] {
        let mut out = [0u8; 6];
        out[0..2].copy_from_slice(&self.max_request_payload_size.to_le_bytes());
        out[2..4].copy_from_slice(&self.max_response_payload_size.to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Whether the peripheral advertises the key-exchange handshake.
    #[inline]
    pub fn encryption_supported(&self) -> bool {
        self.flags & CAPABILITY_FLAG_ENCRYPTION_SUPPORTED != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_first_literal_vector() {
        // tid=1, seq=0, FIRST, total_length=5, payload "hello"
        let bytes = [0x01, 0x00, 0x00, 0x05, 0x00, 0x05, 0x68, 0x65, 0x6C, 0x6C, 0x6F];
        let c = Container::parse(&bytes).unwrap();
        assert_eq!(c.transaction_id, 1);
        assert_eq!(c.sequence_number, 0);
        assert_eq!(c.kind, ContainerKind::First { total_length: 5 });
        assert_eq!(c.payload, b"hello");
    }

    #[test]
    fn test_parse_control_timeout_literal_vector() {
        // tid=5, CONTROL/TIMEOUT, payload u16 LE = 200
        let bytes = [0x05, 0x00, 0xC4, 0x02, 0xC8, 0x00];
        let c = Container::parse(&bytes).unwrap();
        assert_eq!(c.transaction_id, 5);
        assert_eq!(c.kind, ContainerKind::Control(ControlCmd::Timeout));
        assert_eq!(c.payload, &[0xC8, 0x00]);
        assert_eq!(u16::from_le_bytes([c.payload[0], c.payload[1]]), 200);
    }

    #[test]
    fn test_serialize_parse_roundtrip_all_kinds() {
        let cases = [
            Container {
                transaction_id: 10,
                sequence_number: 0,
                kind: ContainerKind::First { total_length: 3 },
                payload: b"abc",
            },
            Container {
                transaction_id: 10,
                sequence_number: 1,
                kind: ContainerKind::Subsequent,
                payload: b"xy",
            },
            Container {
                transaction_id: 7,
                sequence_number: 0,
                kind: ContainerKind::Control(ControlCmd::KeyExchange),
                payload: &[0xAA; 32],
            },
        ];
        for original in cases {
            let bytes = original.to_vec();
            let parsed = Container::parse(&bytes).unwrap();
            assert_eq!(parsed, original);
        }
    }

    #[test]
    fn test_first_header_is_six_bytes() {
        let c = Container {
            transaction_id: 1,
            sequence_number: 0,
            kind: ContainerKind::First { total_length: 0 },
            payload: &[],
        };
        assert_eq!(c.to_vec().len(), FIRST_HEADER_SIZE);
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(matches!(
            Container::parse(&[0x01, 0x00, 0x00]),
            Err(BlerpcError::MalformedFrame(_))
        ));
        // FIRST needs 6 header bytes
        assert!(matches!(
            Container::parse(&[0x01, 0x00, 0x00, 0x05, 0x00]),
            Err(BlerpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_payload_len_exceeding_frame_rejected() {
        // payload_len=5 but only 2 payload bytes follow
        let bytes = [0x01, 0x01, 0x40, 0x05, 0xAA, 0xBB];
        assert!(matches!(
            Container::parse(&bytes),
            Err(BlerpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_unknown_control_cmd_rejected() {
        // CONTROL with cmd bits = 0xF
        let bytes = [0x01, 0x00, 0b1111_1100, 0x00];
        assert!(matches!(
            Container::parse(&bytes),
            Err(BlerpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_reserved_type_rejected() {
        // type bits = 2 (reserved)
        let bytes = [0x01, 0x00, 0b1000_0000, 0x00];
        assert!(matches!(
            Container::parse(&bytes),
            Err(BlerpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_reserved_flag_bits_rejected() {
        let bytes = [0x01, 0x00, 0b0000_0001, 0x00];
        assert!(matches!(
            Container::parse(&bytes),
            Err(BlerpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_serialize_buffer_too_small() {
        let c = Container {
            transaction_id: 1,
            sequence_number: 0,
            kind: ContainerKind::First { total_length: 3 },
            payload: b"abc",
        };
        let mut out = [0u8; 4];
        assert!(matches!(
            c.serialize(&mut out),
            Err(BlerpcError::BufferTooSmall { need: 9, have: 4 })
        ));
    }

    #[test]
    fn test_control_helpers() {
        let frame = make_timeout_request(3);
        let c = Container::parse(&frame).unwrap();
        assert_eq!(c.transaction_id, 3);
        assert_eq!(c.kind, ContainerKind::Control(ControlCmd::Timeout));
        assert!(c.payload.is_empty());

        let frame = make_timeout_response(3, 200);
        let c = Container::parse(&frame).unwrap();
        assert_eq!(c.payload, &[0xC8, 0x00]);

        let frame = make_error(9, ERROR_RESPONSE_TOO_LARGE);
        let c = Container::parse(&frame).unwrap();
        assert_eq!(c.kind, ContainerKind::Control(ControlCmd::Error));
        assert_eq!(c.payload, &[0x01]);

        let frame = make_key_exchange(0, &[0x42; 32]);
        let c = Container::parse(&frame).unwrap();
        assert_eq!(c.kind, ContainerKind::Control(ControlCmd::KeyExchange));
        assert_eq!(c.payload.len(), 32);

        for (frame, cmd) in [
            (make_stream_end_c2p(1), ControlCmd::StreamEndC2p),
            (make_stream_end_p2c(2), ControlCmd::StreamEndP2c),
            (make_capabilities_request(4), ControlCmd::Capabilities),
        ] {
            let c = Container::parse(&frame).unwrap();
            assert_eq!(c.kind, ContainerKind::Control(cmd));
            assert!(c.payload.is_empty());
        }
    }

    #[test]
    fn test_capabilities_six_byte_roundtrip() {
        let caps = Capabilities {
            max_request_payload_size: 4096,
            max_response_payload_size: 2048,
            flags: CAPABILITY_FLAG_ENCRYPTION_SUPPORTED,
        };
        let parsed = Capabilities::parse(&caps.encode()).unwrap();
        assert_eq!(parsed, caps);
        assert!(parsed.encryption_supported());
    }

    #[test]
    fn test_capabilities_legacy_four_byte() {
        // Pre-encryption peripherals omit the flags field
        let payload = [0x00, 0x10, 0x00, 0x08];
        let caps = Capabilities::parse(&payload).unwrap();
        assert_eq!(caps.max_request_payload_size, 4096);
        assert_eq!(caps.max_response_payload_size, 2048);
        assert_eq!(caps.flags, 0);
        assert!(!caps.encryption_supported());
    }

    #[test]
    fn test_capabilities_too_short_rejected() {
        assert!(Capabilities::parse(&[0x00, 0x10]).is_err());
    }
}
