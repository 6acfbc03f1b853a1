//! Command packet codec: the typed RPC header wrapping user bytes.
//!
//! Layout inside an assembled container payload:
//! ```text
//! ┌─────────────┬──────────────┬───────────────┬────────────┬────────┐
//! │ header_byte │ cmd_name_len │ cmd_name      │ data_len   │ data   │
//! │ 1 byte      │ 1 byte       │ 1–16 bytes    │ u16 LE     │ bytes  │
//! └─────────────┴──────────────┴───────────────┴────────────┴────────┘
//! header_byte: bit 7 = type (0 request, 1 response), bits 6:0 = 0
//! ```
//!
//! The data field is opaque to the core; callers bring their own
//! serialization.

use crate::error::{BlerpcError, Result};

/// Maximum command name length in bytes.
pub const MAX_CMD_NAME_LEN: usize = 16;

/// Direction of a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    /// Central-to-peripheral request.
    Request,
    /// Peripheral-to-central response.
    Response,
}

/// A parsed command packet borrowing name and data from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandPacket<'a> {
    /// Request or response.
    pub cmd_type: CommandType,
    /// RPC name, ASCII snake_case in practice.
    pub cmd_name: &'a str,
    /// Opaque payload bytes.
    pub data: &'a [u8],
}

impl<'a> CommandPacket<'a> {
    /// Parse a command packet from an assembled (and decrypted) payload.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(BlerpcError::MalformedFrame("command packet too short"));
        }

        let header = buf[0];
        if header & 0x7F != 0 {
            return Err(BlerpcError::MalformedFrame("reserved command header bits set"));
        }
        let cmd_type = if header & 0x80 != 0 {
            CommandType::Response
        } else {
            CommandType::Request
        };

        let name_len = buf[1] as usize;
        if name_len == 0 || name_len > MAX_CMD_NAME_LEN {
            return Err(BlerpcError::InvalidCommandName("length must be 1-16"));
        }
        if buf.len() < 2 + name_len + 2 {
            return Err(BlerpcError::MalformedFrame("command packet truncated"));
        }

        let cmd_name = std::str::from_utf8(&buf[2..2 + name_len])
            .map_err(|_| BlerpcError::InvalidCommandName("not valid UTF-8"))?;

        let dl_offset = 2 + name_len;
        let data_len = u16::from_le_bytes([buf[dl_offset], buf[dl_offset + 1]]) as usize;
        let data_offset = dl_offset + 2;
        if buf.len() < data_offset + data_len {
            return Err(BlerpcError::MalformedFrame("command data truncated"));
        }

        Ok(Self {
            cmd_type,
            cmd_name,
            data: &buf[data_offset..data_offset + data_len],
        })
    }

    /// Serialized size of this packet.
    #[inline]
    pub fn wire_size(&self) -> usize {
        2 + self.cmd_name.len() + 2 + self.data.len()
    }

    /// Serialize into `out`, returning the number of bytes written.
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize> {
        let name = self.cmd_name.as_bytes();
        if name.is_empty() || name.len() > MAX_CMD_NAME_LEN {
            return Err(BlerpcError::InvalidCommandName("length must be 1-16"));
        }
        if self.data.len() > u16::MAX as usize {
            return Err(BlerpcError::Overflow {
                got: self.data.len(),
                limit: u16::MAX as usize,
            });
        }
        let need = self.wire_size();
        if out.len() < need {
            return Err(BlerpcError::BufferTooSmall { need, have: out.len() });
        }

        out[0] = match self.cmd_type {
            CommandType::Request => 0x00,
            CommandType::Response => 0x80,
        };
        out[1] = name.len() as u8;
        out[2..2 + name.len()].copy_from_slice(name);
        let dl_offset = 2 + name.len();
        out[dl_offset..dl_offset + 2].copy_from_slice(&(self.data.len() as u16).to_le_bytes());
        out[dl_offset + 2..need].copy_from_slice(self.data);
        Ok(need)
    }

    /// Serialize into a freshly allocated `Vec<u8>`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.wire_size()];
        let n = self.serialize(&mut buf)?;
        debug_assert_eq!(n, buf.len());
        Ok(buf)
    }
}

/// Build an encoded request packet.
pub fn encode_request(cmd_name: &str, data: &[u8]) -> Result<Vec<u8>> {
    CommandPacket {
        cmd_type: CommandType::Request,
        cmd_name,
        data,
    }
    .encode()
}

/// Build an encoded response packet.
pub fn encode_response(cmd_name: &str, data: &[u8]) -> Result<Vec<u8>> {
    CommandPacket {
        cmd_type: CommandType::Response,
        cmd_name,
        data,
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let encoded = encode_request("flash_read", &[0xAA, 0xBB, 0xCC]).unwrap();
        let parsed = CommandPacket::parse(&encoded).unwrap();
        assert_eq!(parsed.cmd_type, CommandType::Request);
        assert_eq!(parsed.cmd_name, "flash_read");
        assert_eq!(parsed.data, &[0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn test_response_flips_top_bit() {
        let req = encode_request("flash_read", &[0xAA]).unwrap();
        let resp = encode_response("flash_read", &[0xAA]).unwrap();
        assert_eq!(req[0], 0x00);
        assert_eq!(resp[0], 0x80);
        assert_eq!(&req[1..], &resp[1..]);
    }

    #[test]
    fn test_data_len_little_endian_placement() {
        // name "x": data_len lands at offsets 3..4
        let encoded = encode_request("x", &vec![0u8; 300]).unwrap();
        assert_eq!(encoded[3], 0x2C);
        assert_eq!(encoded[4], 0x01);
    }

    #[test]
    fn test_name_length_bounds() {
        assert!(encode_request("a", b"").is_ok());
        assert!(encode_request(&"n".repeat(16), b"").is_ok());
        assert!(matches!(
            encode_request(&"n".repeat(17), b""),
            Err(BlerpcError::InvalidCommandName(_))
        ));
        assert!(matches!(
            encode_request("", b""),
            Err(BlerpcError::InvalidCommandName(_))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_name_len() {
        // cmd_name_len = 17
        let mut buf = vec![0x00, 17];
        buf.extend_from_slice(&[b'n'; 17]);
        buf.extend_from_slice(&[0, 0]);
        assert!(matches!(
            CommandPacket::parse(&buf),
            Err(BlerpcError::InvalidCommandName(_))
        ));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let encoded = encode_request("echo", b"payload").unwrap();
        for cut in [0, 1, 3, encoded.len() - 1] {
            assert!(CommandPacket::parse(&encoded[..cut]).is_err());
        }
    }

    #[test]
    fn test_parse_rejects_reserved_header_bits() {
        let mut encoded = encode_request("echo", b"").unwrap();
        encoded[0] |= 0x01;
        assert!(matches!(
            CommandPacket::parse(&encoded),
            Err(BlerpcError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_empty_data_roundtrip() {
        let encoded = encode_response("echo", b"").unwrap();
        let parsed = CommandPacket::parse(&encoded).unwrap();
        assert_eq!(parsed.cmd_type, CommandType::Response);
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_oversized_data_rejected() {
        let data = vec![0u8; 65536];
        assert!(matches!(
            encode_request("echo", &data),
            Err(BlerpcError::Overflow { .. })
        ));
    }
}
