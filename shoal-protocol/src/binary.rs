//! Binary protocol framing.
//!
//! Both directions share one fixed 24-byte header layout (big-endian):
//!
//! ```text
//! Byte/     0       |       1       |       2       |       3       |
//!    +---------------+---------------+---------------+---------------+
//!   0| Magic         | Opcode        | Key length                    |
//!    +---------------+---------------+---------------+---------------+
//!   4| Extras length | Data type     | vbucket id / status           |
//!    +---------------+---------------+---------------+---------------+
//!   8| Total body length                                             |
//!    +---------------+---------------+---------------+---------------+
//!  12| Opaque                                                        |
//!    +---------------+---------------+---------------+---------------+
//!  16| CAS                                                           |
//!    |                                                               |
//!    +---------------+---------------+---------------+---------------+
//! ```
//!
//! Bytes 6..8 carry the vbucket id on requests and the status on responses.
//! `total_body_length` always equals `extras + key + value`.

use bytes::{BufMut, BytesMut};

use crate::{Opcode, ParseError, ResponseStatus};

/// Magic byte opening every binary request.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte opening every binary response.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Fixed header size for both directions.
pub const HEADER_SIZE: usize = 24;

/// Parsed response header.
///
/// `status` and `cas` are meaningful for every operation; key/extras/value
/// lengths describe the body that follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub opcode: Opcode,
    pub key_length: u16,
    pub extras_length: u8,
    pub status: ResponseStatus,
    pub total_body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl ResponseHeader {
    /// Parse a response header from exactly [`HEADER_SIZE`] bytes.
    ///
    /// Verifies the response magic, resolves the opcode, and requires the
    /// reserved data type byte to be zero. The status field falls back to
    /// [`ResponseStatus::InternalError`] for wire values outside the known
    /// set.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Truncated);
        }
        if data[0] != RESPONSE_MAGIC {
            return Err(ParseError::BadMagic(data[0]));
        }
        let opcode = Opcode::from_u8(data[1]).ok_or(ParseError::UnknownOpcode(data[1]))?;
        if data[5] != 0 {
            return Err(ParseError::BadDataType(data[5]));
        }

        let status = ResponseStatus::from_u16(u16::from_be_bytes([data[6], data[7]]))
            .unwrap_or(ResponseStatus::InternalError);

        Ok(Self {
            opcode,
            key_length: u16::from_be_bytes([data[2], data[3]]),
            extras_length: data[4],
            status,
            total_body_length: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            opaque: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            cas: u64::from_be_bytes([
                data[16], data[17], data[18], data[19], data[20], data[21], data[22], data[23],
            ]),
        })
    }

    /// Value length implied by the header, or a [`ParseError::LengthMismatch`]
    /// when `total_body_length` cannot cover the key and extras.
    pub fn value_length(&self) -> Result<usize, ParseError> {
        let overhead = self.key_length as u64 + self.extras_length as u64;
        let total = self.total_body_length as u64;
        if total < overhead {
            return Err(ParseError::LengthMismatch {
                total_body: self.total_body_length,
                key_len: self.key_length,
                extras_len: self.extras_length,
            });
        }
        Ok((total - overhead) as usize)
    }
}

/// Append one complete request frame (header, extras, key, value) to `buf`.
///
/// The header's `total_body_length` is derived from the slices, so the
/// framing invariant holds by construction. Returns the frame length.
pub fn encode_request(
    buf: &mut BytesMut,
    opcode: Opcode,
    cas: u64,
    key: &[u8],
    value: &[u8],
    extras: &[u8],
) -> usize {
    let total_body = extras.len() + key.len() + value.len();

    buf.reserve(HEADER_SIZE + total_body);
    buf.put_u8(REQUEST_MAGIC);
    buf.put_u8(opcode as u8);
    buf.put_u16(key.len() as u16);
    buf.put_u8(extras.len() as u8);
    buf.put_u8(0); // data type
    buf.put_u16(0); // vbucket id, unused by the supported opcodes
    buf.put_u32(total_body as u32);
    buf.put_u32(0); // opaque
    buf.put_u64(cas);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);

    HEADER_SIZE + total_body
}

/// Extras for set/add/replace: `flags:u32, expiration:u32`.
pub fn store_extras(flags: u32, expiration: u32) -> [u8; 8] {
    let mut extras = [0u8; 8];
    extras[..4].copy_from_slice(&flags.to_be_bytes());
    extras[4..].copy_from_slice(&expiration.to_be_bytes());
    extras
}

/// Extras for increment/decrement: `delta:u64, initial:u64, expiration:u32`.
pub fn counter_extras(delta: u64, initial: u64, expiration: u32) -> [u8; 20] {
    let mut extras = [0u8; 20];
    extras[..8].copy_from_slice(&delta.to_be_bytes());
    extras[8..16].copy_from_slice(&initial.to_be_bytes());
    extras[16..].copy_from_slice(&expiration.to_be_bytes());
    extras
}

/// Extras for flush (expiration) and verbosity (level): one `u32`.
pub fn u32_extras(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Deserialize a get response's extras region: exactly one `flags: u32`.
///
/// The region must be consumed exactly; leftover bytes indicate the server
/// and client disagree about the operation's extras layout.
pub fn parse_flags_extras(extras: &[u8]) -> Result<u32, ParseError> {
    if extras.len() < 4 {
        return Err(ParseError::Truncated);
    }
    if extras.len() > 4 {
        return Err(ParseError::TrailingExtras(extras.len() - 4));
    }
    Ok(u32::from_be_bytes([extras[0], extras[1], extras[2], extras[3]]))
}

/// Deserialize a counter response body: one big-endian `u64`.
pub fn parse_counter_value(body: &[u8]) -> Result<u64, ParseError> {
    if body.len() != 8 {
        return Err(ParseError::Truncated);
    }
    Ok(u64::from_be_bytes([
        body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
    ]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_frame_layout() {
        // add "Hello" = "World", flags 0xdeadbeef, expiry 0xe10, cas
        // 0xdecafbad: 24-byte header + 8-byte extras + 5-byte key + 5-byte
        // value = 42 bytes.
        let mut buf = BytesMut::new();
        let len = encode_request(
            &mut buf,
            Opcode::Add,
            0xdecafbad,
            b"Hello",
            b"World",
            &store_extras(0xdeadbeef, 0xe10),
        );
        assert_eq!(len, 42);

        #[rustfmt::skip]
        let expected: &[u8] = &[
            0x80,                   // magic
            0x02,                   // opcode: add
            0x00, 0x05,             // key length
            0x08,                   // extras length
            0x00,                   // data type
            0x00, 0x00,             // vbucket id
            0x00, 0x00, 0x00, 0x12, // total body length
            0x00, 0x00, 0x00, 0x00, // opaque
            0x00, 0x00, 0x00, 0x00, 0xde, 0xca, 0xfb, 0xad, // cas
            0xde, 0xad, 0xbe, 0xef, // flags
            0x00, 0x00, 0x0e, 0x10, // expiry
            b'H', b'e', b'l', b'l', b'o',
            b'W', b'o', b'r', b'l', b'd',
        ];
        assert_eq!(&buf[..], expected);
    }

    #[test]
    fn body_length_invariant() {
        let mut buf = BytesMut::new();
        encode_request(
            &mut buf,
            Opcode::Set,
            0,
            b"key",
            b"some-value",
            &store_extras(7, 60),
        );
        let total_body = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        assert_eq!(total_body as usize, 8 + 3 + 10);
        assert_eq!(buf.len(), HEADER_SIZE + total_body as usize);
    }

    #[test]
    fn keyless_frame() {
        let mut buf = BytesMut::new();
        let len = encode_request(&mut buf, Opcode::Version, 0, b"", b"", &[]);
        assert_eq!(len, HEADER_SIZE);
        assert_eq!(buf[1], 0x0b);
        assert_eq!(&buf[8..12], &[0, 0, 0, 0]);
    }

    fn response_bytes(
        opcode: u8,
        status: u16,
        extras: &[u8],
        key: &[u8],
        value: &[u8],
        cas: u64,
    ) -> Vec<u8> {
        let total = extras.len() + key.len() + value.len();
        let mut data = Vec::with_capacity(HEADER_SIZE + total);
        data.push(RESPONSE_MAGIC);
        data.push(opcode);
        data.extend_from_slice(&(key.len() as u16).to_be_bytes());
        data.push(extras.len() as u8);
        data.push(0);
        data.extend_from_slice(&status.to_be_bytes());
        data.extend_from_slice(&(total as u32).to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&cas.to_be_bytes());
        data.extend_from_slice(extras);
        data.extend_from_slice(key);
        data.extend_from_slice(value);
        data
    }

    #[test]
    fn response_header_roundtrip() {
        let data = response_bytes(0x00, 0x0000, &[0, 0, 0, 9], b"", b"World", 17);
        let header = ResponseHeader::parse(&data).unwrap();
        assert_eq!(header.opcode, Opcode::Get);
        assert_eq!(header.status, ResponseStatus::NoError);
        assert_eq!(header.extras_length, 4);
        assert_eq!(header.key_length, 0);
        assert_eq!(header.cas, 17);
        assert_eq!(header.value_length().unwrap(), 5);
    }

    #[test]
    fn response_bad_magic() {
        let mut data = response_bytes(0x00, 0, &[], b"", b"", 0);
        data[0] = REQUEST_MAGIC;
        assert_eq!(
            ResponseHeader::parse(&data),
            Err(ParseError::BadMagic(0x80))
        );
    }

    #[test]
    fn response_unknown_opcode() {
        // 0x0a (noop) is not in the supported set.
        let data = response_bytes(0x0a, 0, &[], b"", b"", 0);
        assert_eq!(
            ResponseHeader::parse(&data),
            Err(ParseError::UnknownOpcode(0x0a))
        );
    }

    #[test]
    fn response_nonzero_data_type() {
        let mut data = response_bytes(0x01, 0, &[], b"", b"", 0);
        data[5] = 1;
        assert_eq!(ResponseHeader::parse(&data), Err(ParseError::BadDataType(1)));
    }

    #[test]
    fn response_negative_value_length() {
        let mut data = response_bytes(0x00, 0, &[0, 0, 0, 0], b"", b"", 0);
        // Claim a body smaller than the extras that were declared.
        data[8..12].copy_from_slice(&2u32.to_be_bytes());
        let header = ResponseHeader::parse(&data).unwrap();
        assert!(matches!(
            header.value_length(),
            Err(ParseError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn response_unknown_status_degrades() {
        let data = response_bytes(0x01, 0x7777, &[], b"", b"", 0);
        let header = ResponseHeader::parse(&data).unwrap();
        assert_eq!(header.status, ResponseStatus::InternalError);
    }

    #[test]
    fn flags_extras_exact_consumption() {
        assert_eq!(parse_flags_extras(&[0xde, 0xad, 0xbe, 0xef]), Ok(0xdeadbeef));
        assert_eq!(parse_flags_extras(&[1, 2]), Err(ParseError::Truncated));
        assert_eq!(
            parse_flags_extras(&[0, 0, 0, 0, 9]),
            Err(ParseError::TrailingExtras(1))
        );
    }

    #[test]
    fn counter_extras_layout() {
        let extras = counter_extras(2, 100, 0xffffffff);
        assert_eq!(&extras[..8], &2u64.to_be_bytes());
        assert_eq!(&extras[8..16], &100u64.to_be_bytes());
        assert_eq!(&extras[16..], &0xffffffffu32.to_be_bytes());
    }

    #[test]
    fn counter_value() {
        assert_eq!(parse_counter_value(&16u64.to_be_bytes()), Ok(16));
        assert_eq!(parse_counter_value(&[1, 2, 3]), Err(ParseError::Truncated));
    }
}
