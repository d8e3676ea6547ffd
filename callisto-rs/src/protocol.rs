//! Implements the binary envelope in which values travel between peers.
//!
//! A peer response is a tiny field-tagged, length-prefixed message which is wire compatible
//! with the protobuf schema:
//!
//! ```text
//! message Response {
//!     bytes value = 1;
//! }
//! ```
//!
//! Encoding such a message by hand is straight forward: the single field is emitted as its tag
//! byte (field number 1, wire type 2 = length-delimited), followed by the payload length as a
//! varint, followed by the raw payload. An empty value is encoded as an empty message (just as
//! proto3 serializers omit empty fields).
//!
//! The decoder is deliberately tolerant: unknown fields are skipped (so that the schema can be
//! extended without breaking old peers) and an absent value field simply yields an empty value.
//!
//! # Examples
//!
//! ```
//! # use callisto::protocol;
//! let encoded = protocol::encode_response(b"630");
//! assert_eq!(encoded.as_ref(), &[0x0A, 0x03, b'6', b'3', b'0']);
//!
//! let decoded = protocol::decode_response(&encoded).unwrap();
//! assert_eq!(decoded, b"630".to_vec());
//! ```
use anyhow::anyhow;
use bytes::{BufMut, Bytes, BytesMut};

/// The tag of the value field: field number 1, wire type 2 (length-delimited).
const VALUE_FIELD_TAG: u64 = (1 << 3) | WIRE_TYPE_LENGTH_DELIMITED;

const WIRE_TYPE_VARINT: u64 = 0;
const WIRE_TYPE_FIXED64: u64 = 1;
const WIRE_TYPE_LENGTH_DELIMITED: u64 = 2;
const WIRE_TYPE_FIXED32: u64 = 5;

/// Encodes the given value bytes into a response envelope.
pub fn encode_response(value: &[u8]) -> Bytes {
    if value.is_empty() {
        return Bytes::new();
    }

    let mut buffer = BytesMut::with_capacity(value.len() + 6);
    put_varint(&mut buffer, VALUE_FIELD_TAG);
    put_varint(&mut buffer, value.len() as u64);
    buffer.put_slice(value);

    buffer.freeze()
}

/// Decodes a response envelope and returns the value bytes carried within.
///
/// Reports an error for malformed data (truncated varints or payloads). If the message contains
/// several value fields, the last one wins.
pub fn decode_response(data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut value = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let (tag, tag_len) = read_varint(data, offset)?;
        offset += tag_len;

        if tag == VALUE_FIELD_TAG {
            let (payload, skipped) = read_length_delimited(data, offset)?;
            value = payload.to_vec();
            offset += skipped;
        } else {
            offset += skip_field(data, offset, tag & 0x07)?;
        }
    }

    Ok(value)
}

/// Appends the given value in varint encoding (7 bits per byte, high bit = continuation).
fn put_varint(buffer: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buffer.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buffer.put_u8(value as u8);
}

/// Reads a varint at the given offset and returns its value and encoded length.
fn read_varint(data: &[u8], offset: usize) -> anyhow::Result<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0;

    for (index, byte) in data[offset.min(data.len())..].iter().enumerate() {
        if shift >= 64 {
            return Err(anyhow!("Encountered an oversized varint in a peer response."));
        }

        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, index + 1));
        }
        shift += 7;
    }

    Err(anyhow!("Encountered a truncated varint in a peer response."))
}

/// Reads a length-delimited payload at the given offset.
///
/// Returns the payload and the total number of bytes consumed (length prefix + payload).
fn read_length_delimited(data: &[u8], offset: usize) -> anyhow::Result<(&[u8], usize)> {
    let (length, length_len) = read_varint(data, offset)?;
    let start = offset + length_len;
    let end = start + length as usize;

    if end > data.len() {
        return Err(anyhow!(
            "A peer response announced {} payload bytes but carried fewer.",
            length
        ));
    }

    Ok((&data[start..end], length_len + length as usize))
}

/// Skips over an unknown field and returns the number of bytes consumed.
fn skip_field(data: &[u8], offset: usize, wire_type: u64) -> anyhow::Result<usize> {
    match wire_type {
        WIRE_TYPE_VARINT => {
            let (_, skipped) = read_varint(data, offset)?;
            Ok(skipped)
        }
        WIRE_TYPE_FIXED64 => Ok(8),
        WIRE_TYPE_LENGTH_DELIMITED => {
            let (_, skipped) = read_length_delimited(data, offset)?;
            Ok(skipped)
        }
        WIRE_TYPE_FIXED32 => Ok(4),
        _ => Err(anyhow!(
            "Encountered an unsupported wire type ({}) in a peer response.",
            wire_type
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::{decode_response, encode_response};

    #[test]
    fn encoding_matches_the_protobuf_wire_format() {
        // Tag 0x0A = field 1, wire type 2, followed by the length and the raw bytes...
        assert_eq!(
            encode_response(b"630").as_ref(),
            &[0x0A, 0x03, b'6', b'3', b'0']
        );

        // An empty value yields an empty message...
        assert_eq!(encode_response(b"").len(), 0);
    }

    #[test]
    fn round_trips_preserve_the_value() {
        for value in [
            b"".to_vec(),
            b"630".to_vec(),
            vec![0_u8; 300],
            (0..=255).collect::<Vec<u8>>(),
        ] {
            let encoded = encode_response(&value);
            assert_eq!(decode_response(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn large_payloads_use_multi_byte_length_prefixes() {
        let value = vec![42_u8; 300];
        let encoded = encode_response(&value);

        // 300 = 0xAC 0x02 as varint...
        assert_eq!(&encoded[0..3], &[0x0A, 0xAC, 0x02]);
        assert_eq!(decode_response(&encoded).unwrap(), value);
    }

    #[test]
    fn unknown_fields_are_skipped() {
        // field 2 (varint) = 99, followed by field 1 = "630"...
        let data = [0x10, 0x63, 0x0A, 0x03, b'6', b'3', b'0'];
        assert_eq!(decode_response(&data).unwrap(), b"630".to_vec());
    }

    #[test]
    fn malformed_messages_are_reported() {
        // Announces 5 payload bytes but only carries 2...
        let truncated_payload = [0x0A, 0x05, b'6', b'3'];
        assert_eq!(decode_response(&truncated_payload).is_err(), true);

        // A varint which never terminates...
        let truncated_varint = [0x0A, 0x80];
        assert_eq!(decode_response(&truncated_varint).is_err(), true);
    }

    #[test]
    fn an_empty_message_yields_an_empty_value() {
        assert_eq!(decode_response(&[]).unwrap(), Vec::<u8>::new());
    }
}
