//! Binary wire codec for tuples.
//!
//! Each element is a one-byte tag followed by a little-endian payload:
//! `0` None (no payload), `1` Int32 (4 bytes), `2` Float64 (8 bytes),
//! `3` String (1-byte length then UTF-8 bytes), `4` nested tuple
//! (unsupported on the wire), `5` Any (no payload). A tuple is the
//! concatenation of its element encodings.

use thiserror::Error;

use crate::tuple::{Element, Tuple};

const TAG_NONE: u8 = 0;
const TAG_INT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_TUPLE: u8 = 4;
const TAG_ANY: u8 = 5;

/// Longest string payload expressible with the 1-byte length prefix.
pub const MAX_STRING_LEN: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("unsupported element: {0}")]
    Unsupported(&'static str),
    #[error("malformed encoding: {0}")]
    Malformed(&'static str),
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
}

/// Encode a tuple into its wire form. Nested tuples and strings longer
/// than [`MAX_STRING_LEN`] bytes are rejected with `Unsupported`.
pub fn encode(tuple: &Tuple) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(tuple.len() * 8);
    for elem in tuple.elements() {
        match elem {
            Element::Int(i) => {
                out.push(TAG_INT);
                out.extend_from_slice(&i.to_le_bytes());
            }
            Element::Float(x) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&x.to_le_bytes());
            }
            Element::Str(s) => {
                if s.len() > MAX_STRING_LEN {
                    return Err(CodecError::Unsupported("string longer than 255 bytes"));
                }
                out.push(TAG_STRING);
                out.push(s.len() as u8);
                out.extend_from_slice(s.as_bytes());
            }
            Element::Tuple(_) => {
                return Err(CodecError::Unsupported("nested tuple"));
            }
            Element::Any => out.push(TAG_ANY),
            Element::None => out.push(TAG_NONE),
        }
    }
    Ok(out)
}

/// Decode a wire-form buffer into a tuple, consuming the whole buffer.
pub fn decode(data: &[u8]) -> Result<Tuple, CodecError> {
    let mut elements = Vec::new();
    let mut i = 0;
    while i < data.len() {
        let tag = data[i];
        i += 1;
        match tag {
            TAG_INT => {
                let raw = payload(data, i, 4)?;
                elements.push(Element::Int(i32::from_le_bytes(raw.try_into().unwrap())));
                i += 4;
            }
            TAG_FLOAT => {
                let raw = payload(data, i, 8)?;
                elements.push(Element::Float(f64::from_le_bytes(raw.try_into().unwrap())));
                i += 8;
            }
            TAG_STRING => {
                let len = *data.get(i).ok_or(CodecError::Malformed("truncated string length"))? as usize;
                i += 1;
                let raw = payload(data, i, len)?;
                let s = std::str::from_utf8(raw).map_err(|_| CodecError::InvalidUtf8)?;
                elements.push(Element::Str(s.to_string()));
                i += len;
            }
            TAG_TUPLE => {
                return Err(CodecError::Unsupported("nested tuple"));
            }
            TAG_ANY => elements.push(Element::Any),
            TAG_NONE => elements.push(Element::None),
            _ => return Err(CodecError::Malformed("unknown element tag")),
        }
    }
    Ok(Tuple::new(elements))
}

fn payload(data: &[u8], at: usize, len: usize) -> Result<&[u8], CodecError> {
    data.get(at..at + len)
        .ok_or(CodecError::Malformed("truncated element payload"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple;

    #[test]
    fn test_round_trip() {
        let t = tuple![42, -1, 2.5, "hello", Element::Any, Element::None];
        let decoded = decode(&encode(&t).unwrap()).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn test_round_trip_empty() {
        let t = Tuple::new(vec![]);
        assert_eq!(decode(&encode(&t).unwrap()).unwrap(), t);
    }

    #[test]
    fn test_wire_layout() {
        let t = tuple![1, "ab"];
        let bytes = encode(&t).unwrap();
        assert_eq!(bytes, vec![1, 1, 0, 0, 0, 3, 2, b'a', b'b']);
    }

    #[test]
    fn test_float_payload_is_little_endian_ieee754() {
        let bytes = encode(&tuple![1.5]).unwrap();
        assert_eq!(bytes[0], 2);
        assert_eq!(&bytes[1..], &1.5f64.to_le_bytes());
    }

    #[test]
    fn test_nested_tuple_unsupported() {
        let t = tuple![Tuple::new(vec![Element::Int(1)])];
        assert!(matches!(encode(&t), Err(CodecError::Unsupported(_))));
        assert!(matches!(decode(&[4]), Err(CodecError::Unsupported(_))));
    }

    #[test]
    fn test_oversize_string_unsupported() {
        let t = tuple!["x".repeat(256)];
        assert!(matches!(encode(&t), Err(CodecError::Unsupported(_))));
        let max = tuple!["x".repeat(255)];
        assert!(encode(&max).is_ok());
    }

    #[test]
    fn test_unknown_tag_malformed() {
        assert!(matches!(decode(&[9]), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_truncated_payload_malformed() {
        assert!(matches!(decode(&[1, 0, 0]), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(&[3]), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(&[3, 5, b'a']), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn test_invalid_utf8() {
        assert!(matches!(decode(&[3, 2, 0xff, 0xfe]), Err(CodecError::InvalidUtf8)));
    }
}
