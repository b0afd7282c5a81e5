//! Order-preserving encoding of primary key values.
//!
//! Encoded composite keys compare byte-wise in the same order as the typed
//! tuples they came from, so the MemRowSet skip list and the sorted base
//! data of disk row sets can be keyed by plain byte strings.
//!
//! - Unsigned integers: big-endian.
//! - Signed integers: sign bit flipped, then big-endian.
//! - Strings and binary: `0x00` escaped as `0x00 0xFF`, terminated by
//!   `0x00 0x00`, which keeps prefixes ordered before their extensions.

use crate::error::Result;
use crate::schema::{DataType, Value};
use crate::Error;

const ESCAPE: u8 = 0x00;
const ESCAPED_ZERO: u8 = 0xFF;
const TERMINATOR: u8 = 0x00;

/// Append the encoding of one key value to `buf`.
pub fn encode_value_into(buf: &mut Vec<u8>, value: &Value) -> Result<()> {
    match value {
        Value::Null => {
            return Err(Error::InvalidMutation(
                "Key columns may not be NULL".to_string(),
            ))
        }
        Value::UInt8(v) => buf.push(*v),
        Value::UInt16(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::UInt32(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::UInt64(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Value::Int32(v) => buf.extend_from_slice(&((*v as u32) ^ (1u32 << 31)).to_be_bytes()),
        Value::Int64(v) => buf.extend_from_slice(&((*v as u64) ^ (1u64 << 63)).to_be_bytes()),
        Value::String(s) => encode_bytes(buf, s.as_bytes()),
        Value::Binary(b) => encode_bytes(buf, b),
    }
    Ok(())
}

fn encode_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    for &b in bytes {
        if b == ESCAPE {
            buf.push(ESCAPE);
            buf.push(ESCAPED_ZERO);
        } else {
            buf.push(b);
        }
    }
    buf.push(ESCAPE);
    buf.push(TERMINATOR);
}

fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if bytes.len() < n {
        return Err(Error::Encoding("Truncated key".to_string()));
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

fn decode_bytes(bytes: &mut &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        match take(bytes, 1)?[0] {
            ESCAPE => match take(bytes, 1)?[0] {
                TERMINATOR => return Ok(out),
                ESCAPED_ZERO => out.push(0x00),
                other => {
                    return Err(Error::Encoding(format!(
                        "Invalid escape sequence 0x00 0x{other:02x}"
                    )))
                }
            },
            b => out.push(b),
        }
    }
}

/// Decode a composite key whose column types are given in key order.
pub fn decode_values(mut bytes: &[u8], types: &[DataType]) -> Result<Vec<Value>> {
    let mut values = Vec::with_capacity(types.len());
    for data_type in types {
        let value = match data_type {
            DataType::UInt8 => Value::UInt8(take(&mut bytes, 1)?[0]),
            DataType::UInt16 => Value::UInt16(u16::from_be_bytes(fixed(&mut bytes)?)),
            DataType::UInt32 => Value::UInt32(u32::from_be_bytes(fixed(&mut bytes)?)),
            DataType::UInt64 => Value::UInt64(u64::from_be_bytes(fixed(&mut bytes)?)),
            DataType::Int32 => {
                let raw = u32::from_be_bytes(fixed(&mut bytes)?);
                Value::Int32((raw ^ (1u32 << 31)) as i32)
            }
            DataType::Int64 => {
                let raw = u64::from_be_bytes(fixed(&mut bytes)?);
                Value::Int64((raw ^ (1u64 << 63)) as i64)
            }
            DataType::String => {
                let raw = decode_bytes(&mut bytes)?;
                Value::String(
                    String::from_utf8(raw)
                        .map_err(|_| Error::Encoding("Invalid UTF-8 sequence".to_string()))?,
                )
            }
            DataType::Binary => Value::Binary(decode_bytes(&mut bytes)?),
        };
        values.push(value);
    }

    if !bytes.is_empty() {
        return Err(Error::Encoding(format!(
            "{} trailing bytes after key",
            bytes.len()
        )));
    }
    Ok(values)
}

fn fixed<const N: usize>(bytes: &mut &[u8]) -> Result<[u8; N]> {
    take(bytes, N)?
        .try_into()
        .map_err(|_| Error::Encoding("Truncated key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(values: &[Value]) -> Vec<u8> {
        let mut buf = Vec::new();
        for v in values {
            encode_value_into(&mut buf, v).unwrap();
        }
        buf
    }

    #[test]
    fn test_signed_ordering() {
        let encoded = [-100i64, -1, 0, 1, 100]
            .iter()
            .map(|v| encode(&[Value::Int64(*v)]))
            .collect::<Vec<_>>();
        assert!(encoded.windows(2).all(|w| w[0] < w[1]));

        let neg = encode(&[Value::Int32(-5)]);
        let pos = encode(&[Value::Int32(5)]);
        assert!(neg < pos);
    }

    #[test]
    fn test_string_prefix_ordering() {
        // A composite key must order by its first column before the second.
        let a = encode(&[Value::String("a".into()), Value::UInt32(9)]);
        let ab = encode(&[Value::String("ab".into()), Value::UInt32(0)]);
        assert!(a < ab);

        let with_nul = encode(&[Value::Binary(vec![b'a', 0x00, b'b'])]);
        assert_eq!(
            decode_values(&with_nul, &[DataType::Binary]).unwrap(),
            vec![Value::Binary(vec![b'a', 0x00, b'b'])]
        );
    }

    #[test]
    fn test_decode_composite() {
        let values = vec![
            Value::UInt32(1234),
            Value::String("hello 50".into()),
            Value::Int64(-7),
        ];
        let encoded = encode(&values);
        let decoded =
            decode_values(&encoded, &[DataType::UInt32, DataType::String, DataType::Int64]).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn test_null_and_truncation_rejected() {
        let mut buf = Vec::new();
        assert!(encode_value_into(&mut buf, &Value::Null).is_err());

        assert!(decode_values(&[0x00, 0x01], &[DataType::UInt32]).is_err());
        assert!(decode_values(&[0x00, 0x00, 0x00, 0x01, 0x02], &[DataType::UInt32]).is_err());
    }
}
