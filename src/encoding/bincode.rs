use crate::error::Result;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Serialize a value using bincode
pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| Error::Encoding(format!("Serialization failed: {}", e)))
}

/// Serialize a value into a writer using bincode
pub fn serialize_into<T: Serialize, W: Write>(writer: W, value: &T) -> Result<()> {
    bincode::serialize_into(writer, value)
        .map_err(|e| Error::Encoding(format!("Serialization failed: {}", e)))
}

/// Deserialize a value from a byte slice using bincode
pub fn deserialize<T: for<'a> Deserialize<'a>>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Encoding(format!("Deserialization failed: {}", e)))
}

/// Deserialize a value from a reader using bincode
pub fn deserialize_from<T: for<'a> Deserialize<'a>, R: Read>(reader: R) -> Result<T> {
    bincode::deserialize_from(reader)
        .map_err(|e| Error::Encoding(format!("Deserialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Row, RowChange, Value};

    #[test]
    fn test_row_change_survives_serialization() {
        let row: Row = [(0, Value::UInt32(1)), (2, Value::String("x".into()))]
            .into_iter()
            .collect();
        let change = RowChange::Reinsert(row);

        let bytes = serialize(&change).unwrap();
        let decoded: RowChange = deserialize(&bytes).unwrap();
        assert_eq!(decoded, change);

        let mut buf = Vec::new();
        serialize_into(&mut buf, &change).unwrap();
        let decoded: RowChange = deserialize_from(buf.as_slice()).unwrap();
        assert_eq!(decoded, change);
    }

    #[test]
    fn test_garbage_is_an_encoding_error() {
        let result: Result<RowChange> = deserialize(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert!(matches!(result, Err(Error::Encoding(_))));
    }
}
