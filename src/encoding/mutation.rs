//! Client mutation buffers.
//!
//! A write request carries its updates and deletes as one buffer holding a
//! record per mutated row key:
//!
//! ```text
//! +------------+----------+------------------+
//! | length:u32 | type:u8  | payload          |
//! +------------+----------+------------------+
//! | 4 bytes LE | 1 byte   | length - 1 bytes |
//! +------------+----------+------------------+
//! ```
//!
//! Types: `1` UPDATE, `2` DELETE, `3` REINSERT.
//!
//! - UPDATE payload: `count:u16` followed by `count` pairs of
//!   `column:u16` (index into the client schema) and the column's value.
//! - DELETE payload: empty.
//! - REINSERT payload: a full client row. Clients may not send these.
//!
//! Values are little-endian integers or `len:u32` prefixed bytes for strings
//! and binary. Nullable columns prefix the value with a flag byte: `0` for
//! NULL (nothing follows), `1` when a value follows.
//!
//! Framing damage (a truncated length, or a length running past the end of
//! the buffer) invalidates the whole buffer. Anything wrong inside a well
//! framed record only fails that record.

use crate::error::Result;
use crate::schema::{ColumnSchema, DataType, Schema, Value};
use crate::Error;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};

pub const MUTATION_UPDATE: u8 = 1;
pub const MUTATION_DELETE: u8 = 2;
pub const MUTATION_REINSERT: u8 = 3;

const NULL_FLAG: u8 = 0;
const PRESENT_FLAG: u8 = 1;

/// A decoded client mutation, with columns addressed by client schema index.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMutation {
    Update(Vec<(usize, Value)>),
    Delete,
}

/// Split a mutation buffer into per-row results.
///
/// The outer error is a whole-request failure; inner errors belong to the
/// individual row.
pub fn decode_mutations(buf: &[u8], schema: &Schema) -> Result<Vec<Result<ClientMutation>>> {
    let mut out = Vec::new();
    let mut rest = buf;

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::InvalidMutation(format!(
                "Truncated length prefix: {} bytes left in mutation buffer",
                rest.len()
            )));
        }
        let len = (&rest[..4]).read_u32::<LittleEndian>()? as usize;
        rest = &rest[4..];
        if len > rest.len() {
            return Err(Error::InvalidMutation(format!(
                "Mutation record length {} exceeds the {} bytes remaining",
                len,
                rest.len()
            )));
        }
        let (record, tail) = rest.split_at(len);
        rest = tail;
        out.push(decode_record(record, schema));
    }

    Ok(out)
}

fn decode_record(record: &[u8], schema: &Schema) -> Result<ClientMutation> {
    let Some((&kind, payload)) = record.split_first() else {
        return Err(Error::InvalidMutationType(
            "Empty mutation record: bad type enum value".to_string(),
        ));
    };

    match kind {
        MUTATION_UPDATE => decode_update(payload, schema),
        MUTATION_DELETE => {
            if !payload.is_empty() {
                return Err(Error::InvalidMutation(format!(
                    "DELETE carries {} unexpected payload bytes",
                    payload.len()
                )));
            }
            Ok(ClientMutation::Delete)
        }
        MUTATION_REINSERT => Err(Error::IllegalReinsert(
            "User may not specify REINSERT mutations".to_string(),
        )),
        other => Err(Error::InvalidMutationType(format!(
            "bad type enum value: {}",
            other
        ))),
    }
}

fn decode_update(payload: &[u8], schema: &Schema) -> Result<ClientMutation> {
    let malformed = |e: std::io::Error| Error::InvalidMutation(format!("Malformed UPDATE: {}", e));

    let mut cursor = Cursor::new(payload);
    let count = cursor.read_u16::<LittleEndian>().map_err(malformed)? as usize;
    if count == 0 {
        return Err(Error::InvalidMutation("UPDATE sets no columns".to_string()));
    }

    let mut cells = Vec::with_capacity(count);
    for _ in 0..count {
        let idx = cursor.read_u16::<LittleEndian>().map_err(malformed)? as usize;
        if idx >= schema.num_columns() {
            return Err(Error::InvalidMutation(format!(
                "UPDATE references column {} of a {}-column schema",
                idx,
                schema.num_columns()
            )));
        }
        let value = read_value(&mut cursor, schema.column(idx)).map_err(malformed)?;
        cells.push((idx, value));
    }

    if (cursor.position() as usize) != payload.len() {
        return Err(Error::InvalidMutation(format!(
            "UPDATE has {} trailing bytes",
            payload.len() - cursor.position() as usize
        )));
    }
    Ok(ClientMutation::Update(cells))
}

fn read_value<R: Read>(reader: &mut R, col: &ColumnSchema) -> std::io::Result<Value> {
    if col.nullable && reader.read_u8()? == NULL_FLAG {
        return Ok(Value::Null);
    }
    let value = match col.data_type {
        DataType::UInt8 => Value::UInt8(reader.read_u8()?),
        DataType::UInt16 => Value::UInt16(reader.read_u16::<LittleEndian>()?),
        DataType::UInt32 => Value::UInt32(reader.read_u32::<LittleEndian>()?),
        DataType::UInt64 => Value::UInt64(reader.read_u64::<LittleEndian>()?),
        DataType::Int32 => Value::Int32(reader.read_i32::<LittleEndian>()?),
        DataType::Int64 => Value::Int64(reader.read_i64::<LittleEndian>()?),
        DataType::String => {
            let bytes = read_len_prefixed(reader)?;
            Value::String(String::from_utf8(bytes).map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e)
            })?)
        }
        DataType::Binary => Value::Binary(read_len_prefixed(reader)?),
    };
    Ok(value)
}

fn read_len_prefixed<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32::<LittleEndian>()? as usize;
    let mut bytes = Vec::new();
    reader.take(len as u64).read_to_end(&mut bytes)?;
    if bytes.len() != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "value runs past the end of the record",
        ));
    }
    Ok(bytes)
}

fn write_value(buf: &mut Vec<u8>, col: &ColumnSchema, value: &Value) -> Result<()> {
    col.check_value(value)?;
    if col.nullable {
        if value.is_null() {
            buf.push(NULL_FLAG);
            return Ok(());
        }
        buf.push(PRESENT_FLAG);
    }
    match value {
        Value::Null => {}
        Value::UInt8(v) => buf.write_u8(*v)?,
        Value::UInt16(v) => buf.write_u16::<LittleEndian>(*v)?,
        Value::UInt32(v) => buf.write_u32::<LittleEndian>(*v)?,
        Value::UInt64(v) => buf.write_u64::<LittleEndian>(*v)?,
        Value::Int32(v) => buf.write_i32::<LittleEndian>(*v)?,
        Value::Int64(v) => buf.write_i64::<LittleEndian>(*v)?,
        Value::String(s) => {
            buf.write_u32::<LittleEndian>(s.len() as u32)?;
            buf.extend_from_slice(s.as_bytes());
        }
        Value::Binary(b) => {
            buf.write_u32::<LittleEndian>(b.len() as u32)?;
            buf.extend_from_slice(b);
        }
    }
    Ok(())
}

/// Builds mutation buffers on the client side.
#[derive(Debug, Default)]
pub struct MutationBufferEncoder {
    buf: Vec<u8>,
    count: usize,
}

impl MutationBufferEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_record(&mut self, kind: u8, payload: &[u8]) {
        self.buf
            .extend_from_slice(&((payload.len() + 1) as u32).to_le_bytes());
        self.buf.push(kind);
        self.buf.extend_from_slice(payload);
        self.count += 1;
    }

    /// Append an UPDATE setting `cells` (client column index, value).
    pub fn add_update(&mut self, schema: &Schema, cells: &[(usize, Value)]) -> Result<()> {
        let mut payload = Vec::new();
        payload.write_u16::<LittleEndian>(cells.len() as u16)?;
        for (idx, value) in cells {
            if *idx >= schema.num_columns() {
                return Err(Error::InvalidArgument(format!("No column at index {}", idx)));
            }
            payload.write_u16::<LittleEndian>(*idx as u16)?;
            write_value(&mut payload, schema.column(*idx), value)?;
        }
        self.push_record(MUTATION_UPDATE, &payload);
        Ok(())
    }

    pub fn add_delete(&mut self) {
        self.push_record(MUTATION_DELETE, &[]);
    }

    /// Append a REINSERT of a full row. Servers reject these from clients.
    pub fn add_reinsert(&mut self, schema: &Schema, values: &[Value]) -> Result<()> {
        let mut payload = Vec::new();
        for (col, value) in schema.columns().iter().zip(values) {
            write_value(&mut payload, col, value)?;
        }
        self.push_record(MUTATION_REINSERT, &payload);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}
