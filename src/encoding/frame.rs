//! Checksummed record framing shared by every file the engine writes.
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|  magic:[u8;8] | version:u32 | reserved:u32
//! +------------------+
//! | Record 1         |
//! +------------------+
//! | Record 2         |
//! +------------------+
//! | ...              |
//! +------------------+
//! ```
//!
//! Each record is:
//!
//! ```text
//! +-----------+------------------+-----------+
//! |length:u32 | payload          |crc32:u32  |
//! +-----------+------------------+-----------+
//! | 4 bytes   | variable length  | 4 bytes   |
//! +-----------+------------------+-----------+
//! ```
//!
//! All integers are big-endian and the CRC covers the payload only.

use crate::error::Result;
use crate::Error;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};
use std::io::{self, Read, Write};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const HEADER_SIZE: usize = 16;
const FORMAT_VERSION: u32 = 1;

pub const WAL_MAGIC: &[u8; 8] = b"TABLETWL";
pub const METADATA_MAGIC: &[u8; 8] = b"TABLETMD";
pub const BASE_MAGIC: &[u8; 8] = b"TABLETBS";
pub const DELTA_MAGIC: &[u8; 8] = b"TABLETDL";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FileHeader {
    pub magic: [u8; 8],
    pub version: u32,
}

impl FileHeader {
    pub fn new(magic: &[u8; 8]) -> Self {
        Self {
            magic: *magic,
            version: FORMAT_VERSION,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.magic);
        buf[8..12].copy_from_slice(&self.version.to_be_bytes());
        buf
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.encode())?;
        Ok(())
    }

    /// Read a header and check it carries `magic` and a known version.
    pub fn read_from<R: Read>(reader: &mut R, magic: &[u8; 8]) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf).map_err(|e| {
            Error::Corruption(format!("Failed to read file header: {}", e))
        })?;

        let mut found = [0u8; 8];
        found.copy_from_slice(&buf[0..8]);
        if &found != magic {
            return Err(Error::Corruption(format!(
                "Bad file magic: expected {:?}, found {:?}",
                String::from_utf8_lossy(magic),
                String::from_utf8_lossy(&found)
            )));
        }

        let version = (&buf[8..12]).read_u32::<BigEndian>()?;
        if version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "Unsupported file format version {}",
                version
            )));
        }

        Ok(Self {
            magic: found,
            version,
        })
    }
}

/// Append one framed record; returns the number of bytes written.
pub fn write_record<W: Write>(writer: &mut W, payload: &[u8]) -> Result<u64> {
    let checksum = CRC32.checksum(payload);
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.write_u32::<BigEndian>(checksum)?;
    Ok(payload.len() as u64 + 8)
}

/// Iterates the payloads of framed records.
///
/// A record cut short by the end of the input is a torn tail write: when
/// `tolerate_torn_tail` is set, iteration stops there instead of failing.
pub struct RecordReader<R: Read> {
    reader: R,
    tolerate_torn_tail: bool,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R, tolerate_torn_tail: bool) -> Self {
        Self {
            reader,
            tolerate_torn_tail,
            done: false,
        }
    }

    fn torn(&mut self, what: &str, err: io::Error) -> Result<Option<Vec<u8>>> {
        if err.kind() == io::ErrorKind::UnexpectedEof && self.tolerate_torn_tail {
            tracing::warn!(what, "Ignoring torn record at end of file");
            Ok(None)
        } else {
            Err(Error::Corruption(format!("Failed to read {}: {}", what, err)))
        }
    }

    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let record_len = match self.reader.read_u32::<BigEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; record_len];
        if let Err(e) = self.reader.read_exact(&mut payload) {
            return self.torn("record payload", e);
        }

        let stored_crc = match self.reader.read_u32::<BigEndian>() {
            Ok(crc) => crc,
            Err(e) => return self.torn("record checksum", e),
        };

        if CRC32.checksum(&payload) != stored_crc {
            return Err(Error::Corruption("Record checksum mismatch".to_string()));
        }

        Ok(Some(payload))
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read() {
            Ok(Some(payload)) => Some(Ok(payload)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_header_magic_checked() {
        let mut buf = Vec::new();
        FileHeader::new(WAL_MAGIC).write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let header = FileHeader::read_from(&mut Cursor::new(&buf), WAL_MAGIC).unwrap();
        assert_eq!(&header.magic, WAL_MAGIC);

        let err = FileHeader::read_from(&mut Cursor::new(&buf), DELTA_MAGIC).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_records_and_torn_tail() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"first").unwrap();
        write_record(&mut buf, b"second").unwrap();
        let full_len = buf.len();
        write_record(&mut buf, b"third").unwrap();
        buf.truncate(full_len + 6);

        let records: Vec<_> = RecordReader::new(Cursor::new(&buf), true)
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(records, vec![b"first".to_vec(), b"second".to_vec()]);

        let strict: Result<Vec<_>> = RecordReader::new(Cursor::new(&buf), false).collect();
        assert!(matches!(strict, Err(Error::Corruption(_))));
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut buf = Vec::new();
        write_record(&mut buf, b"payload").unwrap();
        buf[5] ^= 0xFF;

        let result: Result<Vec<_>> = RecordReader::new(Cursor::new(&buf), true).collect();
        assert!(matches!(result, Err(Error::Corruption(_))));
    }
}
