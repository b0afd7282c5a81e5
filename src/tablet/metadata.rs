//! Tablet metadata log.
//!
//! Like a manifest of version edits, but for one tablet: every change to
//! the tablet's durable layout is appended as a [`MetadataEdit`] and synced
//! before it takes effect. Replaying the log from the start yields the
//! [`TabletMetaState`] the tablet opens from.
//!
//! ```text
//! +------------------+
//! | Header (16 bytes)|
//! +------------------+
//! | Edit 1           |  length:u32 | bincode(MetadataEdit) | crc32:u32
//! +------------------+
//! | ...              |
//! +------------------+
//! ```

use super::rowset::MutationTarget;
use crate::encoding::bincode;
use crate::encoding::frame::{self, FileHeader, RecordReader, METADATA_MAGIC};
use crate::error::Result;
use crate::mvcc::Timestamp;
use crate::schema::Schema;
use crate::Error;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const METADATA_FILE: &str = "tablet-meta.log";

/// Config sequence number a tablet is created with. Every open bumps it.
pub const INITIAL_CONFIG_SEQNO: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowSetMeta {
    pub id: u64,
    /// Flushed delta files, oldest first
    pub delta_ids: Vec<u64>,
    /// Every delta memstore id below this one is flushed
    pub next_dms_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataEdit {
    Create {
        tablet_id: String,
        table_id: String,
        table_name: String,
        start_key: Vec<u8>,
        end_key: Vec<u8>,
        schema: Schema,
    },
    AlterSchema {
        schema: Schema,
        version: u32,
    },
    ChangeConfig {
        seqno: i64,
    },
    Flush {
        mrs_id: u64,
        rowset: RowSetMeta,
        next_rowset_id: u64,
        clock: Timestamp,
    },
    Compaction {
        removed: Vec<u64>,
        added: RowSetMeta,
        next_rowset_id: u64,
        clock: Timestamp,
    },
    DeltaFlush {
        rowset_id: u64,
        delta_id: u64,
        next_dms_id: u64,
        clock: Timestamp,
    },
}

/// Durable tablet layout reconstructed from the metadata log.
#[derive(Debug, Clone, PartialEq)]
pub struct TabletMetaState {
    pub tablet_id: String,
    pub table_id: String,
    pub table_name: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub schema: Schema,
    pub schema_version: u32,
    pub config_seqno: i64,
    pub rowsets: BTreeMap<u64, RowSetMeta>,
    /// Row sets merged away by a committed compaction
    pub compacted_rowsets: BTreeSet<u64>,
    /// Highest MemRowSet id whose contents are in a committed row set
    pub last_durable_mrs_id: u64,
    pub next_rowset_id: u64,
    /// Highest clock value recorded by a commit
    pub clock: Timestamp,
}

impl TabletMetaState {
    fn from_create(edit: MetadataEdit) -> Result<Self> {
        match edit {
            MetadataEdit::Create {
                tablet_id,
                table_id,
                table_name,
                start_key,
                end_key,
                schema,
            } => Ok(Self {
                tablet_id,
                table_id,
                table_name,
                start_key,
                end_key,
                schema,
                schema_version: 0,
                config_seqno: INITIAL_CONFIG_SEQNO,
                rowsets: BTreeMap::new(),
                compacted_rowsets: BTreeSet::new(),
                last_durable_mrs_id: 0,
                next_rowset_id: 1,
                clock: Timestamp::INITIAL,
            }),
            other => Err(Error::Corruption(format!(
                "Metadata log must start with a create edit, found {:?}",
                other
            ))),
        }
    }

    fn apply(&mut self, edit: MetadataEdit) -> Result<()> {
        match edit {
            MetadataEdit::Create { .. } => {
                return Err(Error::Corruption(
                    "Duplicate create edit in metadata log".to_string(),
                ))
            }
            MetadataEdit::AlterSchema { schema, version } => {
                self.schema = schema;
                self.schema_version = version;
            }
            MetadataEdit::ChangeConfig { seqno } => self.config_seqno = seqno,
            MetadataEdit::Flush {
                mrs_id,
                rowset,
                next_rowset_id,
                clock,
            } => {
                self.last_durable_mrs_id = self.last_durable_mrs_id.max(mrs_id);
                self.rowsets.insert(rowset.id, rowset);
                self.advance(next_rowset_id, clock);
            }
            MetadataEdit::Compaction {
                removed,
                added,
                next_rowset_id,
                clock,
            } => {
                for id in removed {
                    self.rowsets.remove(&id);
                    self.compacted_rowsets.insert(id);
                }
                self.rowsets.insert(added.id, added);
                self.advance(next_rowset_id, clock);
            }
            MetadataEdit::DeltaFlush {
                rowset_id,
                delta_id,
                next_dms_id,
                clock,
            } => {
                let rowset = self.rowsets.get_mut(&rowset_id).ok_or_else(|| {
                    Error::Corruption(format!(
                        "Delta flush for unknown row set {}",
                        rowset_id
                    ))
                })?;
                rowset.delta_ids.push(delta_id);
                rowset.next_dms_id = rowset.next_dms_id.max(next_dms_id);
                self.clock = self.clock.max(clock);
            }
        }
        Ok(())
    }

    /// Whether the store a logged operation was applied to has been made
    /// durable by a committed flush, compaction or delta flush.
    pub fn is_durable(&self, target: &MutationTarget) -> bool {
        match *target {
            MutationTarget::MemRowSet(id) => id <= self.last_durable_mrs_id,
            MutationTarget::DiskRowSet { rowset_id, dms_id } => {
                self.compacted_rowsets.contains(&rowset_id)
                    || self
                        .rowsets
                        .get(&rowset_id)
                        .is_some_and(|rs| dms_id < rs.next_dms_id)
            }
        }
    }

    fn advance(&mut self, next_rowset_id: u64, clock: Timestamp) {
        self.next_rowset_id = self.next_rowset_id.max(next_rowset_id);
        self.clock = self.clock.max(clock);
    }
}

pub struct TabletMetadata {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    state: RwLock<TabletMetaState>,
}

impl TabletMetadata {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(METADATA_FILE)
    }

    pub fn exists(dir: &Path) -> bool {
        Self::path(dir).exists()
    }

    /// Start a new metadata log whose first edit is `create`.
    pub fn create(dir: &Path, create: MetadataEdit) -> Result<Self> {
        let path = Self::path(dir);
        let state = TabletMetaState::from_create(create.clone())?;

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        FileHeader::new(METADATA_MAGIC).write_to(&mut writer)?;
        frame::write_record(&mut writer, &bincode::serialize(&create)?)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            state: RwLock::new(state),
        })
    }

    /// Open an existing log and replay it.
    pub fn open(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let (state, valid_len) = Self::replay(&path)?;
        let file = OpenOptions::new().append(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            tracing::warn!(path = %path.display(), valid_len, "Truncating torn metadata edit");
            file.set_len(valid_len)?;
        }
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            state: RwLock::new(state),
        })
    }

    /// Rebuild the tablet state from the log at `path`, along with the
    /// length of its intact prefix.
    ///
    /// A torn final edit was never acknowledged and is ignored.
    pub fn replay(path: &Path) -> Result<(TabletMetaState, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        FileHeader::read_from(&mut reader, METADATA_MAGIC)?;

        let mut state: Option<TabletMetaState> = None;
        let mut edits = 0;
        let mut valid_len = frame::HEADER_SIZE as u64;
        for payload in RecordReader::new(reader, true) {
            let payload = payload?;
            valid_len += payload.len() as u64 + 8;
            let edit: MetadataEdit = bincode::deserialize(&payload)?;
            match state.as_mut() {
                None => state = Some(TabletMetaState::from_create(edit)?),
                Some(state) => state.apply(edit)?,
            }
            edits += 1;
        }

        let state = state.ok_or_else(|| {
            Error::Corruption(format!("Empty metadata log {}", path.display()))
        })?;
        tracing::debug!(
            tablet_id = %state.tablet_id,
            edits,
            rowsets = state.rowsets.len(),
            "Replayed tablet metadata"
        );
        Ok((state, valid_len))
    }

    /// Durably append an edit, then make it visible in the in-memory state.
    /// An edit that does not apply cleanly is rejected before it is written.
    pub fn commit(&self, edit: MetadataEdit) -> Result<()> {
        let payload = bincode::serialize(&edit)?;
        let mut writer = self.writer.lock();

        let mut next = self.state.read().clone();
        next.apply(edit)?;

        frame::write_record(&mut *writer, &payload)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;

        *self.state.write() = next;
        Ok(())
    }

    pub fn state(&self) -> TabletMetaState {
        self.state.read().clone()
    }

    pub fn tablet_id(&self) -> String {
        self.state.read().tablet_id.clone()
    }

    pub fn file_path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, SchemaBuilder};
    use tempfile::TempDir;

    fn create_edit() -> MetadataEdit {
        let schema = SchemaBuilder::new()
            .add_key_column("key", DataType::UInt32)
            .add_column("int_val", DataType::UInt32, false)
            .build()
            .unwrap()
            .assign_column_ids()
            .unwrap();
        MetadataEdit::Create {
            tablet_id: "tablet-1".to_string(),
            table_id: "table-1".to_string(),
            table_name: "test".to_string(),
            start_key: Vec::new(),
            end_key: Vec::new(),
            schema,
        }
    }

    fn rowset(id: u64) -> RowSetMeta {
        RowSetMeta {
            id,
            delta_ids: Vec::new(),
            next_dms_id: 0,
        }
    }

    #[test]
    fn test_create_and_replay() -> Result<()> {
        let dir = TempDir::new()?;
        let metadata = TabletMetadata::create(dir.path(), create_edit())?;
        assert_eq!(metadata.state().config_seqno, INITIAL_CONFIG_SEQNO);

        metadata.commit(MetadataEdit::ChangeConfig { seqno: 0 })?;
        metadata.commit(MetadataEdit::Flush {
            mrs_id: 1,
            rowset: rowset(1),
            next_rowset_id: 2,
            clock: Timestamp(10),
        })?;
        metadata.commit(MetadataEdit::Flush {
            mrs_id: 2,
            rowset: rowset(2),
            next_rowset_id: 3,
            clock: Timestamp(20),
        })?;
        metadata.commit(MetadataEdit::DeltaFlush {
            rowset_id: 2,
            delta_id: 0,
            next_dms_id: 1,
            clock: Timestamp(25),
        })?;
        metadata.commit(MetadataEdit::Compaction {
            removed: vec![1, 2],
            added: rowset(3),
            next_rowset_id: 4,
            clock: Timestamp(30),
        })?;
        let expected = metadata.state();
        drop(metadata);

        let reopened = TabletMetadata::open(dir.path())?;
        let state = reopened.state();
        assert_eq!(state, expected);
        assert_eq!(state.config_seqno, 0);
        assert_eq!(state.last_durable_mrs_id, 2);
        assert_eq!(state.rowsets.keys().copied().collect::<Vec<_>>(), vec![3]);
        assert!(state.compacted_rowsets.contains(&1));
        assert_eq!(state.next_rowset_id, 4);
        assert_eq!(state.clock, Timestamp(30));
        Ok(())
    }

    #[test]
    fn test_torn_edit_truncated_on_open() -> Result<()> {
        let dir = TempDir::new()?;
        let metadata = TabletMetadata::create(dir.path(), create_edit())?;
        metadata.commit(MetadataEdit::ChangeConfig { seqno: 0 })?;
        drop(metadata);

        let path = TabletMetadata::path(dir.path());
        let mut file = OpenOptions::new().append(true).open(&path)?;
        file.write_all(&[0, 0, 0, 64, 1, 2, 3])?;
        drop(file);

        let metadata = TabletMetadata::open(dir.path())?;
        metadata.commit(MetadataEdit::ChangeConfig { seqno: 1 })?;
        drop(metadata);

        assert_eq!(TabletMetadata::open(dir.path())?.state().config_seqno, 1);
        Ok(())
    }

    #[test]
    fn test_create_twice_fails() -> Result<()> {
        let dir = TempDir::new()?;
        TabletMetadata::create(dir.path(), create_edit())?;
        assert!(TabletMetadata::create(dir.path(), create_edit()).is_err());
        Ok(())
    }

    #[test]
    fn test_delta_flush_for_unknown_rowset() -> Result<()> {
        let dir = TempDir::new()?;
        let metadata = TabletMetadata::create(dir.path(), create_edit())?;
        let result = metadata.commit(MetadataEdit::DeltaFlush {
            rowset_id: 42,
            delta_id: 0,
            next_dms_id: 1,
            clock: Timestamp(1),
        });
        assert!(matches!(result, Err(Error::Corruption(_))));
        Ok(())
    }
}
