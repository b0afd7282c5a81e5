//! Owns the tablets hosted in one data directory.
//!
//! ```text
//! <dir>/
//!   tabletstore.lock
//!   tablets/
//!     <tablet_id>/      one Tablet directory each
//! ```

use crate::config::ServerConfig;
use crate::error::Result;
use crate::flock::FileLock;
use crate::tablet::{Tablet, TabletInfo, TabletMetadata};
use crate::Error;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

const LOCK_FILE: &str = "tabletstore.lock";

pub struct TabletManager {
    config: ServerConfig,
    tablets: RwLock<HashMap<String, Arc<Tablet>>>,
    _lock: FileLock,
}

impl TabletManager {
    /// Lock the data directory and bootstrap every tablet found in it.
    pub fn open(config: ServerConfig) -> Result<Self> {
        let tablets_dir = config.tablets_dir();
        std::fs::create_dir_all(&tablets_dir)?;
        let lock = FileLock::lock(config.dir.join(LOCK_FILE))?;

        let mut tablets = HashMap::new();
        for entry in std::fs::read_dir(&tablets_dir)? {
            let path = entry?.path();
            if !path.is_dir() || !TabletMetadata::exists(&path) {
                tracing::warn!(path = %path.display(), "Skipping directory without tablet metadata");
                continue;
            }
            let tablet = Tablet::open(config.tablet.with_dir(&path))?;
            tracing::info!(tablet_id = %tablet.tablet_id(), "Opened tablet");
            tablets.insert(tablet.tablet_id().to_string(), Arc::new(tablet));
        }

        tracing::info!(
            dir = %config.dir.display(),
            tablets = tablets.len(),
            "Tablet manager started"
        );
        Ok(Self {
            config,
            tablets: RwLock::new(tablets),
            _lock: lock,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn tablet_dir(&self, tablet_id: &str) -> Result<PathBuf> {
        let valid = !tablet_id.is_empty()
            && tablet_id != "."
            && tablet_id != ".."
            && !tablet_id.contains(['/', '\\']);
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "Invalid tablet id {:?}",
                tablet_id
            )));
        }
        Ok(self.config.tablets_dir().join(tablet_id))
    }

    pub fn create_tablet(&self, info: TabletInfo) -> Result<Arc<Tablet>> {
        let dir = self.tablet_dir(&info.tablet_id)?;
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&info.tablet_id) {
            return Err(Error::TabletAlreadyExists(info.tablet_id));
        }

        let tablet_id = info.tablet_id.clone();
        let tablet = Arc::new(Tablet::create(self.config.tablet.with_dir(dir), info)?);
        tablets.insert(tablet_id.clone(), tablet.clone());
        tracing::info!(tablet_id = %tablet_id, "Created tablet");
        Ok(tablet)
    }

    /// Shut the tablet down and delete its directory.
    pub fn delete_tablet(&self, tablet_id: &str) -> Result<()> {
        let tablet = self
            .tablets
            .write()
            .remove(tablet_id)
            .ok_or_else(|| Error::TabletNotFound(tablet_id.to_string()))?;

        tablet.shutdown()?;
        std::fs::remove_dir_all(tablet.dir())?;
        tracing::info!(tablet_id, "Deleted tablet");
        Ok(())
    }

    pub fn lookup(&self, tablet_id: &str) -> Result<Arc<Tablet>> {
        self.tablets
            .read()
            .get(tablet_id)
            .cloned()
            .ok_or_else(|| Error::TabletNotFound(tablet_id.to_string()))
    }

    pub fn tablets(&self) -> Vec<Arc<Tablet>> {
        self.tablets.read().values().cloned().collect()
    }

    pub fn tablet_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tablets.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn shutdown(&self) -> Result<()> {
        for tablet in self.tablets() {
            tablet.shutdown()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DataType, SchemaBuilder};
    use tempfile::TempDir;

    fn info(tablet_id: &str) -> Result<TabletInfo> {
        Ok(TabletInfo {
            tablet_id: tablet_id.to_string(),
            table_id: "table".to_string(),
            table_name: "table".to_string(),
            start_key: Vec::new(),
            end_key: Vec::new(),
            schema: SchemaBuilder::new()
                .add_key_column("key", DataType::UInt32)
                .build()?,
        })
    }

    #[test]
    fn test_create_lookup_delete() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = TabletManager::open(ServerConfig::new(dir.path()))?;

        manager.create_tablet(info("a")?)?;
        assert!(matches!(
            manager.create_tablet(info("a")?),
            Err(Error::TabletAlreadyExists(_))
        ));
        assert_eq!(manager.lookup("a")?.tablet_id(), "a");
        assert!(matches!(manager.lookup("b"), Err(Error::TabletNotFound(_))));

        manager.delete_tablet("a")?;
        assert!(matches!(manager.delete_tablet("a"), Err(Error::TabletNotFound(_))));
        assert!(!manager.config().tablets_dir().join("a").exists());
        Ok(())
    }

    #[test]
    fn test_tablets_survive_restart() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let manager = TabletManager::open(ServerConfig::new(dir.path()))?;
            manager.create_tablet(info("a")?)?;
            manager.create_tablet(info("b")?)?;
            assert!(TabletManager::open(ServerConfig::new(dir.path())).is_err());
        }

        let manager = TabletManager::open(ServerConfig::new(dir.path()))?;
        assert_eq!(manager.tablet_ids(), vec!["a".to_string(), "b".to_string()]);
        Ok(())
    }

    #[test]
    fn test_rejects_path_like_ids() -> Result<()> {
        let dir = TempDir::new()?;
        let manager = TabletManager::open(ServerConfig::new(dir.path()))?;
        assert!(matches!(
            manager.create_tablet(info("../escape")?),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }
}
