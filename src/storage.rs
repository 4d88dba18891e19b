//! # Durable Instance Storage
//!
//! Persists the desired instance set so that the launcher can restore it
//! after a device reboot.
//!
//! ## Storage Model
//!
//! [`FileInstanceStorage`] keeps every record in a single JSON document:
//!
//! ```text
//! <state_dir>/instances.json
//! {
//!   "instances": [
//!     { "ident": { "serviceId": "...", "subjectId": "...", "instance": 0 },
//!       "uid": 5000, "priority": 0, "storagePath": "", "statePath": "" }
//!   ]
//! }
//! ```
//!
//! ## Crash Consistency
//!
//! Every mutation rewrites the document through a temp file + rename:
//! 1. Write to `instances.tmp.<uuid>`
//! 2. Rename to `instances.json`
//!
//! A crash leaves either the old or the new document, never a torn one.

use crate::error::{Error, Result};
use crate::oci::write_atomic;
use crate::types::{InstanceIdent, InstanceInfo};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// Registry document file name.
pub const INSTANCES_FILE: &str = "instances.json";

/// Durable instance registry collaborator.
///
/// Records are keyed by [`InstanceIdent`]; at most one record per identity
/// exists at any time.
#[async_trait]
pub trait InstanceStorage: Send + Sync {
    /// Adds a record. Fails with [`Error::AlreadyExists`] if present.
    async fn add_instance(&self, instance: &InstanceInfo) -> Result<()>;

    /// Replaces a record. Fails with [`Error::NotFound`] if absent.
    async fn update_instance(&self, instance: &InstanceInfo) -> Result<()>;

    /// Removes a record. Fails with [`Error::NotFound`] if absent.
    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()>;

    /// Returns all records.
    async fn get_all_instances(&self) -> Result<Vec<InstanceInfo>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct InstancesDocument {
    #[serde(default)]
    instances: Vec<InstanceInfo>,
}

/// Instance storage backed by one JSON file.
pub struct FileInstanceStorage {
    path: PathBuf,
    capacity: usize,
    lock: Mutex<()>,
}

impl FileInstanceStorage {
    /// Opens (or creates) the storage in `state_dir`.
    pub fn with_path(state_dir: PathBuf, capacity: usize) -> Result<Self> {
        fs::create_dir_all(&state_dir)?;
        let path = state_dir.join(INSTANCES_FILE);

        info!(path = %path.display(), "Instance storage initialized");

        Ok(Self {
            path,
            capacity,
            lock: Mutex::new(()),
        })
    }

    /// Returns the document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<InstancesDocument> {
        match fs::read(&self.path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(InstancesDocument::default()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write(&self, doc: &InstancesDocument) -> Result<()> {
        let json = serde_json::to_vec_pretty(doc)?;
        write_atomic(&self.path, &json)
    }

    /// Runs a read-modify-write cycle under the storage lock.
    fn modify(&self, f: impl FnOnce(&mut Vec<InstanceInfo>) -> Result<()>) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;

        let mut doc = self.read()?;
        f(&mut doc.instances)?;
        self.write(&doc)
    }
}

#[async_trait]
impl InstanceStorage for FileInstanceStorage {
    async fn add_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.modify(|instances| {
            if instances.iter().any(|i| i.ident == instance.ident) {
                return Err(Error::AlreadyExists(instance.ident.to_string()));
            }
            if instances.len() >= self.capacity {
                return Err(Error::NoMemory {
                    what: "instance storage".to_string(),
                    capacity: self.capacity,
                });
            }
            instances.push(instance.clone());
            Ok(())
        })?;

        debug!(instance = %instance.ident, "Stored instance");
        Ok(())
    }

    async fn update_instance(&self, instance: &InstanceInfo) -> Result<()> {
        self.modify(|instances| {
            let existing = instances
                .iter_mut()
                .find(|i| i.ident == instance.ident)
                .ok_or_else(|| Error::NotFound(instance.ident.to_string()))?;
            *existing = instance.clone();
            Ok(())
        })?;

        debug!(instance = %instance.ident, "Updated stored instance");
        Ok(())
    }

    async fn remove_instance(&self, ident: &InstanceIdent) -> Result<()> {
        self.modify(|instances| {
            let pos = instances
                .iter()
                .position(|i| &i.ident == ident)
                .ok_or_else(|| Error::NotFound(ident.to_string()))?;
            instances.remove(pos);
            Ok(())
        })?;

        debug!(instance = %ident, "Removed stored instance");
        Ok(())
    }

    async fn get_all_instances(&self) -> Result<Vec<InstanceInfo>> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| Error::Internal("lock poisoned".to_string()))?;
        Ok(self.read()?.instances)
    }
}
