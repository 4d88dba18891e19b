//! Instance registry adapter.
//!
//! Keeps an in-memory mirror of the durable instance storage and serializes
//! every access to it:
//!
//! ```text
//!   launcher tasks ──▶ InstanceRegistry (tokio Mutex) ──▶ InstanceStorage
//!                            │
//!                            └── BTreeMap<InstanceIdent, InstanceInfo>
//! ```
//!
//! Mutations write through to storage first; the mirror only changes after
//! the durable write succeeded, so the mirror never claims a record the
//! storage does not have.

use crate::bounded::BoundedVec;
use crate::error::{Error, Result};
use crate::storage::InstanceStorage;
use crate::types::{InstanceIdent, InstanceInfo};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Serialized access to the durable instance set.
pub struct InstanceRegistry {
    storage: Arc<dyn InstanceStorage>,
    capacity: usize,
    mirror: Mutex<BTreeMap<InstanceIdent, InstanceInfo>>,
}

impl InstanceRegistry {
    /// Creates an empty registry over `storage`. Call [`Self::load`] to
    /// populate the mirror.
    pub fn new(storage: Arc<dyn InstanceStorage>, capacity: usize) -> Self {
        Self {
            storage,
            capacity,
            mirror: Mutex::new(BTreeMap::new()),
        }
    }

    /// Returns the capacity bound.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reloads the mirror from storage.
    ///
    /// # Errors
    ///
    /// [`Error::NoMemory`] if storage holds more records than the capacity,
    /// [`Error::AlreadyExists`] if it holds duplicate identities.
    pub async fn load(&self) -> Result<()> {
        let mut mirror = self.mirror.lock().await;
        let records = self.storage.get_all_instances().await?;

        if records.len() > self.capacity {
            return Err(Error::NoMemory {
                what: "instance registry".to_string(),
                capacity: self.capacity,
            });
        }

        let mut loaded = BTreeMap::new();
        for record in records {
            let ident = record.ident.clone();
            if loaded.insert(ident.clone(), record).is_some() {
                return Err(Error::AlreadyExists(ident.to_string()));
            }
        }

        info!(count = loaded.len(), "Loaded instance registry");
        *mirror = loaded;
        Ok(())
    }

    /// Adds a record.
    pub async fn add(&self, instance: &InstanceInfo) -> Result<()> {
        let mut mirror = self.mirror.lock().await;

        if mirror.contains_key(&instance.ident) {
            return Err(Error::AlreadyExists(instance.ident.to_string()));
        }
        if mirror.len() >= self.capacity {
            return Err(Error::NoMemory {
                what: "instance registry".to_string(),
                capacity: self.capacity,
            });
        }

        self.storage.add_instance(instance).await?;
        mirror.insert(instance.ident.clone(), instance.clone());

        debug!(instance = %instance.ident, "Registered instance");
        Ok(())
    }

    /// Replaces a record.
    pub async fn update(&self, instance: &InstanceInfo) -> Result<()> {
        let mut mirror = self.mirror.lock().await;

        if !mirror.contains_key(&instance.ident) {
            return Err(Error::NotFound(instance.ident.to_string()));
        }

        self.storage.update_instance(instance).await?;
        mirror.insert(instance.ident.clone(), instance.clone());

        debug!(instance = %instance.ident, "Updated registered instance");
        Ok(())
    }

    /// Adds the record if absent, replaces it otherwise.
    pub async fn upsert(&self, instance: &InstanceInfo) -> Result<()> {
        let mut mirror = self.mirror.lock().await;

        if mirror.contains_key(&instance.ident) {
            self.storage.update_instance(instance).await?;
        } else {
            if mirror.len() >= self.capacity {
                return Err(Error::NoMemory {
                    what: "instance registry".to_string(),
                    capacity: self.capacity,
                });
            }
            self.storage.add_instance(instance).await?;
        }
        mirror.insert(instance.ident.clone(), instance.clone());

        debug!(instance = %instance.ident, "Stored registered instance");
        Ok(())
    }

    /// Removes a record.
    pub async fn remove(&self, ident: &InstanceIdent) -> Result<()> {
        let mut mirror = self.mirror.lock().await;

        if !mirror.contains_key(ident) {
            return Err(Error::NotFound(ident.to_string()));
        }

        self.storage.remove_instance(ident).await?;
        mirror.remove(ident);

        debug!(instance = %ident, "Unregistered instance");
        Ok(())
    }

    /// Returns every record, ordered by identity.
    pub async fn list(&self) -> Result<BoundedVec<InstanceInfo>> {
        let mirror = self.mirror.lock().await;
        let mut out = BoundedVec::new("instance registry", self.capacity);
        for record in mirror.values() {
            out.push(record.clone())?;
        }
        Ok(out)
    }

    /// Returns one record.
    pub async fn get(&self, ident: &InstanceIdent) -> Option<InstanceInfo> {
        self.mirror.lock().await.get(ident).cloned()
    }

    /// Returns true if a record exists for `ident`.
    pub async fn contains(&self, ident: &InstanceIdent) -> bool {
        self.mirror.lock().await.contains_key(ident)
    }
}
