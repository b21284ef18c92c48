//! Storage backend contract consumed by the replication core.
//!
//! The real backend (transactions, on-disk format) lives outside this crate.
//! `MemoryBackend` is the in-memory implementation used by the binary and tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::types::{attr_key, AttrMetadata, Entry, EntryId, MetaError, Usn, ValueMetadata};

/// Backend operations the replication core relies on.
pub trait Backend: Send + Sync {
    /// Assigns the next local USN.
    fn next_usn(&self) -> Result<Usn, MetaError>;

    /// Reads the stored metadata of one attribute.
    ///
    /// Returns `MetaError::AttrMetadataNotFound` when the attribute has never been written.
    fn attr_metadata(&self, entry_id: EntryId, attr: &str) -> Result<AttrMetadata, MetaError>;

    /// Stores the metadata of one attribute.
    fn set_attr_metadata(
        &self,
        entry_id: EntryId,
        attr: &str,
        meta: AttrMetadata,
    ) -> Result<(), MetaError>;

    /// Lists the per-value metadata stored for an attribute.
    fn value_metadata(&self, entry_id: EntryId, attr: &str)
        -> Result<Vec<ValueMetadata>, MetaError>;

    /// Appends a per-value metadata record.
    fn add_value_metadata(&self, entry_id: EntryId, meta: ValueMetadata) -> Result<(), MetaError>;

    /// Fetches an entry by internal id.
    fn entry_by_id(&self, entry_id: EntryId) -> Result<Entry, MetaError>;

    /// Resolves a DN to an entry, if present.
    fn entry_by_dn(&self, dn: &str) -> Result<Option<Entry>, MetaError>;

    /// Adds a new entry; its parent must exist unless it is a naming context root.
    fn add_entry(&self, entry: Entry) -> Result<EntryId, MetaError>;

    /// Replaces the values of one attribute.
    fn replace_attribute(
        &self,
        entry_id: EntryId,
        attr: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), MetaError>;

    /// Deletes an entry.
    fn delete_entry(&self, entry_id: EntryId) -> Result<(), MetaError>;
}

#[derive(Serialize, Deserialize)]
struct MemoryBackendInner {
    next_usn: Usn,
    next_id: u64,
    entries: BTreeMap<EntryId, Entry>,
    by_dn: HashMap<String, EntryId>,
    attr_meta: HashMap<(EntryId, String), AttrMetadata>,
    value_meta: HashMap<(EntryId, String), Vec<ValueMetadata>>,
}

/// In-memory backend. Thread-safe via RwLock.
pub struct MemoryBackend {
    inner: RwLock<MemoryBackendInner>,
    deadlock: AtomicBool,
}

impl MemoryBackend {
    /// Creates an empty backend whose first assigned USN is 1.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryBackendInner {
                next_usn: 1,
                next_id: 1,
                entries: BTreeMap::new(),
                by_dn: HashMap::new(),
                attr_meta: HashMap::new(),
                value_meta: HashMap::new(),
            }),
            deadlock: AtomicBool::new(false),
        }
    }

    /// Makes every metadata read fail with `MetaError::Deadlock` while set.
    pub fn inject_deadlock(&self, on: bool) {
        self.deadlock.store(on, Ordering::SeqCst);
    }

    /// Serializes the whole store, used to simulate a restart.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MetaError> {
        let inner = self.read()?;
        Ok(bincode::serialize(&*inner)?)
    }

    /// Rebuilds a store from [`MemoryBackend::to_bytes`] output.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MetaError> {
        let inner: MemoryBackendInner = bincode::deserialize(bytes)?;
        Ok(Self {
            inner: RwLock::new(inner),
            deadlock: AtomicBool::new(false),
        })
    }

    /// Snapshot of every stored entry in id order.
    pub fn scan(&self) -> Result<Vec<Entry>, MetaError> {
        Ok(self.read()?.entries.values().cloned().collect())
    }

    /// Number of stored entries.
    pub fn entry_count(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, MemoryBackendInner>, MetaError> {
        self.inner
            .read()
            .map_err(|e| MetaError::Backend(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, MemoryBackendInner>, MetaError> {
        self.inner
            .write()
            .map_err(|e| MetaError::Backend(e.to_string()))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn parent_dn(dn: &str) -> Option<&str> {
    dn.split_once(',').map(|(_, parent)| parent.trim())
}

impl Backend for MemoryBackend {
    fn next_usn(&self) -> Result<Usn, MetaError> {
        let mut inner = self.write()?;
        let usn = inner.next_usn;
        inner.next_usn += 1;
        Ok(usn)
    }

    fn attr_metadata(&self, entry_id: EntryId, attr: &str) -> Result<AttrMetadata, MetaError> {
        if self.deadlock.load(Ordering::SeqCst) {
            return Err(MetaError::Deadlock);
        }
        let inner = self.read()?;
        inner
            .attr_meta
            .get(&(entry_id, attr_key(attr)))
            .cloned()
            .ok_or_else(|| MetaError::AttrMetadataNotFound {
                entry_id,
                attr: attr.to_string(),
            })
    }

    fn set_attr_metadata(
        &self,
        entry_id: EntryId,
        attr: &str,
        meta: AttrMetadata,
    ) -> Result<(), MetaError> {
        let mut inner = self.write()?;
        if !inner.entries.contains_key(&entry_id) {
            return Err(MetaError::EntryNotFound(entry_id.to_string()));
        }
        inner.attr_meta.insert((entry_id, attr_key(attr)), meta);
        Ok(())
    }

    fn value_metadata(
        &self,
        entry_id: EntryId,
        attr: &str,
    ) -> Result<Vec<ValueMetadata>, MetaError> {
        if self.deadlock.load(Ordering::SeqCst) {
            return Err(MetaError::Deadlock);
        }
        let inner = self.read()?;
        Ok(inner
            .value_meta
            .get(&(entry_id, attr_key(attr)))
            .cloned()
            .unwrap_or_default())
    }

    fn add_value_metadata(&self, entry_id: EntryId, meta: ValueMetadata) -> Result<(), MetaError> {
        let mut inner = self.write()?;
        inner
            .value_meta
            .entry((entry_id, attr_key(&meta.attr_type)))
            .or_default()
            .push(meta);
        Ok(())
    }

    fn entry_by_id(&self, entry_id: EntryId) -> Result<Entry, MetaError> {
        let inner = self.read()?;
        inner
            .entries
            .get(&entry_id)
            .cloned()
            .ok_or_else(|| MetaError::EntryNotFound(entry_id.to_string()))
    }

    fn entry_by_dn(&self, dn: &str) -> Result<Option<Entry>, MetaError> {
        let inner = self.read()?;
        Ok(inner
            .by_dn
            .get(&dn.to_ascii_lowercase())
            .and_then(|id| inner.entries.get(id))
            .cloned())
    }

    fn add_entry(&self, mut entry: Entry) -> Result<EntryId, MetaError> {
        let mut inner = self.write()?;
        let key = entry.dn.to_ascii_lowercase();
        if inner.by_dn.contains_key(&key) {
            return Err(MetaError::Backend(format!("entry {} already exists", entry.dn)));
        }
        // Roots of a naming context (single RDN or "dc=" suffixes) need no parent.
        if let Some(parent) = parent_dn(&entry.dn) {
            let is_suffix = parent.to_ascii_lowercase().starts_with("dc=");
            if !is_suffix && !inner.by_dn.contains_key(&parent.to_ascii_lowercase()) {
                return Err(MetaError::EntryNotFound(parent.to_string()));
            }
        }
        let id = EntryId::new(inner.next_id);
        inner.next_id += 1;
        entry.id = Some(id);
        inner.by_dn.insert(key, id);
        inner.entries.insert(id, entry);
        Ok(id)
    }

    fn replace_attribute(
        &self,
        entry_id: EntryId,
        attr: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), MetaError> {
        let mut inner = self.write()?;
        let entry = inner
            .entries
            .get_mut(&entry_id)
            .ok_or_else(|| MetaError::EntryNotFound(entry_id.to_string()))?;
        entry.replace(attr, values);
        Ok(())
    }

    fn delete_entry(&self, entry_id: EntryId) -> Result<(), MetaError> {
        let mut inner = self.write()?;
        let entry = inner
            .entries
            .remove(&entry_id)
            .ok_or_else(|| MetaError::EntryNotFound(entry_id.to_string()))?;
        inner.by_dn.remove(&entry.dn.to_ascii_lowercase());
        inner.attr_meta.retain(|(id, _), _| *id != entry_id);
        inner.value_meta.retain(|(id, _), _| *id != entry_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InvocationId;

    fn meta(version: u64) -> AttrMetadata {
        AttrMetadata {
            local_usn: 1,
            version,
            invocation_id: InvocationId::new("inv-a"),
            orig_time: "20240101000000.0".to_string(),
            orig_usn: 1,
        }
    }

    #[test]
    fn test_next_usn_monotonic() {
        let be = MemoryBackend::new();
        assert_eq!(be.next_usn().unwrap(), 1);
        assert_eq!(be.next_usn().unwrap(), 2);
    }

    #[test]
    fn test_attr_metadata_not_found() {
        let be = MemoryBackend::new();
        let id = be.add_entry(Entry::new("cn=a,dc=example")).unwrap();
        match be.attr_metadata(id, "description") {
            Err(MetaError::AttrMetadataNotFound { attr, .. }) => assert_eq!(attr, "description"),
            other => panic!("unexpected {:?}", other),
        }
        be.set_attr_metadata(id, "Description", meta(2)).unwrap();
        assert_eq!(be.attr_metadata(id, "description").unwrap().version, 2);
    }

    #[test]
    fn test_add_entry_requires_parent() {
        let be = MemoryBackend::new();
        let err = be.add_entry(Entry::new("cn=child,cn=missing,dc=example"));
        assert!(matches!(err, Err(MetaError::EntryNotFound(_))));
        be.add_entry(Entry::new("cn=missing,dc=example")).unwrap();
        be.add_entry(Entry::new("cn=child,cn=missing,dc=example"))
            .unwrap();
        assert_eq!(be.entry_count(), 2);
    }

    #[test]
    fn test_delete_entry_drops_metadata() {
        let be = MemoryBackend::new();
        let id = be.add_entry(Entry::new("cn=a,dc=example")).unwrap();
        be.set_attr_metadata(id, "cn", meta(1)).unwrap();
        be.delete_entry(id).unwrap();
        assert!(be.entry_by_dn("cn=a,dc=example").unwrap().is_none());
        assert!(be.attr_metadata(id, "cn").is_err());
    }

    #[test]
    fn test_snapshot_restores_state() {
        let be = MemoryBackend::new();
        let id = be.add_entry(Entry::new("cn=a,dc=example").with_attr("cn", "a")).unwrap();
        be.set_attr_metadata(id, "cn", meta(3)).unwrap();
        be.next_usn().unwrap();
        let restored = MemoryBackend::from_bytes(&be.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.attr_metadata(id, "cn").unwrap().version, 3);
        assert_eq!(restored.next_usn().unwrap(), 2);
        assert!(restored.entry_by_dn("CN=A,DC=EXAMPLE").unwrap().is_some());
    }

    #[test]
    fn test_injected_deadlock() {
        let be = MemoryBackend::new();
        let id = be.add_entry(Entry::new("cn=a,dc=example")).unwrap();
        be.inject_deadlock(true);
        assert!(matches!(be.attr_metadata(id, "cn"), Err(MetaError::Deadlock)));
        be.inject_deadlock(false);
        assert!(be.attr_metadata(id, "cn").is_err());
    }
}
