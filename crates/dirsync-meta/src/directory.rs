//! Directory search, schema, and node-connection collaborators.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::{Backend, MemoryBackend};
use crate::types::{attr_key, Entry, MetaError};

/// Internal directory search/modify used by the cluster cache and Raft state.
pub trait Directory: Send + Sync {
    /// Returns every entry under `base` (inclusive) whose `attr` has a value equal to `value`.
    fn search_equal(&self, base: &str, attr: &str, value: &str) -> Result<Vec<Entry>, MetaError>;

    /// Reads one entry by DN.
    fn get_entry(&self, dn: &str) -> Result<Option<Entry>, MetaError>;

    /// Replaces all values of an attribute on an existing entry.
    fn replace_attribute(&self, dn: &str, attr: &str, values: Vec<Vec<u8>>)
        -> Result<(), MetaError>;
}

/// Attribute-name resolution against the active schema.
pub trait Schema: Send + Sync {
    /// Returns true if the attribute type is defined.
    fn has_attribute(&self, name: &str) -> bool;
}

/// An open directory connection to a peer node.
pub trait NodeConnection: Send + Sync {
    /// Peer host the connection points at.
    fn peer(&self) -> &str;
    /// Closes the connection.
    fn close(&self);
    /// True once closed.
    fn is_closed(&self) -> bool;
}

/// Opens directory connections to peer nodes.
pub trait NodeConnector: Send + Sync {
    /// Connects to the node with the given FQDN.
    fn connect(&self, fqdn: &str) -> Result<Arc<dyn NodeConnection>, MetaError>;
}

fn dn_under(dn: &str, base: &str) -> bool {
    let dn = dn.to_ascii_lowercase();
    let base = base.to_ascii_lowercase();
    base.is_empty() || dn == base || dn.ends_with(&format!(",{}", base))
}

impl Directory for MemoryBackend {
    fn search_equal(&self, base: &str, attr: &str, value: &str) -> Result<Vec<Entry>, MetaError> {
        let mut found = Vec::new();
        for entry in self.scan()? {
            if !dn_under(&entry.dn, base) {
                continue;
            }
            let matches = entry
                .values(attr)
                .map(|vals| {
                    vals.iter()
                        .any(|v| String::from_utf8_lossy(v).eq_ignore_ascii_case(value))
                })
                .unwrap_or(false);
            if matches {
                found.push(entry);
            }
        }
        Ok(found)
    }

    fn get_entry(&self, dn: &str) -> Result<Option<Entry>, MetaError> {
        self.entry_by_dn(dn)
    }

    fn replace_attribute(
        &self,
        dn: &str,
        attr: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), MetaError> {
        let id = self
            .entry_by_dn(dn)?
            .and_then(|e| e.id)
            .ok_or_else(|| MetaError::EntryNotFound(dn.to_string()))?;
        Backend::replace_attribute(self, id, attr, values)
    }
}

impl<D: Directory + ?Sized> Directory for Arc<D> {
    fn search_equal(&self, base: &str, attr: &str, value: &str) -> Result<Vec<Entry>, MetaError> {
        (**self).search_equal(base, attr, value)
    }

    fn get_entry(&self, dn: &str) -> Result<Option<Entry>, MetaError> {
        (**self).get_entry(dn)
    }

    fn replace_attribute(
        &self,
        dn: &str,
        attr: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), MetaError> {
        (**self).replace_attribute(dn, attr, values)
    }
}

/// Wraps a directory and makes writes fail on demand.
pub struct FaultyDirectory<D> {
    inner: D,
    fail_writes: AtomicBool,
}

impl<D: Directory> FaultyDirectory<D> {
    /// Wraps `inner` with writes enabled.
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Toggles write failures.
    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }
}

impl<D: Directory> Directory for FaultyDirectory<D> {
    fn search_equal(&self, base: &str, attr: &str, value: &str) -> Result<Vec<Entry>, MetaError> {
        self.inner.search_equal(base, attr, value)
    }

    fn get_entry(&self, dn: &str) -> Result<Option<Entry>, MetaError> {
        self.inner.get_entry(dn)
    }

    fn replace_attribute(
        &self,
        dn: &str,
        attr: &str,
        values: Vec<Vec<u8>>,
    ) -> Result<(), MetaError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(MetaError::Directory(format!("modify {} refused", dn)));
        }
        self.inner.replace_attribute(dn, attr, values)
    }
}

/// Schema with a fixed set of attribute names.
#[derive(Debug, Default, Clone)]
pub struct StaticSchema {
    attrs: HashSet<String>,
}

impl StaticSchema {
    /// Builds a schema from attribute names.
    pub fn new<I, S>(attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            attrs: attrs.into_iter().map(|a| attr_key(a.as_ref())).collect(),
        }
    }
}

impl Schema for StaticSchema {
    fn has_attribute(&self, name: &str) -> bool {
        self.attrs.contains(&attr_key(name))
    }
}

/// Connection handle produced by [`LoopbackConnector`].
pub struct LoopbackConnection {
    peer: String,
    closed: AtomicBool,
}

impl NodeConnection for LoopbackConnection {
    fn peer(&self) -> &str {
        &self.peer
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// In-process connector that records attempts and can refuse chosen hosts.
#[derive(Default)]
pub struct LoopbackConnector {
    unreachable: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
}

impl LoopbackConnector {
    /// Creates a connector that reaches every host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a host reachable or not.
    pub fn set_unreachable(&self, fqdn: &str, unreachable: bool) {
        if let Ok(mut set) = self.unreachable.lock() {
            if unreachable {
                set.insert(fqdn.to_ascii_lowercase());
            } else {
                set.remove(&fqdn.to_ascii_lowercase());
            }
        }
    }

    /// Hosts a connection was attempted to, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

impl NodeConnector for LoopbackConnector {
    fn connect(&self, fqdn: &str) -> Result<Arc<dyn NodeConnection>, MetaError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(fqdn.to_string());
        }
        let refused = self
            .unreachable
            .lock()
            .map(|set| set.contains(&fqdn.to_ascii_lowercase()))
            .unwrap_or(false);
        if refused {
            return Err(MetaError::Directory(format!("{} unreachable", fqdn)));
        }
        Ok(Arc::new(LoopbackConnection {
            peer: fqdn.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}
