//! In-memory cluster membership cache.
//!
//! Nodes live in an arena addressed by stable [`NodeIdx`] handles. Site buckets
//! hold handles in fixed slots; removal nulls the slot instead of compacting,
//! so other slot positions stay valid. All state sits behind one RwLock and is
//! only reachable through [`ClusterReadGuard`] / [`ClusterWriteGuard`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, info, warn};

use crate::directory::{Directory, NodeConnection, NodeConnector};
use crate::types::{
    rdn_value, Entry, InvocationId, MetaError, ATTR_CN, ATTR_INVOCATION_ID, ATTR_OBJECT_CLASS,
    ATTR_SERVER_ID, OC_DIR_SERVER,
};

/// Site name used when a server DN carries no site component.
pub const DEFAULT_SITE: &str = "Default-First-Site";

/// Stable handle of a node in the cluster arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdx(usize);

impl NodeIdx {
    /// Arena position
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

/// Directory connection state of a peer node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No connection and none in progress
    Disconnected,
    /// Connection requested
    Connecting,
    /// Connected
    Connected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// One cluster member.
#[derive(Clone)]
pub struct NodeState {
    /// Host name, unique key of the map
    pub fqdn: String,
    /// Server object DN
    pub dn: String,
    /// Replica identity
    pub invocation_id: InvocationId,
    /// Numeric server id
    pub server_id: u32,
    /// Site the node belongs to
    pub site: String,
    /// Present in the latest directory scan
    pub active: bool,
    /// This node is the local server
    pub is_self: bool,
    /// Connection state
    pub conn_state: ConnState,
    conn: Option<Arc<dyn NodeConnection>>,
}

impl NodeState {
    /// True when a live connection handle is held.
    pub fn has_connection(&self) -> bool {
        self.conn.as_ref().map(|c| !c.is_closed()).unwrap_or(false)
    }
}

impl fmt::Debug for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeState")
            .field("fqdn", &self.fqdn)
            .field("server_id", &self.server_id)
            .field("site", &self.site)
            .field("active", &self.active)
            .field("is_self", &self.is_self)
            .field("conn_state", &self.conn_state)
            .finish()
    }
}

impl PartialEq for NodeState {
    fn eq(&self, other: &Self) -> bool {
        self.fqdn == other.fqdn
            && self.dn == other.dn
            && self.invocation_id == other.invocation_id
            && self.server_id == other.server_id
            && self.site == other.site
            && self.active == other.active
            && self.is_self == other.is_self
    }
}

#[derive(Debug)]
struct SiteBucket {
    name: String,
    slots: Vec<Option<NodeIdx>>,
}

#[derive(Default)]
struct ClusterInner {
    arena: Vec<Option<NodeState>>,
    free: Vec<usize>,
    by_fqdn: HashMap<String, NodeIdx>,
    sites: Vec<SiteBucket>,
    self_node: Option<NodeIdx>,
    self_site: Option<usize>,
    reload: bool,
    loaded: bool,
}

/// Settings the cache needs about the local server.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Local host name
    pub self_fqdn: String,
    /// System domain DN; `None` until the node is promoted
    pub system_domain_dn: Option<String>,
}

/// The cluster membership cache.
pub struct ClusterState {
    inner: RwLock<ClusterInner>,
    config: ClusterConfig,
    directory: Arc<dyn Directory>,
    connector: Arc<dyn NodeConnector>,
}

fn fqdn_key(fqdn: &str) -> String {
    fqdn.to_ascii_lowercase()
}

/// Derives the site of a server object from its DN
/// (`cn=<host>,cn=Servers,cn=<site>,cn=Sites,...`).
pub fn site_from_dn(dn: &str) -> String {
    let parts: Vec<&str> = dn.split(',').map(|p| p.trim()).collect();
    parts
        .windows(3)
        .find(|w| w[0].eq_ignore_ascii_case("cn=Servers") && w[2].eq_ignore_ascii_case("cn=Sites"))
        .and_then(|w| rdn_value(w[1]))
        .unwrap_or(DEFAULT_SITE)
        .to_string()
}

impl ClusterState {
    /// Creates an empty, unloaded cache.
    pub fn new(
        config: ClusterConfig,
        directory: Arc<dyn Directory>,
        connector: Arc<dyn NodeConnector>,
    ) -> Self {
        Self {
            inner: RwLock::new(ClusterInner::default()),
            config,
            directory,
            connector,
        }
    }

    /// Local host name.
    pub fn self_fqdn(&self) -> &str {
        &self.config.self_fqdn
    }

    /// Acquires the shared lock.
    pub fn read(&self) -> Result<ClusterReadGuard<'_>, MetaError> {
        let guard = self
            .inner
            .read()
            .map_err(|e| MetaError::InvalidState(format!("cluster lock poisoned: {}", e)))?;
        Ok(ClusterReadGuard { inner: guard })
    }

    /// Acquires the exclusive lock.
    pub fn write(&self) -> Result<ClusterWriteGuard<'_>, MetaError> {
        let guard = self
            .inner
            .write()
            .map_err(|e| MetaError::InvalidState(format!("cluster lock poisoned: {}", e)))?;
        Ok(ClusterWriteGuard {
            inner: guard,
            self_fqdn: &self.config.self_fqdn,
        })
    }

    /// Rescans server objects and reconciles the cache with the result.
    ///
    /// A no-op before promotion. Nodes missing from the scan are removed.
    /// Afterwards a connection is (re)established to every active peer.
    pub fn load_cache(&self) -> Result<(), MetaError> {
        let domain = match &self.config.system_domain_dn {
            Some(dn) => dn.clone(),
            None => {
                debug!("cluster cache reload skipped, server not promoted");
                return Ok(());
            }
        };

        {
            let mut guard = self.write()?;
            guard.mark_all_inactive();

            let entries = self
                .directory
                .search_equal(&domain, ATTR_OBJECT_CLASS, OC_DIR_SERVER)?;
            for entry in &entries {
                if let Err(e) = guard.add_node(entry) {
                    warn!(dn = %entry.dn, error = %e, "skipping server object");
                }
            }

            let stale: Vec<String> = guard
                .inner
                .by_fqdn
                .iter()
                .filter(|(_, idx)| {
                    guard
                        .inner
                        .arena
                        .get(idx.0)
                        .and_then(|n| n.as_ref())
                        .map(|n| !n.active)
                        .unwrap_or(true)
                })
                .map(|(k, _)| k.clone())
                .collect();
            for fqdn in stale {
                guard.remove_node(&fqdn);
            }

            guard.inner.loaded = true;
            if guard.inner.self_node.is_none() {
                warn!(fqdn = %self.config.self_fqdn, "self node not found in server objects");
            }
            info!(nodes = guard.inner.by_fqdn.len(), "cluster cache loaded");
        }

        self.connect_pending();
        Ok(())
    }

    /// Inserts or reactivates one server object.
    pub fn add_node(&self, entry: &Entry) -> Result<NodeIdx, MetaError> {
        self.write()?.add_node(entry)
    }

    /// Removes a node from the map and nulls its site slot.
    pub fn remove_node(&self, fqdn: &str) -> Result<bool, MetaError> {
        Ok(self.write()?.remove_node(fqdn))
    }

    /// Handles deletion of a server object from the directory.
    ///
    /// Marks the matching non-self node inactive and requests a reload.
    /// Returns true when a node was deactivated; the caller then
    /// re-initializes Raft state.
    pub fn delete_node(&self, entry: &Entry) -> Result<bool, MetaError> {
        let host = match entry.first_str(ATTR_CN).or_else(|| rdn_value(&entry.dn)) {
            Some(h) => h.to_string(),
            None => return Ok(false),
        };
        let mut guard = self.write()?;
        let idx = match guard.inner.by_fqdn.get(&fqdn_key(&host)) {
            Some(idx) => *idx,
            None => return Ok(false),
        };
        let node = guard
            .inner
            .arena
            .get_mut(idx.0)
            .and_then(|n| n.as_mut())
            .ok_or_else(|| MetaError::InvalidState(format!("dangling node handle {}", idx.0)))?;
        if node.is_self {
            return Ok(false);
        }
        node.active = false;
        if let Some(conn) = node.conn.take() {
            conn.close();
        }
        node.conn_state = ConnState::Disconnected;
        guard.inner.reload = true;
        info!(fqdn = %host, "server object deleted, reload requested");
        Ok(true)
    }

    /// Closes all connections and clears the cache.
    pub fn free_cache(&self) -> Result<(), MetaError> {
        let mut guard = self.write()?;
        for node in guard.inner.arena.iter_mut().flatten() {
            if let Some(conn) = node.conn.take() {
                conn.close();
            }
        }
        *guard.inner = ClusterInner::default();
        debug!("cluster cache freed");
        Ok(())
    }

    /// Asks the periodic refresh to reload.
    pub fn request_reload(&self) -> Result<(), MetaError> {
        self.write()?.inner.reload = true;
        Ok(())
    }

    /// Consumes the reload flag.
    pub fn take_reload(&self) -> Result<bool, MetaError> {
        let mut guard = self.write()?;
        Ok(std::mem::replace(&mut guard.inner.reload, false))
    }

    /// Drops a peer connection so the next connect pass re-establishes it.
    pub fn mark_connection_lost(&self, fqdn: &str) -> Result<(), MetaError> {
        let mut guard = self.write()?;
        if let Some(node) = guard.node_mut(fqdn) {
            if let Some(conn) = node.conn.take() {
                conn.close();
            }
            node.conn_state = ConnState::Disconnected;
            debug!(fqdn = %fqdn, "connection lost");
        }
        Ok(())
    }

    /// Connects every active peer that is not connected.
    ///
    /// Connection attempts run outside the lock; results are written back
    /// only if the node still exists. Returns the number of new connections.
    pub fn connect_pending(&self) -> usize {
        let targets: Vec<String> = match self.write() {
            Ok(mut guard) => {
                let mut targets = Vec::new();
                for node in guard.inner.arena.iter_mut().flatten() {
                    if node.active && !node.is_self && node.conn_state != ConnState::Connected {
                        node.conn_state = ConnState::Connecting;
                        targets.push(node.fqdn.clone());
                    }
                }
                targets
            }
            Err(e) => {
                warn!(error = %e, "connect pass skipped");
                return 0;
            }
        };

        let mut connected = 0;
        for fqdn in targets {
            let result = self.connector.connect(&fqdn);
            let mut guard = match self.write() {
                Ok(g) => g,
                Err(_) => break,
            };
            let node = match guard.node_mut(&fqdn) {
                Some(n) if n.conn_state == ConnState::Connecting => n,
                _ => {
                    if let Ok(conn) = result {
                        conn.close();
                    }
                    continue;
                }
            };
            match result {
                Ok(conn) => {
                    node.conn = Some(conn);
                    node.conn_state = ConnState::Connected;
                    connected += 1;
                    debug!(fqdn = %fqdn, "connected to peer");
                }
                Err(e) => {
                    node.conn_state = ConnState::Disconnected;
                    debug!(fqdn = %fqdn, error = %e, "peer connection failed");
                }
            }
        }
        connected
    }
}

/// Shared view of the cluster cache.
pub struct ClusterReadGuard<'a> {
    inner: RwLockReadGuard<'a, ClusterInner>,
}

impl<'a> ClusterReadGuard<'a> {
    /// True once a reload has completed.
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded
    }

    /// Looks a node up by host name.
    pub fn node(&self, fqdn: &str) -> Option<&NodeState> {
        self.inner
            .by_fqdn
            .get(&fqdn_key(fqdn))
            .and_then(|idx| self.inner.arena.get(idx.0))
            .and_then(|n| n.as_ref())
    }

    /// Every node in the map, in host-name order.
    pub fn nodes(&self) -> Vec<&NodeState> {
        let mut nodes: Vec<&NodeState> = self
            .inner
            .by_fqdn
            .values()
            .filter_map(|idx| self.inner.arena.get(idx.0).and_then(|n| n.as_ref()))
            .collect();
        nodes.sort_by(|a, b| a.fqdn.cmp(&b.fqdn));
        nodes
    }

    /// The local node.
    pub fn self_node(&self) -> Result<&NodeState, MetaError> {
        self.inner
            .self_node
            .and_then(|idx| self.inner.arena.get(idx.0))
            .and_then(|n| n.as_ref())
            .ok_or_else(|| MetaError::InvalidState("self node not set".to_string()))
    }

    /// Nodes in the self site bucket, in slot order, skipping nulled slots.
    pub fn self_site_nodes(&self) -> Result<Vec<&NodeState>, MetaError> {
        let site = self
            .inner
            .self_site
            .and_then(|i| self.inner.sites.get(i))
            .ok_or_else(|| MetaError::InvalidState("self site not set".to_string()))?;
        Ok(site
            .slots
            .iter()
            .flatten()
            .filter_map(|idx| self.inner.arena.get(idx.0).and_then(|n| n.as_ref()))
            .collect())
    }

    /// Slot layout of a site bucket: host name per slot, `None` for a nulled slot.
    pub fn site_slots(&self, site: &str) -> Option<Vec<Option<String>>> {
        let bucket = self.inner.sites.iter().find(|s| s.name.eq_ignore_ascii_case(site))?;
        Some(
            bucket
                .slots
                .iter()
                .map(|slot| {
                    slot.and_then(|idx| self.inner.arena.get(idx.0))
                        .and_then(|n| n.as_ref())
                        .map(|n| n.fqdn.clone())
                })
                .collect(),
        )
    }

    /// Names of all site buckets.
    pub fn sites(&self) -> Vec<String> {
        self.inner.sites.iter().map(|s| s.name.clone()).collect()
    }
}

/// Exclusive view of the cluster cache.
pub struct ClusterWriteGuard<'a> {
    inner: RwLockWriteGuard<'a, ClusterInner>,
    self_fqdn: &'a str,
}

impl<'a> ClusterWriteGuard<'a> {
    fn node_mut(&mut self, fqdn: &str) -> Option<&mut NodeState> {
        let idx = *self.inner.by_fqdn.get(&fqdn_key(fqdn))?;
        self.inner.arena.get_mut(idx.0).and_then(|n| n.as_mut())
    }

    /// Marks every node inactive ahead of a rescan.
    pub fn mark_all_inactive(&mut self) {
        for node in self.inner.arena.iter_mut().flatten() {
            node.active = false;
        }
    }

    /// Inserts a node for a server object, or reactivates the existing one.
    pub fn add_node(&mut self, entry: &Entry) -> Result<NodeIdx, MetaError> {
        let fqdn = entry
            .first_str(ATTR_CN)
            .or_else(|| rdn_value(&entry.dn))
            .ok_or_else(|| MetaError::InvalidState(format!("server object {} has no cn", entry.dn)))?
            .to_string();
        let invocation_id = entry
            .first_str(ATTR_INVOCATION_ID)
            .map(InvocationId::new)
            .unwrap_or_else(|| InvocationId::new(""));
        let server_id = entry
            .first_str(ATTR_SERVER_ID)
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(0);
        let site = site_from_dn(&entry.dn);

        if let Some(idx) = self.inner.by_fqdn.get(&fqdn_key(&fqdn)).copied() {
            let moved = match self.inner.arena.get_mut(idx.0).and_then(|n| n.as_mut()) {
                Some(node) => {
                    node.active = true;
                    node.dn = entry.dn.clone();
                    node.invocation_id = invocation_id;
                    node.server_id = server_id;
                    let moved = !node.site.eq_ignore_ascii_case(&site);
                    if moved {
                        info!(fqdn = %fqdn, from = %node.site, to = %site, "node moved to another site");
                        node.site = site.clone();
                    }
                    moved
                }
                None => {
                    return Err(MetaError::InvalidState(format!(
                        "dangling node handle {}",
                        idx.0
                    )))
                }
            };
            if moved {
                self.clear_slots(idx);
                let site_pos = self.place_in_site(idx, &site);
                if self.inner.self_node == Some(idx) {
                    self.inner.self_site = Some(site_pos);
                }
            }
            return Ok(idx);
        }

        let is_self = self.inner.self_node.is_none() && fqdn.eq_ignore_ascii_case(self.self_fqdn);
        let node = NodeState {
            fqdn: fqdn.clone(),
            dn: entry.dn.clone(),
            invocation_id,
            server_id,
            site: site.clone(),
            active: true,
            is_self,
            conn_state: ConnState::Disconnected,
            conn: None,
        };

        let idx = match self.inner.free.pop() {
            Some(pos) => {
                self.inner.arena[pos] = Some(node);
                NodeIdx(pos)
            }
            None => {
                self.inner.arena.push(Some(node));
                NodeIdx(self.inner.arena.len() - 1)
            }
        };
        self.inner.by_fqdn.insert(fqdn_key(&fqdn), idx);
        let site_pos = self.place_in_site(idx, &site);

        if is_self {
            self.inner.self_node = Some(idx);
            self.inner.self_site = Some(site_pos);
        }
        debug!(fqdn = %fqdn, site = %site, is_self = is_self, "node added");
        Ok(idx)
    }

    /// Puts `idx` into the first free slot of the `site` bucket, creating the
    /// bucket if needed. Returns the bucket position.
    fn place_in_site(&mut self, idx: NodeIdx, site: &str) -> usize {
        let site_pos = match self
            .inner
            .sites
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(site))
        {
            Some(pos) => pos,
            None => {
                self.inner.sites.push(SiteBucket {
                    name: site.to_string(),
                    slots: Vec::new(),
                });
                self.inner.sites.len() - 1
            }
        };
        let bucket = &mut self.inner.sites[site_pos];
        match bucket.slots.iter().position(|s| s.is_none()) {
            Some(free) => bucket.slots[free] = Some(idx),
            None => bucket.slots.push(Some(idx)),
        }
        site_pos
    }

    /// Nulls every site slot holding `idx`; slots are never compacted.
    fn clear_slots(&mut self, idx: NodeIdx) {
        for bucket in self.inner.sites.iter_mut() {
            for slot in bucket.slots.iter_mut() {
                if *slot == Some(idx) {
                    *slot = None;
                }
            }
        }
    }

    /// Removes a node from the map and its site slot. Returns false when unknown.
    pub fn remove_node(&mut self, fqdn: &str) -> bool {
        let idx = match self.inner.by_fqdn.remove(&fqdn_key(fqdn)) {
            Some(idx) => idx,
            None => return false,
        };
        self.clear_slots(idx);
        if let Some(node) = self.inner.arena.get_mut(idx.0).and_then(|n| n.take()) {
            if let Some(conn) = node.conn {
                conn.close();
            }
        }
        self.inner.free.push(idx.0);
        if self.inner.self_node == Some(idx) {
            self.inner.self_node = None;
            self.inner.self_site = None;
        }
        info!(fqdn = %fqdn, "node removed");
        true
    }
}
