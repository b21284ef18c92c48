//! Partner RPC: connect, fetch changes since a cookie, hot database copy.
//!
//! The wire transport is external; this module defines the async seams the
//! driver calls and an in-memory partner set used by tests and the
//! standalone binary.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dirsync_meta::types::{AttrMetadata, InvocationId, Usn, ValueMetadata};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agreement::ProgressCookie;
use crate::conflict::SupplierAttr;
use crate::error::ReplError;

/// Kind of a replicated change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    /// Entry creation
    Add,
    /// Attribute or value modification
    Modify,
    /// Entry removal
    Delete,
}

/// A value-level change to a multi-valued attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueChange {
    /// Supplier metadata of the attribute generation the change belongs to
    pub attr_meta: AttrMetadata,
    /// The proposed value record
    pub value: ValueMetadata,
}

/// One change read from a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplChange {
    /// Kind of change
    pub kind: ChangeKind,
    /// Target DN
    pub dn: String,
    /// USN on the partner; advances the high-water mark
    pub usn: Usn,
    /// Replica that originated the change
    pub originating: InvocationId,
    /// USN on the originating replica
    pub orig_usn: Usn,
    /// Attributes with supplier metadata
    pub attrs: Vec<SupplierAttr>,
    /// Value-level changes
    pub value_changes: Vec<ValueChange>,
}

impl ReplChange {
    fn new(kind: ChangeKind, dn: &str, usn: Usn, originating: &InvocationId, orig_usn: Usn) -> Self {
        Self {
            kind,
            dn: dn.to_string(),
            usn,
            originating: originating.clone(),
            orig_usn,
            attrs: Vec::new(),
            value_changes: Vec::new(),
        }
    }

    /// An add of `dn`.
    pub fn add(dn: &str, usn: Usn, originating: &InvocationId, orig_usn: Usn) -> Self {
        Self::new(ChangeKind::Add, dn, usn, originating, orig_usn)
    }

    /// A modify of `dn`.
    pub fn modify(dn: &str, usn: Usn, originating: &InvocationId, orig_usn: Usn) -> Self {
        Self::new(ChangeKind::Modify, dn, usn, originating, orig_usn)
    }

    /// A delete of `dn`.
    pub fn delete(dn: &str, usn: Usn, originating: &InvocationId, orig_usn: Usn) -> Self {
        Self::new(ChangeKind::Delete, dn, usn, originating, orig_usn)
    }

    /// Appends an attribute.
    pub fn with_attr(mut self, attr: SupplierAttr) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Appends a value change.
    pub fn with_value_change(mut self, attr_meta: AttrMetadata, value: ValueMetadata) -> Self {
        self.value_changes.push(ValueChange { attr_meta, value });
        self
    }
}

/// One page of a partner's change stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangePage {
    /// Changes in partner USN order
    pub changes: Vec<ReplChange>,
    /// Set once the partner has no more changes; carries its final position
    pub sync_done: Option<ProgressCookie>,
}

/// An authenticated session with one partner.
#[async_trait]
pub trait PartnerSession: Send + Sync {
    /// Partner host name.
    fn partner(&self) -> &str;

    /// Fetches up to `page_size` changes after `cookie`.
    async fn fetch_changes(
        &self,
        cookie: &ProgressCookie,
        page_size: usize,
    ) -> Result<ChangePage, ReplError>;

    /// Closes the session.
    fn close(&self);

    /// True once closed.
    fn is_closed(&self) -> bool;
}

/// Opens partner sessions with the machine account.
#[async_trait]
pub trait PartnerConnector: Send + Sync {
    /// Binds to `partner`.
    ///
    /// Fails with `ReplError::InvalidCredentials` when the password is rejected.
    async fn connect(
        &self,
        partner: &str,
        account: &str,
        password: &str,
    ) -> Result<Arc<dyn PartnerSession>, ReplError>;

    /// Hot-copies the partner database onto this node.
    async fn copy_database(&self, partner: &str, account: &str, password: &str)
        -> Result<(), ReplError>;
}

#[derive(Default)]
struct PartnersInner {
    logs: HashMap<String, BTreeMap<Usn, ReplChange>>,
    unreachable: HashSet<String>,
    passwords: HashMap<String, String>,
    lose_next_fetch: HashSet<String>,
    binds: Vec<(String, String)>,
    copies: Vec<String>,
    fetches: u64,
}

/// Scripted in-memory partners.
///
/// Each partner serves a change log keyed by its USN. Changes whose
/// originating USN is already covered by the caller's up-to-date vector are
/// filtered out, as a real supplier would.
#[derive(Clone, Default)]
pub struct MemoryPartners {
    inner: Arc<Mutex<PartnersInner>>,
}

impl MemoryPartners {
    /// Creates a set with no partners.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PartnersInner>, ReplError> {
        lock_inner(&self.inner)
    }

    /// Appends a change to `partner`'s log.
    pub fn publish(&self, partner: &str, change: ReplChange) -> Result<(), ReplError> {
        self.lock()?
            .logs
            .entry(partner.to_string())
            .or_default()
            .insert(change.usn, change);
        Ok(())
    }

    /// Makes connects to `partner` fail.
    pub fn set_unreachable(&self, partner: &str, unreachable: bool) -> Result<(), ReplError> {
        let mut inner = self.lock()?;
        if unreachable {
            inner.unreachable.insert(partner.to_string());
        } else {
            inner.unreachable.remove(partner);
        }
        Ok(())
    }

    /// Only `password` is accepted by `partner` from now on.
    pub fn set_password(&self, partner: &str, password: &str) -> Result<(), ReplError> {
        self.lock()?
            .passwords
            .insert(partner.to_string(), password.to_string());
        Ok(())
    }

    /// The next fetch from `partner` fails with a lost connection.
    pub fn lose_next_fetch(&self, partner: &str) -> Result<(), ReplError> {
        self.lock()?.lose_next_fetch.insert(partner.to_string());
        Ok(())
    }

    /// Every bind attempt as (partner, password).
    pub fn binds(&self) -> Result<Vec<(String, String)>, ReplError> {
        Ok(self.lock()?.binds.clone())
    }

    /// Partners a database copy was taken from.
    pub fn copies(&self) -> Result<Vec<String>, ReplError> {
        Ok(self.lock()?.copies.clone())
    }

    /// Number of fetch calls served.
    pub fn fetches(&self) -> Result<u64, ReplError> {
        Ok(self.lock()?.fetches)
    }

    fn check_bind(&self, partner: &str, password: &str) -> Result<(), ReplError> {
        let mut inner = self.lock()?;
        inner.binds.push((partner.to_string(), password.to_string()));
        if inner.unreachable.contains(partner) {
            return Err(ReplError::Connection {
                partner: partner.to_string(),
                msg: "connection refused".to_string(),
            });
        }
        match inner.passwords.get(partner) {
            Some(expected) if expected != password => Err(ReplError::InvalidCredentials {
                partner: partner.to_string(),
            }),
            _ => Ok(()),
        }
    }
}

fn lock_inner(
    inner: &Mutex<PartnersInner>,
) -> Result<std::sync::MutexGuard<'_, PartnersInner>, ReplError> {
    inner
        .lock()
        .map_err(|e| ReplError::Sync(format!("partner set poisoned: {}", e)))
}

#[async_trait]
impl PartnerConnector for MemoryPartners {
    async fn connect(
        &self,
        partner: &str,
        _account: &str,
        password: &str,
    ) -> Result<Arc<dyn PartnerSession>, ReplError> {
        self.check_bind(partner, password)?;
        debug!(partner = %partner, "partner session opened");
        Ok(Arc::new(MemorySession {
            partner: partner.to_string(),
            inner: self.inner.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn copy_database(
        &self,
        partner: &str,
        _account: &str,
        password: &str,
    ) -> Result<(), ReplError> {
        self.check_bind(partner, password)?;
        self.lock()?.copies.push(partner.to_string());
        Ok(())
    }
}

struct MemorySession {
    partner: String,
    inner: Arc<Mutex<PartnersInner>>,
    closed: AtomicBool,
}

#[async_trait]
impl PartnerSession for MemorySession {
    fn partner(&self) -> &str {
        &self.partner
    }

    async fn fetch_changes(
        &self,
        cookie: &ProgressCookie,
        page_size: usize,
    ) -> Result<ChangePage, ReplError> {
        if self.is_closed() {
            return Err(ReplError::ConnectionLost {
                partner: self.partner.clone(),
            });
        }
        let mut inner = lock_inner(&self.inner)?;
        inner.fetches += 1;
        if inner.lose_next_fetch.remove(&self.partner) {
            self.closed.store(true, Ordering::SeqCst);
            return Err(ReplError::ConnectionLost {
                partner: self.partner.clone(),
            });
        }

        let Some(log) = inner.logs.get(&self.partner) else {
            return Ok(ChangePage {
                changes: Vec::new(),
                sync_done: Some(cookie.clone()),
            });
        };
        let mut changes = Vec::new();
        let mut exhausted = true;
        for change in log.range(cookie.high_watermark + 1..).map(|(_, c)| c) {
            if changes.len() == page_size {
                exhausted = false;
                break;
            }
            if cookie.covers(&change.originating, change.orig_usn) {
                continue;
            }
            changes.push(change.clone());
        }
        let sync_done = exhausted.then(|| {
            let last = log.keys().next_back().copied().unwrap_or(0);
            ProgressCookie {
                high_watermark: last.max(cookie.high_watermark),
                utd_vector: cookie.utd_vector.clone(),
            }
        });
        Ok(ChangePage { changes, sync_done })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invo() -> InvocationId {
        InvocationId::new("22222222-0000-0000-0000-000000000000")
    }

    fn partners_with_log(n: u64) -> MemoryPartners {
        let partners = MemoryPartners::new();
        for usn in 1..=n {
            partners
                .publish("b", ReplChange::add(&format!("cn=e{},dc=x", usn), usn, &invo(), usn))
                .unwrap();
        }
        partners
    }

    #[tokio::test]
    async fn test_paged_fetch() {
        let partners = partners_with_log(5);
        let session = partners.connect("b", "acct", "pw").await.unwrap();

        let page = session.fetch_changes(&ProgressCookie::at(0), 2).await.unwrap();
        assert_eq!(page.changes.len(), 2);
        assert!(page.sync_done.is_none());

        let page = session.fetch_changes(&ProgressCookie::at(4), 2).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.sync_done.unwrap().high_watermark, 5);
    }

    #[tokio::test]
    async fn test_covered_changes_filtered() {
        let partners = partners_with_log(3);
        let session = partners.connect("b", "acct", "pw").await.unwrap();
        let mut cookie = ProgressCookie::at(0);
        cookie.record(&invo(), 2);
        let page = session.fetch_changes(&cookie, 10).await.unwrap();
        assert_eq!(page.changes.len(), 1);
        assert_eq!(page.changes[0].usn, 3);
        let done = page.sync_done.unwrap();
        assert_eq!(done.high_watermark, 3);
        assert!(done.covers(&invo(), 2));
    }

    #[tokio::test]
    async fn test_empty_log_returns_cookie() {
        let partners = MemoryPartners::new();
        let session = partners.connect("c", "acct", "pw").await.unwrap();
        let page = session.fetch_changes(&ProgressCookie::at(7), 10).await.unwrap();
        assert!(page.changes.is_empty());
        assert_eq!(page.sync_done, Some(ProgressCookie::at(7)));
    }

    #[tokio::test]
    async fn test_password_and_reachability() {
        let partners = MemoryPartners::new();
        partners.set_password("b", "new").unwrap();
        assert!(matches!(
            partners.connect("b", "acct", "old").await,
            Err(ReplError::InvalidCredentials { .. })
        ));
        assert!(partners.connect("b", "acct", "new").await.is_ok());

        partners.set_unreachable("b", true).unwrap();
        assert!(matches!(
            partners.connect("b", "acct", "new").await,
            Err(ReplError::Connection { .. })
        ));
        assert_eq!(partners.binds().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_lost_connection_closes_session() {
        let partners = partners_with_log(1);
        let session = partners.connect("b", "acct", "pw").await.unwrap();
        partners.lose_next_fetch("b").unwrap();
        assert!(matches!(
            session.fetch_changes(&ProgressCookie::default(), 10).await,
            Err(ReplError::ConnectionLost { .. })
        ));
        assert!(session.is_closed());
    }
}
