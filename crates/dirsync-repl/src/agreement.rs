//! Replication agreements and their progress cookies.
//!
//! An agreement is a directed pull link to one partner. Its cookie records the
//! partner USN consumed so far (high-water mark) plus an up-to-date vector of
//! the highest originating USN seen per replica, so changes already received
//! through another partner are not fetched twice.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use dirsync_meta::directory::Directory;
use dirsync_meta::types::{InvocationId, Usn, ATTR_OBJECT_CLASS};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::ReplError;
use crate::rpc::PartnerSession;

/// Object class of replication agreement entries.
pub const OC_REPL_AGREEMENT: &str = "vmwReplicationAgreement";
/// Partner URI attribute (`ldap://host:port`).
pub const ATTR_LABELED_URI: &str = "labeledURI";
/// Persisted high-water mark attribute.
pub const ATTR_LAST_LOCAL_USN: &str = "lastLocalUsnProcessed";
/// Persisted up-to-date vector attribute.
pub const ATTR_UTD_VECTOR: &str = "upToDateVector";

/// Progress through a partner's change stream.
///
/// Text form: `<high-water mark>,<invocation id>:<usn>,<invocation id>:<usn>,`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCookie {
    /// Highest partner USN consumed
    pub high_watermark: Usn,
    /// Highest originating USN seen per replica
    pub utd_vector: BTreeMap<InvocationId, Usn>,
}

impl ProgressCookie {
    /// Cookie positioned at `high_watermark` with an empty vector.
    pub fn at(high_watermark: Usn) -> Self {
        Self {
            high_watermark,
            utd_vector: BTreeMap::new(),
        }
    }

    /// Parses the text form.
    pub fn parse(text: &str) -> Result<Self, ReplError> {
        let (hw, rest) = text.split_once(',').unwrap_or((text, ""));
        let high_watermark = hw
            .trim()
            .parse::<Usn>()
            .map_err(|_| ReplError::InvalidCookie(text.to_string()))?;
        let utd_vector = parse_utd_vector(rest)?;
        Ok(Self {
            high_watermark,
            utd_vector,
        })
    }

    /// True if a change originated at `orig_usn` by `invocation` was already seen.
    pub fn covers(&self, invocation: &InvocationId, orig_usn: Usn) -> bool {
        self.utd_vector
            .get(invocation)
            .map(|seen| *seen >= orig_usn)
            .unwrap_or(false)
    }

    /// Raises the vector entry for `invocation` to at least `orig_usn`.
    pub fn record(&mut self, invocation: &InvocationId, orig_usn: Usn) {
        let seen = self.utd_vector.entry(invocation.clone()).or_insert(0);
        if *seen < orig_usn {
            *seen = orig_usn;
        }
    }

    /// Merges another vector into this one, keeping the maximum per replica.
    pub fn merge_vector(&mut self, other: &ProgressCookie) {
        for (invocation, usn) in &other.utd_vector {
            self.record(invocation, *usn);
        }
    }

    /// Text form of the vector alone.
    pub fn utd_string(&self) -> String {
        self.utd_vector
            .iter()
            .map(|(invocation, usn)| format!("{}:{},", invocation, usn))
            .collect()
    }

    /// Serializes to bytes using bincode.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ReplError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserializes from bytes using bincode.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ReplError> {
        Ok(bincode::deserialize(data)?)
    }
}

impl fmt::Display for ProgressCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.high_watermark, self.utd_string())
    }
}

fn parse_utd_vector(text: &str) -> Result<BTreeMap<InvocationId, Usn>, ReplError> {
    let mut vector = BTreeMap::new();
    for item in text.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (invocation, usn) = item
            .rsplit_once(':')
            .ok_or_else(|| ReplError::InvalidCookie(item.to_string()))?;
        let usn = usn
            .parse::<Usn>()
            .map_err(|_| ReplError::InvalidCookie(item.to_string()))?;
        vector.insert(InvocationId::new(invocation), usn);
    }
    Ok(vector)
}

/// Extracts the host from `ldap://host:port`.
pub fn host_from_uri(uri: &str) -> Option<&str> {
    let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
    let host = rest.split(['/', ':']).next()?;
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Connection state of an agreement's partner link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// Never connected or dropped
    Disconnected,
    /// Session open
    Connected,
    /// Last connect attempt failed
    Failed,
}

struct AgreementState {
    cookie: ProgressCookie,
    session: Option<Arc<dyn PartnerSession>>,
    link: LinkState,
    password_failed_at: Option<Instant>,
    old_password_failed_at: Option<Instant>,
    last_hole_fill: Option<Instant>,
}

/// Directed replication link to one partner.
pub struct ReplicationAgreement {
    partner: String,
    dn: String,
    deleted: AtomicBool,
    state: Mutex<AgreementState>,
}

impl fmt::Debug for ReplicationAgreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicationAgreement")
            .field("partner", &self.partner)
            .field("dn", &self.dn)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}

impl ReplicationAgreement {
    /// Creates an agreement to `partner` stored at `dn`.
    pub fn new(partner: impl Into<String>, dn: impl Into<String>, cookie: ProgressCookie) -> Self {
        Self {
            partner: partner.into(),
            dn: dn.into(),
            deleted: AtomicBool::new(false),
            state: Mutex::new(AgreementState {
                cookie,
                session: None,
                link: LinkState::Disconnected,
                password_failed_at: None,
                old_password_failed_at: None,
                last_hole_fill: None,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AgreementState>, ReplError> {
        self.state
            .lock()
            .map_err(|e| ReplError::Sync(format!("agreement {} poisoned: {}", self.partner, e)))
    }

    /// Partner host name.
    pub fn partner(&self) -> &str {
        &self.partner
    }

    /// DN of the agreement entry.
    pub fn dn(&self) -> &str {
        &self.dn
    }

    /// Flags the agreement for lazy removal.
    pub fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    /// True once flagged deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Current cookie.
    pub fn cookie(&self) -> Result<ProgressCookie, ReplError> {
        Ok(self.lock()?.cookie.clone())
    }

    /// Raises the cookie to `cookie`; returns true if the stored one moved.
    /// Neither the high watermark nor any vector entry is ever lowered.
    pub fn update_cookie(&self, cookie: ProgressCookie) -> Result<bool, ReplError> {
        let mut state = self.lock()?;
        if cookie.high_watermark < state.cookie.high_watermark {
            debug!(
                partner = %self.partner,
                stored = state.cookie.high_watermark,
                offered = cookie.high_watermark,
                "cookie behind stored position, keeping stored watermark"
            );
        }
        let mut merged = state.cookie.clone();
        merged.high_watermark = merged.high_watermark.max(cookie.high_watermark);
        merged.merge_vector(&cookie);
        if state.cookie == merged {
            return Ok(false);
        }
        state.cookie = merged;
        Ok(true)
    }

    /// Writes the cookie to the agreement entry.
    pub fn persist_cookie(&self, directory: &dyn Directory) -> Result<(), ReplError> {
        let cookie = self.cookie()?;
        directory.replace_attribute(
            &self.dn,
            ATTR_LAST_LOCAL_USN,
            vec![cookie.high_watermark.to_string().into_bytes()],
        )?;
        directory.replace_attribute(&self.dn, ATTR_UTD_VECTOR, vec![cookie.utd_string().into_bytes()])?;
        debug!(partner = %self.partner, cookie = %cookie, "cookie persisted");
        Ok(())
    }

    /// Open session, if the link is up.
    pub fn session(&self) -> Result<Option<Arc<dyn PartnerSession>>, ReplError> {
        let state = self.lock()?;
        Ok(state
            .session
            .as_ref()
            .filter(|s| !s.is_closed())
            .cloned())
    }

    /// Stores a freshly opened session.
    pub fn set_connected(&self, session: Arc<dyn PartnerSession>) -> Result<(), ReplError> {
        let mut state = self.lock()?;
        state.session = Some(session);
        state.link = LinkState::Connected;
        Ok(())
    }

    /// Drops the session after a lost connection or failed connect.
    pub fn set_disconnected(&self, failed: bool) -> Result<(), ReplError> {
        let mut state = self.lock()?;
        if let Some(session) = state.session.take() {
            session.close();
        }
        state.link = if failed {
            LinkState::Failed
        } else {
            LinkState::Disconnected
        };
        Ok(())
    }

    /// Link state.
    pub fn link_state(&self) -> Result<LinkState, ReplError> {
        Ok(self.lock()?.link)
    }

    /// When the current (`old == false`) or previous password was last rejected.
    pub fn password_failed_at(&self, old: bool) -> Result<Option<Instant>, ReplError> {
        let state = self.lock()?;
        Ok(if old {
            state.old_password_failed_at
        } else {
            state.password_failed_at
        })
    }

    /// Records or clears a password rejection.
    pub fn set_password_failed(&self, old: bool, at: Option<Instant>) -> Result<(), ReplError> {
        let mut state = self.lock()?;
        if old {
            state.old_password_failed_at = at;
        } else {
            state.password_failed_at = at;
        }
        Ok(())
    }

    /// Last replay from USN 0.
    pub fn last_hole_fill(&self) -> Result<Option<Instant>, ReplError> {
        Ok(self.lock()?.last_hole_fill)
    }

    /// Records a replay from USN 0.
    pub fn set_last_hole_fill(&self, at: Instant) -> Result<(), ReplError> {
        self.lock()?.last_hole_fill = Some(at);
        Ok(())
    }
}

/// The agreements of this server.
///
/// The count is published on a watch channel so the driver can block until
/// the first agreement appears.
pub struct AgreementSet {
    agreements: RwLock<Vec<Arc<ReplicationAgreement>>>,
    count_tx: watch::Sender<usize>,
}

impl AgreementSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        let (count_tx, _) = watch::channel(0);
        Self {
            agreements: RwLock::new(Vec::new()),
            count_tx,
        }
    }

    fn publish(&self, count: usize) {
        self.count_tx.send_replace(count);
    }

    /// Adds an agreement and wakes anyone waiting for the first one.
    pub fn add(&self, agreement: ReplicationAgreement) -> Result<Arc<ReplicationAgreement>, ReplError> {
        let agreement = Arc::new(agreement);
        let count = {
            let mut list = self
                .agreements
                .write()
                .map_err(|e| ReplError::Sync(format!("agreement list poisoned: {}", e)))?;
            list.push(agreement.clone());
            list.len()
        };
        info!(partner = %agreement.partner(), count = count, "replication agreement added");
        self.publish(count);
        Ok(agreement)
    }

    /// Copy of the current list; iterate it without holding the lock.
    pub fn snapshot(&self) -> Result<Vec<Arc<ReplicationAgreement>>, ReplError> {
        Ok(self
            .agreements
            .read()
            .map_err(|e| ReplError::Sync(format!("agreement list poisoned: {}", e)))?
            .clone())
    }

    /// Flags the agreement stored at `dn` deleted. Returns false if unknown.
    pub fn mark_deleted(&self, dn: &str) -> Result<bool, ReplError> {
        let list = self.snapshot()?;
        match list.iter().find(|a| a.dn().eq_ignore_ascii_case(dn)) {
            Some(agreement) => {
                agreement.mark_deleted();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes agreements flagged deleted; returns how many were purged.
    pub fn purge_deleted(&self) -> Result<usize, ReplError> {
        let (purged, count) = {
            let mut list = self
                .agreements
                .write()
                .map_err(|e| ReplError::Sync(format!("agreement list poisoned: {}", e)))?;
            let before = list.len();
            list.retain(|a| {
                if a.is_deleted() {
                    if let Err(e) = a.set_disconnected(false) {
                        warn!(partner = %a.partner(), error = %e, "could not close purged agreement link");
                    }
                    false
                } else {
                    true
                }
            });
            (before - list.len(), list.len())
        };
        if purged > 0 {
            debug!(purged = purged, "deleted agreements purged");
            self.publish(count);
        }
        Ok(purged)
    }

    /// Number of agreements.
    pub fn len(&self) -> usize {
        *self.count_tx.borrow()
    }

    /// True when there are no agreements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Receiver of the agreement count.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.count_tx.subscribe()
    }

    /// Loads agreement entries stored under `base`.
    pub fn load_from_directory(&self, directory: &dyn Directory, base: &str) -> Result<usize, ReplError> {
        let known: Vec<String> = self
            .snapshot()?
            .iter()
            .map(|a| a.dn().to_ascii_lowercase())
            .collect();
        let mut loaded = 0;
        for entry in directory.search_equal(base, ATTR_OBJECT_CLASS, OC_REPL_AGREEMENT)? {
            if known.contains(&entry.dn.to_ascii_lowercase()) {
                continue;
            }
            let Some(partner) = entry.first_str(ATTR_LABELED_URI).and_then(host_from_uri) else {
                debug!(dn = %entry.dn, "agreement without partner uri skipped");
                continue;
            };
            let mut cookie = match entry.first_str(ATTR_LAST_LOCAL_USN) {
                Some(hw) => ProgressCookie::parse(hw)?,
                None => ProgressCookie::default(),
            };
            if let Some(utd) = entry.first_str(ATTR_UTD_VECTOR) {
                cookie.utd_vector = parse_utd_vector(utd)?;
            }
            self.add(ReplicationAgreement::new(partner, entry.dn.clone(), cookie))?;
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for AgreementSet {
    fn default() -> Self {
        Self::new()
    }
}
