//! Raft role and term bookkeeping.
//!
//! This module does not run elections. It owns the fields an election
//! implementation relies on (term, role, leader, cluster size, ping timers,
//! vote) and the durable term persistence contract: a term, once persisted,
//! never regresses across a restart.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterState, ConnState};
use crate::directory::{Directory, Schema};
use crate::types::{Entry, MetaError, Term, ATTR_RAFT_TERM, RAFT_CONTEXT_DN, RAFT_PERSIST_STATE_DN};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Role of this node in the consensus layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    /// Following a leader
    Follower,
    /// Requesting votes
    Candidate,
    /// Leading the cluster
    Leader,
}

impl fmt::Display for RaftRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RaftRole::Follower => "follower",
            RaftRole::Candidate => "candidate",
            RaftRole::Leader => "leader",
        };
        f.write_str(s)
    }
}

/// Next action chosen by [`RaftState::evaluate`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RaftCommand {
    /// Nothing to send
    None,
    /// Leader heartbeat
    Ping,
    /// Start or continue an election
    RequestVote,
}

/// Outcome of counting votes for the current election.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    /// Majority reached; this node is now leader
    Won,
    /// No majority; retry after the given back-off
    Split {
        /// Randomized wait before the next attempt
        backoff_ms: u64,
    },
    /// Role changed while votes were collected
    Abandoned,
}

/// Election timing parameters.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RaftTiming {
    /// Follower waits this long without a ping before standing for election
    pub election_timeout_ms: u64,
    /// Leader ping interval
    pub ping_interval_ms: u64,
}

impl Default for RaftTiming {
    fn default() -> Self {
        Self {
            election_timeout_ms: 4000,
            ping_interval_ms: 1000,
        }
    }
}

#[derive(Debug)]
struct RaftInner {
    term: Term,
    role: RaftRole,
    leader: Option<String>,
    hostname: String,
    cluster_size: usize,
    last_ping_recv_ms: u64,
    last_ping_send_ms: u64,
    voted_for: Option<String>,
    voted_for_term: Term,
    cmd: RaftCommand,
    initialized: bool,
    enabled: bool,
}

/// Invoked when a term cannot be persisted outside shutdown.
pub type FatalHandler = Box<dyn Fn(&MetaError) + Send + Sync>;

/// Raft role/term state for the local node.
pub struct RaftState {
    inner: Mutex<RaftInner>,
    cluster: Arc<ClusterState>,
    directory: Arc<dyn Directory>,
    schema: Arc<dyn Schema>,
    shutdown: Arc<AtomicBool>,
    timing: RaftTiming,
    on_fatal: FatalHandler,
}

impl RaftState {
    /// Creates uninitialized state. Term persistence failures abort the process.
    pub fn new(
        cluster: Arc<ClusterState>,
        directory: Arc<dyn Directory>,
        schema: Arc<dyn Schema>,
        shutdown: Arc<AtomicBool>,
        timing: RaftTiming,
    ) -> Self {
        let hostname = cluster.self_fqdn().to_string();
        Self {
            inner: Mutex::new(RaftInner {
                term: Term::new(0),
                role: RaftRole::Follower,
                leader: None,
                hostname,
                cluster_size: 0,
                last_ping_recv_ms: 0,
                last_ping_send_ms: 0,
                voted_for: None,
                voted_for_term: Term::new(0),
                cmd: RaftCommand::None,
                initialized: false,
                enabled: false,
            }),
            cluster,
            directory,
            schema,
            shutdown,
            timing,
            on_fatal: Box::new(|_| std::process::abort()),
        }
    }

    /// Replaces the fatal term-persistence handler.
    pub fn with_fatal_handler(mut self, handler: FatalHandler) -> Self {
        self.on_fatal = handler;
        self
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, RaftInner>, MetaError> {
        self.inner
            .lock()
            .map_err(|e| MetaError::InvalidState(format!("raft state poisoned: {}", e)))
    }

    /// Loads the persisted term and resets volatile state.
    ///
    /// The subsystem is enabled only if the schema defines the term attribute.
    /// On first run (no term stored yet) term 1 is persisted.
    pub fn load_raft_state(&self) -> Result<(), MetaError> {
        let schema_ok = self.schema.has_attribute(ATTR_RAFT_TERM);
        let term = if schema_ok {
            let entry = self
                .directory
                .get_entry(RAFT_PERSIST_STATE_DN)?
                .ok_or_else(|| MetaError::EntryNotFound(RAFT_PERSIST_STATE_DN.to_string()))?;
            match parse_term(&entry)? {
                Some(term) => term,
                None => {
                    self.persist_term(Term::new(1))?;
                    Term::new(1)
                }
            }
        } else {
            warn!(attr = ATTR_RAFT_TERM, "schema lacks raft term attribute, raft disabled");
            Term::new(1)
        };

        {
            let mut inner = self.lock()?;
            inner.term = term;
            inner.role = RaftRole::Follower;
            inner.leader = None;
            inner.cmd = RaftCommand::None;
            inner.last_ping_recv_ms = now_ms();
            inner.voted_for = None;
            inner.voted_for_term = Term::new(0);
            inner.initialized = true;
            inner.enabled = schema_ok;
        }
        let size = self.set_cluster_size()?;
        info!(term = %term, cluster_size = size, enabled = schema_ok, "raft state loaded");
        Ok(())
    }

    /// Recomputes cluster size as the number of active nodes in the self site.
    pub fn set_cluster_size(&self) -> Result<usize, MetaError> {
        let size = {
            let guard = self.cluster.read()?;
            if guard.is_loaded() {
                guard
                    .self_site_nodes()?
                    .iter()
                    .filter(|n| n.active)
                    .count()
            } else {
                0
            }
        };
        let mut inner = self.lock()?;
        if inner.cluster_size != size {
            debug!(old = inner.cluster_size, new = size, "cluster size changed");
        }
        inner.cluster_size = size;
        Ok(size)
    }

    /// Durably stores `term`.
    ///
    /// A failure while not shutting down is fatal: the handler runs (by default
    /// aborting the process). During shutdown the error is returned.
    pub fn persist_term(&self, term: Term) -> Result<(), MetaError> {
        let result = self.directory.replace_attribute(
            RAFT_PERSIST_STATE_DN,
            ATTR_RAFT_TERM,
            vec![term.to_string().into_bytes()],
        );
        match result {
            Ok(()) => {
                debug!(term = %term, "raft term persisted");
                Ok(())
            }
            Err(e) if self.shutdown.load(Ordering::SeqCst) => {
                warn!(term = %term, error = %e, "raft term not persisted during shutdown");
                Err(MetaError::ShuttingDown)
            }
            Err(e) => {
                error!(term = %term, error = %e, "failed to persist raft term");
                (self.on_fatal)(&e);
                Err(e)
            }
        }
    }

    /// Follower-side handling of a leader ping carrying `term`.
    ///
    /// Returns false when the ping is stale and was ignored.
    pub fn observe_term(&self, term: Term, leader: &str) -> Result<bool, MetaError> {
        let increased = {
            let mut inner = self.lock()?;
            if !inner.initialized || term < inner.term {
                return Ok(false);
            }
            let increased = term > inner.term;
            inner.role = RaftRole::Follower;
            inner.term = term;
            inner.last_ping_recv_ms = now_ms();
            inner.leader = Some(leader.to_string());
            increased
        };
        if increased {
            info!(term = %term, leader = %leader, "following new leader");
            self.persist_term(term)?;
        }
        Ok(true)
    }

    /// Leader-side handling of a reply carrying `term`; steps down on a higher term.
    pub fn observe_reply_term(&self, term: Term) -> Result<bool, MetaError> {
        {
            let mut inner = self.lock()?;
            if term <= inner.term {
                return Ok(false);
            }
            inner.term = term;
            inner.role = RaftRole::Follower;
            inner.leader = None;
            inner.last_ping_recv_ms = now_ms();
        }
        info!(term = %term, "higher term seen, stepping down");
        self.persist_term(term)?;
        Ok(true)
    }

    /// Starts an election: bumps the term, becomes candidate and votes for self.
    pub fn begin_election(&self) -> Result<Term, MetaError> {
        let term = {
            let mut inner = self.lock()?;
            let term = inner.term.next();
            inner.term = term;
            inner.role = RaftRole::Candidate;
            inner.leader = None;
            inner.voted_for = Some(inner.hostname.clone());
            inner.voted_for_term = term;
            term
        };
        self.persist_term(term)?;
        info!(term = %term, "election started");
        Ok(term)
    }

    /// Records a vote granted to `candidate` for `term`.
    pub fn record_vote(&self, candidate: &str, term: Term) -> Result<bool, MetaError> {
        let mut inner = self.lock()?;
        if term < inner.term || inner.voted_for_term >= term {
            return Ok(false);
        }
        inner.voted_for = Some(candidate.to_string());
        inner.voted_for_term = term;
        Ok(true)
    }

    /// Counts granted votes (self included) for the current election.
    pub fn evaluate_vote_result(&self, granted: usize) -> Result<VoteOutcome, MetaError> {
        let (role, size) = {
            let inner = self.lock()?;
            (inner.role, inner.cluster_size)
        };
        if role != RaftRole::Candidate {
            return Ok(VoteOutcome::Abandoned);
        }
        if granted >= size / 2 + 1 {
            self.become_leader()?;
            return Ok(VoteOutcome::Won);
        }
        let spread = (self.timing.ping_interval_ms / 2).max(1);
        let backoff_ms = rand::thread_rng().gen_range(0..spread);
        debug!(granted = granted, cluster_size = size, backoff_ms = backoff_ms, "split vote");
        Ok(VoteOutcome::Split { backoff_ms })
    }

    /// Takes leadership after a won election.
    pub fn become_leader(&self) -> Result<(), MetaError> {
        let mut inner = self.lock()?;
        inner.role = RaftRole::Leader;
        inner.leader = Some(inner.hostname.clone());
        inner.last_ping_send_ms = 0;
        info!(term = %inner.term, "became leader");
        Ok(())
    }

    /// Chooses the next command from the timers and returns it with the time
    /// to wait before evaluating again.
    pub fn evaluate(&self, now_ms: u64) -> Result<(RaftCommand, u64), MetaError> {
        let mut inner = self.lock()?;
        let timeout = self.timing.election_timeout_ms;
        let ping = self.timing.ping_interval_ms;
        let (cmd, wait) = if !inner.initialized || !inner.enabled || inner.cluster_size <= 1 {
            (RaftCommand::None, timeout)
        } else {
            match inner.role {
                RaftRole::Follower => {
                    let elapsed = now_ms.saturating_sub(inner.last_ping_recv_ms);
                    if elapsed >= timeout {
                        (RaftCommand::RequestVote, 0)
                    } else {
                        (RaftCommand::None, timeout - elapsed)
                    }
                }
                RaftRole::Leader => {
                    let elapsed = now_ms.saturating_sub(inner.last_ping_send_ms);
                    if elapsed >= ping {
                        inner.last_ping_send_ms = now_ms;
                        (RaftCommand::Ping, ping)
                    } else {
                        (RaftCommand::None, ping - elapsed)
                    }
                }
                RaftRole::Candidate => (RaftCommand::RequestVote, 0),
            }
        };
        inner.cmd = cmd;
        Ok((cmd, wait))
    }

    /// Handles deletion of a server object: deactivates it and re-initializes.
    pub fn on_server_deleted(&self, entry: &Entry) -> Result<bool, MetaError> {
        if !self.cluster.delete_node(entry)? {
            return Ok(false);
        }
        self.lock()?.initialized = false;
        self.set_cluster_size()?;
        Ok(true)
    }

    /// Periodic refresh: reloads the cluster cache if requested and
    /// (re)loads Raft state when it is not initialized.
    pub fn refresh(&self) -> Result<(), MetaError> {
        if self.cluster.take_reload()? {
            self.cluster.load_cache()?;
        }
        let initialized = self.lock()?.initialized;
        if initialized {
            self.set_cluster_size()?;
        } else {
            self.load_raft_state()?;
        }
        Ok(())
    }

    /// Current term.
    pub fn term(&self) -> Result<Term, MetaError> {
        Ok(self.lock()?.term)
    }

    /// Current cluster size.
    pub fn cluster_size(&self) -> Result<usize, MetaError> {
        Ok(self.lock()?.cluster_size)
    }

    /// True once state was loaded with schema support.
    pub fn is_enabled(&self) -> Result<bool, MetaError> {
        let inner = self.lock()?;
        Ok(inner.initialized && inner.enabled)
    }

    /// Last command chosen by [`RaftState::evaluate`].
    pub fn last_command(&self) -> Result<RaftCommand, MetaError> {
        Ok(self.lock()?.cmd)
    }

    /// Vote cast in the latest term, if any.
    pub fn voted_for(&self) -> Result<Option<(String, Term)>, MetaError> {
        let inner = self.lock()?;
        Ok(inner
            .voted_for
            .clone()
            .map(|v| (v, inner.voted_for_term)))
    }

    /// Reported role; a node without peers is its own leader.
    pub fn get_role(&self) -> Result<RaftRole, MetaError> {
        let inner = self.lock()?;
        Ok(if inner.cluster_size < 2 {
            RaftRole::Leader
        } else {
            inner.role
        })
    }

    /// Leader known to a follower of a multi-node cluster.
    pub fn get_leader(&self) -> Result<Option<String>, MetaError> {
        let inner = self.lock()?;
        if inner.cluster_size >= 2 && inner.role == RaftRole::Follower {
            Ok(inner.leader.clone())
        } else {
            Ok(None)
        }
    }

    /// Host name of the leader as shown to clients.
    pub fn leader_string(&self) -> Result<Option<String>, MetaError> {
        let inner = self.lock()?;
        let host = (!inner.hostname.is_empty()).then(|| inner.hostname.clone());
        Ok(if inner.cluster_size < 2 {
            host
        } else {
            match inner.role {
                RaftRole::Follower => inner.leader.clone(),
                RaftRole::Leader => host,
                RaftRole::Candidate => None,
            }
        })
    }

    /// Active followers: self on a follower, connected peers on the leader.
    pub fn followers(&self) -> Result<Vec<String>, MetaError> {
        let (role, size, hostname) = {
            let inner = self.lock()?;
            (inner.role, inner.cluster_size, inner.hostname.clone())
        };
        if size < 2 {
            return Ok(Vec::new());
        }
        match role {
            RaftRole::Follower if !hostname.is_empty() => Ok(vec![hostname]),
            RaftRole::Leader => {
                let guard = self.cluster.read()?;
                Ok(guard
                    .self_site_nodes()?
                    .into_iter()
                    .filter(|n| n.active && !n.is_self && n.conn_state != ConnState::Disconnected)
                    .map(|n| n.fqdn.clone())
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Human-readable state lines.
    pub fn state(&self) -> Result<Vec<String>, MetaError> {
        let (role, size, hostname, term, leader) = {
            let inner = self.lock()?;
            (
                inner.role,
                inner.cluster_size,
                inner.hostname.clone(),
                inner.term,
                inner.leader.clone(),
            )
        };
        if hostname.is_empty() {
            return Ok(Vec::new());
        }
        let shown = if size < 2 { RaftRole::Leader } else { role };
        let mut lines = vec![
            format!("node: {}", hostname),
            format!("role: {}", shown),
            format!("term: {}", term),
        ];
        match role {
            RaftRole::Follower => {
                if let Some(leader) = leader {
                    lines.push(format!("leader: {}", leader));
                }
            }
            RaftRole::Leader => {
                let guard = self.cluster.read()?;
                for node in guard.self_site_nodes()? {
                    if node.is_self || !node.active {
                        continue;
                    }
                    let status = if node.conn_state == ConnState::Disconnected {
                        "disconnected"
                    } else {
                        "active"
                    };
                    lines.push(format!("follower: {} {}", node.fqdn, status));
                }
            }
            RaftRole::Candidate => {}
        }
        Ok(lines)
    }

    /// Host names of all cluster members in the cache.
    pub fn members(&self) -> Result<Vec<String>, MetaError> {
        let guard = self.cluster.read()?;
        Ok(guard
            .nodes()
            .into_iter()
            .filter(|n| n.active)
            .map(|n| n.fqdn.clone())
            .collect())
    }

    /// True when a request for `dn` must be referred to the leader.
    pub fn need_referral(&self, dn: &str) -> Result<bool, MetaError> {
        let lower = dn.trim().to_ascii_lowercase();
        if lower.is_empty()
            || lower == RAFT_CONTEXT_DN
            || lower.ends_with(&format!(",{}", RAFT_CONTEXT_DN))
        {
            return Ok(false);
        }
        Ok(self.get_role()? == RaftRole::Follower)
    }

    /// True when local writes must be refused.
    pub fn disallow_updates(&self) -> Result<bool, MetaError> {
        Ok(self.get_role()? != RaftRole::Leader)
    }
}

fn parse_term(entry: &Entry) -> Result<Option<Term>, MetaError> {
    match entry.first_str(ATTR_RAFT_TERM) {
        None => Ok(None),
        Some(text) => text
            .trim()
            .parse::<u64>()
            .map(|t| Some(Term::new(t)))
            .map_err(|_| MetaError::InvalidMetadata(format!("{}: {}", ATTR_RAFT_TERM, text))),
    }
}
