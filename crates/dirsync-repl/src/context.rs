//! Process-wide server context.
//!
//! One explicit object owns the collaborators and the shared state the
//! driver, the cluster cache and Raft bookkeeping operate on. It is created at
//! startup and passed by reference everywhere.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use dirsync_meta::backend::Backend;
use dirsync_meta::cluster::{ClusterConfig, ClusterState};
use dirsync_meta::directory::{Directory, NodeConnector, Schema};
use dirsync_meta::raft::{RaftState, RaftTiming};
use dirsync_meta::usn::UsnTracker;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agreement::AgreementSet;
use crate::config::ReplConfig;
use crate::error::ReplError;
use crate::metrics::ReplicationMetrics;
use crate::rpc::PartnerConnector;

/// Global server state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Serving and replicating
    Normal,
    /// Local writes refused; replication paused
    ReadOnly,
    /// Leaving the federation; replication paused
    Demoting,
    /// Shutting down
    Shutdown,
    /// Unrecoverable error; the driver stopped
    Failure,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Normal => "normal",
            ServerState::ReadOnly => "read-only",
            ServerState::Demoting => "demoting",
            ServerState::Shutdown => "shutdown",
            ServerState::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// External collaborators the context is built from.
pub struct Collaborators {
    /// Storage backend
    pub backend: Arc<dyn Backend>,
    /// Internal directory search/modify
    pub directory: Arc<dyn Directory>,
    /// Active schema
    pub schema: Arc<dyn Schema>,
    /// Directory connections to cluster peers
    pub nodes: Arc<dyn NodeConnector>,
    /// Partner RPC
    pub partners: Arc<dyn PartnerConnector>,
}

/// Shared state of one server process.
pub struct ServerContext {
    /// Loaded configuration
    pub config: Arc<ReplConfig>,
    /// Storage backend
    pub backend: Arc<dyn Backend>,
    /// Internal directory search/modify
    pub directory: Arc<dyn Directory>,
    /// Outstanding-USN tracker
    pub tracker: Arc<UsnTracker>,
    /// Cluster membership cache
    pub cluster: Arc<ClusterState>,
    /// Raft role/term bookkeeping
    pub raft: Arc<RaftState>,
    /// Replication agreements
    pub agreements: Arc<AgreementSet>,
    /// Replication metrics
    pub metrics: Arc<ReplicationMetrics>,
    /// Partner RPC
    pub partners: Arc<dyn PartnerConnector>,
    shutting_down: Arc<AtomicBool>,
    cancel: CancellationToken,
    replicate_now: Notify,
    cycles: watch::Sender<u64>,
    state: Mutex<ServerState>,
}

impl ServerContext {
    /// Wires the context; nothing is loaded yet.
    pub fn new(config: ReplConfig, collaborators: Collaborators) -> Self {
        let shutting_down = Arc::new(AtomicBool::new(false));
        let cluster = Arc::new(ClusterState::new(
            ClusterConfig {
                self_fqdn: config.server.fqdn.clone(),
                system_domain_dn: config.system_domain_dn.clone(),
            },
            collaborators.directory.clone(),
            collaborators.nodes,
        ));
        let raft = Arc::new(RaftState::new(
            cluster.clone(),
            collaborators.directory.clone(),
            collaborators.schema,
            shutting_down.clone(),
            RaftTiming {
                election_timeout_ms: config.election_timeout_ms,
                ping_interval_ms: config.ping_interval_ms,
            },
        ));
        let (cycles, _) = watch::channel(0);
        Self {
            config: Arc::new(config),
            backend: collaborators.backend,
            directory: collaborators.directory,
            tracker: Arc::new(UsnTracker::new()),
            cluster,
            raft,
            agreements: Arc::new(AgreementSet::new()),
            metrics: Arc::new(ReplicationMetrics::new()),
            partners: collaborators.partners,
            shutting_down,
            cancel: CancellationToken::new(),
            replicate_now: Notify::new(),
            cycles,
            state: Mutex::new(ServerState::Normal),
        }
    }

    /// Startup: seeds the USN boundary, then, once promoted, loads the
    /// cluster cache, Raft state and the stored agreements.
    pub fn init(&self) -> Result<(), ReplError> {
        self.tracker.initialize(self.backend.as_ref())?;
        let Some(domain) = self.config.system_domain_dn.clone() else {
            warn!("server not promoted, cluster state and agreements not loaded");
            return Ok(());
        };
        self.cluster.load_cache()?;
        self.raft.load_raft_state()?;
        let loaded = self
            .agreements
            .load_from_directory(self.directory.as_ref(), &domain)?;
        info!(
            fqdn = %self.config.server.fqdn,
            agreements = loaded,
            "server context initialized"
        );
        Ok(())
    }

    /// Current server state.
    pub fn state(&self) -> Result<ServerState, ReplError> {
        self.state
            .lock()
            .map(|s| *s)
            .map_err(|e| ReplError::Sync(format!("server state poisoned: {}", e)))
    }

    /// Sets the server state.
    pub fn set_state(&self, state: ServerState) -> Result<(), ReplError> {
        let mut current = self
            .state
            .lock()
            .map_err(|e| ReplError::Sync(format!("server state poisoned: {}", e)))?;
        let from = *current;
        if from != state {
            info!(from = %from, to = %state, "server state changed");
            *current = state;
        }
        Ok(())
    }

    /// True once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Begins a cooperative shutdown.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        if let Err(e) = self.set_state(ServerState::Shutdown) {
            warn!(error = %e, "could not record shutdown state");
        }
        self.cancel.cancel();
    }

    /// Token cancelled on shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Wakes the driver out of its inter-cycle sleep.
    pub fn replicate_now(&self) {
        self.replicate_now.notify_one();
    }

    /// Resolves when `replicate_now` is called.
    pub async fn replicate_now_requested(&self) {
        self.replicate_now.notified().await;
    }

    /// Completed replication cycles.
    pub fn cycle_count(&self) -> u64 {
        *self.cycles.borrow()
    }

    /// Records a completed cycle; returns the new count.
    pub fn complete_cycle(&self) -> u64 {
        let mut count = 0;
        self.cycles.send_modify(|c| {
            *c += 1;
            count = *c;
        });
        count
    }

    /// Blocks until the first replication cycle completed.
    ///
    /// Used to hold back client-facing ports.
    pub async fn wait_first_cycle(&self) -> Result<(), ReplError> {
        let mut rx = self.cycles.subscribe();
        tokio::select! {
            res = async { rx.wait_for(|c| *c > 0).await.map(|_| ()) } => {
                res.map_err(|e| ReplError::Sync(format!("cycle signal closed: {}", e)))
            }
            _ = self.cancel.cancelled() => Err(ReplError::Shutdown),
        }
    }
}
