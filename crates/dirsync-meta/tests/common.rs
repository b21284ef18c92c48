//! Common test utilities and fixtures for integration tests.

#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dirsync_meta::backend::{Backend, MemoryBackend};
use dirsync_meta::cluster::{ClusterConfig, ClusterState};
use dirsync_meta::directory::{LoopbackConnector, StaticSchema};
use dirsync_meta::raft::{RaftState, RaftTiming};
use dirsync_meta::types::{
    Entry, ATTR_RAFT_TERM, OC_DIR_SERVER, RAFT_CONTEXT_DN, RAFT_PERSIST_STATE_DN,
};

pub const DOMAIN: &str = "dc=example,dc=com";
pub const SITE: &str = "Main";

pub fn server_dn(host: &str) -> String {
    format!(
        "cn={},cn=Servers,cn={},cn=Sites,cn=Configuration,{}",
        host, SITE, DOMAIN
    )
}

/// A single node's view of an in-process cluster backed by one directory
pub struct TestNode {
    pub backend: Arc<MemoryBackend>,
    pub connector: Arc<LoopbackConnector>,
    pub cluster: Arc<ClusterState>,
    pub raft: RaftState,
    pub shutdown: Arc<AtomicBool>,
}

/// Seeds a directory with the raft context and one server object per host.
pub fn seed_directory(hosts: &[&str]) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_entry(Entry::new(RAFT_CONTEXT_DN)).unwrap();
    backend.add_entry(Entry::new(RAFT_PERSIST_STATE_DN)).unwrap();
    backend
        .add_entry(Entry::new(format!("cn=Configuration,{}", DOMAIN)))
        .unwrap();
    backend
        .add_entry(Entry::new(format!("cn=Sites,cn=Configuration,{}", DOMAIN)))
        .unwrap();
    backend
        .add_entry(Entry::new(format!(
            "cn={},cn=Sites,cn=Configuration,{}",
            SITE, DOMAIN
        )))
        .unwrap();
    backend
        .add_entry(Entry::new(format!(
            "cn=Servers,cn={},cn=Sites,cn=Configuration,{}",
            SITE, DOMAIN
        )))
        .unwrap();
    for (i, host) in hosts.iter().enumerate() {
        add_server(&backend, host, i as u32 + 1);
    }
    backend
}

pub fn add_server(backend: &MemoryBackend, host: &str, server_id: u32) {
    backend
        .add_entry(
            Entry::new(server_dn(host))
                .with_attr("objectClass", OC_DIR_SERVER)
                .with_attr("cn", host)
                .with_attr("invocationId", &format!("{:08x}-0000-0000-0000-000000000000", server_id))
                .with_attr("serverId", &server_id.to_string()),
        )
        .unwrap();
}

/// Builds node `self_host` on top of `backend`, loads the cache and Raft state.
pub fn start_node(backend: Arc<MemoryBackend>, self_host: &str) -> TestNode {
    let connector = Arc::new(LoopbackConnector::new());
    let cluster = Arc::new(ClusterState::new(
        ClusterConfig {
            self_fqdn: self_host.to_string(),
            system_domain_dn: Some(DOMAIN.to_string()),
        },
        backend.clone(),
        connector.clone(),
    ));
    cluster.load_cache().unwrap();
    let shutdown = Arc::new(AtomicBool::new(false));
    let raft = RaftState::new(
        cluster.clone(),
        backend.clone(),
        Arc::new(StaticSchema::new([ATTR_RAFT_TERM])),
        shutdown.clone(),
        RaftTiming {
            election_timeout_ms: 50,
            ping_interval_ms: 10,
        },
    );
    raft.load_raft_state().unwrap();
    TestNode {
        backend,
        connector,
        cluster,
        raft,
        shutdown,
    }
}
