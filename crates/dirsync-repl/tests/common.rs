//! Shared fixtures for replication integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dirsync_meta::backend::{Backend, MemoryBackend};
use dirsync_meta::directory::{LoopbackConnector, StaticSchema};
use dirsync_meta::types::{
    AttrMetadata, Entry, InvocationId, Usn, ATTR_RAFT_TERM, OC_DIR_SERVER, RAFT_CONTEXT_DN,
    RAFT_PERSIST_STATE_DN,
};
use dirsync_repl::agreement::{ATTR_LABELED_URI, OC_REPL_AGREEMENT};
use dirsync_repl::config::{FirstCycleMode, ReplConfig};
use dirsync_repl::conflict::SupplierAttr;
use dirsync_repl::context::{Collaborators, ServerContext};
use dirsync_repl::rpc::{MemoryPartners, ReplChange};

pub const DOMAIN: &str = "dc=example,dc=com";
pub const SITE: &str = "Main";
pub const SELF_HOST: &str = "a.example";
pub const PEERS: [&str; 2] = ["b.example", "c.example"];

pub fn server_dn(host: &str) -> String {
    format!(
        "cn={},cn=Servers,cn={},cn=Sites,cn=Configuration,{}",
        host, SITE, DOMAIN
    )
}

pub fn agreement_dn(peer: &str) -> String {
    format!("cn={},cn=Replication Agreements,{}", peer, server_dn(SELF_HOST))
}

pub fn invocation(server_id: u32) -> InvocationId {
    InvocationId::new(format!("{:08x}-0000-0000-0000-000000000000", server_id))
}

pub fn meta(version: u64, invo: &InvocationId, orig_usn: Usn) -> AttrMetadata {
    AttrMetadata {
        local_usn: 0,
        version,
        invocation_id: invo.clone(),
        orig_time: "20240101000000.000".to_string(),
        orig_usn,
    }
}

/// A promoted node `a.example` in a three-server site with one agreement per peer.
pub struct ClusterNode {
    pub backend: Arc<MemoryBackend>,
    pub partners: MemoryPartners,
    pub ctx: Arc<ServerContext>,
}

pub fn config() -> ReplConfig {
    let mut config = ReplConfig {
        system_domain_dn: Some(DOMAIN.to_string()),
        repl_interval_secs: 3600,
        agreement_pause_ms: 0,
        first_cycle_mode: FirstCycleMode::None,
        ..ReplConfig::default()
    };
    config.server.fqdn = SELF_HOST.to_string();
    config.server.site = SITE.to_string();
    config.server.server_id = 1;
    config
}

/// Seeds the Raft context, the site's server objects and the
/// agreement container. Agreements are added with [`add_agreement`].
pub fn seed_directory() -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new());
    backend.add_entry(Entry::new(RAFT_CONTEXT_DN)).unwrap();
    backend.add_entry(Entry::new(RAFT_PERSIST_STATE_DN)).unwrap();
    for dn in [
        format!("cn=Configuration,{}", DOMAIN),
        format!("cn=Sites,cn=Configuration,{}", DOMAIN),
        format!("cn={},cn=Sites,cn=Configuration,{}", SITE, DOMAIN),
        format!("cn=Servers,cn={},cn=Sites,cn=Configuration,{}", SITE, DOMAIN),
    ] {
        backend.add_entry(Entry::new(dn)).unwrap();
    }
    for (i, host) in std::iter::once(SELF_HOST).chain(PEERS).enumerate() {
        let server_id = i as u32 + 1;
        backend
            .add_entry(
                Entry::new(server_dn(host))
                    .with_attr("objectClass", OC_DIR_SERVER)
                    .with_attr("cn", host)
                    .with_attr("invocationId", invocation(server_id).as_str())
                    .with_attr("serverId", &server_id.to_string()),
            )
            .unwrap();
    }
    backend
        .add_entry(Entry::new(format!(
            "cn=Replication Agreements,{}",
            server_dn(SELF_HOST)
        )))
        .unwrap();
    backend
}

pub fn add_agreement(backend: &MemoryBackend, peer: &str, stored_usn: Option<&str>) {
    let mut entry = Entry::new(agreement_dn(peer))
        .with_attr("objectClass", OC_REPL_AGREEMENT)
        .with_attr(ATTR_LABELED_URI, &format!("ldap://{}:389", peer));
    if let Some(usn) = stored_usn {
        entry = entry.with_attr("lastLocalUsnProcessed", usn);
    }
    backend.add_entry(entry).unwrap();
}

/// Builds and initializes the context over an already seeded backend.
pub fn start_node(backend: Arc<MemoryBackend>, config: ReplConfig) -> ClusterNode {
    let partners = MemoryPartners::new();
    let ctx = Arc::new(ServerContext::new(
        config,
        Collaborators {
            backend: backend.clone(),
            directory: backend.clone(),
            schema: Arc::new(StaticSchema::new([ATTR_RAFT_TERM])),
            nodes: Arc::new(LoopbackConnector::new()),
            partners: Arc::new(partners.clone()),
        },
    ));
    ctx.init().unwrap();
    ClusterNode {
        backend,
        partners,
        ctx,
    }
}

/// Publishes `count` adds under the domain from `peer`, starting at its USN `first`.
pub fn publish_adds(node: &ClusterNode, peer: &str, server_id: u32, first: Usn, count: u64) {
    let invo = invocation(server_id);
    for usn in first..first + count {
        let dn = format!("cn={}-{},{}", peer, usn, DOMAIN);
        node.partners
            .publish(
                peer,
                ReplChange::add(&dn, usn, &invo, usn)
                    .with_attr(SupplierAttr::new("cn", &[&format!("{}-{}", peer, usn)], meta(1, &invo, usn))),
            )
            .unwrap();
    }
}

pub async fn wait_cycles(ctx: &ServerContext, n: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while ctx.cycle_count() < n {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}
