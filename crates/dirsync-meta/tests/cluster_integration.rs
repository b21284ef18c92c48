//! Integration tests for cluster membership and Raft bookkeeping.
//!
//! These tests drive the cluster cache, USN tracker and Raft state together
//! against a shared in-memory directory.

mod common;

use std::sync::Arc;

use common::{add_server, seed_directory, server_dn, start_node, SITE};
use dirsync_meta::backend::{Backend, MemoryBackend};
use dirsync_meta::raft::{RaftRole, VoteOutcome};
use dirsync_meta::types::Term;
use dirsync_meta::usn::UsnTracker;

#[test]
fn test_three_node_cluster_bootstrap() {
    let backend = seed_directory(&["a.example", "b.example", "c.example"]);
    let node = start_node(backend, "a.example");

    assert_eq!(node.raft.cluster_size().unwrap(), 3);
    let mut members = node.raft.members().unwrap();
    members.sort();
    assert_eq!(members, vec!["a.example", "b.example", "c.example"]);

    node.raft.begin_election().unwrap();
    assert_eq!(node.raft.evaluate_vote_result(3).unwrap(), VoteOutcome::Won);
    let mut followers = node.raft.followers().unwrap();
    followers.sort();
    assert_eq!(followers, vec!["b.example", "c.example"]);
}

#[test]
fn test_deleted_node_leaves_map_and_slot() {
    let backend = seed_directory(&["a.example", "b.example", "c.example", "d.example"]);
    let node = start_node(backend.clone(), "a.example");
    assert_eq!(node.raft.cluster_size().unwrap(), 4);

    let d = backend.entry_by_dn(&server_dn("d.example")).unwrap().unwrap();
    backend.delete_entry(d.id.unwrap()).unwrap();
    node.raft.on_server_deleted(&d).unwrap();
    node.raft.refresh().unwrap();

    let guard = node.cluster.read().unwrap();
    assert!(guard.node("d.example").is_none());
    let slots = guard.site_slots(SITE).unwrap();
    assert_eq!(slots.len(), 4);
    assert_eq!(slots[3], None);
    drop(guard);
    assert_eq!(node.raft.cluster_size().unwrap(), 3);
}

#[test]
fn test_new_server_joins_on_reload() {
    let backend = seed_directory(&["a.example", "b.example"]);
    let node = start_node(backend.clone(), "a.example");
    assert_eq!(node.raft.cluster_size().unwrap(), 2);

    add_server(&backend, "c.example", 3);
    node.cluster.request_reload().unwrap();
    node.raft.refresh().unwrap();

    assert_eq!(node.raft.cluster_size().unwrap(), 3);
    assert_eq!(
        node.cluster.read().unwrap().node("c.example").unwrap().server_id,
        3
    );
}

#[test]
fn test_term_survives_restart() {
    let backend = seed_directory(&["a.example", "b.example", "c.example"]);
    let node = start_node(backend.clone(), "a.example");
    node.raft.observe_term(Term::new(12), "b.example").unwrap();
    assert_eq!(node.raft.get_role().unwrap(), RaftRole::Follower);

    let image = backend.to_bytes().unwrap();
    drop(node);
    let restarted = start_node(Arc::new(MemoryBackend::from_bytes(&image).unwrap()), "a.example");
    assert!(restarted.raft.term().unwrap() >= Term::new(12));
    assert_eq!(restarted.raft.get_leader().unwrap(), None);
}

#[test]
fn test_usn_boundary_with_concurrent_writers() {
    let backend = Arc::new(MemoryBackend::new());
    let tracker = Arc::new(UsnTracker::new());
    tracker.initialize(backend.as_ref()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let backend = backend.clone();
            let tracker = tracker.clone();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let guard = tracker.begin(backend.as_ref()).unwrap();
                    assert!(tracker.highest_committed().unwrap() < guard.usn());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(tracker.pending().unwrap(), 0);
    assert_eq!(tracker.highest_committed().unwrap(), 101);
}
