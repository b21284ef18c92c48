//! Outstanding-USN tracking and the safe replication-read boundary.
//!
//! Every local write acquires a USN and registers it as outstanding until it
//! commits or aborts. Replication readers may only serve changes below the
//! least outstanding USN.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::{debug, error, warn};

use crate::backend::Backend;
use crate::types::{MetaError, Usn};

/// Initial capacity of the outstanding set; growth beyond 4x this is logged.
pub const OUTSTANDING_USN_INITIAL_CAPACITY: usize = 32;

#[derive(Debug, Default)]
struct UsnInner {
    /// Outstanding USN -> number of registrations.
    outstanding: BTreeMap<Usn, u32>,
    pending: usize,
    capacity: usize,
    max_used_main_usn: Usn,
    /// Everything below this is committed when nothing is outstanding.
    boundary: Usn,
    max_originating_usn: Usn,
    first_next_usn: Usn,
}

/// Tracks in-flight local write USNs.
#[derive(Debug)]
pub struct UsnTracker {
    inner: Mutex<UsnInner>,
}

impl UsnTracker {
    /// Creates an empty tracker with a zero boundary.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(UsnInner {
                capacity: OUTSTANDING_USN_INITIAL_CAPACITY,
                ..UsnInner::default()
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, UsnInner>, MetaError> {
        self.inner
            .lock()
            .map_err(|e| MetaError::InvalidState(format!("usn list poisoned: {}", e)))
    }

    /// Acquires and immediately releases one USN so the boundary is valid
    /// before the first local write.
    pub fn initialize(&self, backend: &dyn Backend) -> Result<Usn, MetaError> {
        let usn = self.acquire(backend)?;
        self.remove_outstanding(usn)?;
        self.lock()?.first_next_usn = usn;
        debug!(usn = usn, "usn list initialized");
        Ok(usn)
    }

    /// Assigns the next USN from the backend and registers it as outstanding
    /// under one lock.
    pub fn acquire(&self, backend: &dyn Backend) -> Result<Usn, MetaError> {
        let mut inner = self.lock()?;
        let usn = backend.next_usn()?;
        Self::add_locked(&mut inner, usn);
        Ok(usn)
    }

    /// Acquires a USN wrapped in a guard that unregisters it on drop.
    pub fn begin(&self, backend: &dyn Backend) -> Result<UsnGuard<'_>, MetaError> {
        let usn = self.acquire(backend)?;
        Ok(UsnGuard {
            tracker: self,
            usn,
            released: false,
        })
    }

    /// Registers a USN as outstanding. USN 0 marks a transaction without a
    /// write and is not tracked.
    pub fn add_outstanding(&self, usn: Usn) -> Result<(), MetaError> {
        if usn == 0 {
            return Ok(());
        }
        let mut inner = self.lock()?;
        Self::add_locked(&mut inner, usn);
        Ok(())
    }

    fn add_locked(inner: &mut UsnInner, usn: Usn) {
        *inner.outstanding.entry(usn).or_insert(0) += 1;
        inner.pending += 1;
        if inner.pending > inner.capacity {
            inner.capacity *= 2;
            if inner.capacity > OUTSTANDING_USN_INITIAL_CAPACITY * 4 {
                error!(
                    capacity = inner.capacity,
                    "outstanding usn list grew beyond 4x its initial size"
                );
            }
        }
        if usn > inner.max_used_main_usn {
            inner.max_used_main_usn = usn;
        }
    }

    /// Unregisters a USN. When it was the only outstanding one the boundary
    /// advances past every USN used so far.
    ///
    /// A USN that is not outstanding is logged and ignored.
    pub fn remove_outstanding(&self, usn: Usn) -> Result<(), MetaError> {
        if usn == 0 {
            return Ok(());
        }
        let mut inner = self.lock()?;
        let pending_before = inner.pending;
        let found = match inner.outstanding.get_mut(&usn) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    inner.outstanding.remove(&usn);
                }
                true
            }
            None => false,
        };
        if !found {
            warn!(usn = usn, "usn not found in outstanding list");
            return Ok(());
        }
        inner.pending -= 1;
        if pending_before == 1 {
            inner.boundary = inner.max_used_main_usn.max(inner.boundary) + 1;
        }
        Ok(())
    }

    /// Least outstanding USN. With nothing outstanding, returns the boundary
    /// unless `pending_only` is set, in which case there is no answer.
    pub fn least_outstanding(&self, pending_only: bool) -> Result<Option<Usn>, MetaError> {
        let inner = self.lock()?;
        Ok(match inner.outstanding.keys().next() {
            Some(&min) => Some(min),
            None if pending_only => None,
            None => Some(inner.boundary),
        })
    }

    /// Highest USN that is known committed.
    pub fn highest_committed(&self) -> Result<Usn, MetaError> {
        let inner = self.lock()?;
        Ok(match inner.outstanding.keys().next() {
            Some(&min) => min.saturating_sub(1),
            None => inner.boundary.saturating_sub(1),
        })
    }

    /// Raises the boundary directly; used to seed it at startup. Never lowers it.
    pub fn set_max_outstanding_usn(&self, usn: Usn) -> Result<(), MetaError> {
        let mut inner = self.lock()?;
        if usn > inner.boundary {
            inner.boundary = usn;
        }
        debug!(usn = inner.boundary, "set max outstanding usn");
        Ok(())
    }

    /// Current boundary value.
    pub fn boundary(&self) -> Result<Usn, MetaError> {
        Ok(self.lock()?.boundary)
    }

    /// Number of outstanding registrations.
    pub fn pending(&self) -> Result<usize, MetaError> {
        Ok(self.lock()?.pending)
    }

    /// USN consumed by [`UsnTracker::initialize`].
    pub fn first_next_usn(&self) -> Result<Usn, MetaError> {
        Ok(self.lock()?.first_next_usn)
    }

    /// Highest USN originated by this node.
    pub fn max_originating_usn(&self) -> Result<Usn, MetaError> {
        Ok(self.lock()?.max_originating_usn)
    }

    /// Records an originating USN; only ever increases.
    pub fn set_max_originating_usn(&self, usn: Usn) -> Result<(), MetaError> {
        let mut inner = self.lock()?;
        if usn > inner.max_originating_usn {
            inner.max_originating_usn = usn;
        }
        Ok(())
    }
}

impl Default for UsnTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// A write transaction's USN registration. Dropping the guard unregisters it.
#[derive(Debug)]
pub struct UsnGuard<'a> {
    tracker: &'a UsnTracker,
    usn: Usn,
    released: bool,
}

impl<'a> UsnGuard<'a> {
    /// USN held by this transaction.
    pub fn usn(&self) -> Usn {
        self.usn
    }

    /// Unregisters now and reports any lock failure.
    pub fn release(mut self) -> Result<(), MetaError> {
        self.released = true;
        self.tracker.remove_outstanding(self.usn)
    }
}

impl Drop for UsnGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.tracker.remove_outstanding(self.usn) {
                error!(usn = self.usn, error = %e, "failed to release usn");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use proptest::prelude::*;

    mod boundary {
        use super::*;

        #[test]
        fn test_empty_tracker() {
            let t = UsnTracker::new();
            assert_eq!(t.least_outstanding(false).unwrap(), Some(0));
            assert_eq!(t.least_outstanding(true).unwrap(), None);
            assert_eq!(t.highest_committed().unwrap(), 0);
        }

        #[test]
        fn test_initialize_makes_boundary_valid() {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            let first = t.initialize(&be).unwrap();
            assert_eq!(first, 1);
            assert_eq!(t.first_next_usn().unwrap(), 1);
            assert_eq!(t.boundary().unwrap(), 2);
            assert_eq!(t.highest_committed().unwrap(), 1);
        }

        #[test]
        fn test_remove_last_advances_boundary() {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            let a = t.acquire(&be).unwrap();
            let b = t.acquire(&be).unwrap();
            assert_eq!(t.least_outstanding(false).unwrap(), Some(a));
            t.remove_outstanding(a).unwrap();
            assert_eq!(t.least_outstanding(false).unwrap(), Some(b));
            assert_eq!(t.highest_committed().unwrap(), b - 1);
            t.remove_outstanding(b).unwrap();
            assert_eq!(t.boundary().unwrap(), b + 1);
            assert_eq!(t.highest_committed().unwrap(), b);
        }

        #[test]
        fn test_out_of_order_commit_holds_boundary() {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            let a = t.acquire(&be).unwrap();
            let b = t.acquire(&be).unwrap();
            t.remove_outstanding(b).unwrap();
            assert_eq!(t.highest_committed().unwrap(), a - 1);
            assert_eq!(t.least_outstanding(true).unwrap(), Some(a));
        }

        #[test]
        fn test_remove_unknown_is_not_fatal() {
            let t = UsnTracker::new();
            t.add_outstanding(5).unwrap();
            t.remove_outstanding(9).unwrap();
            assert_eq!(t.pending().unwrap(), 1);
            assert_eq!(t.boundary().unwrap(), 0);
        }

        #[test]
        fn test_zero_usn_not_tracked() {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            t.initialize(&be).unwrap();
            t.add_outstanding(0).unwrap();
            assert_eq!(t.pending().unwrap(), 0);
            assert_eq!(t.least_outstanding(true).unwrap(), None);
            assert_eq!(t.highest_committed().unwrap(), 1);

            let a = t.acquire(&be).unwrap();
            t.remove_outstanding(0).unwrap();
            assert_eq!(t.least_outstanding(true).unwrap(), Some(a));
            t.remove_outstanding(a).unwrap();
            assert_eq!(t.boundary().unwrap(), a + 1);
        }

        #[test]
        fn test_set_max_outstanding_never_lowers() {
            let t = UsnTracker::new();
            t.set_max_outstanding_usn(10).unwrap();
            t.set_max_outstanding_usn(4).unwrap();
            assert_eq!(t.boundary().unwrap(), 10);
            assert_eq!(t.highest_committed().unwrap(), 9);
        }

        #[test]
        fn test_max_originating_usn_monotonic() {
            let t = UsnTracker::new();
            t.set_max_originating_usn(7).unwrap();
            t.set_max_originating_usn(3).unwrap();
            assert_eq!(t.max_originating_usn().unwrap(), 7);
        }

        #[test]
        fn test_growth_beyond_initial_capacity() {
            let t = UsnTracker::new();
            for usn in 1..=200 {
                t.add_outstanding(usn).unwrap();
            }
            assert_eq!(t.pending().unwrap(), 200);
            assert_eq!(t.least_outstanding(true).unwrap(), Some(1));
        }
    }

    mod guard {
        use super::*;

        #[test]
        fn test_guard_releases_on_drop() {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            {
                let g = t.begin(&be).unwrap();
                assert_eq!(t.least_outstanding(true).unwrap(), Some(g.usn()));
            }
            assert_eq!(t.pending().unwrap(), 0);
            assert_eq!(t.boundary().unwrap(), 2);
        }

        #[test]
        fn test_guard_explicit_release() {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            let g = t.begin(&be).unwrap();
            g.release().unwrap();
            assert_eq!(t.pending().unwrap(), 0);
        }

        #[test]
        fn test_concurrent_writers() {
            let be = std::sync::Arc::new(MemoryBackend::new());
            let t = std::sync::Arc::new(UsnTracker::new());
            let mut handles = Vec::new();
            for _ in 0..8 {
                let be = be.clone();
                let t = t.clone();
                handles.push(std::thread::spawn(move || {
                    for _ in 0..50 {
                        let g = t.begin(be.as_ref()).unwrap();
                        let least = t.least_outstanding(true).unwrap().unwrap();
                        assert!(least <= g.usn());
                    }
                }));
            }
            for h in handles {
                h.join().unwrap();
            }
            assert_eq!(t.pending().unwrap(), 0);
            assert_eq!(t.boundary().unwrap(), 401);
        }
    }

    #[derive(Debug, Clone)]
    enum Op {
        Acquire,
        Remove(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Acquire), (0usize..16).prop_map(Op::Remove)]
    }

    proptest! {
        #[test]
        fn prop_least_outstanding_is_safe(ops in proptest::collection::vec(op_strategy(), 1..64)) {
            let be = MemoryBackend::new();
            let t = UsnTracker::new();
            let mut live: Vec<Usn> = Vec::new();
            let mut removed: Vec<Usn> = Vec::new();
            let mut last_boundary = 0;
            for op in ops {
                match op {
                    Op::Acquire => live.push(t.acquire(&be).unwrap()),
                    Op::Remove(i) if !live.is_empty() => {
                        let usn = live.remove(i % live.len());
                        t.remove_outstanding(usn).unwrap();
                        removed.push(usn);
                    }
                    Op::Remove(_) => {}
                }
                if let Some(least) = t.least_outstanding(true).unwrap() {
                    prop_assert!(!removed.contains(&least));
                    prop_assert!(live.iter().all(|u| least <= *u));
                } else {
                    prop_assert!(live.is_empty());
                    let boundary = t.boundary().unwrap();
                    prop_assert_eq!(t.highest_committed().unwrap(), boundary.saturating_sub(1));
                }
                let boundary = t.boundary().unwrap();
                prop_assert!(boundary >= last_boundary);
                last_boundary = boundary;
            }
        }
    }
}
