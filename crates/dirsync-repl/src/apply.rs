//! Applies replicated changes to the local backend.
//!
//! Every applied change runs under a fresh local USN registered with the
//! tracker, stamped into `uSNChanged` and into the local-USN field of the
//! metadata written with it.

use std::sync::Arc;

use dirsync_meta::backend::Backend;
use dirsync_meta::types::{
    Entry, EntryId, MetaError, Usn, ValueOpcode, ATTR_USN_CHANGED, ATTR_USN_CREATED,
};
use dirsync_meta::usn::UsnTracker;
use tracing::{debug, trace};

use crate::conflict::{ConflictReport, ConflictResolver, SupplierAttr};
use crate::error::ReplError;
use crate::rpc::{ChangeKind, ReplChange, ValueChange};

/// What happened to one replicated change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A new entry was created
    Added,
    /// An existing entry was updated after conflict resolution
    Modified(ConflictReport),
    /// The entry was removed
    Deleted,
    /// Delete of an entry that is already gone
    AlreadyAbsent,
}

impl ApplyOutcome {
    /// Conflict report, if resolution ran.
    pub fn report(&self) -> Option<&ConflictReport> {
        match self {
            ApplyOutcome::Modified(report) => Some(report),
            _ => None,
        }
    }
}

/// Applies changes fetched from partners.
pub struct ChangeApplier {
    backend: Arc<dyn Backend>,
    tracker: Arc<UsnTracker>,
    resolver: ConflictResolver,
}

impl ChangeApplier {
    /// Creates an applier over `backend`.
    pub fn new(backend: Arc<dyn Backend>, tracker: Arc<UsnTracker>) -> Self {
        let resolver = ConflictResolver::new(backend.clone());
        Self {
            backend,
            tracker,
            resolver,
        }
    }

    /// Applies one change from `partner`.
    ///
    /// A change whose target (or, for an add, its parent) is missing fails
    /// with `ReplError::MissingParent`; any other backend error propagates and
    /// only this change is aborted.
    pub fn apply(&self, partner: &str, change: &ReplChange) -> Result<ApplyOutcome, ReplError> {
        trace!(partner = %partner, dn = %change.dn, usn = change.usn, kind = ?change.kind, "applying change");
        let existing = self.backend.entry_by_dn(&change.dn)?;
        match (change.kind, existing) {
            (ChangeKind::Add, None) => self.apply_add(change),
            (ChangeKind::Add, Some(entry)) | (ChangeKind::Modify, Some(entry)) => {
                self.apply_modify(partner, entry_id(&entry)?, change)
            }
            (ChangeKind::Modify, None) => Err(ReplError::MissingParent {
                dn: change.dn.clone(),
            }),
            (ChangeKind::Delete, Some(entry)) => {
                let guard = self.tracker.begin(self.backend.as_ref())?;
                self.backend.delete_entry(entry_id(&entry)?)?;
                guard.release()?;
                Ok(ApplyOutcome::Deleted)
            }
            (ChangeKind::Delete, None) => Ok(ApplyOutcome::AlreadyAbsent),
        }
    }

    fn apply_add(&self, change: &ReplChange) -> Result<ApplyOutcome, ReplError> {
        let guard = self.tracker.begin(self.backend.as_ref())?;
        let local = guard.usn();

        let mut entry = Entry::new(change.dn.clone());
        for attr in &change.attrs {
            if !is_usn_attr(&attr.name) && !attr.values.is_empty() {
                entry.replace(&attr.name, attr.values.clone());
            }
        }
        entry.replace(ATTR_USN_CHANGED, vec![usn_value(local)]);
        entry.replace(ATTR_USN_CREATED, vec![usn_value(local)]);

        let id = match self.backend.add_entry(entry) {
            Ok(id) => id,
            Err(MetaError::EntryNotFound(parent)) => {
                debug!(dn = %change.dn, parent = %parent, "parent missing for replicated add");
                return Err(ReplError::MissingParent {
                    dn: change.dn.clone(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.write_metadata(id, local, &change.attrs)?;
        for vc in &change.value_changes {
            self.store_value_metadata(id, local, vc)?;
        }
        guard.release()?;
        Ok(ApplyOutcome::Added)
    }

    fn apply_modify(
        &self,
        partner: &str,
        id: EntryId,
        change: &ReplChange,
    ) -> Result<ApplyOutcome, ReplError> {
        let mut attrs = change.attrs.clone();
        let report = self
            .resolver
            .resolve_attributes(partner, id, &change.dn, &mut attrs)?;

        let guard = self.tracker.begin(self.backend.as_ref())?;
        let local = guard.usn();

        for attr in attrs.iter().filter(|a| !a.is_discarded() && !is_usn_attr(&a.name)) {
            self.backend
                .replace_attribute(id, &attr.name, attr.values.clone())?;
        }
        self.write_metadata(id, local, &attrs)?;

        for vc in &change.value_changes {
            if self
                .resolver
                .value_change_in_scope(id, &vc.attr_meta, &vc.value)?
            {
                self.apply_value_change(id, local, vc)?;
            }
        }

        self.backend
            .replace_attribute(id, ATTR_USN_CHANGED, vec![usn_value(local)])?;
        guard.release()?;
        Ok(ApplyOutcome::Modified(report))
    }

    fn write_metadata(&self, id: EntryId, local: Usn, attrs: &[SupplierAttr]) -> Result<(), ReplError> {
        for attr in attrs {
            if let Some(meta) = &attr.meta {
                let mut meta = meta.clone();
                meta.local_usn = local;
                self.backend.set_attr_metadata(id, &attr.name, meta)?;
            }
        }
        Ok(())
    }

    fn apply_value_change(&self, id: EntryId, local: Usn, vc: &ValueChange) -> Result<(), ReplError> {
        let entry = self.backend.entry_by_id(id)?;
        let mut values = entry
            .values(&vc.value.attr_type)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        match vc.value.opcode {
            ValueOpcode::Add => {
                if !values.contains(&vc.value.value) {
                    values.push(vc.value.value.clone());
                }
            }
            ValueOpcode::Delete => values.retain(|v| v != &vc.value.value),
        }
        self.backend
            .replace_attribute(id, &vc.value.attr_type, values)?;
        self.store_value_metadata(id, local, vc)
    }

    fn store_value_metadata(&self, id: EntryId, local: Usn, vc: &ValueChange) -> Result<(), ReplError> {
        let mut record = vc.value.clone();
        record.local_usn = local;
        self.backend.add_value_metadata(id, record)?;
        Ok(())
    }
}

fn entry_id(entry: &Entry) -> Result<EntryId, ReplError> {
    entry
        .id
        .ok_or_else(|| MetaError::InvalidState(format!("entry {} has no id", entry.dn)).into())
}

fn is_usn_attr(name: &str) -> bool {
    name.eq_ignore_ascii_case(ATTR_USN_CHANGED) || name.eq_ignore_ascii_case(ATTR_USN_CREATED)
}

fn usn_value(usn: Usn) -> Vec<u8> {
    usn.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_meta::backend::MemoryBackend;
    use dirsync_meta::types::{AttrMetadata, InvocationId, ValueMetadata};

    const SUPPLIER: &str = "22222222-0000-0000-0000-000000000000";

    fn meta(version: u64, invo: &str) -> AttrMetadata {
        AttrMetadata {
            local_usn: 0,
            version,
            invocation_id: InvocationId::new(invo),
            orig_time: "20240101000000.000".to_string(),
            orig_usn: 7,
        }
    }

    fn setup() -> (Arc<MemoryBackend>, Arc<UsnTracker>, ChangeApplier) {
        let backend = Arc::new(MemoryBackend::new());
        let tracker = Arc::new(UsnTracker::new());
        tracker.initialize(backend.as_ref()).unwrap();
        let applier = ChangeApplier::new(backend.clone(), tracker.clone());
        (backend, tracker, applier)
    }

    fn add_change(dn: &str, usn: Usn) -> ReplChange {
        ReplChange::add(dn, usn, &InvocationId::new(SUPPLIER), usn)
            .with_attr(SupplierAttr::new("cn", &["obj"], meta(1, SUPPLIER)))
            .with_attr(SupplierAttr::new("description", &["first"], meta(1, SUPPLIER)))
    }

    #[test]
    fn test_add_stamps_local_usn() {
        let (backend, tracker, applier) = setup();
        let outcome = applier.apply("b", &add_change("cn=obj,dc=example", 3)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Added);

        let entry = backend.entry_by_dn("cn=obj,dc=example").unwrap().unwrap();
        let local: Usn = entry.first_str(ATTR_USN_CHANGED).unwrap().parse().unwrap();
        assert_eq!(entry.first_str("description"), Some("first"));
        let stored = backend
            .attr_metadata(entry.id.unwrap(), "description")
            .unwrap();
        assert_eq!(stored.local_usn, local);
        assert_eq!(stored.version, 1);
        assert_eq!(tracker.pending().unwrap(), 0);
        assert_eq!(tracker.highest_committed().unwrap(), local);
    }

    #[test]
    fn test_add_missing_parent() {
        let (_backend, tracker, applier) = setup();
        let result = applier.apply("b", &add_change("cn=child,cn=parent,dc=example", 4));
        assert!(matches!(result, Err(ReplError::MissingParent { .. })));
        assert_eq!(tracker.pending().unwrap(), 0);
    }

    #[test]
    fn test_modify_supplier_wins() {
        let (backend, _tracker, applier) = setup();
        applier.apply("b", &add_change("cn=obj,dc=example", 1)).unwrap();
        let change = ReplChange::modify("cn=obj,dc=example", 2, &InvocationId::new(SUPPLIER), 8)
            .with_attr(SupplierAttr::new("description", &["second"], meta(2, SUPPLIER)));
        let outcome = applier.apply("b", &change).unwrap();
        assert_eq!(outcome.report().unwrap().conflicts(), 0);
        let entry = backend.entry_by_dn("cn=obj,dc=example").unwrap().unwrap();
        assert_eq!(entry.first_str("description"), Some("second"));
    }

    #[test]
    fn test_modify_consumer_wins_keeps_local_value() {
        let (backend, _tracker, applier) = setup();
        applier.apply("b", &add_change("cn=obj,dc=example", 1)).unwrap();
        let id = backend
            .entry_by_dn("cn=obj,dc=example")
            .unwrap()
            .unwrap()
            .id
            .unwrap();
        backend
            .set_attr_metadata(id, "description", meta(5, "ffffffff-0000-0000-0000-000000000000"))
            .unwrap();

        let change = ReplChange::modify("cn=obj,dc=example", 2, &InvocationId::new(SUPPLIER), 8)
            .with_attr(SupplierAttr::new("description", &["remote"], meta(5, SUPPLIER)));
        let outcome = applier.apply("b", &change).unwrap();
        assert_eq!(outcome.report().unwrap().conflicts(), 1);
        let entry = backend.entry_by_dn("cn=obj,dc=example").unwrap().unwrap();
        assert_eq!(entry.first_str("description"), Some("first"));
    }

    #[test]
    fn test_modify_missing_entry() {
        let (_backend, _tracker, applier) = setup();
        let change = ReplChange::modify("cn=gone,dc=example", 2, &InvocationId::new(SUPPLIER), 8);
        assert!(matches!(
            applier.apply("b", &change),
            Err(ReplError::MissingParent { .. })
        ));
    }

    #[test]
    fn test_value_change_applies_in_generation() {
        let (backend, _tracker, applier) = setup();
        let group = ReplChange::add("cn=grp,dc=example", 1, &InvocationId::new(SUPPLIER), 1)
            .with_attr(SupplierAttr::new("member", &["cn=u1"], meta(3, SUPPLIER)));
        applier.apply("b", &group).unwrap();

        let add_u2 = ValueMetadata {
            attr_type: "member".to_string(),
            local_usn: 0,
            version: 3,
            invocation_id: InvocationId::new(SUPPLIER),
            val_change_invocation_id: InvocationId::new(SUPPLIER),
            val_change_time: "20240301000000.000".to_string(),
            val_change_usn: 9,
            opcode: ValueOpcode::Add,
            value: b"cn=u2".to_vec(),
        };
        let change = ReplChange::modify("cn=grp,dc=example", 2, &InvocationId::new(SUPPLIER), 9)
            .with_value_change(meta(3, SUPPLIER), add_u2.clone());
        applier.apply("b", &change).unwrap();

        let entry = backend.entry_by_dn("cn=grp,dc=example").unwrap().unwrap();
        assert_eq!(
            entry.values("member").unwrap(),
            &[b"cn=u1".to_vec(), b"cn=u2".to_vec()]
        );

        let remove_u1 = ValueMetadata {
            opcode: ValueOpcode::Delete,
            value: b"cn=u1".to_vec(),
            ..add_u2
        };
        let change = ReplChange::modify("cn=grp,dc=example", 3, &InvocationId::new(SUPPLIER), 10)
            .with_value_change(meta(4, SUPPLIER), remove_u1);
        applier.apply("b", &change).unwrap();
        let entry = backend.entry_by_dn("cn=grp,dc=example").unwrap().unwrap();
        assert_eq!(entry.values("member").unwrap().len(), 2);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (backend, _tracker, applier) = setup();
        applier.apply("b", &add_change("cn=obj,dc=example", 1)).unwrap();
        let delete = ReplChange::delete("cn=obj,dc=example", 5, &InvocationId::new(SUPPLIER), 12);
        assert_eq!(applier.apply("b", &delete).unwrap(), ApplyOutcome::Deleted);
        assert_eq!(applier.apply("b", &delete).unwrap(), ApplyOutcome::AlreadyAbsent);
        assert_eq!(backend.entry_count(), 0);
    }
}
