//! Conflict resolution for inbound replicated changes.
//!
//! Attribute level: higher version wins; on equal versions the higher
//! invocation id (fixed-length comparison) wins. A supplier attribute that
//! loses is dropped from the change, except `uSNChanged` whose metadata is
//! always carried so local USN ordering advances.
//!
//! Value level (multi-valued attributes): only evaluated when supplier and
//! consumer share the same attribute generation.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

use dirsync_meta::backend::Backend;
use dirsync_meta::types::{
    AttrMetadata, EntryId, MetaError, ValueMetadata, ATTR_OBJECT_GUID, ATTR_USN_CHANGED,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// An attribute carried by a replicated change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupplierAttr {
    /// Attribute name
    pub name: String,
    /// Proposed values
    pub values: Vec<Vec<u8>>,
    /// Supplier metadata; `None` once the attribute lost a conflict
    pub meta: Option<AttrMetadata>,
}

impl SupplierAttr {
    /// Builds an attribute with string values.
    pub fn new(name: &str, values: &[&str], meta: AttrMetadata) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
            meta: Some(meta),
        }
    }

    /// True once the attribute was discarded by conflict resolution.
    pub fn is_discarded(&self) -> bool {
        self.meta.is_none()
    }
}

/// Result of comparing one supplier attribute with local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrOutcome {
    /// Supplier change is applied
    SupplierWins,
    /// No local metadata yet; supplier applies by default
    NewAttribute,
    /// Local value is kept
    ConsumerWins {
        /// Local value already equals the supplier value
        benign: bool,
    },
    /// Attribute is never evaluated
    Skipped,
}

/// Per-attribute record of one resolution pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrResolution {
    /// Attribute name
    pub attr: String,
    /// Outcome
    pub outcome: AttrOutcome,
}

/// Summary of a resolution pass over one replicated change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictReport {
    /// Per-attribute outcomes in input order
    pub resolutions: Vec<AttrResolution>,
}

impl ConflictReport {
    /// Attributes the consumer kept (benign or not).
    pub fn conflicts(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|r| matches!(r.outcome, AttrOutcome::ConsumerWins { .. }))
            .count()
    }

    /// Conflicts whose values already matched locally.
    pub fn benign_conflicts(&self) -> usize {
        self.resolutions
            .iter()
            .filter(|r| r.outcome == AttrOutcome::ConsumerWins { benign: true })
            .count()
    }
}

/// Decides whether supplier metadata overrides consumer metadata.
pub fn supplier_wins(supplier: &AttrMetadata, consumer: &AttrMetadata) -> bool {
    match supplier.version.cmp(&consumer.version) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => supplier.invocation_id > consumer.invocation_id,
    }
}

fn value_set(values: &[Vec<u8>]) -> BTreeSet<&[u8]> {
    values.iter().map(|v| v.as_slice()).collect()
}

/// Resolves attribute and value conflicts against a backend.
pub struct ConflictResolver {
    backend: Arc<dyn Backend>,
}

impl ConflictResolver {
    /// Creates a resolver over `backend`.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Resolves every attribute of a replicated modify against `entry_id`.
    ///
    /// Losing attributes have their values cleared and metadata dropped in
    /// place. Missing local metadata means the supplier wins. Any other
    /// backend error aborts the whole change.
    pub fn resolve_attributes(
        &self,
        partner: &str,
        entry_id: EntryId,
        dn: &str,
        attrs: &mut [SupplierAttr],
    ) -> Result<ConflictReport, MetaError> {
        let mut report = ConflictReport::default();
        for attr in attrs.iter_mut() {
            let outcome = self.resolve_one(partner, entry_id, dn, attr)?;
            report.resolutions.push(AttrResolution {
                attr: attr.name.clone(),
                outcome,
            });
        }
        Ok(report)
    }

    fn resolve_one(
        &self,
        partner: &str,
        entry_id: EntryId,
        dn: &str,
        attr: &mut SupplierAttr,
    ) -> Result<AttrOutcome, MetaError> {
        if attr.name.eq_ignore_ascii_case(ATTR_OBJECT_GUID) {
            return Ok(AttrOutcome::Skipped);
        }
        let supplier = match &attr.meta {
            Some(meta) => meta.clone(),
            None => return Ok(AttrOutcome::Skipped),
        };
        let consumer = match self.backend.attr_metadata(entry_id, &attr.name) {
            Ok(meta) => meta,
            Err(MetaError::AttrMetadataNotFound { .. }) => return Ok(AttrOutcome::NewAttribute),
            Err(e) => return Err(e),
        };

        if supplier_wins(&supplier, &consumer) {
            debug!(
                partner = %partner,
                dn = %dn,
                attr = %attr.name,
                supplier = %supplier,
                consumer = %consumer,
                "supplier attribute wins"
            );
            return Ok(AttrOutcome::SupplierWins);
        }

        let benign = self.is_benign(entry_id, attr)?;
        if benign {
            debug!(
                partner = %partner,
                dn = %dn,
                attr = %attr.name,
                "benign conflict, consumer already has supplier value"
            );
        } else {
            warn!(
                partner = %partner,
                dn = %dn,
                attr = %attr.name,
                supplier = %supplier,
                consumer = %consumer,
                "possible conflict, consumer attribute wins"
            );
        }

        if !attr.name.eq_ignore_ascii_case(ATTR_USN_CHANGED) {
            attr.values.clear();
            attr.meta = None;
        }
        Ok(AttrOutcome::ConsumerWins { benign })
    }

    // TODO: cache the consumer entry across attributes of one change instead of re-reading it per conflict.
    fn is_benign(&self, entry_id: EntryId, attr: &SupplierAttr) -> Result<bool, MetaError> {
        let entry = self.backend.entry_by_id(entry_id)?;
        let local = entry.values(&attr.name).unwrap_or(&[]);
        Ok(value_set(local) == value_set(&attr.values))
    }

    /// Decides whether a proposed value change applies.
    ///
    /// Out of scope unless the supplier's attribute generation equals the
    /// consumer's. In scope, it loses only to a stored record for the same
    /// value with a later change time.
    pub fn value_change_in_scope(
        &self,
        entry_id: EntryId,
        supplier_attr: &AttrMetadata,
        proposed: &ValueMetadata,
    ) -> Result<bool, MetaError> {
        let consumer = match self.backend.attr_metadata(entry_id, &proposed.attr_type) {
            Ok(meta) => meta,
            Err(MetaError::AttrMetadataNotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if !supplier_attr.same_generation(&consumer) {
            return Ok(false);
        }
        let stored = self.backend.value_metadata(entry_id, &proposed.attr_type)?;
        let newer = stored
            .iter()
            .filter(|vm| vm.value == proposed.value)
            .any(|vm| vm.val_change_time > proposed.val_change_time);
        if newer {
            debug!(
                entry_id = %entry_id,
                attr = %proposed.attr_type,
                "value change superseded by later local change"
            );
        }
        Ok(!newer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirsync_meta::backend::MemoryBackend;
    use dirsync_meta::types::{Entry, InvocationId, ValueOpcode};
    use proptest::prelude::*;

    fn meta(version: u64, invo: &str) -> AttrMetadata {
        AttrMetadata {
            local_usn: 10,
            version,
            invocation_id: InvocationId::new(invo),
            orig_time: "20240101000000.000".to_string(),
            orig_usn: 10,
        }
    }

    fn setup() -> (Arc<MemoryBackend>, EntryId, ConflictResolver) {
        let be = Arc::new(MemoryBackend::new());
        let id = be
            .add_entry(
                Entry::new("cn=obj,dc=example")
                    .with_attr("description", "local")
                    .with_attr("uSNChanged", "10"),
            )
            .unwrap();
        be.set_attr_metadata(id, "description", meta(5, "ZZZZ")).unwrap();
        be.set_attr_metadata(id, "uSNChanged", meta(5, "ZZZZ")).unwrap();
        let resolver = ConflictResolver::new(be.clone());
        (be, id, resolver)
    }

    mod attribute_level {
        use super::*;

        #[test]
        fn test_higher_version_wins() {
            assert!(supplier_wins(&meta(6, "AAAA"), &meta(5, "ZZZZ")));
            assert!(!supplier_wins(&meta(4, "ZZZZ"), &meta(5, "AAAA")));
        }

        #[test]
        fn test_equal_version_tie_break() {
            assert!(supplier_wins(&meta(5, "ZZZZ"), &meta(5, "AAAA")));
            assert!(!supplier_wins(&meta(5, "AAAA"), &meta(5, "ZZZZ")));
            assert!(!supplier_wins(&meta(5, "AAAA"), &meta(5, "AAAA")));
        }

        #[test]
        fn test_consumer_wins_keeps_usn_changed() {
            let (_be, id, resolver) = setup();
            let mut attrs = vec![
                SupplierAttr::new("description", &["remote"], meta(5, "AAAA")),
                SupplierAttr::new("uSNChanged", &["42"], meta(5, "AAAA")),
            ];
            let report = resolver
                .resolve_attributes("b.example", id, "cn=obj,dc=example", &mut attrs)
                .unwrap();
            assert_eq!(report.conflicts(), 2);
            assert!(attrs[0].is_discarded());
            assert!(attrs[0].values.is_empty());
            assert!(!attrs[1].is_discarded());
            assert_eq!(attrs[1].meta.as_ref().unwrap().invocation_id.as_str(), "AAAA");
        }

        #[test]
        fn test_supplier_wins_keeps_values() {
            let (_be, id, resolver) = setup();
            let mut attrs = vec![SupplierAttr::new("description", &["remote"], meta(6, "AAAA"))];
            let report = resolver
                .resolve_attributes("b.example", id, "cn=obj,dc=example", &mut attrs)
                .unwrap();
            assert_eq!(report.resolutions[0].outcome, AttrOutcome::SupplierWins);
            assert_eq!(attrs[0].values, vec![b"remote".to_vec()]);
        }

        #[test]
        fn test_missing_metadata_supplier_wins() {
            let (_be, id, resolver) = setup();
            let mut attrs = vec![SupplierAttr::new("title", &["x"], meta(1, "AAAA"))];
            let report = resolver.resolve_attributes("b", id, "cn=obj", &mut attrs).unwrap();
            assert_eq!(report.resolutions[0].outcome, AttrOutcome::NewAttribute);
            assert!(!attrs[0].is_discarded());
        }

        #[test]
        fn test_object_guid_skipped() {
            let (be, id, resolver) = setup();
            be.set_attr_metadata(id, "objectGUID", meta(99, "ZZZZ")).unwrap();
            let mut attrs = vec![SupplierAttr::new("objectGUID", &["g"], meta(1, "AAAA"))];
            let report = resolver.resolve_attributes("b", id, "cn=obj", &mut attrs).unwrap();
            assert_eq!(report.resolutions[0].outcome, AttrOutcome::Skipped);
            assert!(!attrs[0].is_discarded());
        }

        #[test]
        fn test_benign_conflict_detected() {
            let (_be, id, resolver) = setup();
            let mut attrs = vec![SupplierAttr::new("description", &["local"], meta(4, "AAAA"))];
            let report = resolver.resolve_attributes("b", id, "cn=obj", &mut attrs).unwrap();
            assert_eq!(report.benign_conflicts(), 1);
        }

        #[test]
        fn test_backend_error_aborts() {
            let (be, id, resolver) = setup();
            be.inject_deadlock(true);
            let mut attrs = vec![SupplierAttr::new("description", &["x"], meta(9, "AAAA"))];
            assert!(matches!(
                resolver.resolve_attributes("b", id, "cn=obj", &mut attrs),
                Err(MetaError::Deadlock)
            ));
        }
    }

    mod value_level {
        use super::*;

        fn value_meta(time: &str, value: &str) -> ValueMetadata {
            ValueMetadata {
                attr_type: "member".to_string(),
                local_usn: 11,
                version: 3,
                invocation_id: InvocationId::new("ZZZZ"),
                val_change_invocation_id: InvocationId::new("ZZZZ"),
                val_change_time: time.to_string(),
                val_change_usn: 11,
                opcode: ValueOpcode::Add,
                value: value.as_bytes().to_vec(),
            }
        }

        fn setup_member() -> (Arc<MemoryBackend>, EntryId, ConflictResolver) {
            let (be, id, resolver) = setup();
            be.set_attr_metadata(id, "member", meta(3, "ZZZZ")).unwrap();
            be.add_value_metadata(id, value_meta("20240105000000.000", "cn=u1"))
                .unwrap();
            (be, id, resolver)
        }

        #[test]
        fn test_different_generation_out_of_scope() {
            let (_be, id, resolver) = setup_member();
            let proposed = value_meta("20250101000000.000", "cn=u2");
            assert!(!resolver
                .value_change_in_scope(id, &meta(4, "ZZZZ"), &proposed)
                .unwrap());
        }

        #[test]
        fn test_no_matching_value_in_scope() {
            let (_be, id, resolver) = setup_member();
            let proposed = value_meta("20200101000000.000", "cn=u2");
            assert!(resolver
                .value_change_in_scope(id, &meta(3, "ZZZZ"), &proposed)
                .unwrap());
        }

        #[test]
        fn test_later_local_change_wins() {
            let (_be, id, resolver) = setup_member();
            let older = value_meta("20240101000000.000", "cn=u1");
            assert!(!resolver
                .value_change_in_scope(id, &meta(3, "ZZZZ"), &older)
                .unwrap());
            let newer = value_meta("20240201000000.000", "cn=u1");
            assert!(resolver
                .value_change_in_scope(id, &meta(3, "ZZZZ"), &newer)
                .unwrap());
        }
    }

    fn invo_strategy() -> impl Strategy<Value = String> {
        "[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}"
    }

    proptest! {
        #[test]
        fn prop_higher_version_always_wins(vs in 1u64..1000, delta in 1u64..1000, a in invo_strategy(), b in invo_strategy()) {
            prop_assert!(supplier_wins(&meta(vs + delta, &a), &meta(vs, &b)));
        }

        #[test]
        fn prop_equal_version_antisymmetric(v in 0u64..100, a in invo_strategy(), b in invo_strategy()) {
            let forward = supplier_wins(&meta(v, &a), &meta(v, &b));
            let backward = supplier_wins(&meta(v, &b), &meta(v, &a));
            if a == b {
                prop_assert!(!forward && !backward);
            } else {
                prop_assert!(forward != backward);
                prop_assert_eq!(forward, a > b);
            }
        }
    }
}
