//! Authorization view: resolves the set of object hashes a peer identity may
//! receive, through direct `Access`/`IdAccess` grants and through group
//! membership.

use crate::hash::{Hash, IdHash};
use crate::object::Value;
use crate::recipe::TypeSet;
use crate::version::VersionTree;
use anyhow::Result;
use std::collections::BTreeMap;

/// What an accessible hash denotes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccessKind {
    Unversioned,
    Versioned,
    VersionNode,
    Id,
}

/// Why an item is accessible; diagnostics only.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reason {
    Person(IdHash),
    Group(IdHash),
}

#[derive(Clone, Debug)]
pub struct AccessibleItem {
    pub hash: Hash,
    pub type_name: String,
    pub kind: AccessKind,
    pub reason: Reason,
}

/// Caller-supplied policy gate applied at each grant.
pub type AccessFilter<'a> = &'a dyn Fn(&Hash, &str) -> bool;

pub struct AccessResolver<'a> {
    tree: &'a VersionTree,
}

impl<'a> AccessResolver<'a> {
    pub fn new(tree: &'a VersionTree) -> Self {
        Self { tree }
    }

    /// Deduplicated accessible set for a `Person` ID-hash, in hash order.
    /// The first reason that produced an item sticks.
    pub fn accessible_for(
        &self,
        person: &IdHash,
        filter: Option<AccessFilter>,
    ) -> Result<Vec<AccessibleItem>> {
        self.accessible_since(person, 0, filter)
    }

    /// Like [`accessible_for`](Self::accessible_for), restricted to grants
    /// recorded at or after `since`.
    pub fn accessible_since(
        &self,
        person: &IdHash,
        since: i64,
        filter: Option<AccessFilter>,
    ) -> Result<Vec<AccessibleItem>> {
        let mut out = BTreeMap::new();
        self.collect_grants(*person, Reason::Person(*person), since, filter, &mut out)?;
        // group-mediated grants: only current group versions convey access
        for entry in self.tree.rmap().latest_id(person, "Group", self.tree)? {
            if entry.timestamp < since {
                continue;
            }
            let group_id = match entry.referrer_id {
                Some(id) => id,
                None => continue,
            };
            if let Some(filter) = filter {
                if !filter(&entry.referrer, "Group") {
                    continue;
                }
            }
            let group = self.tree.read_decoded(&entry.referrer)?;
            if !group.id_ref_set("person").contains(person) {
                continue;
            }
            let reason = Reason::Group(group_id);
            // members receive the group itself so they can resolve it
            self.include_versioned(group_id, reason, &mut out)?;
            self.collect_grants(group_id, reason, since, filter, &mut out)?;
        }
        Ok(out.into_values().collect())
    }

    fn collect_grants(
        &self,
        accessor: IdHash,
        reason: Reason,
        since: i64,
        filter: Option<AccessFilter>,
        out: &mut BTreeMap<Hash, AccessibleItem>,
    ) -> Result<()> {
        for entry in self.tree.rmap().latest_id(&accessor, "Access", self.tree)? {
            if entry.timestamp < since {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(&entry.referrer, "Access") {
                    continue;
                }
            }
            let grant = self.tree.read_decoded(&entry.referrer)?;
            if !self.names_accessor(&grant, accessor, reason) {
                continue;
            }
            insert(out, entry.referrer, "Access", AccessKind::Unversioned, reason);
            if let Some((_, target)) = grant.ref_field("object") {
                self.include_target(target, reason, filter, out)?;
            }
        }
        for entry in self.tree.rmap().latest_id(&accessor, "IdAccess", self.tree)? {
            if entry.timestamp < since {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(&entry.referrer, "IdAccess") {
                    continue;
                }
            }
            let grant = self.tree.read_decoded(&entry.referrer)?;
            if !self.names_accessor(&grant, accessor, reason) {
                continue;
            }
            insert(out, entry.referrer, "IdAccess", AccessKind::Unversioned, reason);
            if let Some(target) = grant.get("id").and_then(Value::as_id_ref) {
                self.include_versioned(target, reason, out)?;
            }
        }
        Ok(())
    }

    /// A reverse-map hit is not a grant by itself; the grant must actually
    /// list the accessor.
    fn names_accessor(&self, grant: &crate::object::Obj, accessor: IdHash, reason: Reason) -> bool {
        match reason {
            Reason::Person(_) => grant.id_ref_set("person").contains(&accessor),
            Reason::Group(_) => grant.id_ref_set("group").contains(&accessor),
        }
    }

    /// A version-hash target: versioned or unversioned by its recipe.
    fn include_target(
        &self,
        target: Hash,
        reason: Reason,
        filter: Option<AccessFilter>,
        out: &mut BTreeMap<Hash, AccessibleItem>,
    ) -> Result<()> {
        let bytes = match self.tree.store().read_object(&target) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::debug!("granted target {} unavailable: {}", target, err);
                return Ok(());
            }
        };
        let (obj, is_id) =
            crate::canonical::decode_any(self.tree.registry(), &bytes, &TypeSet::Any)?;
        if let Some(filter) = filter {
            if !filter(&target, obj.type_name()) {
                return Ok(());
            }
        }
        if is_id {
            insert(out, target, obj.type_name(), AccessKind::Id, reason);
            return Ok(());
        }
        let versioned = self
            .tree
            .registry()
            .get(obj.type_name())
            .map(|r| r.is_versioned())
            .unwrap_or(false);
        let kind = if versioned {
            AccessKind::Versioned
        } else {
            AccessKind::Unversioned
        };
        insert(out, target, obj.type_name(), kind, reason);
        Ok(())
    }

    /// An ID-hash target: the ID object plus the head-reachable node closure.
    fn include_versioned(
        &self,
        target: IdHash,
        reason: Reason,
        out: &mut BTreeMap<Hash, AccessibleItem>,
    ) -> Result<()> {
        let id_object = target.as_object_hash();
        let type_name = match self.tree.store().read_object(&id_object) {
            Ok(bytes) => {
                let (obj, _) =
                    crate::canonical::decode_any(self.tree.registry(), &bytes, &TypeSet::Any)?;
                obj.type_name().to_string()
            }
            Err(err) => {
                tracing::debug!("granted id {} unavailable: {}", target, err);
                return Ok(());
            }
        };
        insert(out, id_object, &type_name, AccessKind::Id, reason);
        if let Some(head) = self.tree.head(&target)? {
            for node_hash in self.tree.closure(&head)? {
                let node = self.tree.node(&node_hash)?;
                insert(out, node_hash, node.type_name(), AccessKind::VersionNode, reason);
            }
        }
        Ok(())
    }
}

fn insert(
    out: &mut BTreeMap<Hash, AccessibleItem>,
    hash: Hash,
    type_name: &str,
    kind: AccessKind,
    reason: Reason,
) {
    out.entry(hash).or_insert_with(|| AccessibleItem {
        hash,
        type_name: type_name.into(),
        kind,
        reason,
    });
}
