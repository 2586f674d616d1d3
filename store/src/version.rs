//! Version tree: a DAG of `Edge`/`Change`/`Merge` nodes per ID-hash, with a
//! current head pointer and a deterministic merge discipline.
//!
//! Nodes are ordinary objects of built-in types, persisted through the
//! canonical encoder, so every version node self-certifies like any other
//! payload. History is append-only and heads only advance: after a merge,
//! every input node is reachable from the new head.

use crate::canonical;
use crate::crdt::{merge_objects, MergeCtx, MergeStore};
use crate::error::StoreError;
use crate::hash::{Hash, IdHash};
use crate::object::{Obj, Value};
use crate::recipe::{Registry, TypeSet};
use crate::rmap::{HeadSource, ReverseMap};
use crate::store::{Status, Store};
use crate::util::now_ms;
use anyhow::{anyhow, Result};
use fnv::FnvHashSet;
use std::collections::VecDeque;
use std::sync::Arc;

/// Caller-selected persistence policy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorePolicy {
    /// Persist data bytes only; do not touch the head.
    NoVersionMap,
    /// Local edit: append a `Change` on top of the current head.
    Change,
    /// Remote import: wrap the incoming version in an `Edge` and merge.
    Merge,
}

/// A node of the per-ID version DAG.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Node {
    Edge {
        id: IdHash,
        data: Hash,
        created: i64,
    },
    Change {
        id: IdHash,
        data: Hash,
        prev: Hash,
        depth: u64,
        created: i64,
    },
    Merge {
        id: IdHash,
        data: Hash,
        /// unordered parents, kept hash-sorted for deterministic encoding
        nodes: Vec<Hash>,
        depth: u64,
        created: i64,
    },
}

impl Node {
    pub fn id(&self) -> IdHash {
        match self {
            Self::Edge { id, .. } | Self::Change { id, .. } | Self::Merge { id, .. } => *id,
        }
    }

    pub fn data(&self) -> Hash {
        match self {
            Self::Edge { data, .. } | Self::Change { data, .. } | Self::Merge { data, .. } => *data,
        }
    }

    pub fn depth(&self) -> u64 {
        match self {
            Self::Edge { .. } => 0,
            Self::Change { depth, .. } | Self::Merge { depth, .. } => *depth,
        }
    }

    pub fn created(&self) -> i64 {
        match self {
            Self::Edge { created, .. }
            | Self::Change { created, .. }
            | Self::Merge { created, .. } => *created,
        }
    }

    pub fn parents(&self) -> Vec<Hash> {
        match self {
            Self::Edge { .. } => Vec::new(),
            Self::Change { prev, .. } => vec![*prev],
            Self::Merge { nodes, .. } => nodes.clone(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Edge { .. } => "Edge",
            Self::Change { .. } => "Change",
            Self::Merge { .. } => "Merge",
        }
    }

    pub fn to_obj(&self) -> Obj {
        match self {
            Self::Edge { id, data, created } => Obj::new("Edge")
                .set("id", Value::id_ref(*id))
                .set("data", Value::obj_ref(*data))
                .set("created", *created),
            Self::Change {
                id,
                data,
                prev,
                depth,
                created,
            } => Obj::new("Change")
                .set("id", Value::id_ref(*id))
                .set("data", Value::obj_ref(*data))
                .set("prev", Value::obj_ref(*prev))
                .set("depth", *depth as i64)
                .set("created", *created),
            Self::Merge {
                id,
                data,
                nodes,
                depth,
                created,
            } => Obj::new("Merge")
                .set("id", Value::id_ref(*id))
                .set("data", Value::obj_ref(*data))
                .set(
                    "node",
                    Value::Set(nodes.iter().map(|n| Value::obj_ref(*n)).collect()),
                )
                .set("depth", *depth as i64)
                .set("created", *created),
        }
    }

    pub fn from_obj(obj: &Obj) -> Result<Self> {
        let bad = |what: &str| StoreError::Decode(format!("version node without {}", what));
        let id = obj
            .get("id")
            .and_then(Value::as_id_ref)
            .ok_or_else(|| bad("id"))?;
        let data = obj.ref_field("data").map(|(_, h)| h).ok_or_else(|| bad("data"))?;
        let created = obj.integer_field("created").ok_or_else(|| bad("created"))?;
        let node = match obj.type_name() {
            "Edge" => Self::Edge { id, data, created },
            "Change" => Self::Change {
                id,
                data,
                prev: obj.ref_field("prev").map(|(_, h)| h).ok_or_else(|| bad("prev"))?,
                depth: obj.integer_field("depth").ok_or_else(|| bad("depth"))? as u64,
                created,
            },
            "Merge" => {
                let nodes = match obj.get("node") {
                    Some(Value::Set(items)) => items
                        .iter()
                        .filter_map(|v| v.as_reference().map(|(_, h)| h))
                        .collect::<Vec<_>>(),
                    _ => return Err(bad("node").into()),
                };
                if nodes.is_empty() {
                    return Err(bad("node").into());
                }
                Self::Merge {
                    id,
                    data,
                    nodes,
                    depth: obj.integer_field("depth").ok_or_else(|| bad("depth"))? as u64,
                    created,
                }
            }
            other => {
                return Err(StoreError::Decode(format!("{} is not a version node", other)).into())
            }
        };
        Ok(node)
    }
}

/// Result of a store operation.
#[derive(Clone, Debug)]
pub struct Stored {
    /// version hash of the stored payload
    pub hash: Hash,
    /// ID-hash for versioned types
    pub id: Option<IdHash>,
    /// head node after the operation, when a version map was touched
    pub node: Option<Hash>,
    /// `Exists` when the write changed nothing
    pub status: Status,
}

struct Inner {
    store: Store,
    registry: Registry,
    rmap: ReverseMap,
}

/// The write pipeline: canonical encode, address, persist, version, index.
#[derive(Clone)]
pub struct VersionTree(Arc<Inner>);

impl VersionTree {
    pub fn new(store: Store, registry: Registry, rmap: ReverseMap) -> Self {
        Self(Arc::new(Inner {
            store,
            registry,
            rmap,
        }))
    }

    pub fn store(&self) -> &Store {
        &self.0.store
    }

    pub fn registry(&self) -> &Registry {
        &self.0.registry
    }

    pub fn rmap(&self) -> &ReverseMap {
        &self.0.rmap
    }

    /// Reads and decodes a stored object.
    pub fn read_decoded(&self, hash: &Hash) -> Result<Obj> {
        let bytes = self.0.store.read_object(hash)?;
        canonical::decode(&self.0.registry, &bytes, &TypeSet::Any)
    }

    /// Reads and decodes a version node.
    pub fn node(&self, hash: &Hash) -> Result<Node> {
        Node::from_obj(&self.read_decoded(hash)?)
    }

    pub fn head(&self, id: &IdHash) -> Result<Option<Hash>> {
        self.0.store.read_head(id)
    }

    pub fn head_node(&self, id: &IdHash) -> Result<Option<(Hash, Node)>> {
        match self.0.store.read_head(id)? {
            Some(hash) => Ok(Some((hash, self.node(&hash)?))),
            None => Ok(None),
        }
    }

    /// Node hashes reachable from `from` (inclusive), breadth-first. Nodes
    /// missing locally bound the walk instead of failing it.
    pub fn closure(&self, from: &Hash) -> Result<Vec<Hash>> {
        let mut visited = FnvHashSet::default();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([*from]);
        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }
            order.push(hash);
            match self.node(&hash) {
                Ok(node) => queue.extend(node.parents()),

                Err(err) if matches!(StoreError::kind_of(&err), Some(StoreError::NotFound(_))) => {
                    tracing::debug!("closure bounded at missing node {}", hash);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(order)
    }

    /// Stores the payload without touching any head.
    pub fn store_no_version(&self, obj: &Obj) -> Result<Stored> {
        let encoded = canonical::encode_with_id(&self.0.registry, obj)?;
        let (hash, status) = self.0.store.write_object(obj.type_name(), &encoded.bytes)?;
        let id = match &encoded.id {
            Some((id_bytes, _)) => Some(self.0.store.write_id_object(obj.type_name(), id_bytes)?.0),
            None => None,
        };
        self.0.rmap.update(obj, hash, id, status, now_ms())?;
        Ok(Stored {
            hash,
            id,
            node: None,
            status,
        })
    }

    /// Stores a local write under the selected policy. Head-touching
    /// policies serialize per ID-hash.
    pub async fn store_object(&self, obj: &Obj, policy: StorePolicy) -> Result<Stored> {
        if policy == StorePolicy::NoVersionMap {
            return self.store_no_version(obj);
        }
        let encoded = canonical::encode_with_id(&self.0.registry, obj)?;
        let (id_bytes, id) = match &encoded.id {
            Some((bytes, id)) => (bytes.clone(), *id),
            None => {
                return Err(anyhow!(
                    "policy {:?} needs a versioned type, {} has no id rules",
                    policy,
                    obj.type_name()
                ))
            }
        };
        let _guard = self.0.store.locks().lock(&format!("id:{}", id)).await;
        let (id, _) = self.0.store.write_id_object(obj.type_name(), &id_bytes)?;
        let (hash, status) = self.0.store.write_object(obj.type_name(), &encoded.bytes)?;
        self.0.rmap.update(obj, hash, Some(id), status, now_ms())?;
        self.version_locked(id, hash, policy, None)
    }

    /// Stores bytes received from a peer. With node bytes — the peer's
    /// current head for that ID — the version is merged into the local
    /// history. Without them the payload lands content-addressed only: a
    /// historical version whose place in the DAG arrives through its node
    /// object, not through a second merge.
    pub async fn store_remote(&self, bytes: &[u8], node_bytes: Option<&[u8]>) -> Result<Stored> {
        let (obj, is_id) = canonical::decode_any(&self.0.registry, bytes, &TypeSet::Any)?;
        if is_id {
            let (id, status) = self.0.store.write_id_object(obj.type_name(), bytes)?;
            return Ok(Stored {
                hash: id.as_object_hash(),
                id: Some(id),
                node: None,
                status,
            });
        }
        let recipe = self
            .0
            .registry
            .get(obj.type_name())
            .ok_or_else(|| StoreError::Decode(format!("no recipe for {}", obj.type_name())))?;
        if !recipe.is_versioned() {
            let (hash, status) = self.0.store.write_object(obj.type_name(), bytes)?;
            self.0.rmap.update(&obj, hash, None, status, now_ms())?;
            return Ok(Stored {
                hash,
                id: None,
                node: None,
                status,
            });
        }
        let id_bytes = canonical::id_encode(&self.0.registry, &obj)?;
        let id = IdHash::digest(&id_bytes);
        let _guard = self.0.store.locks().lock(&format!("id:{}", id)).await;
        let (id, _) = self.0.store.write_id_object(obj.type_name(), &id_bytes)?;
        let (hash, status) = self.0.store.write_object(obj.type_name(), bytes)?;
        self.0.rmap.update(&obj, hash, Some(id), status, now_ms())?;

        let node_bytes = match node_bytes {
            Some(node_bytes) => node_bytes,
            None => {
                return Ok(Stored {
                    hash,
                    id: Some(id),
                    node: None,
                    status,
                })
            }
        };
        let node_obj = canonical::decode(
            &self.0.registry,
            node_bytes,
            &TypeSet::Of(vec!["Edge".into(), "Change".into(), "Merge".into()]),
        )?;
        let node = Node::from_obj(&node_obj)?;
        if node.id() != id || node.data() != hash {
            return Err(StoreError::Decode(format!(
                "version node does not describe payload {}",
                hash
            ))
            .into());
        }
        let (node_hash, _) = self.0.store.write_object(node.type_name(), node_bytes)?;
        self.version_locked(id, hash, StorePolicy::Merge, Some(node_hash))
    }

    /// Advances the version map for `id` after its payload landed. The ID
    /// lock is held by the caller.
    fn version_locked(
        &self,
        id: IdHash,
        data: Hash,
        policy: StorePolicy,
        incoming: Option<Hash>,
    ) -> Result<Stored> {
        let head = self.0.store.read_head(&id)?;
        let (node, status) = match head {
            None => {
                let node_hash = match incoming {
                    Some(node_hash) => node_hash,
                    None => self.write_node(&Node::Edge {
                        id,
                        data,
                        created: now_ms(),
                    })?,
                };
                self.0.store.write_head(&id, &node_hash)?;
                (node_hash, Status::New)
            }
            Some(head_hash) => {
                let head_node = self.node(&head_hash)?;
                if head_node.data() == data && incoming.is_none() {
                    // same bytes, same version: nothing to record
                    return Ok(Stored {
                        hash: data,
                        id: Some(id),
                        node: Some(head_hash),
                        status: Status::Exists,
                    });
                }
                let candidate = match incoming {
                    Some(node_hash) => node_hash,
                    None => {
                        let node = match policy {
                            StorePolicy::Change => Node::Change {
                                id,
                                data,
                                prev: head_hash,
                                depth: head_node.depth() + 1,
                                created: now_ms(),
                            },
                            _ => Node::Edge {
                                id,
                                data,
                                created: now_ms(),
                            },
                        };
                        self.write_node(&node)?
                    }
                };
                let merged = self.merge_heads_locked(id, head_hash, candidate)?;
                let status = if merged == head_hash {
                    Status::Exists
                } else {
                    Status::New
                };
                (merged, status)
            }
        };
        Ok(Stored {
            hash: data,
            id: Some(id),
            node: Some(node),
            status,
        })
    }

    fn write_node(&self, node: &Node) -> Result<Hash> {
        let obj = node.to_obj();
        let bytes = canonical::encode(&self.0.registry, &obj)?;
        let (hash, _) = self.0.store.write_object(node.type_name(), &bytes)?;
        Ok(hash)
    }

    /// Deterministic merge of two candidate heads of one ID. The ID lock is
    /// held by the caller; returns the resulting head hash.
    fn merge_heads_locked(&self, id: IdHash, l: Hash, r: Hash) -> Result<Hash> {
        if l == r {
            return Ok(l);
        }
        let l_reach: FnvHashSet<Hash> = self.closure(&l)?.into_iter().collect();
        if l_reach.contains(&r) {
            // l already subsumes r
            self.advance_head(id, l)?;
            return Ok(l);
        }
        let r_reach: FnvHashSet<Hash> = self.closure(&r)?.into_iter().collect();
        if r_reach.contains(&l) {
            self.advance_head(id, r)?;
            return Ok(r);
        }

        let l_node = self.node(&l)?;
        let r_node = self.node(&r)?;
        let l_obj = self.read_decoded(&l_node.data())?;
        let r_obj = self.read_decoded(&r_node.data())?;
        if l_obj.type_name() != r_obj.type_name() {
            return Err(StoreError::ConflictMerge(format!(
                "heads of {} hold different types",
                id
            ))
            .into());
        }
        let recipe = self
            .0
            .registry
            .get(l_obj.type_name())
            .ok_or_else(|| StoreError::Decode(format!("no recipe for {}", l_obj.type_name())))?;
        let ctx = MergeCtx {
            registry: &self.0.registry,
            objects: self,
            l_time: l_node.created(),
            r_time: r_node.created(),
        };
        let merged = merge_objects(&ctx, &recipe, &l_obj, &r_obj)?;
        let data = self.store_no_version(&merged)?.hash;

        // the subsumption checks above ruled out domination either way, so
        // both candidates are minimal parents; sorted for a stable hash
        let mut parent_hashes = vec![l, r];
        parent_hashes.sort();
        let depth = l_node.depth().max(r_node.depth()) + 1;
        let created = l_node.created().max(r_node.created());
        let head = self.write_node(&Node::Merge {
            id,
            data,
            nodes: parent_hashes,
            depth,
            created,
        })?;
        self.advance_head(id, head)?;
        Ok(head)
    }

    // no event when the head already points at the target
    fn advance_head(&self, id: IdHash, target: Hash) -> Result<()> {
        if self.0.store.read_head(&id)? != Some(target) {
            self.0.store.write_head(&id, &target)?;
        }
        Ok(())
    }
}

impl HeadSource for VersionTree {
    fn head_data(&self, id: &IdHash) -> Result<Option<Hash>> {
        match self.head_node(id)? {
            Some((_, node)) => Ok(Some(node.data())),
            None => Ok(None),
        }
    }
}

impl MergeStore for VersionTree {
    fn read_obj(&self, hash: &Hash) -> Result<Obj> {
        self.read_decoded(hash)
    }

    fn write_obj(&self, obj: &Obj) -> Result<Hash> {
        Ok(self.store_no_version(obj)?.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn tree() -> (tempfile::TempDir, VersionTree) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 0).unwrap();
        let registry = Registry::new(&[]).unwrap();
        let rmap = ReverseMap::new(store.clone(), BTreeSet::new(), BTreeSet::new());
        (dir, VersionTree::new(store, registry, rmap))
    }

    #[async_std::test]
    async fn storing_twice_is_idempotent() {
        let (_dir, tree) = tree();
        let person = Obj::new("Person").set("email", "a@b").set("name", "X");
        let first = tree.store_object(&person, StorePolicy::Change).await.unwrap();
        assert_eq!(first.status, Status::New);
        let second = tree.store_object(&person, StorePolicy::Change).await.unwrap();
        assert_eq!(second.status, Status::Exists);
        assert_eq!(second.hash, first.hash);
        assert_eq!(second.node, first.node);
        // exactly one Edge in the version map
        let node = tree.node(&first.node.unwrap()).unwrap();
        assert!(matches!(node, Node::Edge { .. }));
        assert_eq!(tree.closure(&first.node.unwrap()).unwrap().len(), 1);
    }

    #[async_std::test]
    async fn sequential_change_builds_a_chain() {
        let (_dir, tree) = tree();
        let v1 = tree
            .store_object(
                &Obj::new("Person").set("email", "a@b").set("name", "X"),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        let v2 = tree
            .store_object(
                &Obj::new("Person").set("email", "a@b").set("name", "Y"),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        assert_eq!(v1.id, v2.id);
        assert_ne!(v1.hash, v2.hash);
        let head = tree.head(&v1.id.unwrap()).unwrap().unwrap();
        assert_eq!(head, v2.node.unwrap());
        match tree.node(&head).unwrap() {
            Node::Change {
                data, prev, depth, ..
            } => {
                assert_eq!(data, v2.hash);
                assert_eq!(prev, v1.node.unwrap());
                assert_eq!(depth, 1);
            }
            other => panic!("expected a change, got {:?}", other),
        }
    }

    #[async_std::test]
    async fn importing_a_known_descendant_is_already_merged() {
        let (_dir, tree) = tree();
        let registry = tree.registry().clone();
        let _v1 = tree
            .store_object(
                &Obj::new("Person").set("email", "a@b").set("name", "X"),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        let v2 = tree
            .store_object(
                &Obj::new("Person").set("email", "a@b").set("name", "Y"),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        let head_before = tree.head(&v2.id.unwrap()).unwrap().unwrap();

        // the peer re-sends the current head version with its node
        let bytes = tree.store().read_object(&v2.hash).unwrap();
        let node_obj = tree.node(&head_before).unwrap().to_obj();
        let node_bytes = canonical::encode(&registry, &node_obj).unwrap();
        let merged = tree.store_remote(&bytes, Some(&node_bytes)).await.unwrap();
        assert_eq!(merged.status, Status::Exists);
        assert_eq!(merged.node, Some(head_before));
        assert_eq!(tree.head(&v2.id.unwrap()).unwrap(), Some(head_before));
    }

    #[async_std::test]
    async fn concurrent_heads_merge_deterministically() {
        let (_dir, alice) = tree();
        let (_dir2, bob) = tree();
        let base = Obj::new("Person").set("email", "a@b").set("name", "X");
        let a0 = alice.store_object(&base, StorePolicy::Change).await.unwrap();
        let b0 = bob.store_object(&base, StorePolicy::Change).await.unwrap();
        assert_eq!(a0.hash, b0.hash);

        let ay = Obj::new("Person").set("email", "a@b").set("name", "Y");
        let bz = Obj::new("Person").set("email", "a@b").set("name", "Z");
        let av = alice.store_object(&ay, StorePolicy::Change).await.unwrap();
        let bv = bob.store_object(&bz, StorePolicy::Change).await.unwrap();

        // exchange both directions: payload plus node bytes
        let a_bytes = alice.store().read_object(&av.hash).unwrap();
        let a_node = canonical::encode(
            alice.registry(),
            &alice.node(&av.node.unwrap()).unwrap().to_obj(),
        )
        .unwrap();
        let b_bytes = bob.store().read_object(&bv.hash).unwrap();
        let b_node = canonical::encode(
            bob.registry(),
            &bob.node(&bv.node.unwrap()).unwrap().to_obj(),
        )
        .unwrap();

        alice.store_remote(&b_bytes, Some(&b_node)).await.unwrap();
        bob.store_remote(&a_bytes, Some(&a_node)).await.unwrap();

        let id = av.id.unwrap();
        let a_head = alice.head(&id).unwrap().unwrap();
        let b_head = bob.head(&id).unwrap().unwrap();
        assert_eq!(a_head, b_head);
        match alice.node(&a_head).unwrap() {
            Node::Merge { nodes, depth, .. } => {
                let mut expected = vec![av.node.unwrap(), bv.node.unwrap()];
                expected.sort();
                assert_eq!(nodes, expected);
                assert_eq!(depth, 2);
            }
            other => panic!("expected a merge, got {:?}", other),
        }
        // both inputs stay reachable from the merged head
        let closure = alice.closure(&a_head).unwrap();
        assert!(closure.contains(&av.node.unwrap()));
        assert!(closure.contains(&bv.node.unwrap()));
    }

    #[async_std::test]
    async fn no_version_map_leaves_heads_alone() {
        let (_dir, tree) = tree();
        let person = Obj::new("Person").set("email", "a@b");
        let stored = tree.store_no_version(&person).unwrap();
        assert_eq!(stored.node, None);
        assert_eq!(tree.head(&stored.id.unwrap()).unwrap(), None);
    }
}
