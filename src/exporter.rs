//! Chum exporter: drives the stream of accessible hashes to the peer.
//!
//! The accessible closure starts from the peer's grants (§ the access
//! resolver) and follows every reference edge — object, id, blob, clob —
//! bounded by the visited set since reference graphs may contain cycles.
//! Offers go out in a bounded window; the channel provides back-pressure.

use crate::proto::{Message, PayloadKind};
use crate::transport::FrameSender;
use crate::util::error_kind;
use anyhow::Result;
use chum_store::{
    decode_any, AccessKind, AccessResolver, Hash, IdHash, RefKind, StoreError, TypeSet, Value,
    VersionTree,
};
use fnv::FnvHashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

/// How many offers may be unanswered at once.
const OFFER_WINDOW: usize = 16;

/// Policy hook gating what the exporter will serve.
pub type ExportFilter = Arc<dyn Fn(&Hash, &str) -> bool + Send + Sync>;

/// One transferable payload.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OfferItem {
    pub hash: Hash,
    pub kind: PayloadKind,
    pub type_name: String,
}

/// Computes the full accessible closure for a peer identity. Grants
/// recorded before `since` are left out; everything a kept grant reaches is
/// expanded regardless of age.
pub fn accessible_closure(
    tree: &VersionTree,
    peer: &IdHash,
    since: i64,
    filter: Option<&ExportFilter>,
) -> Result<Vec<OfferItem>> {
    let resolver = AccessResolver::new(tree);
    let resolver_filter = filter.map(|f| f.as_ref() as &dyn Fn(&Hash, &str) -> bool);
    let granted = resolver.accessible_since(peer, since, resolver_filter)?;
    let mut queue: VecDeque<(Hash, PayloadKind)> = granted
        .iter()
        .map(|item| {
            let kind = match item.kind {
                AccessKind::Id => PayloadKind::IdObject,
                _ => PayloadKind::Object,
            };
            (item.hash, kind)
        })
        .collect();
    let mut visited = BTreeSet::new();
    let mut out = Vec::new();
    while let Some((hash, kind)) = queue.pop_front() {
        if !visited.insert(hash) {
            continue;
        }
        match kind {
            PayloadKind::Blob => {
                if tree.store().blob_exists(&hash) {
                    out.push(OfferItem {
                        hash,
                        kind,
                        type_name: "Blob".into(),
                    });
                } else {
                    tracing::debug!("accessible blob {} missing locally", hash);
                }
            }
            PayloadKind::Clob => {
                if tree.store().clob_exists(&hash) {
                    out.push(OfferItem {
                        hash,
                        kind,
                        type_name: "Clob".into(),
                    });
                } else {
                    tracing::debug!("accessible clob {} missing locally", hash);
                }
            }
            PayloadKind::Object | PayloadKind::IdObject => {
                let bytes = match tree.store().read_object(&hash) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::debug!("accessible object {} unreadable: {}", hash, err);
                        continue;
                    }
                };
                let (obj, is_id) = decode_any(tree.registry(), &bytes, &TypeSet::Any)?;
                if let Some(filter) = filter {
                    if !filter(&hash, obj.type_name()) {
                        continue;
                    }
                }
                out.push(OfferItem {
                    hash,
                    kind: if is_id {
                        PayloadKind::IdObject
                    } else {
                        PayloadKind::Object
                    },
                    type_name: obj.type_name().into(),
                });
                for (_, value) in obj.fields() {
                    expand_refs(tree, value, &mut queue)?;
                }
            }
        }
    }
    Ok(out)
}

fn expand_refs(
    tree: &VersionTree,
    value: &Value,
    queue: &mut VecDeque<(Hash, PayloadKind)>,
) -> Result<()> {
    match value {
        Value::Reference(RefKind::Obj, hash) => queue.push_back((*hash, PayloadKind::Object)),
        Value::Reference(RefKind::Id, hash) => {
            let id = IdHash::new(*hash.as_ref());
            queue.push_back((*hash, PayloadKind::IdObject));
            // an id edge reaches the whole history through the head node
            if let Some(head) = tree.head(&id)? {
                queue.push_back((head, PayloadKind::Object));
            }
        }
        Value::Reference(RefKind::Blob, hash) => queue.push_back((*hash, PayloadKind::Blob)),
        Value::Reference(RefKind::Clob, hash) => queue.push_back((*hash, PayloadKind::Clob)),
        Value::Seq(items) | Value::Set(items) => {
            for item in items {
                expand_refs(tree, item, queue)?;
            }
        }
        Value::Map(entries) => {
            for (key, value) in entries {
                expand_refs(tree, key, queue)?;
                expand_refs(tree, value, queue)?;
            }
        }
        Value::Object(obj) => {
            for (_, value) in obj.fields() {
                expand_refs(tree, value, queue)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Node bytes accompany a versioned payload only while it is the current
/// head of its ID. Historical versions travel as plain payloads — their
/// nodes are ordinary objects in the closure — so both peers merge exactly
/// one pair of heads per ID, whatever the arrival order.
fn node_bytes_for(tree: &VersionTree, data: &Hash, id: &IdHash) -> Result<Option<Vec<u8>>> {
    if let Some((head_hash, head_node)) = tree.head_node(id)? {
        if head_node.data() == *data {
            return Ok(Some(tree.store().read_object(&head_hash)?));
        }
    }
    Ok(None)
}

pub struct Exporter {
    tree: VersionTree,
    peer: IdHash,
    since: i64,
    filter: Option<ExportFilter>,
    queue: VecDeque<OfferItem>,
    /// offers awaiting need / not-need
    offered: FnvHashMap<u64, OfferItem>,
    /// bodies awaiting ack
    sent: FnvHashMap<u64, OfferItem>,
    /// transferred and acknowledged
    acked: Vec<OfferItem>,
    /// every hash ever enqueued, so live reconciles only add news
    seen: BTreeSet<Hash>,
    next_req: u64,
    done_sent: bool,
}

impl Exporter {
    /// Computes the initial closure for the peer and queues it.
    pub fn new(
        tree: VersionTree,
        peer: IdHash,
        since: i64,
        filter: Option<ExportFilter>,
    ) -> Result<Self> {
        let mut exporter = Self {
            tree,
            peer,
            since,
            filter,
            queue: VecDeque::new(),
            offered: FnvHashMap::default(),
            sent: FnvHashMap::default(),
            acked: Vec::new(),
            seen: BTreeSet::new(),
            next_req: 1,
            done_sent: false,
        };
        exporter.reconcile()?;
        Ok(exporter)
    }

    /// Recomputes the accessible closure and queues anything new. Returns
    /// how many items were added.
    pub fn reconcile(&mut self) -> Result<usize> {
        let mut added = 0;
        for item in
            accessible_closure(&self.tree, &self.peer, self.since, self.filter.as_ref())?
        {
            if self.seen.insert(item.hash) {
                self.queue.push_back(item);
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!("exporter queued {} new items", added);
        }
        Ok(added)
    }

    /// Sends offers up to the window.
    pub async fn fill(&mut self, tx: &mut FrameSender) -> Result<()> {
        while self.offered.len() < OFFER_WINDOW {
            let item = match self.queue.pop_front() {
                Some(item) => item,
                None => break,
            };
            let req = self.next_req;
            self.next_req += 1;
            tx.send(&Message::Offer {
                req,
                hash: (*item.hash.as_ref()),
                kind: item.kind,
                type_name: item.type_name.clone(),
            })
            .await?;
            self.offered.insert(req, item);
        }
        Ok(())
    }

    /// True once the initial closure is drained and every sent body acked.
    pub fn full_sync_reached(&self) -> bool {
        self.idle()
    }

    pub fn idle(&self) -> bool {
        self.queue.is_empty() && self.offered.is_empty() && self.sent.is_empty()
    }

    pub fn done_sent(&self) -> bool {
        self.done_sent
    }

    pub fn mark_done_sent(&mut self) {
        self.done_sent = true;
    }

    pub fn acked(&self) -> &[OfferItem] {
        &self.acked
    }

    /// Serves a body for an offer the peer needs.
    pub async fn handle_need(
        &mut self,
        req: u64,
        tx: &mut FrameSender,
        errors: &mut Vec<String>,
    ) -> Result<()> {
        let item = match self.offered.remove(&req) {
            Some(item) => item,
            None => {
                tracing::debug!("need for unknown offer {}", req);
                return Ok(());
            }
        };
        match self.load_body(&item) {
            Ok((bytes, node)) => {
                tx.send(&Message::Body {
                    req,
                    hash: *item.hash.as_ref(),
                    bytes,
                    node,
                })
                .await?;
                self.sent.insert(req, item);
            }
            Err(err) => {
                if StoreError::is_connection_closed(&err) {
                    return Err(err);
                }
                let kind = error_kind(&err);
                let text = err.to_string();
                errors.push(format!("{}: {}", kind, text));
                tracing::error!("export of {} failed: {}", item.hash, err);
                tx.send(&Message::Error {
                    req,
                    kind: kind.into(),
                    text,
                })
                .await?;
            }
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn load_body(&self, item: &OfferItem) -> Result<(Vec<u8>, Option<Vec<u8>>)> {
        match item.kind {
            PayloadKind::Blob => Ok((self.tree.store().read_blob(&item.hash)?, None)),
            PayloadKind::Clob => Ok((
                self.tree.store().read_clob(&item.hash)?.into_bytes(),
                None,
            )),
            PayloadKind::IdObject => Ok((self.tree.store().read_object(&item.hash)?, None)),
            PayloadKind::Object => {
                let bytes = self.tree.store().read_object(&item.hash)?;
                let (obj, _) = decode_any(self.tree.registry(), &bytes, &TypeSet::Any)?;
                let node = match self.tree.registry().get(obj.type_name()) {
                    Some(recipe) if recipe.is_versioned() => {
                        let id_bytes = chum_store::id_encode(self.tree.registry(), &obj)?;
                        node_bytes_for(&self.tree, &item.hash, &IdHash::digest(&id_bytes))?
                    }
                    _ => None,
                };
                Ok((bytes, node))
            }
        }
    }

    pub fn handle_not_need(&mut self, req: u64) {
        self.offered.remove(&req);
    }

    pub fn handle_ack(&mut self, req: u64) {
        if let Some(item) = self.sent.remove(&req) {
            self.acked.push(item);
        }
    }

    /// A peer-side item error resolves the request without a transfer.
    pub fn handle_error(&mut self, req: u64) {
        self.offered.remove(&req);
        self.sent.remove(&req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chum_store::{
        ItemType, Obj, Recipe, Registry, ReverseMap, Rule, Store, StorePolicy,
    };
    use std::collections::BTreeSet as TypeNames;

    fn world() -> (tempfile::TempDir, VersionTree) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 0).unwrap();
        let registry = Registry::new(&[Recipe::new(
            "Email",
            vec![
                Rule::new("subject", ItemType::String).id(),
                Rule::new(
                    "to",
                    ItemType::Set(Box::new(ItemType::ReferenceToId(chum_store::TypeSet::Of(
                        vec!["Person".into()],
                    )))),
                ),
            ],
        )])
        .unwrap();
        let obj_types: TypeNames<String> = ["Access".to_string()].into_iter().collect();
        let id_types: TypeNames<String> = ["Access", "IdAccess", "Group", "Chum"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let rmap = ReverseMap::new(store.clone(), obj_types, id_types);
        (dir, VersionTree::new(store, registry, rmap))
    }

    #[async_std::test]
    async fn closure_follows_reference_edges() {
        let (_dir, tree) = world();
        let bob = tree
            .store_object(&Obj::new("Person").set("email", "bob@peers"), StorePolicy::Change)
            .await
            .unwrap()
            .id
            .unwrap();
        let alice = tree
            .store_object(
                &Obj::new("Person").set("email", "alice@peers"),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        let carol = tree
            .store_object(
                &Obj::new("Person").set("email", "carol@peers"),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        let email = tree
            .store_object(
                &Obj::new("Email").set("subject", "hi").set(
                    "to",
                    Value::Set(vec![
                        Value::id_ref(alice.id.unwrap()),
                        Value::id_ref(carol.id.unwrap()),
                    ]),
                ),
                StorePolicy::Change,
            )
            .await
            .unwrap();
        tree.store_no_version(
            &Obj::new("Access")
                .set("object", Value::obj_ref(email.hash))
                .set("person", Value::Set(vec![Value::id_ref(bob)])),
        )
        .unwrap();

        let items = accessible_closure(&tree, &bob, 0, None).unwrap();
        let hashes: Vec<Hash> = items.iter().map(|i| i.hash).collect();
        // the grant, the email, both referenced person payloads
        assert!(hashes.contains(&email.hash));
        assert!(hashes.contains(&alice.hash));
        assert!(hashes.contains(&carol.hash));
        assert!(hashes.contains(&alice.id.unwrap().as_object_hash()));
        assert!(items.len() >= 3);
        // deterministic across runs
        let again = accessible_closure(&tree, &bob, 0, None).unwrap();
        assert_eq!(items, again);
    }

    #[async_std::test]
    async fn closure_is_empty_without_grants() {
        let (_dir, tree) = world();
        let bob = tree
            .store_object(&Obj::new("Person").set("email", "bob@peers"), StorePolicy::Change)
            .await
            .unwrap()
            .id
            .unwrap();
        tree.store_object(
            &Obj::new("Person").set("email", "alice@peers").set("name", "A"),
            StorePolicy::Change,
        )
        .await
        .unwrap();
        assert!(accessible_closure(&tree, &bob, 0, None).unwrap().is_empty());
    }
}
