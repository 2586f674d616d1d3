//! Chum importer: admits offers, verifies bodies, persists.
//!
//! Every arriving body is re-hashed against its advertised address before it
//! touches the store. Versioned objects run through the version tree's
//! merge policy with the peer's node bytes; everything else is a direct
//! idempotent write. Item failures are reported to the peer and recorded,
//! never fatal to the session.

use crate::exporter::OfferItem;
use crate::proto::{Message, PayloadKind};
use crate::transport::FrameSender;
use crate::util::error_kind;
use anyhow::Result;
use chum_store::{Hash, StoreError, VersionTree};
use fnv::FnvHashMap;

pub struct Importer {
    tree: VersionTree,
    /// needs sent, awaiting bodies
    requested: FnvHashMap<u64, OfferItem>,
    /// verified and persisted
    received: Vec<OfferItem>,
    peer_done: bool,
    first_sync: bool,
}

impl Importer {
    pub fn new(tree: VersionTree) -> Self {
        Self {
            tree,
            requested: FnvHashMap::default(),
            received: Vec::new(),
            peer_done: false,
            first_sync: false,
        }
    }

    pub fn received(&self) -> &[OfferItem] {
        &self.received
    }

    pub fn idle(&self) -> bool {
        self.requested.is_empty()
    }

    pub fn peer_done(&self) -> bool {
        self.peer_done
    }

    pub fn set_peer_done(&mut self) {
        self.peer_done = true;
    }

    /// True exactly once, when the initially requested set has drained.
    pub fn first_sync_reached(&mut self) -> bool {
        if !self.first_sync && self.peer_done && self.requested.is_empty() {
            self.first_sync = true;
            return true;
        }
        false
    }

    /// Answers an offer: request the body for unknown hashes only.
    pub async fn handle_offer(
        &mut self,
        req: u64,
        hash: Hash,
        kind: PayloadKind,
        type_name: &str,
        tx: &mut FrameSender,
    ) -> Result<()> {
        let have = match kind {
            PayloadKind::Object | PayloadKind::IdObject => self.tree.store().exists(&hash),
            PayloadKind::Blob => self.tree.store().blob_exists(&hash),
            PayloadKind::Clob => self.tree.store().clob_exists(&hash),
        };
        if have {
            tx.send(&Message::NotNeed { req }).await?;
        } else {
            self.requested.insert(
                req,
                OfferItem {
                    hash,
                    kind,
                    type_name: type_name.into(),
                },
            );
            tx.send(&Message::Need { req }).await?;
        }
        Ok(())
    }

    /// Verifies and persists a body, acknowledging on success.
    pub async fn handle_body(
        &mut self,
        req: u64,
        hash: Hash,
        bytes: &[u8],
        node: Option<&[u8]>,
        tx: &mut FrameSender,
        errors: &mut Vec<String>,
    ) -> Result<()> {
        let item = match self.requested.remove(&req) {
            Some(item) => item,
            None => {
                tracing::debug!("body for unknown request {}", req);
                return Ok(());
            }
        };
        match self.persist(&item, hash, bytes, node).await {
            Ok(()) => {
                tx.send(&Message::Ack {
                    req,
                    hash: *hash.as_ref(),
                })
                .await?;
                self.received.push(item);
            }
            Err(err) => {
                if StoreError::is_connection_closed(&err) {
                    return Err(err);
                }
                let kind = error_kind(&err);
                let text = err.to_string();
                errors.push(format!("{}: {}", kind, text));
                tracing::error!("import of {} failed: {}", item.hash, err);
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

    async fn persist(
        &self,
        item: &OfferItem,
        hash: Hash,
        bytes: &[u8],
        node: Option<&[u8]>,
    ) -> Result<()> {
        let actual = Hash::digest(bytes);
        if actual != item.hash || actual != hash {
            return Err(StoreError::HashMismatch {
                expected: item.hash.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        match item.kind {
            PayloadKind::Blob => {
                self.tree.store().write_blob(bytes)?;
            }
            PayloadKind::Clob => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|_| StoreError::Decode("clob is not utf-8".into()))?;
                self.tree.store().write_clob(text)?;
            }
            PayloadKind::Object | PayloadKind::IdObject => {
                self.tree.store_remote(bytes, node).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Channel;
    use crate::proto::ArchivedMessage;
    use chum_store::{Obj, Registry, ReverseMap, Store, Value};
    use std::collections::BTreeSet;

    fn world() -> (tempfile::TempDir, VersionTree) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 0).unwrap();
        let registry = Registry::new(&[]).unwrap();
        let rmap = ReverseMap::new(store.clone(), BTreeSet::new(), BTreeSet::new());
        (dir, VersionTree::new(store, registry, rmap))
    }

    #[async_std::test]
    async fn known_hashes_are_not_requested() {
        let (_dir, tree) = world();
        let stored = tree
            .store_no_version(&Obj::new("Access").set("object", Value::obj_ref(Hash::digest(b"t"))))
            .unwrap();
        let mut importer = Importer::new(tree);
        let (a, b) = Channel::pair(4);
        let (mut tx, _) = a.split();
        let (_, mut rx) = b.split();
        importer
            .handle_offer(1, stored.hash, PayloadKind::Object, "Access", &mut tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap().unwrap().as_ref() {
            ArchivedMessage::NotNeed { req } => assert_eq!(*req, 1),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(importer.idle());
    }

    #[async_std::test]
    async fn corrupt_bodies_become_item_errors() {
        let (_dir, tree) = world();
        let mut importer = Importer::new(tree.clone());
        let (a, b) = Channel::pair(4);
        let (mut tx, _) = a.split();
        let (_, mut rx) = b.split();
        let advertised = Hash::digest(b"the real bytes");
        importer
            .handle_offer(9, advertised, PayloadKind::Blob, "Blob", &mut tx)
            .await
            .unwrap();
        match rx.recv().await.unwrap().unwrap().as_ref() {
            ArchivedMessage::Need { req } => assert_eq!(*req, 9),
            other => panic!("unexpected frame {:?}", other),
        }
        let mut errors = Vec::new();
        importer
            .handle_body(9, advertised, b"other bytes", None, &mut tx, &mut errors)
            .await
            .unwrap();
        match rx.recv().await.unwrap().unwrap().as_ref() {
            ArchivedMessage::Error { req, kind, .. } => {
                assert_eq!(*req, 9);
                assert_eq!(kind.as_str(), "hash-mismatch");
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(errors.len(), 1);
        assert!(importer.received().is_empty());
        assert!(!tree.store().blob_exists(&advertised));
    }
}
