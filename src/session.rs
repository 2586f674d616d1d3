//! Chum session: both protocol roles on one channel.
//!
//! A session runs the exporter and importer concurrently in a single
//! cooperative loop, keeps the eight transfer accumulators, and on the way
//! out writes the `Chum` audit object. The two peer identities are ordered
//! lexicographically by their `(instance, person)` tuple, and timestamps
//! and error strings travel inside the protocol, so both peers construct
//! byte-identical `Chum` records.

use crate::exporter::{Exporter, ExportFilter, OfferItem};
use crate::importer::Importer;
use crate::keys::Keypair;
use crate::proto::{ArchivedMessage, Message, PayloadKind};
use crate::transport::Channel;
use crate::util::Ref;
use anyhow::{anyhow, Result};
use chum_store::{
    now_ms, Hash, IdHash, Obj, StoreError, StorePolicy, Stored, Value, VersionTree,
};
use futures::channel::oneshot;
use futures::{pin_mut, FutureExt, StreamExt};
use futures_timer::Delay;
use std::time::Duration;

/// Session configuration.
#[derive(Clone)]
pub struct ChumOptions {
    /// Chum name; peers must agree on it for the audit record to converge.
    pub name: String,
    /// Keep exporting new and newly accessible hashes after the initial
    /// closure drains.
    pub live: bool,
    /// Live-mode reconciliation sweep interval.
    pub poll_interval: Duration,
    /// Only offer accessibility discovered since this timestamp. Zero means
    /// everything.
    pub since: i64,
    /// Policy hook gating exported items.
    pub filter: Option<ExportFilter>,
}

impl Default for ChumOptions {
    fn default() -> Self {
        Self {
            name: "chum".into(),
            live: false,
            poll_interval: Duration::from_secs(3),
            since: 0,
            filter: None,
        }
    }
}

/// What a finished session reports back.
#[derive(Debug)]
pub struct ChumReport {
    /// The written audit record, absent only when nothing at all happened.
    pub chum: Option<Stored>,
    pub sent: Vec<OfferItem>,
    pub received: Vec<OfferItem>,
    pub errors: Vec<String>,
    pub full_sync: bool,
}

pub struct ChumSession {
    tree: VersionTree,
    keys: Keypair,
    person: IdHash,
    instance: String,
    opts: ChumOptions,
}

impl ChumSession {
    pub fn new(
        tree: VersionTree,
        keys: Keypair,
        person: IdHash,
        instance: impl Into<String>,
        opts: ChumOptions,
    ) -> Self {
        Self {
            tree,
            keys,
            person,
            instance: instance.into(),
            opts,
        }
    }

    /// Runs the session until the exchange completes (or, in live mode,
    /// until `stop` fires or the peer winds down).
    pub async fn run(
        self,
        channel: Channel,
        stop: Option<oneshot::Receiver<()>>,
    ) -> Result<ChumReport> {
        let (mut tx, mut rx) = channel.split();

        // subscribe before computing the closure so no write between the
        // two can be missed in live mode
        let mut events = self.tree.store().events().subscribe();

        let local_hello_ts = now_ms();
        tx.send(&Message::Hello {
            person: *self.person.as_ref(),
            instance: self.instance.clone(),
            since: self.opts.since,
            ts: local_hello_ts,
        })
        .await?;
        let (peer_person, peer_instance, peer_since, peer_hello_ts) = match rx.recv().await? {
            Some(frame) => match frame.as_ref() {
                ArchivedMessage::Hello {
                    person,
                    instance,
                    since,
                    ts,
                } => (
                    IdHash::new(*person),
                    instance.as_str().to_string(),
                    *since,
                    *ts,
                ),
                _ => return Err(anyhow!("protocol violation: expected hello")),
            },
            None => return Err(StoreError::ConnectionClosed.into()),
        };
        tracing::debug!("chum with {} ({})", peer_instance, peer_person);

        let mut exporter = Exporter::new(
            self.tree.clone(),
            peer_person,
            peer_since,
            self.opts.filter.clone(),
        )?;
        let mut importer = Importer::new(self.tree.clone());
        let mut errors: Vec<String> = Vec::new();
        let mut local_done_ts: Option<i64> = None;
        let mut peer_done_ts: Option<i64> = None;
        let mut closing = !self.opts.live;
        let mut close_sent = false;
        let mut connection_lost = false;

        let stop = async move {
            match stop {
                Some(rx) => {
                    rx.await.ok();
                }
                None => futures::future::pending::<()>().await,
            }
        }
        .fuse();
        pin_mut!(stop);
        let mut sweep = Delay::new(self.opts.poll_interval).fuse();

        loop {
            if exporter.fill(&mut tx).await.is_err() {
                connection_lost = true;
                break;
            }
            if exporter.full_sync_reached() && !exporter.done_sent() {
                let ts = now_ms();
                if tx.send(&Message::Done { ts }).await.is_err() {
                    connection_lost = true;
                    break;
                }
                exporter.mark_done_sent();
                local_done_ts = Some(ts);
                tracing::debug!("full sync reached, done sent");
            }
            let drained = local_done_ts.is_some()
                && peer_done_ts.is_some()
                && exporter.idle()
                && importer.idle();
            if drained && closing {
                if self.opts.live && !close_sent {
                    tx.send(&Message::Close).await.ok();
                }
                break;
            }

            let recv = rx.recv().fuse();
            pin_mut!(recv);
            futures::select! {
                frame = recv => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => {
                            // a hangup is graceful only after a full drain
                            let drained = closing
                                && local_done_ts.is_some()
                                && peer_done_ts.is_some()
                                && exporter.idle()
                                && importer.idle();
                            if !drained {
                                connection_lost = true;
                            }
                            break;
                        }
                        Err(err) => {
                            errors.push(format!("decode-error: {}", err));
                            break;
                        }
                    };
                    if self
                        .dispatch(frame, &mut tx, &mut exporter, &mut importer,
                                  &mut errors, &mut peer_done_ts, &mut closing)
                        .await
                        .is_err()
                    {
                        connection_lost = true;
                        break;
                    }
                    if importer.first_sync_reached() {
                        tracing::debug!("initial import drained");
                    }
                }
                event = events.next() => {
                    let _ = event;
                    if self.opts.live && !closing {
                        if let Err(err) = exporter.reconcile() {
                            tracing::error!("live reconcile failed: {}", err);
                        }
                    }
                }
                _ = sweep => {
                    sweep = Delay::new(self.opts.poll_interval).fuse();
                    if self.opts.live && !closing {
                        if let Err(err) = exporter.reconcile() {
                            tracing::error!("live reconcile failed: {}", err);
                        }
                    }
                }
                _ = stop => {
                    closing = true;
                    close_sent = true;
                    if tx.send(&Message::Close).await.is_err() {
                        connection_lost = true;
                        break;
                    }
                }
            }
        }

        let full_sync = local_done_ts.is_some() && peer_done_ts.is_some();
        let sent = exporter.acked().to_vec();
        let received = importer.received().to_vec();
        let transferred = !sent.is_empty() || !received.is_empty();
        errors.sort();
        errors.dedup();

        if !transferred {
            if connection_lost && errors.is_empty() {
                return Err(StoreError::ConnectionClosed.into());
            }
            if let Some(first) = errors.first() {
                return Err(anyhow!("chum failed without transfers: {}", first));
            }
        }

        let first_ts = local_hello_ts.min(peer_hello_ts);
        let last_ts = local_done_ts
            .unwrap_or(first_ts)
            .max(peer_done_ts.unwrap_or(first_ts));
        let record = self.build_record(
            (self.instance.as_str(), self.person),
            (peer_instance.as_str(), peer_person),
            &sent,
            &received,
            &errors,
            first_ts,
            last_ts,
        );
        let stored = self.tree.store_object(&record, StorePolicy::Merge).await?;
        self.sign_record(&stored)?;
        tracing::debug!(
            "chum {} written: {} sent, {} received, {} errors",
            stored.hash,
            sent.len(),
            received.len(),
            errors.len()
        );
        Ok(ChumReport {
            chum: Some(stored),
            sent,
            received,
            errors,
            full_sync,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        frame: Ref<Message>,
        tx: &mut crate::transport::FrameSender,
        exporter: &mut Exporter,
        importer: &mut Importer,
        errors: &mut Vec<String>,
        peer_done_ts: &mut Option<i64>,
        closing: &mut bool,
    ) -> Result<()> {
        match frame.as_ref() {
            ArchivedMessage::Offer {
                req,
                hash,
                kind,
                type_name,
            } => {
                importer
                    .handle_offer(*req, Hash::new(*hash), (*kind).into(), type_name.as_str(), tx)
                    .await?;
            }
            ArchivedMessage::Need { req } => {
                exporter.handle_need(*req, tx, errors).await?;
            }
            ArchivedMessage::NotNeed { req } => {
                exporter.handle_not_need(*req);
            }
            ArchivedMessage::Body {
                req,
                hash,
                bytes,
                node,
            } => {
                importer
                    .handle_body(
                        *req,
                        Hash::new(*hash),
                        bytes.as_slice(),
                        node.as_ref().map(|n| n.as_slice()),
                        tx,
                        errors,
                    )
                    .await?;
            }
            ArchivedMessage::Ack { req, hash: _ } => {
                exporter.handle_ack(*req);
            }
            ArchivedMessage::Done { ts } => {
                *peer_done_ts = Some(*ts);
                importer.set_peer_done();
            }
            ArchivedMessage::Error { req, kind, text } => {
                // both peers record the same string for the same failure
                errors.push(format!("{}: {}", kind, text));
                exporter.handle_error(*req);
            }
            ArchivedMessage::Close => {
                *closing = true;
            }
            ArchivedMessage::Hello { .. } => {
                tracing::debug!("unexpected hello mid-session");
            }
        }
        Ok(())
    }

    /// The audit record; identical bytes on both peers.
    #[allow(clippy::too_many_arguments)]
    fn build_record(
        &self,
        local: (&str, IdHash),
        peer: (&str, IdHash),
        sent: &[OfferItem],
        received: &[OfferItem],
        errors: &[String],
        first_ts: i64,
        last_ts: i64,
    ) -> Obj {
        let local_tuple = (local.0.to_string(), local.1.to_string());
        let peer_tuple = (peer.0.to_string(), peer.1.to_string());
        let local_is_a = local_tuple <= peer_tuple;
        let (a, b) = if local_is_a {
            (local, peer)
        } else {
            (peer, local)
        };
        let mut record = Obj::new("Chum")
            .set("name", self.opts.name.as_str())
            .set("instanceA", a.0)
            .set("instanceB", b.0)
            .set("personA", Value::id_ref(a.1))
            .set("personB", Value::id_ref(b.1))
            .set("firstTimestamp", first_ts)
            .set("lastTimestamp", last_ts);
        let (a_to_b, b_to_a) = if local_is_a {
            (sent, received)
        } else {
            (received, sent)
        };
        for (prefix, items) in [("AtoB", a_to_b), ("BtoA", b_to_a)] {
            for (suffix, kind) in [
                ("Objects", PayloadKind::Object),
                ("IdObjects", PayloadKind::IdObject),
                ("Blob", PayloadKind::Blob),
                ("Clob", PayloadKind::Clob),
            ] {
                let bucket: Vec<Value> = items
                    .iter()
                    .filter(|item| item.kind == kind)
                    .map(|item| match kind {
                        PayloadKind::Object => Value::obj_ref(item.hash),
                        PayloadKind::IdObject => Value::id_ref(IdHash::new(*item.hash.as_ref())),
                        PayloadKind::Blob => Value::blob_ref(item.hash),
                        PayloadKind::Clob => Value::clob_ref(item.hash),
                    })
                    .collect();
                if !bucket.is_empty() {
                    record.insert(&format!("{}{}", prefix, suffix), Value::Set(bucket));
                }
            }
        }
        if !errors.is_empty() {
            record.insert(
                "errors",
                Value::Seq(errors.iter().map(|e| Value::from(e.as_str())).collect()),
            );
        }
        record
    }

    /// Detached signature over the audit record, one per peer.
    fn sign_record(&self, stored: &Stored) -> Result<()> {
        let bytes = self.tree.store().read_object(&stored.hash)?;
        let sig = self.keys.sign(&bytes);
        self.tree.store_no_version(
            &Obj::new("Signature")
                .set("object", Value::obj_ref(stored.hash))
                .set("signer", Value::id_ref(self.person))
                .set("signature", hex::encode(sig)),
        )?;
        Ok(())
    }
}
