//! The transport seam: one reliable, ordered, full-duplex frame pipe.
//!
//! Anything that moves whole frames in order can back a chum session; the
//! in-process pair below is what tests and local replication use. Wire
//! framing beyond this (sockets, relays) lives outside this crate.

use crate::proto::Message;
use crate::util::Ref;
use anyhow::Result;
use chum_store::StoreError;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};

/// Sending half; frame order is preserved end to end.
pub struct FrameSender(mpsc::Sender<Vec<u8>>);

impl FrameSender {
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        self.0
            .send(Ref::archive(msg).into_bytes())
            .await
            .map_err(|_| StoreError::ConnectionClosed.into())
    }
}

/// Receiving half.
pub struct FrameReceiver(mpsc::Receiver<Vec<u8>>);

impl FrameReceiver {
    /// Next validated frame; `None` once the peer hung up.
    pub async fn recv(&mut self) -> Result<Option<Ref<Message>>> {
        match self.0.next().await {
            Some(frame) => Ok(Some(Ref::checked(&frame)?)),
            None => Ok(None),
        }
    }
}

/// A bidirectional channel endpoint.
pub struct Channel {
    tx: FrameSender,
    rx: FrameReceiver,
}

impl Channel {
    /// Two connected endpoints with a bounded frame window in each
    /// direction; the bound is what back-pressures the exporter.
    pub fn pair(capacity: usize) -> (Channel, Channel) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Channel {
                tx: FrameSender(a_tx),
                rx: FrameReceiver(a_rx),
            },
            Channel {
                tx: FrameSender(b_tx),
                rx: FrameReceiver(b_rx),
            },
        )
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.tx, self.rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn frames_cross_in_both_directions() {
        let (a, b) = Channel::pair(4);
        let (mut a_tx, _a_rx) = a.split();
        let (mut b_tx, mut b_rx) = b.split();
        a_tx.send(&Message::Done { ts: 7 }).await.unwrap();
        match b_rx.recv().await.unwrap().unwrap().as_ref() {
            crate::proto::ArchivedMessage::Done { ts } => assert_eq!(*ts, 7),
            other => panic!("unexpected frame {:?}", other),
        }
        b_tx.send(&Message::Close).await.unwrap();
    }

    #[async_std::test]
    async fn hangup_surfaces_as_connection_closed() {
        let (a, b) = Channel::pair(4);
        drop(b);
        let (mut a_tx, mut a_rx) = a.split();
        let err = a_tx.send(&Message::Close).await.unwrap_err();
        assert!(StoreError::is_connection_closed(&err));
        assert!(a_rx.recv().await.unwrap().is_none());
    }
}
