//! Chum wire protocol.
//!
//! One reliable, ordered, full-duplex frame channel carries these messages
//! in both directions. Request ids are allocated by the offering side and
//! echoed by every response that resolves the offer; both peers run an
//! exporter and an importer concurrently over the same channel.

use bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};

/// What an offered hash addresses.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Clone, Copy, Debug, Eq, PartialEq, CheckBytes))]
#[repr(C)]
pub enum PayloadKind {
    Object,
    IdObject,
    Blob,
    Clob,
}

#[derive(Debug, Archive, Deserialize, Serialize)]
#[archive_attr(derive(Debug, CheckBytes))]
#[repr(C)]
pub enum Message {
    /// Handshake; first frame in each direction.
    Hello {
        person: [u8; 32],
        instance: String,
        since: i64,
        ts: i64,
    },
    /// The exporter announces a transferable hash.
    Offer {
        req: u64,
        hash: [u8; 32],
        kind: PayloadKind,
        type_name: String,
    },
    /// The importer wants the body for a prior offer.
    Need { req: u64 },
    /// The importer already holds the offered payload.
    NotNeed { req: u64 },
    /// Payload bytes; versioned objects carry their version node alongside.
    Body {
        req: u64,
        hash: [u8; 32],
        bytes: Vec<u8>,
        node: Option<Vec<u8>>,
    },
    /// The body was verified and persisted.
    Ack { req: u64, hash: [u8; 32] },
    /// The initial closure is drained and every sent body acknowledged.
    Done { ts: i64 },
    /// Per-item failure; resolves the request without a transfer.
    Error {
        req: u64,
        kind: String,
        text: String,
    },
    /// Wind down a live session.
    Close,
}

impl From<ArchivedPayloadKind> for PayloadKind {
    fn from(kind: ArchivedPayloadKind) -> Self {
        match kind {
            ArchivedPayloadKind::Object => Self::Object,
            ArchivedPayloadKind::IdObject => Self::IdObject,
            ArchivedPayloadKind::Blob => Self::Blob,
            ArchivedPayloadKind::Clob => Self::Clob,
        }
    }
}
