//! # The chum object store
//!
//! A content-addressed, cryptographically anchored object store with a
//! version tree per identity, reverse-index maintenance and recipe-driven
//! merges. This crate is the storage core; the `chum` crate layers the
//! peer-to-peer synchronization protocol on top of it.
//!
//! ## Canonical encoding and addressing
//! Every object is persisted in a canonical textual form: fields in recipe
//! rule order, unordered collections sorted by their encoded bytes, strings
//! escaped for `<`, `>` and `&`, never any incidental whitespace. The
//! SHA-256 of those bytes is the object's address and its file name, so
//! every stored file self-certifies: re-hashing the bytes yields the name.
//!
//! A versioned type designates a subset of its rules as ID rules. The ID
//! projection is encoded with the same pass restricted to those rules,
//! wrapped in a frame carrying an `id` attribute; its digest is the ID-hash
//! shared by all versions of the object. The attribute makes the two
//! address spaces disjoint by construction.
//!
//! ## Version tree
//! Each ID-hash owns a DAG of version nodes: an `Edge` roots a history, a
//! `Change` extends it, a `Merge` joins concurrent branches. Nodes are
//! ordinary objects of built-in types and flow through the same encoder and
//! store as payloads. The current head of each ID is a pointer file written
//! with atomic rename. Merging two candidate heads is deterministic: equal
//! heads collapse, a subsumed head advances, and otherwise the payloads are
//! merged field by field per the recipe's crdt config and a `Merge` node
//! with hash-sorted parents is created. Two peers merging the same inputs
//! produce the same node hash.
//!
//! ## Reverse index
//! For referring types enabled at instance creation, each write appends
//! `(referrer, status, timestamp)` entries keyed by `(target, type)`, for
//! object references and ID references separately. The latest-only
//! projection keeps versioned referrers only while they are their ID's
//! current head; authorization resolution runs on that view.
//!
//! ## Authorization
//! `Access` grants name a version hash, `IdAccess` grants an ID-hash and
//! with it the whole head-reachable node closure. Both list persons and
//! groups; group membership mediates grants one level deep. The resolver
//! returns the deduplicated accessible set together with the reason each
//! item is included.
//!
//! ## Concurrency
//! Head-mutating operations serialize per ID-hash through a string-keyed
//! FIFO lock; unrelated IDs proceed in parallel. Store events (object
//! written, ID object written, head advanced) fan out over explicit
//! subscriber channels owned by the store.
#![warn(missing_docs)]
mod access;
mod canonical;
mod crdt;
mod error;
mod hash;
mod lock;
mod object;
#[cfg(test)]
mod props;
mod recipe;
mod rmap;
mod store;
mod util;
mod version;

pub use crate::access::{AccessFilter, AccessKind, AccessResolver, AccessibleItem, Reason};
pub use crate::canonical::{decode, decode_any, encode, encode_with_id, id_encode, Encoded};
pub use crate::crdt::{merge_objects, MergeCtx, MergeStore};
pub use crate::error::StoreError;
pub use crate::hash::{Hash, IdHash};
pub use crate::lock::{KeyedGuard, KeyedLock};
pub use crate::object::{Obj, RefKind, Value};
pub use crate::recipe::{
    core_recipes, CrdtAlgorithm, ItemType, Recipe, Registry, Rule, TypeSet,
};
pub use crate::rmap::{HeadSource, ReverseMap, RmapEntry};
pub use crate::store::{Events, Status, Store, StoreEvent};
pub use crate::util::now_ms;
pub use crate::version::{Node, StorePolicy, Stored, VersionTree};
