//! # chum
//!
//! Bidirectional peer-to-peer synchronization for the chum object store.
//! The [`chum_store`] crate owns persistence — canonical encoding, SHA-256
//! addressing, version trees, reverse maps, recipe-driven merges and the
//! authorization view — while this crate owns the instance lifecycle and
//! the Chum protocol: a full-duplex exporter/importer pair over a single
//! reliable message channel that transfers exactly the accessible closure
//! and leaves a signed, byte-identical audit record on both peers.
#![warn(missing_docs)]
mod exporter;
mod importer;
mod keys;
mod proto;
mod session;
mod transport;
mod util;

pub use crate::exporter::{accessible_closure, ExportFilter, Exporter, OfferItem};
pub use crate::importer::Importer;
pub use crate::keys::{Keychain, Keypair};
pub use crate::proto::{Message, PayloadKind};
pub use crate::session::{ChumOptions, ChumReport, ChumSession};
pub use crate::transport::{Channel, FrameReceiver, FrameSender};
pub use crate::util::Ref;
pub use chum_store::{
    AccessKind, AccessResolver, AccessibleItem, CrdtAlgorithm, Hash, IdHash, ItemType, Node, Obj,
    Reason, Recipe, RefKind, Registry, ReverseMap, Rule, Status, Store, StoreError, StoreEvent,
    StorePolicy, Stored, TypeSet, Value, VersionTree,
};

use anyhow::Result;
use chum_store::now_ms;
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Everything `init` needs to bring an instance up.
#[derive(Clone)]
pub struct InstanceOptions {
    /// Instance name; with the owner it identifies the instance.
    pub name: String,
    /// Owner e-mail; the ID of the local `Person`.
    pub email: String,
    /// Secret unlocking the keychain. Mandatory when `encrypt` is set.
    pub secret: Option<String>,
    /// Parent directory holding per-instance storage directories.
    pub directory: PathBuf,
    /// Recipes registered at creation, next to the built-in core set.
    pub recipes: Vec<Recipe>,
    /// Referring types indexed for object references, frozen at creation.
    pub object_rmap_types: BTreeSet<String>,
    /// Referring types indexed for ID references, frozen at creation.
    pub id_rmap_types: BTreeSet<String>,
    /// Hash-prefix chars for payload subdirectory sharding, 0 disables.
    pub shard: usize,
    /// Seal the keychain file with a secret-derived key.
    pub encrypt: bool,
}

impl InstanceOptions {
    /// Options with the default reverse-map configuration.
    pub fn new(name: &str, email: &str, directory: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            secret: None,
            directory: directory.into(),
            recipes: Vec::new(),
            object_rmap_types: ["Access"].iter().map(|s| s.to_string()).collect(),
            id_rmap_types: ["Access", "IdAccess", "Group", "Chum"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            shard: 0,
            encrypt: false,
        }
    }

    /// Adds a recipe to register at creation.
    pub fn recipe(mut self, recipe: Recipe) -> Self {
        self.recipes.push(recipe);
        self
    }

    /// Sets the keychain secret.
    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.into());
        self
    }

    /// Requests a sealed keychain.
    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }
}

// one instance per process; `init` and `close` bracket it
static ACTIVE: Mutex<Option<IdHash>> = parking_lot::const_mutex(None);

fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_span_events(FmtSpan::CLOSE)
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

/// A running storage instance: the store, its registry and the local
/// identity, brought up by [`Instance::init`] and released by
/// [`Instance::close`].
pub struct Instance {
    tree: VersionTree,
    keychain: Keychain,
    person: IdHash,
    instance_id: IdHash,
    name: String,
    email: String,
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("person", &self.person)
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("email", &self.email)
            .finish()
    }
}

impl Instance {
    /// Initializes the process-wide instance. Fails with
    /// `already-initialized` while another one is active and with
    /// `invalid-secret` when encryption is requested without a secret.
    pub fn init(opts: InstanceOptions) -> Result<Instance> {
        let instance_id = Self::id_hash(&opts.name, &opts.email)?;
        {
            let mut active = ACTIVE.lock();
            if active.is_some() {
                return Err(StoreError::AlreadyInitialized.into());
            }
            *active = Some(instance_id);
        }
        match Self::open(opts, instance_id) {
            Ok(instance) => Ok(instance),
            Err(err) => {
                *ACTIVE.lock() = None;
                Err(err)
            }
        }
    }

    fn open(opts: InstanceOptions, instance_id: IdHash) -> Result<Instance> {
        init_tracing();
        let dir = opts.directory.join(instance_id.to_string());
        std::fs::create_dir_all(&dir)?;
        let store = Store::open(&dir, opts.shard)?;
        let registry = Registry::new(&opts.recipes)?;
        let rmap = ReverseMap::new(
            store.clone(),
            opts.object_rmap_types.clone(),
            opts.id_rmap_types.clone(),
        );
        let tree = VersionTree::new(store, registry.clone(), rmap);
        let keychain = Keychain::unlock(&dir, opts.secret.as_deref(), opts.encrypt)?;

        // recipes are versioned objects like everything else
        for name in registry.names() {
            if let Some(recipe) = registry.get(&name) {
                futures::executor::block_on(
                    tree.store_object(&recipe.to_obj(), StorePolicy::Change),
                )?;
            }
        }
        let person = futures::executor::block_on(tree.store_object(
            &Obj::new("Person").set("email", opts.email.as_str()),
            StorePolicy::Change,
        ))?;
        let person = person.id.expect("person recipe is versioned");
        let instance = Obj::new("Instance")
            .set("name", opts.name.as_str())
            .set("owner", Value::id_ref(person))
            .set("publicKey", keychain.keypair().public_hex());
        futures::executor::block_on(tree.store_object(&instance, StorePolicy::Change))?;
        tracing::debug!("instance {} up at {}", instance_id, dir.display());
        Ok(Instance {
            tree,
            keychain,
            person,
            instance_id,
            name: opts.name,
            email: opts.email,
        })
    }

    /// Deterministic instance ID-hash from name and owner e-mail.
    pub fn id_hash(name: &str, email: &str) -> Result<IdHash> {
        let registry = Registry::new(&[])?;
        let person = Obj::new("Person").set("email", email);
        let person_id = IdHash::digest(&chum_store::id_encode(&registry, &person)?);
        let instance = Obj::new("Instance")
            .set("name", name)
            .set("owner", Value::id_ref(person_id));
        Ok(IdHash::digest(&chum_store::id_encode(&registry, &instance)?))
    }

    /// Whether an instance directory exists under `directory`.
    pub fn exists(name: &str, email: &str, directory: &Path) -> Result<bool> {
        Ok(directory
            .join(Self::id_hash(name, email)?.to_string())
            .is_dir())
    }

    /// Removes an instance's storage. Refused while that instance is active.
    pub fn delete(name: &str, email: &str, directory: &Path) -> Result<()> {
        let id = Self::id_hash(name, email)?;
        if *ACTIVE.lock() == Some(id) {
            return Err(StoreError::InvalidState("instance is active".into()).into());
        }
        let dir = directory.join(id.to_string());
        if dir.is_dir() {
            std::fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Releases the process-wide slot; a later `init` may follow.
    pub fn close(self) {
        tracing::debug!("instance {} closed", self.instance_id);
        *ACTIVE.lock() = None;
    }

    /// The write pipeline.
    pub fn tree(&self) -> &VersionTree {
        &self.tree
    }

    /// The underlying file store.
    pub fn store(&self) -> &Store {
        self.tree.store()
    }

    /// The recipe registry.
    pub fn registry(&self) -> &Registry {
        self.tree.registry()
    }

    /// Registers and persists a recipe at runtime. The reverse-map type
    /// sets stay frozen regardless.
    pub async fn register_recipe(&self, recipe: Recipe) -> Result<()> {
        let recipe = self.tree.registry().register(recipe)?;
        self.tree
            .store_object(&recipe.to_obj(), StorePolicy::Change)
            .await?;
        Ok(())
    }

    /// ID-hash of the local person.
    pub fn person(&self) -> IdHash {
        self.person
    }

    /// ID-hash of this instance.
    pub fn instance_id(&self) -> IdHash {
        self.instance_id
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner e-mail.
    pub fn email(&self) -> &str {
        &self.email
    }

    /// The unlocked instance keypair.
    pub fn keypair(&self) -> Keypair {
        self.keychain.keypair()
    }

    /// Subscribes to store events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        self.tree.store().events().subscribe()
    }

    /// Stores a versioned object as a local edit.
    pub async fn store_versioned(&self, obj: &Obj) -> Result<Stored> {
        self.tree.store_object(obj, StorePolicy::Change).await
    }

    /// Stores an unversioned object without touching any head.
    pub fn store_unversioned(&self, obj: &Obj) -> Result<Stored> {
        self.tree.store_no_version(obj)
    }

    /// Chum audit records involving the local person.
    pub fn chums(&self) -> Result<Vec<Hash>> {
        Ok(self
            .tree
            .rmap()
            .latest_id(&self.person, "Chum", &self.tree)?
            .into_iter()
            .map(|entry| entry.referrer)
            .collect())
    }

    /// A session ready to run over a channel.
    pub fn chum_session(&self, opts: ChumOptions) -> ChumSession {
        ChumSession::new(
            self.tree.clone(),
            self.keychain.keypair(),
            self.person,
            self.name.clone(),
            opts,
        )
    }

    /// Timestamp helper matching the store's clock.
    pub fn now(&self) -> i64 {
        now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // one test owns every init/close so the process-wide slot never races
    #[async_std::test]
    async fn instance_lifecycle_is_a_singleton() {
        let dir = tempfile::tempdir().unwrap();
        let opts = InstanceOptions::new("one", "a@b", dir.path());
        let instance = Instance::init(opts.clone()).unwrap();
        assert!(Instance::exists("one", "a@b", dir.path()).unwrap());

        let err = Instance::init(opts.clone()).unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::AlreadyInitialized)
        ));
        let err = Instance::delete("one", "a@b", dir.path()).unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::InvalidState(_))
        ));

        // the local identity objects are in place
        let person = instance.person();
        assert!(instance.store().exists(&person.as_object_hash()));

        // versioned writes through the instance surface
        let v1 = instance
            .store_versioned(&Obj::new("Person").set("email", "x@y").set("name", "X"))
            .await
            .unwrap();
        let v2 = instance
            .store_versioned(&Obj::new("Person").set("email", "x@y").set("name", "Y"))
            .await
            .unwrap();
        assert_eq!(v1.id, v2.id);
        assert_eq!(instance.tree().head(&v1.id.unwrap()).unwrap(), v2.node);

        instance.close();
        let instance = Instance::init(opts).unwrap();
        instance.close();
        Instance::delete("one", "a@b", dir.path()).unwrap();
        assert!(!Instance::exists("one", "a@b", dir.path()).unwrap());

        // encryption without a secret is refused, and the failed init
        // releases the slot
        let err =
            Instance::init(InstanceOptions::new("two", "b@c", dir.path()).encrypted()).unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::InvalidSecret)
        ));
        let sealed = Instance::init(
            InstanceOptions::new("two", "b@c", dir.path())
                .encrypted()
                .secret("hunter2"),
        )
        .unwrap();
        sealed.close();
    }

    #[test]
    fn instance_id_hash_is_deterministic() {
        let a = Instance::id_hash("one", "a@b").unwrap();
        let b = Instance::id_hash("one", "a@b").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Instance::id_hash("two", "a@b").unwrap());
        assert_ne!(a, Instance::id_hash("one", "x@y").unwrap());
    }
}
