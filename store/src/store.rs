use crate::error::StoreError;
use crate::hash::{Hash, IdHash};
use crate::lock::KeyedLock;
use anyhow::{Context, Result};
use futures::channel::mpsc;
use parking_lot::Mutex;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Outcome of an idempotent write.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Status {
    New,
    Exists,
}

impl Status {
    pub fn tag(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Exists => "exists",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "new" => Some(Self::New),
            "exists" => Some(Self::Exists),
            _ => None,
        }
    }
}

/// Store notifications, delivered in write order per ID.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    ObjectWritten {
        hash: Hash,
        type_name: String,
        status: Status,
    },
    IdObjectWritten {
        id: IdHash,
        type_name: String,
        status: Status,
    },
    HeadAdvanced {
        id: IdHash,
        node: Hash,
    },
}

/// Explicit observer list; dead subscribers are pruned on emit.
#[derive(Clone, Default)]
pub struct Events {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>>,
}

impl Events {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: StoreEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }
}

struct Inner {
    root: PathBuf,
    /// hex chars of subdirectory sharding for payload dirs, 0 disables
    shard: usize,
    events: Events,
    locks: KeyedLock,
}

/// Hash-named file store.
///
/// Layout under the instance directory: `objects/`, `blobs/`, `clobs/`,
/// `vheads/`, `rmaps/`, `rmaps-id/`. Every payload file satisfies
/// `sha256(bytes) == name`.
#[derive(Clone)]
pub struct Store(Arc<Inner>);

impl Store {
    /// Opens (creating if needed) a store rooted at `root`. The shard width
    /// is frozen at creation.
    pub fn open(root: impl Into<PathBuf>, shard: usize) -> Result<Self> {
        let root = root.into();
        for dir in ["objects", "blobs", "clobs", "vheads", "rmaps", "rmaps-id"] {
            fs::create_dir_all(root.join(dir))
                .with_context(|| format!("creating {}", root.join(dir).display()))?;
        }
        Ok(Self(Arc::new(Inner {
            root,
            shard,
            events: Events::default(),
            locks: KeyedLock::new(),
        })))
    }

    pub fn root(&self) -> &Path {
        &self.0.root
    }

    pub fn events(&self) -> &Events {
        &self.0.events
    }

    /// Per-tag FIFO serialization shared by the tree and the reverse maps.
    pub fn locks(&self) -> &KeyedLock {
        &self.0.locks
    }

    fn payload_path(&self, dir: &str, name: &str) -> PathBuf {
        let dir = self.0.root.join(dir);
        if self.0.shard > 0 && name.len() > self.0.shard {
            dir.join(&name[..self.0.shard]).join(name)
        } else {
            dir.join(name)
        }
    }

    fn object_path(&self, hash: &Hash) -> PathBuf {
        self.payload_path("objects", &hash.to_string())
    }

    /// Atomic write-then-rename; the only durability primitive in the store.
    fn persist(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().expect("payload paths have parents");
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_data()?;
        tmp.persist(path)
            .map_err(|err| anyhow::Error::from(err.error))
            .with_context(|| format!("persisting {}", path.display()))?;
        Ok(())
    }

    fn write_named(&self, dir: &str, hash: Hash, bytes: &[u8]) -> Result<(Hash, Status)> {
        let actual = Hash::digest(bytes);
        if actual != hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        let path = self.payload_path(dir, &hash.to_string());
        if path.is_file() {
            return Ok((hash, Status::Exists));
        }
        self.persist(&path, bytes)?;
        Ok((hash, Status::New))
    }

    /// Stores canonical object bytes under their digest. Idempotent: a
    /// second write of the same bytes reports [`Status::Exists`] without
    /// touching the file.
    pub fn write_object(&self, type_name: &str, bytes: &[u8]) -> Result<(Hash, Status)> {
        let hash = Hash::digest(bytes);
        let (hash, status) = self.write_named("objects", hash, bytes)?;
        tracing::debug!("object {} {} {}", type_name, hash, status.tag());
        self.0.events.emit(StoreEvent::ObjectWritten {
            hash,
            type_name: type_name.into(),
            status,
        });
        Ok((hash, status))
    }

    /// Stores an ID projection; same address space as objects, separate
    /// event stream.
    pub fn write_id_object(&self, type_name: &str, bytes: &[u8]) -> Result<(IdHash, Status)> {
        let hash = Hash::digest(bytes);
        let (hash, status) = self.write_named("objects", hash, bytes)?;
        let id = IdHash::new(*hash.as_ref());
        tracing::debug!("id object {} {} {}", type_name, id, status.tag());
        self.0.events.emit(StoreEvent::IdObjectWritten {
            id,
            type_name: type_name.into(),
            status,
        });
        Ok((id, status))
    }

    /// Reads object bytes and re-checks that they hash to their name.
    pub fn read_object(&self, hash: &Hash) -> Result<Vec<u8>> {
        let path = self.object_path(hash);
        let bytes = fs::read(&path)
            .map_err(|_| StoreError::NotFound(hash.to_string()))?;
        let actual = Hash::digest(&bytes);
        if actual != *hash {
            return Err(StoreError::HashMismatch {
                expected: hash.to_string(),
                actual: actual.to_string(),
            }
            .into());
        }
        Ok(bytes)
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.object_path(hash).is_file()
    }

    pub fn size(&self, hash: &Hash) -> Result<u64> {
        let meta = fs::metadata(self.object_path(hash))
            .map_err(|_| StoreError::NotFound(hash.to_string()))?;
        Ok(meta.len())
    }

    pub fn write_blob(&self, bytes: &[u8]) -> Result<(Hash, Status)> {
        let hash = Hash::digest(bytes);
        self.write_named("blobs", hash, bytes)
    }

    pub fn read_blob(&self, hash: &Hash) -> Result<Vec<u8>> {
        fs::read(self.payload_path("blobs", &hash.to_string()))
            .map_err(|_| StoreError::NotFound(hash.to_string()).into())
    }

    pub fn blob_exists(&self, hash: &Hash) -> bool {
        self.payload_path("blobs", &hash.to_string()).is_file()
    }

    pub fn write_clob(&self, text: &str) -> Result<(Hash, Status)> {
        let hash = Hash::digest(text.as_bytes());
        self.write_named("clobs", hash, text.as_bytes())
    }

    pub fn read_clob(&self, hash: &Hash) -> Result<String> {
        let bytes = fs::read(self.payload_path("clobs", &hash.to_string()))
            .map_err(|_| StoreError::NotFound(hash.to_string()))?;
        String::from_utf8(bytes).map_err(|_| StoreError::Decode("clob is not utf-8".into()).into())
    }

    pub fn clob_exists(&self, hash: &Hash) -> bool {
        self.payload_path("clobs", &hash.to_string()).is_file()
    }

    /// Advances the head pointer for an ID-hash. Callers hold the ID lock.
    pub fn write_head(&self, id: &IdHash, node: &Hash) -> Result<()> {
        let path = self.0.root.join("vheads").join(id.to_string());
        self.persist(&path, node.to_string().as_bytes())?;
        self.0.events.emit(StoreEvent::HeadAdvanced {
            id: *id,
            node: *node,
        });
        Ok(())
    }

    pub fn read_head(&self, id: &IdHash) -> Result<Option<Hash>> {
        let path = self.0.root.join("vheads").join(id.to_string());
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(text.trim().parse()?))
    }

    /// Path of a reverse-map append log for an object target.
    pub fn rmap_path(&self, target: &Hash, referring_type: &str) -> PathBuf {
        self.0
            .root
            .join("rmaps")
            .join(format!("{}.{}", target, referring_type))
    }

    /// Path of a reverse-map append log for an ID target.
    pub fn rmap_id_path(&self, target: &IdHash, referring_type: &str) -> PathBuf {
        self.0
            .root
            .join("rmaps-id")
            .join(format!("{}.{}", target, referring_type))
    }
}
