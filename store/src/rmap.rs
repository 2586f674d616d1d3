use crate::error::StoreError;
use crate::hash::{Hash, IdHash};
use crate::object::{Obj, RefKind, Value};
use crate::store::{Status, Store};
use anyhow::Result;
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

/// Looks up the data hash of the current head version of an ID. The seam
/// keeps the reverse maps independent of the version tree.
pub trait HeadSource {
    fn head_data(&self, id: &IdHash) -> Result<Option<Hash>>;
}

/// One line of a reverse-map append log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RmapEntry {
    pub referrer: Hash,
    /// ID-hash of the referrer when the referring type is versioned.
    pub referrer_id: Option<IdHash>,
    pub status: Status,
    pub timestamp: i64,
}

impl RmapEntry {
    fn line(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.referrer,
            self.referrer_id
                .map(|id| id.to_string())
                .unwrap_or_else(|| "-".into()),
            self.status.tag(),
            self.timestamp
        )
    }

    fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split(' ');
        let bad = || StoreError::Decode(format!("malformed rmap line {:?}", line));
        let referrer = parts.next().ok_or_else(bad)?.parse()?;
        let referrer_id = match parts.next().ok_or_else(bad)? {
            "-" => None,
            id => Some(id.parse()?),
        };
        let status = Status::from_tag(parts.next().ok_or_else(bad)?).ok_or_else(bad)?;
        let timestamp = parts.next().ok_or_else(bad)?.parse()?;
        if parts.next().is_some() {
            return Err(bad().into());
        }
        Ok(Self {
            referrer,
            referrer_id,
            status,
            timestamp,
        })
    }
}

struct Inner {
    store: Store,
    /// referring types indexed for object references
    obj_types: BTreeSet<String>,
    /// referring types indexed for ID references
    id_types: BTreeSet<String>,
}

/// Reverse-index layer: (target, referring type) → referring entries.
///
/// The type sets are frozen at instance creation; logs are append-only.
#[derive(Clone)]
pub struct ReverseMap(Arc<Inner>);

impl ReverseMap {
    pub fn new(store: Store, obj_types: BTreeSet<String>, id_types: BTreeSet<String>) -> Self {
        Self(Arc::new(Inner {
            store,
            obj_types,
            id_types,
        }))
    }

    /// Records the references a freshly written object makes, if its type is
    /// enabled.
    pub fn update(
        &self,
        obj: &Obj,
        referrer: Hash,
        referrer_id: Option<IdHash>,
        status: Status,
        timestamp: i64,
    ) -> Result<()> {
        let type_name = obj.type_name();
        let index_objs = self.0.obj_types.contains(type_name);
        let index_ids = self.0.id_types.contains(type_name);
        if !index_objs && !index_ids {
            return Ok(());
        }
        let mut obj_targets = BTreeSet::new();
        let mut id_targets = BTreeSet::new();
        for (_, value) in obj.fields() {
            collect_refs(value, &mut obj_targets, &mut id_targets);
        }
        let entry = RmapEntry {
            referrer,
            referrer_id,
            status,
            timestamp,
        };
        if index_objs {
            for target in &obj_targets {
                let path = self.0.store.rmap_path(target, type_name);
                self.append(&path, &entry)?;
            }
        }
        if index_ids {
            for target in &id_targets {
                let path = self.0.store.rmap_id_path(target, type_name);
                self.append(&path, &entry)?;
            }
        }
        Ok(())
    }

    // one O_APPEND write per line keeps concurrent appends whole
    fn append(&self, path: &Path, entry: &RmapEntry) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(entry.line().as_bytes())?;
        Ok(())
    }

    fn read_log(&self, path: &Path) -> Result<Vec<RmapEntry>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            entries.push(RmapEntry::parse(line)?);
        }
        Ok(entries)
    }

    /// All recorded referrers of an object target, oldest first.
    pub fn entries(&self, target: &Hash, referring_type: &str) -> Result<Vec<RmapEntry>> {
        self.read_log(&self.0.store.rmap_path(target, referring_type))
    }

    /// All recorded referrers of an ID target, oldest first.
    pub fn entries_id(&self, target: &IdHash, referring_type: &str) -> Result<Vec<RmapEntry>> {
        self.read_log(&self.0.store.rmap_id_path(target, referring_type))
    }

    /// Latest-only projection: versioned referrers are kept only while they
    /// are the current head version of their ID; unversioned referrers are
    /// always current.
    pub fn latest_id(
        &self,
        target: &IdHash,
        referring_type: &str,
        heads: &dyn HeadSource,
    ) -> Result<Vec<RmapEntry>> {
        self.project_latest(self.entries_id(target, referring_type)?, heads)
    }

    pub fn latest(
        &self,
        target: &Hash,
        referring_type: &str,
        heads: &dyn HeadSource,
    ) -> Result<Vec<RmapEntry>> {
        self.project_latest(self.entries(target, referring_type)?, heads)
    }

    fn project_latest(
        &self,
        entries: Vec<RmapEntry>,
        heads: &dyn HeadSource,
    ) -> Result<Vec<RmapEntry>> {
        let mut out: Vec<RmapEntry> = Vec::new();
        for entry in entries {
            match entry.referrer_id {
                None => {
                    if !out.iter().any(|e| e.referrer == entry.referrer) {
                        out.push(entry);
                    }
                }
                Some(id) => {
                    if heads.head_data(&id)? == Some(entry.referrer)
                        && !out.iter().any(|e| e.referrer == entry.referrer)
                    {
                        out.push(entry);
                    }
                }
            }
        }
        Ok(out)
    }
}

fn collect_refs(value: &Value, objs: &mut BTreeSet<Hash>, ids: &mut BTreeSet<IdHash>) {
    match value {
        Value::Reference(RefKind::Obj, hash) => {
            objs.insert(*hash);
        }
        Value::Reference(RefKind::Id, hash) => {
            ids.insert(IdHash::new(*hash.as_ref()));
        }
        Value::Reference(_, _) => {}
        Value::Seq(items) | Value::Set(items) => {
            for item in items {
                collect_refs(item, objs, ids);
            }
        }
        Value::Map(entries) => {
            for (key, value) in entries {
                collect_refs(key, objs, ids);
                collect_refs(value, objs, ids);
            }
        }
        Value::Object(obj) => {
            for (_, value) in obj.fields() {
                collect_refs(value, objs, ids);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FixedHeads(HashMap<IdHash, Hash>);

    impl HeadSource for FixedHeads {
        fn head_data(&self, id: &IdHash) -> Result<Option<Hash>> {
            Ok(self.0.get(id).copied())
        }
    }

    fn setup() -> (tempfile::TempDir, ReverseMap) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path(), 0).unwrap();
        let rmap = ReverseMap::new(
            store,
            ["Access".to_string()].into_iter().collect(),
            ["Access".to_string(), "Group".to_string()]
                .into_iter()
                .collect(),
        );
        (dir, rmap)
    }

    #[test]
    fn records_enabled_references_only() {
        let (_dir, rmap) = setup();
        let target = Hash::digest(b"target");
        let person = IdHash::digest(b"person");
        let access = Obj::new("Access")
            .set("object", Value::obj_ref(target))
            .set("person", Value::Set(vec![Value::id_ref(person)]));
        let referrer = Hash::digest(b"access");
        rmap.update(&access, referrer, None, Status::New, 7).unwrap();

        let entries = rmap.entries(&target, "Access").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].referrer, referrer);
        assert_eq!(entries[0].timestamp, 7);
        assert_eq!(rmap.entries_id(&person, "Access").unwrap().len(), 1);

        // a type outside both sets leaves no trace
        let other = Obj::new("Email").set("to", Value::obj_ref(target));
        rmap.update(&other, Hash::digest(b"email"), None, Status::New, 8)
            .unwrap();
        assert_eq!(rmap.entries(&target, "Email").unwrap().len(), 0);
    }

    #[test]
    fn latest_projection_follows_heads() {
        let (_dir, rmap) = setup();
        let member = IdHash::digest(b"member");
        let group_id = IdHash::digest(b"group-id");
        let v1 = Hash::digest(b"group-v1");
        let v2 = Hash::digest(b"group-v2");
        let group_v1 = Obj::new("Group").set("person", Value::Set(vec![Value::id_ref(member)]));
        rmap.update(&group_v1, v1, Some(group_id), Status::New, 1)
            .unwrap();
        rmap.update(&group_v1, v2, Some(group_id), Status::New, 2)
            .unwrap();

        let heads = FixedHeads([(group_id, v2)].into_iter().collect());
        let latest = rmap.latest_id(&member, "Group", &heads).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].referrer, v2);

        let heads = FixedHeads(HashMap::new());
        assert!(rmap.latest_id(&member, "Group", &heads).unwrap().is_empty());
    }
}
