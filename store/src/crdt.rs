//! Recipe-driven merge of two parallel versions of one object.
//!
//! Strategies are dispatched per field path from the recipe's crdt config
//! and must be symmetric: `merge(l, r)` and `merge(r, l)` produce the same
//! object, so peers merging the same pair of heads agree on the result hash.

use crate::canonical;
use crate::error::StoreError;
use crate::hash::Hash;
use crate::object::{Obj, RefKind, Value};
use crate::recipe::{CrdtAlgorithm, ItemType, Recipe, Registry};
use anyhow::Result;

/// Reads and writes merged referents; implemented by the version tree.
pub trait MergeStore {
    fn read_obj(&self, hash: &Hash) -> Result<Obj>;
    /// Persists a merged referent without touching any head.
    fn write_obj(&self, obj: &Obj) -> Result<Hash>;
}

/// Merge context: the two sides' version-node creation times drive
/// last-writer-wins decisions.
pub struct MergeCtx<'a> {
    pub registry: &'a Registry,
    pub objects: &'a dyn MergeStore,
    pub l_time: i64,
    pub r_time: i64,
}

impl<'a> MergeCtx<'a> {
    /// True when the left side wins a last-writer decision; ties fall back
    /// to lexicographic order of canonical bytes.
    fn left_wins(&self, l_bytes: &[u8], r_bytes: &[u8]) -> bool {
        match self.l_time.cmp(&self.r_time) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => l_bytes >= r_bytes,
        }
    }
}

/// Merges two versions of the same type into a new object. The caller
/// stores the result with the no-version-map policy and creates the
/// surrounding version node.
pub fn merge_objects(ctx: &MergeCtx, recipe: &Recipe, l: &Obj, r: &Obj) -> Result<Obj> {
    let mut merged = Obj::new(recipe.name());
    for rule in recipe.rules() {
        let lv = l.get(&rule.name);
        let rv = r.get(&rule.name);
        if rule.is_id {
            // both sides belong to one ID-hash, the projections are equal
            if lv != rv {
                return Err(StoreError::ConflictMerge(format!(
                    "{}.{} differs between versions of one id",
                    recipe.name(),
                    rule.name
                ))
                .into());
            }
            if let Some(value) = lv {
                merged.insert(&rule.name, value.clone());
            }
            continue;
        }
        if let Some(value) = merge_value(ctx, recipe, &rule.name, &rule.item, lv, rv)? {
            merged.insert(&rule.name, value);
        }
    }
    Ok(merged)
}

fn default_algorithm(item: &ItemType) -> CrdtAlgorithm {
    match item {
        ItemType::Set(_) => CrdtAlgorithm::SetUnion,
        ItemType::Map(_, _) => CrdtAlgorithm::MapUnion,
        ItemType::Object(_) => CrdtAlgorithm::Recurse,
        _ => CrdtAlgorithm::LastWriterWins,
    }
}

fn conflict(path: &str, why: &str) -> anyhow::Error {
    StoreError::ConflictMerge(format!("{}: {}", path, why)).into()
}

/// Resolves one field. `None` means the field stays absent.
fn merge_value(
    ctx: &MergeCtx,
    recipe: &Recipe,
    path: &str,
    item: &ItemType,
    lv: Option<&Value>,
    rv: Option<&Value>,
) -> Result<Option<Value>> {
    let algorithm = recipe.crdt_for(path).unwrap_or_else(|| default_algorithm(item));
    match algorithm {
        CrdtAlgorithm::LastWriterWins => last_writer_wins(ctx, path, item, lv, rv),
        CrdtAlgorithm::SetUnion => set_union(ctx, path, item, lv, rv),
        CrdtAlgorithm::MapUnion => map_union(ctx, recipe, path, item, lv, rv),
        CrdtAlgorithm::Recurse => recurse(ctx, recipe, path, item, lv, rv),
        CrdtAlgorithm::RefMerge => ref_merge(ctx, path, item, lv, rv),
    }
}

fn last_writer_wins(
    ctx: &MergeCtx,
    _path: &str,
    item: &ItemType,
    lv: Option<&Value>,
    rv: Option<&Value>,
) -> Result<Option<Value>> {
    let (lv, rv) = match (lv, rv) {
        (None, None) => return Ok(None),
        (Some(l), None) => {
            // presence vs absence: the newer write decides, presence on ties
            return Ok(if ctx.l_time >= ctx.r_time { Some(l.clone()) } else { None });
        }
        (None, Some(r)) => {
            return Ok(if ctx.r_time >= ctx.l_time { Some(r.clone()) } else { None });
        }
        (Some(l), Some(r)) => (l, r),
    };
    if lv == rv {
        return Ok(Some(lv.clone()));
    }
    let l_bytes = canonical::encode_value(ctx.registry, item, lv)?;
    let r_bytes = canonical::encode_value(ctx.registry, item, rv)?;
    Ok(Some(if ctx.left_wins(&l_bytes, &r_bytes) {
        lv.clone()
    } else {
        rv.clone()
    }))
}

fn set_union(
    ctx: &MergeCtx,
    path: &str,
    item: &ItemType,
    lv: Option<&Value>,
    rv: Option<&Value>,
) -> Result<Option<Value>> {
    let inner = match item {
        ItemType::Set(inner) => inner,
        _ => return Err(conflict(path, "set-union on a non-set rule")),
    };
    let mut elements: Vec<(Vec<u8>, Value)> = Vec::new();
    for side in [lv, rv].into_iter().flatten() {
        let items = match side {
            Value::Set(items) => items,
            _ => return Err(conflict(path, "set-union on a non-set value")),
        };
        for value in items {
            let bytes = canonical::encode_value(ctx.registry, inner, value)?;
            if !elements.iter().any(|(b, _)| *b == bytes) {
                elements.push((bytes, value.clone()));
            }
        }
    }
    if elements.is_empty() && lv.is_none() && rv.is_none() {
        return Ok(None);
    }
    elements.sort_by(|(a, _), (b, _)| a.cmp(b));
    Ok(Some(Value::Set(
        elements.into_iter().map(|(_, v)| v).collect(),
    )))
}

fn map_union(
    ctx: &MergeCtx,
    recipe: &Recipe,
    path: &str,
    item: &ItemType,
    lv: Option<&Value>,
    rv: Option<&Value>,
) -> Result<Option<Value>> {
    let (key_item, value_item) = match item {
        ItemType::Map(k, v) => (k, v),
        _ => return Err(conflict(path, "map-union on a non-map rule")),
    };
    let entries_of = |side: Option<&Value>| -> Result<Vec<(Value, Value)>> {
        match side {
            None => Ok(Vec::new()),
            Some(Value::Map(entries)) => Ok(entries.clone()),
            Some(_) => Err(conflict(path, "map-union on a non-map value")),
        }
    };
    if lv.is_none() && rv.is_none() {
        return Ok(None);
    }
    let left = entries_of(lv)?;
    let right = entries_of(rv)?;
    let mut merged: Vec<(Vec<u8>, Value, Value)> = Vec::new();
    for (key, value) in &left {
        let key_bytes = canonical::encode_value(ctx.registry, key_item, key)?;
        merged.push((key_bytes, key.clone(), value.clone()));
    }
    for (key, value) in &right {
        let key_bytes = canonical::encode_value(ctx.registry, key_item, key)?;
        if let Some(existing) = merged.iter_mut().find(|(b, _, _)| *b == key_bytes) {
            // per-entry merge of values present on both sides
            let entry_path = match key {
                Value::String(s) => format!("{}.{}", path, s),
                _ => path.to_string(),
            };
            let resolved = merge_value(
                ctx,
                recipe,
                &entry_path,
                value_item,
                Some(&existing.2),
                Some(value),
            )?;
            if let Some(resolved) = resolved {
                existing.2 = resolved;
            }
        } else {
            merged.push((key_bytes, key.clone(), value.clone()));
        }
    }
    // canonical key order keeps the result identical on both peers
    merged.sort_by(|(a, _, _), (b, _, _)| a.cmp(b));
    Ok(Some(Value::Map(
        merged.into_iter().map(|(_, k, v)| (k, v)).collect(),
    )))
}

fn recurse(
    ctx: &MergeCtx,
    recipe: &Recipe,
    path: &str,
    item: &ItemType,
    lv: Option<&Value>,
    rv: Option<&Value>,
) -> Result<Option<Value>> {
    let type_name = match item {
        ItemType::Object(name) => name,
        _ => return Err(conflict(path, "recurse on a non-compound rule")),
    };
    let (l, r) = match (lv, rv) {
        (None, None) => return Ok(None),
        (Some(l), None) => return Ok(Some(l.clone())),
        (None, Some(r)) => return Ok(Some(r.clone())),
        (Some(Value::Object(l)), Some(Value::Object(r))) => (l, r),
        _ => return Err(conflict(path, "recurse on a non-object value")),
    };
    let nested = ctx
        .registry
        .get(type_name)
        .ok_or_else(|| conflict(path, "no recipe for nested type"))?;
    let mut merged = Obj::new(type_name);
    for rule in nested.rules() {
        let entry_path = format!("{}.{}", path, rule.name);
        // the outer recipe's config governs nested paths
        if let Some(value) = merge_value(
            ctx,
            recipe,
            &entry_path,
            &rule.item,
            l.get(&rule.name),
            r.get(&rule.name),
        )? {
            merged.insert(&rule.name, value);
        }
    }
    Ok(Some(Value::Object(merged)))
}

fn ref_merge(
    ctx: &MergeCtx,
    path: &str,
    item: &ItemType,
    lv: Option<&Value>,
    rv: Option<&Value>,
) -> Result<Option<Value>> {
    if !matches!(item, ItemType::ReferenceToObj(_)) {
        return Err(conflict(path, "ref-merge on a non-reference rule"));
    }
    let (l, r) = match (lv, rv) {
        (None, None) => return Ok(None),
        (Some(l), None) => return Ok(Some(l.clone())),
        (None, Some(r)) => return Ok(Some(r.clone())),
        (Some(l), Some(r)) => (l, r),
    };
    let (lh, rh) = match (l.as_reference(), r.as_reference()) {
        (Some((RefKind::Obj, lh)), Some((RefKind::Obj, rh))) => (lh, rh),
        _ => return Err(conflict(path, "ref-merge on a non-reference value")),
    };
    if lh == rh {
        return Ok(Some(l.clone()));
    }
    let l_obj = ctx.objects.read_obj(&lh)?;
    let r_obj = ctx.objects.read_obj(&rh)?;
    if l_obj.type_name() != r_obj.type_name() {
        return Err(conflict(path, "referenced objects have different types"));
    }
    let nested = ctx
        .registry
        .get(l_obj.type_name())
        .ok_or_else(|| conflict(path, "no recipe for referenced type"))?;
    let merged = merge_objects(ctx, &nested, &l_obj, &r_obj)?;
    let hash = ctx.objects.write_obj(&merged)?;
    Ok(Some(Value::obj_ref(hash)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{Rule, TypeSet};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemStore {
        objs: Mutex<HashMap<Hash, Obj>>,
    }

    impl MemStore {
        fn insert(&self, registry: &Registry, obj: Obj) -> Hash {
            let bytes = canonical::encode(registry, &obj).unwrap();
            let hash = Hash::digest(&bytes);
            self.objs.lock().insert(hash, obj);
            hash
        }
    }

    struct Ctx<'a> {
        registry: &'a Registry,
        store: &'a MemStore,
    }

    impl<'a> MergeStore for Ctx<'a> {
        fn read_obj(&self, hash: &Hash) -> Result<Obj> {
            self.store
                .objs
                .lock()
                .get(hash)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(hash.to_string()).into())
        }

        fn write_obj(&self, obj: &Obj) -> Result<Hash> {
            Ok(self.store.insert(self.registry, obj.clone()))
        }
    }

    fn registry() -> Registry {
        Registry::new(&[]).unwrap()
    }

    #[test]
    fn lww_picks_newer_side_and_breaks_ties_lexicographically() {
        let registry = registry();
        let store = MemStore::default();
        let objects = Ctx {
            registry: &registry,
            store: &store,
        };
        let recipe = registry.get("Person").unwrap();
        let l = Obj::new("Person").set("email", "a@b").set("name", "Y");
        let r = Obj::new("Person").set("email", "a@b").set("name", "Z");

        let ctx = MergeCtx {
            registry: &registry,
            objects: &objects,
            l_time: 2,
            r_time: 1,
        };
        let merged = merge_objects(&ctx, &recipe, &l, &r).unwrap();
        assert_eq!(merged.str_field("name"), Some("Y"));

        // equal times: the lexicographically greater canonical form wins,
        // regardless of argument order
        let ctx = MergeCtx {
            registry: &registry,
            objects: &objects,
            l_time: 5,
            r_time: 5,
        };
        let a = merge_objects(&ctx, &recipe, &l, &r).unwrap();
        let b = merge_objects(&ctx, &recipe, &r, &l).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.str_field("name"), Some("Z"));
    }

    #[test]
    fn merge_is_symmetric_for_sets_and_maps() {
        let registry = registry();
        let recipe = Recipe::new(
            "Board",
            vec![
                Rule::new("name", ItemType::String).id(),
                Rule::new("tag", ItemType::Set(Box::new(ItemType::String))).optional(),
                Rule::new(
                    "messages",
                    ItemType::Map(Box::new(ItemType::String), Box::new(ItemType::String)),
                )
                .optional(),
            ],
        )
        .crdt("tag", CrdtAlgorithm::SetUnion)
        .crdt("messages", CrdtAlgorithm::MapUnion);
        let recipe = registry.register(recipe).unwrap();
        let store = MemStore::default();
        let objects = Ctx {
            registry: &registry,
            store: &store,
        };
        let l = Obj::new("Board")
            .set("name", "b")
            .set("tag", Value::Set(vec!["x".into(), "y".into()]))
            .set(
                "messages",
                Value::Map(vec![("1".into(), "hi".into()), ("2".into(), "yo".into())]),
            );
        let r = Obj::new("Board")
            .set("name", "b")
            .set("tag", Value::Set(vec!["z".into()]))
            .set(
                "messages",
                Value::Map(vec![("2".into(), "yo!".into()), ("3".into(), "new".into())]),
            );
        let forward = MergeCtx {
            registry: &registry,
            objects: &objects,
            l_time: 1,
            r_time: 9,
        };
        let backward = MergeCtx {
            registry: &registry,
            objects: &objects,
            l_time: 9,
            r_time: 1,
        };
        let a = merge_objects(&forward, &recipe, &l, &r).unwrap();
        let b = merge_objects(&backward, &recipe, &r, &l).unwrap();
        assert_eq!(a, b);
        match a.get("tag") {
            Some(Value::Set(items)) => assert_eq!(items.len(), 3),
            other => panic!("unexpected tag {:?}", other),
        }
        match a.get("messages") {
            Some(Value::Map(entries)) => {
                assert_eq!(entries.len(), 3);
                // both-present key resolved by the newer side
                assert!(entries.contains(&("2".into(), "yo!".into())));
            }
            other => panic!("unexpected messages {:?}", other),
        }
    }

    #[test]
    fn ref_merge_recurses_into_referents() {
        let registry = registry();
        let recipe = Recipe::new(
            "Profile",
            vec![
                Rule::new("name", ItemType::String).id(),
                Rule::new("card", ItemType::ReferenceToObj(TypeSet::Of(vec!["Person".into()]))),
            ],
        )
        .crdt("card", CrdtAlgorithm::RefMerge);
        let recipe = registry.register(recipe).unwrap();
        let store = MemStore::default();
        let objects = Ctx {
            registry: &registry,
            store: &store,
        };
        let lp = store.insert(
            &registry,
            Obj::new("Person").set("email", "a@b").set("name", "L"),
        );
        let rp = store.insert(
            &registry,
            Obj::new("Person").set("email", "a@b").set("name", "R"),
        );
        let l = Obj::new("Profile").set("name", "p").set("card", Value::obj_ref(lp));
        let r = Obj::new("Profile").set("name", "p").set("card", Value::obj_ref(rp));
        let ctx = MergeCtx {
            registry: &registry,
            objects: &objects,
            l_time: 1,
            r_time: 2,
        };
        let merged = merge_objects(&ctx, &recipe, &l, &r).unwrap();
        let (kind, hash) = merged.ref_field("card").unwrap();
        assert_eq!(kind, RefKind::Obj);
        assert_ne!(hash, lp);
        assert_ne!(hash, rp);
        let referent = objects.read_obj(&hash).unwrap();
        assert_eq!(referent.str_field("name"), Some("R"));
    }

    #[test]
    fn misconfigured_algorithm_is_a_merge_conflict() {
        let registry = registry();
        let recipe = Recipe::new(
            "Bad",
            vec![
                Rule::new("name", ItemType::String).id(),
                Rule::new("count", ItemType::Integer),
            ],
        )
        .crdt("count", CrdtAlgorithm::SetUnion);
        let recipe = registry.register(recipe).unwrap();
        let store = MemStore::default();
        let objects = Ctx {
            registry: &registry,
            store: &store,
        };
        let l = Obj::new("Bad").set("name", "x").set("count", 1i64);
        let r = Obj::new("Bad").set("name", "x").set("count", 2i64);
        let ctx = MergeCtx {
            registry: &registry,
            objects: &objects,
            l_time: 1,
            r_time: 2,
        };
        let err = merge_objects(&ctx, &recipe, &l, &r).unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::ConflictMerge(_))
        ));
    }
}
