use crate::canonical;
use crate::crdt::{merge_objects, MergeCtx, MergeStore};
use crate::error::StoreError;
use crate::hash::Hash;
use crate::object::{Obj, Value};
use crate::recipe::{CrdtAlgorithm, ItemType, Recipe, Registry, Rule, TypeSet};
use anyhow::Result;
use proptest::prelude::*;

fn registry_with_note() -> Registry {
    let registry = Registry::new(&[]).unwrap();
    let note = Recipe::new(
        "Note",
        vec![
            Rule::new("title", ItemType::String).id(),
            Rule::new("body", ItemType::String).optional(),
            Rule::new("tag", ItemType::Set(Box::new(ItemType::String))).optional(),
            Rule::new(
                "meta",
                ItemType::Map(Box::new(ItemType::String), Box::new(ItemType::String)),
            )
            .optional(),
            Rule::new("stars", ItemType::Integer).optional(),
        ],
    )
    .crdt("body", CrdtAlgorithm::LastWriterWins)
    .crdt("tag", CrdtAlgorithm::SetUnion)
    .crdt("meta", CrdtAlgorithm::MapUnion);
    registry.register(note).unwrap();
    registry
}

prop_compose! {
    fn arb_text()(s in "[ -~]{0,12}") -> String { s }
}

prop_compose! {
    fn arb_note(title: &'static str)(
        body in prop::option::of(arb_text()),
        tags in prop::collection::btree_set("[a-z]{1,6}", 0..5),
        meta in prop::collection::btree_map("[a-z]{1,4}", arb_text(), 0..4),
        stars in prop::option::of(0i64..100),
    ) -> Obj {
        let mut note = Obj::new("Note").set("title", title);
        if let Some(body) = body {
            note.insert("body", body);
        }
        if !tags.is_empty() {
            note.insert(
                "tag",
                Value::Set(tags.into_iter().map(Value::from).collect()),
            );
        }
        if !meta.is_empty() {
            note.insert(
                "meta",
                Value::Map(
                    meta.into_iter()
                        .map(|(k, v)| (Value::from(k), Value::from(v)))
                        .collect(),
                ),
            );
        }
        if let Some(stars) = stars {
            note.insert("stars", stars);
        }
        note
    }
}

struct NoStore;

impl MergeStore for NoStore {
    fn read_obj(&self, hash: &Hash) -> Result<Obj> {
        Err(StoreError::NotFound(hash.to_string()).into())
    }

    fn write_obj(&self, _obj: &Obj) -> Result<Hash> {
        unreachable!("note merges never write referents")
    }
}

proptest! {
    #[test]
    fn encode_decode_round_trip(note in arb_note("n")) {
        let registry = registry_with_note();
        let bytes = canonical::encode(&registry, &note).unwrap();
        let back = canonical::decode(&registry, &bytes, &TypeSet::Any).unwrap();
        prop_assert_eq!(&back, &note);
        // and the address is a function of the value alone
        let again = canonical::encode(&registry, &back).unwrap();
        prop_assert_eq!(Hash::digest(&bytes), Hash::digest(&again));
    }

    #[test]
    fn id_projection_ignores_non_id_fields(a in arb_note("n"), b in arb_note("n")) {
        let registry = registry_with_note();
        let ia = canonical::id_encode(&registry, &a).unwrap();
        let ib = canonical::id_encode(&registry, &b).unwrap();
        prop_assert_eq!(ia, ib);
    }

    #[test]
    fn merge_is_symmetric(
        l in arb_note("n"),
        r in arb_note("n"),
        l_time in 0i64..1000,
        r_time in 0i64..1000,
    ) {
        let registry = registry_with_note();
        let recipe = registry.get("Note").unwrap();
        let forward = MergeCtx {
            registry: &registry,
            objects: &NoStore,
            l_time,
            r_time,
        };
        let backward = MergeCtx {
            registry: &registry,
            objects: &NoStore,
            l_time: r_time,
            r_time: l_time,
        };
        let a = merge_objects(&forward, &recipe, &l, &r).unwrap();
        let b = merge_objects(&backward, &recipe, &r, &l).unwrap();
        prop_assert_eq!(a, b);
    }

    #[test]
    fn merge_is_idempotent(note in arb_note("n"), time in 0i64..1000) {
        let registry = registry_with_note();
        let recipe = registry.get("Note").unwrap();
        let ctx = MergeCtx {
            registry: &registry,
            objects: &NoStore,
            l_time: time,
            r_time: time,
        };
        let merged = merge_objects(&ctx, &recipe, &note, &note).unwrap();
        let before = canonical::encode(&registry, &note).unwrap();
        let after = canonical::encode(&registry, &merged).unwrap();
        prop_assert_eq!(before, after);
    }
}
