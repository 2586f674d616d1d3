//! Canonical textual encoding.
//!
//! Every stored object has exactly one byte representation: fields follow
//! recipe rule order, unordered collections are sorted by their encoded
//! form, and no whitespace is ever emitted outside string content. The
//! SHA-256 of these bytes is the object's address, so any deviation would
//! change the address.
//!
//! An ID projection is the same pass restricted to ID-flagged rules, with an
//! `id` attribute on the outer frame. The attribute keeps the two address
//! spaces disjoint by construction.

use crate::error::StoreError;
use crate::hash::{Hash, IdHash};
use crate::object::{Obj, RefKind, Value};
use crate::recipe::{ItemType, Recipe, Registry, Rule, TypeSet};
use anyhow::Result;

fn escape_into(out: &mut Vec<u8>, text: &str) {
    for byte in text.bytes() {
        match byte {
            b'&' => out.extend_from_slice(b"&amp;"),
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            _ => out.push(byte),
        }
    }
}

fn unescape(text: &str) -> Result<String> {
    if !text.contains('&') {
        return Ok(text.into());
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(i) = rest.find('&') {
        out.push_str(&rest[..i]);
        rest = &rest[i..];
        if let Some(tail) = rest.strip_prefix("&amp;") {
            out.push('&');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("&lt;") {
            out.push('<');
            rest = tail;
        } else if let Some(tail) = rest.strip_prefix("&gt;") {
            out.push('>');
            rest = tail;
        } else {
            return Err(decode_err("stray & in text content"));
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn decode_err(msg: impl Into<String>) -> anyhow::Error {
    StoreError::Decode(msg.into()).into()
}

/// Encodes the full object. Deterministic and total over well-typed objects.
pub fn encode(registry: &Registry, obj: &Obj) -> Result<Vec<u8>> {
    encode_frame(registry, obj, false)
}

/// Encodes the ID projection: ID-flagged rules only, `id`-attributed frame.
pub fn id_encode(registry: &Registry, obj: &Obj) -> Result<Vec<u8>> {
    encode_frame(registry, obj, true)
}

/// An object together with its address and, for versioned types, its ID
/// projection.
#[derive(Clone, Debug)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub hash: Hash,
    pub id: Option<(Vec<u8>, IdHash)>,
}

pub fn encode_with_id(registry: &Registry, obj: &Obj) -> Result<Encoded> {
    let recipe = recipe_for(registry, obj.type_name())?;
    let bytes = encode(registry, obj)?;
    let hash = Hash::digest(&bytes);
    let id = if recipe.is_versioned() {
        let id_bytes = id_encode(registry, obj)?;
        let id_hash = IdHash::digest(&id_bytes);
        Some((id_bytes, id_hash))
    } else {
        None
    };
    Ok(Encoded { bytes, hash, id })
}

fn recipe_for(registry: &Registry, name: &str) -> Result<std::sync::Arc<Recipe>> {
    registry
        .get(name)
        .ok_or_else(|| decode_err(format!("no recipe for type {}", name)))
}

fn encode_frame(registry: &Registry, obj: &Obj, id_only: bool) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    encode_obj_into(&mut out, registry, obj, id_only)?;
    Ok(out)
}

fn encode_obj_into(out: &mut Vec<u8>, registry: &Registry, obj: &Obj, id_only: bool) -> Result<()> {
    let recipe = recipe_for(registry, obj.type_name())?;
    if id_only && !recipe.is_versioned() {
        return Err(decode_err(format!(
            "type {} has no id rules",
            obj.type_name()
        )));
    }
    out.extend_from_slice(b"<o t=\"");
    out.extend_from_slice(obj.type_name().as_bytes());
    if id_only {
        out.extend_from_slice(b"\" id>");
    } else {
        out.extend_from_slice(b"\">");
    }
    for rule in recipe.rules() {
        if id_only && !rule.is_id {
            continue;
        }
        match obj.get(&rule.name) {
            Some(value) => {
                out.extend_from_slice(b"<f n=\"");
                out.extend_from_slice(rule.name.as_bytes());
                out.extend_from_slice(b"\">");
                encode_value_into(out, registry, rule, &rule.item, value)?;
                out.extend_from_slice(b"</f>");
            }
            None if rule.optional => {}
            None => {
                return Err(decode_err(format!(
                    "{}.{} is missing",
                    obj.type_name(),
                    rule.name
                )))
            }
        }
    }
    // fields outside the recipe would silently fail to round-trip
    if !id_only {
        for (name, _) in obj.fields() {
            if recipe.rule(name).is_none() {
                return Err(decode_err(format!(
                    "{}.{} is not in the recipe",
                    obj.type_name(),
                    name
                )));
            }
        }
    }
    out.extend_from_slice(b"</o>");
    Ok(())
}

fn encode_value_into(
    out: &mut Vec<u8>,
    registry: &Registry,
    rule: &Rule,
    item: &ItemType,
    value: &Value,
) -> Result<()> {
    let mismatch = || {
        decode_err(format!(
            "rule {} expects {}, got incompatible value",
            rule.name, item
        ))
    };
    match (item, value) {
        (ItemType::Bool, Value::Bool(b)) => {
            out.extend_from_slice(if *b { b"true" } else { b"false" })
        }
        (ItemType::Integer, Value::Integer(i)) => out.extend_from_slice(i.to_string().as_bytes()),
        (ItemType::Number, Value::Number(n)) => {
            if !n.is_finite() {
                return Err(decode_err(format!("rule {} holds a non-finite number", rule.name)));
            }
            out.extend_from_slice(n.to_string().as_bytes());
        }
        (ItemType::String, Value::String(s)) => escape_into(out, s),
        (ItemType::ReferenceToObj(_), Value::Reference(RefKind::Obj, hash)) => {
            encode_ref_into(out, RefKind::Obj, hash)
        }
        (ItemType::ReferenceToId(_), Value::Reference(RefKind::Id, hash)) => {
            encode_ref_into(out, RefKind::Id, hash)
        }
        (ItemType::ReferenceToBlob, Value::Reference(RefKind::Blob, hash)) => {
            encode_ref_into(out, RefKind::Blob, hash)
        }
        (ItemType::ReferenceToClob, Value::Reference(RefKind::Clob, hash)) => {
            encode_ref_into(out, RefKind::Clob, hash)
        }
        (ItemType::Seq(inner), Value::Seq(items)) => {
            out.extend_from_slice(b"<l>");
            for value in items {
                out.extend_from_slice(b"<i>");
                encode_value_into(out, registry, rule, inner, value)?;
                out.extend_from_slice(b"</i>");
            }
            out.extend_from_slice(b"</l>");
        }
        (ItemType::Set(inner), Value::Set(items)) => {
            let mut encoded = Vec::with_capacity(items.len());
            for value in items {
                let mut buf = Vec::new();
                buf.extend_from_slice(b"<i>");
                encode_value_into(&mut buf, registry, rule, inner, value)?;
                buf.extend_from_slice(b"</i>");
                encoded.push(buf);
            }
            encoded.sort();
            encoded.dedup();
            out.extend_from_slice(b"<u>");
            for buf in encoded {
                out.extend_from_slice(&buf);
            }
            out.extend_from_slice(b"</u>");
        }
        (ItemType::Map(key_item, value_item), Value::Map(entries)) => {
            out.extend_from_slice(b"<m>");
            let mut seen: Vec<&Value> = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                if seen.contains(&key) {
                    return Err(decode_err(format!("duplicate map key in rule {}", rule.name)));
                }
                seen.push(key);
                out.extend_from_slice(b"<k>");
                encode_value_into(out, registry, rule, key_item, key)?;
                out.extend_from_slice(b"</k><v>");
                encode_value_into(out, registry, rule, value_item, value)?;
                out.extend_from_slice(b"</v>");
            }
            out.extend_from_slice(b"</m>");
        }
        (ItemType::Object(type_name), Value::Object(nested)) => {
            if nested.type_name() != type_name {
                return Err(decode_err(format!(
                    "rule {} expects a nested {}, got {}",
                    rule.name,
                    type_name,
                    nested.type_name()
                )));
            }
            encode_obj_into(out, registry, nested, false)?;
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}

/// Canonical bytes of a lone value; the merge engine compares and sorts by
/// these.
pub fn encode_value(registry: &Registry, item: &ItemType, value: &Value) -> Result<Vec<u8>> {
    let rule = Rule::new("value", item.clone());
    let mut out = Vec::new();
    encode_value_into(&mut out, registry, &rule, item, value)?;
    Ok(out)
}

fn encode_ref_into(out: &mut Vec<u8>, kind: RefKind, hash: &Hash) {
    out.extend_from_slice(b"<r k=\"");
    out.extend_from_slice(kind.tag().as_bytes());
    out.extend_from_slice(b"\">");
    out.extend_from_slice(hash.to_string().as_bytes());
    out.extend_from_slice(b"</r>");
}

/// Decodes a full object frame; every byte must be consumed.
pub fn decode(registry: &Registry, bytes: &[u8], expected: &TypeSet) -> Result<Obj> {
    let (obj, is_id) = decode_any(registry, bytes, expected)?;
    if is_id {
        return Err(decode_err("expected a full object, found an id frame"));
    }
    Ok(obj)
}

/// Decodes a frame that may be either a full object or an ID projection.
pub fn decode_any(registry: &Registry, bytes: &[u8], expected: &TypeSet) -> Result<(Obj, bool)> {
    let text = std::str::from_utf8(bytes).map_err(|_| decode_err("object bytes are not utf-8"))?;
    let mut cursor = Cursor { text, pos: 0 };
    let (obj, is_id) = decode_obj(&mut cursor, registry, expected)?;
    if cursor.pos != text.len() {
        return Err(decode_err(format!(
            "trailing bytes at offset {}",
            cursor.pos
        )));
    }
    Ok((obj, is_id))
}

/// Single-pass forward-only position cursor.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn eat(&mut self, lit: &str) -> bool {
        if self.rest().starts_with(lit) {
            self.pos += lit.len();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, lit: &str) -> Result<()> {
        if self.eat(lit) {
            Ok(())
        } else {
            Err(decode_err(format!(
                "expected {:?} at offset {}",
                lit, self.pos
            )))
        }
    }

    /// Raw text up to the next tag open; escapes keep `<` out of content.
    fn text_until_tag(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .find('<')
            .ok_or_else(|| decode_err("unterminated text content"))?;
        self.pos += end;
        Ok(&rest[..end])
    }

    /// Content of a quoted attribute, terminated by `"`.
    fn attr_value(&mut self) -> Result<&'a str> {
        let rest = self.rest();
        let end = rest
            .find('"')
            .ok_or_else(|| decode_err("unterminated attribute"))?;
        self.pos += end;
        Ok(&rest[..end])
    }
}

fn decode_obj(cursor: &mut Cursor, registry: &Registry, expected: &TypeSet) -> Result<(Obj, bool)> {
    cursor.expect("<o t=\"")?;
    let type_name = cursor.attr_value()?.to_string();
    if !expected.matches(&type_name) {
        return Err(decode_err(format!("unexpected type {}", type_name)));
    }
    let is_id = if cursor.eat("\" id>") {
        true
    } else {
        cursor.expect("\">")?;
        false
    };
    let recipe = recipe_for(registry, &type_name)?;
    let mut obj = Obj::new(&type_name);
    let rules: Vec<&Rule> = recipe
        .rules()
        .iter()
        .filter(|r| !is_id || r.is_id)
        .collect();
    let mut next_rule = 0;
    while cursor.eat("<f n=\"") {
        let field = cursor.attr_value()?.to_string();
        cursor.expect("\">")?;
        // fields appear in rule order; optional rules may be skipped
        let rule = loop {
            let rule = match rules.get(next_rule) {
                Some(rule) => *rule,
                None => {
                    return Err(decode_err(format!(
                        "unexpected field {}.{}",
                        type_name, field
                    )))
                }
            };
            next_rule += 1;
            if rule.name == field {
                break rule;
            }
            if !rule.optional {
                return Err(decode_err(format!(
                    "{}.{} is missing",
                    type_name, rule.name
                )));
            }
        };
        let value = decode_value(cursor, registry, rule, &rule.item)?;
        obj.insert(&rule.name, value);
        cursor.expect("</f>")?;
    }
    for rule in &rules[next_rule.min(rules.len())..] {
        if !rule.optional {
            return Err(decode_err(format!("{}.{} is missing", type_name, rule.name)));
        }
    }
    cursor.expect("</o>")?;
    Ok((obj, is_id))
}

fn decode_value(
    cursor: &mut Cursor,
    registry: &Registry,
    rule: &Rule,
    item: &ItemType,
) -> Result<Value> {
    let value = match item {
        ItemType::Bool => {
            let text = cursor.text_until_tag()?;
            match text {
                "true" => Value::Bool(true),
                "false" => Value::Bool(false),
                _ => return Err(decode_err(format!("rule {}: bad bool {:?}", rule.name, text))),
            }
        }
        ItemType::Integer => {
            let text = cursor.text_until_tag()?;
            let parsed: i64 = text
                .parse()
                .map_err(|_| decode_err(format!("rule {}: bad integer {:?}", rule.name, text)))?;
            if parsed.to_string() != text {
                return Err(decode_err(format!(
                    "rule {}: non-canonical integer {:?}",
                    rule.name, text
                )));
            }
            Value::Integer(parsed)
        }
        ItemType::Number => {
            let text = cursor.text_until_tag()?;
            let parsed: f64 = text
                .parse()
                .map_err(|_| decode_err(format!("rule {}: bad number {:?}", rule.name, text)))?;
            if !parsed.is_finite() || parsed.to_string() != text {
                return Err(decode_err(format!(
                    "rule {}: non-canonical number {:?}",
                    rule.name, text
                )));
            }
            Value::Number(parsed)
        }
        ItemType::String => {
            let text = cursor.text_until_tag()?;
            Value::String(unescape(text)?)
        }
        ItemType::ReferenceToObj(_) => decode_ref(cursor, rule, RefKind::Obj)?,
        ItemType::ReferenceToId(_) => decode_ref(cursor, rule, RefKind::Id)?,
        ItemType::ReferenceToBlob => decode_ref(cursor, rule, RefKind::Blob)?,
        ItemType::ReferenceToClob => decode_ref(cursor, rule, RefKind::Clob)?,
        ItemType::Seq(inner) => {
            cursor.expect("<l>")?;
            let mut items = Vec::new();
            while cursor.eat("<i>") {
                items.push(decode_value(cursor, registry, rule, inner)?);
                cursor.expect("</i>")?;
            }
            cursor.expect("</l>")?;
            Value::Seq(items)
        }
        ItemType::Set(inner) => {
            cursor.expect("<u>")?;
            let mut items = Vec::new();
            let mut prev_span: Option<&str> = None;
            while cursor.rest().starts_with("<i>") {
                let start = cursor.pos;
                cursor.expect("<i>")?;
                items.push(decode_value(cursor, registry, rule, inner)?);
                cursor.expect("</i>")?;
                let span = &cursor.text[start..cursor.pos];
                if let Some(prev) = prev_span {
                    if prev >= span {
                        return Err(decode_err(format!(
                            "rule {}: set elements out of canonical order",
                            rule.name
                        )));
                    }
                }
                prev_span = Some(span);
            }
            cursor.expect("</u>")?;
            Value::Set(items)
        }
        ItemType::Map(key_item, value_item) => {
            cursor.expect("<m>")?;
            let mut entries = Vec::new();
            while cursor.eat("<k>") {
                let key = decode_value(cursor, registry, rule, key_item)?;
                cursor.expect("</k><v>")?;
                let value = decode_value(cursor, registry, rule, value_item)?;
                cursor.expect("</v>")?;
                if entries.iter().any(|(k, _)| k == &key) {
                    return Err(decode_err(format!(
                        "rule {}: duplicate map key",
                        rule.name
                    )));
                }
                entries.push((key, value));
            }
            cursor.expect("</m>")?;
            Value::Map(entries)
        }
        ItemType::Object(type_name) => {
            let expected = TypeSet::Of(vec![type_name.clone()]);
            let (nested, is_id) = decode_obj(cursor, registry, &expected)?;
            if is_id {
                return Err(decode_err(format!(
                    "rule {}: nested id frame",
                    rule.name
                )));
            }
            Value::Object(nested)
        }
    };
    Ok(value)
}

fn decode_ref(cursor: &mut Cursor, rule: &Rule, expected: RefKind) -> Result<Value> {
    cursor.expect("<r k=\"")?;
    let tag = cursor.attr_value()?;
    let kind = RefKind::from_tag(tag)
        .ok_or_else(|| decode_err(format!("rule {}: bad reference kind {:?}", rule.name, tag)))?;
    if kind != expected {
        return Err(decode_err(format!(
            "rule {}: reference kind {} where {} is required",
            rule.name,
            kind.tag(),
            expected.tag()
        )));
    }
    cursor.expect("\">")?;
    let hex = cursor.text_until_tag()?;
    let hash: Hash = hex
        .parse()
        .map_err(|_| decode_err(format!("rule {}: bad reference hash", rule.name)))?;
    cursor.expect("</r>")?;
    Ok(Value::Reference(kind, hash))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipe::{CrdtAlgorithm, Recipe, Rule};

    fn registry() -> Registry {
        Registry::new(&[]).unwrap()
    }

    #[test]
    fn person_round_trip_and_stable_address() {
        let registry = registry();
        let person = Obj::new("Person").set("email", "a@b");
        let bytes = encode(&registry, &person).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "<o t=\"Person\"><f n=\"email\">a@b</f></o>"
        );
        assert_eq!(Hash::digest(&bytes), Hash::digest(&encode(&registry, &person).unwrap()));
        let back = decode(&registry, &bytes, &TypeSet::Any).unwrap();
        assert_eq!(back, person);
    }

    #[test]
    fn id_frame_is_disjoint_and_projects_id_rules() {
        let registry = registry();
        let person = Obj::new("Person").set("email", "a@b").set("name", "X");
        let full = encode(&registry, &person).unwrap();
        let id = id_encode(&registry, &person).unwrap();
        assert_eq!(
            std::str::from_utf8(&id).unwrap(),
            "<o t=\"Person\" id><f n=\"email\">a@b</f></o>"
        );
        assert_ne!(Hash::digest(&full).as_ref(), IdHash::digest(&id).as_ref());
        // both versions of the person share the id frame
        let person2 = Obj::new("Person").set("email", "a@b").set("name", "Y");
        assert_eq!(id, id_encode(&registry, &person2).unwrap());
        let (back, is_id) = decode_any(&registry, &id, &TypeSet::Any).unwrap();
        assert!(is_id);
        assert_eq!(back.str_field("email"), Some("a@b"));
        assert_eq!(back.get("name"), None);
    }

    #[test]
    fn strings_are_escaped() {
        let registry = registry();
        let person = Obj::new("Person").set("email", "a<b>&c");
        let bytes = encode(&registry, &person).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "<o t=\"Person\"><f n=\"email\">a&lt;b&gt;&amp;c</f></o>"
        );
        let back = decode(&registry, &bytes, &TypeSet::Any).unwrap();
        assert_eq!(back.str_field("email"), Some("a<b>&c"));
    }

    #[test]
    fn sets_are_canonically_sorted() {
        let registry = registry();
        let recipe = Recipe::new(
            "Tags",
            vec![
                Rule::new("name", ItemType::String).id(),
                Rule::new("tag", ItemType::Set(Box::new(ItemType::String))),
            ],
        )
        .crdt("tag", CrdtAlgorithm::SetUnion);
        registry.register(recipe).unwrap();
        let a = Obj::new("Tags").set("name", "t").set(
            "tag",
            Value::Set(vec!["b".into(), "a".into(), "b".into()]),
        );
        let b = Obj::new("Tags")
            .set("name", "t")
            .set("tag", Value::Set(vec!["a".into(), "b".into()]));
        assert_eq!(encode(&registry, &a).unwrap(), encode(&registry, &b).unwrap());
    }

    #[test]
    fn decode_requires_full_consumption_and_known_fields() {
        let registry = registry();
        let person = Obj::new("Person").set("email", "a@b");
        let mut bytes = encode(&registry, &person).unwrap();
        bytes.push(b' ');
        let err = decode(&registry, &bytes, &TypeSet::Any).unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::Decode(_))
        ));

        let err = decode(
            &registry,
            b"<o t=\"Person\"><f n=\"nope\">x</f></o>",
            &TypeSet::Any,
        )
        .unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::Decode(_))
        ));

        let err = decode(
            &registry,
            b"<o t=\"Unknown\"><f n=\"x\">y</f></o>",
            &TypeSet::Any,
        )
        .unwrap_err();
        assert!(matches!(
            StoreError::kind_of(&err),
            Some(StoreError::Decode(_))
        ));
    }

    #[test]
    fn decode_rejects_types_outside_the_expected_set() {
        let registry = registry();
        let person = Obj::new("Person").set("email", "a@b");
        let bytes = encode(&registry, &person).unwrap();
        decode(&registry, &bytes, &TypeSet::Of(vec!["Person".into()])).unwrap();
        assert!(decode(&registry, &bytes, &TypeSet::Of(vec!["Group".into()])).is_err());
    }

    #[test]
    fn missing_mandatory_field_fails_both_ways() {
        let registry = registry();
        let person = Obj::new("Person").set("name", "X");
        assert!(encode(&registry, &person).is_err());
        assert!(decode(&registry, b"<o t=\"Person\"></o>", &TypeSet::Any).is_err());
    }

    #[test]
    fn nested_objects_and_maps_round_trip() {
        let registry = registry();
        let recipe = Recipe::new(
            "Email",
            vec![
                Rule::new("subject", ItemType::String).id(),
                Rule::new(
                    "headers",
                    ItemType::Map(Box::new(ItemType::String), Box::new(ItemType::String)),
                )
                .optional(),
                Rule::new(
                    "to",
                    ItemType::Set(Box::new(ItemType::ReferenceToId(TypeSet::Of(vec![
                        "Person".into(),
                    ])))),
                )
                .optional(),
            ],
        );
        registry.register(recipe).unwrap();
        let id_a = IdHash::digest(b"a");
        let id_b = IdHash::digest(b"b");
        let email = Obj::new("Email")
            .set("subject", "hello")
            .set(
                "headers",
                Value::Map(vec![("x".into(), "1".into()), ("y".into(), "2".into())]),
            )
            .set(
                "to",
                Value::Set(vec![Value::id_ref(id_a), Value::id_ref(id_b)]),
            );
        let bytes = encode(&registry, &email).unwrap();
        let back = decode(&registry, &bytes, &TypeSet::Any).unwrap();
        assert_eq!(back.id_ref_set("to").len(), 2);
        assert_eq!(encode(&registry, &back).unwrap(), bytes);
    }
}
