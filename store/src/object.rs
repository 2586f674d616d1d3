use crate::hash::{Hash, IdHash};
use std::collections::BTreeMap;

/// Reference kinds carried by link values.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum RefKind {
    Obj,
    Id,
    Blob,
    Clob,
}

impl RefKind {
    pub fn tag(self) -> &'static str {
        match self {
            Self::Obj => "obj",
            Self::Id => "id",
            Self::Blob => "blob",
            Self::Clob => "clob",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "obj" => Some(Self::Obj),
            "id" => Some(Self::Id),
            "blob" => Some(Self::Blob),
            "clob" => Some(Self::Clob),
            _ => None,
        }
    }
}

/// In-memory form of a stored value.
///
/// Cross-object links are always by hash, never by pointer; the object graph
/// may contain cycles and walkers keep a visited set.
#[derive(Clone, Debug)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Number(f64),
    String(String),
    Reference(RefKind, Hash),
    /// Ordered sequence, order preserved verbatim.
    Seq(Vec<Value>),
    /// Unordered collection, canonically sorted at encode time.
    Set(Vec<Value>),
    /// Ordered mapping, key order preserved verbatim.
    Map(Vec<(Value, Value)>),
    /// Nested object frame.
    Object(Obj),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            // bit equality keeps Eq lawful for the float variant
            (Self::Number(a), Self::Number(b)) => a.to_bits() == b.to_bits(),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Reference(ka, ha), Self::Reference(kb, hb)) => ka == kb && ha == hb,
            (Self::Seq(a), Self::Seq(b)) => a == b,
            (Self::Set(a), Self::Set(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Value {
    /// Convenience for reference values.
    pub fn obj_ref(hash: Hash) -> Self {
        Self::Reference(RefKind::Obj, hash)
    }

    pub fn id_ref(id: IdHash) -> Self {
        Self::Reference(RefKind::Id, id.as_object_hash())
    }

    pub fn blob_ref(hash: Hash) -> Self {
        Self::Reference(RefKind::Blob, hash)
    }

    pub fn clob_ref(hash: Hash) -> Self {
        Self::Reference(RefKind::Clob, hash)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<(RefKind, Hash)> {
        match self {
            Self::Reference(kind, hash) => Some((*kind, *hash)),
            _ => None,
        }
    }

    pub fn as_id_ref(&self) -> Option<IdHash> {
        match self {
            Self::Reference(RefKind::Id, hash) => Some(IdHash::new(*hash.as_ref())),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.into())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// A structured record with a mandatory type tag.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Obj {
    type_name: String,
    fields: BTreeMap<String, Value>,
}

impl Obj {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Builder-style field assignment.
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    pub fn integer_field(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_integer)
    }

    pub fn ref_field(&self, name: &str) -> Option<(RefKind, Hash)> {
        self.get(name).and_then(Value::as_reference)
    }

    /// Id-ref elements of a set-valued field, in canonical order.
    pub fn id_ref_set(&self, name: &str) -> Vec<IdHash> {
        match self.get(name) {
            Some(Value::Set(items)) => items.iter().filter_map(Value::as_id_ref).collect(),
            _ => Vec::new(),
        }
    }
}
