use crate::error::StoreError;
use crate::object::{Obj, Value};
use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Set of object types a reference rule may point at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TypeSet {
    Any,
    Of(Vec<String>),
}

impl TypeSet {
    pub fn matches(&self, type_name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Of(names) => names.iter().any(|n| n == type_name),
        }
    }
}

/// Shape of a rule's value.
///
/// The textual form (`ref<Person>`, `set(idref<*>)`, `map(string,integer)`)
/// is what recipe objects persist, so recipes round-trip through the store
/// like any other versioned object.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ItemType {
    Bool,
    Integer,
    Number,
    String,
    ReferenceToObj(TypeSet),
    ReferenceToId(TypeSet),
    ReferenceToBlob,
    ReferenceToClob,
    Seq(Box<ItemType>),
    Set(Box<ItemType>),
    Map(Box<ItemType>, Box<ItemType>),
    Object(String),
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        fn types(f: &mut std::fmt::Formatter, set: &TypeSet) -> std::fmt::Result {
            match set {
                TypeSet::Any => write!(f, "*"),
                TypeSet::Of(names) => write!(f, "{}", names.join("|")),
            }
        }
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Integer => write!(f, "integer"),
            Self::Number => write!(f, "number"),
            Self::String => write!(f, "string"),
            Self::ReferenceToObj(set) => {
                write!(f, "ref<")?;
                types(f, set)?;
                write!(f, ">")
            }
            Self::ReferenceToId(set) => {
                write!(f, "idref<")?;
                types(f, set)?;
                write!(f, ">")
            }
            Self::ReferenceToBlob => write!(f, "blob"),
            Self::ReferenceToClob => write!(f, "clob"),
            Self::Seq(item) => write!(f, "seq({})", item),
            Self::Set(item) => write!(f, "set({})", item),
            Self::Map(key, value) => write!(f, "map({},{})", key, value),
            Self::Object(name) => write!(f, "obj<{}>", name),
        }
    }
}

impl std::str::FromStr for ItemType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        fn type_set(s: &str) -> TypeSet {
            if s == "*" {
                TypeSet::Any
            } else {
                TypeSet::Of(s.split('|').map(|t| t.to_string()).collect())
            }
        }
        // splits "k,v" at the top-level comma of a map body
        fn split_map(s: &str) -> Option<(&str, &str)> {
            let mut depth = 0;
            for (i, c) in s.char_indices() {
                match c {
                    '(' | '<' => depth += 1,
                    ')' | '>' => depth -= 1,
                    ',' if depth == 0 => return Some((&s[..i], &s[i + 1..])),
                    _ => {}
                }
            }
            None
        }
        let item = match s {
            "bool" => Self::Bool,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "string" => Self::String,
            "blob" => Self::ReferenceToBlob,
            "clob" => Self::ReferenceToClob,
            _ => {
                if let Some(inner) = s.strip_prefix("ref<").and_then(|s| s.strip_suffix('>')) {
                    Self::ReferenceToObj(type_set(inner))
                } else if let Some(inner) = s.strip_prefix("idref<").and_then(|s| s.strip_suffix('>')) {
                    Self::ReferenceToId(type_set(inner))
                } else if let Some(inner) = s.strip_prefix("obj<").and_then(|s| s.strip_suffix('>')) {
                    Self::Object(inner.into())
                } else if let Some(inner) = s.strip_prefix("seq(").and_then(|s| s.strip_suffix(')')) {
                    Self::Seq(Box::new(inner.parse()?))
                } else if let Some(inner) = s.strip_prefix("set(").and_then(|s| s.strip_suffix(')')) {
                    Self::Set(Box::new(inner.parse()?))
                } else if let Some(inner) = s.strip_prefix("map(").and_then(|s| s.strip_suffix(')')) {
                    let (key, value) =
                        split_map(inner).ok_or_else(|| anyhow!("malformed map item type {}", s))?;
                    Self::Map(Box::new(key.parse()?), Box::new(value.parse()?))
                } else {
                    return Err(anyhow!("unknown item type {}", s));
                }
            }
        };
        Ok(item)
    }
}

/// Per-field merge strategy, selected by path from the recipe's crdt config.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CrdtAlgorithm {
    /// Descend into children instead of resolving at this level.
    Recurse,
    /// Replace with the value from the side whose version node is newer.
    LastWriterWins,
    /// Union of unordered elements.
    SetUnion,
    /// Union of keys, recursing into values present on both sides.
    MapUnion,
    /// Merge the referenced objects' payloads instead of picking a link.
    RefMerge,
}

impl std::fmt::Display for CrdtAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let s = match self {
            Self::Recurse => "recurse",
            Self::LastWriterWins => "lww",
            Self::SetUnion => "set-union",
            Self::MapUnion => "map-union",
            Self::RefMerge => "ref-merge",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for CrdtAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "recurse" => Ok(Self::Recurse),
            "lww" => Ok(Self::LastWriterWins),
            "set-union" => Ok(Self::SetUnion),
            "map-union" => Ok(Self::MapUnion),
            "ref-merge" => Ok(Self::RefMerge),
            _ => Err(anyhow!("unknown crdt algorithm {}", s)),
        }
    }
}

/// One field of a recipe, fully materialized (no rule inheritance survives
/// registration).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rule {
    pub name: String,
    pub item: ItemType,
    pub optional: bool,
    pub is_id: bool,
}

impl Rule {
    pub fn new(name: &str, item: ItemType) -> Self {
        Self {
            name: name.into(),
            item,
            optional: false,
            is_id: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn id(mut self) -> Self {
        self.is_id = true;
        self
    }
}

/// Declarative description of an object type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Recipe {
    name: String,
    rules: Vec<Rule>,
    crdt_config: BTreeMap<String, CrdtAlgorithm>,
}

fn valid_name(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Recipe {
    pub fn new(name: &str, rules: Vec<Rule>) -> Self {
        Self {
            name: name.into(),
            rules,
            crdt_config: BTreeMap::new(),
        }
    }

    /// Attaches a merge strategy to a dotted field path.
    pub fn crdt(mut self, path: &str, algorithm: CrdtAlgorithm) -> Self {
        self.crdt_config.insert(path.into(), algorithm);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.name == name)
    }

    pub fn id_rules(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.is_id)
    }

    /// A type with ID rules is versioned; all its versions share an ID-hash.
    pub fn is_versioned(&self) -> bool {
        self.rules.iter().any(|r| r.is_id)
    }

    /// Longest-prefix match of a dotted field path against the crdt config.
    pub fn crdt_for(&self, path: &str) -> Option<CrdtAlgorithm> {
        let mut candidate = path;
        loop {
            if let Some(algorithm) = self.crdt_config.get(candidate) {
                return Some(*algorithm);
            }
            match candidate.rfind('.') {
                Some(i) => candidate = &candidate[..i],
                None => return None,
            }
        }
    }

    pub fn crdt_config(&self) -> &BTreeMap<String, CrdtAlgorithm> {
        &self.crdt_config
    }

    fn validate(&self) -> Result<()> {
        if !valid_name(&self.name) {
            return Err(anyhow!("invalid recipe name {:?}", self.name));
        }
        if self.rules.is_empty() {
            return Err(anyhow!("recipe {} has no rules", self.name));
        }
        for rule in &self.rules {
            if !valid_name(&rule.name) {
                return Err(anyhow!(
                    "invalid rule name {:?} in recipe {}",
                    rule.name,
                    self.name
                ));
            }
            if rule.is_id && rule.optional {
                return Err(anyhow!(
                    "id rule {}.{} cannot be optional",
                    self.name,
                    rule.name
                ));
            }
        }
        Ok(())
    }

    /// Persisted form: a `Recipe` object, versioned by its name.
    pub fn to_obj(&self) -> Obj {
        let rules = self
            .rules
            .iter()
            .map(|rule| {
                let mut obj = Obj::new("Rule")
                    .set("name", rule.name.as_str())
                    .set("item", rule.item.to_string());
                if rule.optional {
                    obj.insert("optional", true);
                }
                if rule.is_id {
                    obj.insert("isId", true);
                }
                Value::Object(obj)
            })
            .collect();
        let mut obj = Obj::new("Recipe")
            .set("name", self.name.as_str())
            .set("rule", Value::Seq(rules));
        if !self.crdt_config.is_empty() {
            let config = self
                .crdt_config
                .iter()
                .map(|(path, algorithm)| {
                    (Value::from(path.as_str()), Value::from(algorithm.to_string()))
                })
                .collect();
            obj.insert("crdtConfig", Value::Map(config));
        }
        obj
    }

    pub fn from_obj(obj: &Obj) -> Result<Self> {
        if obj.type_name() != "Recipe" {
            return Err(anyhow!("not a recipe object: {}", obj.type_name()));
        }
        let name = obj
            .str_field("name")
            .ok_or_else(|| anyhow!("recipe object without name"))?;
        let mut rules = Vec::new();
        if let Some(Value::Seq(items)) = obj.get("rule") {
            for item in items {
                let rule = match item {
                    Value::Object(o) => o,
                    _ => return Err(anyhow!("malformed rule in recipe {}", name)),
                };
                let rule_name = rule
                    .str_field("name")
                    .ok_or_else(|| anyhow!("rule without name in recipe {}", name))?;
                let item_type = rule
                    .str_field("item")
                    .ok_or_else(|| anyhow!("rule {} without item type", rule_name))?
                    .parse()?;
                rules.push(Rule {
                    name: rule_name.into(),
                    item: item_type,
                    optional: matches!(rule.get("optional"), Some(Value::Bool(true))),
                    is_id: matches!(rule.get("isId"), Some(Value::Bool(true))),
                });
            }
        }
        let mut crdt_config = BTreeMap::new();
        if let Some(Value::Map(entries)) = obj.get("crdtConfig") {
            for (key, value) in entries {
                let path = key
                    .as_str()
                    .ok_or_else(|| anyhow!("non-string crdt path in recipe {}", name))?;
                let algorithm = value
                    .as_str()
                    .ok_or_else(|| anyhow!("non-string crdt algorithm in recipe {}", name))?
                    .parse()?;
                crdt_config.insert(path.into(), algorithm);
            }
        }
        Ok(Self {
            name: name.into(),
            rules,
            crdt_config,
        })
    }
}

/// Recipe registry.
///
/// Frozen for the initial set handed to [`Registry::new`]; additional recipes
/// may be registered at runtime.
#[derive(Clone)]
pub struct Registry {
    recipes: Arc<RwLock<BTreeMap<String, Arc<Recipe>>>>,
}

impl Registry {
    pub fn new(initial: &[Recipe]) -> Result<Self> {
        let registry = Self {
            recipes: Arc::new(RwLock::new(BTreeMap::new())),
        };
        for recipe in core_recipes() {
            registry.register(recipe)?;
        }
        for recipe in initial {
            registry.register(recipe.clone())?;
        }
        Ok(registry)
    }

    /// Registers a recipe. Re-registering an identical recipe is a no-op;
    /// redefining an existing type is refused.
    pub fn register(&self, recipe: Recipe) -> Result<Arc<Recipe>> {
        recipe.validate()?;
        let mut recipes = self.recipes.write();
        if let Some(existing) = recipes.get(recipe.name()) {
            if **existing == recipe {
                return Ok(existing.clone());
            }
            return Err(StoreError::InvalidState(format!(
                "recipe {} already registered with a different definition",
                recipe.name()
            ))
            .into());
        }
        let recipe = Arc::new(recipe);
        recipes.insert(recipe.name().into(), recipe.clone());
        Ok(recipe)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Recipe>> {
        self.recipes.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.recipes.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.recipes.read().keys().cloned().collect()
    }
}

/// Built-in types every instance registers before user recipes.
pub fn core_recipes() -> Vec<Recipe> {
    use CrdtAlgorithm::*;
    use ItemType::*;
    let node_types = || TypeSet::Of(vec!["Edge".into(), "Change".into(), "Merge".into()]);
    let person_set = || Set(Box::new(ReferenceToId(TypeSet::Of(vec!["Person".into()]))));
    let group_set = || Set(Box::new(ReferenceToId(TypeSet::Of(vec!["Group".into()]))));
    let any_ref_set = || Set(Box::new(ReferenceToObj(TypeSet::Any)));
    let any_idref_set = || Set(Box::new(ReferenceToId(TypeSet::Any)));
    vec![
        Recipe::new(
            "Rule",
            vec![
                Rule::new("name", String),
                Rule::new("item", String),
                Rule::new("optional", Bool).optional(),
                Rule::new("isId", Bool).optional(),
            ],
        ),
        Recipe::new(
            "Recipe",
            vec![
                Rule::new("name", String).id(),
                Rule::new("rule", Seq(Box::new(Object("Rule".into())))),
                Rule::new("crdtConfig", Map(Box::new(String), Box::new(String))).optional(),
            ],
        ),
        Recipe::new(
            "Person",
            vec![
                Rule::new("email", String).id(),
                Rule::new("name", String).optional(),
            ],
        )
        .crdt("name", LastWriterWins),
        Recipe::new(
            "Instance",
            vec![
                Rule::new("name", String).id(),
                Rule::new(
                    "owner",
                    ReferenceToId(TypeSet::Of(vec!["Person".into()])),
                )
                .id(),
                Rule::new("publicKey", String).optional(),
            ],
        )
        .crdt("publicKey", LastWriterWins),
        Recipe::new(
            "Group",
            vec![
                Rule::new("name", String).id(),
                Rule::new("person", person_set()).optional(),
            ],
        )
        .crdt("person", SetUnion),
        Recipe::new(
            "Access",
            vec![
                Rule::new("object", ReferenceToObj(TypeSet::Any)),
                Rule::new("person", person_set()).optional(),
                Rule::new("group", group_set()).optional(),
            ],
        ),
        Recipe::new(
            "IdAccess",
            vec![
                Rule::new("id", ReferenceToId(TypeSet::Any)),
                Rule::new("person", person_set()).optional(),
                Rule::new("group", group_set()).optional(),
            ],
        ),
        Recipe::new(
            "Edge",
            vec![
                Rule::new("id", ReferenceToId(TypeSet::Any)),
                Rule::new("data", ReferenceToObj(TypeSet::Any)),
                Rule::new("created", Integer),
            ],
        ),
        Recipe::new(
            "Change",
            vec![
                Rule::new("id", ReferenceToId(TypeSet::Any)),
                Rule::new("data", ReferenceToObj(TypeSet::Any)),
                Rule::new("prev", ReferenceToObj(node_types())),
                Rule::new("depth", Integer),
                Rule::new("created", Integer),
            ],
        ),
        Recipe::new(
            "Merge",
            vec![
                Rule::new("id", ReferenceToId(TypeSet::Any)),
                Rule::new("data", ReferenceToObj(TypeSet::Any)),
                Rule::new("node", Set(Box::new(ReferenceToObj(node_types())))),
                Rule::new("depth", Integer),
                Rule::new("created", Integer),
            ],
        ),
        Recipe::new(
            "Chum",
            vec![
                Rule::new("name", String).id(),
                Rule::new("instanceA", String).id(),
                Rule::new("instanceB", String).id(),
                Rule::new(
                    "personA",
                    ReferenceToId(TypeSet::Of(vec!["Person".into()])),
                ),
                Rule::new(
                    "personB",
                    ReferenceToId(TypeSet::Of(vec!["Person".into()])),
                ),
                Rule::new("AtoBObjects", any_ref_set()).optional(),
                Rule::new("AtoBIdObjects", any_idref_set()).optional(),
                Rule::new("AtoBBlob", Set(Box::new(ReferenceToBlob))).optional(),
                Rule::new("AtoBClob", Set(Box::new(ReferenceToClob))).optional(),
                Rule::new("BtoAObjects", any_ref_set()).optional(),
                Rule::new("BtoAIdObjects", any_idref_set()).optional(),
                Rule::new("BtoABlob", Set(Box::new(ReferenceToBlob))).optional(),
                Rule::new("BtoAClob", Set(Box::new(ReferenceToClob))).optional(),
                Rule::new("errors", Seq(Box::new(String))).optional(),
                Rule::new("firstTimestamp", Integer),
                Rule::new("lastTimestamp", Integer),
            ],
        )
        .crdt("AtoBObjects", SetUnion)
        .crdt("AtoBIdObjects", SetUnion)
        .crdt("AtoBBlob", SetUnion)
        .crdt("AtoBClob", SetUnion)
        .crdt("BtoAObjects", SetUnion)
        .crdt("BtoAIdObjects", SetUnion)
        .crdt("BtoABlob", SetUnion)
        .crdt("BtoAClob", SetUnion),
        Recipe::new(
            "Signature",
            vec![
                Rule::new("object", ReferenceToObj(TypeSet::Any)),
                Rule::new(
                    "signer",
                    ReferenceToId(TypeSet::Of(vec!["Person".into()])),
                ),
                Rule::new("signature", String),
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_type_round_trip() {
        for spec in [
            "bool",
            "integer",
            "number",
            "string",
            "blob",
            "clob",
            "ref<*>",
            "ref<Person|Group>",
            "idref<Person>",
            "obj<Rule>",
            "seq(string)",
            "set(idref<*>)",
            "map(string,seq(ref<*>))",
        ] {
            let item: ItemType = spec.parse().unwrap();
            assert_eq!(item.to_string(), spec);
        }
        assert!("seq".parse::<ItemType>().is_err());
        assert!("map(string)".parse::<ItemType>().is_err());
    }

    #[test]
    fn recipe_round_trips_through_object_form() {
        let recipe = Recipe::new(
            "Email",
            vec![
                Rule::new("subject", ItemType::String).id(),
                Rule::new(
                    "to",
                    ItemType::Set(Box::new(ItemType::ReferenceToId(TypeSet::Of(vec![
                        "Person".into()
                    ])))),
                )
                .optional(),
            ],
        )
        .crdt("to", CrdtAlgorithm::SetUnion);
        let back = Recipe::from_obj(&recipe.to_obj()).unwrap();
        assert_eq!(back, recipe);
    }

    #[test]
    fn registry_refuses_conflicting_redefinition() {
        let registry = Registry::new(&[]).unwrap();
        assert!(registry.contains("Person"));
        let redefined = Recipe::new("Person", vec![Rule::new("email", ItemType::Integer).id()]);
        assert!(registry.register(redefined).is_err());
        // identical re-registration is idempotent
        let person = core_recipes()
            .into_iter()
            .find(|r| r.name() == "Person")
            .unwrap();
        registry.register(person).unwrap();
    }

    #[test]
    fn crdt_prefix_match() {
        let recipe = Recipe::new("T", vec![Rule::new("a", ItemType::String)])
            .crdt("messages", CrdtAlgorithm::MapUnion)
            .crdt("messages.body", CrdtAlgorithm::LastWriterWins);
        assert_eq!(recipe.crdt_for("messages"), Some(CrdtAlgorithm::MapUnion));
        assert_eq!(
            recipe.crdt_for("messages.body"),
            Some(CrdtAlgorithm::LastWriterWins)
        );
        assert_eq!(
            recipe.crdt_for("messages.subject"),
            Some(CrdtAlgorithm::MapUnion)
        );
        assert_eq!(recipe.crdt_for("other"), None);
    }
}
