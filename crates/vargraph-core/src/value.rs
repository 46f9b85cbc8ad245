//! Document value types
//!
//! Represents the configuration document and every value a resolver can
//! produce. Values can be scalars (string, int, float, bool, null),
//! sequences, mappings, or opaque in-memory objects handed back by a
//! resolver (callables, clients) that must survive substitution untouched.

use indexmap::IndexMap;
use serde::de::{self, Deserialize, Deserializer, EnumAccess, MapAccess, SeqAccess, VariantAccess, Visitor};
use serde::ser::{self, Serialize, SerializeMap, SerializeSeq, Serializer};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A document value that may contain unresolved placeholders
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Null value
    #[default]
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating point value
    Float(f64),
    /// String value (may contain placeholders like ${env:VAR})
    String(String),
    /// Sequence of values
    Sequence(Vec<Value>),
    /// Mapping of string keys to values
    Mapping(IndexMap<String, Value>),
    /// In-memory object that has no serialized form
    Opaque(Opaque),
}

/// Shared handle to an arbitrary in-memory object produced by a resolver.
///
/// Two opaque values are equal only when they point at the same object.
#[derive(Clone)]
pub struct Opaque(Arc<dyn Any + Send + Sync>);

impl Opaque {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Opaque(Arc::new(value))
    }

    /// Borrow the wrapped object as `T`, if that is what it holds
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &Opaque) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<opaque>")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Value {
    /// Check if this value is a mapping
    pub fn is_mapping(&self) -> bool {
        matches!(self, Value::Mapping(_))
    }

    /// Get as i64 if this is an Integer
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as str if this is a String
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Get as mapping if this is a Mapping
    pub fn as_mapping(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Get as opaque handle if this is an Opaque
    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Value::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Render a scalar as the text it contributes to a string template.
    ///
    /// Returns `None` for null, collections and opaque values.
    pub fn as_template_text(&self) -> Option<String> {
        match self {
            Value::String(s) => Some(s.clone()),
            Value::Integer(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Get a value by path text (e.g., "provider.stage" or "functions[0].name")
    pub fn get_path(&self, path: &str) -> Result<&Value> {
        let parsed = ConfigPath::parse(path)?;
        self.get(&parsed).ok_or_else(|| Error::path_not_found(path))
    }

    /// Get a value by parsed path
    pub fn get(&self, path: &ConfigPath) -> Option<&Value> {
        let mut current = self;
        for segment in path.segments() {
            current = match (current, segment) {
                (Value::Mapping(map), PathSegment::Key(key)) => map.get(key.as_str())?,
                (Value::Mapping(map), PathSegment::Index(idx)) => map.get(&idx.to_string())?,
                (Value::Sequence(seq), PathSegment::Index(idx)) => seq.get(*idx)?,
                (Value::Sequence(seq), PathSegment::Key(key)) => {
                    seq.get(key.parse::<usize>().ok()?)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Get a mutable value by parsed path
    pub fn get_mut(&mut self, path: &ConfigPath) -> Option<&mut Value> {
        let mut current = self;
        for segment in path.segments() {
            current = match (current, segment) {
                (Value::Mapping(map), PathSegment::Key(key)) => map.get_mut(key.as_str())?,
                (Value::Mapping(map), PathSegment::Index(idx)) => {
                    map.get_mut(&idx.to_string())?
                }
                (Value::Sequence(seq), PathSegment::Index(idx)) => seq.get_mut(*idx)?,
                (Value::Sequence(seq), PathSegment::Key(key)) => {
                    seq.get_mut(key.parse::<usize>().ok()?)?
                }
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a value at a path, creating intermediate mappings as needed
    pub fn set(&mut self, path: &ConfigPath, value: Value) -> Result<()> {
        let Some((last, parents)) = path.segments().split_last() else {
            *self = value;
            return Ok(());
        };

        let mut current = self;
        for segment in parents {
            current = match (current, segment) {
                (Value::Mapping(map), PathSegment::Key(key)) => map
                    .entry(key.clone())
                    .or_insert_with(|| Value::Mapping(IndexMap::new())),
                (Value::Sequence(seq), PathSegment::Index(idx)) => seq
                    .get_mut(*idx)
                    .ok_or_else(|| Error::path_not_found(path.to_string()))?,
                _ => return Err(Error::path_not_found(path.to_string())),
            };
        }

        match (current, last) {
            (Value::Mapping(map), PathSegment::Key(key)) => {
                map.insert(key.clone(), value);
                Ok(())
            }
            (Value::Mapping(map), PathSegment::Index(idx)) => {
                map.insert(idx.to_string(), value);
                Ok(())
            }
            (Value::Sequence(seq), PathSegment::Index(idx)) if *idx < seq.len() => {
                seq[*idx] = value;
                Ok(())
            }
            _ => Err(Error::path_not_found(path.to_string())),
        }
    }

    /// Remove the value at a path, returning it if it existed
    pub fn remove(&mut self, path: &ConfigPath) -> Option<Value> {
        let (last, parents) = path.segments().split_last()?;
        let parent = self.get_mut(&ConfigPath::from(parents.to_vec()))?;
        match (parent, last) {
            (Value::Mapping(map), PathSegment::Key(key)) => map.shift_remove(key.as_str()),
            (Value::Mapping(map), PathSegment::Index(idx)) => map.shift_remove(&idx.to_string()),
            (Value::Sequence(seq), PathSegment::Index(idx)) if *idx < seq.len() => {
                Some(seq.remove(*idx))
            }
            _ => None,
        }
    }

    /// Visit every string leaf together with its path, in document order
    pub fn visit_strings<F>(&self, visitor: &mut F)
    where
        F: FnMut(&ConfigPath, &str),
    {
        fn walk<F: FnMut(&ConfigPath, &str)>(value: &Value, path: &mut ConfigPath, visitor: &mut F) {
            match value {
                Value::String(s) => visitor(path, s),
                Value::Sequence(seq) => {
                    for (idx, item) in seq.iter().enumerate() {
                        path.push(PathSegment::Index(idx));
                        walk(item, path, visitor);
                        path.pop();
                    }
                }
                Value::Mapping(map) => {
                    for (key, item) in map {
                        path.push(PathSegment::Key(key.clone()));
                        walk(item, path, visitor);
                        path.pop();
                    }
                }
                _ => {}
            }
        }
        walk(self, &mut ConfigPath::root(), visitor);
    }

    /// Returns the type name of this value
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
            Value::Opaque(_) => "opaque",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Sequence(seq) => {
                write!(f, "[")?;
                for (i, v) in seq.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Value::Mapping(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Opaque(_) => write!(f, "<opaque>"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Sequence(seq) => {
                let mut s = serializer.serialize_seq(Some(seq.len()))?;
                for item in seq {
                    s.serialize_element(item)?;
                }
                s.end()
            }
            Value::Mapping(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            Value::Opaque(_) => Err(ser::Error::custom(
                "opaque in-memory values cannot be serialized",
            )),
        }
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a YAML or JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
        Ok(Value::Integer(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
        Ok(i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Float(v as f64)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
        Ok(Value::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
        Ok(Value::String(v))
    }

    fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> std::result::Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Sequence(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<Value, A::Error> {
        let mut entries = IndexMap::new();
        while let Some((key, value)) = map.next_entry::<Value, Value>()? {
            // YAML allows non-string keys; they are addressed by their text
            entries.insert(key.to_string(), value);
        }
        Ok(Value::Mapping(entries))
    }

    // YAML tags (`!Sub ...`, `!Ref ...`) become a single-entry mapping keyed by the tag
    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> std::result::Result<Value, A::Error> {
        let (tag, variant) = data.variant::<String>()?;
        let inner: Value = variant.newtype_variant()?;
        let mut entries = IndexMap::new();
        entries.insert(format!("!{}", tag.trim_start_matches('!')), inner);
        Ok(Value::Mapping(entries))
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Value, D::Error> {
        d.deserialize_any(ValueVisitor)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Sequence(v.into_iter().map(Into::into).collect())
    }
}

impl From<IndexMap<String, Value>> for Value {
    fn from(m: IndexMap<String, Value>) -> Self {
        Value::Mapping(m)
    }
}

impl From<Opaque> for Value {
    fn from(o: Opaque) -> Self {
        Value::Opaque(o)
    }
}

/// A segment in a document path
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// A key in a mapping (e.g., "provider" in "provider.stage")
    Key(String),
    /// An index in a sequence (e.g., 0 in "functions[0]")
    Index(usize),
}

impl PathSegment {
    /// Keys and indices address the same slot when the key is the index's text
    pub fn matches(&self, other: &PathSegment) -> bool {
        match (self, other) {
            (PathSegment::Key(a), PathSegment::Key(b)) => a == b,
            (PathSegment::Index(a), PathSegment::Index(b)) => a == b,
            (PathSegment::Key(k), PathSegment::Index(i))
            | (PathSegment::Index(i), PathSegment::Key(k)) => k.parse::<usize>().ok() == Some(*i),
        }
    }
}

/// Location of a value inside the document
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ConfigPath(Vec<PathSegment>);

impl ConfigPath {
    /// The document root
    pub fn root() -> Self {
        ConfigPath(Vec::new())
    }

    /// Parse a path string into segments.
    /// Supports: "key", "key.subkey", "key[0]", "key[0].subkey"
    pub fn parse(path: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut current_key = String::new();
        let mut chars = path.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if !current_key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut current_key)));
                    }
                }
                '[' => {
                    if !current_key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut current_key)));
                    }
                    let index_str: String = chars.by_ref().take_while(|c| *c != ']').collect();
                    let idx: usize = index_str.trim().parse().map_err(|_| {
                        Error::parse(format!("Invalid array index in path '{}': {}", path, index_str))
                    })?;
                    segments.push(PathSegment::Index(idx));
                }
                ']' => {
                    return Err(Error::parse(format!("Unexpected ']' in path '{}'", path)));
                }
                _ => current_key.push(c),
            }
        }

        if !current_key.is_empty() {
            segments.push(PathSegment::Key(current_key));
        }

        Ok(ConfigPath(segments))
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, segment: PathSegment) {
        self.0.push(segment);
    }

    pub fn pop(&mut self) -> Option<PathSegment> {
        self.0.pop()
    }

    /// A new path one key deeper
    pub fn child(&self, key: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.push(PathSegment::Key(key.into()));
        next
    }

    /// First segment as a key, if any
    pub fn first_key(&self) -> Option<&str> {
        match self.0.first()? {
            PathSegment::Key(k) => Some(k),
            PathSegment::Index(_) => None,
        }
    }

    /// True when `prefix` addresses this path or one of its ancestors
    pub fn starts_with(&self, prefix: &ConfigPath) -> bool {
        prefix.0.len() <= self.0.len()
            && prefix.0.iter().zip(&self.0).all(|(a, b)| a.matches(b))
    }

    /// True when one path is an ancestor of (or equal to) the other
    pub fn overlaps(&self, other: &ConfigPath) -> bool {
        self.starts_with(other) || other.starts_with(self)
    }
}

impl From<Vec<PathSegment>> for ConfigPath {
    fn from(segments: Vec<PathSegment>) -> Self {
        ConfigPath(segments)
    }
}

impl fmt::Display for ConfigPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(k) if i == 0 => write!(f, "{}", k)?,
                PathSegment::Key(k) => write!(f, ".{}", k)?,
                PathSegment::Index(idx) => write!(f, "[{}]", idx)?,
            }
        }
        Ok(())
    }
}
