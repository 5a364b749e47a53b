//! Registered key schemas and their typed instances.
//!
//! A key schema is a relpath pattern. Patterns without `{name}` placeholders
//! register static keys with a single fixed relpath; patterns with
//! placeholders yield one typed key per parameter substitution. Placeholders
//! match one path segment, so parameter values may not contain `/`.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::char,
    combinator::{all_consuming, map},
    multi::separated_list1,
    sequence::delimited,
    IResult, Parser,
};

use crate::error::{Error, Result};
use crate::value::ValueKind;

/// One segment of a key pattern: a literal path component or a `{name}`
/// placeholder standing for exactly one component.
#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn ident(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_').parse(input)
}

fn segment(input: &str) -> IResult<&str, Segment> {
    alt((
        map(delimited(char('{'), ident, char('}')), |name: &str| {
            Segment::Param(name.to_string())
        }),
        map(
            take_while1(|c: char| c != '/' && c != '{' && c != '}'),
            |text: &str| Segment::Literal(text.to_string()),
        ),
    ))
    .parse(input)
}

fn parse_pattern(pattern: &str) -> Result<Vec<Segment>> {
    match all_consuming(separated_list1(char('/'), segment)).parse(pattern) {
        Ok((_, segments)) => Ok(segments),
        Err(_) => Err(Error::Other(format!("malformed key pattern {pattern:?}"))),
    }
}

/// A registered key schema: name, relpath pattern and declared value kind.
#[derive(Debug)]
pub struct Key {
    name: String,
    pattern: String,
    segments: Vec<Segment>,
    kind: ValueKind,
}

impl Key {
    pub(crate) fn new(name: &str, pattern: &str, kind: ValueKind) -> Result<Key> {
        let segments = parse_pattern(pattern)?;
        Ok(Key {
            name: name.to_string(),
            pattern: pattern.to_string(),
            segments,
            kind,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// True if the pattern carries `{name}` placeholders.
    pub fn is_parameterized(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Param(_)))
    }

    /// Returns the typed key of a static schema.
    pub fn typed(&self) -> Result<TypedKey> {
        if self.is_parameterized() {
            return Err(Error::InvalidParam(format!(
                "key {} requires parameters",
                self.name
            )));
        }
        Ok(TypedKey {
            name: self.name.clone(),
            relpath: self.pattern.clone(),
            kind: self.kind,
            params: BTreeMap::new(),
        })
    }

    /// Substitutes `params` into the pattern and returns the typed key.
    /// Parameter values may not contain `/`; every placeholder must be
    /// supplied.
    pub fn resolve(&self, params: &[(&str, &str)]) -> Result<TypedKey> {
        let mut map = BTreeMap::new();
        for (name, value) in params {
            if value.contains('/') {
                return Err(Error::InvalidParam(format!(
                    "value {value:?} for parameter {name} contains a slash"
                )));
            }
            map.insert(name.to_string(), value.to_string());
        }
        let mut parts = Vec::with_capacity(self.segments.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => parts.push(text.as_str()),
                Segment::Param(name) => match map.get(name) {
                    Some(value) => parts.push(value.as_str()),
                    None => {
                        return Err(Error::InvalidParam(format!(
                            "missing parameter {name} for key {}",
                            self.name
                        )))
                    }
                },
            }
        }
        Ok(TypedKey {
            name: self.name.clone(),
            relpath: parts.join("/"),
            kind: self.kind,
            params: map,
        })
    }

    /// Extracts the parameter map from a relpath produced by this pattern.
    /// Returns an empty map when the relpath does not match.
    pub fn extract_params(&self, relpath: &str) -> BTreeMap<String, String> {
        let components: Vec<&str> = relpath.split('/').collect();
        if components.len() != self.segments.len() {
            return BTreeMap::new();
        }
        let mut params = BTreeMap::new();
        for (segment, component) in self.segments.iter().zip(components) {
            match segment {
                Segment::Literal(text) => {
                    if text != component {
                        return BTreeMap::new();
                    }
                }
                Segment::Param(name) => {
                    if component.is_empty() {
                        return BTreeMap::new();
                    }
                    params.insert(name.clone(), component.to_string());
                }
            }
        }
        params
    }

    /// Returns the typed key for a relpath known to belong to this schema.
    pub(crate) fn derive(&self, relpath: &str) -> TypedKey {
        TypedKey {
            name: self.name.clone(),
            relpath: relpath.to_string(),
            kind: self.kind,
            params: self.extract_params(relpath),
        }
    }
}

/// A concrete key instance: a relpath plus the schema it came from.
/// Identity is the relpath alone.
#[derive(Debug, Clone)]
pub struct TypedKey {
    name: String,
    relpath: String,
    kind: ValueKind,
    params: BTreeMap<String, String>,
}

impl TypedKey {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn relpath(&self) -> &str {
        &self.relpath
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

impl PartialEq for TypedKey {
    fn eq(&self, other: &Self) -> bool {
        self.relpath == other.relpath
    }
}

impl Eq for TypedKey {}

impl Hash for TypedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.relpath.hash(state);
    }
}

/// All key schemas registered with an engine, by name.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    keys: HashMap<String, Arc<Key>>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema. Registering the same name again replaces the
    /// earlier schema.
    pub fn add(&mut self, name: &str, pattern: &str, kind: ValueKind) -> Result<Arc<Key>> {
        let key = Arc::new(Key::new(name, pattern, kind)?);
        self.keys.insert(name.to_string(), key.clone());
        Ok(key)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Key>> {
        self.keys.get(name).cloned()
    }
}
