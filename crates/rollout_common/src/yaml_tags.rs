//! YAML tag handling
//!
//! Host Status documents embed image content descriptors under a custom
//! `!image` tag. Tagged nodes are resolved through a table of handlers keyed
//! by tag name; each handler turns the tagged node into a plain value so the
//! typed model never sees a tag. A tag with no handler is a parse error.

use crate::error::{Result, RolloutError};
use serde_yaml::value::TaggedValue;
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;

/// Tag used for image content descriptors (`url`, `sha256`/`sha384`, `length`).
pub const IMAGE_TAG: &str = "image";

/// Converts the payload of a tagged node into an untagged value.
pub type TagHandler = fn(Value) -> Result<Value>;

/// Table of tag handlers keyed by tag name (without the leading `!`).
#[derive(Clone)]
pub struct TagRegistry {
    handlers: HashMap<String, TagHandler>,
}

impl TagRegistry {
    /// Registry with no handlers: every tag is rejected.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with the tags emitted by the remote engine.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(IMAGE_TAG, accept_mapping);
        registry
    }

    pub fn register(&mut self, name: &str, handler: TagHandler) {
        self.handlers
            .insert(name.trim_start_matches('!').to_string(), handler);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name.trim_start_matches('!'))
    }

    /// Walk `value` and replace every tagged node with its handler's output.
    pub fn resolve(&self, value: Value) -> Result<Value> {
        match value {
            Value::Tagged(tagged) => {
                let TaggedValue { tag, value } = *tagged;
                let name = tag.to_string().trim_start_matches('!').to_string();
                let handler = self
                    .handlers
                    .get(&name)
                    .ok_or_else(|| RolloutError::UnknownTag(name.clone()))?;
                let inner = self.resolve(value)?;
                handler(inner)
            }
            Value::Sequence(seq) => Ok(Value::Sequence(
                seq.into_iter()
                    .map(|item| self.resolve(item))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Mapping(map) => {
                let mut out = Mapping::with_capacity(map.len());
                for (key, item) in map {
                    out.insert(self.resolve(key)?, self.resolve(item)?);
                }
                Ok(Value::Mapping(out))
            }
            other => Ok(other),
        }
    }

    /// Parse YAML text and resolve its tags.
    pub fn parse(&self, text: &str) -> Result<Value> {
        let raw: Value =
            serde_yaml::from_str(text).map_err(|e| RolloutError::Parse(e.to_string()))?;
        self.resolve(raw)
    }
}

impl Default for TagRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Handler for descriptor tags: the payload must be a mapping and is kept as-is.
pub fn accept_mapping(value: Value) -> Result<Value> {
    match value {
        Value::Mapping(_) => Ok(value),
        other => Err(RolloutError::Parse(format!(
            "tagged image descriptor must be a mapping, found {}",
            value_kind(&other)
        ))),
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}
