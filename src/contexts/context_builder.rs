use std::collections::HashMap;
use std::convert::TryFrom;

use itertools::Itertools;
use log::warn;
use urlencoding::encode;

use super::context::{Context, Kind};
use crate::AttributeValue;

// Most multi-contexts combine a user with one or two other kinds.
const DEFAULT_MULTI_BUILDER_CAPACITY: usize = 3;

/// Builds a single-kind [Context].
///
/// Unless changed, the context's kind is "user", its key is the one passed to
/// [ContextBuilder::new], it is not anonymous and it has no other attributes.
///
/// Setters return the builder so calls can be chained; [ContextBuilder::build] validates the
/// result and may be called repeatedly.
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    kind: String,
    key: String,
    name: Option<String>,
    anonymous: bool,
    secondary: Option<String>,
    attributes: HashMap<String, AttributeValue>,
    // Legacy user JSON may carry an empty key.
    allow_empty_key: bool,
}

impl ContextBuilder {
    /// Create a new context builder with the provided "key" attribute.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            kind: "user".to_owned(),
            key: key.into(),
            name: None,
            anonymous: false,
            secondary: None,
            attributes: HashMap::new(),
            allow_empty_key: false,
        }
    }

    /// Sets the context's kind. An invalid kind (see [Kind]) makes [ContextBuilder::build]
    /// fail.
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = kind.into();
        self
    }

    /// Sets the context's key. An empty key makes [ContextBuilder::build] fail.
    pub fn key(&mut self, key: impl Into<String>) -> &mut Self {
        self.key = key.into();
        self
    }

    /// Sets the "name" attribute.
    pub fn name(&mut self, name: impl Into<String>) -> &mut Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the "anonymous" attribute.
    pub fn anonymous(&mut self, value: bool) -> &mut Self {
        self.anonymous = value;
        self
    }

    /// Sets a boolean attribute. See [ContextBuilder::set_value].
    pub fn set_bool(&mut self, attribute_name: &str, value: bool) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::Bool(value))
    }

    /// Sets a numeric attribute. See [ContextBuilder::set_value].
    pub fn set_float(&mut self, attribute_name: &str, value: f64) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::Number(value))
    }

    /// Sets a string attribute. See [ContextBuilder::set_value].
    pub fn set_string(&mut self, attribute_name: &str, value: impl Into<String>) -> &mut Self {
        self.set_value(attribute_name, AttributeValue::String(value.into()))
    }

    /// Sets any attribute, ignoring values that [ContextBuilder::try_set_value] rejects.
    pub fn set_value(&mut self, attribute_name: &str, value: AttributeValue) -> &mut Self {
        if !self.try_set_value(attribute_name, value) {
            warn!("ignoring invalid value for context attribute '{}'", attribute_name);
        }
        self
    }

    /// Sets any attribute, returning false if the value was rejected.
    ///
    /// "kind", "key" and "name" only accept strings (and "name" also accepts null to clear it);
    /// "anonymous" only accepts a boolean; "_meta" and the empty name are reserved. For every
    /// other attribute, null removes the attribute, since a null attribute behaves exactly like
    /// a missing one in flag rules.
    pub fn try_set_value(&mut self, attribute_name: &str, value: AttributeValue) -> bool {
        match (attribute_name, value) {
            ("" | "_meta", _) => false,
            ("kind", AttributeValue::String(s)) => {
                self.kind = s;
                true
            }
            ("key", AttributeValue::String(s)) => {
                self.key = s;
                true
            }
            ("name", AttributeValue::String(s)) => {
                self.name = Some(s);
                true
            }
            ("name", AttributeValue::Null) => {
                self.name = None;
                true
            }
            ("anonymous", AttributeValue::Bool(b)) => {
                self.anonymous = b;
                true
            }
            ("kind" | "key" | "name" | "anonymous", _) => false,
            (_, AttributeValue::Null) => {
                self.attributes.remove(attribute_name);
                true
            }
            (_, value) => {
                self.attributes.insert(attribute_name.to_owned(), value);
                true
            }
        }
    }

    pub(super) fn secondary(&mut self, value: impl Into<String>) -> &mut Self {
        self.secondary = Some(value.into());
        self
    }

    pub(super) fn allow_empty_key(&mut self) -> &mut Self {
        self.allow_empty_key = true;
        self
    }

    /// Creates a context from the builder's current state, or describes why it is invalid.
    pub fn build(&self) -> Result<Context, String> {
        let kind = Kind::try_from(self.kind.as_str())?;
        if !self.allow_empty_key && self.key.is_empty() {
            return Err("context key cannot be empty".to_owned());
        }

        Ok(Context {
            canonical_key: canonical_key_for_kind(&kind, &self.key, true),
            kind,
            contexts: None,
            key: self.key.clone(),
            name: self.name.clone(),
            anonymous: self.anonymous,
            attributes: self.attributes.clone(),
            secondary: self.secondary.clone(),
        })
    }
}

fn canonical_key_for_kind(kind: &Kind, key: &str, omit_user_kind: bool) -> String {
    if omit_user_kind && kind.is_user() {
        return key.to_owned();
    }
    format!("{}:{}", kind, encode(key))
}

/// Builds a [Context] containing several kinds.
///
/// Adding a multi-context adds each of its individual contexts. Building fails if no context
/// was added or a kind appears twice; building with a single context returns that context.
#[derive(Clone, Debug, Default)]
pub struct MultiContextBuilder {
    contexts: Vec<Context>,
}

impl MultiContextBuilder {
    /// Create an empty multi-context builder.
    pub fn new() -> Self {
        Self {
            contexts: Vec::with_capacity(DEFAULT_MULTI_BUILDER_CAPACITY),
        }
    }

    /// Create a multi-context builder holding the given contexts.
    pub fn of(contexts: Vec<Context>) -> Self {
        let mut builder = Self::new();
        for context in contexts {
            builder.add_context(context);
        }
        builder
    }

    /// Adds a context, or every individual context of a multi-context.
    pub fn add_context(&mut self, context: Context) -> &mut Self {
        match context.contexts {
            Some(contexts) => self.contexts.extend(contexts),
            None => self.contexts.push(context),
        }
        self
    }

    /// Creates the multi-context, or describes why it is invalid.
    pub fn build(&self) -> Result<Context, String> {
        match self.contexts.as_slice() {
            [] => return Err("multi-context must contain at least one context".to_owned()),
            [single] => return Ok(single.clone()),
            _ => (),
        }

        let contexts: Vec<Context> = self
            .contexts
            .iter()
            .sorted_by(|a, b| a.kind.cmp(&b.kind))
            .cloned()
            .collect();

        if let Some((duplicate, _)) = contexts
            .iter()
            .tuple_windows()
            .find(|(a, b)| a.kind == b.kind)
        {
            return Err(format!(
                "multi-context cannot contain kind '{}' more than once",
                duplicate.kind
            ));
        }

        let canonical_key = contexts
            .iter()
            .map(|c| canonical_key_for_kind(&c.kind, &c.key, false))
            .join(":");

        Ok(Context {
            kind: Kind::multi(),
            contexts: Some(contexts),
            key: String::new(),
            canonical_key,
            name: None,
            anonymous: false,
            attributes: HashMap::new(),
            secondary: None,
        })
    }
}
