use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Serialize};

use super::attribute_reference::Reference;
use super::context_serde::ContextVariant;
use crate::AttributeValue;

const USER_KIND: &str = "user";
const MULTI_KIND: &str = "multi";

/// Kind describes the type of entity represented by a [Context], such as "user" or "org".
///
/// Any name made of ASCII letters, digits, `.`, `-` and `_` is allowed except "kind" and
/// "multi". To construct a kind other than ["user"](Kind::user), see [Kind::try_from].
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Kind(Cow<'static, str>);

impl Kind {
    /// Constructs the default kind, "user".
    pub fn user() -> Self {
        Self(Cow::Borrowed(USER_KIND))
    }

    pub(crate) fn multi() -> Self {
        Self(Cow::Borrowed(MULTI_KIND))
    }

    /// Returns true if the kind is "user".
    pub fn is_user(&self) -> bool {
        self.0 == USER_KIND
    }

    /// Returns true if the kind is "multi", which only multi-contexts carry.
    pub fn is_multi(&self) -> bool {
        self.0 == MULTI_KIND
    }

    #[cfg(test)]
    // Skips validation.
    pub(crate) fn from(s: &str) -> Self {
        Kind(Cow::Owned(s.to_owned()))
    }
}

impl AsRef<str> for Kind {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Ord for Kind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(other.as_ref())
    }
}

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq<str> for Kind {
    fn eq(&self, other: &str) -> bool {
        self.as_ref() == other
    }
}

impl PartialEq<&str> for Kind {
    fn eq(&self, other: &&str) -> bool {
        self.as_ref() == *other
    }
}

impl Default for Kind {
    fn default() -> Self {
        Kind::user()
    }
}

impl TryFrom<&str> for Kind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            USER_KIND => Ok(Kind::user()),
            "" => Err("context kind cannot be empty".into()),
            "kind" | MULTI_KIND => Err(format!("context kind cannot be '{}'", value)),
            k if !k
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_')) =>
            {
                Err(format!("context kind '{}' contains disallowed characters", k))
            }
            _ => Ok(Kind(Cow::Owned(value.to_owned()))),
        }
    }
}

impl TryFrom<String> for Kind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Kind::try_from(value.as_str())
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl Serialize for Kind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_ref())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Kind::try_from(s).map_err(D::Error::custom)
    }
}

/// Context is the subject of a flag evaluation: a collection of attributes grouped under one or
/// more [Kind]s.
///
/// A context might describe the user of a service, an organization, a device, or any
/// combination of those at once. Single-kind contexts are created with
/// [crate::ContextBuilder]; multi-contexts with [crate::MultiContextBuilder]. Contexts are
/// immutable once built, and every `Context` value is valid: builders and the JSON decoder
/// return an error instead of an invalid context.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "ContextVariant")]
pub struct Context {
    // For multi-contexts, kind is always Kind::multi().
    pub(super) kind: Kind,
    // Only present for multi-contexts, sorted by kind.
    pub(super) contexts: Option<Vec<Context>>,
    pub(super) key: String,
    pub(super) canonical_key: String,
    pub(super) name: Option<String>,
    pub(super) anonymous: bool,
    pub(super) attributes: HashMap<String, AttributeValue>,
    // Only obtainable from legacy user JSON.
    pub(super) secondary: Option<String>,
}

impl Context {
    /// Returns true if the context is a multi-context.
    pub fn is_multi(&self) -> bool {
        self.kind.is_multi()
    }

    /// Returns the "kind" attribute.
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Returns the "key" attribute. A multi-context has no key of its own and returns "".
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns a key that is unique across every (kind, key) pair in this context.
    ///
    /// A single "user" context uses its key as-is. Other single contexts use `kind:key`, with
    /// the key URL-encoded. A multi-context joins the `kind:key` form of each of its contexts
    /// with ':'.
    pub fn canonical_key(&self) -> &str {
        &self.canonical_key
    }

    /// Returns the individual context of the given kind, which for a single context is the
    /// context itself when its kind matches.
    pub fn as_kind(&self, kind: &Kind) -> Option<&Context> {
        match &self.contexts {
            Some(contexts) => contexts.iter().find(|c| &c.kind == kind),
            None => (&self.kind == kind).then_some(self),
        }
    }

    /// Returns every kind this context contains.
    pub fn kinds(&self) -> Vec<&Kind> {
        match &self.contexts {
            Some(contexts) => contexts.iter().map(Context::kind).collect(),
            None => vec![&self.kind],
        }
    }

    pub(crate) fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    /// Looks up an attribute, or a value nested inside an object attribute, as flag rules see
    /// it.
    ///
    /// The built-in attributes "kind", "key", "name" and "anonymous" are resolved first; any
    /// other first path component names a custom attribute, and later components walk into
    /// object values. A multi-context only resolves "kind"; use [Context::as_kind] to reach the
    /// attributes of one of its kinds.
    ///
    /// Values set by a builder are borrowed; built-in values are produced on demand.
    pub fn get_value(&self, reference: &Reference) -> Option<Cow<'_, AttributeValue>> {
        let first = reference.component(0)?;

        if self.is_multi() {
            return (reference.depth() == 1 && first == "kind")
                .then(|| Cow::Owned(AttributeValue::String(self.kind.to_string())));
        }

        let builtin = match first {
            "kind" => Some(AttributeValue::String(self.kind.to_string())),
            "key" => Some(AttributeValue::String(self.key.clone())),
            "name" => Some(AttributeValue::String(self.name.clone()?)),
            "anonymous" => Some(AttributeValue::Bool(self.anonymous)),
            _ => None,
        };
        if let Some(value) = builtin {
            return (reference.depth() == 1).then_some(Cow::Owned(value));
        }

        let mut value = self.attributes.get(first)?;
        for depth in 1..reference.depth() {
            match value {
                AttributeValue::Object(map) => value = map.get(reference.component(depth)?)?,
                _ => return None,
            }
        }
        Some(Cow::Borrowed(value))
    }
}
