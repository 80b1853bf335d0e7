use std::collections::HashMap;
use std::convert::TryFrom;

use serde::de::{Error as _, IgnoredAny};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use super::context::Context;
use super::context_builder::{ContextBuilder, MultiContextBuilder};
use crate::AttributeValue;

/// The three JSON shapes a context can arrive in, told apart by the "kind" property.
#[derive(Debug)]
pub(super) enum ContextVariant {
    /// `{"kind": "multi", "user": {...}, "org": {...}}`
    Multi(Vec<(String, SingleKindBody)>),
    /// `{"kind": "org", "key": ..., ...}`
    Single(String, SingleKindBody),
    /// Pre-context user data, which has no "kind" property.
    ImplicitUser(ImplicitUser),
}

impl<'de> Deserialize<'de> for ContextVariant {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut map = Map::deserialize(deserializer)?;
        let kind = match map.remove("kind") {
            None => {
                return serde_json::from_value(Value::Object(map))
                    .map(ContextVariant::ImplicitUser)
                    .map_err(D::Error::custom)
            }
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(D::Error::custom(format!(
                    "context kind must be a string, got {}",
                    other
                )))
            }
        };

        if kind != "multi" {
            let body = serde_json::from_value(Value::Object(map)).map_err(D::Error::custom)?;
            return Ok(ContextVariant::Single(kind, body));
        }

        map.into_iter()
            .map(|(kind, body)| {
                serde_json::from_value(body)
                    .map(|body| (kind, body))
                    .map_err(D::Error::custom)
            })
            .collect::<Result<Vec<_>, _>>()
            .map(ContextVariant::Multi)
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct SingleKindBody {
    key: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    anonymous: Option<bool>,
    // Private attribute metadata only matters to analytics.
    #[serde(rename = "_meta", default)]
    _meta: Option<IgnoredAny>,
    #[serde(flatten)]
    attributes: HashMap<String, AttributeValue>,
}

impl SingleKindBody {
    fn into_builder(self, kind: String) -> ContextBuilder {
        let mut builder = ContextBuilder::new(self.key);
        builder.kind(kind).anonymous(self.anonymous.unwrap_or_default());
        if let Some(name) = self.name {
            builder.name(name);
        }
        for (name, value) in self.attributes {
            builder.set_value(&name, value);
        }
        builder
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ImplicitUser {
    key: String,
    #[serde(default)]
    secondary: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    anonymous: Option<bool>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    custom: Option<HashMap<String, AttributeValue>>,
}

const IMPLICIT_USER_RESERVED: &[&str] = &["kind", "key", "name", "anonymous", "_meta"];

impl ImplicitUser {
    fn into_builder(self) -> ContextBuilder {
        let mut builder = ContextBuilder::new(self.key);
        builder
            .allow_empty_key()
            .anonymous(self.anonymous.unwrap_or_default());
        if let Some(name) = self.name {
            builder.name(name);
        }
        if let Some(secondary) = self.secondary {
            builder.secondary(secondary);
        }

        let legacy_strings = [
            ("ip", self.ip),
            ("email", self.email),
            ("avatar", self.avatar),
            ("firstName", self.first_name),
            ("lastName", self.last_name),
            ("country", self.country),
        ];
        for (name, value) in legacy_strings {
            if let Some(value) = value {
                builder.set_string(name, value);
            }
        }

        for (name, value) in self.custom.unwrap_or_default() {
            if !IMPLICIT_USER_RESERVED.contains(&name.as_str()) {
                builder.set_value(&name, value);
            }
        }
        builder
    }
}

impl TryFrom<ContextVariant> for Context {
    type Error = String;

    fn try_from(variant: ContextVariant) -> Result<Self, Self::Error> {
        match variant {
            ContextVariant::ImplicitUser(user) => user.into_builder().build(),
            ContextVariant::Single(kind, body) => body.into_builder(kind).build(),
            ContextVariant::Multi(bodies) => {
                if bodies.len() < 2 {
                    return Err("multi-context must contain at least two kinds".to_owned());
                }
                let mut builder = MultiContextBuilder::new();
                for (kind, body) in bodies {
                    builder.add_context(body.into_builder(kind).build()?);
                }
                builder.build()
            }
        }
    }
}
