use std::collections::HashSet;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_with::{serde_as, DefaultOnNull};

use crate::contexts::context::{Context, Kind};
use crate::error::EvalError;
use crate::eval::{Detail, Reason};
use crate::flag_value::FlagValue;
use crate::rule::FlagRule;
use crate::variation::{BucketResult, VariationIndex, VariationOrRollout};

/// A feature flag: the variations it can serve and the targeting that chooses among them.
///
/// Flags are deserialized from the data an external source delivers and never change during
/// an evaluation.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Flag {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    pub(crate) on: bool,

    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) targets: Vec<Target>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) context_targets: Vec<Target>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) rules: Vec<FlagRule>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) prerequisites: Vec<Prereq>,

    pub(crate) fallthrough: VariationOrRollout,
    #[serde(default)]
    pub(crate) off_variation: Option<VariationIndex>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    variations: Vec<FlagValue>,

    #[serde(flatten)]
    client_visibility: ClientVisibility,

    #[serde(default)]
    salt: String,

    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default)]
    pub debug_events_until_date: Option<u64>,

    /// One in this many evaluation events should be sent; 0 and 1 both mean every event.
    #[serde(default)]
    pub sampling_ratio: Option<u32>,
    #[serde(default)]
    pub exclude_from_summaries: bool,
    #[serde(default)]
    pub migration: Option<MigrationFlagParameters>,
}

// Flag data either carries the legacy clientSide boolean or the clientSideAvailability object;
// this reads whichever is present.
#[derive(Clone, Debug, PartialEq)]
struct ClientVisibility {
    client_side_availability: ClientSideAvailability,
}

impl<'de> Deserialize<'de> for ClientVisibility {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "camelCase")]
        enum Field {
            ClientSide,
            ClientSideAvailability,
            #[serde(other)]
            Other,
        }

        struct ClientVisibilityVisitor;

        impl<'de> Visitor<'de> for ClientVisibilityVisitor {
            type Value = ClientVisibility;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("struct ClientVisibility")
            }

            fn visit_map<V>(self, mut map: V) -> Result<ClientVisibility, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut client_side: Option<Option<bool>> = None;
                let mut client_side_availability: Option<Option<ClientSideAvailability>> = None;

                while let Some(k) = map.next_key()? {
                    match k {
                        Field::ClientSide => client_side = Some(map.next_value()?),
                        Field::ClientSideAvailability => {
                            client_side_availability = Some(map.next_value()?)
                        }
                        Field::Other => {
                            map.next_value::<serde::de::IgnoredAny>()?;
                        }
                    }
                }

                // the availability object takes precedence over the legacy boolean
                let client_side_availability = client_side_availability.flatten().unwrap_or_else(|| {
                    ClientSideAvailability {
                        using_environment_id: client_side.flatten().unwrap_or_default(),
                        using_mobile_key: true,
                    }
                });

                Ok(ClientVisibility {
                    client_side_availability,
                })
            }
        }

        const FIELDS: &[&str] = &["clientSide", "clientSideAvailability"];
        deserializer.deserialize_struct("ClientVisibility", FIELDS, ClientVisibilityVisitor)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Prereq {
    pub key: String,
    pub variation: VariationIndex,
}

/// Context keys that are served a specific variation.
///
/// In `targets` the kind is always "user"; `contextTargets` name the kind explicitly.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Target {
    #[serde(default)]
    pub(crate) context_kind: Kind,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub(crate) values: HashSet<String>,
    pub(crate) variation: VariationIndex,
}

impl Target {
    pub(crate) fn matches(&self, context: &Context) -> bool {
        context
            .as_kind(&self.context_kind)
            .map_or(false, |individual| self.values.contains(individual.key()))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    pub using_mobile_key: bool,
    pub using_environment_id: bool,
}

/// Parameters of a flag used to control a migration.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MigrationFlagParameters {
    /// One in this many migration operations should compare old and new results.
    #[serde(default)]
    pub check_ratio: Option<u32>,
}

impl Flag {
    /// Returns the variation at `index` with the given reason, or a malformed-flag error if the
    /// flag has no such variation.
    pub fn variation(&self, index: VariationIndex, reason: Reason) -> Detail<&FlagValue> {
        Detail {
            value: self.variations.get(index),
            variation_index: Some(index),
            reason,
            big_segments_status: None,
        }
        .should_have_value(crate::Error::MalformedFlag)
    }

    /// The off variation with the given reason, or no value if the flag has no off variation.
    pub(crate) fn off_value(&self, reason: Reason) -> Result<Detail<&FlagValue>, EvalError> {
        match self.off_variation {
            Some(index) => self.checked_variation(index, reason),
            None => Ok(Detail::empty(reason)),
        }
    }

    /// Like [Flag::variation], but an index the flag has no variation for is a data error.
    pub(crate) fn checked_variation(
        &self,
        index: VariationIndex,
        reason: Reason,
    ) -> Result<Detail<&FlagValue>, EvalError> {
        if index < self.variations.len() {
            Ok(self.variation(index, reason))
        } else {
            Err(EvalError::VariationOutOfRange(index))
        }
    }

    pub fn using_environment_id(&self) -> bool {
        self.client_visibility
            .client_side_availability
            .using_environment_id
    }

    pub fn using_mobile_key(&self) -> bool {
        self.client_visibility
            .client_side_availability
            .using_mobile_key
    }

    pub(crate) fn resolve_variation_or_rollout(
        &self,
        vr: &VariationOrRollout,
        context: &Context,
    ) -> Result<BucketResult, EvalError> {
        vr.resolve(&self.key, &self.salt, context)
    }

    /// True if evaluations producing `reason` should be tracked in full for experimentation.
    pub fn is_experimentation_enabled(&self, reason: &Reason) -> bool {
        match reason {
            _ if reason.is_in_experiment() => true,
            Reason::Fallthrough { .. } => self.track_events_fallthrough,
            Reason::RuleMatch { rule_index, .. } => self
                .rules
                .get(*rule_index)
                .map(|rule| rule.track_events)
                .unwrap_or(false),
            _ => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_boolean_flag_with_segment_match(segment_keys: &[&str]) -> Self {
        Self {
            key: "feature".to_string(),
            version: 1,
            on: true,
            targets: vec![],
            context_targets: vec![],
            rules: vec![FlagRule::new_segment_match(segment_keys, 1)],
            prerequisites: vec![],
            fallthrough: VariationOrRollout::Variation { variation: 0 },
            off_variation: Some(0),
            variations: vec![FlagValue::Bool(false), FlagValue::Bool(true)],
            client_visibility: ClientVisibility {
                client_side_availability: ClientSideAvailability {
                    using_mobile_key: false,
                    using_environment_id: false,
                },
            },
            salt: "xyz".to_string(),
            track_events: false,
            track_events_fallthrough: false,
            debug_events_until_date: None,
            sampling_ratio: None,
            exclude_from_summaries: false,
            migration: None,
        }
    }
}
