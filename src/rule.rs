use log::warn;
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::attribute_value::AttributeValue;
use crate::contexts::attribute_reference::{reference_for, Reference};
use crate::contexts::context::{Context, Kind};
use crate::error::EvalError;
use crate::eval::EvaluationState;
use crate::operator::{Op, Operator};
use crate::variation::VariationOrRollout;

/// A single condition of a flag rule or segment rule.
///
/// The operator's comparison data (value sets, compiled patterns, parsed dates and versions) is
/// prepared when the clause is deserialized.
#[derive(Clone, Debug, Deserialize)]
#[serde(from = "ClauseRepr")]
pub struct Clause {
    context_kind: Kind,
    attribute: Reference,
    negate: bool,
    op: Op,
    values: Vec<AttributeValue>,
    operator: Operator,
}

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClauseRepr {
    #[serde(default)]
    context_kind: Option<Kind>,
    #[serde(default)]
    attribute: String,
    #[serde(default)]
    negate: bool,
    op: Op,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    values: Vec<AttributeValue>,
}

impl From<ClauseRepr> for Clause {
    fn from(repr: ClauseRepr) -> Self {
        let attribute = reference_for(&repr.attribute, repr.context_kind.is_some());
        Clause::new(
            repr.context_kind.unwrap_or_default(),
            attribute,
            repr.op,
            repr.values,
            repr.negate,
        )
    }
}

// The prepared operator is derived from `op` and `values`.
impl PartialEq for Clause {
    fn eq(&self, other: &Self) -> bool {
        self.context_kind == other.context_kind
            && self.attribute == other.attribute
            && self.negate == other.negate
            && self.op == other.op
            && self.values == other.values
    }
}

impl Clause {
    pub(crate) fn new(
        context_kind: Kind,
        attribute: Reference,
        op: Op,
        values: Vec<AttributeValue>,
        negate: bool,
    ) -> Self {
        let operator = Operator::new(&op, &values);
        Clause {
            context_kind,
            attribute,
            negate,
            op,
            values,
            operator,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_match(attribute: &str, values: Vec<AttributeValue>, op: Op) -> Self {
        Clause::new(Kind::user(), Reference::literal(attribute), op, values, false)
    }

    #[cfg(test)]
    pub(crate) fn new_segment_match(segment_keys: &[&str]) -> Self {
        Clause::new(
            Kind::user(),
            Reference::default(),
            Op::SegmentMatch,
            segment_keys.iter().map(|key| (*key).into()).collect(),
            false,
        )
    }

    #[cfg(test)]
    pub(crate) fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub(crate) fn matches(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        match self.op {
            Op::SegmentMatch => self
                .matches_segment(context, state)
                .map(|matched| self.maybe_negate(matched)),
            _ => self.matches_non_segment(context),
        }
    }

    fn maybe_negate(&self, v: bool) -> bool {
        if self.negate {
            !v
        } else {
            v
        }
    }

    fn matches_segment(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        for segment_key in self.values.iter().filter_map(AttributeValue::as_str) {
            if let Some(segment) = state.segment(segment_key) {
                if segment.contains(context, state)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    fn matches_non_segment(&self, context: &Context) -> Result<bool, EvalError> {
        if let Some(error) = EvalError::invalid_reference(&self.attribute) {
            return Err(error);
        }

        if self.attribute.is_kind() {
            let any_kind = context.kinds().into_iter().any(|kind| {
                self.operator
                    .matches_any(&AttributeValue::String(kind.to_string()), &self.values)
            });
            return Ok(self.maybe_negate(any_kind));
        }

        let value = match context
            .as_kind(&self.context_kind)
            .and_then(|individual| individual.get_value(&self.attribute))
        {
            Some(value) => value,
            // a missing attribute never matches, negated or not
            None => return Ok(false),
        };

        match value.as_ref() {
            AttributeValue::Null | AttributeValue::Object(_) => Ok(false),
            AttributeValue::Array(elements) => {
                for element in elements {
                    if let AttributeValue::Array(_) | AttributeValue::Object(_) = element {
                        warn!(
                            "attribute '{}' is an array containing an array or object, which clauses cannot match",
                            self.attribute
                        );
                        return Ok(false);
                    }
                    if self.operator.matches_any(element, &self.values) {
                        return Ok(self.maybe_negate(true));
                    }
                }
                Ok(self.maybe_negate(false))
            }
            single => Ok(self.maybe_negate(self.operator.matches_any(single, &self.values))),
        }
    }
}

#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default)]
    pub id: String,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

impl FlagRule {
    /// A rule matches if all of its clauses do.
    pub(crate) fn matches(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        for clause in &self.clauses {
            if !clause.matches(context, state)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    #[cfg(test)]
    pub(crate) fn new_segment_match(segment_keys: &[&str], variation: usize) -> Self {
        FlagRule {
            id: "rule".to_string(),
            clauses: vec![Clause::new_segment_match(segment_keys)],
            variation_or_rollout: VariationOrRollout::Variation { variation },
            track_events: false,
        }
    }
}
