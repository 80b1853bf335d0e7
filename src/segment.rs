use std::collections::HashSet;

use log::debug;
use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::bucketing::{bucket_context, BucketPrefix};
use crate::contexts::attribute_reference::{reference_for, Reference};
use crate::contexts::context::{Context, Kind};
use crate::error::EvalError;
use crate::eval::EvaluationState;
use crate::rule::Clause;
use crate::variation::VariationWeight;
use crate::BigSegmentsStatus;

/// A reusable set of contexts, referenced from flag rules through the `segmentMatch` operator.
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,

    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub included: HashSet<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    pub excluded: HashSet<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    included_contexts: Vec<SegmentTarget>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    excluded_contexts: Vec<SegmentTarget>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    rules: Vec<SegmentRule>,
    #[serde(default)]
    salt: String,

    /// True for a big segment, whose membership lives in an external store.
    #[serde(default)]
    pub unbounded: bool,
    #[serde(default)]
    unbounded_context_kind: Option<Kind>,
    #[serde(default)]
    generation: Option<i64>,
}

/// Keys of contexts of one kind included in or excluded from a segment.
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct SegmentTarget {
    #[serde(default)]
    context_kind: Kind,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    values: HashSet<String>,
}

impl SegmentTarget {
    fn contains(&self, context: &Context) -> bool {
        context
            .as_kind(&self.context_kind)
            .map_or(false, |individual| self.values.contains(individual.key()))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "SegmentRuleRepr")]
struct SegmentRule {
    id: Option<String>,
    clauses: Vec<Clause>,
    weight: Option<VariationWeight>,
    bucket_by: Option<Reference>,
    rollout_context_kind: Kind,
}

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SegmentRuleRepr {
    #[serde(default)]
    id: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    clauses: Vec<Clause>,
    #[serde(default)]
    weight: Option<VariationWeight>,
    #[serde(default)]
    bucket_by: Option<String>,
    #[serde(default)]
    rollout_context_kind: Option<Kind>,
}

impl From<SegmentRuleRepr> for SegmentRule {
    fn from(repr: SegmentRuleRepr) -> Self {
        let has_context_kind = repr.rollout_context_kind.is_some();
        SegmentRule {
            id: repr.id,
            clauses: repr.clauses,
            weight: repr.weight,
            bucket_by: repr
                .bucket_by
                .map(|attr| reference_for(&attr, has_context_kind)),
            rollout_context_kind: repr.rollout_context_kind.unwrap_or_default(),
        }
    }
}

impl Segment {
    pub fn is_newer_than(&self, segment: &Segment) -> bool {
        self.version > segment.version
    }

    /// The reference a big-segment store uses for this segment's current membership data, or
    /// None if the segment is not a big segment with a generation.
    pub fn big_segment_ref(&self) -> Option<String> {
        match (self.unbounded, self.generation) {
            (true, Some(generation)) => Some(format!("{}.g{}", self.key, generation)),
            _ => None,
        }
    }

    /// Returns true if the context is a member of this segment.
    ///
    /// Rules of this segment may reference other segments; a segment that is reached again
    /// while its own membership is being decided is a data error.
    pub(crate) fn contains(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        state.push_segment(&self.key)?;
        let result = if self.unbounded {
            self.contains_unbounded(context, state)
        } else {
            self.contains_standard(context, state)
        };
        state.pop_segment();
        result
    }

    fn contains_unbounded(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        let segment_ref = match self.big_segment_ref() {
            Some(segment_ref) => segment_ref,
            None => {
                // written by an older data source that predates generations
                debug!(
                    "big segment '{}' has no generation and cannot be queried",
                    self.key
                );
                state.record_big_segments_status(BigSegmentsStatus::NotConfigured);
                return Ok(false);
            }
        };

        let kind = self.unbounded_context_kind.clone().unwrap_or_default();
        let individual = match context.as_kind(&kind) {
            Some(individual) => individual,
            None => return Ok(false),
        };

        match state.check_big_segment_membership(individual.key(), &segment_ref) {
            Some(included) => Ok(included),
            None => self.contains_by_rules(context, state),
        }
    }

    fn contains_standard(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        let user_key = context.as_kind(&Kind::user()).map(Context::key);

        if user_key.map_or(false, |key| self.included.contains(key)) {
            return Ok(true);
        }
        if self.included_contexts.iter().any(|t| t.contains(context)) {
            return Ok(true);
        }
        if user_key.map_or(false, |key| self.excluded.contains(key)) {
            return Ok(false);
        }
        if self.excluded_contexts.iter().any(|t| t.contains(context)) {
            return Ok(false);
        }

        self.contains_by_rules(context, state)
    }

    fn contains_by_rules(
        &self,
        context: &Context,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        for rule in &self.rules {
            if rule.matches(context, &self.key, &self.salt, state)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl SegmentRule {
    fn matches(
        &self,
        context: &Context,
        key: &str,
        salt: &str,
        state: &mut EvaluationState,
    ) -> Result<bool, EvalError> {
        // rules match if _all_ of their clauses do
        for clause in &self.clauses {
            if !clause.matches(context, state)? {
                return Ok(false);
            }
        }

        // buckets are never negative, so a negative weight admits no one
        match self.weight {
            Some(weight) => {
                let bucket = bucket_context(
                    context,
                    &self.rollout_context_kind,
                    self.bucket_by.as_ref(),
                    BucketPrefix::KeyAndSalt(key, salt),
                    false,
                )?;
                Ok(bucket.value < weight / 100_000.0)
            }
            None => Ok(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute_value::AttributeValue;
    use crate::operator::Op;
    use crate::test_common::{TestBigSegmentProvider, TestStore};
    use crate::{ContextBuilder, MultiContextBuilder};
    use maplit::hashset;
    use serde_json::json;
    use spectral::prelude::*;

    fn new_segment() -> Segment {
        Segment {
            key: "segkey".to_string(),
            salt: "salty".to_string(),
            version: 1,
            ..Segment::default()
        }
    }

    fn jane_rule(weight: Option<f32>, bucket_by: Option<&str>) -> SegmentRule {
        SegmentRule {
            id: None,
            clauses: vec![Clause::new_match("name", vec!["Jane".into()], Op::In)],
            weight,
            bucket_by: bucket_by.map(Reference::literal),
            rollout_context_kind: Kind::user(),
        }
    }

    fn thirty_percent_rule(bucket_by: Option<&str>) -> SegmentRule {
        SegmentRule {
            id: None,
            clauses: vec![Clause::new_match("key", vec![".".into()], Op::Matches)],
            weight: Some(30_000.0),
            bucket_by: bucket_by.map(Reference::literal),
            rollout_context_kind: Kind::user(),
        }
    }

    fn contains(segment: &Segment, context: &Context) -> Result<bool, EvalError> {
        let store = TestStore::default();
        let mut state = EvaluationState::new(&store, None);
        segment.contains(context, &mut state)
    }

    fn user(key: &str) -> Context {
        ContextBuilder::new(key).build().unwrap()
    }

    fn named_user(key: &str, name: &str) -> Context {
        ContextBuilder::new(key).name(name).build().unwrap()
    }

    #[test]
    fn parses_segment() {
        let segment: Segment = serde_json::from_value(json!({
            "key": "seg",
            "version": 3,
            "included": ["a"],
            "excluded": null,
            "includedContexts": [{"contextKind": "org", "values": ["o1"]}],
            "rules": [{
                "id": "r1",
                "clauses": [{"attribute": "name", "op": "matches", "values": ["xyz"]}],
                "weight": 10000,
                "bucketBy": "country"
            }],
            "salt": "s",
            "unbounded": true,
            "unboundedContextKind": "org",
            "generation": 2
        }))
        .unwrap();

        assert_that!(segment.included).is_equal_to(hashset! {"a".to_string()});
        assert_that!(segment.excluded.is_empty()).is_true();
        assert_that!(segment.included_contexts).is_equal_to(vec![SegmentTarget {
            context_kind: Kind::from("org"),
            values: hashset! {"o1".to_string()},
        }]);
        assert_that!(segment.rules).is_equal_to(vec![SegmentRule {
            id: Some("r1".to_string()),
            clauses: vec![Clause::new_match("name", vec!["xyz".into()], Op::Matches)],
            weight: Some(10_000.0),
            bucket_by: Some(Reference::literal("country")),
            rollout_context_kind: Kind::user(),
        }]);
        assert_that!(segment.big_segment_ref()).contains_value("seg.g2".to_string());
    }

    #[test]
    fn parses_rule_with_rollout_context_kind() {
        let rule: SegmentRule = serde_json::from_value(json!({
            "clauses": [], "weight": null, "bucketBy": "/company/id", "rolloutContextKind": "org"
        }))
        .unwrap();
        assert_eq!(rule.bucket_by, Some(Reference::new("/company/id")));
        assert_eq!(rule.rollout_context_kind, Kind::from("org"));
        assert_eq!(rule.weight, None);
    }

    #[test]
    fn explicitly_included_user() {
        let mut segment = new_segment();
        segment.included.insert("foo".to_string());
        segment.included.insert("bar".to_string());
        assert_that!(contains(&segment, &user("bar"))).is_ok_containing(true);
        assert_that!(contains(&segment, &user("baz"))).is_ok_containing(false);
    }

    #[test]
    fn explicitly_excluded_user_overrides_rules() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        segment.excluded.insert("foo".to_string());
        assert_that!(contains(&segment, &named_user("foo", "Jane"))).is_ok_containing(false);
        assert_that!(contains(&segment, &named_user("bar", "Jane"))).is_ok_containing(true);
    }

    #[test]
    fn includes_override_excludes() {
        let mut segment = new_segment();
        segment.included.insert("bar".to_string());
        segment.excluded.insert("bar".to_string());
        assert_that!(contains(&segment, &user("bar"))).is_ok_containing(true);
    }

    #[test]
    fn legacy_lists_only_apply_to_users() {
        let mut segment = new_segment();
        segment.included.insert("o1".to_string());
        let org = ContextBuilder::new("o1").kind("org").build().unwrap();
        assert_that!(contains(&segment, &org)).is_ok_containing(false);
    }

    #[test]
    fn context_targets_match_by_kind() {
        let mut segment = new_segment();
        segment.included_contexts.push(SegmentTarget {
            context_kind: Kind::from("org"),
            values: hashset! {"o1".to_string()},
        });
        segment.excluded_contexts.push(SegmentTarget {
            context_kind: Kind::from("device"),
            values: hashset! {"d1".to_string()},
        });
        segment.rules.push(SegmentRule {
            clauses: vec![],
            ..jane_rule(None, None)
        });

        let org = ContextBuilder::new("o1").kind("org").build().unwrap();
        let device = ContextBuilder::new("d1").kind("device").build().unwrap();
        let both = MultiContextBuilder::new()
            .add_context(org.clone())
            .add_context(device.clone())
            .build()
            .unwrap();

        assert_that!(contains(&segment, &org)).is_ok_containing(true);
        assert_that!(contains(&segment, &device)).is_ok_containing(false);
        assert_that!(contains(&segment, &both)).is_ok_containing(true);
        assert_that!(contains(&segment, &user("o1"))).is_ok_containing(true);
    }

    #[test]
    fn matched_by_rule() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(None, None));
        assert_that!(contains(&segment, &named_user("foo", "Jane"))).is_ok_containing(true);
        assert_that!(contains(&segment, &named_user("foo", "Joan"))).is_ok_containing(false);
    }

    #[test]
    fn rule_weight_limits_matches() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(99_999.0), None));
        assert_that!(contains(&segment, &named_user("key", "Jane"))).is_ok_containing(true);

        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(1.0), None));
        assert_that!(contains(&segment, &named_user("key", "Jane"))).is_ok_containing(false);
    }

    #[test]
    fn rule_with_negative_weight_matches_no_one() {
        let segment: Segment = serde_json::from_value(json!({
            "key": "seg",
            "salt": "s",
            "rules": [{"clauses": [], "weight": -1}]
        }))
        .unwrap();
        assert_that!(contains(&segment, &user("anyone"))).is_ok_containing(false);
        assert_that!(contains(&segment, &user("userKeyA"))).is_ok_containing(false);
    }

    #[test]
    fn rule_with_zero_weight_matches_no_one() {
        let mut segment = new_segment();
        segment.rules.push(jane_rule(Some(0.0), None));
        assert_that!(contains(&segment, &named_user("key", "Jane"))).is_ok_containing(false);
    }

    #[test]
    fn rule_can_have_percentage_rollout() {
        let mut segment = new_segment();
        segment.rules.push(thirty_percent_rule(None));

        // userKeyA buckets at 0.14574753, userKeyZ at 0.45679215
        assert_that!(contains(&segment, &user("userKeyA"))).is_ok_containing(true);
        assert_that!(contains(&segment, &user("userKeyZ"))).is_ok_containing(false);
    }

    #[test]
    fn rule_can_have_percentage_rollout_by_any_attribute() {
        let mut segment = new_segment();
        segment.rules.push(thirty_percent_rule(Some("name")));

        assert_that!(contains(&segment, &named_user("x", "userKeyA"))).is_ok_containing(true);
        assert_that!(contains(&segment, &named_user("x", "userKeyZ"))).is_ok_containing(false);
    }

    #[test]
    fn rule_rollout_for_missing_kind_uses_bucket_zero() {
        let mut segment = new_segment();
        segment.rules.push(SegmentRule {
            clauses: vec![],
            weight: Some(1.0),
            rollout_context_kind: Kind::from("org"),
            ..jane_rule(None, None)
        });
        assert_that!(contains(&segment, &user("userKeyZ"))).is_ok_containing(true);
    }

    #[test]
    fn segment_can_determine_which_is_newer() {
        let oldest = new_segment();
        let middle = Segment {
            version: 2,
            ..oldest.clone()
        };
        let newest = Segment {
            version: 3,
            ..oldest.clone()
        };

        assert!(newest.is_newer_than(&middle));
        assert!(newest.is_newer_than(&oldest));
        assert!(middle.is_newer_than(&oldest));
        assert!(!oldest.is_newer_than(&middle));
        assert!(!oldest.is_newer_than(&oldest));
    }

    fn big_segment(generation: Option<i64>) -> Segment {
        Segment {
            unbounded: true,
            generation,
            ..new_segment()
        }
    }

    #[test]
    fn big_segment_without_generation_is_not_configured() {
        let store = TestStore::default();
        let provider = TestBigSegmentProvider::new(BigSegmentsStatus::Healthy)
            .with_membership("userKeyA", &[("segkey.g1", true)]);
        let mut state = EvaluationState::new(&store, Some(&provider));

        let segment = big_segment(None);
        assert_that!(segment.contains(&user("userKeyA"), &mut state)).is_ok_containing(false);
        assert_that!(state.big_segments_status()).contains_value(BigSegmentsStatus::NotConfigured);
        assert_eq!(provider.query_count(), 0);
    }

    #[test]
    fn big_segment_membership_comes_from_provider() {
        let store = TestStore::default();
        let provider = TestBigSegmentProvider::new(BigSegmentsStatus::Stale)
            .with_membership("in", &[("segkey.g1", true)])
            .with_membership("out", &[("segkey.g1", false)]);
        let mut state = EvaluationState::new(&store, Some(&provider));

        let mut segment = big_segment(Some(1));
        segment.rules.push(SegmentRule {
            clauses: vec![],
            ..jane_rule(None, None)
        });

        assert_that!(segment.contains(&user("in"), &mut state)).is_ok_containing(true);
        assert_that!(segment.contains(&user("out"), &mut state)).is_ok_containing(false);
        assert_that!(segment.contains(&user("unknown"), &mut state)).is_ok_containing(true);
        assert_that!(state.big_segments_status()).contains_value(BigSegmentsStatus::Stale);
    }

    #[test]
    fn big_segment_is_queried_once_per_context_key() {
        let store = TestStore::default();
        let provider = TestBigSegmentProvider::new(BigSegmentsStatus::Healthy)
            .with_membership("userKeyA", &[("segkey.g1", true), ("other.g1", true)]);
        let mut state = EvaluationState::new(&store, Some(&provider));

        let segment = big_segment(Some(1));
        let other = Segment {
            key: "other".to_string(),
            ..big_segment(Some(1))
        };

        assert_that!(segment.contains(&user("userKeyA"), &mut state)).is_ok_containing(true);
        assert_that!(other.contains(&user("userKeyA"), &mut state)).is_ok_containing(true);
        assert_that!(segment.contains(&user("userKeyA"), &mut state)).is_ok_containing(true);
        assert_eq!(provider.query_count(), 1);
    }

    #[test]
    fn big_segment_uses_unbounded_context_kind() {
        let store = TestStore::default();
        let provider = TestBigSegmentProvider::new(BigSegmentsStatus::Healthy)
            .with_membership("o1", &[("segkey.g1", true)]);
        let mut state = EvaluationState::new(&store, Some(&provider));

        let segment = Segment {
            unbounded_context_kind: Some(Kind::from("org")),
            ..big_segment(Some(1))
        };
        let context = MultiContextBuilder::new()
            .add_context(user("u1"))
            .add_context(ContextBuilder::new("o1").kind("org").build().unwrap())
            .build()
            .unwrap();

        assert_that!(segment.contains(&context, &mut state)).is_ok_containing(true);
        assert_that!(segment.contains(&user("o1"), &mut state)).is_ok_containing(false);
    }

    #[test]
    fn big_segment_without_provider_is_not_configured() {
        let store = TestStore::default();
        let mut state = EvaluationState::new(&store, None);

        let segment = big_segment(Some(1));
        assert_that!(segment.contains(&user("userKeyA"), &mut state)).is_ok_containing(false);
        assert_that!(state.big_segments_status()).contains_value(BigSegmentsStatus::NotConfigured);
    }

    #[test]
    fn segment_rule_with_invalid_bucket_by_is_an_error() {
        let mut segment = new_segment();
        segment.rules.push(SegmentRule {
            clauses: vec![],
            weight: Some(50_000.0),
            bucket_by: Some(Reference::new("//")),
            ..jane_rule(None, None)
        });
        assert_that!(contains(&segment, &user("x"))).is_err();
    }

    #[test]
    fn segment_rule_clause_values_compare_numbers() {
        let mut segment = new_segment();
        segment.rules.push(SegmentRule {
            clauses: vec![Clause::new_match(
                "age",
                vec![AttributeValue::Number(18.0)],
                Op::GreaterThanOrEqual,
            )],
            ..jane_rule(None, None)
        });
        let adult = ContextBuilder::new("a").set_float("age", 30.0).build().unwrap();
        let minor = ContextBuilder::new("m").set_float("age", 12.0).build().unwrap();
        assert_that!(contains(&segment, &adult)).is_ok_containing(true);
        assert_that!(contains(&segment, &minor)).is_ok_containing(false);
    }
}
