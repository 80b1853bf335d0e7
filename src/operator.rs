use std::collections::HashSet;

use chrono::{DateTime, Utc};
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::attribute_value::AttributeValue;

/// Operator names as they appear in clause data.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Op {
    In,
    StartsWith,
    EndsWith,
    Contains,
    Matches,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before,
    After,
    SegmentMatch,
    SemVerEqual,
    SemVerGreaterThan,
    SemVerLessThan,
    /// An operator this crate does not know. Clauses using it never match.
    #[serde(other)]
    Unknown,
}

/// An operator with the clause values it compares against, preprocessed once when the clause is
/// built so matching never re-parses them.
#[derive(Clone, Debug)]
pub(crate) enum Operator {
    In(HashSet<ValueKey>),
    StartsWith,
    EndsWith,
    Contains,
    Matches(Vec<Option<Regex>>),
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
    Before(Vec<Option<DateTime<Utc>>>),
    After(Vec<Option<DateTime<Utc>>>),
    SemVerEqual(Vec<Option<semver::Version>>),
    SemVerGreaterThan(Vec<Option<semver::Version>>),
    SemVerLessThan(Vec<Option<semver::Version>>),
    SegmentMatch,
    Unknown,
}

/// Hashable form of a primitive clause value, for `in` lookups.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub(crate) enum ValueKey {
    Str(String),
    Number(u64),
    Bool(bool),
}

impl ValueKey {
    fn of(value: &AttributeValue) -> Option<ValueKey> {
        match value {
            AttributeValue::String(s) => Some(ValueKey::Str(s.clone())),
            // 0.0 and -0.0 compare equal, so they must share a key
            AttributeValue::Number(f) if *f == 0.0 => Some(ValueKey::Number(0_f64.to_bits())),
            AttributeValue::Number(f) => Some(ValueKey::Number(f.to_bits())),
            AttributeValue::Bool(b) => Some(ValueKey::Bool(*b)),
            _ => None,
        }
    }
}

impl Operator {
    pub(crate) fn new(op: &Op, values: &[AttributeValue]) -> Self {
        match op {
            Op::In => Operator::In(values.iter().filter_map(ValueKey::of).collect()),
            Op::StartsWith => Operator::StartsWith,
            Op::EndsWith => Operator::EndsWith,
            Op::Contains => Operator::Contains,
            Op::Matches => Operator::Matches(values.iter().map(compile_pattern).collect()),
            Op::LessThan => Operator::LessThan,
            Op::LessThanOrEqual => Operator::LessThanOrEqual,
            Op::GreaterThan => Operator::GreaterThan,
            Op::GreaterThanOrEqual => Operator::GreaterThanOrEqual,
            Op::Before => Operator::Before(parse_all(values, AttributeValue::to_datetime)),
            Op::After => Operator::After(parse_all(values, AttributeValue::to_datetime)),
            Op::SemVerEqual => Operator::SemVerEqual(parse_all(values, AttributeValue::as_semver)),
            Op::SemVerGreaterThan => {
                Operator::SemVerGreaterThan(parse_all(values, AttributeValue::as_semver))
            }
            Op::SemVerLessThan => {
                Operator::SemVerLessThan(parse_all(values, AttributeValue::as_semver))
            }
            Op::SegmentMatch => Operator::SegmentMatch,
            Op::Unknown => Operator::Unknown,
        }
    }

    /// Returns true if `context_value` satisfies the operator against any of the clause values.
    ///
    /// `context_value` is a single primitive; arrays are expanded by the caller.
    pub(crate) fn matches_any(
        &self,
        context_value: &AttributeValue,
        values: &[AttributeValue],
    ) -> bool {
        match self {
            Operator::In(keys) => ValueKey::of(context_value).map_or(false, |k| keys.contains(&k)),

            Operator::StartsWith => any_string(context_value, values, |l, r| l.starts_with(r)),
            Operator::EndsWith => any_string(context_value, values, |l, r| l.ends_with(r)),
            Operator::Contains => any_string(context_value, values, |l, r| l.contains(r)),
            Operator::Matches(patterns) => context_value.as_str().map_or(false, |text| {
                patterns.iter().flatten().any(|re| re.is_match(text))
            }),

            Operator::LessThan => any_number(context_value, values, |l, r| l < r),
            Operator::LessThanOrEqual => any_number(context_value, values, |l, r| l <= r),
            Operator::GreaterThan => any_number(context_value, values, |l, r| l > r),
            Operator::GreaterThanOrEqual => any_number(context_value, values, |l, r| l >= r),

            Operator::Before(times) => any_parsed(context_value.to_datetime(), times, |l, r| l < r),
            Operator::After(times) => any_parsed(context_value.to_datetime(), times, |l, r| l > r),

            Operator::SemVerEqual(versions) => {
                any_parsed(context_value.as_semver(), versions, |l, r| l == r)
            }
            Operator::SemVerGreaterThan(versions) => {
                any_parsed(context_value.as_semver(), versions, |l, r| l > r)
            }
            Operator::SemVerLessThan(versions) => {
                any_parsed(context_value.as_semver(), versions, |l, r| l < r)
            }

            // handled by the clause, which needs the evaluation state
            Operator::SegmentMatch => false,
            Operator::Unknown => false,
        }
    }
}

fn compile_pattern(value: &AttributeValue) -> Option<Regex> {
    let pattern = value.as_str()?;
    match Regex::new(pattern) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("invalid regex for 'matches' operator ({}): {}", e, pattern);
            None
        }
    }
}

fn parse_all<T, F>(values: &[AttributeValue], parse: F) -> Vec<Option<T>>
where
    F: Fn(&AttributeValue) -> Option<T>,
{
    values.iter().map(parse).collect()
}

fn any_string<F>(lhs: &AttributeValue, values: &[AttributeValue], f: F) -> bool
where
    F: Fn(&str, &str) -> bool,
{
    match lhs.as_str() {
        Some(l) => values.iter().filter_map(AttributeValue::as_str).any(|r| f(l, r)),
        None => false,
    }
}

fn any_number<F>(lhs: &AttributeValue, values: &[AttributeValue], f: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match lhs.to_f64() {
        Some(l) => values.iter().filter_map(AttributeValue::to_f64).any(|r| f(l, r)),
        None => false,
    }
}

fn any_parsed<T, F>(lhs: Option<T>, parsed: &[Option<T>], f: F) -> bool
where
    F: Fn(&T, &T) -> bool,
{
    match lhs {
        Some(l) => parsed.iter().flatten().any(|r| f(&l, r)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use test_case::test_case;

    fn matches(op: Op, lhs: impl Into<AttributeValue>, rhs: impl Into<AttributeValue>) -> bool {
        let values = vec![rhs.into()];
        Operator::new(&op, &values).matches_any(&lhs.into(), &values)
    }

    #[test]
    fn parses_operator_names() {
        let ops: Vec<Op> =
            serde_json::from_str(r#"["in", "semVerGreaterThan", "segmentMatch", "notAnOp"]"#)
                .unwrap();
        assert_that!(ops).is_equal_to(vec![
            Op::In,
            Op::SemVerGreaterThan,
            Op::SegmentMatch,
            Op::Unknown,
        ]);
    }

    #[test_case("foo", "foo", true)]
    #[test_case("foo", "bar", false)]
    #[test_case("Foo", "foo", false; "case sensitive")]
    fn in_strings(lhs: &str, rhs: &str, expected: bool) {
        assert_eq!(matches(Op::In, lhs, rhs), expected);
    }

    #[test]
    fn in_numbers_and_bools() {
        assert!(matches(Op::In, 42.0, 42.0));
        assert!(!matches(Op::In, 42.0, 3.0));
        assert!(matches(Op::In, 0.0, -0.0));
        assert!(matches(Op::In, true, true));
        assert!(!matches(Op::In, true, false));
        assert!(!matches(Op::In, "1", 1.0), "no conversion between types");
        assert!(!matches(Op::In, AttributeValue::Null, AttributeValue::Null));
    }

    #[test]
    fn in_uses_every_clause_value() {
        let values: Vec<AttributeValue> = vec!["a".into(), 2.0.into(), "c".into()];
        let op = Operator::new(&Op::In, &values);
        assert!(op.matches_any(&"c".into(), &values));
        assert!(op.matches_any(&2.0.into(), &values));
        assert!(!op.matches_any(&"b".into(), &values));
    }

    #[test_case(Op::StartsWith, "", "", true)]
    #[test_case(Op::StartsWith, "a", "", true)]
    #[test_case(Op::StartsWith, "food", "foo", true)]
    #[test_case(Op::StartsWith, "foo", "food", false)]
    #[test_case(Op::StartsWith, "Food", "foo", false)]
    #[test_case(Op::EndsWith, "food", "ood", true)]
    #[test_case(Op::EndsWith, "ood", "food", false)]
    #[test_case(Op::EndsWith, "FOOD", "ood", false)]
    #[test_case(Op::Contains, "food", "oo", true)]
    #[test_case(Op::Contains, "oo", "food", false)]
    #[test_case(Op::Contains, "FOOD", "oo", false)]
    fn string_operators(op: Op, lhs: &str, rhs: &str, expected: bool) {
        assert_eq!(matches(op, lhs, rhs), expected);
    }

    #[test]
    fn string_operators_require_strings() {
        assert!(!matches(Op::StartsWith, 99.0, "9"));
        assert!(!matches(Op::Contains, "99", 9.0));
    }

    #[test_case("", "", true)]
    #[test_case("a", ".", true)]
    #[test_case("hello world", "hello.*rld", true)]
    #[test_case("hello world", "l+", true)]
    #[test_case("hello world", "(world|planet)", true)]
    #[test_case("", ".", false)]
    #[test_case("hello world", "aloha", false)]
    #[test_case("hello world", "***bad regex", false)]
    #[test_case("", r"\", false)]
    fn matches_operator(text: &str, pattern: &str, expected: bool) {
        assert_eq!(matches(Op::Matches, text, pattern), expected);
    }

    #[test]
    fn invalid_pattern_does_not_hide_valid_ones() {
        let values: Vec<AttributeValue> = vec!["(".into(), "^ab".into()];
        let op = Operator::new(&Op::Matches, &values);
        assert!(op.matches_any(&"abc".into(), &values));
        assert!(!op.matches_any(&"(".into(), &values));
    }

    #[test_case(Op::LessThan, 0.0, 1.0, true)]
    #[test_case(Op::LessThan, 0.0, 0.0, false)]
    #[test_case(Op::LessThan, 1.0, 0.0, false)]
    #[test_case(Op::LessThanOrEqual, 0.0, 0.0, true)]
    #[test_case(Op::LessThanOrEqual, 1.0, 0.0, false)]
    #[test_case(Op::GreaterThan, 1.0, 0.0, true)]
    #[test_case(Op::GreaterThan, 0.0, 0.0, false)]
    #[test_case(Op::GreaterThanOrEqual, 0.0, 0.0, true)]
    #[test_case(Op::GreaterThanOrEqual, 0.0, 1.0, false)]
    fn numeric_operators(op: Op, lhs: f64, rhs: f64, expected: bool) {
        assert_eq!(matches(op, lhs, rhs), expected);
    }

    #[test]
    fn numeric_operators_do_not_convert_strings() {
        assert!(!matches(Op::LessThan, "0", 1.0));
        assert!(!matches(Op::LessThan, 0.0, "1"));
    }

    #[test]
    fn date_operators() {
        let earlier = 1_500_000_000_000_i64;
        let later = earlier + 86_400_000;

        assert!(matches(Op::Before, earlier, later));
        assert!(!matches(Op::Before, later, earlier));
        assert!(!matches(Op::Before, earlier, earlier));
        assert!(matches(Op::After, later, earlier));
        assert!(!matches(Op::After, earlier, later));

        assert!(matches(Op::Before, "2017-07-14T02:40:00Z", later));
        assert!(matches(Op::After, later, "2017-07-14T02:40:00.000+00:00"));
        assert!(matches(Op::Before, "2019-11-19T17:29:00-07:00", "2019-11-20T00:30:00Z"));

        assert!(!matches(Op::Before, "fish", later));
        assert!(!matches(Op::After, later, "fish"));
        assert!(!matches(Op::Before, true, later));
    }

    #[test_case(Op::SemVerEqual, "2.0.0", "2.0.0", true)]
    #[test_case(Op::SemVerEqual, "2.0", "2.0.0", true; "missing patch")]
    #[test_case(Op::SemVerEqual, "2", "2.0.0", true; "missing minor and patch")]
    #[test_case(Op::SemVerEqual, "2.0.0", "2.0.1", false)]
    #[test_case(Op::SemVerEqual, "2.0.0", "200", false)]
    #[test_case(Op::SemVerGreaterThan, "2.1.0", "2.0.0", true)]
    #[test_case(Op::SemVerGreaterThan, "2.0.0-rc.10.green", "2.0.0-rc.2.green", true)]
    #[test_case(Op::SemVerGreaterThan, "2.0.0-rc.2.red", "2.0.0-rc.2.green", true)]
    #[test_case(Op::SemVerGreaterThan, "2.0.0-rc", "2.0.0", false; "prerelease is lower")]
    #[test_case(Op::SemVerGreaterThan, "2.0.0+build", "2.0.0", false; "build metadata ignored")]
    #[test_case(Op::SemVerLessThan, "1.9.0", "2.0.0", true)]
    #[test_case(Op::SemVerLessThan, "2.0.0", "2.0.0", false)]
    #[test_case(Op::SemVerLessThan, "x.y.z", "2.0.0", false; "malformed operand")]
    fn semver_operators(op: Op, lhs: &str, rhs: &str, expected: bool) {
        assert_eq!(matches(op, lhs, rhs), expected);
    }

    #[test]
    fn semver_operators_do_not_convert_numbers() {
        assert!(!matches(Op::SemVerEqual, "2.0.0", 2.0));
    }

    #[test]
    fn segment_and_unknown_operators_never_match_values() {
        assert!(!matches(Op::SegmentMatch, "a", "a"));
        assert!(!matches(Op::Unknown, "a", "a"));
    }
}
