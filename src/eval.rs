use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};

use log::{debug, error, warn};
use serde::{Serialize, Serializer};

use crate::big_segments::{BigSegmentMembership, BigSegmentProvider, BigSegmentsStatus};
use crate::contexts::context::Context;
use crate::error::EvalError;
use crate::flag::Flag;
use crate::flag_value::FlagValue;
use crate::segment::Segment;
use crate::store::Store;
use crate::variation::VariationIndex;

const PREALLOCATED_PREREQUISITE_CHAIN_SIZE: usize = 20;
const PREALLOCATED_SEGMENT_CHAIN_SIZE: usize = 20;

/// Evaluates flags against contexts, looking up prerequisite flags and segments in a [Store].
///
/// An evaluator holds no state between calls and may be shared freely; each call builds its own
/// traversal state.
#[derive(Clone, Copy)]
pub struct Evaluator<'a> {
    store: &'a dyn Store,
    big_segments: Option<&'a dyn BigSegmentProvider>,
}

impl<'a> Evaluator<'a> {
    /// An evaluator without big-segment support. Big segments are then reported as
    /// [BigSegmentsStatus::NotConfigured] and only their rules can match.
    pub fn new(store: &'a dyn Store) -> Self {
        Evaluator {
            store,
            big_segments: None,
        }
    }

    pub fn with_big_segments(store: &'a dyn Store, provider: &'a dyn BigSegmentProvider) -> Self {
        Evaluator {
            store,
            big_segments: Some(provider),
        }
    }

    /// Evaluates `flag` for `context`.
    ///
    /// Malformed flag data yields a [Reason::Error] with [Error::MalformedFlag], and a panic
    /// raised while evaluating (for instance by a store callback) yields [Error::Exception]; no
    /// failure escapes this call.
    ///
    /// The evaluator sends no analytics events. Every prerequisite flag evaluated along the way
    /// is listed in [Evaluation::prerequisite_evaluations] so that the caller can.
    pub fn evaluate(&self, flag: &'a Flag, context: &Context) -> Evaluation<'a> {
        let mut state = EvaluationState::new(self.store, self.big_segments);

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| state.evaluate_flag(flag, context)));
        let mut detail = match outcome {
            Ok(Ok(detail)) => detail,
            Ok(Err(e)) => {
                warn!("invalid flag configuration detected in flag '{}': {}", flag.key, e);
                Detail::err(Error::MalformedFlag)
            }
            Err(_) => {
                error!("unexpected panic while evaluating flag '{}'", flag.key);
                Detail::err(Error::Exception)
            }
        };
        detail.big_segments_status = state.big_segments_status;

        Evaluation {
            detail,
            prerequisite_evaluations: state.prerequisite_evaluations,
        }
    }

    /// Evaluates `flag` for the result of building a context, so that a context which failed to
    /// build yields [Error::UserNotSpecified] without consulting the flag.
    pub fn evaluate_result(
        &self,
        flag: &'a Flag,
        context: &Result<Context, String>,
    ) -> Evaluation<'a> {
        match context {
            Ok(context) => self.evaluate(flag, context),
            Err(e) => {
                debug!("not evaluating flag '{}' for invalid context: {}", flag.key, e);
                Evaluation {
                    detail: Detail::err(Error::UserNotSpecified),
                    prerequisite_evaluations: Vec::new(),
                }
            }
        }
    }
}

/// The complete result of one [Evaluator::evaluate] call.
#[derive(Clone, Debug, PartialEq)]
pub struct Evaluation<'a> {
    pub detail: Detail<&'a FlagValue>,
    /// One entry per prerequisite flag evaluated, in the order their evaluations completed; a
    /// prerequisite's own prerequisites come before it.
    pub prerequisite_evaluations: Vec<PrerequisiteEvaluation<'a>>,
}

/// The result of evaluating a prerequisite flag, reported so that the caller can generate an
/// analytics event for it.
#[derive(Clone, Debug, PartialEq)]
pub struct PrerequisiteEvaluation<'a> {
    pub prerequisite_flag: &'a Flag,
    /// Key of the flag that declared the prerequisite.
    pub prerequisite_of_flag_key: String,
    pub result: Detail<&'a FlagValue>,
}

/// Traversal state of one evaluation call.
pub(crate) struct EvaluationState<'a> {
    store: &'a dyn Store,
    big_segments: Option<&'a dyn BigSegmentProvider>,
    prerequisite_flag_chain: Vec<String>,
    segment_chain: Vec<String>,
    prerequisite_evaluations: Vec<PrerequisiteEvaluation<'a>>,
    big_segment_memberships: HashMap<String, Option<Box<dyn BigSegmentMembership>>>,
    big_segments_status: Option<BigSegmentsStatus>,
}

impl<'a> EvaluationState<'a> {
    pub(crate) fn new(
        store: &'a dyn Store,
        big_segments: Option<&'a dyn BigSegmentProvider>,
    ) -> Self {
        EvaluationState {
            store,
            big_segments,
            prerequisite_flag_chain: Vec::with_capacity(PREALLOCATED_PREREQUISITE_CHAIN_SIZE),
            segment_chain: Vec::with_capacity(PREALLOCATED_SEGMENT_CHAIN_SIZE),
            prerequisite_evaluations: Vec::new(),
            big_segment_memberships: HashMap::new(),
            big_segments_status: None,
        }
    }

    pub(crate) fn segment(&self, key: &str) -> Option<&'a Segment> {
        self.store.segment(key)
    }

    pub(crate) fn push_segment(&mut self, key: &str) -> Result<(), EvalError> {
        if self.segment_chain.iter().any(|k| k == key) {
            return Err(EvalError::CircularSegment(key.to_string()));
        }
        self.segment_chain.push(key.to_string());
        Ok(())
    }

    pub(crate) fn pop_segment(&mut self) {
        self.segment_chain.pop();
    }

    fn push_prerequisite(&mut self, key: &str) -> Result<(), EvalError> {
        if self.prerequisite_flag_chain.iter().any(|k| k == key) {
            return Err(EvalError::CircularPrerequisite(key.to_string()));
        }
        self.prerequisite_flag_chain.push(key.to_string());
        Ok(())
    }

    fn pop_prerequisite(&mut self) {
        self.prerequisite_flag_chain.pop();
    }

    pub(crate) fn record_big_segments_status(&mut self, status: BigSegmentsStatus) {
        self.big_segments_status = Some(match self.big_segments_status {
            Some(current) => current.merge(status),
            None => status,
        });
    }

    #[cfg(test)]
    pub(crate) fn big_segments_status(&self) -> Option<BigSegmentsStatus> {
        self.big_segments_status
    }

    /// Asks the big-segment provider whether the context key is in the referenced segment,
    /// querying the provider at most once per context key during this evaluation.
    pub(crate) fn check_big_segment_membership(
        &mut self,
        context_key: &str,
        segment_ref: &str,
    ) -> Option<bool> {
        let provider = match self.big_segments {
            Some(provider) => provider,
            None => {
                self.record_big_segments_status(BigSegmentsStatus::NotConfigured);
                return None;
            }
        };

        if !self.big_segment_memberships.contains_key(context_key) {
            let (membership, status) = provider.membership(context_key);
            debug!(
                "queried big segment membership for context key '{}': status {:?}",
                context_key, status
            );
            self.record_big_segments_status(status);
            self.big_segment_memberships
                .insert(context_key.to_string(), membership);
        }

        self.big_segment_memberships
            .get(context_key)
            .and_then(Option::as_ref)
            .and_then(|membership| membership.check_membership(segment_ref))
    }

    fn evaluate_flag(
        &mut self,
        flag: &'a Flag,
        context: &Context,
    ) -> Result<Detail<&'a FlagValue>, EvalError> {
        if !flag.on {
            return flag.off_value(Reason::Off);
        }

        self.push_prerequisite(&flag.key)?;
        let failed_prerequisite = self.first_failed_prerequisite(flag, context);
        self.pop_prerequisite();

        if let Some(prerequisite_key) = failed_prerequisite? {
            return flag.off_value(Reason::PrerequisiteFailed { prerequisite_key });
        }

        if let Some(index) = target_match_variation(flag, context) {
            return flag.checked_variation(index, Reason::TargetMatch);
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if rule.matches(context, self)? {
                let result = flag.resolve_variation_or_rollout(&rule.variation_or_rollout, context)?;
                let reason = Reason::RuleMatch {
                    rule_index,
                    rule_id: rule.id.clone(),
                    in_experiment: result.in_experiment,
                };
                return flag.checked_variation(result.variation_index, reason);
            }
        }

        let result = flag.resolve_variation_or_rollout(&flag.fallthrough, context)?;
        let reason = Reason::Fallthrough {
            in_experiment: result.in_experiment,
        };
        flag.checked_variation(result.variation_index, reason)
    }

    /// Evaluates prerequisites in order, stopping at the first that fails, and returns its key.
    fn first_failed_prerequisite(
        &mut self,
        flag: &'a Flag,
        context: &Context,
    ) -> Result<Option<String>, EvalError> {
        for prereq in &flag.prerequisites {
            let prereq_flag = match self.store.flag(&prereq.key) {
                Some(prereq_flag) => prereq_flag,
                None => {
                    debug!(
                        "prerequisite '{}' of flag '{}' does not exist",
                        prereq.key, flag.key
                    );
                    return Ok(Some(prereq.key.clone()));
                }
            };

            let result = self.evaluate_flag(prereq_flag, context)?;
            let satisfied = prereq_flag.on && result.variation_index == Some(prereq.variation);

            self.prerequisite_evaluations.push(PrerequisiteEvaluation {
                prerequisite_flag: prereq_flag,
                prerequisite_of_flag_key: flag.key.clone(),
                result,
            });

            if !satisfied {
                return Ok(Some(prereq.key.clone()));
            }
        }
        Ok(None)
    }
}

/// Finds the variation of the first target listing the context's key.
///
/// Flags with `contextTargets` list user targets there too, as entries without values that
/// stand for the legacy `targets` entry of the same variation. Legacy targets without such a
/// placeholder are not consulted.
fn target_match_variation(flag: &Flag, context: &Context) -> Option<VariationIndex> {
    if flag.context_targets.is_empty() {
        return flag
            .targets
            .iter()
            .find(|target| target.matches(context))
            .map(|target| target.variation);
    }

    for context_target in &flag.context_targets {
        let matched = if context_target.context_kind.is_user() && context_target.values.is_empty()
        {
            flag.targets
                .iter()
                .filter(|target| target.variation == context_target.variation)
                .any(|target| target.matches(context))
        } else {
            context_target.matches(context)
        };
        if matched {
            return Some(context_target.variation);
        }
    }

    None
}

/// The result of a flag evaluation: the value, its variation index and the reason it was
/// chosen.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail<T> {
    /// The chosen variation, or None if there is no value to serve (e.g. the flag is off and
    /// has no off variation, or evaluation failed).
    pub value: Option<T>,

    /// Index of the value in the flag's variations. None when the value did not come from the
    /// flag, for instance an application default substituted after an error.
    pub variation_index: Option<VariationIndex>,

    pub reason: Reason,

    /// The most severe big-segment status observed, if any big segment was consulted.
    pub big_segments_status: Option<BigSegmentsStatus>,
}

impl<T> Detail<T> {
    /// A detail with no value or variation index.
    pub fn empty(reason: Reason) -> Detail<T> {
        Detail {
            value: None,
            variation_index: None,
            reason,
            big_segments_status: None,
        }
    }

    /// A detail carrying the caller's default value with an error reason.
    pub fn err_default(error: Error, default: T) -> Detail<T> {
        Detail {
            value: Some(default),
            ..Detail::err(error)
        }
    }

    pub fn err(error: Error) -> Detail<T> {
        Detail::empty(Reason::Error { error })
    }

    pub fn map<U, F>(self, f: F) -> Detail<U>
    where
        F: FnOnce(T) -> U,
    {
        Detail {
            value: self.value.map(f),
            variation_index: self.variation_index,
            reason: self.reason,
            big_segments_status: self.big_segments_status,
        }
    }

    /// Replaces the reason with error `e` if there is no value.
    pub fn should_have_value(mut self, e: Error) -> Detail<T> {
        if self.value.is_none() {
            self.reason = Reason::Error { error: e };
        }
        self
    }

    /// Converts the value with `f`, typically to check it against the type the caller asked
    /// for.
    ///
    /// A missing value becomes `default` and keeps the reason. If `f` rejects the value the
    /// result is `default` with error `e` (usually [Error::WrongType]).
    pub fn try_map<U, F>(self, f: F, default: U, e: Error) -> Detail<U>
    where
        F: FnOnce(T) -> Option<U>,
    {
        let converted = match self.value {
            None => {
                return Detail {
                    value: Some(default),
                    variation_index: self.variation_index,
                    reason: self.reason,
                    big_segments_status: self.big_segments_status,
                }
            }
            Some(value) => f(value),
        };
        match converted {
            Some(v) => Detail {
                value: Some(v),
                variation_index: self.variation_index,
                reason: self.reason,
                big_segments_status: self.big_segments_status,
            },
            None => Detail::err_default(e, default),
        }
    }

    /// Substitutes `default` for a missing value. The reason is left as it is.
    pub fn or(mut self, default: T) -> Detail<T> {
        if self.value.is_none() {
            self.value = Some(default);
            self.variation_index = None;
        }
        self
    }

    /// Like [Detail::or], computing the default only when it is needed.
    pub fn or_else<F>(mut self, default: F) -> Detail<T>
    where
        F: Fn() -> T,
    {
        if self.value.is_none() {
            self.value = Some(default());
            self.variation_index = None;
        }
        self
    }
}

// The big-segments status is reported inside the reason object, as other SDKs do.
impl<T: Serialize> Serialize for Detail<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReasonRepr<'r> {
            #[serde(flatten)]
            reason: &'r Reason,
            #[serde(skip_serializing_if = "Option::is_none")]
            big_segments_status: Option<BigSegmentsStatus>,
        }

        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct DetailRepr<'d, T> {
            value: &'d Option<T>,
            #[serde(skip_serializing_if = "Option::is_none")]
            variation_index: Option<VariationIndex>,
            reason: ReasonRepr<'d>,
        }

        DetailRepr {
            value: &self.value,
            variation_index: self.variation_index,
            reason: ReasonRepr {
                reason: &self.reason,
                big_segments_status: self.big_segments_status,
            },
        }
        .serialize(serializer)
    }
}

/// Why a flag evaluation produced its value.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "kind")]
pub enum Reason {
    /// The flag was off and served its off variation.
    Off,
    /// The context's key was listed in one of the flag's targets.
    TargetMatch,
    /// The context matched one of the flag's rules.
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        /// Index of the matched rule.
        rule_index: usize,
        #[serde(skip_serializing_if = "String::is_empty")]
        rule_id: String,
        /// True if the variation came from an experiment rollout and was not marked
        /// untracked.
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// A prerequisite flag was off or did not serve the required variation, so this flag
    /// served its off variation.
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed {
        prerequisite_key: String,
    },
    /// No target or rule matched and the fallthrough was served.
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        in_experiment: bool,
    },
    /// The flag could not be evaluated.
    Error {
        #[serde(rename = "errorKind")]
        error: Error,
    },
}

impl Reason {
    pub fn is_in_experiment(&self) -> bool {
        match self {
            Reason::RuleMatch { in_experiment, .. } => *in_experiment,
            Reason::Fallthrough { in_experiment } => *in_experiment,
            _ => false,
        }
    }
}

/// The kind of failure reported by [Reason::Error].
///
/// Only [Error::UserNotSpecified], [Error::MalformedFlag] and [Error::Exception] come from the
/// evaluator; the others are for callers that wrap it.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Error {
    /// The caller evaluated a flag before its flag data was available.
    ClientNotReady,
    /// No flag exists with the requested key.
    FlagNotFound,
    /// The flag data is inconsistent, e.g. a rule names a variation that does not exist or
    /// prerequisites form a cycle.
    MalformedFlag,
    /// The context was missing or invalid.
    UserNotSpecified,
    /// The value was not of the type the caller asked for.
    WrongType,
    /// An unexpected failure stopped the evaluation; the log has details.
    Exception,
}
