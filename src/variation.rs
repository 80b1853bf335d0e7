use serde::Deserialize;
use serde_with::{serde_as, DefaultOnNull};

use crate::bucketing::{bucket_context, BucketPrefix};
use crate::contexts::attribute_reference::{reference_for, Reference};
use crate::contexts::context::{Context, Kind};
use crate::error::EvalError;

/// Index into a flag's list of variations.
pub type VariationIndex = usize;

/// Weight of a rollout bucket, in parts per 100,000.
pub type VariationWeight = f32;

const WEIGHT_SCALE: f32 = 100_000.0;

/// The variation chosen by a fixed variation or a rollout.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BucketResult {
    pub(crate) variation_index: VariationIndex,
    pub(crate) in_experiment: bool,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum RolloutKind {
    #[default]
    Rollout,
    Experiment,
}

/// A percentage rollout: each context is hashed into a bucket, and the weighted variations
/// split the bucket range in order.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(from = "RolloutRepr")]
pub struct Rollout {
    kind: RolloutKind,
    context_kind: Kind,
    bucket_by: Option<Reference>,
    variations: Vec<WeightedVariation>,
    seed: Option<i64>,
}

#[serde_as]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RolloutRepr {
    #[serde(default)]
    kind: RolloutKind,
    #[serde(default)]
    context_kind: Option<Kind>,
    #[serde(default)]
    bucket_by: Option<String>,
    #[serde_as(deserialize_as = "DefaultOnNull")]
    #[serde(default)]
    variations: Vec<WeightedVariation>,
    #[serde(default)]
    seed: Option<i64>,
}

impl From<RolloutRepr> for Rollout {
    fn from(repr: RolloutRepr) -> Self {
        let has_context_kind = repr.context_kind.is_some();
        Rollout {
            kind: repr.kind,
            bucket_by: repr
                .bucket_by
                .map(|attr| reference_for(&attr, has_context_kind)),
            context_kind: repr.context_kind.unwrap_or_default(),
            variations: repr.variations,
            seed: repr.seed,
        }
    }
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind == RolloutKind::Experiment
    }

    #[cfg(test)]
    pub(crate) fn with_variations<V: Into<Vec<WeightedVariation>>>(variations: V) -> Self {
        Rollout {
            kind: RolloutKind::Rollout,
            context_kind: Kind::user(),
            bucket_by: None,
            variations: variations.into(),
            seed: None,
        }
    }

    fn select(&self, context: &Context, prefix: BucketPrefix) -> Result<BucketResult, EvalError> {
        let last = self.variations.last().ok_or(EvalError::EmptyRollout)?;
        let is_experiment = self.is_experiment();
        let bucket = bucket_context(
            context,
            &self.context_kind,
            self.bucket_by.as_ref(),
            prefix,
            is_experiment,
        )?;

        let is_tracked =
            |wv: &WeightedVariation| is_experiment && bucket.context_found && !wv.untracked;

        let mut sum = 0.0;
        for wv in &self.variations {
            sum += wv.weight / WEIGHT_SCALE;
            if bucket.value < sum {
                return Ok(BucketResult {
                    variation_index: wv.variation,
                    in_experiment: is_tracked(wv),
                });
            }
        }

        // Weights that sum to less than 100,000 (or rounding error) leave the top of the bucket
        // range unassigned; it goes to the last variation.
        Ok(BucketResult {
            variation_index: last.variation,
            in_experiment: is_tracked(last),
        })
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct WeightedVariation {
    pub variation: VariationIndex,
    pub weight: VariationWeight,
    #[serde(default)]
    pub untracked: bool,
}

impl WeightedVariation {
    #[cfg(test)]
    pub(crate) fn new(variation: VariationIndex, weight: VariationWeight) -> Self {
        WeightedVariation {
            variation,
            weight,
            untracked: false,
        }
    }
}

/// What a rule or the fallthrough serves: a fixed variation or a rollout.
///
/// Flag data may specify both or neither; that must not fail deserialization of the whole
/// flag. A variation takes precedence when both are present, and neither is kept as
/// `Malformed`, which evaluates to a malformed-flag error.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum VariationOrRollout {
    Variation { variation: VariationIndex },
    Rollout { rollout: Rollout },
    Malformed(serde_json::Value),
}

impl VariationOrRollout {
    /// Chooses a variation for `context`, bucketing with the owning flag's key and salt unless
    /// the rollout has a seed.
    pub(crate) fn resolve(
        &self,
        flag_key: &str,
        salt: &str,
        context: &Context,
    ) -> Result<BucketResult, EvalError> {
        match self {
            VariationOrRollout::Variation { variation } => Ok(BucketResult {
                variation_index: *variation,
                in_experiment: false,
            }),
            VariationOrRollout::Rollout { rollout } => {
                let prefix = match rollout.seed {
                    Some(seed) => BucketPrefix::Seed(seed),
                    None => BucketPrefix::KeyAndSalt(flag_key, salt),
                };
                rollout.select(context, prefix)
            }
            VariationOrRollout::Malformed(_) => Err(EvalError::MissingVariationOrRollout),
        }
    }
}
