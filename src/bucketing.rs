use lazy_static::lazy_static;
use sha1::{Digest, Sha1};

use crate::contexts::attribute_reference::Reference;
use crate::contexts::context::{Context, Kind};
use crate::error::EvalError;

// Only the first 15 hex digits (60 bits) of the hash are used.
const HASH_HEX_DIGITS: usize = 15;
const BUCKET_SCALE_INT: i64 = 0x0FFF_FFFF_FFFF_FFFF;
const BUCKET_SCALE: f32 = BUCKET_SCALE_INT as f32;

lazy_static! {
    static ref KEY_REFERENCE: Reference = Reference::new("key");
}

/// The part of the hash input that identifies what is being bucketed: a flag or segment (by key
/// and salt), or an explicit rollout seed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BucketPrefix<'a> {
    /// The key and salt of the flag or segment that owns the rollout.
    KeyAndSalt(&'a str, &'a str),
    /// A rollout seed, which replaces key and salt so that several flags can bucket alike.
    Seed(i64),
}

impl BucketPrefix<'_> {
    fn write_hash(&self, hash: &mut Sha1) {
        match self {
            BucketPrefix::KeyAndSalt(key, salt) => {
                hash.update(key.as_bytes());
                hash.update(b".");
                hash.update(salt.as_bytes());
            }
            BucketPrefix::Seed(seed) => hash.update(seed.to_string().as_bytes()),
        }
    }
}

/// Maps a bucketable value to a number in `[0, 1]`.
///
/// The hash input is `prefix + "." + value`, followed by `"." + secondary` when a legacy
/// secondary key is given. The first 15 hex digits of its SHA-1 digest, read as an integer and
/// divided by `0xFFFFFFFFFFFFFFF`, give the bucket. Every SDK of this family computes the same
/// value (in single precision) for the same input. The division is done in `f32`, so the top
/// `2^-25` of hashes round up to exactly 1.0; rollouts send those to their last variation.
pub fn bucket_value(prefix: BucketPrefix, value: &str, secondary: Option<&str>) -> f32 {
    let mut hash = Sha1::new();
    prefix.write_hash(&mut hash);
    hash.update(b".");
    hash.update(value.as_bytes());
    if let Some(secondary) = secondary {
        hash.update(b".");
        hash.update(secondary.as_bytes());
    }
    let digest = hash.finalize();

    let mut hex = [0_u8; 40];
    let numhash = base16ct::lower::encode_str(&digest, &mut hex)
        .ok()
        .and_then(|hex| u64::from_str_radix(&hex[..HASH_HEX_DIGITS], 16).ok())
        .unwrap_or_default();

    numhash as f32 / BUCKET_SCALE
}

/// Result of bucketing a context.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct Bucket {
    pub(crate) value: f32,
    /// False when the context has no individual context of the requested kind. The bucket is
    /// then 0, and such a context is never counted as part of an experiment.
    pub(crate) context_found: bool,
}

/// Buckets the individual context of `context_kind` by the attribute `bucket_by` (or its key).
///
/// Experiments always bucket by key. An attribute that is missing or not bucketable (anything
/// but a string or an integer) yields bucket 0. An invalid `bucket_by` reference is a data
/// error.
pub(crate) fn bucket_context(
    context: &Context,
    context_kind: &Kind,
    bucket_by: Option<&Reference>,
    prefix: BucketPrefix,
    is_experiment: bool,
) -> Result<Bucket, EvalError> {
    let reference = match bucket_by {
        Some(reference) if !is_experiment => reference,
        _ => &*KEY_REFERENCE,
    };
    if let Some(error) = EvalError::invalid_reference(reference) {
        return Err(error);
    }

    let individual = match context.as_kind(context_kind) {
        Some(individual) => individual,
        None => {
            return Ok(Bucket {
                value: 0.0,
                context_found: false,
            })
        }
    };

    let secondary = if cfg!(feature = "secondary_key_bucketing") && !is_experiment {
        individual.secondary()
    } else {
        None
    };

    let value = individual
        .get_value(reference)
        .and_then(|value| value.as_bucketable())
        .map_or(0.0, |id| bucket_value(prefix, &id, secondary));

    Ok(Bucket {
        value,
        context_found: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AttributeValue, ContextBuilder, MultiContextBuilder};
    use proptest::prelude::*;
    use spectral::prelude::*;
    use test_case::test_case;

    const PREFIX: BucketPrefix = BucketPrefix::KeyAndSalt("hashKey", "saltyA");

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-7,
            "expected {} to be close to {}",
            actual,
            expected
        );
    }

    #[test_case("userKeyA", 0.42157587)]
    #[test_case("userKeyB", 0.6708485)]
    #[test_case("userKeyC", 0.10343106)]
    fn known_bucket_values(key: &str, expected: f32) {
        assert_close(bucket_value(PREFIX, key, None), expected);
    }

    #[test_case("userKeyA", 0.09801207)]
    #[test_case("userKeyB", 0.14483777)]
    #[test_case("userKeyC", 0.9242641)]
    fn seed_replaces_key_and_salt(key: &str, expected: f32) {
        assert_close(bucket_value(BucketPrefix::Seed(61), key, None), expected);
    }

    #[test]
    fn secondary_key_changes_bucket() {
        let plain = bucket_value(PREFIX, "userKeyA", None);
        let with_secondary = bucket_value(PREFIX, "userKeyA", Some("x"));
        assert_ne!(plain, with_secondary);
        assert_eq!(with_secondary, bucket_value(PREFIX, "userKeyA.x", None));
    }

    #[test]
    fn buckets_context_by_key() {
        let context = ContextBuilder::new("userKeyA").build().unwrap();
        let bucket = bucket_context(&context, &Kind::user(), None, PREFIX, false).unwrap();
        assert!(bucket.context_found);
        assert_close(bucket.value, 0.42157587);
    }

    #[test]
    fn integer_and_string_attributes_bucket_alike() {
        let context = ContextBuilder::new("key")
            .set_float("intAttr", 33_333.0)
            .set_string("stringAttr", "33333")
            .build()
            .unwrap();
        let by_int = bucket_context(
            &context,
            &Kind::user(),
            Some(&Reference::new("intAttr")),
            PREFIX,
            false,
        )
        .unwrap();
        let by_string = bucket_context(
            &context,
            &Kind::user(),
            Some(&Reference::new("stringAttr")),
            PREFIX,
            false,
        )
        .unwrap();
        assert_eq!(by_int, by_string);
        assert!(by_int.value > 0.0);
    }

    #[test_case(AttributeValue::Number(999.999); "float")]
    #[test_case(AttributeValue::Bool(true); "bool")]
    #[test_case(AttributeValue::Array(vec!["a".into()]); "array")]
    fn unbucketable_attribute_gets_bucket_zero(value: AttributeValue) {
        let context = ContextBuilder::new("key")
            .set_value("attr", value)
            .build()
            .unwrap();
        let bucket = bucket_context(
            &context,
            &Kind::user(),
            Some(&Reference::new("attr")),
            PREFIX,
            false,
        )
        .unwrap();
        assert_eq!(bucket.value, 0.0);
        assert!(bucket.context_found);
    }

    #[test]
    fn experiments_ignore_bucket_by() {
        let context = ContextBuilder::new("userKeyA")
            .set_string("name", "someone else")
            .build()
            .unwrap();
        let bucket = bucket_context(
            &context,
            &Kind::user(),
            Some(&Reference::new("name")),
            PREFIX,
            true,
        )
        .unwrap();
        assert_close(bucket.value, 0.42157587);
    }

    #[test]
    fn selects_context_by_kind() {
        let context = MultiContextBuilder::new()
            .add_context(ContextBuilder::new("irrelevant").build().unwrap())
            .add_context(ContextBuilder::new("userKeyB").kind("org").build().unwrap())
            .build()
            .unwrap();
        let org = Kind::try_from("org").unwrap();
        let bucket = bucket_context(&context, &org, None, PREFIX, false).unwrap();
        assert_close(bucket.value, 0.6708485);

        let device = Kind::try_from("device").unwrap();
        let missing = bucket_context(&context, &device, None, PREFIX, false).unwrap();
        assert_that!(missing).is_equal_to(Bucket {
            value: 0.0,
            context_found: false,
        });
    }

    #[test]
    fn invalid_bucket_by_is_an_error() {
        let context = ContextBuilder::new("key").build().unwrap();
        let result = bucket_context(
            &context,
            &Kind::user(),
            Some(&Reference::new("/")),
            PREFIX,
            false,
        );
        assert_that!(result).is_err();
    }

    proptest! {
        #[test]
        fn bucket_is_in_closed_unit_interval(key in ".*", salt in ".*", value in ".*") {
            let bucket = bucket_value(BucketPrefix::KeyAndSalt(&key, &salt), &value, None);
            prop_assert!((0.0..=1.0).contains(&bucket));
        }

        #[test]
        fn bucketing_is_deterministic(seed in any::<i64>(), value in ".*") {
            prop_assert_eq!(
                bucket_value(BucketPrefix::Seed(seed), &value, None),
                bucket_value(BucketPrefix::Seed(seed), &value, None)
            );
        }
    }
}
