//! Evaluates feature flags against contexts: targets, rules, segments, prerequisites and
//! percentage rollouts, producing a value together with the reason it was chosen.

mod attribute_value;
mod big_segments;
mod bucketing;
mod contexts;
mod error;
mod eval;
mod flag;
mod flag_value;
mod operator;
mod rule;
mod segment;
mod store;
mod test_common;
mod util;
mod variation;

pub use attribute_value::AttributeValue;
pub use big_segments::*;
pub use bucketing::{bucket_value, BucketPrefix};
pub use contexts::attribute_reference::{Reference, ReferenceError};
pub use contexts::context::{Context, Kind};
pub use contexts::context_builder::{ContextBuilder, MultiContextBuilder};
pub use eval::*;
pub use flag::*;
pub use flag_value::*;
pub use operator::Op;
pub use rule::*;
pub use segment::*;
pub use store::*;
pub use variation::*;
