use crate::flag::Flag;
use crate::segment::Segment;

/// Read access to the flags and segments an evaluation may reference.
///
/// The evaluator looks up prerequisite flags and the segments named by `segmentMatch` clauses
/// through this trait, and borrows what it returns for the duration of one evaluation. How the
/// data is fetched, cached or updated is up to the implementation.
pub trait Store {
    /// Retrieve the flag with key `flag_key`.
    fn flag(&self, flag_key: &str) -> Option<&Flag>;

    /// Retrieve the segment with key `segment_key`.
    fn segment(&self, segment_key: &str) -> Option<&Segment>;
}
