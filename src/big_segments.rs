use serde::Serialize;

/// Health of the big-segment data consulted during an evaluation.
///
/// When several statuses are observed during one evaluation, the most severe is reported; the
/// variants are declared from least to most severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// Membership data was available and up to date.
    Healthy,
    /// Membership data was available but may be out of date.
    Stale,
    /// Big segments could not be queried: no provider is configured, or the segment data
    /// predates big-segment generations.
    NotConfigured,
    /// The provider failed to answer.
    StoreError,
}

impl BigSegmentsStatus {
    /// Combines two observed statuses, keeping the more severe.
    pub fn merge(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        self.max(other)
    }
}

/// Membership of one context key in the big segments of an environment.
pub trait BigSegmentMembership {
    /// Looks up a segment reference (see [crate::Segment::big_segment_ref]).
    ///
    /// Returns `Some(true)` if the context is explicitly included, `Some(false)` if it is
    /// explicitly excluded, and None if the store says nothing about it, in which case the
    /// segment's own rules decide.
    fn check_membership(&self, segment_ref: &str) -> Option<bool>;
}

/// Source of big-segment membership, typically backed by a database maintained by a separate
/// synchronization process.
///
/// The evaluator calls [BigSegmentProvider::membership] at most once per context key per
/// evaluation. Calls may block; callers that need bounded latency should enforce timeouts
/// inside the provider.
pub trait BigSegmentProvider {
    /// Returns the membership for the given context key, or None if the store has no data for
    /// it, together with the health of the store.
    fn membership(
        &self,
        context_key: &str,
    ) -> (Option<Box<dyn BigSegmentMembership>>, BigSegmentsStatus);
}
