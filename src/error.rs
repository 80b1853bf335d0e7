use crate::contexts::attribute_reference::ReferenceError;

/// A problem with flag or segment data found while evaluating.
///
/// These are anticipated conditions: they travel up the evaluation as `Err` values, get logged
/// once, and surface to callers as [crate::Error::MalformedFlag].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub(crate) enum EvalError {
    #[error("prerequisite relationship to '{0}' caused a circular reference; this is probably a temporary condition due to an incomplete update")]
    CircularPrerequisite(String),

    #[error("segment rule referencing segment '{0}' caused a circular reference; this is probably a temporary condition due to an incomplete update")]
    CircularSegment(String),

    #[error("invalid attribute reference '{reference}': {error}")]
    InvalidReference {
        reference: String,
        error: ReferenceError,
    },

    #[error("rule or fallthrough has neither a variation nor a rollout")]
    MissingVariationOrRollout,

    #[error("rollout has no variations")]
    EmptyRollout,

    #[error("variation index {0} is out of range")]
    VariationOutOfRange(usize),
}

impl EvalError {
    pub(crate) fn invalid_reference(reference: &crate::Reference) -> Option<Self> {
        reference.error().map(|error| EvalError::InvalidReference {
            reference: reference.to_string(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reference;

    #[test]
    fn describes_invalid_reference() {
        let error = EvalError::invalid_reference(&Reference::new("/a//b")).unwrap();
        assert_eq!(
            error.to_string(),
            "invalid attribute reference '/a//b': attribute reference contains a double or trailing slash"
        );
        assert!(EvalError::invalid_reference(&Reference::new("/a/b")).is_none());
    }
}
