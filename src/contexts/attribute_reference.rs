use std::fmt::{self, Display};

use serde::{Deserialize, Serialize, Serializer};

/// The reason an attribute reference string could not be parsed.
#[derive(Clone, Copy, Hash, PartialEq, Eq, Debug, thiserror::Error)]
pub enum ReferenceError {
    /// The reference was empty or consisted of a single '/'.
    #[error("attribute reference cannot be empty")]
    Empty,
    /// A '~' was not followed by '0' or '1'.
    #[error("attribute reference contains an invalid escape sequence")]
    InvalidEscapeSequence,
    /// The path contained an empty component.
    #[error("attribute reference contains a double or trailing slash")]
    DoubleOrTrailingSlash,
}

#[derive(Clone, Hash, PartialEq, Eq, Debug)]
enum Parsed {
    /// A top-level attribute name taken literally; the input does not start with '/'.
    Name,
    /// A slash-delimited path with escapes already resolved.
    Path(Vec<String>),
    Invalid(ReferenceError),
}

/// Identifies an attribute, or a value nested inside an object attribute, of a
/// [crate::Context].
///
/// A string that does not start with '/' names a top-level attribute literally. A string that
/// starts with '/' is a path: each '/'-separated component names a property of the object found
/// at the previous level. Within a path component, `~1` stands for '/' and `~0` for '~'.
///
/// Parsing happens once, when the reference is constructed, so that clauses and rollouts which
/// are evaluated repeatedly never re-parse their attribute.
///
/// An invalid input still produces a `Reference` (which keeps the original text for logging and
/// serialization); it never resolves to a value.
///
/// # Example
/// ```
/// # use flag_evaluation::Reference;
/// assert_eq!(Reference::new("/address/city").depth(), 2);
/// assert_eq!(Reference::new("/a~1b").component(0), Some("a/b"));
/// assert_eq!(Reference::new("a/b").component(0), Some("a/b"));
/// assert!(!Reference::new("/a//b").is_valid());
/// ```
#[derive(Clone, Hash, PartialEq, Eq, Debug)]
pub struct Reference {
    input: String,
    parsed: Parsed,
}

impl Reference {
    /// Parses an attribute reference.
    pub fn new<S: AsRef<str>>(value: S) -> Self {
        let input = value.as_ref().to_owned();
        let parsed = match input.strip_prefix('/') {
            _ if input.is_empty() || input == "/" => Parsed::Invalid(ReferenceError::Empty),
            None => Parsed::Name,
            Some(path) => path
                .split('/')
                .map(unescape_component)
                .collect::<Result<Vec<_>, _>>()
                .map_or_else(Parsed::Invalid, Parsed::Path),
        };
        Self { input, parsed }
    }

    /// Builds a reference naming a single top-level attribute, even if the name starts with '/'.
    ///
    /// This is how attribute names from data that predates path syntax are interpreted.
    pub fn literal<S: AsRef<str>>(name: S) -> Self {
        let name = name.as_ref();
        if !name.starts_with('/') {
            return Self::new(name);
        }
        Self::new(format!("/{}", name.replace('~', "~0").replace('/', "~1")))
    }

    /// Returns true if the reference parsed successfully.
    pub fn is_valid(&self) -> bool {
        !matches!(self.parsed, Parsed::Invalid(_))
    }

    /// Returns the parse error of an invalid reference.
    pub fn error(&self) -> Option<ReferenceError> {
        match self.parsed {
            Parsed::Invalid(e) => Some(e),
            _ => None,
        }
    }

    /// Number of path components; 1 for a plain name and 0 for an invalid reference.
    pub fn depth(&self) -> usize {
        match &self.parsed {
            Parsed::Name => 1,
            Parsed::Path(components) => components.len(),
            Parsed::Invalid(_) => 0,
        }
    }

    /// Returns the path component at `index`, if there is one.
    pub fn component(&self, index: usize) -> Option<&str> {
        match &self.parsed {
            Parsed::Name if index == 0 => Some(&self.input),
            Parsed::Path(components) => components.get(index).map(String::as_str),
            _ => None,
        }
    }

    /// True if this reference addresses the context's "kind".
    pub(crate) fn is_kind(&self) -> bool {
        self.depth() == 1 && self.component(0) == Some("kind")
    }

    /// The string this reference was constructed from.
    pub fn as_str(&self) -> &str {
        &self.input
    }
}

fn unescape_component(component: &str) -> Result<String, ReferenceError> {
    if component.is_empty() {
        return Err(ReferenceError::DoubleOrTrailingSlash);
    }
    if !component.contains('~') {
        return Ok(component.to_owned());
    }

    let mut out = String::with_capacity(component.len());
    let mut chars = component.chars();
    while let Some(c) = chars.next() {
        if c != '~' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('0') => out.push('~'),
            Some('1') => out.push('/'),
            _ => return Err(ReferenceError::InvalidEscapeSequence),
        }
    }
    Ok(out)
}

impl Default for Reference {
    /// A default [Reference] is empty and invalid.
    fn default() -> Self {
        Reference::new("")
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.input)
    }
}

impl<S: AsRef<str>> From<S> for Reference {
    fn from(reference: S) -> Self {
        Reference::new(reference)
    }
}

impl Serialize for Reference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.input)
    }
}

impl<'de> Deserialize<'de> for Reference {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(Reference::new)
    }
}

/// Chooses how an attribute string from flag data is read: as a [Reference] when the enclosing
/// clause, rollout or rule names a context kind, or literally otherwise.
pub(crate) fn reference_for(attribute: &str, has_context_kind: bool) -> Reference {
    if has_context_kind {
        Reference::new(attribute)
    } else {
        Reference::literal(attribute)
    }
}
