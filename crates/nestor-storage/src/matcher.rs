//! Matcher polymorphism: a secondary index accepts documents either via an
//! arbitrary predicate function or via a structural "shape" object.
//!
//! Shapes round-trip through an index's on-disk metadata directly, since
//! they're already JSON. Predicates cannot: a function pointer has no
//! portable on-disk form. Rather than embedding a sandboxed expression
//! language to evaluate a persisted predicate source string, a predicate
//! matcher is identified by a caller-chosen `source` label and must be
//! re-supplied by the caller on every reopen (`ensureIndex`/`openIndex`
//! compare the freshly supplied predicate's label against the one
//! recorded when the index was created, and reject on mismatch). This is
//! the explicit re-registration API the design notes call for in place of
//! round-tripping predicates through string evaluation.

use std::fmt;
use std::sync::Arc;

use nestor_types::Document;
use serde::{Deserialize, Serialize};

/// A predicate or structural shape deciding whether a document belongs to
/// an index.
#[derive(Clone)]
pub enum Matcher {
    /// An arbitrary predicate, identified by a caller-chosen label used to
    /// detect mismatches across reopens.
    Predicate {
        source: String,
        func: Arc<dyn Fn(&Document) -> bool + Send + Sync>,
    },
    /// A structural shape: every property present must structurally equal
    /// the same path in the candidate document. A `null` value in the
    /// shape matches any value at that path, enabling partial-shape
    /// matching.
    Shape(Document),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Predicate { source, .. } => f.debug_struct("Predicate").field("source", source).finish(),
            Self::Shape(shape) => f.debug_tuple("Shape").field(shape).finish(),
        }
    }
}

impl Matcher {
    /// Builds a predicate matcher from a closure and a stable label.
    pub fn predicate(source: impl Into<String>, func: impl Fn(&Document) -> bool + Send + Sync + 'static) -> Self {
        Self::Predicate {
            source: source.into(),
            func: Arc::new(func),
        }
    }

    /// Builds a structural shape matcher.
    #[must_use]
    pub fn shape(shape: Document) -> Self {
        Self::Shape(shape)
    }

    /// The description persisted into an index file's metadata header.
    #[must_use]
    pub fn to_description(&self) -> MatcherDescription {
        match self {
            Self::Predicate { source, .. } => MatcherDescription::Predicate {
                source: source.clone(),
            },
            Self::Shape(shape) => MatcherDescription::Shape {
                shape: shape.clone(),
            },
        }
    }

    /// Returns `true` when this matcher is consistent with the
    /// already-persisted `description` of an index being reopened.
    #[must_use]
    pub fn agrees_with(&self, description: &MatcherDescription) -> bool {
        match (self, description) {
            (Self::Predicate { source, .. }, MatcherDescription::Predicate { source: stored }) => {
                source == stored
            }
            (Self::Shape(shape), MatcherDescription::Shape { shape: stored }) => shape == stored,
            _ => false,
        }
    }
}

/// The serializable form of a [`Matcher`], persisted in an index header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MatcherDescription {
    None,
    Shape { shape: Document },
    Predicate { source: String },
}

/// Decides whether `doc` is accepted by `matcher`.
///
/// - No matcher: accepts everything.
/// - Predicate matcher: calls the function.
/// - Shape matcher: every property of the shape must be present and
///   structurally equal at the same path in `doc` (a `null` shape value
///   matches anything); nested objects recurse; any other value uses
///   strict equality.
#[must_use]
pub fn matches(doc: &Document, matcher: Option<&Matcher>) -> bool {
    match matcher {
        None => true,
        Some(Matcher::Predicate { func, .. }) => func(doc),
        Some(Matcher::Shape(shape)) => shape_matches(doc, shape),
    }
}

fn shape_matches(doc: &Document, shape: &Document) -> bool {
    match shape {
        Document::Null => true,
        Document::Object(shape_fields) => {
            let Document::Object(doc_fields) = doc else {
                return false;
            };
            shape_fields.iter().all(|(key, shape_value)| {
                if shape_value.is_null() {
                    return true;
                }
                match doc_fields.get(key) {
                    Some(doc_value) => shape_matches(doc_value, shape_value),
                    None => false,
                }
            })
        }
        other => doc == other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use test_case::test_case;

    #[test]
    fn no_matcher_accepts_everything() {
        assert!(matches(&json!({"foo": "bar"}), None));
    }

    #[test_case(json!({"type": "Foobar", "id": 1}), true; "matching type and extra field")]
    #[test_case(json!({"type": "Other", "id": 1}), false; "wrong type")]
    #[test_case(json!({"id": 1}), false; "type field missing entirely")]
    fn shape_matcher_requires_present_fields(doc: serde_json::Value, expected: bool) {
        let m = Matcher::shape(json!({"type": "Foobar"}));
        assert_eq!(matches(&doc, Some(&m)), expected);
    }

    #[test]
    fn shape_matcher_null_is_wildcard() {
        let m = Matcher::shape(json!({"type": "Foobar", "id": null}));
        assert!(matches(&json!({"type": "Foobar", "id": 99}), Some(&m)));
    }

    #[test]
    fn shape_matcher_recurses_into_nested_objects() {
        let m = Matcher::shape(json!({"meta": {"kind": "x"}}));
        assert!(matches(&json!({"meta": {"kind": "x", "extra": 1}}), Some(&m)));
        assert!(!matches(&json!({"meta": {"kind": "y"}}), Some(&m)));
    }

    #[test]
    fn predicate_matcher_calls_function() {
        let m = Matcher::predicate("odd", |doc| doc["foo"].as_i64().is_some_and(|v| v % 2 == 1));
        assert!(matches(&json!({"foo": 5}), Some(&m)));
        assert!(!matches(&json!({"foo": 4}), Some(&m)));
    }

    #[test]
    fn predicate_reopen_requires_matching_label() {
        let original = Matcher::predicate("odd", |doc| doc["foo"].as_i64().is_some_and(|v| v % 2 == 1));
        let description = original.to_description();

        let same_label = Matcher::predicate("odd", |doc| doc["foo"].as_i64().is_some_and(|v| v % 2 == 1));
        assert!(same_label.agrees_with(&description));

        let different_label = Matcher::predicate("even", |doc| doc["foo"].as_i64().is_some_and(|v| v % 2 == 0));
        assert!(!different_label.agrees_with(&description));
    }
}
