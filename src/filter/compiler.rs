//! Predicate compilation.

use crate::error::{BrokerError, Result};
use crate::types::CanonicalEvent;
use regex::Regex;

/// A compiled filter.
pub trait Predicate: Send + Sync {
    fn matches(&self, event: &CanonicalEvent) -> bool;
}

/// Compiles filter expressions of one or more languages.
pub trait PredicateCompiler: Send + Sync {
    /// Fails with `FilterInstantiation` for unknown languages or invalid
    /// expressions.
    fn compile(&self, expression: &str, language: Option<&str>) -> Result<Box<dyn Predicate>>;
}

/// Used when a subscription has no filter expression.
#[derive(Clone, Copy, Debug, Default)]
pub struct MatchAll;

impl Predicate for MatchAll {
    fn matches(&self, _event: &CanonicalEvent) -> bool {
        true
    }
}

/// Language id accepted by [`RegexPredicateCompiler`].
pub const REGEX_LANGUAGE: &str = "regex";

/// Regular expressions searched in the event's textual form.
///
/// Accepts expressions with no language id or [`REGEX_LANGUAGE`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RegexPredicateCompiler;

struct RegexPredicate(Regex);

impl Predicate for RegexPredicate {
    fn matches(&self, event: &CanonicalEvent) -> bool {
        self.0.is_match(&event.text)
    }
}

impl PredicateCompiler for RegexPredicateCompiler {
    fn compile(&self, expression: &str, language: Option<&str>) -> Result<Box<dyn Predicate>> {
        match language {
            None | Some(REGEX_LANGUAGE) => {}
            Some(other) => {
                return Err(BrokerError::FilterInstantiation(format!(
                    "Unsupported filter language: {}",
                    other
                )))
            }
        }

        let regex = Regex::new(expression)
            .map_err(|e| BrokerError::FilterInstantiation(e.to_string()))?;
        Ok(Box::new(RegexPredicate(regex)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RawMessage, Timestamp};

    fn event(text: &str) -> CanonicalEvent {
        CanonicalEvent {
            original: RawMessage::Text(text.to_string()),
            text: text.to_string(),
            document: None,
            received: Timestamp::from_secs(0),
        }
    }

    #[test]
    fn test_regex_matches_text() {
        let predicate = RegexPredicateCompiler
            .compile("^temperature=\\d+$", Some(REGEX_LANGUAGE))
            .unwrap();
        assert!(predicate.matches(&event("temperature=21")));
        assert!(!predicate.matches(&event("humidity=40")));
    }

    #[test]
    fn test_invalid_expression() {
        assert!(matches!(
            RegexPredicateCompiler.compile("(unclosed", None),
            Err(BrokerError::FilterInstantiation(_))
        ));
    }

    #[test]
    fn test_unknown_language() {
        assert!(matches!(
            RegexPredicateCompiler.compile("a", Some("http://www.opengis.net/fes/2.0")),
            Err(BrokerError::FilterInstantiation(_))
        ));
    }
}
