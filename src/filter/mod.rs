//! Event matching and dispatch.
//!
//! Inbound messages are canonicalized by an [`EventTransformer`], evaluated
//! against one [`Rule`] per active subscription, and delivered to the
//! endpoint of every rule whose predicate matches.

mod compiler;
mod engine;
mod transform;

pub use compiler::{MatchAll, Predicate, PredicateCompiler, RegexPredicateCompiler, REGEX_LANGUAGE};
pub use engine::{FilterEngine, Rule};
pub use transform::{DefaultTransformer, EventTransformer};
