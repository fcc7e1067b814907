//! Query filters for delete and index-move requests.
//!
//! A [`NodeFilter`] narrows which candidate nodes a wildcard operation may
//! touch. Filters travel inside senior-only request messages (`fil` field),
//! so they are serde types rather than closures. Junior replay never
//! evaluates a filter — the senior resolves filters into concrete
//! primitives before broadcasting.
//!
//! The *safe query filter* (the rule that a database may only touch nodes
//! inside its own subtree) is not a [`NodeFilter`]: it is implicit, never
//! serialized, and always conjoined by the session when executing a
//! filtered request.

use crate::path::glob_match;
use crate::payload::Payload;
use serde::{Deserialize, Serialize};

/// A serializable predicate over (node name, node payload).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeFilter {
    /// Matches every node.
    All,
    /// Node name matches a glob pattern.
    NameMatches(String),
    /// Payload exists and contains the named field.
    HasField(String),
    /// Payload exists and the named field equals the given bytes.
    FieldEquals { field: String, value: Vec<u8> },
    /// Negation.
    Not(Box<NodeFilter>),
    /// Conjunction; the empty conjunction matches everything.
    And(Vec<NodeFilter>),
    /// Disjunction; the empty disjunction matches nothing.
    Or(Vec<NodeFilter>),
}

impl NodeFilter {
    /// Evaluate the filter against a node's name and payload.
    pub fn matches(&self, name: &str, payload: Option<&Payload>) -> bool {
        match self {
            NodeFilter::All => true,
            NodeFilter::NameMatches(pattern) => glob_match(pattern, name),
            NodeFilter::HasField(field) => payload.is_some_and(|p| p.get(field).is_some()),
            NodeFilter::FieldEquals { field, value } => {
                payload.is_some_and(|p| p.get(field) == Some(value.as_slice()))
            }
            NodeFilter::Not(inner) => !inner.matches(name, payload),
            NodeFilter::And(children) => children.iter().all(|f| f.matches(name, payload)),
            NodeFilter::Or(children) => children.iter().any(|f| f.matches(name, payload)),
        }
    }

    /// Filter matching nodes whose name equals `name` exactly.
    pub fn named(name: impl Into<String>) -> Self {
        NodeFilter::NameMatches(name.into())
    }
}
