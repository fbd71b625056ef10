//! Operation chains (spec.md §3 `Operation`, `OperationChain`).
//!
//! Grounded on `anda_core::tool::ToolSet`'s named-registry pattern and the
//! `anda_core::context::StateFeatures::depth`/`max_depth` child-context
//! limiting, generalized from a single (name, args) call to an ordered
//! sequence of Get/Apply steps.

use crate::serialize::Value;
use serde::{Deserialize, Serialize};

/// Default chain depth ceiling (spec.md §4.2.1).
pub const DEFAULT_MAX_DEPTH: usize = 50;
/// Default per-`Apply` argument count ceiling (spec.md §4.2.1).
pub const DEFAULT_MAX_ARGS: usize = 100;

/// A property key in a `Get` operation.
///
/// Ordinary property/method names are `Str`; numeric indices are `Int`.
/// `Result` stands in for the reserved `$result` sentinel used by
/// [`substitute_result`] — see DESIGN.md's Open Question resolution #3 for
/// why this is a dedicated variant rather than an attempt at a `symbol`
/// analogue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Key {
    Str(String),
    Int(i64),
    Result,
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Str(s) => write!(f, "{s}"),
            Key::Int(i) => write!(f, "{i}"),
            Key::Result => write!(f, "$result"),
        }
    }
}

/// A single step of an operation chain (spec.md §3 `Operation`).
///
/// Not `serde`-derivable directly: `Apply`'s arguments hold the in-memory
/// [`Value`] type, which can carry non-serializable `Shared`/`Object`
/// variants. Wire (de)serialization goes through `crate::serialize`'s
/// `preprocess_chain`/`postprocess_chain`.
#[derive(Debug, Clone)]
pub enum Operation {
    Get(Key),
    Apply(Vec<Value>),
}

/// An ordered sequence of chained operations (spec.md §3 `OperationChain`).
#[derive(Debug, Clone, Default)]
pub struct OperationChain(pub Vec<Operation>);

impl OperationChain {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push_get(&mut self, key: Key) {
        self.0.push(Operation::Get(key));
    }

    pub fn push_apply(&mut self, args: Vec<Value>) {
        self.0.push(Operation::Apply(args));
    }

    /// The final step, if it is an `Apply` (the step result substitution /
    /// dispatch targets).
    pub fn last_apply(&self) -> Option<&Vec<Value>> {
        match self.0.last() {
            Some(Operation::Apply(args)) => Some(args),
            _ => None,
        }
    }
}

/// Replaces every `$result` placeholder in the chain's final `Apply`'s
/// arguments with `value`, or appends `value` as a new final argument if no
/// placeholder is present (spec.md §4.2.4 "result-placeholder substitution",
/// the "last-argument convention" fallback).
///
/// Non-mutating: returns a new chain, leaving `chain` untouched.
pub fn substitute_result(chain: &OperationChain, value: Value) -> OperationChain {
    let mut steps = chain.0.clone();
    match steps.last_mut() {
        Some(Operation::Apply(args)) => {
            let mut replaced = false;
            for arg in args.iter_mut() {
                if matches!(arg, Value::ResultPlaceholder) {
                    *arg = value.clone();
                    replaced = true;
                }
            }
            if !replaced {
                args.push(value);
            }
        }
        _ => {
            steps.push(Operation::Apply(vec![value]));
        }
    }
    OperationChain(steps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitute_replaces_placeholder() {
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("log".into()));
        chain.push_apply(vec![Value::ResultPlaceholder]);

        let substituted = substitute_result(&chain, Value::Int(42));
        match substituted.last_apply() {
            Some(args) => assert_eq!(args, &vec![Value::Int(42)]),
            None => panic!("expected apply"),
        }
    }

    #[test]
    fn substitute_falls_back_to_append() {
        let mut chain = OperationChain::new();
        chain.push_get(Key::Str("log".into()));
        chain.push_apply(vec![Value::Str("prefix".into())]);

        let substituted = substitute_result(&chain, Value::Int(7));
        match substituted.last_apply() {
            Some(args) => assert_eq!(args, &vec![Value::Str("prefix".into()), Value::Int(7)]),
            None => panic!("expected apply"),
        }
    }
}
