//! Argument literals

use crate::call::digest::DigestHasher;
use crate::call::id::CallId;
use serde::{Deserialize, Serialize};

/// A call argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Enum(String),
    /// Reference to another recipe
    Id(CallId),
    List(Vec<Literal>),
}

/// How referenced recipes are folded into a fingerprint
pub(crate) enum IdEncoding<'a> {
    /// Use each referenced recipe's own digest
    Recipe,
    /// Replace references with positional placeholders, collecting their digests
    SelfOnly(&'a mut Vec<crate::call::Digest>),
    /// Use each referenced recipe's output-equivalent digest
    OutputEquivalent,
}

impl Literal {
    pub(crate) fn write(&self, h: DigestHasher, enc: &mut IdEncoding<'_>) -> DigestHasher {
        match self {
            Self::Null => h.with_str("null"),
            Self::Bool(b) => h.with_str("bool:").with_str(if *b { "true" } else { "false" }),
            Self::Int(n) => h.with_str("int:").with_str(&n.to_string()),
            Self::Float(f) => h.with_str("float:").with_u64(f.to_bits()),
            Self::String(s) => h.with_str("string:").with_str(s),
            Self::Enum(s) => h.with_str("enum:").with_str(s),
            Self::Id(id) => match enc {
                IdEncoding::Recipe => h.with_str("id:").with_str(id.digest().as_str()),
                IdEncoding::SelfOnly(inputs) => {
                    inputs.push(id.digest().clone());
                    h.with_str("input:").with_u64(inputs.len() as u64)
                }
                IdEncoding::OutputEquivalent => h
                    .with_str("id:")
                    .with_str(id.output_equivalent_digest().as_str()),
            },
            Self::List(items) => {
                let mut h = h.with_str("list:").with_u64(items.len() as u64);
                for item in items {
                    h = item.write(h.with_delim(), enc);
                }
                h
            }
        }
    }
}

impl From<i64> for Literal {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<bool> for Literal {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<&str> for Literal {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Literal {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<CallId> for Literal {
    fn from(id: CallId) -> Self {
        Self::Id(id)
    }
}
