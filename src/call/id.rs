//! Recipe identities
//!
//! A [`CallId`] describes how a value is produced: a receiver, a field
//! (operation) name, arguments, and positional/view modifiers. IDs are
//! immutable; builder methods return a new ID layered on top of the old one.
//!
//! Three fingerprints are derived from an ID:
//!
//! | Fingerprint | Inputs folded in as |
//! |-------------|---------------------|
//! | [`CallId::digest`] | referenced recipes' own digests |
//! | [`CallId::self_digest_and_inputs`] | positional placeholders, digests returned separately |
//! | [`CallId::output_equivalent_digest`] | referenced recipes' output-equivalent digests |
//!
//! Extra digests are facts learned after execution. They never change the
//! recipe digest.

use crate::call::digest::{merge_extra_digests, Digest, DigestHasher, ExtraDigest};
use crate::call::literal::{IdEncoding, Literal};
use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// A named call argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: Literal,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: impl Into<Literal>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug)]
struct CallInner {
    receiver: Option<CallId>,
    type_name: String,
    field: String,
    /// Always sorted by name
    args: Vec<Argument>,
    /// 1-based element selection; 0 means no selection
    nth: u64,
    view: Option<String>,
    extra_digests: Vec<ExtraDigest>,
    digest: Digest,
    /// Recipe fingerprint over the inputs' output-equivalent digests
    input_eq_digest: Digest,
}

/// Immutable recipe identity, cheap to clone
#[derive(Clone)]
pub struct CallId {
    inner: Arc<CallInner>,
}

impl CallId {
    /// A call with no receiver (evaluated against the root)
    pub fn root(type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::build(None, type_name.into(), field.into(), Vec::new(), 0, None, Vec::new())
    }

    /// A call evaluated against this ID as receiver
    pub fn append(&self, type_name: impl Into<String>, field: impl Into<String>) -> Self {
        Self::build(
            Some(self.clone()),
            type_name.into(),
            field.into(),
            Vec::new(),
            0,
            None,
            Vec::new(),
        )
    }

    fn build(
        receiver: Option<CallId>,
        type_name: String,
        field: String,
        mut args: Vec<Argument>,
        nth: u64,
        view: Option<String>,
        extra_digests: Vec<ExtraDigest>,
    ) -> Self {
        args.sort_by(|a, b| a.name.cmp(&b.name));
        let mut inner = CallInner {
            receiver,
            type_name,
            field,
            args,
            nth,
            view,
            extra_digests,
            digest: Digest::default(),
            input_eq_digest: Digest::default(),
        };
        inner.digest = hash_call(&inner, &mut IdEncoding::Recipe);
        inner.input_eq_digest = hash_call(&inner, &mut IdEncoding::OutputEquivalent);
        Self {
            inner: Arc::new(inner),
        }
    }

    fn rebuild(&self, f: impl FnOnce(&mut Vec<Argument>, &mut u64, &mut Option<String>)) -> Self {
        let mut args = self.inner.args.clone();
        let mut nth = self.inner.nth;
        let mut view = self.inner.view.clone();
        f(&mut args, &mut nth, &mut view);
        Self::build(
            self.inner.receiver.clone(),
            self.inner.type_name.clone(),
            self.inner.field.clone(),
            args,
            nth,
            view,
            self.inner.extra_digests.clone(),
        )
    }

    /// Set (or replace) a named argument
    pub fn with_arg(&self, name: impl Into<String>, value: impl Into<Literal>) -> Self {
        let arg = Argument::new(name, value);
        self.rebuild(|args, _, _| {
            args.retain(|a| a.name != arg.name);
            args.push(arg);
        })
    }

    /// Select the nth (1-based) element of a list-valued call
    pub fn select_nth(&self, nth: u64) -> Self {
        self.rebuild(|_, n, _| *n = nth)
    }

    pub fn with_view(&self, view: impl Into<String>) -> Self {
        let view = view.into();
        self.rebuild(|_, _, v| *v = Some(view))
    }

    /// Attach a post-hoc fact; the recipe digest is unchanged
    pub fn with_extra_digest(&self, extra: ExtraDigest) -> Self {
        if extra.digest.is_empty() {
            return self.clone();
        }
        let extra_digests = merge_extra_digests(&self.inner.extra_digests, &[extra]);
        self.with_extra_digests_replaced(extra_digests)
    }

    /// Attach several post-hoc facts at once
    pub fn with_extra_digests(&self, extras: &[ExtraDigest]) -> Self {
        if extras.is_empty() {
            return self.clone();
        }
        let extra_digests = merge_extra_digests(&self.inner.extra_digests, extras);
        self.with_extra_digests_replaced(extra_digests)
    }

    /// Attach (or replace) the content digest
    pub fn with_content_digest(&self, digest: Digest) -> Self {
        let mut extra_digests: Vec<ExtraDigest> = self
            .inner
            .extra_digests
            .iter()
            .filter(|e| !e.is_content())
            .cloned()
            .collect();
        if !digest.is_empty() {
            extra_digests.push(ExtraDigest::content(digest));
        }
        self.with_extra_digests_replaced(extra_digests)
    }

    fn with_extra_digests_replaced(&self, extra_digests: Vec<ExtraDigest>) -> Self {
        let inner = CallInner {
            receiver: self.inner.receiver.clone(),
            type_name: self.inner.type_name.clone(),
            field: self.inner.field.clone(),
            args: self.inner.args.clone(),
            nth: self.inner.nth,
            view: self.inner.view.clone(),
            extra_digests,
            digest: self.inner.digest.clone(),
            input_eq_digest: self.inner.input_eq_digest.clone(),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn receiver(&self) -> Option<&CallId> {
        self.inner.receiver.as_ref()
    }

    pub fn type_name(&self) -> &str {
        &self.inner.type_name
    }

    pub fn field(&self) -> &str {
        &self.inner.field
    }

    pub fn args(&self) -> &[Argument] {
        &self.inner.args
    }

    pub fn nth(&self) -> u64 {
        self.inner.nth
    }

    pub fn view(&self) -> Option<&str> {
        self.inner.view.as_deref()
    }

    /// Recipe fingerprint
    pub fn digest(&self) -> &Digest {
        &self.inner.digest
    }

    pub fn extra_digests(&self) -> &[ExtraDigest] {
        &self.inner.extra_digests
    }

    pub fn content_digest(&self) -> Option<&Digest> {
        self.inner
            .extra_digests
            .iter()
            .find(|e| e.is_content())
            .map(|e| &e.digest)
    }

    /// Fingerprint of everything except referenced recipes, plus the
    /// referenced recipes' digests in positional order (receiver first).
    pub fn self_digest_and_inputs(&self) -> (Digest, Vec<Digest>) {
        let mut inputs = Vec::new();
        let self_digest = hash_call(&self.inner, &mut IdEncoding::SelfOnly(&mut inputs));
        (self_digest, inputs)
    }

    /// Content digest if known, otherwise the recipe fingerprint recomputed
    /// over the inputs' output-equivalent digests.
    pub fn output_equivalent_digest(&self) -> Digest {
        match self.content_digest() {
            Some(content) => content.clone(),
            None => self.inner.input_eq_digest.clone(),
        }
    }

    /// Dotted path of field names from the root, e.g. `repo.file.contents`
    pub fn path(&self) -> String {
        let mut fields = Vec::new();
        let mut cur = Some(self);
        while let Some(id) = cur {
            fields.push(id.display_self());
            cur = id.receiver();
        }
        fields.reverse();
        fields.join(".")
    }

    /// This call's own segment, e.g. `file(path: "a")#2`
    pub fn display_self(&self) -> String {
        let mut out = self.inner.field.clone();
        if !self.inner.args.is_empty() {
            let args: Vec<String> = self
                .inner
                .args
                .iter()
                .map(|a| format!("{}: {}", a.name, display_literal(&a.value)))
                .collect();
            out.push('(');
            out.push_str(&args.join(", "));
            out.push(')');
        }
        if self.inner.nth != 0 {
            out.push_str(&format!("#{}", self.inner.nth));
        }
        out
    }

    /// Encode to the JSON wire form
    pub fn encode(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from the JSON wire form, verifying every recorded digest
    pub fn decode(encoded: &str) -> CacheResult<Self> {
        serde_json::from_str(encoded).map_err(|e| CacheError::Decode(e.to_string()))
    }
}

fn hash_call(inner: &CallInner, enc: &mut IdEncoding<'_>) -> Digest {
    let mut h = DigestHasher::new().with_str("call").with_delim();
    h = match (&inner.receiver, &mut *enc) {
        (None, _) => h.with_str("-"),
        (Some(recv), IdEncoding::Recipe) => h.with_str(recv.digest().as_str()),
        (Some(recv), IdEncoding::SelfOnly(inputs)) => {
            inputs.push(recv.digest().clone());
            h.with_str("input:").with_u64(inputs.len() as u64)
        }
        (Some(recv), IdEncoding::OutputEquivalent) => {
            h.with_str(recv.output_equivalent_digest().as_str())
        }
    };
    h = h
        .with_delim()
        .with_str(&inner.type_name)
        .with_delim()
        .with_str(&inner.field)
        .with_delim()
        .with_u64(inner.args.len() as u64);
    for arg in &inner.args {
        h = arg.value.write(h.with_delim().with_str(&arg.name).with_delim(), enc);
    }
    h.with_delim()
        .with_u64(inner.nth)
        .with_delim()
        .with_str(inner.view.as_deref().unwrap_or(""))
        .finish()
}

fn display_literal(lit: &Literal) -> String {
    match lit {
        Literal::Null => "null".to_string(),
        Literal::Bool(b) => b.to_string(),
        Literal::Int(n) => n.to_string(),
        Literal::Float(f) => f.to_string(),
        Literal::String(s) => format!("{:?}", s),
        Literal::Enum(s) => s.clone(),
        Literal::Id(id) => format!("<{}@{}>", id.type_name(), id.digest().short()),
        Literal::List(items) => {
            let items: Vec<String> = items.iter().map(display_literal).collect();
            format!("[{}]", items.join(", "))
        }
    }
}

impl PartialEq for CallId {
    fn eq(&self, other: &Self) -> bool {
        self.inner.digest == other.inner.digest
            && self.inner.extra_digests == other.inner.extra_digests
    }
}

impl fmt::Debug for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CallId({} @ {})", self.path(), self.inner.digest.short())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.inner.type_name, self.inner.digest)
    }
}

#[derive(Serialize)]
struct CallRecordRef<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    receiver: Option<&'a CallId>,
    #[serde(rename = "type")]
    type_name: &'a str,
    field: &'a str,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    args: &'a [Argument],
    #[serde(skip_serializing_if = "is_zero")]
    nth: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    view: Option<&'a str>,
    #[serde(skip_serializing_if = "<[_]>::is_empty")]
    extra_digests: &'a [ExtraDigest],
    digest: &'a Digest,
}

#[derive(Deserialize)]
struct CallRecord {
    #[serde(default)]
    receiver: Option<CallId>,
    #[serde(rename = "type")]
    type_name: String,
    field: String,
    #[serde(default)]
    args: Vec<Argument>,
    #[serde(default)]
    nth: u64,
    #[serde(default)]
    view: Option<String>,
    #[serde(default)]
    extra_digests: Vec<ExtraDigest>,
    digest: Digest,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Serialize for CallId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        CallRecordRef {
            receiver: self.inner.receiver.as_ref(),
            type_name: &self.inner.type_name,
            field: &self.inner.field,
            args: &self.inner.args,
            nth: self.inner.nth,
            view: self.inner.view.as_deref(),
            extra_digests: &self.inner.extra_digests,
            digest: &self.inner.digest,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CallId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = CallRecord::deserialize(deserializer)?;
        let id = Self::build(
            record.receiver,
            record.type_name,
            record.field,
            record.args,
            record.nth,
            record.view,
            record.extra_digests,
        );
        if *id.digest() != record.digest {
            return Err(serde::de::Error::custom(format!(
                "digest mismatch for {}: recorded {}, computed {}",
                id.path(),
                record.digest,
                id.digest()
            )));
        }
        Ok(id)
    }
}
