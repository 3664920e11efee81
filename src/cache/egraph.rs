//! Equivalence graph over call fingerprints
//!
//! A union-find of equivalence classes, each holding any number of digests,
//! plus a table of terms. A term is one indexed computation: a self digest
//! applied to input classes, producing an output class and owned by one
//! cached result.
//!
//! The maintained invariant is congruence: two terms with the same self
//! digest and the same input class roots always have merged output classes.
//! Every union is followed by a worklist repair that re-homes affected terms
//! and merges any outputs that became congruent.

use crate::call::{merge_extra_digests, Digest, DigestHasher, ExtraDigest};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Union-find node; 0 means "no class"
pub(crate) type ClassId = u64;
pub(crate) type TermId = u64;
/// Opaque owner of a term, assigned by the cache
pub(crate) type ResultId = u64;

/// The structural key of a computation: everything but its inputs, plus
/// the inputs' digests in positional order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TermShape {
    pub self_digest: Digest,
    pub inputs: Vec<Digest>,
}

/// Facts learned when a result is handed to a requester
pub(crate) struct IndexFacts<'a> {
    pub request_digest: &'a Digest,
    pub request_extras: &'a [ExtraDigest],
    /// The result identity's own digest and its output-equivalent digest
    pub output_digests: &'a [Digest],
    pub output_extras: &'a [ExtraDigest],
    pub request_term: &'a TermShape,
    /// Shape of the identity the compute fn returned, when it should be
    /// indexed alongside the request
    pub result_term: Option<&'a TermShape>,
}

/// A lookup candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TermMatch {
    pub term: TermId,
    pub result: ResultId,
}

#[derive(Debug)]
struct Term {
    id: TermId,
    self_digest: Digest,
    inputs: Vec<ClassId>,
    output: ClassId,
    term_digest: Digest,
    output_extras: Vec<ExtraDigest>,
    /// Keys this term is linked under in `terms_by_output`
    output_keys: BTreeSet<Digest>,
    result: ResultId,
}

fn term_digest(self_digest: &Digest, inputs: &[ClassId]) -> Digest {
    let mut h = DigestHasher::new().with_str(self_digest.as_str());
    for input in inputs {
        h = h.with_delim().with_str(&input.to_string());
    }
    h.finish()
}

#[derive(Debug, Default)]
pub(crate) struct EGraph {
    digest_to_class: HashMap<Digest, ClassId>,
    /// Indexed by class id; slot 0 is reserved
    parents: Vec<ClassId>,
    ranks: Vec<u8>,
    /// Input class -> terms that reference it
    class_terms: HashMap<ClassId, HashSet<TermId>>,
    terms: HashMap<TermId, Term>,
    terms_by_digest: HashMap<Digest, BTreeSet<TermId>>,
    /// Output digest or output extra digest -> terms that produced it
    terms_by_output: HashMap<Digest, BTreeSet<TermId>>,
    result_terms: HashMap<ResultId, BTreeSet<TermId>>,
    next_term: TermId,
}

impl EGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of results that own at least one term
    pub fn result_count(&self) -> usize {
        self.result_terms.len()
    }

    pub fn term_count(&self) -> usize {
        self.terms.len()
    }

    pub fn class_count(&self) -> usize {
        self.parents.len().saturating_sub(1)
    }

    pub fn has_result(&self, result: ResultId) -> bool {
        self.result_terms.contains_key(&result)
    }

    fn ensure_class(&mut self, digest: &Digest) -> ClassId {
        if digest.is_empty() {
            return 0;
        }
        if let Some(&id) = self.digest_to_class.get(digest) {
            return self.find(id);
        }
        if self.parents.is_empty() {
            self.parents.push(0);
            self.ranks.push(0);
        }
        let id = self.parents.len() as ClassId;
        self.parents.push(id);
        self.ranks.push(0);
        self.digest_to_class.insert(digest.clone(), id);
        id
    }

    /// Current root for a digest, if it has ever been recorded
    pub fn class_of(&mut self, digest: &Digest) -> Option<ClassId> {
        let id = *self.digest_to_class.get(digest)?;
        match self.find(id) {
            0 => None,
            root => Some(root),
        }
    }

    pub fn same_class(&mut self, a: &Digest, b: &Digest) -> bool {
        match (self.class_of(a), self.class_of(b)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    fn find(&mut self, id: ClassId) -> ClassId {
        if id == 0 || id as usize >= self.parents.len() {
            return 0;
        }
        let mut root = id;
        while self.parents[root as usize] != root {
            root = self.parents[root as usize];
        }
        let mut cur = id;
        while cur != root {
            let parent = self.parents[cur as usize];
            self.parents[cur as usize] = root;
            cur = parent;
        }
        root
    }

    fn union_no_repair(&mut self, a: ClassId, b: ClassId) -> ClassId {
        let mut ra = self.find(a);
        let mut rb = self.find(b);
        if ra == 0 {
            return rb;
        }
        if rb == 0 || ra == rb {
            return ra;
        }

        if self.ranks[ra as usize] < self.ranks[rb as usize] {
            std::mem::swap(&mut ra, &mut rb);
        }
        self.parents[rb as usize] = ra;
        if self.ranks[ra as usize] == self.ranks[rb as usize] {
            self.ranks[ra as usize] += 1;
        }

        if let Some(src) = self.class_terms.remove(&rb) {
            self.class_terms.entry(ra).or_default().extend(src);
        }
        ra
    }

    /// Union every class in `ids`, then repair congruence to a fixed point.
    /// Returns the root of the merged class.
    fn merge(&mut self, ids: &[ClassId]) -> ClassId {
        let Some((&first, rest)) = ids.split_first() else {
            return 0;
        };
        let mut root = self.find(first);
        for &id in rest {
            root = self.union_no_repair(root, id);
        }
        if rest.is_empty() {
            return root;
        }

        let mut worklist = vec![root];
        let mut repaired = HashSet::new();
        while let Some(next) = worklist.pop() {
            let cur = self.find(next);
            if cur == 0 || !repaired.insert(cur) {
                continue;
            }
            for (a, b) in self.repair_class_terms(cur) {
                let (ra, rb) = (self.find(a), self.find(b));
                if ra == 0 || rb == 0 || ra == rb {
                    continue;
                }
                // the surviving root gained terms and must be re-checked
                let merged = self.union_no_repair(ra, rb);
                repaired.remove(&merged);
                worklist.push(merged);
            }
        }
        self.find(first)
    }

    /// Re-home every term referencing `root` under canonical inputs and
    /// return the output pairs that became congruent.
    fn repair_class_terms(&mut self, root: ClassId) -> Vec<(ClassId, ClassId)> {
        let term_ids: Vec<TermId> = match self.class_terms.get(&root) {
            Some(set) => set.iter().copied().collect(),
            None => return Vec::new(),
        };

        let mut merges = Vec::new();
        for term_id in term_ids {
            let Some(old_inputs) = self.terms.get(&term_id).map(|t| t.inputs.clone()) else {
                if let Some(set) = self.class_terms.get_mut(&root) {
                    set.remove(&term_id);
                }
                continue;
            };
            let new_inputs: Vec<ClassId> = old_inputs.iter().map(|&c| self.find(c)).collect();

            if new_inputs != old_inputs {
                for input in &old_inputs {
                    self.unlink_class_term(*input, term_id);
                }
                for &input in &new_inputs {
                    if input != 0 {
                        self.class_terms.entry(input).or_default().insert(term_id);
                    }
                }
            }

            let Some(term) = self.terms.get_mut(&term_id) else {
                continue;
            };
            term.inputs = new_inputs;
            let new_digest = term_digest(&term.self_digest, &term.inputs);
            if new_digest != term.term_digest {
                let old_digest = std::mem::replace(&mut term.term_digest, new_digest.clone());
                Self::unlink(&mut self.terms_by_digest, &old_digest, term_id);
                self.terms_by_digest
                    .entry(new_digest.clone())
                    .or_default()
                    .insert(term_id);
            }

            let Some(bucket) = self.terms_by_digest.get(&new_digest) else {
                continue;
            };
            if bucket.len() <= 1 {
                continue;
            }
            // BTreeSet iterates in id order: the first live term is the lowest id
            let mut live = bucket.iter().filter_map(|id| self.terms.get(id));
            let Some(first) = live.next() else {
                continue;
            };
            let first_output = first.output;
            merges.extend(live.map(|other| (first_output, other.output)));
        }
        merges
    }

    fn unlink_class_term(&mut self, class: ClassId, term_id: TermId) {
        if let Some(set) = self.class_terms.get_mut(&class) {
            set.remove(&term_id);
            if set.is_empty() {
                self.class_terms.remove(&class);
            }
        }
    }

    fn unlink<K: std::hash::Hash + Eq>(
        map: &mut HashMap<K, BTreeSet<TermId>>,
        key: &K,
        term_id: TermId,
    ) {
        if let Some(set) = map.get_mut(key) {
            set.remove(&term_id);
            if set.is_empty() {
                map.remove(key);
            }
        }
    }

    fn resolve_inputs(&mut self, inputs: &[Digest]) -> Vec<ClassId> {
        inputs
            .iter()
            .map(|d| {
                let id = self.ensure_class(d);
                self.find(id)
            })
            .collect()
    }

    fn canonical(&mut self, inputs: &[ClassId]) -> Vec<ClassId> {
        inputs.iter().map(|&c| self.find(c)).collect()
    }

    /// Terms congruent to `shape`, lowest term id first.
    ///
    /// Inputs are resolved without creating classes: an input digest that
    /// has never been recorded cannot be equivalent to anything.
    pub fn lookup(&mut self, shape: &TermShape) -> Vec<TermMatch> {
        let mut roots = Vec::with_capacity(shape.inputs.len());
        for input in &shape.inputs {
            match self.class_of(input) {
                Some(root) => roots.push(root),
                None => return Vec::new(),
            }
        }
        let digest = term_digest(&shape.self_digest, &roots);
        let Some(bucket) = self.terms_by_digest.get(&digest) else {
            return Vec::new();
        };
        bucket
            .iter()
            .filter_map(|id| self.terms.get(id))
            .map(|t| TermMatch {
                term: t.id,
                result: t.result,
            })
            .collect()
    }

    /// Terms whose output carries one of `extras`. The first extra digest
    /// with a live term wins.
    pub fn lookup_by_output(&self, extras: &[ExtraDigest]) -> Vec<TermMatch> {
        extras
            .iter()
            .filter(|e| !e.digest.is_empty())
            .filter_map(|e| self.terms_by_output.get(&e.digest))
            .map(|bucket| {
                bucket
                    .iter()
                    .filter_map(|id| self.terms.get(id))
                    .map(|t| TermMatch {
                        term: t.id,
                        result: t.result,
                    })
                    .collect::<Vec<_>>()
            })
            .find(|matches| !matches.is_empty())
            .unwrap_or_default()
    }

    fn link_outputs<'d>(&mut self, term_id: TermId, digests: impl IntoIterator<Item = &'d Digest>) {
        let Some(term) = self.terms.get_mut(&term_id) else {
            return;
        };
        for digest in digests {
            if digest.is_empty() || !term.output_keys.insert(digest.clone()) {
                continue;
            }
            self.terms_by_output
                .entry(digest.clone())
                .or_default()
                .insert(term_id);
        }
    }

    /// Extra digest facts recorded on a term
    pub fn term_output_extras(&self, term: TermId) -> Vec<ExtraDigest> {
        self.terms
            .get(&term)
            .map(|t| t.output_extras.clone())
            .unwrap_or_default()
    }

    fn merge_outputs_for_term_digest(&mut self, digest: &Digest, output: ClassId) -> ClassId {
        let members: Vec<TermId> = match self.terms_by_digest.get(digest) {
            Some(set) if !set.is_empty() => set.iter().copied().collect(),
            _ => return self.find(output),
        };

        let mut ids = vec![output];
        ids.extend(members.iter().filter_map(|id| self.terms.get(id)).map(|t| t.output));
        let root = self.merge(&ids);
        for id in &members {
            if let Some(term) = self.terms.get_mut(id) {
                term.output = root;
            }
        }
        root
    }

    fn result_term_by_digest(&self, result: ResultId, digest: &Digest) -> Option<TermId> {
        self.result_terms.get(&result)?.iter().copied().find(|id| {
            self.terms
                .get(id)
                .is_some_and(|t| &t.term_digest == digest)
        })
    }

    /// Record that `result` answers the request described by `facts`
    pub fn index(&mut self, result: ResultId, facts: &IndexFacts<'_>) {
        let mut digests: BTreeSet<&Digest> = BTreeSet::new();
        digests.insert(facts.request_digest);
        digests.extend(facts.request_extras.iter().map(|e| &e.digest));
        digests.extend(facts.output_digests.iter());
        digests.extend(facts.output_extras.iter().map(|e| &e.digest));

        let classes: Vec<ClassId> = digests
            .into_iter()
            .filter(|d| !d.is_empty())
            .map(|d| self.ensure_class(d))
            .collect();
        let output = self.merge(&classes);
        if output == 0 {
            return;
        }

        let output_keys: Vec<&Digest> = facts
            .output_digests
            .iter()
            .chain(facts.output_extras.iter().map(|e| &e.digest))
            .collect();

        let mut shapes = vec![facts.request_term];
        if let Some(result_term) = facts.result_term {
            if result_term != facts.request_term {
                shapes.push(result_term);
            }
        }

        for shape in shapes {
            let mut inputs = self.resolve_inputs(&shape.inputs);
            let mut digest = term_digest(&shape.self_digest, &inputs);

            if let Some(existing) = self.result_term_by_digest(result, &digest) {
                if let Some(term) = self.terms.get_mut(&existing) {
                    term.output_extras = merge_extra_digests(&term.output_extras, facts.output_extras);
                }
                self.link_outputs(existing, output_keys.iter().copied());
                self.merge_outputs_for_term_digest(&digest, output);
                continue;
            }

            let mut merged = self.merge_outputs_for_term_digest(&digest, output);
            // merging outputs may have merged one of our inputs too
            loop {
                let canonical = self.canonical(&inputs);
                if canonical == inputs {
                    break;
                }
                inputs = canonical;
                digest = term_digest(&shape.self_digest, &inputs);
                merged = self.merge_outputs_for_term_digest(&digest, merged);
            }

            self.next_term += 1;
            let id = self.next_term;
            for &input in &inputs {
                if input != 0 {
                    self.class_terms.entry(input).or_default().insert(id);
                }
            }
            self.terms_by_digest
                .entry(digest.clone())
                .or_default()
                .insert(id);
            self.result_terms.entry(result).or_default().insert(id);
            self.terms.insert(
                id,
                Term {
                    id,
                    self_digest: shape.self_digest.clone(),
                    inputs,
                    output: merged,
                    term_digest: digest,
                    output_extras: facts.output_extras.to_vec(),
                    output_keys: BTreeSet::new(),
                    result,
                },
            );
            self.link_outputs(id, output_keys.iter().copied());
        }
    }

    /// Merge a requester's own fingerprints into a hit term's output class
    pub fn merge_request_into_hit(
        &mut self,
        term: TermId,
        request_digest: &Digest,
        request_extras: &[ExtraDigest],
    ) {
        let Some(output) = self.terms.get(&term).map(|t| t.output) else {
            return;
        };
        let mut ids = vec![output, self.ensure_class(request_digest)];
        for extra in request_extras {
            if !extra.digest.is_empty() {
                ids.push(self.ensure_class(&extra.digest));
            }
        }
        let root = self.merge(&ids);
        if root != 0 {
            if let Some(t) = self.terms.get_mut(&term) {
                t.output = root;
            }
        }
    }

    /// Drop every term owned by `result`. Once no terms remain all state is
    /// cleared.
    pub fn remove_result(&mut self, result: ResultId) {
        if let Some(term_ids) = self.result_terms.remove(&result) {
            for term_id in term_ids {
                let Some(term) = self.terms.remove(&term_id) else {
                    continue;
                };
                Self::unlink(&mut self.terms_by_digest, &term.term_digest, term_id);
                for key in &term.output_keys {
                    Self::unlink(&mut self.terms_by_output, key, term_id);
                }
                for input in &term.inputs {
                    self.unlink_class_term(*input, term_id);
                }
            }
        }
        if self.terms.is_empty() {
            *self = Self::default();
        }
    }
}
