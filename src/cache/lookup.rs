//! Admissibility of equivalence-graph candidates
//!
//! A congruent term is only a usable hit if its entry may be shared with
//! the requester under TTL and session scoping rules.

use crate::cache::egraph::{ResultId, TermMatch};
use crate::cache::result::SharedResult;
use std::collections::HashMap;

/// The requester's side of a lookup
#[derive(Debug, Clone, Copy)]
pub(crate) struct LookupRequest<'a> {
    pub ttl_secs: u64,
    /// Unix seconds; only meaningful when `ttl_secs` is nonzero
    pub now: i64,
    pub storage_key: &'a str,
    pub session_id: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Accept,
    /// Accepted although the storage keys differ
    AcceptMismatch,
    Reject,
}

/// Counts gathered while filtering candidates, for trace logging
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct RejectSummary {
    pub mismatch_allowed: usize,
    pub rejected: usize,
}

pub(crate) fn evaluate(req: &LookupRequest<'_>, res: &SharedResult) -> Decision {
    if req.ttl_secs == 0 || res.storage_key == req.storage_key {
        return Decision::Accept;
    }
    if !res.safe_to_persist {
        // session-scoped entries may cross storage keys, never sessions
        return match (req.session_id, res.session_id.as_deref()) {
            (Some(a), Some(b)) if a != b => Decision::Reject,
            _ => Decision::AcceptMismatch,
        };
    }
    if req.now != 0 && res.expiration != 0 && res.expiration >= req.now {
        return Decision::AcceptMismatch;
    }
    Decision::Reject
}

/// Pick a hit: an exact storage-key match if there is one, otherwise the
/// admissible candidate with the lowest term id.
pub(crate) fn select(
    req: &LookupRequest<'_>,
    candidates: &[TermMatch],
    results: &HashMap<ResultId, SharedResult>,
) -> (Option<TermMatch>, RejectSummary) {
    let mut summary = RejectSummary::default();
    let mut first = None;
    for candidate in candidates {
        let Some(res) = results.get(&candidate.result) else {
            summary.rejected += 1;
            continue;
        };
        match evaluate(req, res) {
            Decision::Reject => summary.rejected += 1,
            Decision::AcceptMismatch => {
                summary.mismatch_allowed += 1;
                first.get_or_insert(*candidate);
            }
            Decision::Accept => {
                if res.storage_key == req.storage_key {
                    return (Some(*candidate), summary);
                }
                first.get_or_insert(*candidate);
            }
        }
    }
    (first, summary)
}
