//! Payload validator
//!
//! A SAT model is a claim about the surrogate chain, produced under
//! single-step rewrite semantics. Real servers saturate: they rewrite every
//! match, not the first. This module re-simulates a candidate URL through
//! each hop concretely — fixpoint rewrites, guards evaluated on real bytes,
//! the same `%25`-last decode order — and records the per-hop trace. A
//! candidate whose concrete final URL fails the exploit goal is a
//! **validator mismatch**: logged prominently, marked failed, never fatal.
//! This is the net that catches modeling gaps between the two semantics.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::chain::Goal;
use crate::encoding::RawStr;
use crate::enumerate::ChainChoice;
use crate::server::Server;
use crate::transform::{base_normalization, Transformation};

/// One hop of the concrete simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopRecord {
    /// Server name.
    pub server: String,
    /// URL entering the hop.
    #[serde(rename = "inbound_url")]
    pub inbound: RawStr,
    /// URL leaving the hop.
    #[serde(rename = "outbound_url")]
    pub outbound: RawStr,
}

/// Full result of validating one candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResult {
    /// The candidate input URL.
    pub candidate: RawStr,
    /// Per-hop inbound/outbound records.
    pub hops: Vec<HopRecord>,
    /// The concrete final URL.
    pub final_url: RawStr,
    /// Whether the final URL satisfies the exploit goal.
    pub validator_pass: bool,
}

/// Concretely drive `candidate` through the chain under `choice`.
///
/// Mirrors the compiled pipeline stage for stage: decode, the chosen
/// optional transformations (applied only when their guards hold on the
/// running value), the essential transformations, then the selected
/// normalization variant. Rewrites run at fixpoint semantics.
pub fn validate(
    servers: &[Server],
    choice: &ChainChoice,
    norm_override: Option<&Transformation>,
    candidate: &RawStr,
    goal: &Goal,
) -> TraceResult {
    let mut hops = Vec::with_capacity(servers.len());
    let mut cur = candidate.as_bytes().to_vec();

    for (i, server) in servers.iter().enumerate() {
        let inbound = RawStr::from(cur.clone());

        cur = server.decode_concrete(&cur);
        for t in &choice.selected[i] {
            if t.guards_hold(&cur) {
                cur = t.apply_concrete(&cur);
            }
        }
        for t in &server.essential_transformations {
            if t.guards_hold(&cur) {
                cur = t.apply_concrete(&cur);
            } else {
                // The compiled chain hard-asserts essential guards; a
                // concrete miss will show up as a final-URL mismatch.
                debug!(
                    server = %server.name,
                    transformation = %t.name,
                    "essential guard does not hold concretely"
                );
            }
        }
        if choice.normalize[i] && server.is_normalize() {
            let base = base_normalization();
            let norm = norm_override.unwrap_or(&base);
            if norm.guards_hold(&cur) {
                cur = norm.apply_concrete(&cur);
            }
        }

        hops.push(HopRecord {
            server: server.name.clone(),
            inbound,
            outbound: RawStr::from(cur.clone()),
        });
    }

    let final_url = RawStr::from(cur);
    let validator_pass = goal.holds(candidate.as_bytes(), final_url.as_bytes());
    if !validator_pass {
        warn!(
            candidate = %candidate,
            final_url = %final_url,
            "validator mismatch: solver accepted a candidate the concrete chain rejects"
        );
    }
    TraceResult { candidate: candidate.clone(), hops, final_url, validator_pass }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::transform::Rewrite;

    fn replace_semicolon() -> Transformation {
        Transformation::new(
            "replace(; -> /)",
            Rewrite::Replace { target: RawStr::from(";"), replacement: RawStr::from("/") },
            vec![Condition::contains(";")],
        )
    }

    fn redirect_chain() -> (Vec<Server>, ChainChoice) {
        let mut s1 = Server::new("front");
        s1.transformations.push(replace_semicolon());
        let mut s2 = Server::new("back");
        s2.set_normalize(true);
        let servers = vec![s1, s2];
        let choice = ChainChoice {
            selected: vec![vec![replace_semicolon()], vec![]],
            normalize: vec![false, true],
        };
        (servers, choice)
    }

    #[test]
    fn redirect_candidate_passes_with_full_trace() {
        let (servers, choice) = redirect_chain();
        let result = validate(
            &servers,
            &choice,
            None,
            &RawStr::from("/a;../b"),
            &Goal::FinalEquals(RawStr::from("/b")),
        );
        assert!(result.validator_pass);
        assert_eq!(result.final_url.as_bytes(), b"/b");
        assert_eq!(result.hops.len(), 2);
        assert_eq!(result.hops[0].inbound.as_bytes(), b"/a;../b");
        assert_eq!(result.hops[0].outbound.as_bytes(), b"/a/../b");
        assert_eq!(result.hops[1].inbound.as_bytes(), b"/a/../b");
        assert_eq!(result.hops[1].outbound.as_bytes(), b"/b");
    }

    #[test]
    fn fixpoint_semantics_rewrite_every_semicolon() {
        let (servers, choice) = redirect_chain();
        // Two semicolons: single-step would leave one behind, fixpoint must
        // clear both.
        let result = validate(
            &servers,
            &choice,
            None,
            &RawStr::from("/a;;b"),
            &Goal::FinalNotContains(RawStr::from(";")),
        );
        assert!(result.validator_pass);
        assert_eq!(result.hops[0].outbound.as_bytes(), b"/a//b");
    }

    #[test]
    fn decode_asymmetry_truncation() {
        let mut s1 = Server::new("front");
        s1.set_decode(true);
        let mut s2 = Server::new("back");
        let truncate = Transformation::new(
            "truncate_at(!)",
            Rewrite::SubStringUntil { offset: 0, delimiter: RawStr::from("!") },
            vec![Condition::contains("!")],
        );
        s2.transformations.push(truncate.clone());
        let servers = vec![s1, s2];
        let choice =
            ChainChoice { selected: vec![vec![], vec![truncate]], normalize: vec![false, false] };

        let result = validate(
            &servers,
            &choice,
            None,
            &RawStr::from("/%21admin"),
            &Goal::FinalNotContains(RawStr::from("admin")),
        );
        assert!(result.validator_pass);
        assert_eq!(result.hops[0].outbound.as_bytes(), b"/!admin");
        assert_eq!(result.final_url.as_bytes(), b"/");
    }

    #[test]
    fn guard_failure_skips_the_rewrite() {
        let (servers, choice) = redirect_chain();
        let result = validate(
            &servers,
            &choice,
            None,
            &RawStr::from("/plain"),
            &Goal::FinalEquals(RawStr::from("/plain")),
        );
        assert!(result.validator_pass);
        assert_eq!(result.hops[0].outbound.as_bytes(), b"/plain");
    }

    #[test]
    fn norm_override_variant_is_applied() {
        let mut s1 = Server::new("front");
        s1.set_normalize(true);
        let servers = vec![s1];
        let choice = ChainChoice { selected: vec![vec![]], normalize: vec![true] };
        let variant = Transformation::normalization(RawStr::from("/%2E%2E/"));
        let result = validate(
            &servers,
            &choice,
            Some(&variant),
            &RawStr::from("/x/%2E%2E/y"),
            &Goal::FinalEquals(RawStr::from("/y")),
        );
        assert!(result.validator_pass);
    }

    #[test]
    fn failing_candidate_is_marked_not_fatal() {
        let (servers, choice) = redirect_chain();
        let result = validate(
            &servers,
            &choice,
            None,
            &RawStr::from("/nope"),
            &Goal::FinalEquals(RawStr::from("/b")),
        );
        assert!(!result.validator_pass);
        assert_eq!(result.hops.len(), 2);
    }
}
