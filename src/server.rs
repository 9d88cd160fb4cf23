//! Server model
//!
//! A [`Server`] is the surrogate for one HTTP intermediary: the conditions a
//! URL must meet to traverse it, the rewrites it was observed performing, and
//! two behavioral flags (`is_decode`, `is_normalize`) inferred from probes.
//!
//! ## Stage order (semantic, do not reorder)
//!
//! The chain compiler drives each hop through a fixed pipeline:
//!
//! ```text
//! pre-conditions → decode → optional transformations (if-guarded)
//!                → essential transformations (hard-asserted)
//!                → normalization (if-guarded) → post-conditions
//! ```
//!
//! ## Invariants
//! - Whenever `is_normalize` is switched on, `normalizations` holds at least
//!   the canonical `/../` entry; switching it off clears the list.
//! - Percent-decoding substitutes every `DECODING_MAP` entry with `%25`
//!   processed **last**, so an attacker-escaped percent (`%2525`) decodes to
//!   `%25` and not to a bare `%`.
//! - The expansion helpers return fresh lists; a server's stored
//!   `normalizations` are never mutated by expansion.
//!
//! The three inconsistency buckets are audit-only: they record which probe
//! observations produced (or failed to produce) each transformation and ride
//! along in the persisted artifact.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::condition::{all_to_constraint, Condition};
use crate::encoding::{
    partial_replace_combinations, percent_encode_byte, percent_encode_combinations, replace_all,
    RawStr,
};
use crate::smt::{BoolExpr, StrExpr};
use crate::solver::SolverContext;
use crate::transform::{base_normalization, Transformation};

// ============================================================================
// Audit records
// ============================================================================

/// One observed probe: request type plus the wire inbound/outbound pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyEntry {
    /// Probe request type (`transformation_composite_middle`, …).
    pub request_type: String,
    /// Inbound URL bytes as captured.
    pub inbound: RawStr,
    /// Outbound URL bytes as captured (empty when the probe died).
    pub outbound: RawStr,
    /// Correlation id from the capture pipeline, when present.
    pub x_request_id: Option<String>,
}

/// All observations for one probe character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InconsistencyInfo {
    /// The probe seed as lowercase hex (`"3b"`), or `"empty"`.
    pub hex_value: String,
    /// The probe character's raw bytes.
    pub char_value: RawStr,
    /// Observed request-type / inbound / outbound records.
    pub entries: Vec<InconsistencyEntry>,
}

// ============================================================================
// Server
// ============================================================================

/// Surrogate model of one HTTP intermediary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    /// Server name, as keyed in the inconsistency report.
    pub name: String,
    /// Global conditions, conjoined into every pre-condition check.
    pub conditions: Vec<Condition>,
    /// Conditions on the hop's inbound URL.
    pub pre_conditions: Vec<Condition>,
    /// Conditions on the hop's outbound URL.
    pub post_conditions: Vec<Condition>,
    /// Optional transformations the enumerator may select.
    pub transformations: Vec<Transformation>,
    /// Transformations this server always applies; their guards are hard
    /// requirements of the chain.
    pub essential_transformations: Vec<Transformation>,
    is_normalize: bool,
    is_decode: bool,
    normalizations: Vec<Transformation>,
    /// Accepted inconsistency observations (audit).
    pub inconsistencies: Vec<InconsistencyInfo>,
    /// Observations explained by standard percent-encoding (audit).
    pub omitted: Vec<InconsistencyInfo>,
    /// Observations no synthesis rule could absorb (audit).
    pub unprocessed: Vec<InconsistencyInfo>,
}

impl Server {
    /// A server with no conditions, transformations, or flags.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: Vec::new(),
            pre_conditions: Vec::new(),
            post_conditions: Vec::new(),
            transformations: Vec::new(),
            essential_transformations: Vec::new(),
            is_normalize: false,
            is_decode: false,
            normalizations: Vec::new(),
            inconsistencies: Vec::new(),
            omitted: Vec::new(),
            unprocessed: Vec::new(),
        }
    }

    /// Whether this server normalizes dot segments.
    pub fn is_normalize(&self) -> bool {
        self.is_normalize
    }

    /// Whether this server percent-decodes before rewriting.
    pub fn is_decode(&self) -> bool {
        self.is_decode
    }

    /// The server's stored normalization transformations.
    pub fn normalizations(&self) -> &[Transformation] {
        &self.normalizations
    }

    /// Toggle normalization, maintaining the seeded-default invariant.
    pub fn set_normalize(&mut self, value: bool) {
        if self.is_normalize == value {
            return;
        }
        self.is_normalize = value;
        if value {
            self.seed_default_normalization();
            debug!(server = %self.name, "normalize on; seeded /../ normalization");
        } else {
            self.normalizations.clear();
            debug!(server = %self.name, "normalize off; cleared normalizations");
        }
    }

    /// Toggle decoding; re-seeds the default normalization when normalizing.
    pub fn set_decode(&mut self, value: bool) {
        if self.is_decode == value {
            return;
        }
        self.is_decode = value;
        if self.is_normalize {
            self.seed_default_normalization();
        }
    }

    fn seed_default_normalization(&mut self) {
        let base = base_normalization();
        if !self.normalizations.iter().any(|n| n.rewrite == base.rewrite) {
            self.normalizations.push(base);
        }
    }

    /// Re-establish the normalization invariant after deserialization.
    pub fn restore_invariants(&mut self) {
        if self.is_normalize && self.normalizations.is_empty() {
            self.seed_default_normalization();
        }
        if !self.is_normalize {
            self.normalizations.clear();
        }
    }

    // ------------------------------------------------------------------
    // Symbolic pipeline stages
    // ------------------------------------------------------------------

    /// Bind a fresh alias for the hop input and conjoin the pre-conditions
    /// plus the server-global conditions over it.
    pub fn apply_pre_conditions(&self, ctx: &mut SolverContext, s: &StrExpr) -> BoolExpr {
        let pre = ctx.fresh_str("pre");
        let mut parts = vec![pre.eq_str(s)];
        parts.push(all_to_constraint(&self.pre_conditions, &pre));
        parts.push(all_to_constraint(&self.conditions, &pre));
        BoolExpr::conj(parts)
    }

    /// Bind a fresh alias for the hop output and conjoin the post-conditions.
    pub fn apply_post_conditions(&self, ctx: &mut SolverContext, s: &StrExpr) -> BoolExpr {
        let post = ctx.fresh_str("post");
        let mut parts = vec![post.eq_str(s)];
        parts.push(all_to_constraint(&self.post_conditions, &post));
        BoolExpr::conj(parts)
    }

    /// Percent-decoding as a symbolic expression; identity when the server
    /// does not decode. `%25` is substituted last.
    pub fn apply_decoding(&self, s: &StrExpr) -> StrExpr {
        if !self.is_decode {
            return s.clone();
        }
        let mut cur = s.clone();
        for b in 0u16..=255 {
            let b = b as u8;
            if b == b'%' {
                continue;
            }
            cur = cur.replace_all(
                &StrExpr::lit(RawStr::from(&percent_encode_byte(b)[..])),
                &StrExpr::lit(RawStr::from(&[b][..])),
            );
        }
        cur.replace_all(&StrExpr::lit("%25"), &StrExpr::lit("%"))
    }

    /// Concrete mirror of [`Server::apply_decoding`], same substitution
    /// order, for the validator.
    pub fn decode_concrete(&self, s: &[u8]) -> Vec<u8> {
        if !self.is_decode {
            return s.to_vec();
        }
        let mut cur = s.to_vec();
        for b in 0u16..=255 {
            let b = b as u8;
            if b == b'%' {
                continue;
            }
            cur = replace_all(&cur, percent_encode_byte(b), &[b]);
        }
        replace_all(&cur, b"%25", b"%")
    }

    /// If-guard fold over the chosen optional transformations: each step is a
    /// conditional rewrite the solver may see fire or pass through, depending
    /// on whether its own guard holds on the running value.
    pub fn apply_transformations(
        &self,
        ctx: &mut SolverContext,
        chosen: &[Transformation],
        s: &StrExpr,
    ) -> (StrExpr, BoolExpr) {
        let mut cur = ctx.fresh_str("t");
        let mut parts = vec![cur.eq_str(s)];
        for t in chosen {
            let (rewritten, guard) = t.apply_single(ctx, &cur);
            let next = ctx.fresh_str("t");
            parts.push(next.eq_str(&StrExpr::ite(&guard, &rewritten, &cur)));
            cur = next;
        }
        (cur, BoolExpr::conj(parts))
    }

    /// Essential transformations: guards are asserted, not if-folded. A
    /// chain choice whose input cannot satisfy an essential guard is
    /// unsatisfiable by construction.
    pub fn apply_essential_transformations(
        &self,
        ctx: &mut SolverContext,
        s: &StrExpr,
    ) -> (StrExpr, BoolExpr) {
        let mut cur = ctx.fresh_str("t");
        let mut parts = vec![cur.eq_str(s)];
        for t in &self.essential_transformations {
            let (rewritten, guard) = t.apply_single(ctx, &cur);
            let next = ctx.fresh_str("t");
            parts.push(guard);
            parts.push(next.eq_str(&rewritten));
            cur = next;
        }
        (cur, BoolExpr::conj(parts))
    }

    /// One if-guarded application of the selected normalization (the chain's
    /// normalization expander may substitute which variant is used).
    /// Identity when the server does not normalize.
    pub fn apply_normalization(
        &self,
        ctx: &mut SolverContext,
        s: &StrExpr,
        selected: Option<&Transformation>,
    ) -> (StrExpr, BoolExpr) {
        if !self.is_normalize {
            return (s.clone(), BoolExpr::truth());
        }
        let base = base_normalization();
        let norm = selected.unwrap_or(&base);
        let (rewritten, guard) = norm.apply_single(ctx, s);
        let next = ctx.fresh_str("norm");
        let constraint = next.eq_str(&StrExpr::ite(&guard, &rewritten, s));
        (next, constraint)
    }

    // ------------------------------------------------------------------
    // Normalization expansion (pure)
    // ------------------------------------------------------------------

    /// Expand a base normalization into its encoded variants.
    ///
    /// When the server decodes (or `assume_decode` is set because an adjacent
    /// hop decodes on the way in), every `/` and every `.` position subset of
    /// the normalization string gets a percent-encoded variant; each variant
    /// becomes its own `Contains`-guarded normalization. Returns an empty
    /// list for non-normalizing servers.
    pub fn expand_with_decode(
        &self,
        base: &Transformation,
        assume_decode: bool,
    ) -> Vec<Transformation> {
        if !self.is_normalize {
            return Vec::new();
        }
        let Some(base_str) = base.norm_str() else {
            debug!(server = %self.name, base = %base.name, "expansion base is not a normalization");
            return Vec::new();
        };

        let mut expansion = vec![Transformation::normalization(base_str.clone())];
        if self.is_decode || assume_decode {
            for target in [b'/', b'.'] {
                let snapshot: Vec<RawStr> = expansion
                    .iter()
                    .filter_map(|t| t.norm_str().cloned())
                    .collect();
                let mut seen: HashSet<RawStr> = snapshot.iter().cloned().collect();
                for original in &snapshot {
                    for variant in percent_encode_combinations(original.as_bytes(), target) {
                        if seen.insert(variant.clone()) {
                            expansion.push(Transformation::normalization(variant));
                        }
                    }
                }
            }
        }
        expansion
    }

    /// Expand the stored normalizations through an observed `Replace`
    /// rewrite: every partial back-substitution of the replacement with the
    /// target becomes a variant (the attacker can pre-apply the server's own
    /// rewrite), plus encoded variants when the server decodes.
    pub fn expand_with_replace(
        &self,
        target: &RawStr,
        replacement: &RawStr,
    ) -> Vec<Transformation> {
        let mut result: Vec<Transformation> = Vec::new();
        let mut seen: HashSet<RawStr> = HashSet::new();
        for norm in &self.normalizations {
            if let Some(n) = norm.norm_str() {
                if seen.insert(n.clone()) {
                    result.push(Transformation::normalization(n.clone()));
                }
            }
        }

        let mut expanded: Vec<RawStr> = Vec::new();
        let mut push_unique = |list: &mut Vec<RawStr>, seen: &mut HashSet<RawStr>, v: RawStr| {
            if seen.insert(v.clone()) {
                list.push(v);
            }
        };

        for norm in &self.normalizations {
            let Some(norm_str) = norm.norm_str() else { continue };
            if norm_str.contains_bytes(replacement.as_bytes()) {
                for candidate in partial_replace_combinations(
                    norm_str.as_bytes(),
                    replacement.as_bytes(),
                    target.as_bytes(),
                ) {
                    push_unique(&mut expanded, &mut seen, candidate);
                }
            }
        }

        if self.is_decode {
            let snapshot = expanded.clone();
            for candidate in &snapshot {
                for target_byte in [b'/', b'.'] {
                    for variant in percent_encode_combinations(candidate.as_bytes(), target_byte) {
                        push_unique(&mut expanded, &mut seen, variant);
                    }
                }
            }

            // A single-byte replace target also appears in its encoded form
            // once an upstream hop has escaped it.
            if let [single] = target.as_bytes() {
                let encoded = RawStr::from(&percent_encode_byte(*single)[..]);
                let snapshot = expanded.clone();
                for candidate in &snapshot {
                    for variant in partial_replace_combinations(
                        candidate.as_bytes(),
                        target.as_bytes(),
                        encoded.as_bytes(),
                    ) {
                        push_unique(&mut expanded, &mut seen, variant);
                    }
                }
            }
        }

        result.extend(expanded.into_iter().map(Transformation::normalization));
        result
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_toggle_seeds_and_clears() {
        let mut s = Server::new("proxy");
        assert!(s.normalizations().is_empty());
        s.set_normalize(true);
        assert_eq!(s.normalizations().len(), 1);
        assert_eq!(
            s.normalizations()[0].norm_str().map(|n| n.as_bytes()),
            Some(&b"/../"[..])
        );
        s.set_normalize(false);
        assert!(s.normalizations().is_empty());
    }

    #[test]
    fn decode_toggle_reseeds_under_normalize() {
        let mut s = Server::new("proxy");
        s.set_normalize(true);
        s.normalizations.clear();
        s.set_decode(true);
        assert_eq!(s.normalizations().len(), 1);
    }

    #[test]
    fn decoding_treats_percent25_last() {
        let mut s = Server::new("app");
        s.set_decode(true);
        // "%2525" collapses exactly once: to "%25", never to a bare "%".
        assert_eq!(s.decode_concrete(b"/%2525"), b"/%25".to_vec());
        assert_eq!(s.decode_concrete(b"/%21admin"), b"/!admin".to_vec());
        assert_eq!(s.decode_concrete(b"/%2F%2E"), b"//.".to_vec());
        // Lowercase forms are not in the decoding map.
        assert_eq!(s.decode_concrete(b"/%2f"), b"/%2f".to_vec());
    }

    #[test]
    fn decoding_is_identity_without_the_flag() {
        let s = Server::new("app");
        assert_eq!(s.decode_concrete(b"/%21"), b"/%21".to_vec());
    }

    #[test]
    fn expansion_with_decode_contains_encoded_dot_variants() {
        let mut s = Server::new("proxy");
        s.set_normalize(true);
        s.set_decode(true);
        let expanded = s.expand_with_decode(&base_normalization(), false);
        let strings: Vec<String> = expanded
            .iter()
            .filter_map(|t| t.norm_str().map(|n| n.to_string()))
            .collect();
        assert!(strings.contains(&"/../".to_string()));
        assert!(strings.contains(&"%2F..%2F".to_string()));
        assert!(strings.contains(&"/%2E%2E/".to_string()));
        assert!(strings.contains(&"%2F%2E%2E%2F".to_string()));
        // Plain base stays first so the canonical choice is tried first.
        assert_eq!(expanded[0].norm_str().map(|n| n.as_bytes()), Some(&b"/../"[..]));
    }

    #[test]
    fn expansion_without_normalize_is_empty() {
        let mut s = Server::new("origin");
        s.set_decode(true);
        assert!(s.expand_with_decode(&base_normalization(), false).is_empty());
    }

    #[test]
    fn expansion_does_not_mutate_stored_normalizations() {
        let mut s = Server::new("proxy");
        s.set_normalize(true);
        s.set_decode(true);
        let before = s.normalizations().to_vec();
        let _ = s.expand_with_decode(&base_normalization(), false);
        let _ = s.expand_with_replace(&RawStr::from(";"), &RawStr::from("/"));
        assert_eq!(s.normalizations(), before.as_slice());
    }

    #[test]
    fn replace_expansion_back_substitutes_the_target() {
        let mut s = Server::new("proxy");
        s.set_normalize(true);
        // Server rewrites ';' -> '/', so "/../" may arrive spelled ";../".
        let expanded = s.expand_with_replace(&RawStr::from(";"), &RawStr::from("/"));
        let strings: Vec<String> = expanded
            .iter()
            .filter_map(|t| t.norm_str().map(|n| n.to_string()))
            .collect();
        assert!(strings.contains(&"/../".to_string()));
        assert!(strings.contains(&";../".to_string()));
        assert!(strings.contains(&"/..;".to_string()));
        assert!(strings.contains(&";..;".to_string()));
    }

    #[test]
    fn essential_fold_asserts_guards() {
        let mut s = Server::new("app");
        s.essential_transformations.push(Transformation::new(
            "replace(; -> /)",
            crate::transform::Rewrite::Replace {
                target: RawStr::from(";"),
                replacement: RawStr::from("/"),
            },
            vec![Condition::contains(";")],
        ));
        let mut ctx = SolverContext::new();
        let input = ctx.fresh_str("url");
        let (_, constraint) = s.apply_essential_transformations(&mut ctx, &input);
        let text = crate::smt::bool_to_smt(&constraint);
        // The guard shows up bare (asserted), not inside an ite.
        assert!(text.contains("(str.contains |t!1| \";\")"));
        assert!(!text.contains("(ite (str.contains |t!1|"));
    }

    #[test]
    fn optional_fold_wraps_guards_in_ite() {
        let mut s = Server::new("app");
        s.transformations.push(Transformation::new(
            "replace(; -> /)",
            crate::transform::Rewrite::Replace {
                target: RawStr::from(";"),
                replacement: RawStr::from("/"),
            },
            vec![Condition::contains(";")],
        ));
        let chosen = s.transformations.clone();
        let mut ctx = SolverContext::new();
        let input = ctx.fresh_str("url");
        let (_, constraint) = s.apply_transformations(&mut ctx, &chosen, &input);
        let text = crate::smt::bool_to_smt(&constraint);
        assert!(text.contains("(ite (str.contains |t!1| \";\")"));
    }

    #[test]
    fn serde_roundtrip_preserves_flags_and_buckets() {
        let mut s = Server::new("proxy");
        s.set_normalize(true);
        s.set_decode(true);
        s.omitted.push(InconsistencyInfo {
            hex_value: "20".into(),
            char_value: RawStr::from(" "),
            entries: vec![InconsistencyEntry {
                request_type: "transformation_composite_middle".into(),
                inbound: RawStr::from("/ "),
                outbound: RawStr::from("/%20"),
                x_request_id: Some("abc".into()),
            }],
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: Server = serde_json::from_str(&json).unwrap();
        assert!(back.is_normalize());
        assert!(back.is_decode());
        assert_eq!(back.normalizations(), s.normalizations());
        assert_eq!(back.omitted, s.omitted);
    }
}
