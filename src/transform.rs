//! Transformation model
//!
//! A [`Transformation`] is a named, guarded rewrite of a URL byte string.
//! The rewrite itself is a closed sum type ([`Rewrite`]) so the synthesis
//! and expansion case analyses stay exhaustive under the compiler's eye.
//!
//! Every transformation exposes two surfaces:
//!
//! - [`Transformation::apply_single`] — the **symbolic single-step** form
//!   used by the chain compiler. It emits the rewritten term plus the guard
//!   conjunction evaluated on the *input*; the compiler decides whether to
//!   if-guard or hard-assert that guard.
//! - [`Transformation::apply_concrete`] — the **fixpoint** form used by the
//!   validator. `Replace` rewrites every non-overlapping match (scanning the
//!   original text, so introduced bytes are never re-matched); the remaining
//!   rewrites are single-shot by construction. Substring arithmetic mirrors
//!   the solver's total semantics: out-of-range yields the empty string.
//!
//! Guards are pure predicates over the stage input; applying a rewrite never
//! re-evaluates them against its own output.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::condition::{all_hold, all_to_constraint, Condition};
use crate::encoding::{
    index_of, last_index_of_byte, replace_all, substr_total, RawStr,
};
use crate::smt::{BoolExpr, IntExpr, StrExpr};
use crate::solver::SolverContext;

/// The canonical dot-segment normalization string.
pub const BASE_NORM_STR: &[u8] = b"/../";

// ============================================================================
// Rewrite sum type
// ============================================================================

/// A typed rewrite over a URL byte string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rewrite {
    /// Replace `target` with `replacement` (first match single-step, all
    /// matches at fixpoint).
    Replace {
        /// Bytes to find.
        target: RawStr,
        /// Bytes to substitute.
        replacement: RawStr,
    },
    /// Keep `s[offset .. indexof(delimiter))` — truncation at a delimiter.
    SubStringUntil {
        /// Start offset.
        offset: i64,
        /// Delimiter searched from the start of the string.
        delimiter: RawStr,
    },
    /// Keep the suffix starting at `offset`.
    SubStringFromOffset {
        /// Start offset.
        offset: i64,
    },
    /// Prepend a fixed string.
    AddPrefix {
        /// Bytes to prepend.
        prefix: RawStr,
    },
    /// Append a fixed string.
    AddSuffix {
        /// Bytes to append.
        suffix: RawStr,
    },
    /// Drop `s[indexof(delim) .. indexof('/', after delim))`, keeping the
    /// separating slash so the remaining segments stay rooted.
    DelimiterSlashSplit {
        /// Delimiter opening the dropped span.
        delimiter: RawStr,
    },
    /// Dot-segment style normalization: locate `norm`, cut back to the
    /// preceding `/` boundary, splice the two sides together.
    Normalize {
        /// The normalization string to collapse (non-empty).
        norm: RawStr,
    },
}

impl Rewrite {
    fn apply_symbolic(&self, ctx: &mut SolverContext, s: &StrExpr) -> StrExpr {
        match self {
            Rewrite::Replace { target, replacement } => {
                s.replace(&StrExpr::lit(target.clone()), &StrExpr::lit(replacement.clone()))
            }
            Rewrite::SubStringUntil { offset, delimiter } => {
                let idx = s.index_of(&StrExpr::lit(delimiter.clone()), &IntExpr::lit(0));
                let len = idx.sub(&IntExpr::lit(*offset));
                s.substr(&IntExpr::lit(*offset), &len)
            }
            Rewrite::SubStringFromOffset { offset } => {
                let len = s.length().sub(&IntExpr::lit(*offset));
                s.substr(&IntExpr::lit(*offset), &len)
            }
            Rewrite::AddPrefix { prefix } => StrExpr::lit(prefix.clone()).concat(s),
            Rewrite::AddSuffix { suffix } => s.concat(&StrExpr::lit(suffix.clone())),
            Rewrite::DelimiterSlashSplit { delimiter } => {
                let delim_at = s.index_of(&StrExpr::lit(delimiter.clone()), &IntExpr::lit(0));
                let slash_at =
                    s.index_of(&StrExpr::lit("/"), &delim_at.add(&IntExpr::lit(1)));
                let head = s.substr(&IntExpr::lit(0), &delim_at);
                let tail = s.substr(&slash_at, &s.length().sub(&slash_at));
                head.concat(&tail)
            }
            Rewrite::Normalize { norm } => {
                let norm_lit = StrExpr::lit(norm.clone());
                let at = s.index_of(&norm_lit, &IntExpr::lit(0));
                let head = s.substr(&IntExpr::lit(0), &at);

                // The string theory has no last-indexof, so the preceding `/`
                // boundary is a fresh integer pinned down by its defining
                // constraint: either no slash exists in the head, or `j`
                // points at a slash with none after it.
                let j = ctx.fresh_int("normcut");
                let slash = StrExpr::lit("/");
                let no_slash = j
                    .eq_int(&IntExpr::lit(-1))
                    .and(&head.contains(&slash).negate());
                let after_j = head.substr(&j.add(&IntExpr::lit(1)), &head.length());
                let at_j = head.substr(&j, &IntExpr::lit(1));
                let last_slash = BoolExpr::conj(vec![
                    j.ge_int(&IntExpr::lit(0)),
                    at_j.eq_str(&slash),
                    after_j.contains(&slash).negate(),
                ]);
                ctx.assert(BoolExpr::disj(vec![no_slash, last_slash]));

                let keep = s.substr(&IntExpr::lit(0), &j.add(&IntExpr::lit(1)));
                let resume = at.add(&IntExpr::lit(norm.len() as i64));
                let rest = s.substr(&resume, &s.length().sub(&resume));
                keep.concat(&rest)
            }
        }
    }

    fn apply_concrete_fixpoint(&self, s: &[u8]) -> Vec<u8> {
        match self {
            Rewrite::Replace { target, replacement } => {
                replace_all(s, target.as_bytes(), replacement.as_bytes())
            }
            Rewrite::SubStringUntil { offset, delimiter } => {
                let idx = index_of(s, delimiter.as_bytes(), 0);
                substr_total(s, *offset, idx - offset)
            }
            Rewrite::SubStringFromOffset { offset } => {
                substr_total(s, *offset, s.len() as i64 - offset)
            }
            Rewrite::AddPrefix { prefix } => {
                let mut out = prefix.as_bytes().to_vec();
                out.extend_from_slice(s);
                out
            }
            Rewrite::AddSuffix { suffix } => {
                let mut out = s.to_vec();
                out.extend_from_slice(suffix.as_bytes());
                out
            }
            Rewrite::DelimiterSlashSplit { delimiter } => {
                let delim_at = index_of(s, delimiter.as_bytes(), 0);
                if delim_at == -1 {
                    return s.to_vec();
                }
                let slash_at = index_of(s, b"/", delim_at + 1);
                let mut out = substr_total(s, 0, delim_at);
                out.extend_from_slice(&substr_total(s, slash_at, s.len() as i64 - slash_at));
                out
            }
            Rewrite::Normalize { norm } => {
                let at = index_of(s, norm.as_bytes(), 0);
                if at == -1 {
                    return s.to_vec();
                }
                let head = &s[..at as usize];
                let j = last_index_of_byte(head, b'/');
                let mut out = substr_total(s, 0, j + 1);
                out.extend_from_slice(&s[at as usize + norm.len()..]);
                out
            }
        }
    }

    /// The normalization string, when this rewrite is a [`Rewrite::Normalize`].
    pub fn norm_str(&self) -> Option<&RawStr> {
        match self {
            Rewrite::Normalize { norm } => Some(norm),
            _ => None,
        }
    }
}

impl fmt::Display for Rewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rewrite::Replace { target, replacement } => {
                write!(f, "replace({target} -> {replacement})")
            }
            Rewrite::SubStringUntil { offset, delimiter } => {
                write!(f, "truncate_at({delimiter}, offset {offset})")
            }
            Rewrite::SubStringFromOffset { offset } => write!(f, "suffix_from({offset})"),
            Rewrite::AddPrefix { prefix } => write!(f, "add_prefix({prefix})"),
            Rewrite::AddSuffix { suffix } => write!(f, "add_suffix({suffix})"),
            Rewrite::DelimiterSlashSplit { delimiter } => {
                write!(f, "strip_segment({delimiter})")
            }
            Rewrite::Normalize { norm } => write!(f, "normalize({norm})"),
        }
    }
}

// ============================================================================
// Transformation = name + rewrite + guards
// ============================================================================

/// A named, guarded rewrite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    /// Identifier used in choice descriptions and the canonical choice hash.
    pub name: String,
    /// The rewrite applied when the guards hold.
    pub rewrite: Rewrite,
    /// Guard conjunction over the transformation *input*; empty means
    /// unconditional.
    pub guards: Vec<Condition>,
}

impl Transformation {
    /// Build a transformation with an explicit name.
    pub fn new(name: impl Into<String>, rewrite: Rewrite, guards: Vec<Condition>) -> Self {
        Self { name: name.into(), rewrite, guards }
    }

    /// Build a normalization transformation for `norm`, guarded by
    /// `Contains(norm)` and named after the string it collapses.
    pub fn normalization(norm: impl Into<RawStr>) -> Self {
        let norm = norm.into();
        Self {
            name: format!("normalize({norm})"),
            guards: vec![Condition::contains(norm.clone())],
            rewrite: Rewrite::Normalize { norm },
        }
    }

    /// Symbolic single-step surface: `(rewritten, guard conjunction)`.
    ///
    /// Auxiliary defining constraints (the normalization boundary variable)
    /// land in `ctx` unconditionally; the guard is returned so the caller
    /// can choose between if-guarding and hard-asserting it.
    pub fn apply_single(&self, ctx: &mut SolverContext, s: &StrExpr) -> (StrExpr, BoolExpr) {
        let rewritten = self.rewrite.apply_symbolic(ctx, s);
        (rewritten, all_to_constraint(&self.guards, s))
    }

    /// Concrete fixpoint surface: rewrite real bytes, saturating all matches.
    ///
    /// Guards are *not* consulted here — the validator evaluates them on the
    /// stage input and decides whether to call this at all.
    pub fn apply_concrete(&self, s: &[u8]) -> Vec<u8> {
        self.rewrite.apply_concrete_fixpoint(s)
    }

    /// Concrete guard conjunction over the stage input.
    pub fn guards_hold(&self, s: &[u8]) -> bool {
        all_hold(&self.guards, s)
    }

    /// The normalization string, when this is a normalization.
    pub fn norm_str(&self) -> Option<&RawStr> {
        self.rewrite.norm_str()
    }
}

/// The canonical `/../` normalization, guarded by `Contains("/../")`.
pub fn base_normalization() -> Transformation {
    Transformation::normalization(RawStr::from_bytes(BASE_NORM_STR))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn replace(t: &str, r: &str) -> Transformation {
        Transformation::new(
            format!("replace({t} -> {r})"),
            Rewrite::Replace { target: RawStr::from(t), replacement: RawStr::from(r) },
            vec![Condition::contains(t)],
        )
    }

    #[test]
    fn replace_fixpoint_eliminates_every_match() {
        let t = replace(";", "/");
        assert_eq!(t.apply_concrete(b"/a;b;c"), b"/a/b/c".to_vec());
        // Target absent from the replacement => no occurrences survive.
        assert!(!t.apply_concrete(b";;;;").windows(1).any(|w| w == b";"));
    }

    #[test]
    fn replace_fixpoint_does_not_cascade_into_replacements() {
        // "ab" -> "b" over "aab": the introduced "b" must not create a fresh
        // "ab" match against the already-scanned "a".
        let t = replace("ab", "b");
        assert_eq!(t.apply_concrete(b"aab"), b"ab".to_vec());
    }

    #[test]
    fn truncate_at_delimiter() {
        let t = Transformation::new(
            "truncate_at(!)",
            Rewrite::SubStringUntil { offset: 0, delimiter: RawStr::from("!") },
            vec![Condition::contains("!")],
        );
        assert_eq!(t.apply_concrete(b"/x!admin"), b"/x".to_vec());
        // Missing delimiter: indexof is -1, the length goes negative, and the
        // total substring semantics yield the empty string.
        assert_eq!(t.apply_concrete(b"/xadmin"), Vec::<u8>::new());
    }

    #[test]
    fn delimiter_slash_split_keeps_the_separating_slash() {
        let t = Transformation::new(
            "strip_segment(;)",
            Rewrite::DelimiterSlashSplit { delimiter: RawStr::from(";") },
            vec![
                Condition::contains(";"),
                Condition::has_slash_after(";", false).unwrap(),
            ],
        );
        assert_eq!(t.apply_concrete(b"/tmp1/tmp2;tmp3/tmp4"), b"/tmp1/tmp2/tmp4".to_vec());
    }

    #[test]
    fn normalization_collapses_one_dot_segment() {
        let t = base_normalization();
        assert_eq!(t.apply_concrete(b"/a/../b"), b"/b".to_vec());
        // No preceding slash boundary: the left half is empty.
        assert_eq!(t.apply_concrete(b"x/../b"), b"b".to_vec());
    }

    #[test]
    fn normalization_to_fixpoint_by_repetition() {
        let t = base_normalization();
        let mut cur = b"/x/../y/../z".to_vec();
        while t.guards_hold(&cur) {
            cur = t.apply_concrete(&cur);
        }
        assert_eq!(cur, b"/z".to_vec());
    }

    #[test]
    fn encoded_normalization_variant() {
        let t = Transformation::normalization(RawStr::from("/%2E%2E/"));
        assert_eq!(t.name, "normalize(/%2E%2E/)");
        assert_eq!(t.apply_concrete(b"/x/%2E%2E/y"), b"/y".to_vec());
    }

    #[test]
    fn single_step_guard_is_the_guard_conjunction() {
        let mut ctx = SolverContext::new();
        let s = ctx.fresh_str("s");
        let t = replace(";", "/");
        let (_, guard) = t.apply_single(&mut ctx, &s);
        assert_eq!(crate::smt::bool_to_smt(&guard), "(str.contains |s!0| \";\")");
    }

    #[test]
    fn normalize_single_step_pins_a_boundary_variable() {
        let mut ctx = SolverContext::new();
        let s = ctx.fresh_str("s");
        let before = ctx.assertion_count();
        let (_, _) = base_normalization().apply_single(&mut ctx, &s);
        // The boundary's defining constraint lands in the context.
        assert_eq!(ctx.assertion_count(), before + 1);
    }

    #[test]
    fn serde_roundtrip() {
        let t = Transformation::new(
            "strip_segment(;)",
            Rewrite::DelimiterSlashSplit { delimiter: RawStr::from(";") },
            vec![Condition::contains(";")],
        );
        let json = serde_json::to_string(&t).unwrap();
        let back: Transformation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
