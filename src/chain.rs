//! Chain compiler
//!
//! Compiles an ordered server list plus one chain choice into a single
//! satisfiability query whose model is an end-to-end exploit URL. Each hop
//! runs the fixed pipeline (pre-conditions → decode → if-guarded optional
//! transformations → hard-asserted essentials → optional normalization →
//! post-conditions), and the hop's output is equality-bound to the next
//! hop's input variable. The caller supplies the exploit [`Goal`] over
//! `(U0, UN)` and solves for `U0`.
//!
//! The stage order is semantic. Decoding before transformation is what makes
//! the percent-of-percent expansion sound; normalization after essentials is
//! what the probe classification assumed. Do not reorder.

use serde::{Deserialize, Serialize};

use crate::encoding::{index_of, RawStr};
use crate::enumerate::ChainChoice;
use crate::server::Server;
use crate::smt::{BoolExpr, StrExpr};
use crate::solver::SolverContext;
use crate::transform::Transformation;

// ============================================================================
// Exploit goal
// ============================================================================

/// The caller-supplied exploit constraint over the chain's first and final
/// URLs.
///
/// A closed sum type keeps the constraint serializable into run summaries
/// and gives the validator an exact concrete mirror of what the solver was
/// asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Goal {
    /// The final URL equals this exact path.
    FinalEquals(RawStr),
    /// The final URL ends with this suffix.
    FinalEndsWith(RawStr),
    /// The final URL contains this substring.
    FinalContains(RawStr),
    /// The final URL does not contain this substring.
    FinalNotContains(RawStr),
    /// The final URL differs from the input URL.
    DiffersFromInput,
    /// All sub-goals hold.
    All(Vec<Goal>),
}

impl Goal {
    /// Symbolic surface over the chain's input and output terms.
    pub fn to_constraint(&self, input: &StrExpr, output: &StrExpr) -> BoolExpr {
        match self {
            Goal::FinalEquals(p) => output.eq_str(&StrExpr::lit(p.clone())),
            Goal::FinalEndsWith(s) => output.has_suffix(&StrExpr::lit(s.clone())),
            Goal::FinalContains(s) => output.contains(&StrExpr::lit(s.clone())),
            Goal::FinalNotContains(s) => output.contains(&StrExpr::lit(s.clone())).negate(),
            Goal::DiffersFromInput => input.eq_str(output).negate(),
            Goal::All(goals) => BoolExpr::conj(
                goals.iter().map(|g| g.to_constraint(input, output)).collect(),
            ),
        }
    }

    /// Concrete surface with identical semantics, used by the validator.
    pub fn holds(&self, input: &[u8], output: &[u8]) -> bool {
        match self {
            Goal::FinalEquals(p) => output == p.as_bytes(),
            Goal::FinalEndsWith(s) => output.ends_with(s.as_bytes()),
            Goal::FinalContains(s) => index_of(output, s.as_bytes(), 0) != -1,
            Goal::FinalNotContains(s) => index_of(output, s.as_bytes(), 0) == -1,
            Goal::DiffersFromInput => input != output,
            Goal::All(goals) => goals.iter().all(|g| g.holds(input, output)),
        }
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// The compiled chain: the input variable the solver materializes and the
/// term the final hop emits.
pub struct ChainFormula {
    /// The symbolic input URL `U0` (a declared variable).
    pub input: StrExpr,
    /// The symbolic final URL `UN` (a declared variable).
    pub output: StrExpr,
}

impl ChainFormula {
    /// Declared name of the input variable, for model extraction.
    pub fn input_name(&self) -> &str {
        self.input.var_name().expect("chain input is a declared variable")
    }

    /// Declared name of the output variable, for model extraction.
    pub fn output_name(&self) -> &str {
        self.output.var_name().expect("chain output is a declared variable")
    }
}

/// Shape errors between a choice and the server list it targets.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The choice's vectors do not match the server count.
    #[error("choice shape mismatch: {servers} servers but {selected} selections / {flags} flags")]
    ChoiceShape {
        /// Number of servers in the chain.
        servers: usize,
        /// Length of the selection vector.
        selected: usize,
        /// Length of the normalize-flag vector.
        flags: usize,
    },
    /// More than one hop was flagged to normalize.
    #[error("choice flags {count} normalizing hops (at most one allowed)")]
    MultipleNormalize {
        /// How many flags were set.
        count: usize,
    },
}

/// Compile `servers` under `choice` into assertions on `ctx`.
///
/// `norm_override` substitutes which normalization variant the flagged hop
/// applies (the expander produces one compile call per alternative); `None`
/// falls back to the canonical `/../`. The exploit goal is *not* asserted
/// here — callers add it with [`assert_goal`], which is what lets the
/// search runner distinguish an unreachable goal from an infeasible chain.
pub fn compile(
    ctx: &mut SolverContext,
    servers: &[Server],
    choice: &ChainChoice,
    norm_override: Option<&Transformation>,
) -> Result<ChainFormula, ChainError> {
    if choice.selected.len() != servers.len() || choice.normalize.len() != servers.len() {
        return Err(ChainError::ChoiceShape {
            servers: servers.len(),
            selected: choice.selected.len(),
            flags: choice.normalize.len(),
        });
    }
    let norm_flags = choice.normalize.iter().filter(|&&b| b).count();
    if norm_flags > 1 {
        return Err(ChainError::MultipleNormalize { count: norm_flags });
    }

    let input = ctx.fresh_str("url");
    ctx.assert(input.in_byte_range());

    let mut cur = input.clone();
    for (i, server) in servers.iter().enumerate() {
        let pre = server.apply_pre_conditions(ctx, &cur);
        ctx.assert(pre);

        let decoded = server.apply_decoding(&cur);

        let (transformed, optional_constraint) =
            server.apply_transformations(ctx, &choice.selected[i], &decoded);
        ctx.assert(optional_constraint);

        let (essential, essential_constraint) =
            server.apply_essential_transformations(ctx, &transformed);
        ctx.assert(essential_constraint);

        let (normalized, norm_constraint) = if choice.normalize[i] {
            server.apply_normalization(ctx, &essential, norm_override)
        } else {
            (essential, BoolExpr::truth())
        };
        ctx.assert(norm_constraint);

        let post = server.apply_post_conditions(ctx, &normalized);
        ctx.assert(post);

        // Equality-bind this hop's outbound to the next hop's inbound.
        let next = ctx.fresh_str("url");
        ctx.assert(next.eq_str(&normalized));
        cur = next;
    }

    Ok(ChainFormula { input, output: cur })
}

/// Assert the exploit goal over a compiled chain.
pub fn assert_goal(ctx: &mut SolverContext, formula: &ChainFormula, goal: &Goal) {
    ctx.assert(goal.to_constraint(&formula.input, &formula.output));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::enumerate::ChainChoice;
    use crate::solver::{solve, solver_available, SolveOutcome, SolverConfig};
    use crate::transform::Rewrite;

    fn z3() -> Option<SolverConfig> {
        let cfg = SolverConfig::default();
        if solver_available(&cfg) {
            Some(cfg)
        } else {
            eprintln!("z3 not on PATH; skipping solver-backed test");
            None
        }
    }

    fn replace_semicolon() -> Transformation {
        Transformation::new(
            "replace(; -> /)",
            Rewrite::Replace { target: RawStr::from(";"), replacement: RawStr::from("/") },
            vec![Condition::contains(";")],
        )
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let servers = vec![Server::new("a"), Server::new("b")];
        let choice = ChainChoice { selected: vec![vec![]], normalize: vec![false] };
        let mut ctx = SolverContext::new();
        assert!(matches!(
            compile(&mut ctx, &servers, &choice, None),
            Err(ChainError::ChoiceShape { .. })
        ));
    }

    #[test]
    fn double_normalize_is_rejected() {
        let servers = vec![Server::new("a"), Server::new("b")];
        let choice =
            ChainChoice { selected: vec![vec![], vec![]], normalize: vec![true, true] };
        let mut ctx = SolverContext::new();
        assert!(matches!(
            compile(&mut ctx, &servers, &choice, None),
            Err(ChainError::MultipleNormalize { count: 2 })
        ));
    }

    #[test]
    fn goal_concrete_and_symbolic_agree_in_spirit() {
        let goal = Goal::All(vec![
            Goal::FinalEndsWith(RawStr::from("/b")),
            Goal::FinalNotContains(RawStr::from("admin")),
        ]);
        assert!(goal.holds(b"/x", b"/a/b"));
        assert!(!goal.holds(b"/x", b"/admin/b"));
        assert!(!goal.holds(b"/x", b"/b/c"));
    }

    // --- End-to-end scenario: two-hop semicolon redirect ------------------

    #[test]
    fn two_hop_redirect_synthesizes_the_known_payload() {
        let Some(cfg) = z3() else { return };

        let mut s1 = Server::new("front");
        s1.transformations.push(replace_semicolon());
        let mut s2 = Server::new("back");
        s2.set_normalize(true);
        let servers = vec![s1, s2];

        let choice = ChainChoice {
            selected: vec![vec![replace_semicolon()], vec![]],
            normalize: vec![false, true],
        };

        let mut ctx = SolverContext::new();
        let formula = compile(&mut ctx, &servers, &choice, None).unwrap();
        // Pin the known exploit input and ask whether the chain accepts it:
        // the front rewrites ';' to '/', the back collapses the dot segment.
        ctx.assert(formula.input.eq_str(&StrExpr::lit("/a;../b")));
        assert_goal(&mut ctx, &formula, &Goal::FinalEquals(RawStr::from("/b")));

        let (outcome, _) = solve(&cfg, &ctx, &[formula.input_name()]).unwrap();
        match outcome {
            SolveOutcome::Sat(model) => {
                assert_eq!(
                    model.get(formula.input_name()).map(|r| r.as_bytes()),
                    Some(&b"/a;../b"[..])
                );
            }
            other => panic!("expected sat, got {other:?}"),
        }
    }

    #[test]
    fn two_hop_redirect_is_satisfiable_without_pinning() {
        let Some(cfg) = z3() else { return };

        let mut s1 = Server::new("front");
        s1.transformations.push(replace_semicolon());
        let mut s2 = Server::new("back");
        s2.set_normalize(true);
        let servers = vec![s1, s2];

        let choice = ChainChoice {
            selected: vec![vec![replace_semicolon()], vec![]],
            normalize: vec![false, true],
        };
        let mut ctx = SolverContext::new();
        let formula = compile(&mut ctx, &servers, &choice, None).unwrap();
        assert_goal(&mut ctx, &formula, &Goal::FinalEquals(RawStr::from("/b")));
        let (outcome, _) = solve(&cfg, &ctx, &[formula.input_name()]).unwrap();
        assert!(matches!(outcome, SolveOutcome::Sat(_)));
    }

    // --- End-to-end scenario: percent-decode asymmetry --------------------

    #[test]
    fn decode_asymmetry_truncates_behind_the_front() {
        let Some(cfg) = z3() else { return };

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

        let choice = ChainChoice {
            selected: vec![vec![], vec![truncate]],
            normalize: vec![false, false],
        };

        let mut ctx = SolverContext::new();
        let formula = compile(&mut ctx, &servers, &choice, None).unwrap();
        ctx.assert(formula.input.eq_str(&StrExpr::lit("/%21admin")));
        assert_goal(
            &mut ctx,
            &formula,
            &Goal::FinalNotContains(RawStr::from("admin")),
        );

        let (outcome, _) =
            solve(&cfg, &ctx, &[formula.input_name(), formula.output_name()]).unwrap();
        match outcome {
            SolveOutcome::Sat(model) => {
                assert_eq!(
                    model.get(formula.output_name()).map(|r| r.as_bytes()),
                    Some(&b"/"[..])
                );
            }
            other => panic!("expected sat, got {other:?}"),
        }
    }

    // --- End-to-end scenario: encoded normalization variant ----------------

    #[test]
    fn encoded_dot_variant_satisfies_a_decoding_chain() {
        let Some(cfg) = z3() else { return };

        let mut s1 = Server::new("front");
        s1.set_decode(true);
        let mut s2 = Server::new("back");
        s2.set_normalize(true);
        let servers = vec![s1, s2];

        let choice = ChainChoice {
            selected: vec![vec![], vec![]],
            normalize: vec![false, true],
        };
        let effective = crate::expand::effective_normalizations(&servers, &choice);
        let strings: Vec<String> = effective
            .iter()
            .filter_map(|t| t.norm_str().map(|n| n.to_string()))
            .collect();
        assert!(strings.contains(&"/%2E%2E/".to_string()));

        // The plain /../ alternative must accept the encoded candidate: the
        // front decodes %2E before the normalizer runs.
        let base = effective
            .iter()
            .find(|t| t.norm_str().map(|n| n.as_bytes()) == Some(&b"/../"[..]))
            .unwrap();

        let mut ctx = SolverContext::new();
        let formula = compile(&mut ctx, &servers, &choice, Some(base)).unwrap();
        ctx.assert(formula.input.eq_str(&StrExpr::lit("/x/%2E%2E/y")));
        assert_goal(&mut ctx, &formula, &Goal::FinalEquals(RawStr::from("/y")));

        let (outcome, _) = solve(&cfg, &ctx, &[formula.input_name()]).unwrap();
        assert!(matches!(outcome, SolveOutcome::Sat(_)), "expected sat");
    }
}
