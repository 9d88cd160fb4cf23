//! Explicit solver context & external SMT solver driver
//!
//! Every compile/solve call in this crate goes through a [`SolverContext`]
//! passed explicitly by the caller — there is no process-wide solver state.
//! A context owns three things: a fresh-variable allocator, the declaration
//! list, and the assertion sink. One chain query builds one context, renders
//! one SMT-LIB2 script, and hands it to one solver process; contexts are
//! never shared between queries.
//!
//! The solver itself is an external `z3` executable driven over SMT-LIB2
//! text. The query carries both a soft limit (`:timeout`, milliseconds) and a
//! hard wall-clock limit (`-T:`), so a wedged query degrades to
//! [`SolveOutcome::Unknown`] instead of blocking the enumeration.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::encoding::RawStr;
use crate::smt::{self, BoolExpr, IntExpr, SmtError, StrExpr};

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Sort {
    Str,
    Int,
}

/// Fresh-variable allocator plus declaration/assertion sink for one query.
#[derive(Default)]
pub struct SolverContext {
    counter: u64,
    decls: Vec<(String, Sort)>,
    assertions: Vec<BoolExpr>,
}

impl SolverContext {
    /// An empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate and declare a fresh string variable tagged `tag`.
    ///
    /// Names are `tag!N` with a per-context counter, so two contexts built by
    /// the same code path produce identical scripts — the round-trip and
    /// reproducibility tests rely on this.
    pub fn fresh_str(&mut self, tag: &str) -> StrExpr {
        let name = format!("{tag}!{}", self.counter);
        self.counter += 1;
        self.decls.push((name.clone(), Sort::Str));
        StrExpr::var(name)
    }

    /// Allocate and declare a fresh integer variable tagged `tag`.
    pub fn fresh_int(&mut self, tag: &str) -> IntExpr {
        let name = format!("{tag}!{}", self.counter);
        self.counter += 1;
        self.decls.push((name.clone(), Sort::Int));
        IntExpr::var(name)
    }

    /// Add an assertion to the query.
    pub fn assert(&mut self, constraint: BoolExpr) {
        self.assertions.push(constraint);
    }

    /// Number of assertions collected so far.
    pub fn assertion_count(&self) -> usize {
        self.assertions.len()
    }

    /// Render the query as an SMT-LIB2 script.
    ///
    /// `wanted` names the variables to extract on SAT; an empty list renders
    /// a pure satisfiability check.
    pub fn script(&self, wanted: &[&str], timeout: Duration) -> String {
        let mut out = String::new();
        out.push_str(&format!("(set-option :timeout {})\n", timeout.as_millis()));
        for (name, sort) in &self.decls {
            let sort = match sort {
                Sort::Str => "String",
                Sort::Int => "Int",
            };
            out.push_str(&format!("(declare-const |{name}| {sort})\n"));
        }
        for a in &self.assertions {
            out.push_str("(assert ");
            out.push_str(&smt::bool_to_smt(a));
            out.push_str(")\n");
        }
        out.push_str("(check-sat)\n");
        if !wanted.is_empty() {
            out.push_str("(get-value (");
            for (i, name) in wanted.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push('|');
                out.push_str(name);
                out.push('|');
            }
            out.push_str("))\n");
        }
        out
    }
}

// ============================================================================
// Configuration & outcomes
// ============================================================================

/// Where the solver lives and how long a query may run.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Path to the `z3` executable.
    pub z3_path: PathBuf,
    /// Per-query budget; queries past it surface as `Unknown`.
    pub timeout: Duration,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self { z3_path: PathBuf::from("z3"), timeout: Duration::from_secs(10) }
    }
}

/// A satisfying assignment for the requested string variables.
#[derive(Debug, Clone)]
pub struct Model {
    values: BTreeMap<String, RawStr>,
}

impl Model {
    /// The value bound to `name`, if the solver reported one.
    pub fn get(&self, name: &str) -> Option<&RawStr> {
        self.values.get(name)
    }
}

/// Result of one satisfiability query.
#[derive(Debug)]
pub enum SolveOutcome {
    /// Satisfiable, with the extracted model.
    Sat(Model),
    /// Unsatisfiable.
    Unsat,
    /// Timeout or incomplete theory reasoning; never fatal.
    Unknown {
        /// The solver's own verdict (`unknown`, `timeout`, …).
        reason: String,
    },
}

/// Errors from driving the external solver.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// The solver executable could not be started at all.
    #[error("failed to launch solver `{path}`: {source}")]
    Spawn {
        /// Configured executable path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// I/O toward a running solver process failed.
    #[error("solver i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The solver produced output we could not interpret.
    #[error("unexpected solver response: {detail}")]
    BadResponse {
        /// First offending line or parse failure.
        detail: String,
    },
    /// A model value was not a byte string.
    #[error(transparent)]
    Model(#[from] SmtError),
}

// ============================================================================
// Driving z3
// ============================================================================

/// True when the configured solver executable answers `-version`.
pub fn solver_available(cfg: &SolverConfig) -> bool {
    Command::new(&cfg.z3_path)
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run one query and return its outcome plus wall-clock time.
///
/// `wanted` names the string variables to extract from a SAT model. UNSAT
/// and UNKNOWN are ordinary outcomes here — only transport-level failures
/// (spawn, I/O, unparsable responses) are errors.
pub fn solve(
    cfg: &SolverConfig,
    ctx: &SolverContext,
    wanted: &[&str],
) -> Result<(SolveOutcome, Duration), SolverError> {
    let script = ctx.script(wanted, cfg.timeout);
    debug!(bytes = script.len(), "dispatching solver query");

    // Hard wall-clock ceiling one second above the soft :timeout, so z3's own
    // budget fires first and we still get a parsable `unknown`/`timeout`.
    let hard_secs = cfg.timeout.as_secs().saturating_add(2);
    let started = Instant::now();

    let mut child = Command::new(&cfg.z3_path)
        .arg("-in")
        .arg(format!("-T:{hard_secs}"))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|source| SolverError::Spawn {
            path: cfg.z3_path.display().to_string(),
            source,
        })?;

    child
        .stdin
        .take()
        .expect("stdin was piped")
        .write_all(script.as_bytes())?;
    let output = child.wait_with_output()?;
    let elapsed = started.elapsed();

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut verdict = None;
    let mut rest_start = 0usize;
    for line in stdout.lines() {
        let trimmed = line.trim();
        rest_start += line.len() + 1;
        if trimmed.is_empty() || trimmed.starts_with("(error") {
            continue;
        }
        verdict = Some(trimmed.to_string());
        break;
    }

    let outcome = match verdict.as_deref() {
        Some("sat") => {
            let rest = stdout.get(rest_start..).unwrap_or("");
            let values = smt::parse_model_values(rest)?;
            SolveOutcome::Sat(Model { values })
        }
        Some("unsat") => SolveOutcome::Unsat,
        Some(v @ ("unknown" | "timeout" | "canceled")) => {
            SolveOutcome::Unknown { reason: v.to_string() }
        }
        Some(other) => {
            return Err(SolverError::BadResponse { detail: other.to_string() });
        }
        None => SolveOutcome::Unknown { reason: "no solver output (killed?)".to_string() },
    };

    debug!(?elapsed, outcome = outcome_label(&outcome), "solver query finished");
    Ok((outcome, elapsed))
}

fn outcome_label(o: &SolveOutcome) -> &'static str {
    match o {
        SolveOutcome::Sat(_) => "sat",
        SolveOutcome::Unsat => "unsat",
        SolveOutcome::Unknown { .. } => "unknown",
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smt::StrExpr;

    #[test]
    fn fresh_names_are_deterministic_per_context() {
        let mut a = SolverContext::new();
        let mut b = SolverContext::new();
        assert_eq!(a.fresh_str("url").var_name(), b.fresh_str("url").var_name());
        assert_eq!(a.fresh_str("pre").var_name(), Some("pre!1"));
        assert_eq!(b.fresh_str("pre").var_name(), Some("pre!1"));
    }

    #[test]
    fn script_contains_decls_asserts_and_extraction() {
        let mut ctx = SolverContext::new();
        let u = ctx.fresh_str("url");
        ctx.assert(u.contains(&StrExpr::lit(";")));
        let script = ctx.script(&["url!0"], Duration::from_millis(1500));
        assert!(script.contains("(set-option :timeout 1500)"));
        assert!(script.contains("(declare-const |url!0| String)"));
        assert!(script.contains("(assert (str.contains |url!0| \";\"))"));
        assert!(script.contains("(check-sat)"));
        assert!(script.contains("(get-value (|url!0|))"));
    }

    #[test]
    fn end_to_end_sat_when_z3_present() {
        let cfg = SolverConfig::default();
        if !solver_available(&cfg) {
            eprintln!("z3 not on PATH; skipping solver test");
            return;
        }
        let mut ctx = SolverContext::new();
        let u = ctx.fresh_str("url");
        ctx.assert(u.in_byte_range());
        ctx.assert(u.eq_str(&StrExpr::lit("/a;b")));
        let (outcome, _) = solve(&cfg, &ctx, &["url!0"]).unwrap();
        match outcome {
            SolveOutcome::Sat(model) => {
                assert_eq!(model.get("url!0").map(|r| r.as_bytes()), Some(&b"/a;b"[..]));
            }
            other => panic!("expected sat, got {other:?}"),
        }
    }

    #[test]
    fn end_to_end_unsat_when_z3_present() {
        let cfg = SolverConfig::default();
        if !solver_available(&cfg) {
            eprintln!("z3 not on PATH; skipping solver test");
            return;
        }
        let mut ctx = SolverContext::new();
        let u = ctx.fresh_str("url");
        ctx.assert(u.eq_str(&StrExpr::lit("/a")));
        ctx.assert(u.eq_str(&StrExpr::lit("/b")));
        let (outcome, _) = solve(&cfg, &ctx, &[]).unwrap();
        assert!(matches!(outcome, SolveOutcome::Unsat));
    }
}
