//! End-to-end exploit search
//!
//! The runner wires the whole core together: enumerate chain choices (C6),
//! expand the flagged hop's normalization alternatives (C7), compile one
//! self-contained solver query per `(choice, alternative)` (C5), classify
//! the outcome, and concretely validate every SAT model (C8). Results are
//! collected in enumeration order, so an exhaustive run is reproducible
//! line-for-line; a random run records its PRNG seed instead.
//!
//! Outcome classification:
//! - **Sat** — a candidate URL, plus its validator verdict.
//! - **Infeasible** — the chain is consistent but the goal is unreachable.
//! - **GuardConflict** — the chain itself is unsatisfiable (an essential
//!   guard cannot hold); detected by re-solving without the goal, which
//!   only costs a second query on the UNSAT path.
//! - **Unknown** — solver timeout or incompleteness, with elapsed time.
//! - **Error** — a transport-level failure for this query only.
//!
//! Recoverable failures never abort the run; only an unlaunchable solver
//! does. Cancellation is cooperative: the token is checked between queries
//! and everything already collected is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chain::{assert_goal, compile, Goal};
use crate::encoding::RawStr;
use crate::enumerate::{
    choices, combination_count, ChainChoice, Strategy, DEFAULT_MAX_TRANSFORMS,
};
use crate::expand::effective_normalizations;
use crate::server::Server;
use crate::solver::{solve, SolveOutcome, SolverConfig, SolverContext, SolverError};
use crate::transform::Transformation;
use crate::validate::{validate, HopRecord, TraceResult};

// ============================================================================
// Parameters & cancellation
// ============================================================================

/// Knobs for one search run.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Per-server cap on selected transformations.
    pub max_transforms: usize,
    /// Choice generation mode.
    pub strategy: Strategy,
    /// Solver location and per-query budget.
    pub solver: SolverConfig,
    /// Stop after this many choices (each may spawn several alternatives).
    pub max_choices: Option<usize>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            max_transforms: DEFAULT_MAX_TRANSFORMS,
            strategy: Strategy::Exhaustive,
            solver: SolverConfig::default(),
            max_choices: None,
        }
    }
}

/// Cooperative cancellation handle; checked between solver queries.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A fresh, un-cancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation at the next decision point.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// Classification of one `(choice, alternative)` query.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChoiceStatus {
    /// The solver produced a candidate URL.
    Sat {
        /// The synthesized input URL.
        candidate: RawStr,
        /// Whether concrete re-simulation confirmed it.
        validator_pass: bool,
    },
    /// Chain consistent, goal unreachable.
    Infeasible,
    /// The chain formula itself is unsatisfiable.
    GuardConflict,
    /// Timeout or incomplete reasoning.
    Unknown {
        /// The solver's verdict.
        reason: String,
    },
    /// Transport-level failure for this query.
    Error {
        /// What failed.
        message: String,
    },
}

/// One row of the run's result table.
#[derive(Debug, Clone, Serialize)]
pub struct ChoiceOutcome {
    /// Human-readable choice description.
    pub choice: String,
    /// The normalization variant in play, if the choice normalizes.
    pub normalization: Option<String>,
    /// Wall-clock time spent on this query (classification included).
    pub elapsed_ms: u64,
    /// The classified result.
    #[serde(flatten)]
    pub status: ChoiceStatus,
}

/// A validated candidate payload.
#[derive(Debug, Clone, Serialize)]
pub struct CandidateRecord {
    /// Which choice produced it.
    #[serde(rename = "choice_description")]
    pub choice: String,
    /// Which normalization variant was in play.
    pub normalization: Option<String>,
    /// The candidate input URL.
    pub candidate_url: RawStr,
    /// Concrete per-hop simulation trace.
    pub per_hop_trace: Vec<HopRecord>,
    /// Whether the concrete final URL satisfies the goal.
    pub validator_pass: bool,
}

/// Aggregate result of one search run.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    /// RFC 3339 start stamp.
    pub started_at: String,
    /// RFC 3339 finish stamp.
    pub finished_at: String,
    /// `"exhaustive"` or `"random"`.
    pub strategy: String,
    /// PRNG seed, recorded for random runs.
    pub seed: Option<u64>,
    /// Exhaustive combination count for this chain (decimal string).
    pub combination_count: String,
    /// Choices actually drawn from the enumerator.
    pub explored_choices: usize,
    /// Solver queries dispatched (alternatives included).
    pub queries: usize,
    /// SAT outcomes.
    pub sat: usize,
    /// Infeasible outcomes.
    pub infeasible: usize,
    /// Guard-conflict outcomes.
    pub guard_conflicts: usize,
    /// Unknown outcomes (timeouts included).
    pub unknown: usize,
    /// Per-query transport errors.
    pub errors: usize,
    /// Whether the run was cancelled before exhausting its budget.
    pub cancelled: bool,
    /// Validated candidates, in discovery order.
    pub candidates: Vec<CandidateRecord>,
    /// Every query's outcome, in enumeration order.
    pub outcomes: Vec<ChoiceOutcome>,
}

/// Fatal search failures. Everything recoverable lands in the summary.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The solver executable could not be launched at all.
    #[error(transparent)]
    Solver(#[from] SolverError),
}

// ============================================================================
// The runner
// ============================================================================

/// Run the search: enumerate, expand, compile, solve, validate, collect.
pub fn run(
    servers: &[Server],
    goal: &Goal,
    params: &SearchParams,
    cancel: &CancelToken,
) -> Result<RunSummary, SearchError> {
    let started_at = chrono::Utc::now().to_rfc3339();
    let total = combination_count(servers, params.max_transforms);
    let (strategy_name, seed) = match params.strategy {
        Strategy::Exhaustive => ("exhaustive", None),
        Strategy::Random { seed } => ("random", Some(seed)),
    };
    info!(
        servers = servers.len(),
        combinations = %total,
        strategy = strategy_name,
        "starting exploit search"
    );

    let mut summary = RunSummary {
        started_at,
        finished_at: String::new(),
        strategy: strategy_name.to_string(),
        seed,
        combination_count: total.to_string(),
        explored_choices: 0,
        queries: 0,
        sat: 0,
        infeasible: 0,
        guard_conflicts: 0,
        unknown: 0,
        errors: 0,
        cancelled: false,
        candidates: Vec::new(),
        outcomes: Vec::new(),
    };

    'choices: for choice in choices(servers, params.max_transforms, params.strategy) {
        if cancel.is_cancelled() {
            summary.cancelled = true;
            break;
        }
        if let Some(limit) = params.max_choices {
            if summary.explored_choices >= limit {
                break;
            }
        }
        summary.explored_choices += 1;

        // One alternative per effective normalization variant; exactly one
        // goal-directed query when nothing normalizes.
        let alternatives: Vec<Option<Transformation>> = match choice.normalize_index() {
            Some(_) => {
                let expanded = effective_normalizations(servers, &choice);
                if expanded.is_empty() {
                    // Every variant was pruned by an upstream hop; nothing
                    // for this choice to do.
                    debug!(choice = %choice.describe(servers), "all normalization variants pruned");
                    continue;
                }
                expanded.into_iter().map(Some).collect()
            }
            None => vec![None],
        };

        for alternative in alternatives {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break 'choices;
            }
            let outcome = run_query(
                servers,
                goal,
                params,
                &choice,
                alternative.as_ref(),
                &mut summary,
            )?;
            summary.outcomes.push(outcome);
            summary.queries += 1;
        }
    }

    summary.finished_at = chrono::Utc::now().to_rfc3339();
    info!(
        queries = summary.queries,
        sat = summary.sat,
        infeasible = summary.infeasible,
        guard_conflicts = summary.guard_conflicts,
        unknown = summary.unknown,
        candidates = summary.candidates.len(),
        "search finished"
    );
    Ok(summary)
}

fn run_query(
    servers: &[Server],
    goal: &Goal,
    params: &SearchParams,
    choice: &ChainChoice,
    alternative: Option<&Transformation>,
    summary: &mut RunSummary,
) -> Result<ChoiceOutcome, SearchError> {
    let description = choice.describe(servers);
    let normalization = alternative.map(|t| t.name.clone());
    let mut elapsed = Duration::ZERO;

    let mut ctx = SolverContext::new();
    let formula = match compile(&mut ctx, servers, choice, alternative) {
        Ok(f) => f,
        Err(e) => {
            summary.errors += 1;
            return Ok(ChoiceOutcome {
                choice: description,
                normalization,
                elapsed_ms: 0,
                status: ChoiceStatus::Error { message: e.to_string() },
            });
        }
    };
    assert_goal(&mut ctx, &formula, goal);

    let wanted = [formula.input_name()];
    let status = match solve(&params.solver, &ctx, &wanted) {
        Ok((SolveOutcome::Sat(model), took)) => {
            elapsed += took;
            match model.get(formula.input_name()) {
                Some(candidate) => {
                    let trace: TraceResult =
                        validate(servers, choice, alternative, candidate, goal);
                    summary.sat += 1;
                    summary.candidates.push(CandidateRecord {
                        choice: description.clone(),
                        normalization: normalization.clone(),
                        candidate_url: candidate.clone(),
                        per_hop_trace: trace.hops,
                        validator_pass: trace.validator_pass,
                    });
                    ChoiceStatus::Sat {
                        candidate: candidate.clone(),
                        validator_pass: trace.validator_pass,
                    }
                }
                None => {
                    summary.errors += 1;
                    ChoiceStatus::Error {
                        message: "sat model did not bind the input URL".to_string(),
                    }
                }
            }
        }
        Ok((SolveOutcome::Unsat, took)) => {
            elapsed += took;
            // Disambiguate: is the chain itself unsatisfiable (an essential
            // guard conflict), or just this goal?
            let mut chain_ctx = SolverContext::new();
            match compile(&mut chain_ctx, servers, choice, alternative) {
                Ok(_) => match solve(&params.solver, &chain_ctx, &[]) {
                    Ok((SolveOutcome::Unsat, took2)) => {
                        elapsed += took2;
                        summary.guard_conflicts += 1;
                        warn!(choice = %description, "essential guard conflict; choice dropped");
                        ChoiceStatus::GuardConflict
                    }
                    Ok((_, took2)) => {
                        elapsed += took2;
                        summary.infeasible += 1;
                        ChoiceStatus::Infeasible
                    }
                    Err(e) if is_fatal(&e) => return Err(e.into()),
                    Err(e) => {
                        debug!(error = %e, "goal-free reclassification failed; assuming infeasible");
                        summary.infeasible += 1;
                        ChoiceStatus::Infeasible
                    }
                },
                Err(_) => {
                    summary.infeasible += 1;
                    ChoiceStatus::Infeasible
                }
            }
        }
        Ok((SolveOutcome::Unknown { reason }, took)) => {
            elapsed += took;
            summary.unknown += 1;
            ChoiceStatus::Unknown { reason }
        }
        Err(e) if is_fatal(&e) => return Err(e.into()),
        Err(e) => {
            summary.errors += 1;
            ChoiceStatus::Error { message: e.to_string() }
        }
    };

    debug!(choice = %description, elapsed_ms = elapsed.as_millis() as u64, "query classified");
    Ok(ChoiceOutcome {
        choice: description,
        normalization,
        elapsed_ms: elapsed.as_millis() as u64,
        status,
    })
}

/// A solver that cannot even be spawned fails every future query; stop.
fn is_fatal(e: &SolverError) -> bool {
    matches!(e, SolverError::Spawn { .. })
}

// ============================================================================
// Tests
// ============================================================================
