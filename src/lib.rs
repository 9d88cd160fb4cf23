//! Crate root: public surface and engine-wide invariants
//!
//! `pathfault` discovers **path-confusion** inconsistencies across a chain
//! of HTTP intermediaries and symbolically searches for an exploit URL: an
//! input that, routed through the chain, arrives at the final server as an
//! attacker-chosen path. The crate is the surrogate-model and synthesis
//! core; packet capture, the mimic environment, and live exploit delivery
//! are external collaborators that feed it a JSON inconsistency report and
//! consume its candidate payloads.
//!
//! ## Pipeline
//!
//! ```text
//! inconsistency report ──report──▶ Server list ──artifact──▶ (persisted)
//!        Server list ──enumerate──▶ ChainChoice ──expand──▶ alternatives
//!        (servers, choice, goal) ──chain──▶ SMT query ──solver──▶ U0
//!        U0 ──validate──▶ per-hop trace + pass/fail ──search──▶ summary
//! ```
//!
//! ## Invariants (engine-wide)
//!
//! - **Bit-exact bytes.** URL values are byte strings (`RawStr`); percent
//!   coding is table-driven over the full `0x00..=0xFF` domain, and `%25`
//!   always decodes last. No host URL library is consulted.
//! - **Fixed hop order.** Pre-conditions → decode → optional transformations
//!   (if-guarded) → essential transformations (hard-asserted) →
//!   normalization → post-conditions. Reordering silently changes
//!   semantics.
//! - **Two rewrite surfaces.** The chain compiler uses single-step rewrites
//!   behind if-guards so the solver chooses what fires; the validator
//!   re-simulates concretely at fixpoint (all-matches) semantics. A SAT
//!   model failing concrete validation is reported, never trusted.
//! - **Explicit solver state.** Every compile/solve call takes a
//!   [`solver::SolverContext`]; there are no process-wide terms, and each
//!   query owns its own solver process.
//!
//! Failure mode is a precise error everywhere: recoverable problems
//! accumulate per choice and are summarized at end of run.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// Byte strings, percent tables, and position-subset utilities.
pub mod encoding;
/// Symbolic string/int/bool terms and SMT-LIB2 rendering.
pub mod smt;
/// Explicit solver context and the external solver driver.
pub mod solver;
/// Typed URL predicates (symbolic + concrete surfaces).
pub mod condition;
/// Typed URL rewrites (single-step + fixpoint surfaces).
pub mod transform;
/// Per-server surrogate model and normalization expansion.
pub mod server;
/// Surrogate builder: inconsistency report → server models.
pub mod report;
/// Server-list artifact persistence and run output.
pub mod artifact;
/// Chain-choice enumeration (exhaustive + seeded random).
pub mod enumerate;
/// Cross-hop effective-normalization expansion.
pub mod expand;
/// Chain compiler and exploit goals.
pub mod chain;
/// Concrete payload validation with per-hop traces.
pub mod validate;
/// End-to-end search runner and run summaries.
pub mod search;

// ============================================================================
// Canonical re-exports
// ============================================================================

pub use crate::artifact::{load_servers, save_servers, ArtifactError};
pub use crate::chain::{assert_goal, compile, ChainFormula, Goal};
pub use crate::condition::{Condition, ConditionKind};
pub use crate::encoding::RawStr;
pub use crate::enumerate::{
    choices, combination_count, ChainChoice, Strategy, DEFAULT_MAX_TRANSFORMS,
};
pub use crate::expand::effective_normalizations;
pub use crate::report::{build_all_servers, build_servers, parse_report, Report, ReportError};
pub use crate::search::{run, CancelToken, RunSummary, SearchParams};
pub use crate::server::Server;
pub use crate::solver::{solve, solver_available, SolveOutcome, SolverConfig, SolverContext};
pub use crate::transform::{base_normalization, Rewrite, Transformation};
pub use crate::validate::{validate, TraceResult};
