//! Exploit-URL synthesis CLI
//!
//! Loads a server-list artifact, runs the combination search against an
//! exploit goal, and writes the run summary (candidates, per-hop traces,
//! per-query outcomes) as JSON:
//!
//!   synthesize --model surrogate_model.json --goal-equals /admin \
//!              --timeout-ms 5000 --output run_summary.json
//!
//! Goals compose: every `--goal-*` flag given becomes one conjunct. The
//! random strategy (`--random --seed N`) samples choices without
//! replacement and records the seed in the summary.

#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use pathfault::artifact;
use pathfault::chain::Goal;
use pathfault::encoding::RawStr;
use pathfault::enumerate::Strategy;
use pathfault::search::{run, CancelToken, SearchParams};
use pathfault::solver::{solver_available, SolverConfig};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn has_flag(args: &[String], key: &str) -> bool {
    args.iter().any(|a| a == key)
}

fn build_goal(args: &[String]) -> anyhow::Result<Goal> {
    let mut goals = Vec::new();
    if let Some(p) = parse_flag(args, "--goal-equals") {
        goals.push(Goal::FinalEquals(RawStr::from(p.as_str())));
    }
    if let Some(s) = parse_flag(args, "--goal-suffix") {
        goals.push(Goal::FinalEndsWith(RawStr::from(s.as_str())));
    }
    if let Some(s) = parse_flag(args, "--goal-contains") {
        goals.push(Goal::FinalContains(RawStr::from(s.as_str())));
    }
    if let Some(s) = parse_flag(args, "--goal-not-contains") {
        goals.push(Goal::FinalNotContains(RawStr::from(s.as_str())));
    }
    if has_flag(args, "--goal-differs") {
        goals.push(Goal::DiffersFromInput);
    }
    match goals.len() {
        0 => Err(anyhow::anyhow!(
            "no exploit goal given; pass at least one of --goal-equals, --goal-suffix, \
             --goal-contains, --goal-not-contains, --goal-differs"
        )),
        1 => Ok(goals.pop().expect("len checked")),
        _ => Ok(Goal::All(goals)),
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let model_path = parse_flag(&args, "--model")
        .ok_or_else(|| anyhow::anyhow!("--model <surrogate_model.json> is required"))?;
    let servers = artifact::load_servers(PathBuf::from(&model_path).as_path())?;
    eprintln!(
        "loaded {} server(s): {}",
        servers.len(),
        servers.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(" -> ")
    );

    let goal = build_goal(&args)?;

    let mut solver = SolverConfig::default();
    if let Some(z3) = parse_flag(&args, "--z3") {
        solver.z3_path = PathBuf::from(z3);
    }
    if let Some(ms) = parse_flag(&args, "--timeout-ms").and_then(|s| s.parse().ok()) {
        solver.timeout = Duration::from_millis(ms);
    }
    if !solver_available(&solver) {
        return Err(anyhow::anyhow!(
            "solver `{}` is not runnable; install z3 or pass --z3 <path>",
            solver.z3_path.display()
        ));
    }

    let strategy = if has_flag(&args, "--random") {
        let seed = parse_flag(&args, "--seed")
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(rand::random::<u64>);
        Strategy::Random { seed }
    } else {
        Strategy::Exhaustive
    };

    let mut params = SearchParams { strategy, solver, ..SearchParams::default() };
    if let Some(n) = parse_flag(&args, "--max-transforms").and_then(|s| s.parse().ok()) {
        params.max_transforms = n;
    }
    params.max_choices = parse_flag(&args, "--limit").and_then(|s| s.parse().ok());

    let cancel = CancelToken::new();
    let summary = run(&servers, &goal, &params, &cancel)?;

    eprintln!(
        "explored {}/{} combination(s) in {} query(ies): sat={} infeasible={} \
         guard_conflicts={} unknown={} errors={}",
        summary.explored_choices,
        summary.combination_count,
        summary.queries,
        summary.sat,
        summary.infeasible,
        summary.guard_conflicts,
        summary.unknown,
        summary.errors,
    );
    for candidate in &summary.candidates {
        let mark = if candidate.validator_pass { "✓" } else { "✗" };
        eprintln!("  {mark} {}  [{}]", candidate.candidate_url, candidate.choice);
    }

    let output = PathBuf::from(
        parse_flag(&args, "--output").unwrap_or_else(|| "run_summary.json".to_string()),
    );
    artifact::write_json(&output, &summary)?;
    eprintln!("✓ Wrote {}", output.display());
    Ok(())
}
