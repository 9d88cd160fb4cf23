//! Surrogate-model builder CLI
//!
//! Reads an inconsistency report (JSON, URLs as wire hex) and writes the
//! persistent server-list artifact the synthesizer consumes:
//!
//!   build_model --report analysis_results.json --servers haproxy,tomcat
//!
//! With `--depth N`, one artifact is written per ordered N-permutation of
//! the selected servers, under `--output` treated as a directory — the
//! bulk mode used when sweeping every candidate chain of a deployment.

#![forbid(unsafe_code)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use pathfault::artifact;
use pathfault::report::{self, Report};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

fn load_report(path: &Path) -> anyhow::Result<Report> {
    let text = fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("read report {}: {e}", path.display()))?;
    Ok(report::parse_report(&text)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let report_path = parse_flag(&args, "--report")
        .ok_or_else(|| anyhow::anyhow!("--report <analysis_results.json> is required"))?;
    let report = load_report(Path::new(&report_path))?;

    let all_names: Vec<String> = report.servers.keys().cloned().collect();
    eprintln!("report servers:");
    for (i, name) in all_names.iter().enumerate() {
        eprintln!("  {}. {name}", i + 1);
    }

    let selected: Vec<String> = match parse_flag(&args, "--servers") {
        Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        None => all_names.clone(),
    };
    let depth: Option<usize> = parse_flag(&args, "--depth").and_then(|s| s.parse().ok());

    if let Some(depth) = depth {
        // Bulk mode: one artifact per ordered server chain.
        let out_dir = PathBuf::from(
            parse_flag(&args, "--output").unwrap_or_else(|| format!("surrogate_models_depth_{depth}")),
        );
        fs::create_dir_all(&out_dir)
            .map_err(|e| anyhow::anyhow!("create {}: {e}", out_dir.display()))?;

        let permutations = report::server_permutations(&selected, depth);
        eprintln!("building {} chain artifact(s) at depth {depth}...", permutations.len());
        let mut written = 0usize;
        for chain in &permutations {
            let servers = report::build_servers(&report, chain)?;
            let unprocessed = report::unprocessed_count(&servers);
            let file = out_dir.join(format!("surrogate_model_{}.json", chain.join("_")));
            artifact::save_servers(&file, &servers)?;
            written += 1;
            if unprocessed > 0 {
                eprintln!(
                    "  {} ({unprocessed} unprocessed observation(s))",
                    file.display()
                );
            }
        }
        eprintln!("✓ Wrote {written} artifact(s) under {}", out_dir.display());
        return Ok(());
    }

    let output = PathBuf::from(
        parse_flag(&args, "--output").unwrap_or_else(|| "surrogate_model.json".to_string()),
    );
    let servers = report::build_servers(&report, &selected)?;

    for s in &servers {
        eprintln!(
            "{}: decode={} normalize={} transformations={} conditions={} omitted={} unprocessed={}",
            s.name,
            s.is_decode(),
            s.is_normalize(),
            s.transformations.len(),
            s.conditions.len(),
            s.omitted.len(),
            s.unprocessed.len(),
        );
    }
    let unprocessed = report::unprocessed_count(&servers);
    if unprocessed == 0 {
        eprintln!("all inconsistency observations processed");
    } else {
        eprintln!("⚠ {unprocessed} observation(s) fit no synthesis rule (kept for audit)");
    }

    artifact::save_servers(&output, &servers)?;
    eprintln!("✓ Wrote {}", output.display());
    Ok(())
}
