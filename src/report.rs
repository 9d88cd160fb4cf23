//! Surrogate builder: inconsistency report → server models
//!
//! Consumes the capture pipeline's JSON report (one entry per server, URLs
//! as ASCII hex off the wire) and synthesizes [`Server`] models from it:
//!
//! 1. `is_normalize` / `is_decode` come straight from the report flags.
//! 2. Every probe character the server rejected outright (the `bad` bucket)
//!    becomes a negated `Contains` condition — the chain must not route such
//!    bytes through this server. `%` is skipped: it is escape machinery, not
//!    a transform target.
//! 3. Inconsistency observations are split into *omitted* (the outbound is
//!    exactly the percent-encoded inbound — standard encoding, not a parser
//!    quirk) and *accepted* (a genuine rewrite to model).
//! 4. Accepted observations synthesize transformations by probe type; the
//!    probe framings are `/tmp1/tmp2{A}tmp3/tmp4` (without-slash) and
//!    `/tmp1/{A}/tmp2` (composite middle).
//!
//! Observations that fit no rule land in the server's `unprocessed` bucket
//! with a warning; they never abort the build.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::condition::Condition;
use crate::encoding::{replace_all, seed_bytes, RawStr};
use crate::server::{InconsistencyEntry, InconsistencyInfo, Server};
use crate::transform::{Rewrite, Transformation};

/// Probe type: `/tmp1/{A}/tmp2` with the probe char as its own segment.
pub const REQ_COMPOSITE_MIDDLE: &str = "transformation_composite_middle";
/// Probe type: `/tmp1/tmp2{A}tmp3/tmp4` with the probe char mid-segment.
pub const REQ_COMPOSITE_MIDDLE_WITHOUT_SLASH: &str =
    "transformation_composite_middle_without_slash";
/// Probe type exercising `/../` collapse; consumed by the `is_normalize` flag.
pub const REQ_NORMALIZATION: &str = "normalization";
/// Probe type exercising percent-decoding; consumed by the `is_decode` flag.
pub const REQ_DECODING_IN_RANGE: &str = "decoding_in_range";

const WITHOUT_SLASH_TRUNCATED: &[u8] = b"/tmp1/tmp2";
const WITHOUT_SLASH_SEGMENT_DROPPED: &[u8] = b"/tmp1/tmp2/tmp4";

// ============================================================================
// Report schema (input)
// ============================================================================

/// The full inconsistency report: server name → observed behavior.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct Report {
    /// Per-server observations, keyed by the capture pipeline's server name.
    pub servers: BTreeMap<String, ServerReport>,
}

/// One server's observed behavior.
#[derive(Debug, Deserialize)]
pub struct ServerReport {
    /// Whether `/../` probes collapsed.
    #[serde(default)]
    pub is_normalize: bool,
    /// Whether percent-encoded probes arrived decoded.
    #[serde(default)]
    pub is_decode: bool,
    /// Capture statistics; audit only.
    #[serde(default)]
    pub statistic: Option<Statistic>,
    /// The per-probe observation buckets.
    #[serde(default)]
    pub transformation: TransformationReport,
}

/// Probe observation buckets, keyed by hex seed then request type.
#[derive(Debug, Default, Deserialize)]
pub struct TransformationReport {
    /// Probes with no outbound at all: the server rejected them.
    #[serde(default)]
    pub bad: BTreeMap<String, BTreeMap<String, BadProbe>>,
    /// Probes whose outbound differed from their inbound.
    #[serde(default)]
    pub inconsistency: BTreeMap<String, BTreeMap<String, InconsistencyProbe>>,
}

/// A rejected probe observation.
#[derive(Debug, Deserialize)]
pub struct BadProbe {
    /// Inbound URL as ASCII hex.
    pub inbound_url: String,
    /// Correlation id from the capture pipeline.
    #[serde(default)]
    pub x_request_id: Option<String>,
}

/// A rewritten probe observation.
#[derive(Debug, Deserialize)]
pub struct InconsistencyProbe {
    /// Inbound URL as ASCII hex.
    pub inbound_url: String,
    /// Outbound URL as ASCII hex.
    #[serde(default)]
    pub outbound_url: String,
    /// Correlation id from the capture pipeline.
    #[serde(default)]
    pub x_request_id: Option<String>,
}

/// Capture statistics block; carried for audit, never interpreted.
#[derive(Debug, Default, Deserialize)]
pub struct Statistic {
    /// Probes sent.
    #[serde(default)]
    pub total: u64,
    /// Probes answered unchanged.
    #[serde(default)]
    pub valid: u64,
    /// Probes rejected.
    #[serde(default)]
    pub bad: u64,
    /// Inconsistency counts and ratios.
    #[serde(default)]
    pub inconsistency: InconsistencyStat,
}

/// Inconsistency counters within [`Statistic`].
#[derive(Debug, Default, Deserialize)]
pub struct InconsistencyStat {
    /// Number of inconsistent probes.
    #[serde(default)]
    pub count: u64,
    /// Inconsistent / total.
    #[serde(default)]
    pub ratio: f64,
    /// Inconsistent / valid.
    #[serde(default)]
    pub ratio_to_valid: f64,
}

/// Errors from reading or interpreting a report.
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// The JSON did not match the report schema.
    #[error("malformed inconsistency report: {detail}")]
    Malformed {
        /// Parser message, including the offending location.
        detail: String,
    },
    /// A requested server has no entry in the report.
    #[error("server `{name}` is not present in the report")]
    UnknownServer {
        /// The missing name.
        name: String,
    },
}

/// Parse a report from JSON text.
pub fn parse_report(text: &str) -> Result<Report, ReportError> {
    serde_json::from_str(text).map_err(|e| ReportError::Malformed { detail: e.to_string() })
}

// ============================================================================
// Building servers
// ============================================================================

/// Build surrogate servers for `order` (one model per name, in order).
pub fn build_servers(report: &Report, order: &[String]) -> Result<Vec<Server>, ReportError> {
    let mut servers = Vec::with_capacity(order.len());
    for name in order {
        let sd = report
            .servers
            .get(name)
            .ok_or_else(|| ReportError::UnknownServer { name: name.clone() })?;
        let mut server = Server::new(name.clone());
        server.set_normalize(sd.is_normalize);
        server.set_decode(sd.is_decode);
        server.conditions = negative_conditions(name, &sd.transformation.bad);

        let (accepted, omitted) = classify_inconsistencies(name, &sd.transformation.inconsistency);
        server.inconsistencies = accepted;
        server.omitted = omitted;
        synthesize_transformations(&mut server);

        debug!(
            server = %name,
            transformations = server.transformations.len(),
            conditions = server.conditions.len(),
            omitted = server.omitted.len(),
            unprocessed = server.unprocessed.len(),
            "built surrogate server"
        );
        servers.push(server);
    }
    Ok(servers)
}

/// Build surrogate servers for every name in the report, in key order.
pub fn build_all_servers(report: &Report) -> Result<Vec<Server>, ReportError> {
    let order: Vec<String> = report.servers.keys().cloned().collect();
    build_servers(report, &order)
}

/// All ordered `depth`-permutations of `names`, in lexicographic index
/// order. Backs the one-artifact-per-chain build mode.
pub fn server_permutations(names: &[String], depth: usize) -> Vec<Vec<String>> {
    let mut out = Vec::new();
    let mut current = Vec::with_capacity(depth);
    let mut used = vec![false; names.len()];
    permute(names, depth, &mut current, &mut used, &mut out);
    out
}

fn permute(
    names: &[String],
    depth: usize,
    current: &mut Vec<String>,
    used: &mut Vec<bool>,
    out: &mut Vec<Vec<String>>,
) {
    if current.len() == depth {
        out.push(current.clone());
        return;
    }
    for i in 0..names.len() {
        if used[i] {
            continue;
        }
        used[i] = true;
        current.push(names[i].clone());
        permute(names, depth, current, used, out);
        current.pop();
        used[i] = false;
    }
}

// ------------------------------------------------------------------
// Step 2: negative conditions from the `bad` bucket
// ------------------------------------------------------------------

fn negative_conditions(
    server: &str,
    bad: &BTreeMap<String, BTreeMap<String, BadProbe>>,
) -> Vec<Condition> {
    let mut conds = Vec::new();
    for hex_seed in bad.keys() {
        let Some(ch) = seed_bytes(hex_seed) else {
            warn!(server, hex_seed, "ignoring undecodable bad-probe seed");
            continue;
        };
        if ch.is_empty() {
            continue;
        }
        if ch.as_bytes() == b"%" {
            debug!(server, "skipping '%' bad-probe seed (escape machinery)");
            continue;
        }
        conds.push(Condition::not_contains(ch));
    }
    conds
}

// ------------------------------------------------------------------
// Step 3: omitted vs accepted classification
// ------------------------------------------------------------------

fn classify_inconsistencies(
    server: &str,
    inconsistency: &BTreeMap<String, BTreeMap<String, InconsistencyProbe>>,
) -> (Vec<InconsistencyInfo>, Vec<InconsistencyInfo>) {
    let mut accepted: Vec<InconsistencyInfo> = Vec::new();
    let mut omitted: Vec<InconsistencyInfo> = Vec::new();

    for (hex_seed, probes) in inconsistency {
        let Some(char_value) = seed_bytes(hex_seed) else {
            warn!(server, hex_seed, "ignoring undecodable inconsistency seed");
            continue;
        };
        let encoded = char_value.percent_encoded();

        for (request_type, probe) in probes {
            let Ok(inbound) = RawStr::from_hex(&probe.inbound_url) else {
                warn!(server, hex_seed, request_type, "inbound url is not valid hex; skipping");
                continue;
            };
            let Ok(outbound) = RawStr::from_hex(&probe.outbound_url) else {
                warn!(server, hex_seed, request_type, "outbound url is not valid hex; skipping");
                continue;
            };

            // The observation is plain percent-encoding when substituting the
            // seed with its encoded form reproduces the outbound exactly.
            let is_standard_encoding = if char_value.is_empty() {
                inbound == outbound
            } else {
                replace_all(inbound.as_bytes(), char_value.as_bytes(), encoded.as_bytes())
                    == outbound.as_bytes().to_vec()
            };

            let entry = InconsistencyEntry {
                request_type: request_type.clone(),
                inbound,
                outbound,
                x_request_id: probe.x_request_id.clone(),
            };
            let bucket = if is_standard_encoding { &mut omitted } else { &mut accepted };
            push_entry(bucket, hex_seed, &char_value, entry);
        }
    }
    (accepted, omitted)
}

fn push_entry(
    bucket: &mut Vec<InconsistencyInfo>,
    hex_seed: &str,
    char_value: &RawStr,
    entry: InconsistencyEntry,
) {
    if let Some(info) = bucket.iter_mut().find(|i| i.hex_value == hex_seed) {
        info.entries.push(entry);
    } else {
        bucket.push(InconsistencyInfo {
            hex_value: hex_seed.to_string(),
            char_value: char_value.clone(),
            entries: vec![entry],
        });
    }
}

// ------------------------------------------------------------------
// Step 4: transformation synthesis by probe type
// ------------------------------------------------------------------

fn synthesize_transformations(server: &mut Server) {
    let infos = server.inconsistencies.clone();
    for info in &infos {
        let without_slash = info
            .entries
            .iter()
            .find(|e| e.request_type == REQ_COMPOSITE_MIDDLE_WITHOUT_SLASH);
        let middle = info.entries.iter().find(|e| e.request_type == REQ_COMPOSITE_MIDDLE);

        if let Some(entry) = without_slash {
            synthesize_without_slash(server, info, entry);
        } else if let Some(entry) = middle {
            synthesize_composite_middle(server, info, entry);
        } else if info
            .entries
            .iter()
            .any(|e| e.request_type != REQ_NORMALIZATION && e.request_type != REQ_DECODING_IN_RANGE)
        {
            // Normalization and decoding probes are already consumed by the
            // server flags; anything else here fits no synthesis rule.
            mark_unprocessed(server, info, info.entries.clone());
        }
    }
}

fn synthesize_without_slash(server: &mut Server, info: &InconsistencyInfo, entry: &InconsistencyEntry) {
    let probe = &info.char_value;
    if probe.is_empty() {
        mark_unprocessed(server, info, vec![entry.clone()]);
        return;
    }

    if entry.outbound.as_bytes() == WITHOUT_SLASH_TRUNCATED {
        // Everything from the probe char onward was dropped.
        server.transformations.push(Transformation::new(
            format!("truncate_at({probe})"),
            Rewrite::SubStringUntil { offset: 0, delimiter: probe.clone() },
            vec![Condition::contains(probe.clone())],
        ));
    } else if entry.outbound.as_bytes() == WITHOUT_SLASH_SEGMENT_DROPPED {
        // The probe char and its trailing segment vanished but the path
        // stayed rooted: the behavior forks on whether a slash follows the
        // delimiter, so emit both branches with complementary guards.
        let has_slash = Condition::has_slash_after(probe.clone(), false)
            .expect("probe char is non-empty");
        let no_slash = Condition::has_slash_after(probe.clone(), true)
            .expect("probe char is non-empty");
        server.transformations.push(Transformation::new(
            format!("strip_segment({probe})"),
            Rewrite::DelimiterSlashSplit { delimiter: probe.clone() },
            vec![Condition::contains(probe.clone()), has_slash],
        ));
        server.transformations.push(Transformation::new(
            format!("truncate_at({probe})"),
            Rewrite::SubStringUntil { offset: 0, delimiter: probe.clone() },
            vec![Condition::contains(probe.clone()), no_slash],
        ));
    } else {
        warn!(
            server = %server.name,
            probe = %probe,
            outbound = %entry.outbound,
            "without-slash probe outbound fits no synthesis rule"
        );
        mark_unprocessed(server, info, vec![entry.clone()]);
    }
}

fn synthesize_composite_middle(
    server: &mut Server,
    info: &InconsistencyInfo,
    entry: &InconsistencyEntry,
) {
    let (target, replacement) = trim_shared_framing(entry.inbound.as_bytes(), entry.outbound.as_bytes());
    // The probe's variable middle is one path segment between fixed framing;
    // a recovered target that is empty or crosses a segment boundary means
    // the framing did not survive, so no local replace rule explains the
    // observation.
    if target.is_empty() || replacement.is_empty() || target.contains_bytes(b"/") {
        warn!(
            server = %server.name,
            inbound = %entry.inbound,
            outbound = %entry.outbound,
            "composite-middle probe fits no synthesis rule"
        );
        mark_unprocessed(server, info, vec![entry.clone()]);
        return;
    }
    server.transformations.push(Transformation::new(
        format!("replace({target} -> {replacement})"),
        Rewrite::Replace { target: target.clone(), replacement },
        vec![Condition::contains(target)],
    ));
}

/// Trim the longest shared prefix, then the longest shared suffix, from an
/// inbound/outbound pair, recovering the rewritten middles.
fn trim_shared_framing(inbound: &[u8], outbound: &[u8]) -> (RawStr, RawStr) {
    let mut lcp = 0usize;
    while lcp < inbound.len() && lcp < outbound.len() && inbound[lcp] == outbound[lcp] {
        lcp += 1;
    }
    let a = &inbound[lcp..];
    let b = &outbound[lcp..];
    let mut lcs = 0usize;
    while lcs < a.len() && lcs < b.len() && a[a.len() - 1 - lcs] == b[b.len() - 1 - lcs] {
        lcs += 1;
    }
    (RawStr::from_bytes(&a[..a.len() - lcs]), RawStr::from_bytes(&b[..b.len() - lcs]))
}

fn mark_unprocessed(server: &mut Server, info: &InconsistencyInfo, entries: Vec<InconsistencyEntry>) {
    server.unprocessed.push(InconsistencyInfo {
        hex_value: info.hex_value.clone(),
        char_value: info.char_value.clone(),
        entries,
    });
}

/// Total unprocessed observations across a server list; reported once at the
/// end of a build.
pub fn unprocessed_count(servers: &[Server]) -> usize {
    servers.iter().map(|s| s.unprocessed.len()).sum()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn report_json(outbound_hex: &str) -> String {
        format!(
            r#"{{
              "app": {{
                "is_normalize": false,
                "is_decode": false,
                "statistic": {{"total": 256, "valid": 200, "bad": 2,
                               "inconsistency": {{"count": 1, "ratio": 0.003, "ratio_to_valid": 0.005}}}},
                "transformation": {{
                  "bad": {{"00": {{"transformation_composite_middle": {{"inbound_url": "2f00", "x_request_id": "r1"}}}}}},
                  "inconsistency": {{
                    "20": {{"transformation_composite_middle":
                            {{"inbound_url": "2f20", "outbound_url": "{outbound_hex}", "x_request_id": "r2"}}}}
                  }}
                }}
              }}
            }}"#
        )
    }

    #[test]
    fn space_encoded_outbound_is_omitted() {
        // outbound "/%20" — exactly the percent-encoded inbound.
        let report = parse_report(&report_json("2f253230")).unwrap();
        let servers = build_all_servers(&report).unwrap();
        let s = &servers[0];
        assert_eq!(s.omitted.len(), 1);
        assert!(s.inconsistencies.is_empty());
        assert!(s.transformations.is_empty());
        assert_eq!(s.omitted[0].hex_value, "20");
    }

    #[test]
    fn rewritten_outbound_is_accepted_and_synthesizes_replace() {
        // outbound "/x" — a genuine rewrite of the space.
        let report = parse_report(&report_json("2f78")).unwrap();
        let servers = build_all_servers(&report).unwrap();
        let s = &servers[0];
        assert_eq!(s.inconsistencies.len(), 1);
        assert!(s.omitted.is_empty());
        assert_eq!(s.transformations.len(), 1);
        let t = &s.transformations[0];
        assert_eq!(
            t.rewrite,
            Rewrite::Replace { target: RawStr::from(" "), replacement: RawStr::from("x") }
        );
        assert_eq!(t.guards, vec![Condition::contains(" ")]);
    }

    #[test]
    fn classification_is_stable_across_rebuilds() {
        let report = parse_report(&report_json("2f253230")).unwrap();
        let a = build_all_servers(&report).unwrap();
        let b = build_all_servers(&report).unwrap();
        assert_eq!(a[0].omitted, b[0].omitted);
        assert_eq!(a[0].inconsistencies, b[0].inconsistencies);
    }

    #[test]
    fn bad_bucket_becomes_negative_conditions() {
        let report = parse_report(&report_json("2f78")).unwrap();
        let servers = build_all_servers(&report).unwrap();
        assert_eq!(
            servers[0].conditions,
            vec![Condition::not_contains(RawStr::from(&b"\x00"[..]))]
        );
    }

    #[test]
    fn percent_seed_never_becomes_a_condition() {
        let json = r#"{"app": {"transformation": {"bad":
            {"25": {"transformation_composite_middle": {"inbound_url": "2f25"}}}}}}"#;
        let report = parse_report(json).unwrap();
        let servers = build_all_servers(&report).unwrap();
        assert!(servers[0].conditions.is_empty());
    }

    #[test]
    fn without_slash_truncation_probe() {
        // inbound /tmp1/tmp2;tmp3/tmp4, outbound /tmp1/tmp2
        let json = r#"{"proxy": {"transformation": {"inconsistency":
            {"3b": {"transformation_composite_middle_without_slash":
                {"inbound_url": "2f746d70312f746d70323b746d70332f746d7034",
                 "outbound_url": "2f746d70312f746d7032"}}}}}}"#;
        let report = parse_report(json).unwrap();
        let servers = build_all_servers(&report).unwrap();
        let s = &servers[0];
        assert_eq!(s.transformations.len(), 1);
        assert_eq!(
            s.transformations[0].rewrite,
            Rewrite::SubStringUntil { offset: 0, delimiter: RawStr::from(";") }
        );
    }

    #[test]
    fn without_slash_segment_drop_probe_emits_both_branches() {
        // inbound /tmp1/tmp2;tmp3/tmp4, outbound /tmp1/tmp2/tmp4
        let json = r#"{"proxy": {"transformation": {"inconsistency":
            {"3b": {"transformation_composite_middle_without_slash":
                {"inbound_url": "2f746d70312f746d70323b746d70332f746d7034",
                 "outbound_url": "2f746d70312f746d70322f746d7034"}}}}}}"#;
        let report = parse_report(json).unwrap();
        let servers = build_all_servers(&report).unwrap();
        let s = &servers[0];
        assert_eq!(s.transformations.len(), 2);
        assert_eq!(
            s.transformations[0].rewrite,
            Rewrite::DelimiterSlashSplit { delimiter: RawStr::from(";") }
        );
        assert_eq!(
            s.transformations[1].rewrite,
            Rewrite::SubStringUntil { offset: 0, delimiter: RawStr::from(";") }
        );
        // Complementary slash guards keep the two branches disjoint.
        assert!(s.transformations[0].guards.iter().any(|c| !c.negated
            && matches!(c.kind, crate::condition::ConditionKind::HasSlashAfter)));
        assert!(s.transformations[1].guards.iter().any(|c| c.negated
            && matches!(c.kind, crate::condition::ConditionKind::HasSlashAfter)));
    }

    #[test]
    fn unframed_composite_middle_goes_unprocessed() {
        // inbound /tmp1/A/tmp2, outbound /xyz: the framing did not survive.
        let json = r#"{"app": {"transformation": {"inconsistency":
            {"41": {"transformation_composite_middle":
                {"inbound_url": "2f746d70312f412f746d7032",
                 "outbound_url": "2f78797a"}}}}}}"#;
        let report = parse_report(json).unwrap();
        let servers = build_all_servers(&report).unwrap();
        let s = &servers[0];
        assert!(s.transformations.is_empty());
        assert_eq!(s.unprocessed.len(), 1);
        assert_eq!(unprocessed_count(&servers), 1);
    }

    #[test]
    fn framed_composite_middle_recovers_the_middle_pair() {
        // inbound /tmp1/A/tmp2, outbound /tmp1/B/tmp2 => Replace(A, B)
        let json = r#"{"app": {"transformation": {"inconsistency":
            {"41": {"transformation_composite_middle":
                {"inbound_url": "2f746d70312f412f746d7032",
                 "outbound_url": "2f746d70312f422f746d7032"}}}}}}"#;
        let report = parse_report(json).unwrap();
        let servers = build_all_servers(&report).unwrap();
        let s = &servers[0];
        assert_eq!(s.transformations.len(), 1);
        assert_eq!(
            s.transformations[0].rewrite,
            Rewrite::Replace { target: RawStr::from("A"), replacement: RawStr::from("B") }
        );
    }

    #[test]
    fn unknown_server_is_an_error_with_the_name() {
        let report = parse_report(r#"{"app": {}}"#).unwrap();
        let err = build_servers(&report, &["nginx".to_string()]).unwrap_err();
        assert!(matches!(err, ReportError::UnknownServer { ref name } if name == "nginx"));
    }

    #[test]
    fn malformed_json_is_fatal() {
        assert!(matches!(parse_report("{"), Err(ReportError::Malformed { .. })));
    }

    #[test]
    fn permutations_cover_depth_orderings() {
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let perms = server_permutations(&names, 2);
        assert_eq!(perms.len(), 6);
        assert_eq!(perms[0], vec!["a".to_string(), "b".to_string()]);
        assert_eq!(perms[5], vec!["c".to_string(), "b".to_string()]);
    }

    #[test]
    fn report_flags_drive_server_flags() {
        let json = r#"{"proxy": {"is_normalize": true, "is_decode": true, "transformation": {}}}"#;
        let report = parse_report(json).unwrap();
        let servers = build_all_servers(&report).unwrap();
        assert!(servers[0].is_normalize());
        assert!(servers[0].is_decode());
        assert_eq!(servers[0].normalizations().len(), 1);
    }
}
