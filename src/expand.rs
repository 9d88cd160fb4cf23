//! Cross-hop normalization expansion
//!
//! When a chain choice puts the normalize flag on hop `i`, the plain `/../`
//! rewrite is rarely the whole story: what the normalizing server actually
//! sees depends on what happened to the bytes on the way in. This module
//! computes the *effective* list of normalization alternatives for the
//! flagged hop from three sources:
//!
//! 1. The hop's own decode-aware expansion (encoded `/` and `.` spellings),
//!    also applied when the *previous* hop decodes — an encoded dot segment
//!    reaches the normalizer through a decoding predecessor just as it would
//!    through the hop's own decoder.
//! 2. Replace rewrites the choice applies at the flagged hop: the attacker
//!    can spell a normalization string pre-rewrite, so every partial
//!    back-substitution becomes a variant.
//! 3. The previous hop's `(normalize, decode)` pair:
//!
//!    | prev normalize | prev decode | effect |
//!    |----------------|-------------|--------|
//!    | false | false | no change                                        |
//!    | false | true  | percent-of-percent variants added (`%` → `%25`)  |
//!    | true  | false | subsumption prune against the prior hop's set    |
//!    | true  | true  | add variants, then prune                         |
//!
//! The percent-of-percent rule is what keeps an attacker's escape of a
//! normalization string alive across a decoding predecessor; the prune drops
//! variants a prior hop already neutralizes, so the solver is never asked to
//! reconstruct a rewrite that cannot survive the trip.
//!
//! Each surviving variant is one alternative normalization choice; the chain
//! compiler re-enters once per alternative.

use std::collections::HashSet;

use crate::encoding::{replace_all, RawStr};
use crate::enumerate::ChainChoice;
use crate::server::Server;
use crate::transform::{base_normalization, Rewrite, Transformation};

/// Effective normalization alternatives for the hop `choice` flags.
///
/// Returns an empty list when the choice normalizes nowhere (no alternative
/// queries are needed) or when every variant is pruned by an upstream hop.
pub fn effective_normalizations(servers: &[Server], choice: &ChainChoice) -> Vec<Transformation> {
    let Some(idx) = choice.normalize_index() else {
        return Vec::new();
    };
    let server = &servers[idx];
    let prev = idx.checked_sub(1).map(|i| &servers[i]);
    let assume_decode = prev.map(|p| p.is_decode()).unwrap_or(false);

    let mut current = server.expand_with_decode(&base_normalization(), assume_decode);

    // Replace rewrites firing at this hop let the attacker pre-spell the
    // normalization string; fold their back-substituted variants in.
    for t in choice.selected[idx].iter().chain(&server.essential_transformations) {
        if let Rewrite::Replace { target, replacement } = &t.rewrite {
            current = merge_unique(current, server.expand_with_replace(target, replacement));
        }
    }

    let Some(prev) = prev else {
        return current;
    };
    if prev.is_decode() {
        current = add_percent_of_percent(current);
    }
    if prev.is_normalize() {
        let prev_expanded = prev.expand_with_decode(&base_normalization(), false);
        current = prune_subsumed(current, &prev_expanded);
    }
    current
}

/// Append `extra` to `base`, keeping the first occurrence of each
/// normalization string.
fn merge_unique(base: Vec<Transformation>, extra: Vec<Transformation>) -> Vec<Transformation> {
    let mut seen: HashSet<RawStr> =
        base.iter().filter_map(|t| t.norm_str().cloned()).collect();
    let mut out = base;
    for t in extra {
        let Some(norm) = t.norm_str() else { continue };
        if seen.insert(norm.clone()) {
            out.push(t);
        }
    }
    out
}

/// Add a `%` → `%25` variant for every expansion string containing a `%`.
///
/// Order is preserved: originals first, pre-encoded variants after, each
/// deduplicated against everything already present.
fn add_percent_of_percent(expansion: Vec<Transformation>) -> Vec<Transformation> {
    let mut escaped = Vec::new();
    for t in &expansion {
        let Some(norm) = t.norm_str() else { continue };
        if norm.contains_bytes(b"%") {
            let twin = RawStr::from(replace_all(norm.as_bytes(), b"%", b"%25"));
            escaped.push(Transformation::normalization(twin));
        }
    }
    merge_unique(expansion, escaped)
}

/// Drop every variant equal to or containing a prior-hop normalization
/// string: the earlier hop rewrites it away before this hop ever runs.
fn prune_subsumed(
    current: Vec<Transformation>,
    prev_expanded: &[Transformation],
) -> Vec<Transformation> {
    let prev_strings: Vec<&RawStr> =
        prev_expanded.iter().filter_map(|t| t.norm_str()).collect();
    current
        .into_iter()
        .filter(|t| {
            let Some(norm) = t.norm_str() else { return false };
            !prev_strings.iter().any(|p| norm.contains_bytes(p.as_bytes()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;

    fn norm_strings(list: &[Transformation]) -> Vec<String> {
        list.iter()
            .filter_map(|t| t.norm_str().map(|n| n.to_string()))
            .collect()
    }

    fn chain(prev_normalize: bool, prev_decode: bool, cur_decode: bool) -> Vec<Server> {
        let mut s1 = Server::new("front");
        s1.set_normalize(prev_normalize);
        s1.set_decode(prev_decode);
        let mut s2 = Server::new("back");
        s2.set_normalize(true);
        s2.set_decode(cur_decode);
        vec![s1, s2]
    }

    fn norm_at(servers: &[Server], idx: usize) -> ChainChoice {
        let mut normalize = vec![false; servers.len()];
        normalize[idx] = true;
        ChainChoice { selected: vec![Vec::new(); servers.len()], normalize }
    }

    #[test]
    fn no_normalizing_hop_means_no_alternatives() {
        let servers = chain(false, false, false);
        let choice =
            ChainChoice { selected: vec![vec![], vec![]], normalize: vec![false, false] };
        assert!(effective_normalizations(&servers, &choice).is_empty());
    }

    #[test]
    fn plain_predecessor_leaves_the_base_expansion() {
        let servers = chain(false, false, false);
        let strings = norm_strings(&effective_normalizations(&servers, &norm_at(&servers, 1)));
        assert_eq!(strings, vec!["/../".to_string()]);
    }

    #[test]
    fn decoding_predecessor_brings_encoded_variants() {
        // The normalizer itself does not decode, but its predecessor does:
        // encoded-dot spellings still reach it, so they must be in the set.
        let servers = chain(false, true, false);
        let strings = norm_strings(&effective_normalizations(&servers, &norm_at(&servers, 1)));
        assert!(strings.contains(&"/../".to_string()));
        assert!(strings.contains(&"/%2E%2E/".to_string()));
        assert!(strings.contains(&"%2F..%2F".to_string()));
    }

    #[test]
    fn decoding_predecessor_escapes_percents() {
        let servers = chain(false, true, false);
        let strings = norm_strings(&effective_normalizations(&servers, &norm_at(&servers, 1)));
        // Every %-carrying variant gains a pre-encoded %25 twin.
        assert!(strings.contains(&"/%2E%2E/".to_string()));
        assert!(strings.contains(&"/%252E%252E/".to_string()));
    }

    #[test]
    fn selected_replace_back_substitutes_variants() {
        let servers = chain(false, false, false);
        let mut choice = norm_at(&servers, 1);
        // The normalizing hop rewrites ';' -> '/', so "/../" may arrive
        // spelled with semicolons in place of slashes.
        choice.selected[1].push(Transformation::new(
            "replace(; -> /)",
            Rewrite::Replace { target: RawStr::from(";"), replacement: RawStr::from("/") },
            vec![Condition::contains(";")],
        ));
        let strings = norm_strings(&effective_normalizations(&servers, &choice));
        assert!(strings.contains(&"/../".to_string()));
        assert!(strings.contains(&";../".to_string()));
        assert!(strings.contains(&";..;".to_string()));
    }

    #[test]
    fn normalizing_predecessor_prunes_shared_strings() {
        let servers = chain(true, false, false);
        let strings = norm_strings(&effective_normalizations(&servers, &norm_at(&servers, 1)));
        // The predecessor already collapses /../; nothing survives the prune
        // (its expansion equals ours exactly).
        assert!(!strings.contains(&"/../".to_string()));
        assert!(strings.is_empty());
    }

    #[test]
    fn normalizing_and_decoding_predecessor_adds_then_prunes() {
        let servers = chain(true, true, false);
        let strings = norm_strings(&effective_normalizations(&servers, &norm_at(&servers, 1)));
        // A decoding+normalizing predecessor subsumes both the plain string
        // and the singly-encoded spellings; only the %25-escaped twins make
        // it through, because the predecessor's single decode pass cannot
        // uncover them.
        assert!(!strings.contains(&"/../".to_string()));
        assert!(!strings.contains(&"/%2E%2E/".to_string()));
        assert!(strings.contains(&"/%252E%252E/".to_string()));
        assert!(!strings.is_empty());
    }

    #[test]
    fn first_hop_normalizer_uses_only_its_own_expansion() {
        let mut s1 = Server::new("front");
        s1.set_normalize(true);
        s1.set_decode(true);
        let servers = vec![s1, Server::new("back")];
        let strings = norm_strings(&effective_normalizations(&servers, &norm_at(&servers, 0)));
        assert!(strings.contains(&"/../".to_string()));
        assert!(strings.contains(&"/%2E%2E/".to_string()));
    }
}
