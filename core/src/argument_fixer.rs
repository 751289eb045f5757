//! Repairs tool-call arguments whose parameter names the LLM got close
//! to, but not exactly, right.
//!
//! Grounded on `examples/original_source/core/tool_hash.py`. That module
//! leans on Python's `difflib.SequenceMatcher.ratio()` — no crate in this
//! workspace's dependency graph implements Ratcliff/Obershelp gestalt
//! pattern matching (checked for `strsim`, `fuzzy`, `difflib` across the
//! retrieved corpus's `Cargo.toml` files; none is present), so the ratio
//! is reimplemented here directly from the CPython algorithm rather than
//! approximated with a different metric like Levenshtein, which would
//! change which renames are considered "close enough".

use std::collections::HashMap;

use serde_json::Map;
use serde_json::Value;

pub const SIMILARITY_THRESHOLD: f64 = 0.2;

/// `difflib.SequenceMatcher(None, a, b).ratio()`, i.e. `2*M / T` where `M`
/// is the total length of the matching blocks found by repeatedly
/// extracting the longest common contiguous run, and `T = len(a)+len(b)`.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matches = matching_block_total(&a, 0, a.len(), &b, 0, b.len());
    (2 * matches) as f64 / total as f64
}

fn matching_block_total(a: &[char], alo: usize, ahi: usize, b: &[char], blo: usize, bhi: usize) -> usize {
    let (i, j, size) = find_longest_match(a, alo, ahi, b, blo, bhi);
    if size == 0 {
        return 0;
    }
    let mut total = size;
    if alo < i && blo < j {
        total += matching_block_total(a, alo, i, b, blo, j);
    }
    if i + size < ahi && j + size < bhi {
        total += matching_block_total(a, i + size, ahi, b, j + size, bhi);
    }
    total
}

/// Port of `SequenceMatcher.find_longest_match` without junk/autojunk
/// handling — parameter names are short enough that this never matters.
fn find_longest_match(
    a: &[char],
    alo: usize,
    ahi: usize,
    b: &[char],
    blo: usize,
    bhi: usize,
) -> (usize, usize, usize) {
    let mut b2j: HashMap<char, Vec<usize>> = HashMap::new();
    for (idx, ch) in b.iter().enumerate().take(bhi).skip(blo) {
        b2j.entry(*ch).or_default().push(idx);
    }

    let (mut best_i, mut best_j, mut best_size) = (alo, blo, 0usize);
    let mut j2len: HashMap<usize, usize> = HashMap::new();

    for i in alo..ahi {
        let mut new_j2len: HashMap<usize, usize> = HashMap::new();
        if let Some(js) = b2j.get(&a[i]) {
            for &j in js {
                let k = j2len.get(&j.wrapping_sub(1)).copied().unwrap_or(0) + 1;
                new_j2len.insert(j, k);
                if k > best_size {
                    best_i = i + 1 - k;
                    best_j = j + 1 - k;
                    best_size = k;
                }
            }
        }
        j2len = new_j2len;
    }

    (best_i, best_j, best_size)
}

/// Outcome of attempting to repair a tool call's arguments.
#[derive(Debug, Clone)]
pub struct FixResult {
    pub arguments: Value,
    pub renamed: Vec<(String, String)>,
    pub dropped: Vec<String>,
}

pub struct ArgumentFixer;

impl ArgumentFixer {
    /// Attempts to align `arguments`' keys with `declared_params`
    /// (ordinarily a tool's `inputSchema.properties` keys). Three stages,
    /// matching `ToolArgumentFixer.fix`:
    ///
    /// 1. If every required param is already present, return unchanged.
    /// 2. If there is exactly one declared param and exactly one
    ///    supplied argument, map it over regardless of name similarity.
    /// 3. Otherwise greedily pair supplied keys to declared params by
    ///    descending similarity, keeping only pairs at or above
    ///    [`SIMILARITY_THRESHOLD`], exact-name matches always winning
    ///    their pairing first.
    pub fn fix(arguments: &Value, declared_params: &[String], required: &[String]) -> FixResult {
        let Value::Object(supplied) = arguments else {
            return FixResult {
                arguments: arguments.clone(),
                renamed: vec![],
                dropped: vec![],
            };
        };

        if required.iter().all(|r| supplied.contains_key(r)) {
            return FixResult {
                arguments: arguments.clone(),
                renamed: vec![],
                dropped: vec![],
            };
        }

        if declared_params.len() == 1 && supplied.len() == 1 {
            let declared = declared_params[0].clone();
            let (supplied_key, value) = supplied.iter().next().unwrap();
            let mut out = Map::new();
            out.insert(declared.clone(), value.clone());
            return FixResult {
                arguments: Value::Object(out),
                renamed: if supplied_key != &declared {
                    vec![(supplied_key.clone(), declared)]
                } else {
                    vec![]
                },
                dropped: vec![],
            };
        }

        Self::fuzzy_match(supplied, declared_params)
    }

    fn fuzzy_match(supplied: &Map<String, Value>, declared_params: &[String]) -> FixResult {
        let mut remaining_declared: Vec<String> = declared_params.to_vec();
        let mut out = Map::new();
        let mut renamed = Vec::new();
        let mut dropped = Vec::new();

        // Exact matches win first and are removed from both pools.
        let mut remaining_supplied: Vec<(String, Value)> = Vec::new();
        for (key, value) in supplied {
            if let Some(pos) = remaining_declared.iter().position(|d| d == key) {
                remaining_declared.remove(pos);
                out.insert(key.clone(), value.clone());
            } else {
                remaining_supplied.push((key.clone(), value.clone()));
            }
        }

        // Score every remaining (supplied, declared) pair, then assign
        // greedily from highest similarity down.
        let mut candidates: Vec<(f64, String, String)> = Vec::new();
        for (supplied_key, _) in &remaining_supplied {
            for declared_key in &remaining_declared {
                let score = similarity_ratio(supplied_key, declared_key);
                candidates.push((score, supplied_key.clone(), declared_key.clone()));
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut used_supplied = std::collections::HashSet::new();
        let mut used_declared = std::collections::HashSet::new();
        for (score, supplied_key, declared_key) in candidates {
            if score < SIMILARITY_THRESHOLD {
                break;
            }
            if used_supplied.contains(&supplied_key) || used_declared.contains(&declared_key) {
                continue;
            }
            let value = remaining_supplied
                .iter()
                .find(|(k, _)| k == &supplied_key)
                .map(|(_, v)| v.clone())
                .unwrap();
            out.insert(declared_key.clone(), value);
            if supplied_key != declared_key {
                renamed.push((supplied_key.clone(), declared_key.clone()));
            }
            used_supplied.insert(supplied_key);
            used_declared.insert(declared_key);
        }

        for (key, _) in &remaining_supplied {
            if !used_supplied.contains(key) {
                dropped.push(key.clone());
            }
        }

        FixResult {
            arguments: Value::Object(out),
            renamed,
            dropped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_of_identical_strings_is_one() {
        assert_eq!(similarity_ratio("query", "query"), 1.0);
    }

    #[test]
    fn ratio_of_completely_different_strings_is_low() {
        assert!(similarity_ratio("query", "zzzzz") < 0.2);
    }

    #[test]
    fn ratio_matches_known_difflib_value_for_close_rename() {
        // difflib.SequenceMatcher(None, "search_query", "query").ratio() == 0.5
        let ratio = similarity_ratio("search_query", "query");
        assert!((ratio - 0.5).abs() < 1e-9);
    }

    #[test]
    fn fix_leaves_already_correct_arguments_untouched() {
        let args = serde_json::json!({"query": "rust"});
        let result = ArgumentFixer::fix(&args, &["query".to_string()], &["query".to_string()]);
        assert_eq!(result.arguments, args);
        assert!(result.renamed.is_empty());
    }

    #[test]
    fn fix_maps_singleton_mismatch_regardless_of_name() {
        let args = serde_json::json!({"input": "rust"});
        let result = ArgumentFixer::fix(&args, &["query".to_string()], &["query".to_string()]);
        assert_eq!(result.arguments, serde_json::json!({"query": "rust"}));
        assert_eq!(result.renamed, vec![("input".to_string(), "query".to_string())]);
    }

    #[test]
    fn fix_fuzzy_matches_close_names_across_multiple_params() {
        let args = serde_json::json!({"search_query": "rust", "max_result": 5});
        let declared = vec!["query".to_string(), "max_results".to_string()];
        let result = ArgumentFixer::fix(&args, &declared, &declared);
        assert_eq!(result.arguments["query"], serde_json::json!("rust"));
        assert_eq!(result.arguments["max_results"], serde_json::json!(5));
    }

    #[test]
    fn fix_drops_supplied_keys_with_no_plausible_match() {
        let args = serde_json::json!({"query": "rust", "completely_unrelated_garbage": true});
        let declared = vec!["query".to_string()];
        let result = ArgumentFixer::fix(&args, &declared, &declared);
        assert_eq!(result.dropped, vec!["completely_unrelated_garbage".to_string()]);
    }
}
