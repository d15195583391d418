//! Root-cause clustering of the current run's failures.
//!
//! Categorisation is table-driven: [`TAXONOMY`] is scanned in order and the
//! first category with a keyword matching the signature wins. Single-word
//! keywords match whole tokens (camelCase split, optional plural `s`), so
//! `Traceback` is not a race and `statement` is not state. Multi-word keywords
//! match as lowercase substrings. Stack frame lines are ignored.
//! Recommendations are a separate lookup table.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::analysis::model::{FailureCategory, FailureCluster, Severity, TestExecution, TestKey};

/// Keyword sets per category, in match precedence order.
pub const TAXONOMY: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::DatabaseConnectivity,
        &["database", "connection", "pool", "timeout", "sql", "jdbc"],
    ),
    (
        FailureCategory::Network,
        &["http", "socket", "unreachable", "network", "dns"],
    ),
    (
        FailureCategory::Timing,
        &["async", "thread", "wait", "race", "sleep", "timing"],
    ),
    (
        FailureCategory::Resource,
        &["memory", "disk", "cpu", "quota", "no space"],
    ),
    (
        FailureCategory::Auth,
        &["token", "credential", "forbidden", "unauthorized", "permission", "401", "403"],
    ),
    (
        FailureCategory::DataState,
        &["null", "missing", "invalid", "state", "not found"],
    ),
    (
        FailureCategory::EnvironmentConfig,
        &["env var", "environment variable", "property", "config", "setting"],
    ),
];

/// One actionable hint per category.
pub const RECOMMENDATIONS: &[(FailureCategory, &str)] = &[
    (
        FailureCategory::DatabaseConnectivity,
        "Database: check connection pool settings, database server health, and connectivity",
    ),
    (
        FailureCategory::Network,
        "Network: verify API endpoints and network reachability, review timeout settings",
    ),
    (
        FailureCategory::Timing,
        "Timing: replace sleeps with explicit waits, review async operations for races",
    ),
    (
        FailureCategory::Resource,
        "Resources: monitor memory and CPU usage, check disk space and resource limits",
    ),
    (
        FailureCategory::Auth,
        "Auth: verify credentials and permissions, check token expiration",
    ),
    (
        FailureCategory::DataState,
        "Data: check test data setup and isolation, review null handling",
    ),
    (
        FailureCategory::EnvironmentConfig,
        "Config: review environment variables, configuration files, and settings",
    ),
];

const UNKNOWN_RECOMMENDATION: &str = "Unknown: manual investigation required";

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "was", "with", "have", "this", "will", "from",
    "been", "that", "which", "their", "were", "there", "would", "could", "after", "when", "into",
    "than", "then", "expected", "actual", "got",
];

/// Category of a failure signature.
pub fn categorize(signature: &str) -> FailureCategory {
    let text = strip_stack_frames(signature);
    let lower = text.to_lowercase();
    let tokens = tokens(&text);
    let matches = |k: &&str| {
        if k.contains(' ') {
            lower.contains(*k)
        } else {
            tokens
                .iter()
                .any(|t| t == k || (t.len() == k.len() + 1 && t.starts_with(*k) && t.ends_with('s')))
        }
    };
    TAXONOMY
        .iter()
        .find(|(_, keywords)| keywords.iter().any(&matches))
        .map(|(category, _)| *category)
        .unwrap_or(FailureCategory::Unknown)
}

/// Drop JVM/.NET `at pkg.Class.method(File.java:10)` and Python
/// `File "x.py", line 3` frames, keeping the message lines.
fn strip_stack_frames(signature: &str) -> String {
    signature
        .lines()
        .filter(|line| {
            let line = line.trim_start();
            !((line.starts_with("at ") && line.contains('(')) || line.starts_with("File \""))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lowercase word tokens, split on punctuation, camelCase humps, acronym
/// ends (`SQLTimeout` -> `sql`, `timeout`) and letter/digit changes.
fn tokens(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    for run in text.split(|c: char| !c.is_alphanumeric()).filter(|r| !r.is_empty()) {
        let chars: Vec<char> = run.chars().collect();
        let mut start = 0;
        for i in 1..chars.len() {
            let (prev, cur) = (chars[i - 1], chars[i]);
            let next_lower = chars.get(i + 1).is_some_and(|c| c.is_lowercase());
            let boundary = (prev.is_lowercase() && cur.is_uppercase())
                || (prev.is_uppercase() && cur.is_uppercase() && next_lower)
                || prev.is_alphabetic() != cur.is_alphabetic();
            if boundary {
                out.push(chars[start..i].iter().collect::<String>().to_lowercase());
                start = i;
            }
        }
        out.push(chars[start..].iter().collect::<String>().to_lowercase());
    }
    out
}

pub fn recommendation_for(category: FailureCategory) -> &'static str {
    RECOMMENDATIONS
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, text)| *text)
        .unwrap_or(UNKNOWN_RECOMMENDATION)
}

/// Severity by spread (distinct tests) and volume (failing executions).
pub fn severity(tests_affected: usize, failure_count: u32) -> Severity {
    if tests_affected >= 5 && failure_count >= 10 {
        Severity::Critical
    } else if tests_affected >= 3 && failure_count >= 5 {
        Severity::High
    } else if tests_affected >= 2 || failure_count >= 3 {
        Severity::Medium
    } else {
        Severity::Low
    }
}

/// Cluster category of every test with a signed failure in `executions`.
///
/// A test belongs to exactly one category per run: the highest-precedence
/// category any of its failures matched.
pub fn assign_categories(executions: &[TestExecution]) -> BTreeMap<TestKey, FailureCategory> {
    let mut assigned: BTreeMap<TestKey, FailureCategory> = BTreeMap::new();
    for e in executions {
        if let Some(text) = e.failure_text() {
            let category = categorize(text);
            assigned
                .entry(e.test_key())
                .and_modify(|c| *c = (*c).min(category))
                .or_insert(category);
        }
    }
    assigned
}

/// Group the failing executions of one run into clusters, most severe first.
///
/// Only FAIL/ERROR executions with a non-blank signature take part, and all
/// of a test's failures count toward its assigned category.
pub fn cluster_failures(executions: &[TestExecution]) -> Vec<FailureCluster> {
    let assigned = assign_categories(executions);

    let mut groups: BTreeMap<FailureCategory, Vec<(&TestExecution, &str)>> = BTreeMap::new();
    for e in executions {
        let Some(text) = e.failure_text() else {
            continue;
        };
        if let Some(category) = assigned.get(&e.test_key()) {
            groups.entry(*category).or_default().push((e, text));
        }
    }

    let mut clusters: Vec<FailureCluster> = groups
        .into_iter()
        .map(|(category, members)| {
            let tests_affected: BTreeSet<String> =
                members.iter().map(|(e, _)| e.full_name.clone()).collect();
            let failure_count = members.len() as u32;
            let signatures: Vec<&str> = members.iter().map(|(_, text)| *text).collect();
            FailureCluster {
                signature_category: category,
                severity: severity(tests_affected.len(), failure_count),
                tests_affected,
                failure_count,
                recommendation: recommendation_for(category).to_string(),
                common_keywords: common_keywords(&signatures, 5),
                exception_pattern: exception_pattern(&signatures),
            }
        })
        .collect();

    rank_clusters(&mut clusters);
    clusters
}

/// Severity descending, then failure count descending, then taxonomy order.
pub fn rank_clusters(clusters: &mut [FailureCluster]) {
    clusters.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then(b.failure_count.cmp(&a.failure_count))
            .then(a.signature_category.cmp(&b.signature_category))
    });
}

fn words(text: &str) -> impl Iterator<Item = &str> {
    text.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|w| w.len() >= 3 && w.starts_with(|c: char| c.is_ascii_alphabetic()))
}

/// Most frequent non-stopword tokens, ties broken alphabetically.
pub fn common_keywords(signatures: &[&str], top: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for sig in signatures {
        for word in words(sig) {
            let word = word.to_lowercase();
            if STOPWORDS.contains(&word.as_str()) {
                continue;
            }
            *counts.entry(word).or_default() += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.into_iter().take(top).map(|(w, _)| w).collect()
}

/// Most frequent `FooException` / `FooError` class name.
pub fn exception_pattern(signatures: &[&str]) -> Option<String> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for sig in signatures {
        for word in words(sig) {
            let is_class = word.starts_with(|c: char| c.is_ascii_uppercase())
                && (word.ends_with("Exception") || word.ends_with("Error"));
            if is_class {
                *counts.entry(word).or_default() += 1;
            }
        }
    }
    // BTreeMap iteration is alphabetical, so max_by_key keeps the last max;
    // reverse to prefer the alphabetically first on ties.
    counts
        .into_iter()
        .rev()
        .max_by_key(|(_, n)| *n)
        .map(|(w, _)| w.to_string())
}
