//! Optional human-readable failure summaries.
//!
//! The pipeline only sees the [`Suggester`] trait. [`NoopSuggester`] is the
//! default; [`OpenAiSuggester`] calls a chat-completions endpoint when an API
//! key is configured. Every error here is logged and skipped by the caller.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::analysis::model::{TestExecution, TestReport};
use crate::analysis::AnalysisError;
use crate::config::EnrichmentConfig;

/// Longest failure excerpt sent to a suggester.
const MAX_EXCERPT_CHARS: usize = 1000;

/// Capability producing a one-line root-cause hypothesis for failure text.
#[async_trait]
pub trait Suggester: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the backend is configured at all. Unavailable suggesters are
    /// never called.
    fn is_available(&self) -> bool {
        true
    }

    async fn suggest(&self, failure_text: &str) -> Result<String, AnalysisError>;
}

/// Always unavailable. Default when no enrichment backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSuggester;

#[async_trait]
impl Suggester for NoopSuggester {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn suggest(&self, _failure_text: &str) -> Result<String, AnalysisError> {
        Err(AnalysisError::EnrichmentUnavailable(
            "no suggester configured".to_string(),
        ))
    }
}

/// OpenAI-compatible chat-completions backend.
pub struct OpenAiSuggester {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
}

impl OpenAiSuggester {
    /// Build from config, or `None` when the API key variable is unset.
    pub fn from_config(config: &EnrichmentConfig) -> Option<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())?;
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
        {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build HTTP client, enrichment disabled");
                return None;
            }
        };
        Some(Self {
            client,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            api_key,
        })
    }

    fn prompt(failure_text: &str) -> String {
        let excerpt: String = failure_text.chars().take(MAX_EXCERPT_CHARS).collect();
        format!(
            "You are a senior QA automation engineer. Given a test failure, produce a \
             one-line root-cause hypothesis and one suggested fix. Return short text \
             <= 160 chars.\n\nFailure:\n{}\n\nOutput:",
            excerpt
        )
    }
}

#[async_trait]
impl Suggester for OpenAiSuggester {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn suggest(&self, failure_text: &str) -> Result<String, AnalysisError> {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": Self::prompt(failure_text) }],
            "max_tokens": 80,
            "temperature": 0.2,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalysisError::EnrichmentUnavailable(e.to_string()))?
            .error_for_status()
            .map_err(|e| AnalysisError::EnrichmentUnavailable(e.to_string()))?;

        let value: Value = resp
            .json()
            .await
            .map_err(|e| AnalysisError::EnrichmentUnavailable(e.to_string()))?;

        extract_completion(&value).ok_or_else(|| {
            AnalysisError::EnrichmentUnavailable("response had no completion text".to_string())
        })
    }
}

/// `choices[0].message.content`, trimmed and non-empty.
fn extract_completion(value: &Value) -> Option<String> {
    value
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Ask `suggester` about the worst failing tests of this run.
///
/// Targets are tests with failures in `batch`, most failures first, capped at
/// `max_calls`. The first signed failure of each test is sent. Errors are
/// logged and leave that test without a suggestion.
pub async fn enrich_failures(
    suggester: &dyn Suggester,
    reports: &[TestReport],
    batch: &[TestExecution],
    max_calls: usize,
) -> BTreeMap<String, String> {
    let mut suggestions = BTreeMap::new();
    if max_calls == 0 || !suggester.is_available() {
        debug!(backend = suggester.name(), "enrichment disabled");
        return suggestions;
    }

    let mut failers: Vec<&TestReport> = reports.iter().filter(|r| r.failures_this_run > 0).collect();
    failers.sort_by(|a, b| {
        b.statistics
            .fail_count
            .cmp(&a.statistics.fail_count)
            .then(a.full_name.cmp(&b.full_name))
    });

    let mut calls = 0;
    for report in failers {
        if calls >= max_calls {
            break;
        }
        let failure = batch.iter().find_map(|e| {
            (e.project == report.project && e.full_name == report.full_name)
                .then(|| e.failure_text())
                .flatten()
        });
        let Some(text) = failure else {
            continue;
        };

        calls += 1;
        match suggester.suggest(text).await {
            Ok(s) => {
                debug!(test = %report.full_name, backend = suggester.name(), "suggestion received");
                suggestions.insert(report.full_name.clone(), s);
            }
            Err(e) => {
                warn!(test = %report.full_name, backend = suggester.name(), error = %e, "enrichment skipped");
            }
        }
    }

    if !suggestions.is_empty() {
        info!(count = suggestions.len(), "Failure suggestions added");
    }
    suggestions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::model::{TestStatistics, TestStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSuggester {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Suggester for EchoSuggester {
        fn name(&self) -> &'static str {
            "echo"
        }

        async fn suggest(&self, failure_text: &str) -> Result<String, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if failure_text.contains("explode") {
                return Err(AnalysisError::EnrichmentUnavailable("backend down".into()));
            }
            Ok(format!("check: {}", failure_text))
        }
    }

    fn report(name: &str, fails: u32) -> TestReport {
        let mut statistics = TestStatistics::empty();
        statistics.fail_count = fails;
        TestReport {
            project: "p".into(),
            full_name: name.into(),
            failures_this_run: fails,
            statistics,
        }
    }

    fn failing(name: &str, sig: &str) -> TestExecution {
        TestExecution {
            full_name: name.into(),
            project: "p".into(),
            status: TestStatus::Fail,
            timestamp: 1,
            run_id: "r".into(),
            failure_signature: Some(sig.into()),
            commit_sha: None,
        }
    }

    #[tokio::test]
    async fn test_noop_yields_nothing() {
        let out = enrich_failures(
            &NoopSuggester,
            &[report("a", 1)],
            &[failing("a", "boom")],
            20,
        )
        .await;
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_cap_and_order() {
        let s = EchoSuggester {
            calls: AtomicUsize::new(0),
        };
        let reports = [report("few", 1), report("many", 5), report("some", 3)];
        let batch = [failing("few", "x"), failing("many", "y"), failing("some", "z")];

        let out = enrich_failures(&s, &reports, &batch, 2).await;
        assert_eq!(s.calls.load(Ordering::SeqCst), 2);
        assert_eq!(out.get("many").map(String::as_str), Some("check: y"));
        assert!(out.contains_key("some"));
        assert!(!out.contains_key("few"));
    }

    #[tokio::test]
    async fn test_errors_are_skipped() {
        let s = EchoSuggester {
            calls: AtomicUsize::new(0),
        };
        let reports = [report("bad", 2), report("good", 1)];
        let batch = [failing("bad", "explode"), failing("good", "fine")];

        let out = enrich_failures(&s, &reports, &batch, 20).await;
        assert_eq!(out.len(), 1);
        assert!(out.contains_key("good"));
    }

    #[test]
    fn test_extract_completion() {
        let v = json!({"choices": [{"message": {"content": "  Pool exhausted; raise max size  "}}]});
        assert_eq!(
            extract_completion(&v).as_deref(),
            Some("Pool exhausted; raise max size")
        );
        assert_eq!(extract_completion(&json!({"choices": []})), None);
    }

    #[test]
    fn test_openai_requires_api_key() {
        let cfg = EnrichmentConfig {
            api_key_env: "FLAKERADAR_TEST_KEY_THAT_IS_NEVER_SET".into(),
            ..EnrichmentConfig::default()
        };
        assert!(OpenAiSuggester::from_config(&cfg).is_none());
    }

    #[test]
    fn test_prompt_truncates_long_failures() {
        let long = "x".repeat(5000);
        let prompt = OpenAiSuggester::prompt(&long);
        assert!(prompt.len() < 1500);
    }
}
