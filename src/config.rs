//! TOML configuration for FlakeRadar.
//!
//! Layered the usual way: compiled-in defaults, overridden by a config file
//! (`FLAKERADAR_CONFIG` or `./flakeradar.toml`), overridden by
//! `FLAKERADAR_DB_PATH` for the database location, overridden by CLI flags.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analysis::aggregator::DEFAULT_LIMIT_RUNS;
use crate::analysis::scorer::DEFAULT_CONFIDENCE_THRESHOLD;
use crate::analysis::AnalysisError;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "FLAKERADAR_CONFIG";
/// Environment variable overriding the history database path.
pub const DB_PATH_ENV: &str = "FLAKERADAR_DB_PATH";

const LOCAL_CONFIG: &str = "flakeradar.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlakeRadarConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FlakeRadarConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded flakeradar configuration");
        Ok(config)
    }

    /// Try, in order: `$FLAKERADAR_CONFIG`, `./flakeradar.toml`, defaults.
    /// `$FLAKERADAR_DB_PATH` is applied on top of whichever was loaded.
    pub fn load_or_default() -> Self {
        let mut config = Self::load_file_or_default();
        if let Ok(db_path) = std::env::var(DB_PATH_ENV) {
            if !db_path.trim().is_empty() {
                config.storage.db_path = PathBuf::from(db_path);
            }
        }
        config
    }

    fn load_file_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FLAKERADAR_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let local = Path::new(LOCAL_CONFIG);
        if local.exists() {
            match Self::load(local) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %local.display(),
                        error = %e,
                        "local config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite history database. Parent directory is created on open.
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join(".flakeradar").join("history.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Analysis
// ---------------------------------------------------------------------------

/// Per-run analysis knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Minimum confidence for a TRULY_FLAKY verdict, within `[0, 1]`.
    pub confidence_threshold: f64,
    /// Most recent executions considered per test, at least 1.
    pub limit_runs: usize,
    /// Persist flaky episodes for time-to-fix reporting.
    pub track_time_to_fix: bool,
    /// Rows in the worst-offenders report.
    pub worst_offenders_limit: usize,
    /// Cap on enrichment calls per run.
    pub max_ai_analysis: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            limit_runs: DEFAULT_LIMIT_RUNS,
            track_time_to_fix: true,
            worst_offenders_limit: 10,
            max_ai_analysis: 20,
        }
    }
}

impl AnalysisConfig {
    /// Reject out-of-range settings before any analysis starts.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(AnalysisError::InvalidConfiguration(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.limit_runs < 1 {
            return Err(AnalysisError::InvalidConfiguration(
                "limit_runs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Enrichment
// ---------------------------------------------------------------------------

/// Optional LLM failure summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Chat-completions endpoint.
    pub endpoint: String,
    pub model: String,
    /// Environment variable holding the API key. Enrichment is off when unset.
    pub api_key_env: String,
    pub timeout_secs: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            timeout_secs: 20,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = FlakeRadarConfig::default();
        assert_eq!(cfg.analysis.confidence_threshold, 0.7);
        assert_eq!(cfg.analysis.limit_runs, 50);
        assert!(cfg.analysis.track_time_to_fix);
        assert_eq!(cfg.analysis.max_ai_analysis, 20);
        assert!(cfg.storage.db_path.ends_with(".flakeradar/history.db"));
        assert!(cfg.analysis.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(
            file,
            "[analysis]\nconfidence_threshold = 0.5\n\n[logging]\njson = true"
        )?;
        let cfg = FlakeRadarConfig::load(file.path())?;
        assert_eq!(cfg.analysis.confidence_threshold, 0.5);
        assert_eq!(cfg.analysis.limit_runs, 50);
        assert!(cfg.logging.json);
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.enrichment.api_key_env, "OPENAI_API_KEY");
        Ok(())
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[analysis\nlimit_runs = ").unwrap();
        assert!(FlakeRadarConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let bad_threshold = AnalysisConfig {
            confidence_threshold: 1.2,
            ..AnalysisConfig::default()
        };
        assert!(matches!(
            bad_threshold.validate(),
            Err(AnalysisError::InvalidConfiguration(_))
        ));

        let nan_threshold = AnalysisConfig {
            confidence_threshold: f64::NAN,
            ..AnalysisConfig::default()
        };
        assert!(nan_threshold.validate().is_err());

        let zero_runs = AnalysisConfig {
            limit_runs: 0,
            ..AnalysisConfig::default()
        };
        assert!(zero_runs.validate().is_err());
    }
}
