use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use flakeradar::analysis::enrich::OpenAiSuggester;
use flakeradar::analysis::model::{AnalysisResult, TestExecution};
use flakeradar::analysis::runner::FlakinessAnalyzer;
use flakeradar::config::{FlakeRadarConfig, LoggingConfig};
use flakeradar::storage::HistoryStore;

#[derive(Parser)]
#[command(
    name = "flakeradar",
    about = "Flaky test classification and time-to-fix tracking",
    version,
    long_about = None
)]
struct Cli {
    /// History database (overrides the config file)
    #[arg(long, global = true, env = "FLAKERADAR_DB_PATH")]
    db: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze a batch of test executions and update flaky episodes
    Analyze {
        /// JSON array of test executions
        #[arg(long)]
        input: PathBuf,

        /// Only analyze executions of this project
        #[arg(long)]
        project: Option<String>,

        /// Minimum confidence for a TRULY_FLAKY verdict (0.0-1.0)
        #[arg(long)]
        threshold: Option<f64>,

        /// Most recent executions considered per test
        #[arg(long)]
        limit_runs: Option<usize>,

        /// Skip flaky episode tracking
        #[arg(long)]
        no_track: bool,

        /// Cap on failure suggestions requested this run
        #[arg(long)]
        max_ai: Option<usize>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Tests that stayed flaky the longest
    Offenders {
        #[arg(long)]
        project: String,

        /// Rows to show
        #[arg(long)]
        limit: Option<usize>,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Time-to-fix summary for a project
    Summary {
        #[arg(long)]
        project: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(logging: &LoggingConfig, force_json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json || force_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = FlakeRadarConfig::load_or_default();
    if let Some(db) = cli.db {
        config.storage.db_path = db;
    }
    init_tracing(&config.logging, cli.log_json);

    let db_path = config.storage.db_path.to_string_lossy().to_string();

    match cli.command {
        Commands::Analyze {
            input,
            project,
            threshold,
            limit_runs,
            no_track,
            max_ai,
            json,
        } => {
            let mut analysis = config.analysis.clone();
            if let Some(t) = threshold {
                analysis.confidence_threshold = t;
            }
            if let Some(n) = limit_runs {
                analysis.limit_runs = n;
            }
            if no_track {
                analysis.track_time_to_fix = false;
            }
            if let Some(n) = max_ai {
                analysis.max_ai_analysis = n;
            }

            let raw = std::fs::read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let mut batch: Vec<TestExecution> = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse executions in {}", input.display()))?;
            if let Some(p) = &project {
                batch.retain(|e| &e.project == p);
            }
            tracing::info!(input = %input.display(), executions = batch.len(), "Loaded executions");

            let store = HistoryStore::open(&db_path)?;
            let suggester = OpenAiSuggester::from_config(&config.enrichment);

            let mut analyzer = FlakinessAnalyzer::new(analysis)?.with_store(&store);
            if let Some(s) = &suggester {
                analyzer = analyzer.with_suggester(s);
            }
            let result = analyzer.run(batch).await;
            store.close();

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_analysis(&result);
            }
        }
        Commands::Offenders {
            project,
            limit,
            json,
        } => {
            let store = HistoryStore::open(&db_path)?;
            let now = chrono::Utc::now().timestamp();
            let limit = limit.unwrap_or(config.analysis.worst_offenders_limit);
            let offenders = store.worst_offenders(&project, now, limit)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&offenders)?);
            } else if offenders.is_empty() {
                println!("No flaky episodes recorded for '{}'.", project);
            } else {
                println!("\nWorst offenders: {}", project);
                println!("{:<50} | {:>5} | {:>8} | Status", "Test", "Days", "Failures");
                println!("{:-<50}-|-{:-<5}-|-{:-<8}-|-{:-<7}", "", "", "", "");
                for o in &offenders {
                    let status = if o.still_flaky { "OPEN" } else { "FIXED" };
                    println!(
                        "{:<50} | {:>5} | {:>8} | {}",
                        truncate(&o.full_name, 50),
                        o.current_days_flaky,
                        o.total_failures_while_flaky,
                        status
                    );
                }
                println!();
            }
        }
        Commands::Summary { project, json } => {
            let store = HistoryStore::open(&db_path)?;
            let now = chrono::Utc::now().timestamp();
            let summary = store.time_to_fix_summary(&project, now)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("\n=== Time to Fix: {} ===", project);
                println!("Recorded runs:    {}", store.run_count(&project)?);
                println!("Open episodes:    {}", summary.open_episodes);
                println!("Fixed episodes:   {}", summary.fixed_episodes);
                match summary.mean_days_to_fix {
                    Some(d) => println!("Mean days to fix: {:.1}", d),
                    None => println!("Mean days to fix: n/a"),
                }
                match summary.oldest_open_days {
                    Some(d) => println!("Oldest open:      {} days", d),
                    None => println!("Oldest open:      n/a"),
                }
                println!();
            }
        }
    }

    Ok(())
}

fn print_analysis(result: &AnalysisResult) {
    println!("\n=== FlakeRadar Analysis {} ===", result.analysis_id);
    println!(
        "Tests: {}   Flaky: {}   Suspect: {}   Persisted: {}",
        result.tests.len(),
        result.flaky_count(),
        result.suspect_count(),
        if result.persisted { "yes" } else { "no" }
    );

    let failing: Vec<_> = result
        .tests
        .iter()
        .filter(|t| t.statistics.fail_count > 0)
        .collect();
    if !failing.is_empty() {
        println!();
        println!(
            "{:<50} | {:<14} | {:>10} | {:>9} | {:>5}",
            "Test", "Verdict", "Confidence", "Fail/Total", "Rate"
        );
        println!("{:-<50}-|-{:-<14}-|-{:-<10}-|-{:-<9}-|-{:-<5}", "", "", "", "", "");
        for t in failing {
            let s = &t.statistics;
            println!(
                "{:<50} | {:<14} | {:>10.2} | {:>9} | {:>4.0}%",
                truncate(&t.full_name, 50),
                s.classification.as_str(),
                s.confidence,
                format!("{}/{}", s.fail_count, s.total),
                s.flake_rate * 100.0
            );
            if let Some(hint) = result.suggestions.get(&t.full_name) {
                println!("{:<50} |   -> {}", "", hint);
            }
        }
    }

    if !result.open_episodes.is_empty() {
        println!("\nOpen flaky episodes:");
        for ep in &result.open_episodes {
            println!(
                " - {} ({} days, {} failures{})",
                ep.full_name,
                ep.days_flaky,
                ep.total_failures_while_flaky,
                ep.root_cause_cluster
                    .as_deref()
                    .map(|c| format!(", {}", c))
                    .unwrap_or_default()
            );
        }
    }

    if !result.clusters.is_empty() {
        println!("\nFailure clusters:");
        for c in &result.clusters {
            println!(
                " [{}] {}: {} tests, {} failures",
                c.severity,
                c.signature_category,
                c.tests_affected.len(),
                c.failure_count
            );
            if let Some(ex) = &c.exception_pattern {
                println!("     exception: {}", ex);
            }
            println!("     -> {}", c.recommendation);
        }
    }

    for w in &result.warnings {
        println!("\nWarning: {}", w);
    }
    println!();
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let tail: String = s.chars().rev().take(max - 3).collect::<Vec<_>>().into_iter().rev().collect();
        format!("...{}", tail)
    }
}
