use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use color_eyre::{eyre::WrapErr, Result};
use synthguard_audit::{verify_store, JsonLinesAuditStore};
use synthguard_privacy::{
    load_config, ConfigFormat, Decision, EvaluationRequest, NoiseMechanism, PrivacyLevel,
    PrivacyOrchestrator, Record, StaticRecordSource,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "synthguard",
    version,
    about = "Privacy budget and disclosure-control gate for synthetic data releases"
)]
struct Cli {
    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse and validate an engine configuration, including custom rule sets.
    CheckConfig(ConfigArgs),
    /// Re-verify the hash chain of a JSON-lines audit log.
    VerifyAudit {
        #[arg(long, env = "SYNTHGUARD_AUDIT_LOG")]
        log: PathBuf,
        #[arg(long, default_value_t = 0)]
        from: u64,
        /// Last sequence number to check; defaults to the end of the log.
        #[arg(long)]
        to: Option<u64>,
    },
    /// Gate one batch of candidate records read from a file.
    Evaluate(EvaluateArgs),
}

#[derive(Debug, Args)]
struct ConfigArgs {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/synthguard.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
}

#[derive(Debug, Args)]
struct EvaluateArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Candidate records: a JSON array or one JSON object per line.
    #[arg(long)]
    records: PathBuf,
    #[arg(long)]
    dataset: String,
    /// Epsilon to spend; overrides --level.
    #[arg(long)]
    epsilon: Option<f64>,
    #[arg(long, default_value_t = PrivacyLevel::Medium)]
    level: PrivacyLevel,
    #[arg(long, default_value_t = 0.0)]
    delta: f64,
    #[arg(long = "quasi-identifier", required = true)]
    quasi_identifiers: Vec<String>,
    #[arg(long = "sensitive")]
    sensitive_columns: Vec<String>,
    #[arg(long, default_value_t = 5)]
    k: u64,
    /// Blocking frameworks.
    #[arg(long = "framework")]
    frameworks: Vec<String>,
    /// Frameworks that are evaluated and logged but never block.
    #[arg(long = "advisory")]
    advisory: Vec<String>,
    #[arg(long, default_value_t = 1_000)]
    batch_size: usize,
    /// Calibrate Gaussian noise for the generator at the given sensitivity.
    #[arg(long)]
    gaussian_sensitivity: Option<f64>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match cli.command {
        Command::CheckConfig(args) => {
            let config = load_config(&args.config, args.config_format)?;
            println!(
                "{} ok: {} dataset budgets, reservation ttl {} ms, audit log {}",
                args.config.display(),
                config.budget.datasets.len(),
                config.budget.reservation_ttl_ms,
                config
                    .audit
                    .log_path
                    .as_deref()
                    .map_or_else(|| "in memory".to_owned(), |p| p.display().to_string()),
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::VerifyAudit { log, from, to } => {
            let store = JsonLinesAuditStore::open(&log)
                .wrap_err_with(|| format!("opening audit log {}", log.display()))?;
            let verified = verify_store(&store, from, to)?;
            println!("{}: {verified} entries verified from sequence {from}", log.display());
            Ok(ExitCode::SUCCESS)
        }
        Command::Evaluate(args) => evaluate(args).await,
    }
}

async fn evaluate(args: EvaluateArgs) -> Result<ExitCode> {
    let config = load_config(&args.config.config, args.config.config_format)?;
    let records = read_records(&args.records)?;
    info!(rows = records.len(), dataset = %args.dataset, "loaded candidate records");

    let orchestrator =
        PrivacyOrchestrator::from_config(&config, Arc::new(StaticRecordSource::new(records)))?;
    let mut request = EvaluationRequest::at_level(args.dataset, args.level)
        .delta(args.delta)
        .quasi_identifiers(args.quasi_identifiers)
        .sensitive_columns(args.sensitive_columns)
        .k_threshold(args.k)
        .batch_size(args.batch_size);
    if let Some(epsilon) = args.epsilon {
        request.epsilon = epsilon;
    }
    for name in &args.frameworks {
        request = request.framework(name);
    }
    for name in &args.advisory {
        request = request.advisory_framework(name);
    }
    if let Some(sensitivity) = args.gaussian_sensitivity {
        request = request.noise(NoiseMechanism::Gaussian, sensitivity);
    }

    let decision = orchestrator
        .evaluate_with_cancellation(request, async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await?;
    println!("{}", serde_json::to_string_pretty(&decision)?);
    Ok(match decision {
        Decision::Accepted(_) => ExitCode::SUCCESS,
        Decision::Rejected(_) => ExitCode::from(2),
    })
}

/// Accepts either a JSON array of objects or JSON lines.
fn read_records(path: &Path) -> Result<Vec<Record>> {
    let contents =
        fs::read_to_string(path).wrap_err_with(|| format!("reading {}", path.display()))?;
    if contents.trim_start().starts_with('[') {
        return serde_json::from_str(&contents)
            .wrap_err_with(|| format!("parsing {} as a JSON array", path.display()));
    }
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line)
                .wrap_err_with(|| format!("{}:{}: invalid record", path.display(), index + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn records_load_from_array_or_lines() {
        let dir = tempfile::tempdir().unwrap();
        let array = dir.path().join("batch.json");
        fs::write(&array, r#"[{"zip_code": "021"}, {"zip_code": "100"}]"#).unwrap();
        let lines = dir.path().join("batch.jsonl");
        fs::write(&lines, "{\"zip_code\": \"021\"}\n\n{\"zip_code\": \"100\"}\n").unwrap();
        assert_eq!(read_records(&array).unwrap(), read_records(&lines).unwrap());
        assert_eq!(read_records(&array).unwrap().len(), 2);
    }

    #[test]
    fn bad_line_is_located() {
        let dir = tempfile::tempdir().unwrap();
        let lines = dir.path().join("batch.jsonl");
        fs::write(&lines, "{\"a\": 1}\nnot json\n").unwrap();
        let err = read_records(&lines).unwrap_err();
        assert!(err.to_string().ends_with(":2: invalid record"));
    }

    #[test]
    fn cli_parses_evaluate_flags() {
        let cli = Cli::try_parse_from([
            "synthguard",
            "evaluate",
            "--records",
            "batch.json",
            "--dataset",
            "patients_v1",
            "--level",
            "high",
            "--quasi-identifier",
            "zip_code",
            "--quasi-identifier",
            "age_group",
            "--framework",
            "hipaa",
        ])
        .unwrap();
        let Command::Evaluate(args) = cli.command else {
            panic!("expected evaluate");
        };
        assert_eq!(args.level, PrivacyLevel::High);
        assert_eq!(args.quasi_identifiers, vec!["zip_code", "age_group"]);
        assert_eq!(args.config.config_format, ConfigFormat::Auto);
    }
}
