use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use verdict_common::config::{BackendKind, GraderConfig, LanguageConfigManager, DEFAULT_LANGUAGES_PATH};
use verdict_common::types::GradingRequest;
use verdict_core::diagnostics::{DiagnosticExplainer, SummaryExplainer};
use verdict_core::Grader;

#[derive(Parser)]
#[command(name = "verdict-cli")]
#[command(about = "Verdict CLI - Grade untrusted function submissions against test cases", long_about = None)]
struct Cli {
    /// Path to languages.json (built-in languages are used when missing)
    #[arg(long, global = true, default_value = DEFAULT_LANGUAGES_PATH)]
    languages: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Grade one request and print the SubmissionResult as JSON
    Grade {
        /// Grading request file ("-" reads stdin)
        #[arg(short, long)]
        request: PathBuf,

        /// Sandbox backend (process, docker); overrides VERDICT_BACKEND
        #[arg(short, long)]
        backend: Option<BackendKind>,

        /// Pretty-print the result
        #[arg(long, default_value = "false")]
        pretty: bool,

        /// Print a plain-text summary after the JSON result
        #[arg(long, default_value = "false")]
        explain: bool,
    },

    /// List configured languages
    Languages,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // stdout carries the result, logs go to stderr
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn read_request(path: &Path) -> Result<GradingRequest> {
    let content = if path == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("Failed to read request from stdin")?
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read request file {}", path.display()))?
    };

    serde_json::from_str(&content).context("Failed to parse grading request")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let languages = LanguageConfigManager::load_or_builtin(&cli.languages)?;

    match cli.command {
        Commands::Grade {
            request,
            backend,
            pretty,
            explain,
        } => {
            let mut config = GraderConfig::from_env();
            if let Some(backend) = backend {
                config.backend = backend;
            }

            let request = read_request(&request)?;
            let grader = Grader::from_config(config, languages).context("Failed to initialise sandbox backend")?;
            info!(backend = grader.backend(), "Grader ready");

            let result = grader.grade_request(request).await;

            let rendered = if pretty {
                serde_json::to_string_pretty(&result)?
            } else {
                serde_json::to_string(&result)?
            };
            println!("{}", rendered);

            if explain {
                let summary = SummaryExplainer::default().explain(&result).await?;
                println!();
                println!("{}", summary);
            }
        }
        Commands::Languages => {
            for name in languages.list_languages() {
                println!("{}", name);
            }
        }
    }

    Ok(())
}
