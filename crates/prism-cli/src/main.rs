//! Prism CLI
//!
//! The `prism` command drives images through the analysis pipeline and
//! inspects the state it shares with other Prism processes.
//!
//! ## Commands
//!
//! - `analyze`: Run one image through the configured stages
//! - `normalize`: Normalize a saved provider reply
//! - `breaker`: List or reset provider circuit breakers
//! - `config`: Print the effective configuration

mod progress;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

use prism_core::provider::fakes::ScriptedProvider;
use prism_core::{
    AnalysisRequest, CircuitBreakerRegistry, CompletionPayload, HttpProviderClient, Normalizer,
    Orchestrator, OutputSchema, OverallStatus, PipelineConfig, PipelineRun, Priority,
    ProviderClient, RunId, StageStatus, SystemClock,
};
use prism_state::fakes::{MemoryAnalysisCache, MemoryHealthStore};
use prism_state::{AnalysisCache, HealthStore, ProgressSink, StoreHandle};

use progress::ConsoleProgress;

#[derive(Parser)]
#[command(name = "prism")]
#[command(author = "Prism Engineering")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Resilient multi-stage image analysis", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline configuration file (TOML)
    #[arg(short, long, global = true, env = "PRISM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one image
    Analyze {
        /// Image reference handed to providers
        #[arg(short, long)]
        image: String,

        /// Free-form context from the user
        #[arg(long)]
        context: Option<String>,

        /// Stages to run (comma-separated; default: every configured stage)
        #[arg(short, long, value_delimiter = ',')]
        stages: Vec<String>,

        /// Scheduling priority passed to providers
        #[arg(long, value_parser = parse_priority)]
        priority: Option<Priority>,

        /// Retries allowed per stage
        #[arg(long)]
        max_retries: Option<u32>,

        /// Base backoff delay between retries (milliseconds)
        #[arg(long)]
        retry_delay_ms: Option<u64>,

        /// Fail instead of returning a partial analysis
        #[arg(long)]
        no_partial: bool,

        /// Fail instead of returning a degraded analysis
        #[arg(long)]
        no_degraded: bool,

        /// Where breaker state, progress and the result cache live
        #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
        store: StoreKind,

        /// Answer every stage with canned replies instead of calling providers
        #[arg(long)]
        offline: bool,

        /// Output format for the result
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Normalize a saved provider reply and print the result
    Normalize {
        /// File holding the raw reply
        file: PathBuf,

        /// Schema to sanitize against (extraction, interpretation, synthesis, full)
        #[arg(long, default_value = "full", value_parser = parse_schema)]
        schema: OutputSchema,
    },

    /// Inspect or reset provider circuit breakers
    Breaker {
        #[command(subcommand)]
        action: BreakerAction,
    },

    /// Show the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum BreakerAction {
    /// List every provider with recorded health
    List,

    /// Close a provider's breaker and clear its failures
    Reset {
        /// Provider name
        provider: String,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the configuration as TOML
    Show,

    /// Validate the configuration and exit
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// Process-local state, lost on exit
    Memory,
    /// SurrealDB, configured from the environment
    Surreal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    prism_core::telemetry::init_tracing(cli.json, level);

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze {
            image,
            context,
            stages,
            priority,
            max_retries,
            retry_delay_ms,
            no_partial,
            no_degraded,
            store,
            offline,
            format,
        } => {
            let request = build_request(
                &config,
                RequestArgs {
                    image,
                    context,
                    stages,
                    priority,
                    max_retries,
                    retry_delay_ms,
                    no_partial,
                    no_degraded,
                },
            )?;
            cmd_analyze(&config, request, store, offline, format).await
        }
        Commands::Normalize { file, schema } => cmd_normalize(&file, schema),
        Commands::Breaker { action } => {
            let stores = Stores::open(StoreKind::Surreal).await?;
            let breaker = CircuitBreakerRegistry::new(
                stores.health,
                Arc::new(SystemClock),
                config.breaker.clone(),
            );
            match action {
                BreakerAction::List => cmd_breaker_list(&breaker).await,
                BreakerAction::Reset { provider } => cmd_breaker_reset(&breaker, &provider).await,
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
            ConfigAction::Check => {
                println!(
                    "✓ configuration valid: {} stages, {} providers",
                    config.stages.len(),
                    config.providers.len()
                );
                Ok(())
            }
        },
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn parse_priority(s: &str) -> std::result::Result<Priority, String> {
    match s.to_ascii_lowercase().as_str() {
        "low" => Ok(Priority::Low),
        "normal" => Ok(Priority::Normal),
        "high" => Ok(Priority::High),
        other => Err(format!("unknown priority `{other}` (low, normal, high)")),
    }
}

fn parse_schema(s: &str) -> std::result::Result<OutputSchema, String> {
    OutputSchema::parse(s).ok_or_else(|| {
        format!("unknown schema `{s}` (extraction, interpretation, synthesis, full)")
    })
}

/// Analyze arguments that shape the request.
struct RequestArgs {
    image: String,
    context: Option<String>,
    stages: Vec<String>,
    priority: Option<Priority>,
    max_retries: Option<u32>,
    retry_delay_ms: Option<u64>,
    no_partial: bool,
    no_degraded: bool,
}

/// Configured defaults first, command-line overrides on top.
fn build_request(config: &PipelineConfig, args: RequestArgs) -> Result<AnalysisRequest> {
    let mut options = config.defaults.clone();
    if let Some(n) = args.max_retries {
        options.max_retry_attempts = n;
    }
    if let Some(ms) = args.retry_delay_ms {
        options.retry_delay_ms = ms;
    }
    if args.no_partial {
        options.enable_partial_recovery = false;
    }
    if args.no_degraded {
        options.enable_degraded_mode = false;
    }

    let stages: Vec<String> = if args.stages.is_empty() {
        config.stages.iter().map(|s| s.name.clone()).collect()
    } else {
        args.stages.iter().map(|s| s.trim().to_string()).collect()
    };

    let mut builder = AnalysisRequest::builder(args.image)
        .stages(stages)
        .options(options);
    if let Some(context) = args.context {
        builder = builder.user_context(context);
    }
    if let Some(priority) = args.priority {
        builder = builder.priority(priority);
    }
    Ok(builder.build()?)
}

/// Shared stores backing the breaker, progress and cache.
struct Stores {
    health: Arc<dyn HealthStore>,
    progress: Option<Arc<dyn ProgressSink>>,
    cache: Arc<dyn AnalysisCache>,
}

impl Stores {
    async fn open(kind: StoreKind) -> Result<Self> {
        match kind {
            StoreKind::Memory => Ok(Self {
                health: Arc::new(MemoryHealthStore::new()),
                progress: None,
                cache: Arc::new(MemoryAnalysisCache::new()),
            }),
            StoreKind::Surreal => {
                let handle = StoreHandle::from_env()
                    .await
                    .context("Failed to connect to the Prism state store")?;
                Ok(Self {
                    health: Arc::new(handle.health_store()),
                    progress: Some(Arc::new(handle.progress_store())),
                    cache: Arc::new(handle.analysis_cache()),
                })
            }
        }
    }
}

fn build_orchestrator(
    config: &PipelineConfig,
    stores: &Stores,
    offline: bool,
    console: bool,
) -> Result<Orchestrator> {
    let provider: Arc<dyn ProviderClient> = if offline {
        Arc::new(ScriptedProvider::new())
    } else {
        Arc::new(HttpProviderClient::new(config.providers.clone())?)
    };
    let progress: Option<Arc<dyn ProgressSink>> = if console {
        Some(Arc::new(ConsoleProgress::new(stores.progress.clone())))
    } else {
        stores.progress.clone()
    };

    let mut builder = Orchestrator::builder()
        .config(config)
        .provider(provider)
        .health_store(Arc::clone(&stores.health))
        .cache(Arc::clone(&stores.cache));
    if let Some(progress) = progress {
        builder = builder.progress_sink(progress);
    }
    Ok(builder.build()?)
}

async fn cmd_analyze(
    config: &PipelineConfig,
    request: AnalysisRequest,
    store: StoreKind,
    offline: bool,
    format: OutputFormat,
) -> Result<()> {
    let stores = Stores::open(store).await?;
    let orchestrator = build_orchestrator(config, &stores, offline, format == OutputFormat::Text)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let run_id = RunId::new();
    info!(run_id = %run_id, image = %request.image_ref(), "starting analysis");
    let run = orchestrator
        .run_with(run_id, request, cancel, None)
        .await
        .context("Analysis could not run")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&run_report(&run))?),
        OutputFormat::Text => print!("{}", render_run(&run)),
    }

    match &run.overall_status {
        OverallStatus::Failed { cause } => anyhow::bail!("Analysis failed: {cause}"),
        _ => Ok(()),
    }
}

/// JSON report: the completion payload when there is one, plus per-stage
/// outcomes.
fn run_report(run: &PipelineRun) -> serde_json::Value {
    let stages: Vec<serde_json::Value> = run
        .stage_results
        .iter()
        .map(|r| {
            serde_json::json!({
                "stage": r.stage,
                "provider": r.provider,
                "status": r.status,
                "attempts": r.attempt_count,
                "error": r.error,
                "skipReason": r.skip_reason,
            })
        })
        .collect();

    serde_json::json!({
        "id": run.id,
        "status": run.overall_status,
        "qualityScore": run.quality_score,
        "durationMs": run.duration_ms(),
        "stages": stages,
        "result": CompletionPayload::from_run(run),
    })
}

fn render_run(run: &PipelineRun) -> String {
    let mut out = String::new();
    out.push('\n');
    out.push_str(&format!("Run ID: {}\n", run.id));
    out.push_str(&format!("Status: {}\n", run.overall_status.label()));
    out.push_str(&format!("Quality: {}/100\n", run.quality_score));
    out.push_str(&format!("Duration: {}ms\n\n", run.duration_ms()));

    for result in &run.stage_results {
        let mark = match result.status {
            StageStatus::Succeeded => "✓",
            StageStatus::Failed => "✗",
            StageStatus::Skipped => "-",
            StageStatus::Pending | StageStatus::Running => "?",
        };
        let detail = match (&result.error, &result.skip_reason) {
            (Some(error), _) => format!(": {} ({})", error.message, error.kind),
            (None, Some(reason)) => format!(": {reason}"),
            (None, None) => String::new(),
        };
        out.push_str(&format!(
            "  {} {} [{}, {} attempt(s)]{}\n",
            mark, result.stage, result.provider, result.attempt_count, detail
        ));
    }

    match &run.overall_status {
        OverallStatus::Partial { missing_stages } => {
            out.push_str(&format!("\nMissing: {}\n", missing_stages.join(", ")));
        }
        OverallStatus::Degraded { limitations } => {
            out.push_str("\nLimitations:\n");
            for limitation in limitations {
                out.push_str(&format!("  - {limitation}\n"));
            }
        }
        OverallStatus::Failed { cause } => {
            out.push_str(&format!("\nCause: {cause}\n"));
        }
        OverallStatus::Running | OverallStatus::Completed => {}
    }

    if let Some(analysis) = &run.analysis {
        let summary = &analysis.summary;
        out.push_str(&format!(
            "\nScore {} (usability {}, accessibility {}, visual {}, content {})\n",
            summary.overall_score,
            summary.category_scores.usability,
            summary.category_scores.accessibility,
            summary.category_scores.visual,
            summary.category_scores.content
        ));
        for issue in &summary.key_issues {
            out.push_str(&format!("  ! {issue}\n"));
        }
        for suggestion in &analysis.suggestions {
            out.push_str(&format!(
                "  * {} ({:?} impact, {:?} effort)\n",
                suggestion.title, suggestion.impact, suggestion.effort
            ));
        }
        out.push_str(&format!(
            "  {} annotation(s), {} suggestion(s)\n",
            analysis.visual_annotations.len(),
            analysis.suggestions.len()
        ));
    }
    out
}

fn cmd_normalize(file: &Path, schema: OutputSchema) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let outcome = Normalizer::new().normalize(&raw, schema);

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if outcome.ok {
        Ok(())
    } else {
        anyhow::bail!("No strategy could normalize the reply: {}", outcome.failure_reason())
    }
}

async fn cmd_breaker_list(breaker: &CircuitBreakerRegistry) -> Result<()> {
    let providers = breaker.list().await?;
    if providers.is_empty() {
        println!("No provider health recorded.");
        return Ok(());
    }
    for health in providers {
        println!(
            "  {:<16} {:<9} failures={} cooldown={}ms",
            health.provider,
            health.state.as_str(),
            health.consecutive_failures,
            health.cooldown_ms
        );
    }
    Ok(())
}

async fn cmd_breaker_reset(breaker: &CircuitBreakerRegistry, provider: &str) -> Result<()> {
    let health = breaker.reset(provider).await?;
    println!("✓ {} is {}", health.provider, health.state.as_str());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(image: &str) -> RequestArgs {
        RequestArgs {
            image: image.to_string(),
            context: None,
            stages: Vec::new(),
            priority: None,
            max_retries: None,
            retry_delay_ms: None,
            no_partial: false,
            no_degraded: false,
        }
    }

    #[test]
    fn test_cli_parses_analyze() {
        let cli = Cli::try_parse_from([
            "prism",
            "analyze",
            "--image",
            "img-1",
            "--stages",
            "scene_extraction,interpretation",
            "--priority",
            "high",
            "--no-degraded",
            "--offline",
        ])
        .unwrap();
        let Commands::Analyze {
            image,
            stages,
            priority,
            no_degraded,
            offline,
            store,
            ..
        } = cli.command
        else {
            panic!("expected analyze");
        };
        assert_eq!(image, "img-1");
        assert_eq!(stages, ["scene_extraction", "interpretation"]);
        assert_eq!(priority, Some(Priority::High));
        assert!(no_degraded);
        assert!(offline);
        assert_eq!(store, StoreKind::Memory);
    }

    #[test]
    fn test_cli_rejects_unknown_schema() {
        assert!(Cli::try_parse_from(["prism", "normalize", "reply.txt", "--schema", "poem"]).is_err());
    }

    #[test]
    fn test_request_uses_config_defaults_and_overrides() {
        let config = PipelineConfig::from_toml_str(
            "[defaults]\nmax_retry_attempts = 1\nenable_partial_recovery = false\n",
        )
        .unwrap();

        let request = build_request(&config, args("img")).unwrap();
        assert_eq!(request.options().max_retry_attempts, 1);
        assert!(!request.options().enable_partial_recovery);
        assert_eq!(request.requested_stages().len(), 3);

        let mut overridden = args("img");
        overridden.max_retries = Some(4);
        overridden.no_degraded = true;
        overridden.stages = vec![" synthesis ".to_string()];
        let request = build_request(&config, overridden).unwrap();
        assert_eq!(request.options().max_retry_attempts, 4);
        assert!(!request.options().enable_degraded_mode);
        assert_eq!(request.requested_stages(), ["synthesis"]);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(build_request(&PipelineConfig::default(), args("  ")).is_err());
    }

    #[tokio::test]
    async fn test_offline_analysis_renders() {
        let config = PipelineConfig::default();
        let stores = Stores::open(StoreKind::Memory).await.unwrap();
        let orchestrator = build_orchestrator(&config, &stores, true, false).unwrap();
        let request = build_request(&config, args("img-offline")).unwrap();
        let run = orchestrator.run(request).await.unwrap();

        let text = render_run(&run);
        assert!(text.contains("Status: completed"));
        assert!(text.contains("✓ scene_extraction"));

        let report = run_report(&run);
        assert_eq!(report["status"]["status"], "completed");
        assert_eq!(report["result"]["mode"], "full");
        assert_eq!(report["stages"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_normalize_command_fails_on_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "no json here").unwrap();
        assert!(cmd_normalize(file.path(), OutputSchema::Full).is_err());

        let mut good = tempfile::NamedTempFile::new().unwrap();
        write!(good, r#"{{"summary": {{"overallScore": 88}}}}"#).unwrap();
        assert!(cmd_normalize(good.path(), OutputSchema::Synthesis).is_ok());
    }
}
