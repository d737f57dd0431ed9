//! CLI binary for running and inspecting Caseweaver pipelines.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use caseweaver_gen::{DynBackend, HttpBackend, ReplayBackend};
use caseweaver_pipeline::{default_plan, lint, Orchestrator, PipelineEvent, RunConfig, StageKind};
use caseweaver_schema::SchemaRegistry;
use caseweaver_types::StageStatus;

#[derive(Parser)]
#[command(name = "weave", version, about = "Validated multi-stage narrative generation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the stage DAG and lint it
    Plan,

    /// Validate an artifact file against a registered schema
    Validate {
        /// Schema id (e.g. case.v1, clues.v1)
        schema: String,

        /// Path to the artifact JSON file
        artifact: PathBuf,
    },

    /// Run the full pipeline
    Run {
        /// Path to a RunConfig JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Serve canned responses from a directory of .txt files instead of
        /// calling the HTTP backend
        #[arg(long)]
        replay: Option<PathBuf>,

        /// Directory to write accepted artifacts and the attempt log into
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Plan => cmd_plan(),
        Commands::Validate { schema, artifact } => cmd_validate(&schema, &artifact),
        Commands::Run {
            config,
            replay,
            out,
        } => cmd_run(config.as_deref(), replay.as_deref(), out.as_deref()).await,
    }
}

fn cmd_plan() -> anyhow::Result<()> {
    let plan = default_plan();
    let registry = SchemaRegistry::builtin();

    println!("Stages ({}):", plan.stages.len());
    for stage in &plan.stages {
        let kind = match &stage.kind {
            StageKind::Generate { schema_id } => format!("generate -> {schema_id}"),
            StageKind::Prose { schema_id } => format!("prose batches -> {schema_id}"),
            StageKind::FairPlayAudit { target } => format!("fair-play audit of {target}"),
            StageKind::NoveltyAudit { target } => format!("novelty audit of {target}"),
        };
        let deps = if stage.depends_on.is_empty() {
            "-".to_string()
        } else {
            stage.depends_on.join(", ")
        };
        println!("  {:<20} [{kind}] after: {deps}", stage.name);
    }

    match lint(&plan, &registry) {
        Ok(()) => println!("\nPlan is valid"),
        Err(error) => {
            println!("\nPlan is invalid: {error}");
            std::process::exit(1);
        }
    }
    Ok(())
}

fn cmd_validate(schema_id: &str, artifact_path: &Path) -> anyhow::Result<()> {
    let registry = SchemaRegistry::builtin();
    let Some(schema) = registry.get(schema_id) else {
        anyhow::bail!(
            "unknown schema '{schema_id}'; registered: {}",
            registry.ids().join(", ")
        );
    };

    let raw = std::fs::read_to_string(artifact_path)?;
    let candidate: serde_json::Value = serde_json::from_str(&raw)?;
    let result = caseweaver_schema::validate(schema, &candidate);

    for warning in &result.warnings {
        println!("[WARN] {warning}");
    }
    if result.valid {
        println!("Artifact satisfies {schema_id}");
        return Ok(());
    }
    for error in &result.errors {
        println!("[{:?}] {}: {}", error.kind, error.path, error.message);
    }
    println!("{} error(s)", result.error_count());
    std::process::exit(1);
}

async fn cmd_run(
    config_path: Option<&Path>,
    replay: Option<&Path>,
    out: Option<&Path>,
) -> anyhow::Result<()> {
    let mut config: RunConfig = match config_path {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => RunConfig::default(),
    };
    if config.run_id.is_empty() {
        config.run_id = uuid::Uuid::new_v4().to_string();
    }
    if config.project_id.is_empty() {
        config.project_id = "default".into();
    }
    let run_id = config.run_id.clone();

    let backend = match replay {
        Some(dir) => DynBackend::new(ReplayBackend::from_dir(dir)?),
        None => DynBackend::new(HttpBackend::from_env()?),
    };

    println!("Run: {run_id}");
    println!("Project: {}", config.project_id);

    let orchestrator = Orchestrator::new(backend, config);

    // Forward pipeline events into the log as they happen.
    let mut events = orchestrator.subscribe();
    let forwarder = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PipelineEvent::StageAccepted { stage, attempt, revised, .. } => {
                    tracing::info!(stage = %stage, attempt, revised, "accepted");
                }
                PipelineEvent::StageFailed { stage, error, .. } => {
                    tracing::error!(stage = %stage, error = %error, "failed");
                }
                PipelineEvent::StageSkipped { stage, upstream, .. } => {
                    tracing::warn!(stage = %stage, upstream = %upstream, "skipped");
                }
                PipelineEvent::RegenerationRequested { audit, target, iteration, .. } => {
                    tracing::warn!(audit = %audit, target = %target, iteration, "audit regeneration");
                }
                _ => {}
            }
        }
    });

    let report = orchestrator.run().await?;
    forwarder.abort();

    println!("\n{:<20} {:>9} {:>9} {:>9} {:>11}", "stage", "status", "attempts", "revised", "cost");
    for record in &report.run.stages {
        println!(
            "{:<20} {:>9} {:>9} {:>9} {:>11.4}",
            record.stage,
            record.status.to_string(),
            record.attempts,
            if record.revised {
                format!("x{}", record.revision_count)
            } else {
                "-".to_string()
            },
            record.cost,
        );
        if let Some(failure) = &record.failure {
            println!("{:<20} {failure}", "");
        }
    }
    println!(
        "\nTotal cost: {:.4} | total latency: {}ms",
        report.run.total_cost, report.run.total_latency_ms
    );
    for warning in &report.warnings {
        println!("[WARN] {warning}");
    }

    if let Some(dir) = out {
        std::fs::create_dir_all(dir)?;
        for (stage, artifact) in &report.artifacts {
            let path = dir.join(format!("{}.json", stage.replace('/', "_")));
            std::fs::write(&path, serde_json::to_string_pretty(&artifact)?)?;
        }
        let log_path = dir.join("attempts.json");
        std::fs::write(
            &log_path,
            serde_json::to_string_pretty(&orchestrator.store().export())?,
        )?;
        println!("Artifacts written to {}", dir.display());
    }

    let failed = report
        .run
        .stages
        .iter()
        .any(|s| s.status == StageStatus::Failed);
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
