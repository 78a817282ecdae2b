//! Command-line interface for conductor.
//!
//! Builds the store, queue, generator and orchestrator from the resolved
//! configuration, then runs one command against them.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapters::{AnthropicConfig, AnthropicGenerator, Generator, OfflineGenerator};
use crate::config::{Provider, ResolvedConfig};
use crate::core::{JsonlJobQueue, Orchestrator, RunLog, WorkerPool};
use crate::domain::{DecisionOutcome, StageName};
use crate::store::SqliteStore;

/// conductor - Durable stage pipeline from idea to execution
#[derive(Parser, Debug)]
#[command(name = "conductor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an empty project to add ideas to later
    New,

    /// Submit an idea, creating a project unless --project is given
    Idea {
        /// Idea text
        content: String,

        /// Add the idea to an existing project (UUID) still at the idea stage
        #[arg(short, long)]
        project: Option<String>,
    },

    /// Enqueue a stage job for a project
    Trigger {
        /// Stage to run (feasibility, planning, execution)
        stage: StageName,

        /// Project ID (UUID)
        project_id: String,
    },

    /// Show a project's state and stage
    Status {
        /// Project ID (UUID)
        project_id: String,
    },

    /// List a project's artifacts
    Artifacts {
        /// Project ID (UUID)
        project_id: String,

        /// Show full artifact content
        #[arg(short, long)]
        full: bool,
    },

    /// List a project's execution runs
    Runs {
        /// Project ID (UUID)
        project_id: String,
    },

    /// List projects
    Projects,

    /// Approve or reject a project at its current stage
    Decide {
        /// Project ID (UUID)
        project_id: String,

        /// approve or reject
        outcome: DecisionOutcome,

        /// Reason for the decision
        #[arg(short, long)]
        rationale: Option<String>,
    },

    /// Run stage workers
    Work {
        /// Drain the queue and exit instead of running until Ctrl-C
        #[arg(long)]
        once: bool,
    },

    /// Show run statistics
    Stats,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = ResolvedConfig::load()?;

        if let Commands::Config = self.command {
            return show_config(&cfg);
        }

        let orchestrator = Arc::new(build_orchestrator(&cfg)?);

        match self.command {
            Commands::New => create_project(&orchestrator).await,
            Commands::Idea { content, project } => match project {
                Some(project_id) => add_idea(&orchestrator, &project_id, &content).await,
                None => submit_idea(&orchestrator, &content).await,
            },
            Commands::Trigger { stage, project_id } => {
                trigger(&orchestrator, stage, &project_id).await
            }
            Commands::Status { project_id } => show_status(&orchestrator, &project_id).await,
            Commands::Artifacts { project_id, full } => {
                list_artifacts(&orchestrator, &project_id, full).await
            }
            Commands::Runs { project_id } => list_runs(&orchestrator, &project_id).await,
            Commands::Projects => list_projects(&orchestrator).await,
            Commands::Decide {
                project_id,
                outcome,
                rationale,
            } => decide(&orchestrator, &project_id, outcome, rationale).await,
            Commands::Work { once } => work(orchestrator, &cfg, once).await,
            Commands::Stats => show_stats(&orchestrator).await,
            Commands::Config => show_config(&cfg),
        }
    }
}

fn build_generator(cfg: &ResolvedConfig) -> Result<Arc<dyn Generator>> {
    match cfg.generation.provider {
        Provider::Offline => Ok(Arc::new(OfflineGenerator::new())),
        Provider::Anthropic => {
            let api_key = cfg
                .generation
                .api_key
                .clone()
                .context("ANTHROPIC_API_KEY is required for the anthropic provider")?;
            let mut config = AnthropicConfig::new(api_key);
            config.model = cfg.generation.model.clone();
            config.base_url = cfg.generation.base_url.clone();
            Ok(Arc::new(AnthropicGenerator::new(config)?))
        }
    }
}

/// Wire the store, queue, generator and run log together
fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let store = SqliteStore::open(&cfg.database)
        .with_context(|| format!("Failed to open database: {}", cfg.database.display()))?;
    let queue = JsonlJobQueue::open(cfg.queue_path())
        .with_context(|| format!("Failed to open queue: {}", cfg.queue_path().display()))?;
    let generator = build_generator(cfg)?;

    Ok(Orchestrator::new(
        Arc::new(store),
        Arc::new(queue),
        generator,
        cfg.stages.clone(),
        cfg.generation.settings(),
    )
    .with_run_log(RunLog::new(cfg.run_log_path())))
}

fn parse_project_id(project_id: &str) -> Result<Uuid> {
    Uuid::parse_str(project_id).with_context(|| format!("Invalid project ID: {}", project_id))
}

async fn submit_idea(orchestrator: &Orchestrator, content: &str) -> Result<()> {
    let intake = orchestrator.submit_idea(content).await?;

    println!("Project ID: {}", intake.project.id);
    println!("Idea ID: {}", intake.idea.id);
    println!("Stage: {}", intake.project.stage);
    eprintln!("\nNext: conductor trigger feasibility {}", intake.project.id);
    Ok(())
}

async fn create_project(orchestrator: &Orchestrator) -> Result<()> {
    let project = orchestrator.create_project().await?;

    println!("Project ID: {}", project.id);
    println!("Stage: {}", project.stage);
    eprintln!("\nNext: conductor idea --project {} \"<idea text>\"", project.id);
    Ok(())
}

async fn add_idea(orchestrator: &Orchestrator, project_id: &str, content: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let idea = orchestrator.add_idea(project_id, content).await?;

    println!("Project ID: {}", idea.project_id);
    println!("Idea ID: {}", idea.id);
    Ok(())
}

async fn trigger(orchestrator: &Orchestrator, stage: StageName, project_id: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let receipt = orchestrator.trigger_stage(stage, project_id).await?;

    println!("Job ID: {}", receipt.job_id);
    println!("Status: {}", receipt.status);
    if !receipt.newly_enqueued {
        eprintln!("(job already existed)");
    }
    Ok(())
}

async fn show_status(orchestrator: &Orchestrator, project_id: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let status = orchestrator.project_status(project_id).await?;

    println!("Project ID: {}", status.project_id);
    println!("State: {}", status.state);
    println!("Stage: {}", status.stage);
    if let Some(decision) = status.decision {
        println!("Decision: {}", decision);
    }
    Ok(())
}

async fn list_artifacts(orchestrator: &Orchestrator, project_id: &str, full: bool) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let artifacts = orchestrator.list_artifacts(project_id).await?;

    if artifacts.is_empty() {
        println!("No artifacts found");
        return Ok(());
    }

    println!("{:<38} {:<12} {:<25} {:<16}", "ARTIFACT ID", "STAGE", "TYPE", "HASH");
    println!("{}", "-".repeat(94));
    for artifact in &artifacts {
        println!(
            "{:<38} {:<12} {:<25} {:<16}",
            artifact.id, artifact.stage, artifact.artifact_type, artifact.content_hash
        );
    }

    if full {
        for artifact in &artifacts {
            println!("\n═══ {} ═══\n", artifact.artifact_type.as_str().to_uppercase());
            match artifact.text() {
                Some(text) => println!("{}", text),
                None => println!("{}", serde_json::to_string_pretty(&artifact.content)?),
            }
        }
    } else {
        println!("\nUse --full to show artifact contents");
    }
    Ok(())
}

async fn list_runs(orchestrator: &Orchestrator, project_id: &str) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let runs = orchestrator.list_runs(project_id).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<10} {:>10}", "RUN ID", "STEP", "STATUS", "DURATION");
    println!("{}", "-".repeat(71));
    for run in runs {
        println!(
            "{:<38} {:<10} {:<10} {:>8}ms",
            run.id,
            run.step,
            run.status,
            run.duration_ms()
        );
        if let Some(error) = &run.error {
            println!("    error: {}", error);
        }
    }
    Ok(())
}

async fn list_projects(orchestrator: &Orchestrator) -> Result<()> {
    let projects = orchestrator.list_projects().await?;

    if projects.is_empty() {
        println!("No projects found");
        return Ok(());
    }

    println!("{:<38} {:<10} {:<22} {}", "PROJECT ID", "STATE", "STAGE", "UPDATED");
    println!("{}", "-".repeat(100));
    for project in projects {
        println!(
            "{:<38} {:<10} {:<22} {}",
            project.id,
            project.state,
            project.stage,
            project.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn decide(
    orchestrator: &Orchestrator,
    project_id: &str,
    outcome: DecisionOutcome,
    rationale: Option<String>,
) -> Result<()> {
    let project_id = parse_project_id(project_id)?;
    let decision = orchestrator
        .record_decision(project_id, outcome, rationale)
        .await?;

    println!("Decision: {} at {}", decision.outcome, decision.stage);
    let status = orchestrator.project_status(project_id).await?;
    println!("State: {}", status.state);
    Ok(())
}

async fn work(orchestrator: Arc<Orchestrator>, cfg: &ResolvedConfig, once: bool) -> Result<()> {
    let pool = WorkerPool::new(orchestrator, cfg.poll_interval());
    let recovered = pool.recover_stalled().await?;
    if recovered > 0 {
        eprintln!("Requeued {} stalled job(s)", recovered);
    }

    if once {
        let report = pool.run_until_idle().await?;
        println!(
            "Processed {} job(s): {} completed, {} skipped, {} retried, {} failed",
            report.total(),
            report.completed,
            report.skipped,
            report.retried,
            report.failed
        );
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.spawn(shutdown_rx);
    eprintln!("Workers running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    eprintln!("\nShutting down, waiting for in-flight jobs...");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        handle.await.context("Worker task panicked")?;
    }
    Ok(())
}

async fn show_stats(orchestrator: &Orchestrator) -> Result<()> {
    let run_log = orchestrator
        .run_log()
        .context("No run log configured")?;
    let summary = run_log.summary().await?;
    let queue = orchestrator.queue_status().await?;

    println!("=== CONDUCTOR RUN SUMMARY ===");
    println!("Total Runs: {}", summary.total_runs);
    println!("Failed Runs: {}", summary.failed_runs);
    println!("Total Tokens: {}", summary.total_tokens);
    println!("Avg Tokens/Run: {}", summary.avg_tokens_per_run);
    println!("Avg Duration: {}ms", summary.avg_duration_ms);

    if !summary.by_stage.is_empty() {
        println!("\nBy Stage:");
        for (stage, stats) in &summary.by_stage {
            println!(
                "  {}: {} runs, {} failed, {} fallbacks, {} tokens",
                stage, stats.count, stats.failed, stats.fallbacks, stats.tokens
            );
        }
    }

    if !summary.by_verdict.is_empty() {
        println!("\nBy Verdict:");
        for (verdict, stats) in &summary.by_verdict {
            println!(
                "  {}: {} runs, avg confidence: {:.2}",
                verdict, stats.count, stats.avg_confidence
            );
        }
    }

    println!(
        "\nQueue: {} queued, {} active, {} completed, {} failed",
        queue.queued, queue.active, queue.completed, queue.failed
    );
    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!("  Queue:    {}", cfg.queue_path().display());
    println!("  Run log:  {}", cfg.run_log_path().display());
    println!();
    println!("Generation:");
    println!("  Provider:   {:?}", cfg.generation.provider);
    println!("  Model:      {}", cfg.generation.model);
    println!("  Max tokens: {}", cfg.generation.max_tokens);
    println!("  Timeout:    {}s", cfg.generation.timeout_seconds);
    println!(
        "  API key:    {}",
        if cfg.generation.api_key.is_some() { "set" } else { "not set" }
    );
    println!();
    println!("Stages:");
    for stage in StageName::ALL {
        let policy = cfg.stages.get(stage);
        println!(
            "  {:<12} attempts={} base_delay={}ms concurrency={} timeout={}s",
            stage.as_str(),
            policy.retry.max_attempts,
            policy.retry.base_delay_ms,
            policy.concurrency,
            policy.job_timeout_seconds
        );
    }
    Ok(())
}
