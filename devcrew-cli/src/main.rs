//! devcrew: run a team of AI developer agents on a project description.
//!
//!   devcrew "A todo list web app with a Flask API"
//!   devcrew --roster generalists --developers 4 --template api "..."
//!
//! Requires ANTHROPIC_API_KEY environment variable (or --api-key).

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use devcrew_cli::args::Args;
use devcrew_cli::output;
use devcrew_cli::workspace::Workspace;
use devcrew_engine::{AnthropicProvider, EngineEvent, Orchestrator, Provider};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let description = args.project_description()?;
    let config = args.engine_config(|key| std::env::var(key).ok())?;
    let mut provider = AnthropicProvider::new(args.api_key.clone()).with_model(&config.model);
    if let Some(url) = &args.base_url {
        provider = provider.with_base_url(url);
    }

    tracing::info!(
        model = %config.model,
        roster = ?args.roster,
        ceiling = config.max_concurrent_requests,
        out = %args.out.display(),
        "Starting devcrew"
    );

    let engine = Orchestrator::builder(config, provider)
        .roster(args.roster())
        .build()
        .context("Failed to assemble the agent team")?;
    let mut events = engine.subscribe();
    engine
        .start_project(&description)
        .context("Failed to start project")?;

    let done = engine.wait();
    tokio::pin!(done);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let status = loop {
        tokio::select! {
            status = &mut done => break status?,
            event = events.recv() => match event {
                Ok(event) => print_event(&engine, &event, args.json_logs),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event stream lagged"),
                Err(RecvError::Closed) => break engine.wait().await?,
            },
            _ = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                tracing::warn!("Interrupted, stopping project");
                engine.stop()?;
            }
        }
    };
    loop {
        match events.try_recv() {
            Ok(event) => print_event(&engine, &event, args.json_logs),
            Err(TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }

    let files = engine.files();
    let workspace = Workspace::create(&args.out, &description).await?;
    let written = workspace.write_manifest(&files).await?;
    let counts = engine.queue_counts();
    let snapshot = engine.snapshot();
    let summary = serde_json::json!({
        "description": description,
        "status": status,
        "tasks": counts,
        "files": files.keys().collect::<Vec<_>>(),
        "monitor": snapshot,
        "health": snapshot.health(),
        "agents": engine.agents(),
    });
    workspace.write_summary(&summary).await?;

    println!();
    for line in output::summary(&counts, &snapshot, written.len()) {
        println!("{line}");
    }
    println!("Output: {}", workspace.root.display());

    if !matches!(status, devcrew_engine::ProjectStatus::Completed) {
        anyhow::bail!("Project {status}");
    }
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "devcrew=info,devcrew_cli=info,devcrew_engine=info".into());
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_event<P: Provider>(engine: &Orchestrator<P>, event: &EngineEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!("Unserialisable event: {e}"),
        }
        return;
    }
    if let Some(line) = output::render(event, |id| engine.task(id).map(|t| t.description)) {
        println!("{line}");
    }
}
