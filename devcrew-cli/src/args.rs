//! Command-line arguments and configuration layering.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use devcrew_engine::{EngineConfig, Roster};

use crate::template::Template;

const MIN_DESCRIPTION: usize = 10;
const MAX_DESCRIPTION: usize = 5000;

#[derive(Parser, Debug)]
#[command(
    name = "devcrew",
    version,
    about = "Run a team of AI developer agents against a project description"
)]
pub struct Args {
    /// What to build, in plain language
    pub description: String,

    /// TOML config file; environment variables and flags override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Anthropic API key (or set ANTHROPIC_API_KEY env var)
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub api_key: String,

    /// Claude model to use
    #[arg(long)]
    pub model: Option<String>,

    /// Messages API endpoint, for proxies and gateways
    #[arg(long, env = "ANTHROPIC_BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long)]
    pub max_concurrent_requests: Option<usize>,

    /// Seconds per provider call
    #[arg(long)]
    pub request_timeout: Option<u64>,

    #[arg(long)]
    pub max_task_retries: Option<u32>,

    #[arg(long)]
    pub max_agents: Option<usize>,

    /// Response cache TTL in seconds
    #[arg(long)]
    pub cache_timeout: Option<u64>,

    /// Team layout
    #[arg(long, value_enum, default_value_t = RosterKind::Specialists)]
    pub roster: RosterKind,

    /// Number of developers for the generalists roster
    #[arg(long, default_value_t = 3)]
    pub developers: usize,

    /// Add technology hints from a project template
    #[arg(long, value_enum)]
    pub template: Option<Template>,

    /// Directory the generated files are written under
    #[arg(long, default_value = "devcrew-out")]
    pub out: PathBuf,

    /// Emit logs and events as JSON lines
    #[arg(long)]
    pub json_logs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RosterKind {
    /// A lead plus frontend, backend, and devops specialists
    Specialists,
    /// A lead plus N full-stack developers
    Generalists,
}

impl Args {
    /// File, then environment, then flags.
    pub fn engine_config(&self, env: impl Fn(&str) -> Option<String>) -> Result<EngineConfig> {
        let base = match &self.config {
            Some(path) => EngineConfig::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => EngineConfig::default(),
        };
        let mut config = base.with_vars(env).context("Invalid environment configuration")?;

        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(v) = self.max_concurrent_requests {
            config.max_concurrent_requests = v;
        }
        if let Some(v) = self.request_timeout {
            config.request_timeout_secs = v;
        }
        if let Some(v) = self.max_task_retries {
            config.max_task_retries = v;
        }
        if let Some(v) = self.max_agents {
            config.max_agents = v;
        }
        if let Some(v) = self.cache_timeout {
            config.cache_timeout_secs = v;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    pub fn roster(&self) -> Roster {
        match self.roster {
            RosterKind::Specialists => Roster::specialists(),
            RosterKind::Generalists => Roster::generalists(self.developers),
        }
    }

    /// The validated description with template hints applied.
    pub fn project_description(&self) -> Result<String> {
        let description = validate_description(&self.description)?;
        Ok(match self.template {
            Some(template) => template.apply(&description),
            None => description,
        })
    }
}

/// Reject descriptions outside 10..=5000 characters after trimming.
pub fn validate_description(description: &str) -> Result<String> {
    let trimmed = description.trim();
    let len = trimmed.chars().count();
    if len < MIN_DESCRIPTION {
        anyhow::bail!("Project description must be at least {MIN_DESCRIPTION} characters");
    }
    if len > MAX_DESCRIPTION {
        anyhow::bail!("Project description must be at most {MAX_DESCRIPTION} characters");
    }
    Ok(trimmed.to_string())
}
