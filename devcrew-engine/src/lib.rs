//! Multi-agent task orchestration engine.
//!
//! A project description goes to a manager agent, whose plan becomes a
//! dependency-ordered task graph. The orchestrator matches ready tasks to
//! idle agents, bounds concurrent provider calls, retries transient failures
//! with backoff, caches repeated calls, and collects the generated files.
//!
//! ```no_run
//! use devcrew_engine::{AnthropicProvider, EngineConfig, Orchestrator, Roster};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let provider = AnthropicProvider::new("sk-...").with_model(&config.model);
//! let engine = Orchestrator::builder(config, provider)
//!     .roster(Roster::generalists(3))
//!     .build()?;
//! engine.start_project("A todo list web app with a Flask API")?;
//! let status = engine.wait().await?;
//! println!("{status}: {} files", engine.files().len());
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod extract;
pub mod gate;
pub mod ids;
pub mod monitor;
pub mod orchestrator;
pub mod plan;
pub mod project;
pub mod provider;
pub mod queue;
pub mod retry;
pub mod review;
pub mod role;
pub mod roster;
pub mod task;

pub use agent::{Agent, AgentStatus, AgentView};
pub use config::{EngineConfig, FailurePolicy};
pub use error::{DispatchError, EngineError, ProviderError, QueueError};
pub use events::EngineEvent;
pub use ids::{AgentId, ProjectId, TaskId};
pub use monitor::{MonitorSnapshot, PerformanceMonitor};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use project::{Message, Project, ProjectPlan, ProjectStatus};
pub use provider::{AnthropicProvider, GenerateRequest, Provider};
pub use queue::{QueueCounts, TaskQueue};
pub use role::Role;
pub use roster::Roster;
pub use task::{Task, TaskKind, TaskSpec, TaskStatus};
