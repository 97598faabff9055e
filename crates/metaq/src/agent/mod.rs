pub mod config;
pub mod context;
pub mod cycle;
pub mod process;
mod stageout;
pub mod transition;

pub type AgentResult<T> = anyhow::Result<T>;

pub use context::AgentContext;
pub use cycle::{AgentOptions, CycleSummary, run_agent, run_cycle};
