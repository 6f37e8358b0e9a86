//! Agent loop crate: stage handlers, the loop orchestrator, structured-output
//! parsing/repair, context compaction, the LLM call wrapper, and the sandbox
//! executor that backs a worker's `call_tool` action.

pub mod compaction;
pub mod config;
pub mod events;
pub mod llm_call;
pub mod orchestrator;
pub mod parser;
pub mod prompts;
pub mod sandbox;
pub mod stages;

pub use compaction::{handle_context_compaction, CompactionPlan};
pub use config::AgentLoopConfig;
pub use events::EventSink;
pub use orchestrator::{run_agent_loop, AgentLoopDeps, AgentLoopOptions, RunSummary};
pub use sandbox::{CompositeSandboxExecutor, DockerSandboxExecutor, LocalSandboxExecutor, SandboxExecutor};
pub use stages::LoopDeps;
