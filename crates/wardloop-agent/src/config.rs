//! Tunables for one `run_agent_loop` invocation that are not resolved through
//! the model registry (SPEC_FULL.md §4.F step 1-2, §4.C sampling profiles).

use wardloop_core::SandboxExecOptions;

/// Worker system prompt shipped with the crate (§4.F step 2, §6.7).
pub const DEFAULT_WORKER_SYSTEM_PROMPT: &str =
    include_str!("../resources/worker_system_prompt.txt");

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    /// Maximum pipes a worker-proposed command may contain (§4.A).
    pub max_pipes: usize,
    /// Hard cap on the worker reply's estimated token length (§4.B, §4.C).
    pub worker_max_response_tokens: u32,
    /// Whether to inject the think-bypass assistant primer on worker calls.
    pub worker_disable_thinking_hack: bool,
    /// Whether to inject the think-bypass assistant primer on main-model calls.
    pub main_disable_thinking_hack: bool,
    /// Retry budget for a structured-output repair loop before giving up.
    pub structured_retry_limit: u32,
    /// System prompt text handed to the worker model (§6.7).
    pub worker_system_prompt: String,
    /// Sandbox executor configuration forwarded untouched to the external runner (§6.2).
    pub sandbox: SandboxExecOptions,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            max_pipes: 1,
            worker_max_response_tokens: 600,
            worker_disable_thinking_hack: true,
            main_disable_thinking_hack: true,
            structured_retry_limit: 2,
            worker_system_prompt: DEFAULT_WORKER_SYSTEM_PROMPT.to_string(),
            sandbox: SandboxExecOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_worker_system_prompt_is_not_empty() {
        assert!(!DEFAULT_WORKER_SYSTEM_PROMPT.trim().is_empty());
        assert!(DEFAULT_WORKER_SYSTEM_PROMPT.contains("call_tool"));
    }

    #[test]
    fn default_config_uses_the_shipped_worker_prompt() {
        let config = AgentLoopConfig::default();
        assert_eq!(config.worker_system_prompt, DEFAULT_WORKER_SYSTEM_PROMPT);
        assert_eq!(config.max_pipes, 1);
    }
}
