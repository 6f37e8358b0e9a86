use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = anyhow::Result<T>;

/// Default context window assumed when a model declares none.
pub const DEFAULT_CONTEXT_LENGTH: u64 = 8192;
pub const CONTEXT_TRIGGER_RATIO: f64 = 0.85;
pub const CONTEXT_TARGET_RATIO: f64 = 0.55;
pub const COMPACTION_MIN_MESSAGES: usize = 24;
pub const COMPACTION_MAX_RECENT: usize = 24;
pub const COMPACTION_MIN_RECENT: usize = 6;
pub const COMPACTION_CLIP_CHARS: usize = 700;
pub const COMPACTION_MARKER: &str = "[SESSION_COMPACTION]";
pub const MAX_EVIDENCE_ITEMS: usize = 12;
pub const MAX_TOOL_OUTPUT_CHARS: usize = 12_000;

pub fn runtime_dir(workspace: &Path) -> PathBuf {
    workspace.join(".wardloop")
}

/// A single message in a chat session. Role is fixed to the three the loop ever emits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: content.into() }
    }

    /// Token estimate used by the context guard: `ceil(len/4) + 6` for per-message overhead.
    pub fn estimated_tokens(&self) -> u64 {
        let chars = self.content.chars().count() as u64;
        chars.div_ceil(4) + 6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

impl ChatSession {
    pub fn new(id: impl Into<String>, system_prompt: Option<&str>) -> Self {
        let now = Utc::now();
        let messages = match system_prompt {
            Some(p) if !p.is_empty() => vec![ChatMessage::system(p)],
            _ => Vec::new(),
        };
        Self { id: id.into(), created_at: now, updated_at: now, messages }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }

    /// Sum of `ChatMessage::estimated_tokens` over the whole session.
    pub fn estimated_tokens(&self) -> u64 {
        self.messages.iter().map(ChatMessage::estimated_tokens).sum()
    }
}

/// One resolved model endpoint, after registry lookup and override application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedModel {
    pub id: String,
    pub provider: String,
    pub endpoint: String,
    #[serde(default)]
    pub credential: Option<String>,
    pub model_name: String,
    #[serde(default)]
    pub context_length: Option<u64>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub extra_params: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    MainWorker,
    SingleMain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAgentConfig {
    pub mode: AgentMode,
    pub max_steps: u32,
    pub stream: bool,
    pub main: ResolvedModel,
    pub worker: ResolvedModel,
}

pub fn resolve_context_limit_tokens(config: &ResolvedAgentConfig) -> u64 {
    let main = config.main.context_length.unwrap_or(DEFAULT_CONTEXT_LENGTH);
    let worker = config.worker.context_length.unwrap_or(DEFAULT_CONTEXT_LENGTH);
    main.min(worker)
}

// ---------------------------------------------------------------------------
// Worker / main protocol shapes (§3, §6.7, §6.8)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WorkerAction {
    CallTool { tool: String, args: ToolArgs, reason: String },
    Ask { question: String },
    Finalize {},
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolArgs {
    pub cmd: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MainDecisionKind {
    Finalize,
    Continue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MainDecision {
    pub decision: Option<MainDecisionKind>,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub guidance: Option<String>,
    #[serde(default)]
    pub summary_evidence: Vec<String>,
    #[serde(default)]
    pub needed_evidence: Vec<String>,
    #[serde(default)]
    pub forced_synthesis_enable_think: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningNext {
    CollectEvidence,
    MainDecision,
    FinalReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningResult {
    pub next: PlanningNext,
    pub reason: String,
    #[serde(default)]
    pub evidence_goals: Vec<String>,
    #[serde(default)]
    pub guidance: Option<String>,
    #[serde(default)]
    pub answer_hint: Option<String>,
}

// ---------------------------------------------------------------------------
// Tool execution (§3, §6.2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRunner {
    Local,
    Docker,
}

impl std::fmt::Display for SandboxRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxRunner::Local => write!(f, "local"),
            SandboxRunner::Docker => write!(f, "docker"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub cmd: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub runner: SandboxRunner,
    pub workspace_group_id: String,
}

pub fn clip_tool_output(text: &str) -> String {
    clip_chars(text, MAX_TOOL_OUTPUT_CHARS, "\n... [truncated]")
}

fn clip_chars(text: &str, max_chars: usize, marker: &str) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str(marker);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxMode {
    Local,
    Docker,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxExecOptions {
    pub mode: SandboxMode,
    pub timeout_ms: u64,
    pub max_buffer_bytes: usize,
    pub shell_path: String,
    #[serde(default)]
    pub docker_shell_path: Option<String>,
    #[serde(default)]
    pub docker_image: String,
    #[serde(default)]
    pub docker_workspace_root: String,
    #[serde(default)]
    pub docker_container_prefix: String,
    #[serde(default)]
    pub docker_network: String,
    #[serde(default)]
    pub docker_memory: String,
    #[serde(default)]
    pub docker_cpus: String,
    #[serde(default)]
    pub docker_pids_limit: u32,
    #[serde(default)]
    pub docker_required_tools: Vec<String>,
    #[serde(default)]
    pub docker_workspace_init_command: Option<String>,
}

impl Default for SandboxExecOptions {
    fn default() -> Self {
        Self {
            mode: SandboxMode::Local,
            timeout_ms: 30_000,
            max_buffer_bytes: 1_048_576,
            shell_path: "/bin/sh".to_string(),
            docker_shell_path: None,
            docker_image: "alpine:3".to_string(),
            docker_workspace_root: "/workspace".to_string(),
            docker_container_prefix: "wardloop".to_string(),
            docker_network: "none".to_string(),
            docker_memory: "512m".to_string(),
            docker_cpus: "1".to_string(),
            docker_pids_limit: 256,
            docker_required_tools: Vec::new(),
            docker_workspace_init_command: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Evidence & runtime (§3, §4.I)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    ToolResult,
    UserAnswer,
    MainGuidance,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub kind: EvidenceKind,
    pub summary: String,
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopState {
    PlanIntent,
    ContextGuard,
    AcquireEvidence,
    AssessSufficiency,
    ForcedSynthesis,
    Done,
}

#[derive(Debug, Clone)]
pub struct LoopRuntime {
    pub planning: Option<PlanningResult>,
    pub evidence: Vec<EvidenceItem>,
    pub guidance: String,
    pub recent_user_answer: String,
    pub last_tool: Option<ToolResult>,
    pub final_answer: String,
    pub step: u32,
    pub steps: u32,
    pub resume_state_after_compaction: LoopState,
    pub last_compaction_signature: Option<String>,
    pub forced_synthesis_enable_think: Option<bool>,
    pub forced_synthesis_reason: Option<String>,
}

impl LoopRuntime {
    pub fn new() -> Self {
        Self {
            planning: None,
            evidence: Vec::new(),
            guidance: String::new(),
            recent_user_answer: String::new(),
            last_tool: None,
            final_answer: String::new(),
            step: 1,
            steps: 0,
            resume_state_after_compaction: LoopState::PlanIntent,
            last_compaction_signature: None,
            forced_synthesis_enable_think: None,
            forced_synthesis_reason: None,
        }
    }

    /// Push an evidence item. The dedup-by-(kind, summary) cap is enforced only at
    /// summarization time (`summarize_evidence_for_main`), not on insertion: the
    /// accumulator itself is append-only so a full audit trail survives for logging.
    pub fn push_evidence(&mut self, item: EvidenceItem) {
        self.evidence.push(item);
    }
}

impl Default for LoopRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Deduplicate by `(kind, summary)`, keep insertion order, cap at `MAX_EVIDENCE_ITEMS`.
pub fn summarize_evidence_for_main(items: &[EvidenceItem]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for item in items {
        let key = (item.kind, item.summary.clone());
        if !seen.insert(key) {
            continue;
        }
        out.push(format!("[{}] {}", evidence_kind_label(item.kind), item.summary));
        if out.len() >= MAX_EVIDENCE_ITEMS {
            break;
        }
    }
    out
}

fn evidence_kind_label(kind: EvidenceKind) -> &'static str {
    match kind {
        EvidenceKind::ToolResult => "tool_result",
        EvidenceKind::UserAnswer => "user_answer",
        EvidenceKind::MainGuidance => "main_guidance",
    }
}

// ---------------------------------------------------------------------------
// Events (§6.5)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq_no: u64,
    pub at: DateTime<Utc>,
    pub session_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum EventKind {
    Start { agent_id: String, mode: AgentMode, goal: String },
    LoopState { state: LoopState, step: u32, evidence_count: usize, summary: Option<String> },
    PlanningStart { goal: String },
    PlanningResult { next: PlanningNext, reason: String, evidence_goals: Vec<String>, guidance: Option<String> },
    CompactionStart { estimated_tokens: u64, trigger_tokens: u64, target_tokens: u64, context_limit_tokens: u64, message_count: usize },
    CompactionComplete { before_tokens: u64, after_tokens: u64, before_messages: usize, after_messages: usize },
    WorkerStart { step: u32 },
    WorkerToken { step: u32, token: String },
    WorkerAction { step: u32, action: String, detail: String },
    ToolStart { step: u32, cmd: String },
    ToolResult { step: u32, exit_code: i32, stdout: String, stderr: String, runner: SandboxRunner, workspace_group_id: String },
    Ask { step: u32, question: String },
    AskAnswer { step: u32, answer: String },
    MainStart { phase: String, evidence_count: usize },
    MainToken { phase: String, token: String },
    MainDecision { phase: String, decision: String, guidance: Option<String> },
    FinalAnswer { answer: String },
    Complete { steps: u32, evidence_count: usize },
}

// ---------------------------------------------------------------------------
// Errors (§7, §3.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    ProviderError(String),
    #[error("structured validation error: {0}")]
    StructuredValidationError(String),
    #[error("policy violation: {reason}")]
    PolicyViolation { reason: String },
    #[error("config error: {0}")]
    ConfigError(String),
    #[error("store error: {0}")]
    StoreError(String),
    #[error("cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Model registry (§6.4, §1.1)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRegistry {
    #[serde(default)]
    pub agents: BTreeMap<String, AgentRouteSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRouteSpec {
    pub mode: AgentMode,
    pub max_steps: u32,
    #[serde(default = "default_true")]
    pub stream: bool,
    pub main: ResolvedModel,
    pub worker: ResolvedModel,
}

fn default_true() -> bool {
    true
}

/// Caller-supplied overrides applied on top of a registry entry. `None` keeps the
/// registry's value; there is no merge at the field level beyond that.
#[derive(Debug, Clone, Default)]
pub struct AgentRouteOverride {
    pub mode: Option<AgentMode>,
    pub max_steps: Option<u32>,
    pub stream: Option<bool>,
}

impl ModelRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let registry: ModelRegistry = toml::from_str(&raw)?;
        Ok(registry)
    }

    pub fn ensure(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(registry) if path.exists() => Ok(registry),
            _ => {
                let registry = Self::default();
                registry.save(path)?;
                Ok(registry)
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = toml::to_string_pretty(self)?;
        fs::write(path, raw)?;
        Ok(())
    }

    pub fn route_agent(
        &self,
        agent_id: &str,
        overrides: &AgentRouteOverride,
    ) -> std::result::Result<ResolvedAgentConfig, AgentError> {
        let spec = self
            .agents
            .get(agent_id)
            .ok_or_else(|| AgentError::ConfigError(format!("unknown agent id: {agent_id}")))?;
        Ok(ResolvedAgentConfig {
            mode: overrides.mode.unwrap_or(spec.mode),
            max_steps: overrides.max_steps.unwrap_or(spec.max_steps),
            stream: overrides.stream.unwrap_or(spec.stream),
            main: spec.main.clone(),
            worker: spec.worker.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { enabled: false, endpoint: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_token_estimate_matches_formula() {
        let msg = ChatMessage::user("a".repeat(10));
        assert_eq!(msg.estimated_tokens(), 10_u64.div_ceil(4) + 6);
    }

    #[test]
    fn summarize_evidence_dedups_and_caps() {
        let mut items = Vec::new();
        for i in 0..20 {
            items.push(EvidenceItem {
                kind: EvidenceKind::ToolResult,
                summary: format!("result {}", i % 5),
                detail: None,
            });
        }
        let summary = summarize_evidence_for_main(&items);
        assert_eq!(summary.len(), 5);
        assert!(summary[0].starts_with("[tool_result] "));
    }

    #[test]
    fn evidence_cap_enforced_even_with_all_unique() {
        let items: Vec<EvidenceItem> = (0..30)
            .map(|i| EvidenceItem {
                kind: EvidenceKind::MainGuidance,
                summary: format!("unique {i}"),
                detail: None,
            })
            .collect();
        assert_eq!(summarize_evidence_for_main(&items).len(), MAX_EVIDENCE_ITEMS);
    }

    #[test]
    fn route_agent_applies_overrides_field_by_field() {
        let mut registry = ModelRegistry::default();
        let model = ResolvedModel {
            id: "m".into(),
            provider: "local".into(),
            endpoint: "http://localhost:8080".into(),
            credential: None,
            model_name: "test-model".into(),
            context_length: Some(4096),
            temperature: None,
            max_tokens: None,
            extra_params: BTreeMap::new(),
        };
        registry.agents.insert(
            "demo".into(),
            AgentRouteSpec {
                mode: AgentMode::MainWorker,
                max_steps: 8,
                stream: true,
                main: model.clone(),
                worker: model,
            },
        );
        let overrides = AgentRouteOverride { max_steps: Some(3), ..Default::default() };
        let resolved = registry.route_agent("demo", &overrides).unwrap();
        assert_eq!(resolved.max_steps, 3);
        assert_eq!(resolved.mode, AgentMode::MainWorker);
    }

    #[test]
    fn route_agent_unknown_id_is_config_error() {
        let registry = ModelRegistry::default();
        let err = registry.route_agent("missing", &AgentRouteOverride::default());
        assert!(matches!(err, Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn clip_tool_output_truncates_long_text() {
        let long = "x".repeat(MAX_TOOL_OUTPUT_CHARS + 100);
        let clipped = clip_tool_output(&long);
        assert!(clipped.len() < long.len());
        assert!(clipped.ends_with("[truncated]"));
    }
}
