//! Loop Orchestrator (SPEC_FULL.md §4.F, §6.6): resolves the agent's route,
//! seeds the runtime, and drives the `LoopState` dispatch loop until `Done`,
//! pre-empting every non-`ContextGuard` dispatch with a compaction check.

use chrono::Utc;
use wardloop_core::{
    resolve_context_limit_tokens, AgentError, AgentMode, AgentRouteOverride, ChatMessage, ChatSession, EventEnvelope,
    EventKind, LoopRuntime, LoopState, ModelRegistry, ResolvedModel,
};
use wardloop_llm::ChatCompletionAdapter;
use wardloop_observe::Observer;
use wardloop_store::SessionStore;

use crate::compaction;
use crate::config::AgentLoopConfig;
use crate::events::EventSink;
use crate::sandbox::SandboxExecutor;
use crate::stages::{self, LoopDeps};

/// External collaborators a run needs; bundled so `run_agent_loop`'s own
/// signature does not grow a parameter every time a new interface is consumed.
pub struct AgentLoopDeps<'a> {
    pub adapter: &'a dyn ChatCompletionAdapter,
    pub sandbox: &'a dyn SandboxExecutor,
    pub store: &'a dyn SessionStore,
    pub observer: Option<&'a Observer>,
    pub registry: &'a ModelRegistry,
    pub config: &'a AgentLoopConfig,
}

/// Per-run caller options (§6.6).
#[derive(Default)]
pub struct AgentLoopOptions<'a> {
    pub mode_override: Option<AgentMode>,
    pub max_steps_override: Option<u32>,
    pub stream_override: Option<bool>,
    pub workspace_group_id: Option<String>,
    pub on_event: Option<&'a mut dyn FnMut(&EventEnvelope)>,
    pub ask_user: Option<&'a mut dyn FnMut(&str) -> Result<String, AgentError>>,
}

/// Run summary returned to the caller (§6.6).
pub struct RunSummary {
    pub agent_id: String,
    pub mode: AgentMode,
    pub max_steps: u32,
    pub stream: bool,
    pub summary: String,
    pub evidence: Vec<String>,
    pub steps: u32,
    pub worker_model: ResolvedModel,
    pub main_model: ResolvedModel,
}

pub fn run_agent_loop(
    deps: &mut AgentLoopDeps<'_>,
    session: &mut ChatSession,
    goal: &str,
    agent_id: &str,
    options: AgentLoopOptions<'_>,
) -> Result<RunSummary, AgentError> {
    let overrides = AgentRouteOverride {
        mode: options.mode_override,
        max_steps: options.max_steps_override,
        stream: options.stream_override,
    };
    let resolved = deps.registry.route_agent(agent_id, &overrides)?;
    let context_limit_tokens = resolve_context_limit_tokens(&resolved);

    let workspace_group_id = options
        .workspace_group_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(session.id.as_str())
        .to_string();

    let mut runtime = LoopRuntime::new();
    let mut sink = EventSink::new(session.id.clone(), options.on_event, deps.observer);

    sink.publish(EventKind::Start { agent_id: agent_id.to_string(), mode: resolved.mode, goal: goal.to_string() });
    session.push(ChatMessage::user(format!("[AGENT_GOAL:{agent_id}] {goal}")));
    session.updated_at = Utc::now();
    deps.store.save(session).map_err(|e| AgentError::StoreError(e.to_string()))?;

    let mut loop_deps = LoopDeps {
        adapter: deps.adapter,
        sandbox: deps.sandbox,
        store: deps.store,
        config: deps.config,
        main_model: resolved.main.clone(),
        worker_model: resolved.worker.clone(),
        max_steps: resolved.max_steps,
        workspace_group_id,
        ask_user: options.ask_user,
    };

    let mut state = LoopState::PlanIntent;
    loop {
        if state != LoopState::ContextGuard {
            let plan = compaction::compute_compaction_plan(session, context_limit_tokens);
            let signature_changed = Some(plan.signature.clone()) != runtime.last_compaction_signature;
            if plan.should_compact && signature_changed {
                runtime.resume_state_after_compaction = state;
                state = LoopState::ContextGuard;
                continue;
            }
        }

        state = match state {
            LoopState::PlanIntent => {
                stages::handle_plan_intent(&mut loop_deps, &mut sink, goal, session, &mut runtime)?
            }
            LoopState::ContextGuard => compaction::handle_context_compaction(
                loop_deps.store,
                &mut sink,
                goal,
                session,
                &mut runtime,
                context_limit_tokens,
            )?,
            LoopState::AcquireEvidence => {
                stages::handle_acquire_evidence(&mut loop_deps, &mut sink, goal, session, &mut runtime)?
            }
            LoopState::AssessSufficiency => {
                stages::handle_assess_sufficiency(&mut loop_deps, &mut sink, goal, session, &mut runtime)?
            }
            LoopState::ForcedSynthesis => {
                stages::handle_forced_synthesis(&mut loop_deps, &mut sink, goal, session, &mut runtime)?
            }
            LoopState::Done => break,
        };
    }

    session.push(ChatMessage::assistant(runtime.final_answer.clone()));
    session.updated_at = Utc::now();
    deps.store.save(session).map_err(|e| AgentError::StoreError(e.to_string()))?;

    sink.publish(EventKind::Complete { steps: runtime.steps, evidence_count: runtime.evidence.len() });

    Ok(RunSummary {
        agent_id: agent_id.to_string(),
        mode: resolved.mode,
        max_steps: resolved.max_steps,
        stream: resolved.stream,
        summary: runtime.final_answer.clone(),
        evidence: runtime.evidence.iter().map(|item| item.summary.clone()).collect(),
        steps: runtime.steps,
        worker_model: resolved.worker,
        main_model: resolved.main,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::LocalSandboxExecutor;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use wardloop_core::{AgentRouteSpec, ChatRole};
    use wardloop_llm::{CompletionRequest, CompletionResponse};

    struct ScriptedAdapter {
        replies: RefCell<Vec<String>>,
    }

    impl ScriptedAdapter {
        fn new(replies: Vec<&str>) -> Self {
            Self { replies: RefCell::new(replies.into_iter().map(String::from).collect()) }
        }
    }

    impl ChatCompletionAdapter for ScriptedAdapter {
        fn complete(&self, _req: &CompletionRequest) -> Result<CompletionResponse, AgentError> {
            let content = self.replies.borrow_mut().remove(0);
            Ok(CompletionResponse { content, raw: serde_json::json!({}) })
        }

        fn stream(
            &self,
            _req: &CompletionRequest,
            on_token: &mut wardloop_llm::TokenCallback<'_>,
        ) -> Result<CompletionResponse, AgentError> {
            let content = self.replies.borrow_mut().remove(0);
            on_token(&content);
            Ok(CompletionResponse { content, raw: serde_json::json!({}) })
        }
    }

    struct InMemoryStore {
        session: RefCell<Option<ChatSession>>,
    }

    impl SessionStore for InMemoryStore {
        fn load_or_create(&self, session_id: &str, system_prompt: Option<&str>) -> anyhow::Result<ChatSession> {
            Ok(ChatSession::new(session_id, system_prompt))
        }
        fn save(&self, session: &ChatSession) -> anyhow::Result<()> {
            *self.session.borrow_mut() = Some(session.clone());
            Ok(())
        }
        fn reset(&self, session_id: &str, system_prompt: Option<&str>) -> anyhow::Result<ChatSession> {
            Ok(ChatSession::new(session_id, system_prompt))
        }
    }

    fn model() -> ResolvedModel {
        ResolvedModel {
            id: "m".into(),
            provider: "local".into(),
            endpoint: "http://localhost:9".into(),
            credential: None,
            model_name: "test".into(),
            context_length: Some(8192),
            temperature: None,
            max_tokens: None,
            extra_params: BTreeMap::new(),
        }
    }

    fn registry_with_one_agent() -> ModelRegistry {
        let mut agents = BTreeMap::new();
        agents.insert(
            "demo".to_string(),
            AgentRouteSpec { mode: AgentMode::MainWorker, max_steps: 5, stream: true, main: model(), worker: model() },
        );
        ModelRegistry { agents }
    }

    #[test]
    fn full_run_reaches_done_via_final_report_planning_branch() {
        let adapter = ScriptedAdapter::new(vec![
            r#"{"next":"final_report","reason":"trivial goal","answer_hint":"quick answer"}"#,
            "The final answer text.",
        ]);
        let sandbox = LocalSandboxExecutor::new(std::env::temp_dir());
        let store = InMemoryStore { session: RefCell::new(None) };
        let config = AgentLoopConfig::default();
        let registry = registry_with_one_agent();
        let mut deps = AgentLoopDeps {
            adapter: &adapter,
            sandbox: &sandbox,
            store: &store,
            observer: None,
            registry: &registry,
            config: &config,
        };
        let mut session = ChatSession::new("s1", Some("base system prompt"));

        let summary =
            run_agent_loop(&mut deps, &mut session, "trivial goal", "demo", AgentLoopOptions::default()).unwrap();

        assert_eq!(summary.summary, "The final answer text.");
        assert!(session.messages.iter().any(|m| m.content.starts_with("[AGENT_GOAL:demo]")));
        assert!(session.messages.iter().any(|m| m.role == ChatRole::Assistant && m.content == "The final answer text."));
    }

    #[test]
    fn full_run_collects_one_tool_call_then_finalizes() {
        let adapter = ScriptedAdapter::new(vec![
            r#"{"next":"collect_evidence","reason":"need a directory listing"}"#,
            r#"{"action":"call_tool","args":{"cmd":"echo hi"},"reason":"probe"}"#,
            r#"{"action":"finalize"}"#,
            r#"{"decision":"finalize","answer":"draft"}"#,
            "Final polished answer.",
        ]);
        let sandbox = LocalSandboxExecutor::new(std::env::temp_dir());
        let store = InMemoryStore { session: RefCell::new(None) };
        let config = AgentLoopConfig::default();
        let registry = registry_with_one_agent();
        let mut deps = AgentLoopDeps {
            adapter: &adapter,
            sandbox: &sandbox,
            store: &store,
            observer: None,
            registry: &registry,
            config: &config,
        };
        let mut session = ChatSession::new("s1", Some("base system prompt"));

        let summary =
            run_agent_loop(&mut deps, &mut session, "inspect repo", "demo", AgentLoopOptions::default()).unwrap();

        assert_eq!(summary.summary, "Final polished answer.");
        assert_eq!(summary.evidence.len(), 1);
        assert!(session.messages.iter().any(|m| m.content.starts_with("[WORKER_TOOL_1]")));
    }

    #[test]
    fn unknown_agent_id_is_config_error() {
        let adapter = ScriptedAdapter::new(vec![]);
        let sandbox = LocalSandboxExecutor::new(std::env::temp_dir());
        let store = InMemoryStore { session: RefCell::new(None) };
        let config = AgentLoopConfig::default();
        let registry = registry_with_one_agent();
        let mut deps = AgentLoopDeps {
            adapter: &adapter,
            sandbox: &sandbox,
            store: &store,
            observer: None,
            registry: &registry,
            config: &config,
        };
        let mut session = ChatSession::new("s1", None);

        let result = run_agent_loop(&mut deps, &mut session, "goal", "missing-agent", AgentLoopOptions::default());
        assert!(matches!(result, Err(AgentError::ConfigError(_))));
    }

    #[test]
    fn max_steps_override_forces_forced_synthesis_immediately() {
        let adapter = ScriptedAdapter::new(vec![
            r#"{"next":"collect_evidence","reason":"need evidence"}"#,
            r#"{"decision":"finalize","answer":"forced draft"}"#,
            "Forced synthesis answer.",
        ]);
        let sandbox = LocalSandboxExecutor::new(std::env::temp_dir());
        let store = InMemoryStore { session: RefCell::new(None) };
        let config = AgentLoopConfig::default();
        let registry = registry_with_one_agent();
        let mut deps = AgentLoopDeps {
            adapter: &adapter,
            sandbox: &sandbox,
            store: &store,
            observer: None,
            registry: &registry,
            config: &config,
        };
        let mut session = ChatSession::new("s1", None);
        let options = AgentLoopOptions { max_steps_override: Some(0), ..Default::default() };

        let summary = run_agent_loop(&mut deps, &mut session, "goal", "demo", options).unwrap();
        assert_eq!(summary.summary, "Forced synthesis answer.");
        assert_eq!(summary.max_steps, 0);
    }
}
