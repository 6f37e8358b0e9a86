//! LLM Call Wrapper (SPEC_FULL.md §4.C): issues one chat completion per
//! attempt (streaming on the first, non-streaming on retries), drives the
//! structured-output repair-retry loop, and applies the per-phase sampling
//! profile ahead of a model's own `extra_params` (§4.C.1).

use wardloop_core::{AgentError, ChatMessage, MainDecision, MainDecisionKind, PlanningResult, ResolvedModel, WorkerAction};
use wardloop_llm::{ChatCompletionAdapter, CompletionRequest};

use crate::config::AgentLoopConfig;
use crate::parser::{self, RepairKind};

fn worker_action_request(model: ResolvedModel, messages: Vec<ChatMessage>, config: &AgentLoopConfig) -> CompletionRequest {
    CompletionRequest {
        model: Some(model),
        messages,
        temperature: Some(0.7),
        top_p: Some(1.0),
        max_tokens: Some(config.worker_max_response_tokens),
        disable_thinking_hack: config.worker_disable_thinking_hack,
        ..Default::default()
    }
}

fn main_planning_request(model: ResolvedModel, messages: Vec<ChatMessage>, config: &AgentLoopConfig) -> CompletionRequest {
    CompletionRequest {
        model: Some(model),
        messages,
        temperature: Some(0.7),
        top_p: Some(1.0),
        disable_thinking_hack: config.main_disable_thinking_hack,
        ..Default::default()
    }
}

fn main_decision_request(
    model: ResolvedModel,
    messages: Vec<ChatMessage>,
    config: &AgentLoopConfig,
    enable_think_override: Option<bool>,
) -> CompletionRequest {
    let disable_thinking_hack = match enable_think_override {
        Some(enable_think) => !enable_think,
        None => config.main_disable_thinking_hack,
    };
    CompletionRequest {
        model: Some(model),
        messages,
        temperature: Some(0.7),
        top_p: Some(1.0),
        disable_thinking_hack,
        ..Default::default()
    }
}

fn main_final_report_request(model: ResolvedModel, messages: Vec<ChatMessage>, config: &AgentLoopConfig) -> CompletionRequest {
    CompletionRequest {
        model: Some(model),
        messages,
        temperature: Some(1.0),
        top_p: Some(0.95),
        disable_thinking_hack: config.main_disable_thinking_hack,
        ..Default::default()
    }
}

/// On attempt 0 with `stream_on_first`, stream with `on_token`; otherwise complete non-streaming.
pub fn request_chat_reply(
    adapter: &dyn ChatCompletionAdapter,
    request: &CompletionRequest,
    attempt: u32,
    stream_on_first: bool,
    on_token: &mut dyn FnMut(&str),
) -> Result<String, AgentError> {
    if attempt == 0 && stream_on_first {
        adapter.stream(request, on_token).map(|r| r.content)
    } else {
        adapter.complete(request).map(|r| r.content)
    }
}

/// Drive the repair-retry loop: parse the reply; on failure, append the
/// assistant's malformed reply plus a repair prompt and retry, up to
/// `retry_limit` additional attempts.
pub fn request_structured_with_repair<T>(
    adapter: &dyn ChatCompletionAdapter,
    base_messages: &[ChatMessage],
    retry_limit: u32,
    stream_on_first: bool,
    request_for_attempt: impl Fn(Vec<ChatMessage>) -> CompletionRequest,
    parse: impl Fn(&str) -> Result<T, String>,
    repair_kind: RepairKind,
    on_token: &mut dyn FnMut(&str),
) -> Result<T, AgentError> {
    let mut messages = base_messages.to_vec();
    for attempt in 0..=retry_limit {
        let request = request_for_attempt(messages.clone());
        let content = request_chat_reply(adapter, &request, attempt, stream_on_first, on_token)?;
        match parse(&content) {
            Ok(value) => return Ok(value),
            Err(reason) => {
                if attempt == retry_limit {
                    return Err(AgentError::StructuredValidationError(reason));
                }
                let mut next_messages = base_messages.to_vec();
                next_messages.push(ChatMessage::assistant(content));
                next_messages.push(parser::build_structured_repair_prompt(repair_kind, &reason));
                messages = next_messages;
            }
        }
    }
    unreachable!("the loop always returns within retry_limit + 1 iterations")
}

/// Wraps the structured repair loop with the worker-specific validation:
/// token-limit enforcement and the command safety gate on `call_tool`.
#[allow(clippy::too_many_arguments)]
pub fn ask_worker_for_action(
    adapter: &dyn ChatCompletionAdapter,
    policy_max_pipes: usize,
    model: ResolvedModel,
    config: &AgentLoopConfig,
    base_messages: &[ChatMessage],
    step: u32,
    on_token: &mut dyn FnMut(&str),
) -> Result<WorkerAction, AgentError> {
    let max_tokens = config.worker_max_response_tokens;
    let result = request_structured_with_repair(
        adapter,
        base_messages,
        config.structured_retry_limit,
        true,
        move |messages| worker_action_request(model.clone(), messages, config),
        |text| {
            parser::validate_worker_reply_token_limit(text, max_tokens)?;
            let action = parser::parse_worker_action(text)?;
            if let WorkerAction::CallTool { args, .. } = &action {
                wardloop_policy::check_command(&args.cmd, policy_max_pipes).map_err(|e| e.to_string())?;
            }
            Ok(action)
        },
        RepairKind::WorkerAction,
        on_token,
    );
    result.map_err(|err| match err {
        AgentError::StructuredValidationError(reason) => {
            AgentError::StructuredValidationError(format!("worker validation failed at step {step}: {reason}"))
        }
        other => other,
    })
}

pub fn ask_main_for_planning(
    adapter: &dyn ChatCompletionAdapter,
    model: ResolvedModel,
    config: &AgentLoopConfig,
    goal: &str,
    recent_messages: &[ChatMessage],
    on_token: &mut dyn FnMut(&str),
) -> Result<PlanningResult, AgentError> {
    let base_messages = crate::prompts::build_planning_messages(goal, recent_messages);
    request_structured_with_repair(
        adapter,
        &base_messages,
        config.structured_retry_limit,
        true,
        move |messages| main_planning_request(model.clone(), messages, config),
        parser::parse_planning_result,
        RepairKind::PlanningResult,
        on_token,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn ask_main_for_decision(
    adapter: &dyn ChatCompletionAdapter,
    model: ResolvedModel,
    config: &AgentLoopConfig,
    goal: &str,
    evidence_summary: &[String],
    guidance: &str,
    force_finalize: bool,
    enable_think_override: Option<bool>,
    on_token: &mut dyn FnMut(&str),
) -> Result<MainDecision, AgentError> {
    let base_messages = crate::prompts::build_main_decision_messages(goal, evidence_summary, guidance, force_finalize);
    request_structured_with_repair(
        adapter,
        &base_messages,
        config.structured_retry_limit,
        true,
        move |messages| main_decision_request(model.clone(), messages, config, enable_think_override),
        move |text| {
            let decision = parser::parse_main_decision(text)?;
            if force_finalize && decision.decision != Some(MainDecisionKind::Finalize) {
                return Err("forced finalize requires decision to be \"finalize\"".to_string());
            }
            Ok(decision)
        },
        RepairKind::MainDecision,
        on_token,
    )
}

/// Outcome of `ask_main_for_final_answer`: whether the main model produced
/// usable prose or the call fell back to the deterministic templated answer
/// (callers use `used_fallback` to decide whether to append a `_FAIL` line).
pub struct FinalAnswerOutcome {
    pub answer: String,
    pub used_fallback: bool,
}

/// Not structured: iterate up to two repair rounds asking for plain prose,
/// then fall back to a deterministic templated answer if the model keeps
/// leaking structured output.
#[allow(clippy::too_many_arguments)]
pub fn ask_main_for_final_answer(
    adapter: &dyn ChatCompletionAdapter,
    model: ResolvedModel,
    config: &AgentLoopConfig,
    goal: &str,
    draft: Option<&str>,
    decision_context: &str,
    evidence_summary: &[String],
    on_token: &mut dyn FnMut(&str),
) -> FinalAnswerOutcome {
    let mut messages = crate::prompts::build_final_answer_messages(goal, draft, decision_context);

    for attempt in 0..=2u32 {
        let request = main_final_report_request(model.clone(), messages.clone(), config);
        let content = match request_chat_reply(adapter, &request, attempt, true, on_token) {
            Ok(c) => c,
            Err(_) => break,
        };
        let stripped = parser::strip_think_blocks(&content);

        if !stripped.trim().is_empty() && !parser::looks_like_structured_output(&stripped) {
            return FinalAnswerOutcome { answer: stripped, used_fallback: false };
        }
        if let Some(answer) = parser::try_extract_answer_field(&stripped) {
            return FinalAnswerOutcome { answer, used_fallback: false };
        }

        if attempt < 2 {
            messages.push(ChatMessage::assistant(content));
            messages.push(ChatMessage::user(
                "Rewrite your reply in plain natural language prose only. No JSON, no markdown \
                 code blocks, no structured output of any kind."
                    .to_string(),
            ));
        }
    }

    FinalAnswerOutcome { answer: fallback_final_answer(goal, evidence_summary), used_fallback: true }
}

/// Deterministic templated answer listing the goal and every evidence line
/// verbatim, used when the main model cannot be coaxed into plain prose.
pub fn fallback_final_answer(goal: &str, evidence_summary: &[String]) -> String {
    let mut out = format!("Unable to obtain a polished answer from the main model for goal: {goal}\n\nEvidence gathered:\n");
    if evidence_summary.is_empty() {
        out.push_str("(no evidence gathered)\n");
    } else {
        for line in evidence_summary {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use wardloop_core::PlanningNext;
    use wardloop_llm::CompletionResponse;

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

    #[test]
    fn request_chat_reply_streams_only_on_first_attempt() {
        let adapter = ScriptedAdapter::new(vec!["streamed", "completed"]);
        let request = CompletionRequest { model: Some(model()), ..Default::default() };
        let mut tokens = Vec::new();
        let mut on_token = |t: &str| tokens.push(t.to_string());

        let first = request_chat_reply(&adapter, &request, 0, true, &mut on_token).unwrap();
        assert_eq!(first, "streamed");
        assert_eq!(tokens, vec!["streamed".to_string()]);

        let second = request_chat_reply(&adapter, &request, 1, true, &mut on_token).unwrap();
        assert_eq!(second, "completed");
        assert_eq!(tokens.len(), 1, "second attempt must not stream");
    }

    #[test]
    fn structured_repair_loop_succeeds_after_one_malformed_reply() {
        let adapter = ScriptedAdapter::new(vec!["not json", r#"{"next":"collect_evidence","reason":"ok"}"#]);
        let base = vec![ChatMessage::user("plan")];
        let mut on_token = |_: &str| {};
        let result: PlanningResult = request_structured_with_repair(
            &adapter,
            &base,
            2,
            false,
            |messages| CompletionRequest { model: Some(model()), messages, ..Default::default() },
            parser::parse_planning_result,
            RepairKind::PlanningResult,
            &mut on_token,
        )
        .unwrap();
        assert_eq!(result.next, PlanningNext::CollectEvidence);
    }

    #[test]
    fn structured_repair_loop_fails_after_exhausting_retries() {
        let adapter = ScriptedAdapter::new(vec!["bad", "still bad", "still bad"]);
        let base = vec![ChatMessage::user("plan")];
        let mut on_token = |_: &str| {};
        let result: Result<PlanningResult, AgentError> = request_structured_with_repair(
            &adapter,
            &base,
            2,
            false,
            |messages| CompletionRequest { model: Some(model()), messages, ..Default::default() },
            parser::parse_planning_result,
            RepairKind::PlanningResult,
            &mut on_token,
        );
        assert!(matches!(result, Err(AgentError::StructuredValidationError(_))));
    }

    #[test]
    fn ask_worker_for_action_rejects_policy_violating_command_as_validation_failure() {
        let adapter = ScriptedAdapter::new(vec![
            r#"{"action":"call_tool","args":{"cmd":"rm -rf /"},"reason":"cleanup"}"#,
            r#"{"action":"call_tool","args":{"cmd":"rm -rf /"},"reason":"cleanup"}"#,
            r#"{"action":"call_tool","args":{"cmd":"rm -rf /"},"reason":"cleanup"}"#,
        ]);
        let config = AgentLoopConfig { structured_retry_limit: 2, ..AgentLoopConfig::default() };
        let mut on_token = |_: &str| {};
        let result = ask_worker_for_action(&adapter, 1, model(), &config, &[ChatMessage::user("go")], 1, &mut on_token);
        assert!(matches!(result, Err(AgentError::StructuredValidationError(_))));
    }

    #[test]
    fn ask_main_for_final_answer_returns_plain_prose_reply() {
        let adapter = ScriptedAdapter::new(vec!["The roots are src and docs."]);
        let config = AgentLoopConfig::default();
        let mut on_token = |_: &str| {};
        let outcome =
            ask_main_for_final_answer(&adapter, model(), &config, "list roots", None, "ctx", &[], &mut on_token);
        assert_eq!(outcome.answer, "The roots are src and docs.");
        assert!(!outcome.used_fallback);
    }

    #[test]
    fn ask_main_for_final_answer_falls_back_when_model_keeps_leaking_json() {
        let adapter = ScriptedAdapter::new(vec!["{\"a\":1}", "{\"b\":2}", "{\"c\":3}"]);
        let config = AgentLoopConfig::default();
        let mut on_token = |_: &str| {};
        let evidence = vec!["[tool_result] found src and docs".to_string()];
        let outcome =
            ask_main_for_final_answer(&adapter, model(), &config, "list roots", None, "ctx", &evidence, &mut on_token);
        assert!(outcome.answer.contains("list roots"));
        assert!(outcome.answer.contains("found src and docs"));
        assert!(outcome.used_fallback);
    }

    #[test]
    fn fallback_final_answer_is_deterministic_and_contains_goal_and_evidence() {
        let evidence = vec!["[tool_result] a".to_string(), "[user_answer] b".to_string()];
        let first = fallback_final_answer("goal text", &evidence);
        let second = fallback_final_answer("goal text", &evidence);
        assert_eq!(first, second);
        assert!(first.contains("goal text"));
        assert!(first.contains("[tool_result] a"));
        assert!(first.contains("[user_answer] b"));
    }
}
