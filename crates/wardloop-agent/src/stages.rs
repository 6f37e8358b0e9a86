//! Stage Handlers (SPEC_FULL.md §4.E): one function per `LoopState` variant
//! (excepting `ContextGuard`, which lives in `compaction::handle_context_compaction`
//! and `Done`, which the orchestrator terminates on directly). Each handler
//! publishes its lifecycle events, mutates `session`/`runtime`, and returns
//! the next state for the orchestrator to dispatch on.

use chrono::Utc;
use wardloop_core::{
    summarize_evidence_for_main, AgentError, ChatMessage, ChatSession, EvidenceItem, EvidenceKind, LoopRuntime,
    LoopState, MainDecision, MainDecisionKind, PlanningNext, PlanningResult, ResolvedModel, WorkerAction,
};
use wardloop_core::EventKind;
use wardloop_llm::ChatCompletionAdapter;
use wardloop_store::SessionStore;

use crate::config::AgentLoopConfig;
use crate::events::EventSink;
use crate::llm_call;
use crate::prompts;
use crate::sandbox::SandboxExecutor;

/// Everything a stage handler needs to call out to the world. Bundled so the
/// handler signatures stay stable as the orchestrator grows more options.
pub struct LoopDeps<'a> {
    pub adapter: &'a dyn ChatCompletionAdapter,
    pub sandbox: &'a dyn SandboxExecutor,
    pub store: &'a dyn SessionStore,
    pub config: &'a AgentLoopConfig,
    pub main_model: ResolvedModel,
    pub worker_model: ResolvedModel,
    pub max_steps: u32,
    pub workspace_group_id: String,
    pub ask_user: Option<&'a mut dyn FnMut(&str) -> Result<String, AgentError>>,
}

fn append_system_and_persist(
    store: &dyn SessionStore,
    session: &mut ChatSession,
    content: impl Into<String>,
) -> Result<(), AgentError> {
    session.push(ChatMessage::system(content));
    session.updated_at = Utc::now();
    store.save(session).map_err(|e| AgentError::StoreError(e.to_string()))
}

fn first_non_empty_line(text: &str) -> &str {
    text.lines().find(|line| !line.trim().is_empty()).unwrap_or("")
}

fn planning_next_label(next: PlanningNext) -> &'static str {
    match next {
        PlanningNext::CollectEvidence => "collect_evidence",
        PlanningNext::MainDecision => "main_decision",
        PlanningNext::FinalReport => "final_report",
    }
}

fn main_decision_label(decision: Option<MainDecisionKind>) -> String {
    match decision {
        Some(MainDecisionKind::Finalize) => "finalize".to_string(),
        Some(MainDecisionKind::Continue) | None => "continue".to_string(),
    }
}

fn build_decision_context(decision: &MainDecision) -> String {
    let mut parts = Vec::new();
    if let Some(answer) = &decision.answer {
        if !answer.trim().is_empty() {
            parts.push(format!("answer: {}", answer.trim()));
        }
    }
    if let Some(guidance) = &decision.guidance {
        parts.push(format!("guidance: {guidance}"));
    }
    if !decision.summary_evidence.is_empty() {
        parts.push(format!("summary_evidence: {}", decision.summary_evidence.join("; ")));
    }
    if !decision.needed_evidence.is_empty() {
        parts.push(format!("needed_evidence: {}", decision.needed_evidence.join("; ")));
    }
    if let Some(enable_think) = decision.forced_synthesis_enable_think {
        parts.push(format!("forced_synthesis_enable_think: {enable_think}"));
    }
    if parts.is_empty() {
        "(no additional decision context)".to_string()
    } else {
        parts.join("\n")
    }
}

/// §4.E `PlanIntent`.
pub fn handle_plan_intent(
    deps: &mut LoopDeps<'_>,
    sink: &mut EventSink<'_>,
    goal: &str,
    session: &mut ChatSession,
    runtime: &mut LoopRuntime,
) -> Result<LoopState, AgentError> {
    sink.publish(EventKind::LoopState {
        state: LoopState::PlanIntent,
        step: runtime.step,
        evidence_count: runtime.evidence.len(),
        summary: None,
    });
    sink.publish(EventKind::PlanningStart { goal: goal.to_string() });

    let planning_result = {
        let mut on_token =
            |token: &str| {
                sink.publish(EventKind::MainToken { phase: "planning".to_string(), token: token.to_string() });
            };
        llm_call::ask_main_for_planning(deps.adapter, deps.main_model.clone(), deps.config, goal, &session.messages, &mut on_token)
    };

    let planning = match planning_result {
        Ok(plan) => plan,
        Err(err) => {
            append_system_and_persist(deps.store, session, "[PLANNING_FAIL]")?;
            PlanningResult {
                next: PlanningNext::CollectEvidence,
                reason: format!("planning failed: {err}"),
                evidence_goals: Vec::new(),
                guidance: Some("Collect concrete evidence with safe read-only commands before finalize.".to_string()),
                answer_hint: None,
            }
        }
    };

    if let Some(guidance) = &planning.guidance {
        runtime.guidance = guidance.clone();
    }
    if !planning.evidence_goals.is_empty() {
        runtime.push_evidence(EvidenceItem {
            kind: EvidenceKind::MainGuidance,
            summary: format!("Evidence goals: {}", planning.evidence_goals.join("; ")),
            detail: None,
        });
    }

    sink.publish(EventKind::PlanningResult {
        next: planning.next,
        reason: planning.reason.clone(),
        evidence_goals: planning.evidence_goals.clone(),
        guidance: planning.guidance.clone(),
    });
    append_system_and_persist(
        deps.store,
        session,
        format!("[PLANNING_RESULT] next={} reason={}", planning_next_label(planning.next), planning.reason),
    )?;
    runtime.planning = Some(planning.clone());

    match planning.next {
        PlanningNext::CollectEvidence => Ok(LoopState::AcquireEvidence),
        PlanningNext::MainDecision => Ok(LoopState::AssessSufficiency),
        PlanningNext::FinalReport => {
            let evidence_summary = summarize_evidence_for_main(&runtime.evidence);
            let mut on_token = |token: &str| {
                sink.publish(EventKind::MainToken { phase: "final-report".to_string(), token: token.to_string() });
            };
            let outcome = llm_call::ask_main_for_final_answer(
                deps.adapter,
                deps.main_model.clone(),
                deps.config,
                goal,
                planning.answer_hint.as_deref(),
                &planning.reason,
                &evidence_summary,
                &mut on_token,
            );
            runtime.final_answer = outcome.answer.clone();
            sink.publish(EventKind::FinalAnswer { answer: outcome.answer });
            Ok(LoopState::Done)
        }
    }
}

/// §4.E `AcquireEvidence`.
pub fn handle_acquire_evidence(
    deps: &mut LoopDeps<'_>,
    sink: &mut EventSink<'_>,
    goal: &str,
    session: &mut ChatSession,
    runtime: &mut LoopRuntime,
) -> Result<LoopState, AgentError> {
    sink.publish(EventKind::LoopState {
        state: LoopState::AcquireEvidence,
        step: runtime.step,
        evidence_count: runtime.evidence.len(),
        summary: None,
    });

    if runtime.step > deps.max_steps {
        runtime.forced_synthesis_reason =
            Some(format!("max step reached: step={}, maxSteps={}", runtime.step, deps.max_steps));
        return Ok(LoopState::ForcedSynthesis);
    }

    runtime.steps = runtime.step;
    let step = runtime.step;
    sink.publish(EventKind::WorkerStart { step });

    let messages = prompts::build_worker_messages(
        goal,
        step,
        &runtime.guidance,
        &runtime.recent_user_answer,
        &runtime.evidence,
        runtime.last_tool.as_ref(),
        &deps.config.worker_system_prompt,
    );

    let action_result = {
        let mut on_token = |token: &str| {
            sink.publish(EventKind::WorkerToken { step, token: token.to_string() });
        };
        llm_call::ask_worker_for_action(
            deps.adapter,
            deps.config.max_pipes,
            deps.worker_model.clone(),
            deps.config,
            &messages,
            step,
            &mut on_token,
        )
    };

    let action = match action_result {
        Ok(action) => action,
        Err(err) => {
            let message = err.to_string();
            sink.publish(EventKind::WorkerAction { step, action: "finalize".to_string(), detail: message.clone() });
            runtime.push_evidence(EvidenceItem {
                kind: EvidenceKind::MainGuidance,
                summary: format!("worker validation failed: {message}"),
                detail: None,
            });
            runtime.forced_synthesis_reason = Some(format!("worker validation failed at step {step}: {message}"));
            append_system_and_persist(deps.store, session, format!("[WORKER_VALIDATION_FAIL_{step}]"))?;
            return Ok(LoopState::ForcedSynthesis);
        }
    };

    match action {
        WorkerAction::CallTool { tool: _, args, reason } => {
            sink.publish(EventKind::WorkerAction { step, action: "call_tool".to_string(), detail: reason });
            sink.publish(EventKind::ToolStart { step, cmd: args.cmd.clone() });

            let result = deps.sandbox.run(&args.cmd, &deps.workspace_group_id, &deps.config.sandbox);

            let summary = format!(
                "runner={} group={} cmd={} exit={} stdout={} stderr={}",
                result.runner,
                result.workspace_group_id,
                result.cmd,
                result.exit_code,
                first_non_empty_line(&result.stdout),
                first_non_empty_line(&result.stderr),
            );
            let detail = format!(
                "cmd: {}\nexit_code: {}\nstdout:\n{}\nstderr:\n{}",
                result.cmd, result.exit_code, result.stdout, result.stderr
            );
            runtime.push_evidence(EvidenceItem { kind: EvidenceKind::ToolResult, summary, detail: Some(detail) });

            session.push(ChatMessage::system(format!("[WORKER_TOOL_{step}] {}", result.cmd)));
            session.push(ChatMessage::system(format!("[WORKER_TOOL_RESULT_{step}] exit={}", result.exit_code)));
            session.updated_at = Utc::now();
            deps.store.save(session).map_err(|e| AgentError::StoreError(e.to_string()))?;

            sink.publish(EventKind::ToolResult {
                step,
                exit_code: result.exit_code,
                stdout: result.stdout.clone(),
                stderr: result.stderr.clone(),
                runner: result.runner,
                workspace_group_id: result.workspace_group_id.clone(),
            });

            runtime.last_tool = Some(result);
            runtime.step += 1;
            Ok(LoopState::AcquireEvidence)
        }
        WorkerAction::Ask { question } => {
            sink.publish(EventKind::WorkerAction { step, action: "ask".to_string(), detail: question.clone() });
            sink.publish(EventKind::Ask { step, question: question.clone() });

            let ask_user = deps
                .ask_user
                .as_mut()
                .ok_or_else(|| AgentError::ConfigError("askUser callback required to answer a worker question".to_string()))?;
            let answer = ask_user(&question)?.trim().to_string();
            runtime.recent_user_answer = answer.clone();
            runtime.push_evidence(EvidenceItem {
                kind: EvidenceKind::UserAnswer,
                summary: format!("Q: {question} / A: {answer}"),
                detail: None,
            });

            session.push(ChatMessage::system(format!("[WORKER_ASK_{step}] {question}")));
            session.push(ChatMessage::system(format!("[WORKER_ASK_ANSWER_{step}] {answer}")));
            session.updated_at = Utc::now();
            deps.store.save(session).map_err(|e| AgentError::StoreError(e.to_string()))?;

            sink.publish(EventKind::AskAnswer { step, answer });
            runtime.step += 1;
            Ok(LoopState::AcquireEvidence)
        }
        WorkerAction::Finalize {} => {
            sink.publish(EventKind::WorkerAction {
                step,
                action: "finalize".to_string(),
                detail: "worker requested finalize".to_string(),
            });
            Ok(LoopState::AssessSufficiency)
        }
    }
}

/// §4.E `AssessSufficiency`.
pub fn handle_assess_sufficiency(
    deps: &mut LoopDeps<'_>,
    sink: &mut EventSink<'_>,
    goal: &str,
    session: &mut ChatSession,
    runtime: &mut LoopRuntime,
) -> Result<LoopState, AgentError> {
    sink.publish(EventKind::LoopState {
        state: LoopState::AssessSufficiency,
        step: runtime.step,
        evidence_count: runtime.evidence.len(),
        summary: None,
    });
    sink.publish(EventKind::MainStart {
        phase: "assess-sufficiency".to_string(),
        evidence_count: runtime.evidence.len(),
    });

    let mut evidence_summary = Vec::new();
    if let Some(planning) = &runtime.planning {
        evidence_summary.push(format!("[planning] {}", planning.reason));
    }
    evidence_summary.extend(summarize_evidence_for_main(&runtime.evidence));

    let step = runtime.step;
    let guidance = runtime.guidance.clone();
    let decision_result = {
        let mut on_token = |token: &str| {
            sink.publish(EventKind::MainToken { phase: "assess-sufficiency".to_string(), token: token.to_string() });
        };
        llm_call::ask_main_for_decision(
            deps.adapter,
            deps.main_model.clone(),
            deps.config,
            goal,
            &evidence_summary,
            &guidance,
            false,
            None,
            &mut on_token,
        )
    };

    let decision = match decision_result {
        Ok(decision) => decision,
        Err(err) => {
            let guidance = "Gather more concrete evidence using safe read-only commands and retry.".to_string();
            runtime.guidance = guidance.clone();
            runtime.push_evidence(EvidenceItem {
                kind: EvidenceKind::MainGuidance,
                summary: format!("main decision failed: {err}"),
                detail: None,
            });
            append_system_and_persist(deps.store, session, format!("[MAIN_DECISION_FAIL_{step}]"))?;
            sink.publish(EventKind::MainDecision {
                phase: "assess-sufficiency".to_string(),
                decision: "continue".to_string(),
                guidance: Some(guidance),
            });
            runtime.step += 1;
            return Ok(LoopState::AcquireEvidence);
        }
    };

    if let Some(enable_think) = decision.forced_synthesis_enable_think {
        runtime.forced_synthesis_enable_think = Some(enable_think);
    }

    match decision.decision {
        Some(MainDecisionKind::Finalize) => {
            sink.publish(EventKind::MainDecision {
                phase: "assess-sufficiency".to_string(),
                decision: main_decision_label(decision.decision),
                guidance: decision.guidance.clone(),
            });
            let draft = decision.answer.as_deref().map(str::trim);
            let decision_context = build_decision_context(&decision);
            let evidence_for_final = summarize_evidence_for_main(&runtime.evidence);
            let mut on_token = |token: &str| {
                sink.publish(EventKind::MainToken { phase: "final-report".to_string(), token: token.to_string() });
            };
            let outcome = llm_call::ask_main_for_final_answer(
                deps.adapter,
                deps.main_model.clone(),
                deps.config,
                goal,
                draft,
                &decision_context,
                &evidence_for_final,
                &mut on_token,
            );
            if outcome.used_fallback {
                append_system_and_persist(deps.store, session, format!("[MAIN_FINAL_ANSWER_FAIL_{step}]"))?;
            }
            runtime.final_answer = outcome.answer.clone();
            sink.publish(EventKind::FinalAnswer { answer: outcome.answer });
            Ok(LoopState::Done)
        }
        Some(MainDecisionKind::Continue) | None => {
            let guidance =
                decision.guidance.clone().unwrap_or_else(|| "Gather more concrete evidence and retry finalize.".to_string());
            runtime.guidance = guidance.clone();
            runtime.push_evidence(EvidenceItem { kind: EvidenceKind::MainGuidance, summary: guidance, detail: None });
            append_system_and_persist(deps.store, session, format!("[MAIN_GUIDANCE_{step}]"))?;
            sink.publish(EventKind::MainDecision {
                phase: "assess-sufficiency".to_string(),
                decision: main_decision_label(decision.decision),
                guidance: decision.guidance.clone(),
            });
            runtime.step += 1;
            Ok(LoopState::AcquireEvidence)
        }
    }
}

/// §4.E `ForcedSynthesis`.
pub fn handle_forced_synthesis(
    deps: &mut LoopDeps<'_>,
    sink: &mut EventSink<'_>,
    goal: &str,
    session: &mut ChatSession,
    runtime: &mut LoopRuntime,
) -> Result<LoopState, AgentError> {
    sink.publish(EventKind::LoopState {
        state: LoopState::ForcedSynthesis,
        step: runtime.step,
        evidence_count: runtime.evidence.len(),
        summary: runtime.forced_synthesis_reason.clone(),
    });
    sink.publish(EventKind::MainStart { phase: "forced-synthesis".to_string(), evidence_count: runtime.evidence.len() });

    let evidence_summary = summarize_evidence_for_main(&runtime.evidence);
    let guidance = runtime.guidance.clone();
    let enable_think_override = runtime.forced_synthesis_enable_think;

    let decision_result = {
        let mut on_token = |token: &str| {
            sink.publish(EventKind::MainToken { phase: "forced-synthesis".to_string(), token: token.to_string() });
        };
        llm_call::ask_main_for_decision(
            deps.adapter,
            deps.main_model.clone(),
            deps.config,
            goal,
            &evidence_summary,
            &guidance,
            true,
            enable_think_override,
            &mut on_token,
        )
    };

    match decision_result {
        Ok(decision) => {
            let draft = decision.answer.as_deref().map(str::trim);
            let decision_context = build_decision_context(&decision);
            let mut on_token = |token: &str| {
                sink.publish(EventKind::MainToken { phase: "final-report".to_string(), token: token.to_string() });
            };
            let outcome = llm_call::ask_main_for_final_answer(
                deps.adapter,
                deps.main_model.clone(),
                deps.config,
                goal,
                draft,
                &decision_context,
                &evidence_summary,
                &mut on_token,
            );
            sink.publish(EventKind::MainDecision {
                phase: "forced-synthesis".to_string(),
                decision: "finalize".to_string(),
                guidance: decision.guidance.clone(),
            });
            runtime.final_answer = outcome.answer.clone();
            sink.publish(EventKind::FinalAnswer { answer: outcome.answer });
        }
        Err(err) => {
            let message = err.to_string();
            runtime.final_answer = llm_call::fallback_final_answer(goal, &evidence_summary);
            append_system_and_persist(deps.store, session, "[MAIN_FORCE_FINALIZE_FAIL]")?;
            sink.publish(EventKind::MainDecision {
                phase: "forced-synthesis".to_string(),
                decision: "finalize".to_string(),
                guidance: Some(format!("fallback finalize: {message}")),
            });
            sink.publish(EventKind::FinalAnswer { answer: runtime.final_answer.clone() });
        }
    }

    Ok(LoopState::Done)
}
