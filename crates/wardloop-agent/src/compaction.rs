//! Context Guard (SPEC_FULL.md §4.D): estimates whether a session has grown
//! past its token budget, and when it has, replaces the bulk of history with
//! a summary document plus a bounded recent window.

use chrono::Utc;
use wardloop_core::{
    AgentError, ChatMessage, ChatRole, ChatSession, LoopRuntime, LoopState, COMPACTION_CLIP_CHARS,
    COMPACTION_MARKER, COMPACTION_MAX_RECENT, COMPACTION_MIN_MESSAGES, COMPACTION_MIN_RECENT,
    CONTEXT_TARGET_RATIO, CONTEXT_TRIGGER_RATIO,
};
use wardloop_store::SessionStore;

use crate::events::EventSink;

/// Number of lines kept per tagged group in the compaction summary document.
const SUMMARY_LINES_PER_GROUP: usize = 5;

#[derive(Debug, Clone)]
pub struct CompactionPlan {
    pub should_compact: bool,
    pub estimated_tokens: u64,
    pub trigger_tokens: u64,
    pub target_tokens: u64,
    pub signature: String,
}

pub fn compute_compaction_plan(session: &ChatSession, limit_tokens: u64) -> CompactionPlan {
    let estimated_tokens = session.estimated_tokens();
    let trigger_tokens = (limit_tokens as f64 * CONTEXT_TRIGGER_RATIO).floor() as u64;
    let target_tokens = (limit_tokens as f64 * CONTEXT_TARGET_RATIO).floor() as u64;
    let should_compact = session.messages.len() >= COMPACTION_MIN_MESSAGES && estimated_tokens >= trigger_tokens;

    let (last_role, last_len) = session
        .messages
        .last()
        .map(|m| (role_label(m.role), m.content.chars().count()))
        .unwrap_or(("none", 0));
    let signature = format!("{estimated_tokens}:{}:{last_role}:{last_len}", session.messages.len());

    CompactionPlan { should_compact, estimated_tokens, trigger_tokens, target_tokens, signature }
}

fn role_label(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push_str("... [truncated]");
    out
}

fn tagged_lines<'a>(messages: &'a [ChatMessage], predicate: impl Fn(&str) -> bool) -> Vec<&'a str> {
    messages.iter().map(|m| m.content.as_str()).filter(|content| predicate(content)).collect()
}

fn last_n_clipped(lines: &[&str], n: usize) -> Vec<String> {
    lines.iter().rev().take(n).rev().map(|line| clip(line, COMPACTION_CLIP_CHARS)).collect()
}

fn is_fail_line(content: &str) -> bool {
    content.starts_with('[') && content.contains("_FAIL")
}

/// Human-readable Markdown-ish block summarizing the tagged bookkeeping lines
/// the loop has appended to the session so far, used as the compacted
/// session's replacement for most of its history.
pub fn build_compaction_summary_document(goal: &str, runtime: &LoopRuntime, messages: &[ChatMessage]) -> String {
    let fails = tagged_lines(messages, is_fail_line);
    let agent_goal = tagged_lines(messages, |c| c.starts_with("[AGENT_GOAL:"));
    let tool_results = tagged_lines(messages, |c| c.starts_with("[WORKER_TOOL_RESULT_"));
    let tool_calls =
        tagged_lines(messages, |c| c.starts_with("[WORKER_TOOL_") && !c.starts_with("[WORKER_TOOL_RESULT_"));
    let ask_answers = tagged_lines(messages, |c| c.starts_with("[WORKER_ASK_ANSWER_"));
    let asks = tagged_lines(messages, |c| c.starts_with("[WORKER_ASK_") && !c.starts_with("[WORKER_ASK_ANSWER_"));
    let guidance = tagged_lines(messages, |c| c.starts_with("[MAIN_GUIDANCE_"));

    let last_assistant_reply = messages
        .iter()
        .rev()
        .find(|m| m.role == ChatRole::Assistant && !m.content.trim().is_empty())
        .map(|m| clip(&m.content, COMPACTION_CLIP_CHARS));

    let mut doc = format!(
        "{COMPACTION_MARKER}\nGoal: {goal}\nStep: {}\nEvidence gathered: {}\n",
        runtime.step,
        runtime.evidence.len()
    );

    let mut section = |title: &str, lines: Vec<String>| {
        if lines.is_empty() {
            return;
        }
        doc.push_str(&format!("\n## {title}\n"));
        for line in lines {
            doc.push_str(&format!("{line}\n"));
        }
    };

    section("Goal history", last_n_clipped(&agent_goal, SUMMARY_LINES_PER_GROUP));
    section("Worker tool calls", last_n_clipped(&tool_calls, SUMMARY_LINES_PER_GROUP));
    section("Worker tool results", last_n_clipped(&tool_results, SUMMARY_LINES_PER_GROUP));
    section("Worker questions", last_n_clipped(&asks, SUMMARY_LINES_PER_GROUP));
    section("User answers", last_n_clipped(&ask_answers, SUMMARY_LINES_PER_GROUP));
    section("Main guidance", last_n_clipped(&guidance, SUMMARY_LINES_PER_GROUP));
    section("Failures", last_n_clipped(&fails, SUMMARY_LINES_PER_GROUP));

    if let Some(reply) = last_assistant_reply {
        doc.push_str(&format!("\n## Last assistant reply\n{reply}\n"));
    }

    doc
}

fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    messages.iter().map(ChatMessage::estimated_tokens).sum()
}

fn dedup_by_role_and_content(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    let mut seen: Vec<(ChatRole, String)> = Vec::new();
    let mut out = Vec::new();
    for m in messages {
        let key = (m.role, m.content.clone());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        out.push(m);
    }
    out
}

/// Drop prior compaction summaries, keep at most one base system message,
/// append the new summary, append the last `COMPACTION_MAX_RECENT` messages,
/// then progressively shrink the recent window until the estimate is under
/// `target_tokens` or only one recent message remains.
pub fn build_compacted_session_messages(
    session: &ChatSession,
    summary_doc: &str,
    target_tokens: u64,
) -> Vec<ChatMessage> {
    let non_compaction: Vec<ChatMessage> =
        session.messages.iter().filter(|m| !m.content.starts_with(COMPACTION_MARKER)).cloned().collect();

    let base_system = non_compaction.iter().find(|m| m.role == ChatRole::System).cloned();
    let conversational: Vec<ChatMessage> = non_compaction.into_iter().filter(|m| m.role != ChatRole::System).collect();

    let mut recent: Vec<ChatMessage> = conversational
        .iter()
        .rev()
        .take(COMPACTION_MAX_RECENT)
        .cloned()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    let summary_message = ChatMessage::system(summary_doc);
    let fixed_cost = base_system.as_ref().map(ChatMessage::estimated_tokens).unwrap_or(0)
        + summary_message.estimated_tokens();

    while fixed_cost + estimate_tokens(&recent) > target_tokens && recent.len() > COMPACTION_MIN_RECENT {
        recent.remove(0);
    }

    if fixed_cost + estimate_tokens(&recent) > target_tokens {
        recent = recent
            .into_iter()
            .map(|m| ChatMessage { role: m.role, content: clip(&m.content, COMPACTION_CLIP_CHARS) })
            .collect();
    }

    while fixed_cost + estimate_tokens(&recent) > target_tokens && recent.len() > 1 {
        recent.remove(0);
    }

    let mut result = Vec::new();
    if let Some(base) = base_system {
        result.push(base);
    }
    result.push(summary_message);
    result.extend(recent);

    dedup_by_role_and_content(result)
}

/// Re-check `shouldCompact`, and if still true, publish the compaction
/// lifecycle events, rebuild the session, persist it, and record the
/// triggering signature so a non-progressing compaction doesn't re-enter
/// on the very next check.
pub fn handle_context_compaction(
    store: &dyn SessionStore,
    sink: &mut EventSink<'_>,
    goal: &str,
    session: &mut ChatSession,
    runtime: &mut LoopRuntime,
    context_limit_tokens: u64,
) -> Result<LoopState, AgentError> {
    use wardloop_core::EventKind;

    let plan = compute_compaction_plan(session, context_limit_tokens);
    if !plan.should_compact {
        runtime.last_compaction_signature = None;
        return Ok(runtime.resume_state_after_compaction);
    }

    sink.publish(EventKind::CompactionStart {
        estimated_tokens: plan.estimated_tokens,
        trigger_tokens: plan.trigger_tokens,
        target_tokens: plan.target_tokens,
        context_limit_tokens,
        message_count: session.messages.len(),
    });

    let before_tokens = session.estimated_tokens();
    let before_messages = session.messages.len();

    let summary_doc = build_compaction_summary_document(goal, runtime, &session.messages);
    session.messages = build_compacted_session_messages(session, &summary_doc, plan.target_tokens);
    session.updated_at = Utc::now();
    store.save(session).map_err(|e| AgentError::StoreError(e.to_string()))?;

    runtime.last_compaction_signature = Some(plan.signature);

    sink.publish(EventKind::CompactionComplete {
        before_tokens,
        after_tokens: session.estimated_tokens(),
        before_messages,
        after_messages: session.messages.len(),
    });

    Ok(runtime.resume_state_after_compaction)
}
