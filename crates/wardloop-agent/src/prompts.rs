//! Worker Prompt / Decision Prompt / Final-Answer Prompt Builders
//! (SPEC_FULL.md §4.H). Pure functions of their inputs — no I/O, no session
//! or runtime mutation — so they are unit-testable without a live model.

use std::sync::LazyLock;
use regex::Regex;
use wardloop_core::{ChatMessage, EvidenceItem, ToolResult, COMPACTION_MARKER};

const PLANNING_TRANSCRIPT_MESSAGES: usize = 16;
const PLANNING_TRANSCRIPT_CLIP_CHARS: usize = 220;
const WORKER_EVIDENCE_WINDOW: usize = 12;

static LOOP_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[[A-Za-z0-9_:.\-]+\]\s*").expect("valid regex"));

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

fn strip_loop_tag(content: &str) -> &str {
    match LOOP_TAG_RE.find(content) {
        Some(m) => &content[m.end()..],
        None => content,
    }
}

/// Role-prefixed, loop-tag-stripped, clipped tail of the last
/// `PLANNING_TRANSCRIPT_MESSAGES` non-compaction messages, used as the
/// planning phase's view of recent history.
pub fn summarize_recent_transcript(messages: &[ChatMessage]) -> Vec<String> {
    messages
        .iter()
        .filter(|m| !m.content.starts_with(COMPACTION_MARKER))
        .rev()
        .take(PLANNING_TRANSCRIPT_MESSAGES)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .map(|m| {
            let role = role_label(m.role);
            let stripped = strip_loop_tag(&m.content);
            format!("{role}: {}", clip(stripped, PLANNING_TRANSCRIPT_CLIP_CHARS))
        })
        .collect()
}

fn role_label(role: wardloop_core::ChatRole) -> &'static str {
    match role {
        wardloop_core::ChatRole::System => "system",
        wardloop_core::ChatRole::User => "user",
        wardloop_core::ChatRole::Assistant => "assistant",
    }
}

/// `[system: workerSystemPrompt, user: header]` in that exact order (§4.E AcquireEvidence, §4.H).
pub fn build_worker_messages(
    goal: &str,
    step: u32,
    guidance: &str,
    recent_user_answer: &str,
    evidence: &[EvidenceItem],
    last_tool: Option<&ToolResult>,
    system_prompt: &str,
) -> Vec<ChatMessage> {
    let guidance_line = if guidance.trim().is_empty() { "none".to_string() } else { guidance.trim().to_string() };
    let answer_line = if recent_user_answer.trim().is_empty() {
        "none".to_string()
    } else {
        recent_user_answer.trim().to_string()
    };

    let evidence_lines: Vec<String> = evidence
        .iter()
        .rev()
        .take(WORKER_EVIDENCE_WINDOW)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .enumerate()
        .map(|(idx, item)| format!("{}. [{}] {}", idx + 1, evidence_kind_label(item.kind), item.summary))
        .collect();
    let evidence_block =
        if evidence_lines.is_empty() { "(no evidence gathered yet)".to_string() } else { evidence_lines.join("\n") };

    let tool_block = match last_tool {
        Some(result) => format!(
            "cmd: {}\nexit_code: {}\nstdout:\n{}\nstderr:\n{}",
            result.cmd, result.exit_code, result.stdout, result.stderr
        ),
        None => "No previous tool result.".to_string(),
    };

    let header = format!(
        "Goal: {goal}\n\
         Step: {step}\n\
         Main guidance: {guidance_line}\n\
         Latest user answer: {answer_line}\n\n\
         Evidence so far:\n{evidence_block}\n\n\
         Tool context:\n{tool_block}"
    );

    vec![ChatMessage::system(system_prompt), ChatMessage::user(header)]
}

fn evidence_kind_label(kind: wardloop_core::EvidenceKind) -> &'static str {
    match kind {
        wardloop_core::EvidenceKind::ToolResult => "tool_result",
        wardloop_core::EvidenceKind::UserAnswer => "user_answer",
        wardloop_core::EvidenceKind::MainGuidance => "main_guidance",
    }
}

/// `[system, user]` pair for the planning phase (§4.E PlanIntent, §4.H).
pub fn build_planning_messages(goal: &str, recent_messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let system = "You are the planning half of a two-role evidence-gathering agent. Decide the \
                  next step and reply with exactly one JSON object matching \
                  {\"next\":\"collect_evidence\"|\"main_decision\"|\"final_report\",\"reason\":\"...\",\
                  \"evidence_goals\"?:[...],\"guidance\"?:\"...\",\"answer_hint\"?:\"...\"}. \
                  Use \"collect_evidence\" when more information is needed, \"main_decision\" when \
                  enough evidence already exists to judge sufficiency, and \"final_report\" only when \
                  the goal can be answered immediately without gathering anything. No prose outside the JSON object."
        .to_string();

    let transcript = summarize_recent_transcript(recent_messages);
    let transcript_block =
        if transcript.is_empty() { "(no prior transcript)".to_string() } else { transcript.join("\n") };
    let user = format!("Goal: {goal}\n\nRecent transcript:\n{transcript_block}");

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// `[system, user]` pair for the main-decision phase (§4.E AssessSufficiency/ForcedSynthesis, §4.H).
/// When `force_finalize` is true, the `continue` option is dropped entirely from the schema
/// description — the model is never offered a choice it cannot take.
pub fn build_main_decision_messages(
    goal: &str,
    evidence_summary: &[String],
    guidance: &str,
    force_finalize: bool,
) -> Vec<ChatMessage> {
    let schema = if force_finalize {
        "{\"decision\":\"finalize\",\"answer\":\"...\",\"guidance\"?:\"...\",\
         \"summary_evidence\"?:[...],\"needed_evidence\"?:[...],\"forced_synthesis_enable_think\"?:bool}"
    } else {
        "{\"decision\":\"finalize\"|\"continue\",\"answer\"?:\"...\",\"guidance\"?:\"...\",\
         \"summary_evidence\"?:[...],\"needed_evidence\"?:[...],\"forced_synthesis_enable_think\"?:bool}"
    };
    let system = format!(
        "You are the main model judging whether enough evidence has been gathered to answer the \
         goal. Reply with exactly one JSON object matching {schema}. No prose outside the JSON object."
    );

    let evidence_block = if evidence_summary.is_empty() {
        "(no evidence gathered yet)".to_string()
    } else {
        evidence_summary.join("\n")
    };
    let guidance_line = if guidance.trim().is_empty() { "none".to_string() } else { guidance.trim().to_string() };
    let user = format!("Goal: {goal}\n\nGuidance so far: {guidance_line}\n\nEvidence:\n{evidence_block}");

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

/// `[system, user]` pair for the final-report phase (§4.C, §4.H, §6.8). `draft`, when present, is
/// quoted as a starting point to polish rather than a fact to invent around.
pub fn build_final_answer_messages(goal: &str, draft: Option<&str>, decision_context: &str) -> Vec<ChatMessage> {
    let system = "You are writing the final answer to the operator's goal. Reply in plain natural \
                  language prose only — no JSON, no markdown code blocks, no structured output of any kind."
        .to_string();

    let draft_block = match draft {
        Some(d) if !d.trim().is_empty() => format!("\n\nDraft to polish (not a fact to invent around):\n{}", d.trim()),
        _ => String::new(),
    };
    let user = format!("Goal: {goal}\n\nContext:\n{decision_context}{draft_block}");

    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use wardloop_core::{EvidenceKind, SandboxRunner};

    #[test]
    fn worker_messages_are_system_then_user_in_that_order() {
        let messages = build_worker_messages("goal", 1, "", "", &[], None, "sys prompt");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, wardloop_core::ChatRole::System);
        assert_eq!(messages[0].content, "sys prompt");
        assert_eq!(messages[1].role, wardloop_core::ChatRole::User);
    }

    #[test]
    fn worker_messages_report_none_for_empty_guidance_and_answer() {
        let messages = build_worker_messages("goal", 1, "", "", &[], None, "sys");
        assert!(messages[1].content.contains("Main guidance: none"));
        assert!(messages[1].content.contains("Latest user answer: none"));
        assert!(messages[1].content.contains("No previous tool result."));
    }

    #[test]
    fn worker_messages_include_last_tool_context() {
        let tool = ToolResult {
            cmd: "ls -1".into(),
            exit_code: 0,
            stdout: "src\n".into(),
            stderr: String::new(),
            runner: SandboxRunner::Local,
            workspace_group_id: "g1".into(),
        };
        let messages = build_worker_messages("goal", 2, "guide me", "YES", &[], Some(&tool), "sys");
        assert!(messages[1].content.contains("cmd: ls -1"));
        assert!(messages[1].content.contains("exit_code: 0"));
        assert!(messages[1].content.contains("Main guidance: guide me"));
        assert!(messages[1].content.contains("Latest user answer: YES"));
    }

    #[test]
    fn worker_messages_window_evidence_to_last_twelve_in_order() {
        let evidence: Vec<EvidenceItem> = (0..20)
            .map(|i| EvidenceItem { kind: EvidenceKind::ToolResult, summary: format!("item {i}"), detail: None })
            .collect();
        let messages = build_worker_messages("goal", 1, "", "", &evidence, None, "sys");
        assert!(messages[1].content.contains("1. [tool_result] item 8"));
        assert!(messages[1].content.contains("12. [tool_result] item 19"));
        assert!(!messages[1].content.contains("item 7"));
    }

    #[test]
    fn planning_messages_embed_goal_and_transcript() {
        let history = vec![ChatMessage::user("[WORKER_TOOL_1] ls -1"), ChatMessage::assistant("ok")];
        let messages = build_planning_messages("find the bug", &history);
        assert!(messages[1].content.contains("find the bug"));
        assert!(messages[1].content.contains("user: ls -1"));
        assert!(!messages[1].content.contains("WORKER_TOOL_1"));
    }

    #[test]
    fn planning_transcript_excludes_compaction_summaries_and_caps_at_sixteen() {
        let mut history: Vec<ChatMessage> = (0..20).map(|i| ChatMessage::user(format!("msg {i}"))).collect();
        history.insert(0, ChatMessage::system(format!("{COMPACTION_MARKER} old summary")));
        let transcript = summarize_recent_transcript(&history);
        assert_eq!(transcript.len(), 16);
        assert!(transcript.iter().all(|line| !line.contains("old summary")));
        assert!(transcript[0].contains("msg 4"));
    }

    #[test]
    fn main_decision_messages_drop_continue_option_when_force_finalize() {
        let messages = build_main_decision_messages("goal", &[], "", true);
        assert!(messages[0].content.contains("\"decision\":\"finalize\""));
        assert!(!messages[0].content.contains("\"finalize\"|\"continue\""));
    }

    #[test]
    fn main_decision_messages_offer_continue_when_not_forced() {
        let messages = build_main_decision_messages("goal", &["[tool_result] found it".to_string()], "keep going", false);
        assert!(messages[0].content.contains("\"finalize\"|\"continue\""));
        assert!(messages[1].content.contains("found it"));
        assert!(messages[1].content.contains("keep going"));
    }

    #[test]
    fn final_answer_messages_quote_draft_without_requiring_it() {
        let with_draft = build_final_answer_messages("goal", Some("draft text"), "ctx");
        assert!(with_draft[1].content.contains("draft text"));
        let without_draft = build_final_answer_messages("goal", None, "ctx");
        assert!(!without_draft[1].content.contains("Draft to polish"));
    }

    #[test]
    fn final_answer_system_message_forbids_structured_output() {
        let messages = build_final_answer_messages("goal", None, "ctx");
        assert!(messages[0].content.to_lowercase().contains("no json"));
    }
}
