//! Structured Output Parser / Repair Kit (SPEC_FULL.md §4.B). Pure text-in,
//! result-out functions — no I/O — so the repair loop in `llm_call` can
//! retry against them without a live model.

use serde_json::Value;
use std::sync::LazyLock;
use regex::Regex;
use wardloop_core::{ChatMessage, MainDecision, PlanningResult, ToolArgs, WorkerAction};

static THINK_BLOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"));

/// Strip every `<think>...</think>` pair, case-insensitively, leaving the
/// surrounding text untouched.
pub fn strip_think_blocks(text: &str) -> String {
    THINK_BLOCK_RE.replace_all(text, "").trim().to_string()
}

/// The substring from the first `{` to the last `}`, inclusive.
pub fn extract_json_object(text: &str) -> Result<&str, String> {
    let start = text.find('{').ok_or_else(|| "no JSON object found (missing '{')".to_string())?;
    let end = text.rfind('}').ok_or_else(|| "no JSON object found (missing '}')".to_string())?;
    if end < start {
        return Err("no JSON object found (unbalanced braces)".to_string());
    }
    Ok(&text[start..=end])
}

pub fn parse_worker_action(text: &str) -> Result<WorkerAction, String> {
    let stripped = strip_think_blocks(text);
    let json_str = extract_json_object(&stripped)?;
    let value: Value = serde_json::from_str(json_str).map_err(|e| format!("invalid JSON: {e}"))?;
    let action_name = value
        .get("action")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing \"action\" field".to_string())?;

    match action_name {
        "call_tool" => {
            let cmd = value
                .pointer("/args/cmd")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .trim()
                .to_string();
            if cmd.is_empty() {
                return Err("call_tool requires a non-empty args.cmd".to_string());
            }
            let reason = value.get("reason").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            if reason.is_empty() {
                return Err("call_tool requires a non-empty reason".to_string());
            }
            if reason.chars().count() > 120 {
                return Err("reason must be at most 120 characters".to_string());
            }
            Ok(WorkerAction::CallTool { tool: "shell".to_string(), args: ToolArgs { cmd }, reason })
        }
        "ask" => {
            let question = value.get("question").and_then(|v| v.as_str()).unwrap_or("").trim().to_string();
            if question.is_empty() {
                return Err("ask requires a non-empty question".to_string());
            }
            Ok(WorkerAction::Ask { question })
        }
        "finalize" => Ok(WorkerAction::Finalize {}),
        other => Err(format!("unknown action \"{other}\"; expected call_tool, ask, or finalize")),
    }
}

pub fn parse_main_decision(text: &str) -> Result<MainDecision, String> {
    let stripped = strip_think_blocks(text);
    let json_str = extract_json_object(&stripped)?;
    let decision: MainDecision =
        serde_json::from_str(json_str).map_err(|e| format!("invalid JSON: {e}"))?;
    if decision.decision.is_none() {
        return Err("missing \"decision\" field (expected \"finalize\" or \"continue\")".to_string());
    }
    Ok(decision)
}

pub fn parse_planning_result(text: &str) -> Result<PlanningResult, String> {
    let stripped = strip_think_blocks(text);
    let json_str = extract_json_object(&stripped)?;
    let result: PlanningResult =
        serde_json::from_str(json_str).map_err(|e| format!("invalid JSON: {e}"))?;
    if result.reason.trim().is_empty() {
        return Err("\"reason\" must not be empty".to_string());
    }
    Ok(result)
}

/// Approximate tokens as `ceil(len/4)`; fail if the reply (think-blocks
/// stripped) exceeds `max_tokens`.
pub fn validate_worker_reply_token_limit(text: &str, max_tokens: u32) -> Result<(), String> {
    let stripped = strip_think_blocks(text);
    let estimated = (stripped.chars().count() as u64).div_ceil(4);
    if estimated > max_tokens as u64 {
        return Err(format!(
            "worker reply is too long: ~{estimated} tokens exceeds the {max_tokens} token limit"
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairKind {
    WorkerAction,
    MainDecision,
    PlanningResult,
}

/// Build the user-role repair message asking the model to re-emit a valid
/// structured reply. The worker-action hints (length/policy/think-leakage)
/// only fire when the error text indicates that specific failure mode.
pub fn build_structured_repair_prompt(kind: RepairKind, error_message: &str) -> ChatMessage {
    let shape = match kind {
        RepairKind::WorkerAction => {
            "exactly one JSON object shaped like \
             {\"action\":\"call_tool\",\"args\":{\"cmd\":\"...\"},\"reason\":\"...\"} or \
             {\"action\":\"ask\",\"question\":\"...\"} or {\"action\":\"finalize\"}"
        }
        RepairKind::MainDecision => {
            "exactly one JSON object shaped like {\"decision\":\"finalize\"|\"continue\", ...}"
        }
        RepairKind::PlanningResult => {
            "exactly one JSON object shaped like \
             {\"next\":\"collect_evidence\"|\"main_decision\"|\"final_report\", \"reason\":\"...\"}"
        }
    };

    let mut prompt = format!(
        "Your previous reply was rejected: {error_message}\n\n\
         Re-output EXACTLY one valid JSON object of the specified shape: {shape}. \
         Do not include any other text, markdown, or explanation."
    );

    if kind == RepairKind::WorkerAction {
        let lower = error_message.to_lowercase();
        if lower.contains("too long") || lower.contains("token limit") {
            prompt.push_str("\nKeep the reply short — only the JSON object, nothing else.");
        }
        if lower.contains("policy violation") || lower.contains("forbidden") || lower.contains("git push") {
            prompt.push_str(
                "\nThe proposed command violates the command safety policy; propose a safe, read-only alternative.",
            );
        }
        if lower.contains("<think>") || lower.contains("think block") {
            prompt.push_str("\nDo not include <think> tags or any reasoning preamble; output only the JSON object.");
        }
    }

    ChatMessage::user(prompt)
}

/// Heuristic: does this text look like it's still JSON or a fenced code
/// block, rather than the plain prose the final-answer phase requires?
pub fn looks_like_structured_output(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return false;
    }
    (trimmed.starts_with('{') && trimmed.ends_with('}'))
        || (trimmed.starts_with('[') && trimmed.ends_with(']'))
        || trimmed.starts_with("```")
}

/// Salvage a natural-language answer from a leaked JSON object carrying an
/// `answer`/`final_answer`/`response`/`final` field.
pub fn try_extract_answer_field(text: &str) -> Option<String> {
    let stripped = strip_think_blocks(text);
    let json_str = extract_json_object(&stripped).ok()?;
    let value: Value = serde_json::from_str(json_str).ok()?;
    for key in ["answer", "final_answer", "response", "final"] {
        if let Some(candidate) = value.get(key).and_then(|v| v.as_str()) {
            let trimmed = candidate.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}
