//! Chat Completion Adapter — the provider-agnostic boundary the agent loop
//! drives an LLM call through (SPEC_FULL.md §6.1). Two entry points: a
//! buffered `complete` and a token-streaming `stream`; both accept the same
//! request shape so a structured-output retry can fall back from streaming
//! to non-streaming without reshaping the call.

use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::BufRead;
use std::time::Duration;
use wardloop_core::{AgentError, ChatMessage, ChatRole, ResolvedModel};

/// Default assistant primer used to suppress hidden-reasoning tokens from a
/// local model that does not honor an explicit `enable_thinking=false` knob.
pub const DEFAULT_THINK_BYPASS_TAG: &str = "<think></think>";

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub model: Option<ResolvedModel>,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub top_p: Option<f64>,
    pub min_p: Option<f64>,
    pub top_k: Option<u32>,
    /// Request-level extra body fields. Per SPEC_FULL.md §9's open question,
    /// these always win over a model's own `extra_params`; neither is ever
    /// merged field-by-field with the typed sampling fields above, which win
    /// over both.
    pub extra_body: BTreeMap<String, Value>,
    pub disable_thinking_hack: bool,
    pub think_bypass_tag: Option<String>,
    pub debug_enabled: bool,
    pub debug_tag: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub raw: Value,
}

/// Invoked once per token/content-delta while a streaming completion is in
/// flight. Implementations that need to retain the token beyond the call
/// must copy it — the callback receives a borrow into the transient line
/// buffer used while reading the SSE stream.
pub type TokenCallback<'a> = dyn FnMut(&str) + 'a;

pub trait ChatCompletionAdapter {
    fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, AgentError>;

    fn stream(
        &self,
        req: &CompletionRequest,
        on_token: &mut TokenCallback<'_>,
    ) -> Result<CompletionResponse, AgentError>;
}

/// OpenAI-chat-compatible adapter over a blocking HTTP client. Works against
/// any local or hosted endpoint that speaks the `/chat/completions` wire
/// format (llama.cpp server, vLLM, Ollama's OpenAI-compat route, etc).
pub struct HttpChatCompletionAdapter {
    client: Client,
}

impl HttpChatCompletionAdapter {
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::ProviderError(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    fn endpoint(&self, req: &CompletionRequest) -> Result<String, AgentError> {
        let model = req
            .model
            .as_ref()
            .ok_or_else(|| AgentError::ConfigError("completion request has no model".into()))?;
        Ok(model.endpoint.clone())
    }

    fn credential(&self, req: &CompletionRequest) -> Option<String> {
        req.model.as_ref().and_then(|m| m.credential.clone())
    }

    /// Build the wire messages, injecting the think-bypass assistant primer
    /// immediately after the last user message when requested (§6.1).
    fn wire_messages(&self, req: &CompletionRequest) -> Vec<Value> {
        let mut messages = req.messages.clone();
        if req.disable_thinking_hack {
            let tag = req
                .think_bypass_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_THINK_BYPASS_TAG.to_string());
            let insert_at = messages
                .iter()
                .rposition(|m| m.role == ChatRole::User)
                .map(|idx| idx + 1)
                .unwrap_or(messages.len());
            messages.insert(insert_at, ChatMessage::assistant(tag));
        }
        messages
            .iter()
            .map(|m| {
                json!({
                    "role": role_str(m.role),
                    "content": m.content,
                })
            })
            .collect()
    }

    fn payload(&self, req: &CompletionRequest, stream: bool) -> Value {
        let mut body = json!({});
        if let Some(model) = &req.model {
            for (k, v) in &model.extra_params {
                body[k] = v.clone();
            }
        }
        for (k, v) in &req.extra_body {
            body[k] = v.clone();
        }

        body["model"] = json!(req.model.as_ref().map(|m| m.model_name.clone()).unwrap_or_default());
        body["messages"] = json!(self.wire_messages(req));
        body["stream"] = json!(stream);
        if let Some(t) = req.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = req.max_tokens.or_else(|| req.model.as_ref().and_then(|m| m.max_tokens)) {
            body["max_tokens"] = json!(mt);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = json!(p);
        }
        if let Some(p) = req.min_p {
            body["min_p"] = json!(p);
        }
        if let Some(k) = req.top_k {
            body["top_k"] = json!(k);
        }
        body
    }
}

impl ChatCompletionAdapter for HttpChatCompletionAdapter {
    fn complete(&self, req: &CompletionRequest) -> Result<CompletionResponse, AgentError> {
        let endpoint = self.endpoint(req)?;
        let payload = self.payload(req, false);

        let mut builder = self.client.post(&endpoint).json(&payload);
        if let Some(key) = self.credential(req) {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .map_err(|e| AgentError::ProviderError(format!("transport error: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| AgentError::ProviderError(format!("failed to read response body: {e}")))?;
        if !status.is_success() {
            return Err(AgentError::ProviderError(format_http_error(status, &body)));
        }
        parse_non_streaming(&body)
    }

    fn stream(
        &self,
        req: &CompletionRequest,
        on_token: &mut TokenCallback<'_>,
    ) -> Result<CompletionResponse, AgentError> {
        let endpoint = self.endpoint(req)?;
        let payload = self.payload(req, true);

        let mut builder = self.client.post(&endpoint).json(&payload);
        if let Some(key) = self.credential(req) {
            builder = builder.bearer_auth(key);
        }
        let response = builder
            .send()
            .map_err(|e| AgentError::ProviderError(format!("transport error: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(AgentError::ProviderError(format_http_error(status, &body)));
        }

        let mut content = String::new();
        let reader = std::io::BufReader::new(response);
        for line in reader.lines() {
            let line = line.map_err(|e| AgentError::ProviderError(format!("stream read error: {e}")))?;
            let trimmed = line.trim();
            if !trimmed.starts_with("data:") {
                continue;
            }
            let chunk = trimmed.trim_start_matches("data:").trim();
            if chunk == "[DONE]" {
                break;
            }
            let Ok(value) = serde_json::from_str::<Value>(chunk) else {
                continue;
            };
            let Some(delta) = value
                .get("choices")
                .and_then(|c| c.as_array())
                .and_then(|a| a.first())
                .and_then(|c| c.get("delta"))
            else {
                continue;
            };
            if let Some(token) = delta.get("content").and_then(|v| v.as_str()) {
                content.push_str(token);
                on_token(token);
            }
        }

        Ok(CompletionResponse { content, raw: json!({ "streamed": true }) })
    }
}

fn role_str(role: ChatRole) -> &'static str {
    match role {
        ChatRole::System => "system",
        ChatRole::User => "user",
        ChatRole::Assistant => "assistant",
    }
}

fn parse_non_streaming(body: &str) -> Result<CompletionResponse, AgentError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| AgentError::ProviderError(format!("invalid JSON response: {e}")))?;
    let content = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|v| v.as_str())
        .ok_or_else(|| AgentError::ProviderError("response missing choices[0].message.content".into()))?
        .to_string();
    Ok(CompletionResponse { content, raw: value })
}

fn format_http_error(status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.get("message").or(Some(e))).and_then(|m| m.as_str().map(ToString::to_string)))
        .unwrap_or_else(|| body.chars().take(200).collect());
    format!("HTTP {}: {}", status.as_u16(), detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn adapter() -> HttpChatCompletionAdapter {
        HttpChatCompletionAdapter::new(Duration::from_secs(5)).unwrap()
    }

    fn model(endpoint: &str) -> ResolvedModel {
        ResolvedModel {
            id: "m".into(),
            provider: "local".into(),
            endpoint: endpoint.to_string(),
            credential: None,
            model_name: "test-model".into(),
            context_length: Some(8192),
            temperature: None,
            max_tokens: None,
            extra_params: BTreeMap::new(),
        }
    }

    #[test]
    fn think_bypass_inserts_primer_after_last_user_message() {
        let adapter = adapter();
        let req = CompletionRequest {
            model: Some(model("http://localhost:9")),
            messages: vec![ChatMessage::system("sys"), ChatMessage::user("hi")],
            disable_thinking_hack: true,
            ..Default::default()
        };
        let wire = adapter.wire_messages(&req);
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[2]["role"], "assistant");
        assert_eq!(wire[2]["content"], DEFAULT_THINK_BYPASS_TAG);
    }

    #[test]
    fn custom_think_bypass_tag_honored() {
        let adapter = adapter();
        let req = CompletionRequest {
            model: Some(model("http://localhost:9")),
            messages: vec![ChatMessage::user("hi")],
            disable_thinking_hack: true,
            think_bypass_tag: Some("<no-think/>".to_string()),
            ..Default::default()
        };
        let wire = adapter.wire_messages(&req);
        assert_eq!(wire[1]["content"], "<no-think/>");
    }

    #[test]
    fn payload_request_level_extra_body_wins_over_model_extra_params() {
        let adapter = adapter();
        let mut model = model("http://localhost:9");
        model.extra_params.insert("top_k".to_string(), json!(40));
        let mut extra_body = BTreeMap::new();
        extra_body.insert("top_k".to_string(), json!(7));
        let req = CompletionRequest {
            model: Some(model),
            messages: vec![ChatMessage::user("hi")],
            extra_body,
            ..Default::default()
        };
        let payload = adapter.payload(&req, false);
        assert_eq!(payload["top_k"], 7);
    }

    #[test]
    fn typed_sampling_field_wins_over_extra_body_and_model_params() {
        let adapter = adapter();
        let mut model = model("http://localhost:9");
        model.extra_params.insert("temperature".to_string(), json!(0.1));
        let mut extra_body = BTreeMap::new();
        extra_body.insert("temperature".to_string(), json!(0.2));
        let req = CompletionRequest {
            model: Some(model),
            messages: vec![ChatMessage::user("hi")],
            temperature: Some(0.7),
            extra_body,
            ..Default::default()
        };
        let payload = adapter.payload(&req, false);
        assert_eq!(payload["temperature"], 0.7);
    }

    #[test]
    fn parse_non_streaming_extracts_content() {
        let body = r#"{"choices":[{"message":{"content":"hello"}}]}"#;
        let got = parse_non_streaming(body).unwrap();
        assert_eq!(got.content, "hello");
    }

    #[test]
    fn missing_model_is_config_error() {
        let adapter = adapter();
        let req = CompletionRequest { messages: vec![ChatMessage::user("hi")], ..Default::default() };
        let err = adapter.complete(&req).unwrap_err();
        assert!(matches!(err, AgentError::ConfigError(_)));
    }
}
