//! OpenAI-compatible streaming chat client with tool round-trips.
//!
//! One [`ModelClient::stream`] call covers a whole model round: the request is
//! streamed, text deltas are forwarded to the caller as they arrive, and any
//! tool calls the model emits are executed against a [`ToolHandler`] and fed
//! back into the same conversation until the model reports a stop condition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

// ── Messages ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One tool invocation requested by the model.  `arguments` is the raw JSON
/// string exactly as the model produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    /// Speaker label ("Player", "Writer Agent", ...) — OpenRouter forwards it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, None, content)
    }

    pub fn user(name: Option<&str>, content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, name.map(String::from), content)
    }

    pub fn assistant(name: Option<&str>, content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, name.map(String::from), content)
    }

    pub fn tool_result(call: &ToolCall, content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Tool,
            name: Some(call.name.clone()),
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call.id.clone()),
        }
    }

    fn plain(role: ChatRole, name: Option<String>, content: impl Into<String>) -> Self {
        Self {
            role,
            name,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

// ── Call parameters ──────────────────────────────────────────────────────────

/// Per-phase model call settings.
#[derive(Debug, Clone)]
pub struct LlmParameters {
    pub model: String,
    pub max_tokens: u32,
    /// Stop sequence sent to the API; empty means none.
    pub stop_sequence: String,
    /// Ask for a plain JSON object response.
    pub json_output: bool,
    /// Strict structured-output schema; implies JSON output.
    pub schema: Option<serde_json::Value>,
    /// OpenRouter reasoning effort ("low" / "medium" / "high").
    pub reasoning_effort: Option<String>,
}

impl LlmParameters {
    pub fn text(model: impl Into<String>, max_tokens: u32, stop_sequence: &str) -> Self {
        Self {
            model: model.into(),
            max_tokens,
            stop_sequence: stop_sequence.to_string(),
            json_output: false,
            schema: None,
            reasoning_effort: None,
        }
    }

    pub fn json(model: impl Into<String>, max_tokens: u32) -> Self {
        Self {
            json_output: true,
            ..Self::text(model, max_tokens, "")
        }
    }
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },
}

// ── Capability traits ────────────────────────────────────────────────────────

/// Outcome of one tool execution.  Errors are carried as payloads, never
/// propagated across this boundary.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, name: &str, arguments: &str) -> ToolOutcome;
}

/// A tool handler that rejects every call.  Used by phases that expose no
/// tools to the model.
pub struct NoTools;

#[async_trait]
impl ToolHandler for NoTools {
    async fn call(&self, name: &str, _arguments: &str) -> ToolOutcome {
        ToolOutcome {
            content: format!("Tool \"{name}\" doesn't exist"),
            is_error: true,
        }
    }
}

/// Streaming model-call capability.
///
/// `messages` is mutated in place: the assistant response (and any tool
/// round-trip messages) are appended, exactly as they will be visible to a
/// follow-up call.  The returned string is the concatenated text content
/// produced across all rounds of the call.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        params: &LlmParameters,
        messages: &mut Vec<ChatMessage>,
        tools: Option<&serde_json::Value>,
        handler: &dyn ToolHandler,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError>;
}

// ── OpenRouter client ────────────────────────────────────────────────────────

/// How many times the initial request is re-sent on transport failure before
/// the error escalates to the caller (and fails the turn).
const MAX_TRANSPORT_RETRIES: usize = 3;

/// Ceiling on tool-call → result → re-prompt iterations per `stream` call.
const MAX_TOOL_ROUNDS: usize = 5;

#[derive(Debug, Clone)]
pub struct OpenRouterClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl OpenRouterClient {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    fn build_payload(
        &self,
        params: &LlmParameters,
        messages: &[ChatMessage],
        tools: Option<&serde_json::Value>,
    ) -> serde_json::Value {
        let wire_messages: Vec<serde_json::Value> = messages.iter().map(message_to_wire).collect();
        let mut payload = json!({
            "model": params.model,
            "messages": wire_messages,
            "stream": true,
            "max_tokens": params.max_tokens,
        });
        if !params.stop_sequence.is_empty() {
            payload["stop"] = json!([params.stop_sequence]);
        }
        if let Some(schema) = &params.schema {
            payload["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "Response", "strict": true, "schema": schema },
            });
        } else if params.json_output {
            payload["response_format"] = json!({ "type": "json_object" });
        }
        if let Some(effort) = &params.reasoning_effort {
            payload["reasoning"] = json!({ "effort": effort });
        }
        if let Some(tools) = tools {
            payload["tools"] = tools.clone();
        }
        payload
    }

    /// Send one request, retrying on transport failure.  Retries happen only
    /// before the first byte of the body is consumed, so the caller never
    /// sees duplicated deltas.
    async fn send(&self, payload: &serde_json::Value) -> Result<reqwest::Response, LlmError> {
        let endpoint = format!("{}/chat/completions", self.api_url.trim_end_matches('/'));
        let mut last_error = String::new();
        for attempt in 1..=MAX_TRANSPORT_RETRIES {
            let result = self
                .client
                .post(&endpoint)
                .bearer_auth(&self.api_key)
                .json(payload)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    return Err(LlmError::Api { status, body });
                }
                Err(error) => {
                    warn!(attempt, %error, "model request failed");
                    last_error = error.to_string();
                }
            }
        }
        Err(LlmError::Transport(last_error))
    }
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn stream(
        &self,
        params: &LlmParameters,
        messages: &mut Vec<ChatMessage>,
        tools: Option<&serde_json::Value>,
        handler: &dyn ToolHandler,
        on_delta: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, LlmError> {
        let mut full_text = String::new();

        for round in 0..MAX_TOOL_ROUNDS {
            let payload = self.build_payload(params, messages, tools);
            let mut response = self.send(&payload).await?;

            let mut content = String::new();
            let mut accumulator = ToolCallAccumulator::default();
            let mut finish_reason: Option<String> = None;
            let mut pending = String::new();

            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| LlmError::Transport(e.to_string()))?
            {
                pending.push_str(&String::from_utf8_lossy(&chunk));
                // SSE events are newline-delimited; a chunk may end mid-line.
                while let Some(offset) = pending.find('\n') {
                    let line = pending[..offset].trim().to_string();
                    pending.drain(..=offset);
                    let Some(event) = parse_sse_line(&line) else {
                        continue;
                    };
                    if let Some(text) = event.content {
                        content.push_str(&text);
                        on_delta(&text);
                    }
                    for delta in event.tool_calls {
                        accumulator.apply(delta);
                    }
                    if let Some(reason) = event.finish_reason {
                        finish_reason = Some(reason);
                    }
                }
            }

            let tool_calls = accumulator.finish();
            full_text.push_str(&content);
            messages.push(ChatMessage {
                role: ChatRole::Assistant,
                name: None,
                content,
                tool_calls: tool_calls.clone(),
                tool_call_id: None,
            });
            debug!(round, ?finish_reason, tool_calls = tool_calls.len(), "model round complete");

            if tool_calls.is_empty() {
                if finish_reason.as_deref() != Some("stop") {
                    // Truncated (length / content filter); nothing to feed back.
                    debug!(?finish_reason, "stream ended without stop");
                }
                break;
            }
            for call in &tool_calls {
                on_delta(&format!("\n[Calling tool \"{}\"...]\n", call.name));
                let outcome = handler.call(&call.name, &call.arguments).await;
                messages.push(ChatMessage::tool_result(call, outcome.content));
            }
        }

        Ok(full_text)
    }
}

/// Render one message in the chat completions wire shape.  Tool calls nest
/// under `function` objects; empty optional fields are omitted.
fn message_to_wire(message: &ChatMessage) -> serde_json::Value {
    let mut wire = json!({
        "role": message.role,
        "content": message.content,
    });
    if let Some(name) = &message.name {
        wire["name"] = json!(name);
    }
    if let Some(id) = &message.tool_call_id {
        wire["tool_call_id"] = json!(id);
    }
    if !message.tool_calls.is_empty() {
        wire["tool_calls"] = serde_json::Value::Array(
            message
                .tool_calls
                .iter()
                .map(|call| {
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": call.arguments },
                    })
                })
                .collect(),
        );
    }
    wire
}

// ── SSE parsing ──────────────────────────────────────────────────────────────

/// A single parsed server-sent event from the chat completions stream.
#[derive(Debug, Default)]
struct SseEvent {
    content: Option<String>,
    tool_calls: Vec<ToolCallDelta>,
    finish_reason: Option<String>,
}

/// A fragment of a tool call: fields arrive incrementally, keyed by `index`.
#[derive(Debug, Clone, Default, Deserialize)]
struct ToolCallDelta {
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data: ")?;
    if data == "[DONE]" {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    let choice = value.get("choices")?.get(0)?;
    let delta = choice.get("delta");

    let mut event = SseEvent::default();
    event.content = delta
        .and_then(|d| d.get("content"))
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(String::from);
    event.finish_reason = choice
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(String::from);
    if let Some(deltas) = delta
        .and_then(|d| d.get("tool_calls"))
        .and_then(|t| t.as_array())
    {
        event.tool_calls = deltas
            .iter()
            .filter_map(|d| serde_json::from_value(d.clone()).ok())
            .collect();
    }
    Some(event)
}

/// Reassembles streamed tool-call fragments into complete [`ToolCall`]s.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    calls: Vec<ToolCall>,
}

impl ToolCallAccumulator {
    fn apply(&mut self, delta: ToolCallDelta) {
        if self.calls.len() <= delta.index {
            self.calls.resize_with(delta.index + 1, ToolCall::default);
        }
        let call = &mut self.calls[delta.index];
        if let Some(id) = delta.id {
            call.id = id;
        }
        if let Some(function) = delta.function {
            if let Some(name) = function.name {
                call.name.push_str(&name);
            }
            if let Some(arguments) = function.arguments {
                call.arguments.push_str(&arguments);
            }
        }
    }

    fn finish(self) -> Vec<ToolCall> {
        self.calls
    }
}

// ── JSON response extraction ─────────────────────────────────────────────────

/// Strip a fenced ```json block down to its body, if present.
///
/// Models in JSON mode occasionally wrap the object in a code fence anyway;
/// parsing should tolerate both shapes.
pub fn clean_json_response(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Extract and deserialize the first JSON object found in a model response.
///
/// Tries a fenced ```json block first, then falls back to the outermost
/// `{...}` span.  Returns `None` when neither parses.
pub fn extract_json<T: serde::de::DeserializeOwned>(response: &str) -> Option<T> {
    if let Some(fence_start) = response.find("```json") {
        let after_fence = &response[fence_start + "```json".len()..];
        if let Some(fence_end) = after_fence.find("```") {
            if let Ok(value) = serde_json::from_str(after_fence[..fence_end].trim()) {
                return Some(value);
            }
        }
    }

    let trimmed = response.trim();
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str(&trimmed[start..=end]) {
                return Some(value);
            }
        }
    }

    None
}

/// Parse a JSON-mode model response.
///
/// First strips any code fence and parses the body directly; when that fails
/// falls back to [`extract_json`]'s span search.  The error is the direct
/// parse's message, which names what was malformed — that's what gets fed
/// back to the model on retry.
pub fn parse_json_response<T: serde::de::DeserializeOwned>(response: &str) -> Result<T, String> {
    match serde_json::from_str(clean_json_response(response)) {
        Ok(value) => Ok(value),
        Err(error) => extract_json(response).ok_or_else(|| error.to_string()),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
