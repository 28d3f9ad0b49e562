//! Orchestration runtime clients.
//!
//! `ResponsesRuntime` drives the OpenAI Responses API over SSE and runs local
//! function tools between responses. `DemoRuntime` answers without any
//! credential so the HTTP and WebSocket surfaces stay usable.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::events::ToolCallRecord;
use crate::rate_limiter::{RateLimiter, Usage};
use crate::registry::{AgentHandle, TurnTools};
use crate::settings::Settings;

/// Upper bound on response/tool round trips within one run.
const MAX_ITERATIONS: usize = 25;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No API key set")]
    NoApiKey,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Stream error: {0}")]
    Stream(String),
    #[error("No final answer after {0} tool iterations")]
    IterationLimit(usize),
}

impl RuntimeError {
    pub fn is_rate_limited(&self) -> bool {
        match self {
            Self::Api { status, message } => {
                *status == 429 || message.to_lowercase().contains("rate limit")
            }
            _ => false,
        }
    }
}

/// What a runtime reports while it works. The relay maps each one onto
/// exactly one streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    TextDelta(String),
    TextComplete(String),
    ToolCall(ToolCallRecord),
    Screenshot { action: String, image: String },
}

pub type EventSender = mpsc::UnboundedSender<RuntimeEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Live,
    Demo,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub final_text: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub used_file_search: bool,
    pub mode: RunMode,
}

#[async_trait]
pub trait OrchestrationRuntime: Send + Sync {
    fn mode(&self) -> RunMode;

    async fn run(
        &self,
        agent: &AgentHandle,
        task: &str,
        events: EventSender,
    ) -> Result<RunOutput, RuntimeError>;
}

/// Pick the runtime the settings allow: live with a credential, demo without.
pub fn for_settings(settings: &Settings) -> Arc<dyn OrchestrationRuntime> {
    match ResponsesRuntime::new(settings) {
        Ok(runtime) => Arc::new(runtime),
        Err(e) => {
            tracing::warn!("[runtime] {}, running in demo mode", crate::error::OperatorError::from(e));
            Arc::new(DemoRuntime)
        }
    }
}

// ============================================================
// SSE decoding
// ============================================================

/// Incremental decoder for `text/event-stream` bodies. Yields the JSON
/// payload of each complete `data:` frame.
#[derive(Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let frame: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            let text = String::from_utf8_lossy(&frame);
            let data = text
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim_start)
                .collect::<Vec<_>>()
                .join("\n");
            if data.is_empty() || data == "[DONE]" {
                continue;
            }
            match serde_json::from_str(&data) {
                Ok(value) => frames.push(value),
                Err(e) => tracing::warn!("[runtime] skipping malformed SSE frame: {}", e),
            }
        }
        frames
    }
}

// ============================================================
// Responses API runtime
// ============================================================

#[derive(Debug, Clone)]
struct FunctionCall {
    name: String,
    arguments: String,
    call_id: String,
}

/// Everything one streamed response produced.
#[derive(Debug, Default)]
struct StreamedResponse {
    id: Option<String>,
    streamed_text: String,
    completed_text: Option<String>,
    calls: Vec<FunctionCall>,
    usage: Option<Usage>,
}

pub struct ResponsesRuntime {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
    limiter: RateLimiter,
}

impl ResponsesRuntime {
    pub fn new(settings: &Settings) -> Result<Self, RuntimeError> {
        let api_key = settings.openai_api_key.clone().ok_or(RuntimeError::NoApiKey)?;
        Ok(Self {
            api_key,
            model: settings.openai_model.clone(),
            base_url: settings.openai_base_url.clone(),
            http: reqwest::Client::new(),
            limiter: RateLimiter::new(),
        })
    }

    fn request_body(&self, agent: &AgentHandle, input: Value, previous: Option<&str>) -> Value {
        let mut body = json!({
            "model": self.model,
            "instructions": agent.instructions(),
            "input": input,
            "stream": true,
        });
        let tools = agent.tool_definitions();
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(id) = previous {
            body["previous_response_id"] = json!(id);
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response, RuntimeError> {
        let response = self
            .http
            .post(format!("{}/responses", self.base_url))
            .bearer_auth(&self.api_key)
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or(text);
        Err(RuntimeError::Api { status: status.as_u16(), message })
    }

    async fn stream_response(
        &self,
        body: &Value,
        events: &EventSender,
        hosted: &mut HostedToolLog,
    ) -> Result<StreamedResponse, RuntimeError> {
        let response = self.limiter.execute_with_retry(|_| self.send(body)).await?;

        let mut out = StreamedResponse::default();
        let mut decoder = SseDecoder::default();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in decoder.push(&chunk) {
                if handle_event(&event, &mut out, events, hosted)? {
                    return Ok(out);
                }
            }
        }

        if out.id.is_none() {
            return Err(RuntimeError::Stream("stream ended before response.completed".to_string()));
        }
        Ok(out)
    }
}

/// Hosted tools (web/file search) run server side; we only record them.
#[derive(Debug, Default)]
struct HostedToolLog {
    records: Vec<ToolCallRecord>,
    used_file_search: bool,
}

/// Apply one SSE event. Returns true once the response is complete.
fn handle_event(
    event: &Value,
    out: &mut StreamedResponse,
    events: &EventSender,
    hosted: &mut HostedToolLog,
) -> Result<bool, RuntimeError> {
    let kind = event["type"].as_str().unwrap_or_default();
    match kind {
        "response.created" => {
            out.id = event["response"]["id"].as_str().map(str::to_string);
        }
        "response.output_text.delta" => {
            if let Some(delta) = event["delta"].as_str().filter(|d| !d.is_empty()) {
                out.streamed_text.push_str(delta);
                let _ = events.send(RuntimeEvent::TextDelta(delta.to_string()));
            }
        }
        "response.output_item.done" => {
            let item = &event["item"];
            match item["type"].as_str().unwrap_or_default() {
                "function_call" => out.calls.push(FunctionCall {
                    name: item["name"].as_str().unwrap_or_default().to_string(),
                    arguments: item["arguments"].as_str().unwrap_or("{}").to_string(),
                    call_id: item["call_id"].as_str().unwrap_or_default().to_string(),
                }),
                "web_search_call" => {
                    let record = ToolCallRecord::ok("WebSearch", "Searched the web");
                    hosted.records.push(record.clone());
                    let _ = events.send(RuntimeEvent::ToolCall(record));
                }
                "file_search_call" => {
                    let mut record = ToolCallRecord::ok("FileSearch", "Searched internal documentation");
                    if let Some(queries) = item.get("queries").filter(|q| q.is_array()) {
                        record = record.with_params(json!({ "queries": queries }));
                    }
                    hosted.used_file_search = true;
                    hosted.records.push(record.clone());
                    let _ = events.send(RuntimeEvent::ToolCall(record));
                }
                other => tracing::debug!("[runtime] output item: {}", other),
            }
        }
        "response.completed" => {
            let response = &event["response"];
            out.id = response["id"].as_str().map(str::to_string).or(out.id.take());
            out.usage = serde_json::from_value(response["usage"].clone()).ok();
            out.completed_text = output_text(response);
            return Ok(true);
        }
        "response.failed" | "response.incomplete" => {
            let message = event["response"]["error"]["message"]
                .as_str()
                .unwrap_or("response did not complete");
            return Err(RuntimeError::Stream(message.to_string()));
        }
        "error" => {
            let message = event["message"]
                .as_str()
                .or_else(|| event["error"]["message"].as_str())
                .unwrap_or("unknown error");
            return Err(RuntimeError::Api { status: 500, message: message.to_string() });
        }
        _ => {}
    }
    Ok(false)
}

/// Concatenate all `output_text` parts of a completed response.
fn output_text(response: &Value) -> Option<String> {
    let text: String = response["output"]
        .as_array()?
        .iter()
        .filter(|item| item["type"] == "message")
        .filter_map(|item| item["content"].as_array())
        .flatten()
        .filter(|part| part["type"] == "output_text")
        .filter_map(|part| part["text"].as_str())
        .collect();
    (!text.is_empty()).then_some(text)
}

#[async_trait]
impl OrchestrationRuntime for ResponsesRuntime {
    fn mode(&self) -> RunMode {
        RunMode::Live
    }

    async fn run(
        &self,
        agent: &AgentHandle,
        task: &str,
        events: EventSender,
    ) -> Result<RunOutput, RuntimeError> {
        tracing::info!(
            "[runtime] run starting (model: {}, tools: {})",
            self.model,
            agent.tool_definitions().len()
        );

        let mut tools = TurnTools::new(agent.settings(), events.clone());
        let mut hosted = HostedToolLog::default();
        let mut local_records = Vec::new();
        let mut final_text = String::new();

        let mut input = json!([{ "role": "user", "content": task }]);
        let mut previous: Option<String> = None;

        for iteration in 1..=MAX_ITERATIONS {
            if iteration <= 3 || iteration % 5 == 0 {
                tracing::info!("[runtime] iteration {}", iteration);
            }

            let body = self.request_body(agent, input, previous.as_deref());
            let response = self.stream_response(&body, &events, &mut hosted).await?;
            if let Some(usage) = response.usage {
                self.limiter.record_usage(usage).await;
            }

            if response.streamed_text.is_empty() {
                if let Some(text) = &response.completed_text {
                    let _ = events.send(RuntimeEvent::TextComplete(text.clone()));
                    final_text.push_str(text);
                }
            } else {
                final_text.push_str(&response.streamed_text);
            }

            if response.calls.is_empty() {
                let mut tool_calls = hosted.records;
                tool_calls.extend(local_records);
                return Ok(RunOutput {
                    final_text,
                    tool_calls,
                    used_file_search: hosted.used_file_search,
                    mode: RunMode::Live,
                });
            }

            let mut outputs = Vec::with_capacity(response.calls.len());
            for call in &response.calls {
                let invocation = agent.invoke(&call.name, &call.arguments, &mut tools).await;
                let _ = events.send(RuntimeEvent::ToolCall(invocation.record.clone()));
                local_records.push(invocation.record);
                outputs.push(json!({
                    "type": "function_call_output",
                    "call_id": call.call_id,
                    "output": invocation.output,
                }));
            }

            input = Value::Array(outputs);
            previous = response.id;
        }

        Err(RuntimeError::IterationLimit(MAX_ITERATIONS))
    }
}

// ============================================================
// Demo runtime
// ============================================================

/// Credential-free runtime. Streams an explanatory answer and calls no tools.
pub struct DemoRuntime;

impl DemoRuntime {
    pub fn answer(task: &str) -> String {
        format!(
            "I'm running in demo mode without an OpenAI API key. \
             To use WebSearch and other tools, please set your OPENAI_API_KEY in the .env file. \
             Your task was: '{task}'"
        )
    }
}

#[async_trait]
impl OrchestrationRuntime for DemoRuntime {
    fn mode(&self) -> RunMode {
        RunMode::Demo
    }

    async fn run(
        &self,
        _agent: &AgentHandle,
        task: &str,
        events: EventSender,
    ) -> Result<RunOutput, RuntimeError> {
        let text = Self::answer(task);
        for word in text.split_inclusive(' ') {
            let _ = events.send(RuntimeEvent::TextDelta(word.to_string()));
        }
        Ok(RunOutput {
            final_text: text,
            tool_calls: Vec::new(),
            used_file_search: false,
            mode: RunMode::Demo,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::build_agent_handle;
    use axum::routing::post;
    use axum::{Json, Router};

    #[test]
    fn test_sse_decoder_handles_split_frames() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"event: response.output_text.delta\ndata: {\"type\":\"response.out").is_empty());
        let frames = decoder.push(b"put_text.delta\",\"delta\":\"Hi\"}\r\n\r\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["delta"], "Hi");
    }

    #[test]
    fn test_sse_decoder_skips_garbage() {
        let mut decoder = SseDecoder::default();
        let frames = decoder.push(b"data: not json\n\ndata: {\"type\":\"x\"}\n\n");
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_rate_limit_detection() {
        assert!(RuntimeError::Api { status: 429, message: String::new() }.is_rate_limited());
        assert!(RuntimeError::Api { status: 400, message: "Rate limit reached".into() }.is_rate_limited());
        assert!(!RuntimeError::Stream("429".into()).is_rate_limited());
    }

    #[test]
    fn test_output_text_from_completed_response() {
        let response = json!({
            "output": [
                {"type": "web_search_call"},
                {"type": "message", "content": [{"type": "output_text", "text": "Hello"}, {"type": "output_text", "text": " there"}]}
            ]
        });
        assert_eq!(output_text(&response).as_deref(), Some("Hello there"));
        assert_eq!(output_text(&json!({"output": []})), None);
    }

    #[tokio::test]
    async fn test_demo_runtime_streams_its_answer() {
        let agent = build_agent_handle(&Settings::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = DemoRuntime.run(&agent, "ping", tx).await.unwrap();
        assert_eq!(output.mode, RunMode::Demo);
        assert!(output.final_text.contains("'ping'"));

        let mut streamed = String::new();
        while let Some(RuntimeEvent::TextDelta(d)) = rx.recv().await {
            streamed.push_str(&d);
        }
        assert_eq!(streamed, output.final_text);
    }

    fn sse(events: &[Value]) -> String {
        events.iter().map(|e| format!("event: {}\ndata: {}\n\n", e["type"].as_str().unwrap(), e)).collect()
    }

    async fn spawn_fake_responses_api() -> String {
        let app = Router::new().route(
            "/responses",
            post(|Json(body): Json<Value>| async move {
                let frames = if body.get("previous_response_id").is_none() {
                    assert_eq!(body["input"][0]["content"], "open the shop");
                    sse(&[
                        json!({"type": "response.created", "response": {"id": "resp_1"}}),
                        json!({"type": "response.output_item.done", "item": {"type": "web_search_call", "id": "ws_1"}}),
                        json!({"type": "response.output_item.done", "item": {
                            "type": "function_call",
                            "name": "computer",
                            "call_id": "call_1",
                            "arguments": "{\"type\":\"navigate\",\"url\":\"mock://shop\"}"
                        }}),
                        json!({"type": "response.completed", "response": {"id": "resp_1", "output": [], "usage": {"input_tokens": 10, "output_tokens": 5}}}),
                    ])
                } else {
                    assert_eq!(body["previous_response_id"], "resp_1");
                    assert_eq!(body["input"][0]["type"], "function_call_output");
                    assert_eq!(body["input"][0]["call_id"], "call_1");
                    sse(&[
                        json!({"type": "response.created", "response": {"id": "resp_2"}}),
                        json!({"type": "response.output_text.delta", "delta": "Opened "}),
                        json!({"type": "response.output_text.delta", "delta": "the shop."}),
                        json!({"type": "response.completed", "response": {"id": "resp_2", "output": []}}),
                    ])
                };
                ([(axum::http::header::CONTENT_TYPE, "text/event-stream")], frames)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_function_tool_loop() {
        let settings = Settings {
            openai_api_key: Some("sk-test".into()),
            openai_base_url: spawn_fake_responses_api().await,
            ..Settings::default()
        };
        let agent = build_agent_handle(&settings);
        let runtime = ResponsesRuntime::new(&settings).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let output = runtime.run(&agent, "open the shop", tx).await.unwrap();
        assert_eq!(output.final_text, "Opened the shop.");
        let names: Vec<_> = output.tool_calls.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["WebSearch", "ComputerTool"]);
        assert!(!output.tool_calls[1].is_error());

        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                RuntimeEvent::TextDelta(_) => "delta",
                RuntimeEvent::TextComplete(_) => "complete",
                RuntimeEvent::ToolCall(_) => "tool",
                RuntimeEvent::Screenshot { .. } => "screenshot",
            });
        }
        assert_eq!(kinds, ["tool", "screenshot", "tool", "delta", "delta"]);
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let app = Router::new().route(
            "/responses",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    Json(json!({"error": {"message": "Incorrect API key provided"}})),
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let settings = Settings {
            openai_api_key: Some("sk-bad".into()),
            openai_base_url: format!("http://{addr}"),
            ..Settings::default()
        };
        let agent = build_agent_handle(&settings);
        let runtime = ResponsesRuntime::new(&settings).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        match runtime.run(&agent, "hi", tx).await {
            Err(RuntimeError::Api { status: 401, message }) => assert!(message.contains("Incorrect API key")),
            other => panic!("expected api error, got {other:?}"),
        }
    }
}
