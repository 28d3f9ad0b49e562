//! HTTP and WebSocket surface.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::error::OperatorError;
use crate::events::{ClientMessage, ControlMessage, ToolCallRecord};
use crate::registry::{build_agent_handle, AgentHandle, Capability};
use crate::relay::{Relay, SessionHandle};
use crate::runtime::{self, OrchestrationRuntime, RunMode};
use crate::session::TranscriptStore;
use crate::settings::{ComputerMode, Settings};

/// Unanswered pings tolerated before the connection is dropped.
const MAX_MISSED_PONGS: u32 = 3;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub agent: Arc<AgentHandle>,
    pub runtime: Arc<dyn OrchestrationRuntime>,
    pub relay: Relay,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let runtime = runtime::for_settings(&settings);
        Self::with_runtime(settings, runtime)
    }

    pub fn with_runtime(settings: Settings, runtime: Arc<dyn OrchestrationRuntime>) -> Self {
        let agent = Arc::new(build_agent_handle(&settings));
        let relay = Relay::new(runtime.clone(), agent.clone(), TranscriptStore::new());
        Self {
            settings: Arc::new(settings),
            agent,
            runtime,
            relay,
        }
    }

    fn keepalive(&self) -> Duration {
        Duration::from_secs(self.settings.keepalive_secs.max(1))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/run", post(run_task))
        .route("/ws", get(ws_upgrade))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> Json<Value> {
    Json(json!({
        "name": "Operator Agent API",
        "status": "running",
        "health": "/healthz",
    }))
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Health {
    pub ok: bool,
    pub websearch: bool,
    pub filesearch: bool,
    pub computer: ComputerMode,
    pub airtable: bool,
    pub mcp: bool,
    pub api_key_configured: bool,
    pub vector_store_configured: bool,
}

async fn healthz(State(state): State<AppState>) -> Json<Health> {
    let agent = &state.agent;
    Json(Health {
        ok: true,
        websearch: agent.has(Capability::WebSearch),
        filesearch: agent.has(Capability::FileSearch),
        computer: state.settings.computer_mode,
        airtable: agent.has(Capability::Airtable),
        mcp: agent.has(Capability::Mcp),
        api_key_configured: state.settings.has_openai(),
        vector_store_configured: state.settings.has_vector_store(),
    })
}

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub task: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModeFlags {
    pub mode: RunMode,
    pub used_file_search: bool,
    pub computer_mode: ComputerMode,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunResponse {
    pub result: String,
    pub steps: Vec<ToolCallRecord>,
    pub mode_flags: ModeFlags,
}

async fn run_task(State(state): State<AppState>, Json(request): Json<RunRequest>) -> Json<RunResponse> {
    tracing::info!("[server] running task: {}", request.task.chars().take(100).collect::<String>());

    // events are not streamed on this endpoint; the receiver just keeps sends alive
    let (events, _drain) = mpsc::unbounded_channel();
    let runtime = state.runtime.clone();
    let agent = state.agent.clone();
    let task = request.task;
    let joined = tokio::spawn(async move { runtime.run(&agent, &task, events).await }).await;

    let computer_mode = state.settings.computer_mode;
    let response = match joined {
        Ok(Ok(output)) => RunResponse {
            result: output.final_text,
            steps: output.tool_calls,
            mode_flags: ModeFlags {
                mode: output.mode,
                used_file_search: output.used_file_search,
                computer_mode,
            },
        },
        failure => {
            let err = match failure {
                Ok(Err(e)) => OperatorError::from(e),
                _ => OperatorError::RuntimeInvocationFailed("runtime panicked".to_string()),
            };
            tracing::error!("[server] task failed: {}", err);
            RunResponse {
                result: format!("I encountered an error while processing your request: {err}"),
                steps: Vec::new(),
                mode_flags: ModeFlags {
                    mode: RunMode::Error,
                    used_file_search: false,
                    computer_mode,
                },
            }
        }
    };
    Json(response)
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub session_id: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.session_id))
}

/// Counts pings the client has not answered since its last frame.
#[derive(Debug)]
struct Keepalive {
    missed: u32,
    limit: u32,
}

impl Keepalive {
    fn new(limit: u32) -> Self {
        Self { missed: 0, limit }
    }

    /// Called on each interval tick before a ping goes out.
    fn on_tick(&mut self) -> Result<(), OperatorError> {
        if self.missed > self.limit {
            return Err(OperatorError::ConnectionLost(format!("{} keepalive pings unanswered", self.missed)));
        }
        self.missed += 1;
        Ok(())
    }

    fn on_activity(&mut self) {
        self.missed = 0;
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, resume: Option<String>) {
    let (mut session, mut outbound) = state.relay.open_session(resume).await;
    let backlog = session.backlog();
    let (mut sink, mut inbound) = socket.split();

    let mut ticker = tokio::time::interval(state.keepalive());
    ticker.tick().await;
    let mut keepalive = Keepalive::new(MAX_MISSED_PONGS);

    let reason = loop {
        tokio::select! {
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::error!("[server] failed to encode message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text)).await {
                    break OperatorError::ConnectionLost(e.to_string());
                }
            }
            () = backlog.notified() => {
                break OperatorError::ConnectionLost("client stopped reading, outbound queue full".to_string());
            }
            _ = ticker.tick() => {
                if let Err(e) = keepalive.on_tick() {
                    let _ = sink.send(Message::Close(None)).await;
                    break e;
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    break OperatorError::ConnectionLost(e.to_string());
                }
            }
            incoming = inbound.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    keepalive.on_activity();
                    dispatch(&mut session, &text).await;
                }
                Some(Ok(Message::Pong(_) | Message::Ping(_))) => keepalive.on_activity(),
                Some(Ok(Message::Binary(_))) => {
                    tracing::warn!("[server] session {} sent a binary frame, ignoring", session.id());
                }
                Some(Ok(Message::Close(_))) | None => {
                    break OperatorError::ConnectionLost("client disconnected".to_string());
                }
                Some(Err(e)) => break OperatorError::ConnectionLost(e.to_string()),
            },
        }
    };

    tracing::info!("[server] session {} ending: {}", session.id(), reason);
    session.close().await;
}

async fn dispatch(session: &mut SessionHandle, text: &str) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!("[server] session {} dropped malformed message: {}", session.id(), e);
            return;
        }
    };

    match message {
        ClientMessage::Task { task } => {
            if let Err(e) = session.submit_task(&task).await {
                let reason = OperatorError::from(e).to_string();
                tracing::warn!("[server] session {} rejected task: {}", session.id(), reason);
                session.send_control(ControlMessage::Rejected { reason });
            }
        }
        ClientMessage::Ping => session.send_control(ControlMessage::Pong),
        ClientMessage::GetHistory => {
            let messages = session.history().await;
            session.send_control(ControlMessage::History { messages });
        }
        ClientMessage::ClearHistory => {
            session.clear_history().await;
            session.send_control(ControlMessage::HistoryCleared);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ServerMessage, StreamEvent};
    use crate::relay::MessageReceiver;

    async fn open(state: &AppState) -> (SessionHandle, MessageReceiver) {
        let (session, mut rx) = state.relay.open_session(None).await;
        assert!(matches!(rx.recv().await, Some(ServerMessage::Event(StreamEvent::SessionInfo { .. }))));
        (session, rx)
    }

    #[tokio::test]
    async fn test_dispatch_control_messages() {
        let state = AppState::new(Settings::default());
        let (mut session, mut rx) = open(&state).await;

        dispatch(&mut session, r#"{"type":"ping"}"#).await;
        assert_eq!(rx.recv().await, Some(ServerMessage::from(ControlMessage::Pong)));

        dispatch(&mut session, r#"{"type":"get_history"}"#).await;
        assert_eq!(rx.recv().await, Some(ServerMessage::from(ControlMessage::History { messages: Vec::new() })));

        dispatch(&mut session, r#"{"type":"clear_history"}"#).await;
        assert_eq!(rx.recv().await, Some(ServerMessage::from(ControlMessage::HistoryCleared)));
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let state = AppState::new(Settings::default());
        let (mut session, mut rx) = open(&state).await;
        dispatch(&mut session, "{not json").await;
        dispatch(&mut session, r#"{"type":"unknown"}"#).await;
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_keepalive_drops_after_missed_pongs() {
        let mut keepalive = Keepalive::new(MAX_MISSED_PONGS);
        for _ in 0..=MAX_MISSED_PONGS {
            assert!(keepalive.on_tick().is_ok());
        }
        assert!(matches!(keepalive.on_tick(), Err(OperatorError::ConnectionLost(_))));
    }

    #[test]
    fn test_keepalive_activity_resets_count() {
        let mut keepalive = Keepalive::new(MAX_MISSED_PONGS);
        for _ in 0..20 {
            assert!(keepalive.on_tick().is_ok());
            keepalive.on_activity();
        }
        assert_eq!(keepalive.missed, 0);
    }

    #[tokio::test]
    async fn test_empty_task_is_rejected() {
        let state = AppState::new(Settings::default());
        let (mut session, mut rx) = open(&state).await;
        dispatch(&mut session, r#"{"type":"task"}"#).await;
        match rx.recv().await {
            Some(ServerMessage::Control(ControlMessage::Rejected { reason })) => {
                assert!(reason.contains("task is empty"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
