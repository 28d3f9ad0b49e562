//! Streaming session relay.
//!
//! Each session owns one outbound queue. A submitted task runs as its own
//! tokio task that forwards runtime events in arrival order and finishes with
//! exactly one terminal event. Closing the session aborts that task.

use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::error::OperatorError;
use crate::events::{ControlMessage, ScreenshotRecord, ServerMessage, StreamEvent};
use crate::registry::AgentHandle;
use crate::runtime::{OrchestrationRuntime, RuntimeEvent};
use crate::session::{ConnectionState, Role, TranscriptEntry, TranscriptStore, Turn, TurnOutcome};

const STREAM_START_MESSAGE: &str = "Processing...";
/// Messages a client may leave unread before its session is dropped.
const OUTBOUND_CAPACITY: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("a task is already running in this session")]
    TurnInFlight,
    #[error("session is closed")]
    SessionClosed,
    #[error("task is empty")]
    EmptyTask,
}

pub type MessageReceiver = mpsc::Receiver<ServerMessage>;

/// Bounded per-session queue. A full queue raises `backlog` instead of
/// blocking the turn.
#[derive(Clone)]
struct Outbox {
    tx: mpsc::Sender<ServerMessage>,
    backlog: Arc<Notify>,
}

impl Outbox {
    fn send(&self, message: impl Into<ServerMessage>) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(message.into()) {
            self.backlog.notify_one();
        }
    }
}

/// Shared entry point for opening sessions.
#[derive(Clone)]
pub struct Relay {
    runtime: Arc<dyn OrchestrationRuntime>,
    agent: Arc<AgentHandle>,
    transcripts: TranscriptStore,
    outbound_capacity: usize,
}

impl Relay {
    pub fn new(runtime: Arc<dyn OrchestrationRuntime>, agent: Arc<AgentHandle>, transcripts: TranscriptStore) -> Self {
        Self {
            runtime,
            agent,
            transcripts,
            outbound_capacity: OUTBOUND_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_outbound_capacity(mut self, capacity: usize) -> Self {
        self.outbound_capacity = capacity.max(1);
        self
    }

    /// Open a session, resuming `resume` when that id has a detached
    /// transcript. `session_info` is already queued on the returned receiver.
    pub async fn open_session(&self, resume: Option<String>) -> (SessionHandle, MessageReceiver) {
        let (tx, rx) = mpsc::channel(self.outbound_capacity);
        let outbox = Outbox {
            tx,
            backlog: Arc::new(Notify::new()),
        };
        let (id, resumed) = self.transcripts.attach(resume.as_deref()).await;
        let history = self.transcripts.history(&id).await;

        tracing::info!(
            "[relay] session {} opened ({}, {} prior messages, {} transcripts held)",
            id,
            if resumed { "resumed" } else { "new" },
            history.len(),
            self.transcripts.session_count().await
        );
        outbox.send(StreamEvent::SessionInfo { session_id: id.clone(), history });

        let handle = SessionHandle {
            id,
            state: ConnectionState::Open,
            relay: self.clone(),
            outbox,
            turn: Arc::new(Mutex::new(None)),
            task: None,
        };
        (handle, rx)
    }
}

pub struct SessionHandle {
    id: String,
    state: ConnectionState,
    relay: Relay,
    outbox: Outbox,
    turn: Arc<Mutex<Option<Turn>>>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Signalled when the outbound queue overflowed because the client
    /// stopped reading.
    pub fn backlog(&self) -> Arc<Notify> {
        self.outbox.backlog.clone()
    }

    /// Snapshot of the current (or last) assistant turn.
    pub async fn current_turn(&self) -> Option<Turn> {
        self.turn.lock().await.clone()
    }

    pub async fn is_busy(&self) -> bool {
        self.turn.lock().await.as_ref().is_some_and(|t| !t.is_complete())
    }

    pub async fn submit_task(&mut self, text: &str) -> Result<(), RelayError> {
        if self.state == ConnectionState::Closed {
            return Err(RelayError::SessionClosed);
        }
        let task = text.trim();
        if task.is_empty() {
            return Err(RelayError::EmptyTask);
        }

        {
            let mut slot = self.turn.lock().await;
            if slot.as_ref().is_some_and(|t| !t.is_complete()) {
                return Err(RelayError::TurnInFlight);
            }
            *slot = Some(Turn::assistant());
        }

        self.relay
            .transcripts
            .append(&self.id, TranscriptEntry::new(Role::User, task))
            .await;
        self.outbox.send(StreamEvent::StreamStart { message: STREAM_START_MESSAGE.to_string() });
        tracing::info!("[relay] session {} task: {}", self.id, task.chars().take(100).collect::<String>());

        let driver = TurnDriver {
            session_id: self.id.clone(),
            relay: self.relay.clone(),
            outbox: self.outbox.clone(),
            turn: self.turn.clone(),
        };
        self.task = Some(tokio::spawn(driver.run(task.to_string())));
        Ok(())
    }

    pub async fn history(&self) -> Vec<TranscriptEntry> {
        self.relay.transcripts.history(&self.id).await
    }

    pub async fn clear_history(&self) {
        self.relay.transcripts.clear(&self.id).await;
        tracing::info!("[relay] session {} history cleared", self.id);
    }

    /// Queue a reply that is not part of any turn.
    pub fn send_control(&self, message: ControlMessage) {
        self.outbox.send(message);
    }

    /// Abort any in-flight turn and release the transcript for later
    /// resumption. Nothing is emitted after this returns.
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.state = ConnectionState::Closed;
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(turn) = self.turn.lock().await.as_mut() {
            if turn.finish(TurnOutcome::Abandoned).is_ok() {
                tracing::info!("[relay] session {} closed with a turn in flight, abandoned", self.id);
            }
        }
        self.relay.transcripts.detach(&self.id).await;
        tracing::info!("[relay] session {} closed", self.id);
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if self.state != ConnectionState::Closed {
            let transcripts = self.relay.transcripts.clone();
            let id = std::mem::take(&mut self.id);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { transcripts.detach(&id).await });
            }
        }
    }
}

/// Runs one turn to completion inside its own task.
struct TurnDriver {
    session_id: String,
    relay: Relay,
    outbox: Outbox,
    turn: Arc<Mutex<Option<Turn>>>,
}

impl TurnDriver {
    async fn run(self, task: String) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let runtime = self.relay.runtime.clone();
        let agent = self.relay.agent.clone();

        let invocation = AssertUnwindSafe(async move { runtime.run(&agent, &task, events_tx).await }).catch_unwind();

        let forward = async {
            let mut streamed = false;
            while let Some(event) = events_rx.recv().await {
                if !self.forward(event, &mut streamed).await {
                    break;
                }
            }
            streamed
        };

        let (result, streamed) = tokio::join!(invocation, forward);

        let outcome = match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(OperatorError::from(e).to_string()),
            Err(_) => Err(OperatorError::RuntimeInvocationFailed("runtime panicked".to_string()).to_string()),
        };

        let mut slot = self.turn.lock().await;
        let Some(turn) = slot.as_mut().filter(|t| !t.is_complete()) else {
            return;
        };

        match outcome {
            Ok(output) => {
                if !streamed && !output.final_text.is_empty() && turn.content().is_empty() {
                    let _ = turn.set_text(&output.final_text);
                    self.send(StreamEvent::TextComplete { content: output.final_text.clone() });
                }
                let final_text = if turn.content().is_empty() {
                    output.final_text
                } else {
                    turn.content().to_string()
                };
                let _ = turn.set_text(&final_text);
                let _ = turn.finish(TurnOutcome::Completed);
                let tool_calls = turn.tool_calls().to_vec();
                let screenshots = turn.screenshots().len();

                self.relay
                    .transcripts
                    .append(&self.session_id, TranscriptEntry::new(Role::Assistant, final_text.clone()))
                    .await;
                tracing::info!(
                    "[relay] session {} turn complete ({} chars, {} tool calls, {} screenshots)",
                    self.session_id,
                    final_text.len(),
                    tool_calls.len(),
                    screenshots
                );
                self.send(StreamEvent::StreamComplete { final_text, tool_calls });
            }
            Err(error) => {
                let _ = turn.finish(TurnOutcome::Failed);
                tracing::error!("[relay] session {} turn failed: {}", self.session_id, error);
                self.send(StreamEvent::Error { error });
            }
        }
    }

    /// Record one runtime event on the turn and emit it. Returns false once
    /// the turn is no longer in flight.
    ///
    /// Text is always appended to the turn. Once any delta has gone out, a
    /// completed block is sent as a delta too, so the deltas still add up to
    /// the final text.
    async fn forward(&self, event: RuntimeEvent, streamed: &mut bool) -> bool {
        let mut slot = self.turn.lock().await;
        let Some(turn) = slot.as_mut().filter(|t| !t.is_complete()) else {
            return false;
        };

        match event {
            RuntimeEvent::TextDelta(content) => {
                let _ = turn.append_text(&content);
                *streamed = true;
                self.send(StreamEvent::TextDelta { content });
            }
            RuntimeEvent::TextComplete(content) => {
                let _ = turn.append_text(&content);
                if *streamed {
                    self.send(StreamEvent::TextDelta { content });
                } else {
                    self.send(StreamEvent::TextComplete { content });
                }
            }
            RuntimeEvent::ToolCall(tool) => {
                let _ = turn.push_tool_call(tool.clone());
                self.send(StreamEvent::ToolCall { tool });
            }
            RuntimeEvent::Screenshot { action, image } => {
                let _ = turn.push_screenshot(ScreenshotRecord {
                    action: action.clone(),
                    image: image.clone(),
                    format: "png".to_string(),
                    timestamp: chrono::Utc::now(),
                });
                self.send(StreamEvent::Screenshot { action, image, format: "png".to_string() });
            }
        }
        true
    }

    fn send(&self, event: StreamEvent) {
        self.outbox.send(event);
    }
}
