//! Sessions, turns, and the in-process transcript store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::events::{ScreenshotRecord, ToolCallRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Open,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl TranscriptEntry {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    InFlight,
    Completed,
    Failed,
    Abandoned,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("turn is already complete")]
pub struct TurnFrozen;

/// One request/response cycle. Mutable only while in flight.
#[derive(Debug, Clone)]
pub struct Turn {
    pub role: Role,
    content: String,
    outcome: TurnOutcome,
    tool_calls: Vec<ToolCallRecord>,
    screenshots: Vec<ScreenshotRecord>,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn assistant() -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            outcome: TurnOutcome::InFlight,
            tool_calls: Vec::new(),
            screenshots: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn outcome(&self) -> TurnOutcome {
        self.outcome
    }

    pub fn is_complete(&self) -> bool {
        self.outcome != TurnOutcome::InFlight
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    pub fn screenshots(&self) -> &[ScreenshotRecord] {
        &self.screenshots
    }

    fn ensure_open(&self) -> Result<(), TurnFrozen> {
        if self.is_complete() {
            Err(TurnFrozen)
        } else {
            Ok(())
        }
    }

    pub fn append_text(&mut self, delta: &str) -> Result<(), TurnFrozen> {
        self.ensure_open()?;
        self.content.push_str(delta);
        Ok(())
    }

    pub fn set_text(&mut self, text: &str) -> Result<(), TurnFrozen> {
        self.ensure_open()?;
        text.clone_into(&mut self.content);
        Ok(())
    }

    pub fn push_tool_call(&mut self, record: ToolCallRecord) -> Result<(), TurnFrozen> {
        self.ensure_open()?;
        self.tool_calls.push(record);
        Ok(())
    }

    pub fn push_screenshot(&mut self, shot: ScreenshotRecord) -> Result<(), TurnFrozen> {
        self.ensure_open()?;
        self.screenshots.push(shot);
        Ok(())
    }

    pub fn finish(&mut self, outcome: TurnOutcome) -> Result<(), TurnFrozen> {
        self.ensure_open()?;
        debug_assert!(outcome != TurnOutcome::InFlight);
        self.outcome = outcome;
        Ok(())
    }
}

/// How long a detached transcript waits for a reconnect.
const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);
/// Detached transcripts kept at once; the oldest go first.
const DEFAULT_MAX_DETACHED: usize = 1024;

#[derive(Debug, Default)]
struct Transcript {
    entries: Vec<TranscriptEntry>,
    /// `None` while a connection is attached.
    detached_at: Option<Instant>,
}

/// Transcripts keyed by session id. Survives reconnects, not restarts.
///
/// A transcript belongs to at most one live connection. Once detached it is
/// kept for `retention`, and at most `max_detached` detached transcripts are
/// kept at a time.
#[derive(Clone)]
pub struct TranscriptStore {
    inner: Arc<Mutex<HashMap<String, Transcript>>>,
    retention: Duration,
    max_detached: usize,
}

impl Default for TranscriptStore {
    fn default() -> Self {
        Self::with_limits(DEFAULT_RETENTION, DEFAULT_MAX_DETACHED)
    }
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limits(retention: Duration, max_detached: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            retention,
            max_detached,
        }
    }

    /// Attach a connection and return the id in use plus whether an earlier
    /// transcript was resumed. An id held by another live connection is not
    /// shared; the caller gets a fresh one.
    pub async fn attach(&self, requested: Option<&str>) -> (String, bool) {
        let mut map = self.inner.lock().await;
        self.evict(&mut map);

        if let Some(id) = requested.filter(|id| !id.is_empty()) {
            match map.get_mut(id) {
                Some(transcript) if transcript.detached_at.is_some() => {
                    transcript.detached_at = None;
                    return (id.to_string(), true);
                }
                Some(_) => {
                    tracing::warn!("[session] {} is attached to another connection, issuing a new id", id);
                }
                None => {
                    map.insert(id.to_string(), Transcript::default());
                    return (id.to_string(), false);
                }
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        map.insert(id.clone(), Transcript::default());
        (id, false)
    }

    /// Release a connection's hold. The transcript stays resumable until evicted.
    pub async fn detach(&self, session_id: &str) {
        let mut map = self.inner.lock().await;
        if let Some(transcript) = map.get_mut(session_id) {
            transcript.detached_at = Some(Instant::now());
        }
        self.evict(&mut map);
    }

    fn evict(&self, map: &mut HashMap<String, Transcript>) {
        let now = Instant::now();
        let before = map.len();
        map.retain(|_, t| {
            t.detached_at
                .map_or(true, |at| now.saturating_duration_since(at) < self.retention)
        });

        let mut detached: Vec<(Instant, String)> = map
            .iter()
            .filter_map(|(id, t)| t.detached_at.map(|at| (at, id.clone())))
            .collect();
        if detached.len() > self.max_detached {
            detached.sort();
            let excess = detached.len() - self.max_detached;
            for (_, id) in detached.into_iter().take(excess) {
                map.remove(&id);
            }
        }

        let evicted = before - map.len();
        if evicted > 0 {
            tracing::debug!("[session] evicted {} detached transcripts", evicted);
        }
    }

    /// Appends only to transcripts still held by the store.
    pub async fn append(&self, session_id: &str, entry: TranscriptEntry) {
        if let Some(transcript) = self.inner.lock().await.get_mut(session_id) {
            transcript.entries.push(entry);
        }
    }

    pub async fn history(&self, session_id: &str) -> Vec<TranscriptEntry> {
        self.inner
            .lock()
            .await
            .get(session_id)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    pub async fn clear(&self, session_id: &str) {
        if let Some(transcript) = self.inner.lock().await.get_mut(session_id) {
            transcript.entries.clear();
        }
    }

    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.len()
    }
}
