//! Computer-use action execution.
//!
//! MOCK mode renders a synthetic screenshot for every action and never fails
//! below the action budget. LIVE mode forwards actions to an HTTP bridge; the
//! bridge is a scaffold and answers 501 for every action.

pub mod font;
pub mod live;
pub mod mock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::settings::{ComputerMode, Settings};

pub use live::LiveBridge;
pub use mock::MockComputer;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Action budget exceeded ({limit} actions per run)")]
    BudgetExceeded { limit: u32 },
    #[error("Live mode not implemented. Use COMPUTER_MODE=MOCK for testing")]
    NotImplemented,
    #[error("Bridge error: {0}")]
    Bridge(String),
    #[error("Invalid action: {0}")]
    InvalidAction(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    #[default]
    Down,
}

/// Abstract UI action requested by the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ComputerAction {
    Click {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Type {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selector: Option<String>,
    },
    Navigate {
        url: String,
    },
    Scroll {
        #[serde(default)]
        direction: ScrollDirection,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        amount: Option<u32>,
    },
}

impl ComputerAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Navigate { .. } => "navigate",
            Self::Scroll { .. } => "scroll",
        }
    }

    /// Human-readable one-line description, used for captions and logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Click { x, y, selector: Some(sel) } => format!("Click {sel} at ({x}, {y})"),
            Self::Click { x, y, selector: None } => format!("Click at ({x}, {y})"),
            Self::Type { text, selector: Some(sel) } => format!("Type '{text}' into {sel}"),
            Self::Type { text, selector: None } => format!("Type '{text}'"),
            Self::Navigate { url } => format!("Navigate to {url}"),
            Self::Scroll { direction, amount } => {
                let dir = match direction {
                    ScrollDirection::Up => "up",
                    ScrollDirection::Down => "down",
                };
                match amount {
                    Some(n) => format!("Scroll {dir} by {n}"),
                    None => format!("Scroll {dir}"),
                }
            }
        }
    }

    /// Reject actions the executor cannot even describe.
    pub fn validate(&self) -> Result<(), ActionError> {
        match self {
            Self::Navigate { url } if url.trim().is_empty() => {
                Err(ActionError::InvalidAction("navigate requires a url".to_string()))
            }
            _ => Ok(()),
        }
    }
}

/// Structured record of one executed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionLogEntry {
    #[serde(rename = "type")]
    pub action_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Fixed-size raster produced for an action.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub caption: String,
}

impl Artifact {
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
        BASE64.encode(&self.png)
    }
}

/// Result handed back to the tool layer.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub screenshot: String,
    pub description: String,
    pub log: ActionLogEntry,
    pub state: serde_json::Value,
}

/// Per-run action counter. Once exhausted it stays exhausted.
#[derive(Debug, Clone)]
pub struct ActionBudget {
    limit: u32,
    used: u32,
    exhausted: bool,
}

impl ActionBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0, exhausted: false }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn consume(&mut self) -> Result<u32, ActionError> {
        if self.exhausted || self.used >= self.limit {
            self.exhausted = true;
            return Err(ActionError::BudgetExceeded { limit: self.limit });
        }
        self.used += 1;
        Ok(self.used)
    }
}

/// MOCK or LIVE executor for a single run.
pub enum ComputerExecutor {
    Mock(MockComputer),
    Live(LiveBridge),
}

impl ComputerExecutor {
    pub fn for_run(settings: &Settings) -> Self {
        match settings.computer_mode {
            ComputerMode::Mock => Self::Mock(MockComputer::new(settings.max_actions_per_run)),
            ComputerMode::Live => Self::Live(LiveBridge::new(
                settings.computer_bridge_url.clone(),
                settings.max_actions_per_run,
            )),
        }
    }

    pub fn mode(&self) -> ComputerMode {
        match self {
            Self::Mock(_) => ComputerMode::Mock,
            Self::Live(_) => ComputerMode::Live,
        }
    }

    pub async fn execute(&mut self, action: &ComputerAction) -> Result<ActionResult, ActionError> {
        action.validate()?;
        match self {
            Self::Mock(mock) => {
                let (artifact, log) = mock.execute(action)?;
                Ok(ActionResult {
                    screenshot: artifact.to_base64(),
                    description: artifact.caption,
                    state: mock.state_json(),
                    log,
                })
            }
            Self::Live(bridge) => bridge.execute(action).await,
        }
    }
}
