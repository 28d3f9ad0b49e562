//! Agent tool registry.
//!
//! Capabilities are decided once from `Settings`: a missing credential turns
//! a capability off instead of failing. Hosted tools (web/file search) are
//! only declared; local function tools are executed here.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::airtable::RecordStore;
use crate::computer::{ComputerAction, ComputerExecutor};
use crate::error::OperatorError;
use crate::events::ToolCallRecord;
use crate::runtime::{EventSender, RuntimeEvent};
use crate::sandbox::Sandbox;
use crate::settings::Settings;

const AGENT_NAME: &str = "Assistant";

const INSTRUCTIONS: &str = "You are a helpful assistant with access to multiple tools:\n\
- Use web search to find current information from the internet\n\
- Use file search to query our internal documentation about jacket preferences and Tokyo shops\n\
- Use the computer tool to control the browser when tasks mention 'open', 'click', 'type', or 'add to cart'\n\
- Use read_file and write_file to work with files in the sandbox directory\n\
- Use upsert_airtable_record to log records when requested\n\
When using the computer tool, explain your actions step by step.";

pub const COMPUTER_TOOL: &str = "computer";
pub const AIRTABLE_TOOL: &str = "upsert_airtable_record";
pub const READ_FILE_TOOL: &str = "read_file";
pub const WRITE_FILE_TOOL: &str = "write_file";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    WebSearch,
    FileSearch,
    Computer,
    Airtable,
    Mcp,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSearch => "websearch",
            Self::FileSearch => "filesearch",
            Self::Computer => "computer",
            Self::Airtable => "airtable",
            Self::Mcp => "mcp",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one local tool call: the record for the client and the text
/// returned to the model.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub record: ToolCallRecord,
    pub output: String,
}

impl ToolInvocation {
    fn failed(tool: &str, record_name: &str, message: String) -> Self {
        let err = OperatorError::ToolInvocationFailed { tool: tool.to_string(), message };
        tracing::warn!("[registry] {}", err);
        Self {
            output: json!({ "error": err.to_string() }).to_string(),
            record: ToolCallRecord::error(record_name, err.to_string()),
        }
    }
}

/// Per-turn tool state. The computer executor (and its action budget) lives
/// exactly as long as one run.
pub struct TurnTools {
    computer: ComputerExecutor,
    events: EventSender,
}

impl TurnTools {
    pub fn new(settings: &Settings, events: EventSender) -> Self {
        Self {
            computer: ComputerExecutor::for_run(settings),
            events,
        }
    }
}

/// Immutable agent configuration shared by every session.
pub struct AgentHandle {
    name: String,
    settings: Arc<Settings>,
    capabilities: BTreeSet<Capability>,
    records: RecordStore,
    sandbox: Option<Sandbox>,
}

/// Build the agent from settings. Deterministic for a given settings value.
pub fn build_agent_handle(settings: &Settings) -> AgentHandle {
    let mut capabilities = BTreeSet::new();
    capabilities.insert(Capability::Computer);

    if settings.has_openai() {
        capabilities.insert(Capability::WebSearch);
    }
    if settings.file_search_enabled() {
        capabilities.insert(Capability::FileSearch);
    }
    if settings.has_airtable() {
        capabilities.insert(Capability::Airtable);
    }

    let sandbox = settings.sandbox_dir.as_deref().and_then(|dir| match Sandbox::open(dir) {
        Ok(sandbox) => Some(sandbox),
        Err(e) => {
            tracing::warn!("[registry] sandbox unavailable at {}: {}", dir.display(), e);
            None
        }
    });
    if sandbox.is_some() {
        capabilities.insert(Capability::Mcp);
    }

    let names: Vec<_> = capabilities.iter().map(|c| c.as_str()).collect();
    tracing::info!(
        "[registry] agent '{}' built with capabilities {:?} (computer: {})",
        AGENT_NAME, names, settings.computer_mode
    );

    AgentHandle {
        name: AGENT_NAME.to_string(),
        settings: Arc::new(settings.clone()),
        capabilities,
        records: RecordStore::new(settings.airtable.clone()),
        sandbox,
    }
}

impl AgentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    pub fn describe_capabilities(&self) -> BTreeSet<Capability> {
        self.capabilities.clone()
    }

    pub fn has(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Tool list in Responses API form.
    pub fn tool_definitions(&self) -> Vec<Value> {
        let mut tools = Vec::new();

        if self.has(Capability::WebSearch) {
            tools.push(json!({ "type": "web_search_preview" }));
        }
        if let (true, Some(store)) = (self.has(Capability::FileSearch), &self.settings.vector_store_id) {
            tools.push(json!({ "type": "file_search", "vector_store_ids": [store] }));
        }

        tools.push(json!({
            "type": "function",
            "name": COMPUTER_TOOL,
            "description": format!(
                "Control a browser ({} mode). Each call performs one action and returns the resulting page state.",
                self.settings.computer_mode
            ),
            "parameters": {
                "type": "object",
                "properties": {
                    "type": { "type": "string", "enum": ["click", "type", "navigate", "scroll"] },
                    "x": { "type": "integer" },
                    "y": { "type": "integer" },
                    "selector": { "type": "string" },
                    "text": { "type": "string" },
                    "url": { "type": "string" },
                    "direction": { "type": "string", "enum": ["up", "down"] },
                    "amount": { "type": "integer" }
                },
                "required": ["type"]
            }
        }));

        if self.has(Capability::Airtable) {
            tools.push(json!({
                "type": "function",
                "name": AIRTABLE_TOOL,
                "description": "Add or update a record in Airtable",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "payload": {
                            "type": "object",
                            "description": "Field names and values for the record"
                        }
                    },
                    "required": ["payload"]
                }
            }));
        }

        if self.has(Capability::Mcp) {
            tools.push(json!({
                "type": "function",
                "name": READ_FILE_TOOL,
                "description": "Read a text file from the sandbox directory",
                "parameters": {
                    "type": "object",
                    "properties": { "path": { "type": "string" } },
                    "required": ["path"]
                }
            }));
            tools.push(json!({
                "type": "function",
                "name": WRITE_FILE_TOOL,
                "description": "Write a text file in the sandbox directory",
                "parameters": {
                    "type": "object",
                    "properties": {
                        "path": { "type": "string" },
                        "content": { "type": "string" }
                    },
                    "required": ["path", "content"]
                }
            }));
        }

        tools
    }

    /// Execute a local function tool. Never fails: every problem becomes an
    /// `error` record.
    pub async fn invoke(&self, name: &str, arguments: &str, tools: &mut TurnTools) -> ToolInvocation {
        let started = Instant::now();
        let args: Value = match serde_json::from_str(arguments) {
            Ok(v) => v,
            Err(e) => {
                return ToolInvocation::failed(name, name, format!("invalid arguments: {e}"));
            }
        };

        let mut invocation = match name {
            COMPUTER_TOOL => self.invoke_computer(&args, tools).await,
            AIRTABLE_TOOL if self.has(Capability::Airtable) => self.invoke_airtable(&args).await,
            READ_FILE_TOOL | WRITE_FILE_TOOL => match &self.sandbox {
                Some(sandbox) => invoke_sandbox(sandbox, name, &args).await,
                None => ToolInvocation::failed(name, "MCP", "sandbox not configured".to_string()),
            },
            AIRTABLE_TOOL => {
                ToolInvocation::failed(name, "Airtable", "Airtable is not configured".to_string())
            }
            other => ToolInvocation::failed(other, other, "unknown tool".to_string()),
        };

        invocation.record = invocation.record.with_params(args).with_duration(started.elapsed());
        invocation
    }

    async fn invoke_computer(&self, args: &Value, tools: &mut TurnTools) -> ToolInvocation {
        let action: ComputerAction = match serde_json::from_value(args.clone()) {
            Ok(a) => a,
            Err(e) => {
                return ToolInvocation::failed(COMPUTER_TOOL, "ComputerTool", format!("failed to parse action: {e}"));
            }
        };

        match tools.computer.execute(&action).await {
            Ok(result) => {
                let _ = tools.events.send(RuntimeEvent::Screenshot {
                    action: result.description.clone(),
                    image: result.screenshot,
                });
                let summary = format!(
                    "Controlled browser in {} mode: {}",
                    tools.computer.mode(),
                    result.description
                );
                ToolInvocation {
                    output: json!({
                        "success": true,
                        "description": result.description,
                        "state": result.state,
                    })
                    .to_string(),
                    record: ToolCallRecord::ok("ComputerTool", summary).with_result(result.state),
                }
            }
            Err(e) => {
                let err = OperatorError::from(e);
                ToolInvocation::failed(COMPUTER_TOOL, "ComputerTool", err.to_string())
            }
        }
    }

    async fn invoke_airtable(&self, args: &Value) -> ToolInvocation {
        let payload = match args.get("payload").unwrap_or(args) {
            Value::Object(map) => map.clone(),
            _ => {
                return ToolInvocation::failed(AIRTABLE_TOOL, "Airtable", "payload must be an object".to_string());
            }
        };

        let result = self.records.upsert(payload).await;
        let output = serde_json::to_string(&result).unwrap_or_default();
        let record = if result.is_success() {
            ToolCallRecord::ok("Airtable", "Logged to Airtable")
        } else {
            ToolCallRecord::error("Airtable", result.message())
        };
        ToolInvocation {
            record: record.with_result(serde_json::to_value(&result).unwrap_or(Value::Null)),
            output,
        }
    }
}

async fn invoke_sandbox(sandbox: &Sandbox, name: &str, args: &Value) -> ToolInvocation {
    let Some(path) = args["path"].as_str() else {
        return ToolInvocation::failed(name, "MCP", "missing 'path'".to_string());
    };

    let outcome = if name == READ_FILE_TOOL {
        sandbox
            .read_file(path)
            .await
            .map(|content| (format!("Read {path}"), json!({ "content": content })))
    } else {
        let content = args["content"].as_str().unwrap_or_default();
        sandbox
            .write_file(path, content)
            .await
            .map(|bytes| (format!("Wrote {bytes} bytes to {path}"), json!({ "bytes_written": bytes })))
    };

    match outcome {
        Ok((summary, result)) => ToolInvocation {
            output: result.to_string(),
            record: ToolCallRecord::ok("MCP", summary),
        },
        Err(e) => ToolInvocation::failed(name, "MCP", e.to_string()),
    }
}
