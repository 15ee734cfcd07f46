//! Tool registry, policy, validation, and output redaction.
//!
//! Tool access is deny-by-default: a run without an explicit policy cannot
//! invoke anything. Inputs and outputs are checked against the tool's
//! structural schemas, and outputs pass through a field allowlist before
//! they reach the model or the stream. A tool without an allowlist cannot
//! be redacted, and unredactable output is a hard error, not a pass-through.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use cogni_core::{AiEvent, ToolCallId};

/// Expected JSON type for a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
    /// Anything.
    Any,
}

impl FieldType {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

/// A structural schema: required fields plus per-field types.
///
/// Tools need shape guarantees, not full JSON-Schema; unknown fields are
/// tolerated on input and removed from output by redaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolSchema {
    /// Fields that must be present.
    pub required: Vec<String>,

    /// Expected types per field.
    pub fields: BTreeMap<String, FieldType>,
}

impl ToolSchema {
    /// Validate a payload against this schema.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violation.
    pub fn validate(&self, value: &serde_json::Value) -> Result<(), String> {
        let Some(object) = value.as_object() else {
            return Err("payload must be a JSON object".into());
        };

        for field in &self.required {
            if !object.contains_key(field) {
                return Err(format!("missing required field: {field}"));
            }
        }

        for (field, expected) in &self.fields {
            if let Some(actual) = object.get(field) {
                if !actual.is_null() && !expected.matches(actual) {
                    return Err(format!("field {field} has wrong type"));
                }
            }
        }

        Ok(())
    }
}

/// A tool invokable by graphs.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable tool id.
    fn id(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// Schema the input must satisfy.
    fn input_schema(&self) -> &ToolSchema;

    /// Schema the raw output must satisfy.
    fn output_schema(&self) -> &ToolSchema;

    /// Output fields allowed through redaction. `None` means the tool has
    /// no redaction contract and its output can never be released.
    fn output_allowlist(&self) -> Option<&[String]>;

    /// Run the tool.
    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value, String>;
}

/// The set of tools known to the process.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool with the same id.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.id().to_string(), tool);
    }

    /// Look up a tool.
    #[must_use]
    pub fn get(&self, tool_id: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(tool_id).cloned()
    }
}

/// The per-run allowlist of tool ids.
#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    allowed: HashSet<String>,
}

impl ToolPolicy {
    /// Build a policy allowing exactly these ids.
    #[must_use]
    pub fn allowing<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the policy permits the tool.
    #[must_use]
    pub fn permits(&self, tool_id: &str) -> bool {
        self.allowed.contains(tool_id)
    }
}

/// Why a tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorCode {
    /// The run's policy does not allow this tool (or no policy exists).
    Denied,
    /// No such tool.
    UnknownTool,
    /// Input failed schema validation.
    InvalidInput,
    /// Raw output failed schema validation.
    InvalidOutput,
    /// The tool has no redaction allowlist or redaction produced nothing.
    RedactionFailed,
    /// The tool itself failed.
    ExecutionFailed,
}

/// The result of one tool invocation.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Id linking the start event to the result event.
    pub tool_call_id: String,

    /// Redacted output, or an error payload.
    pub output: serde_json::Value,

    /// Whether the invocation failed.
    pub is_error: bool,

    /// Failure class when `is_error`.
    pub error_code: Option<ToolErrorCode>,
}

/// Executes tools for one run under one policy.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,

    /// The run's policy. `None` means no policy was declared: deny-all.
    policy: Option<ToolPolicy>,
}

impl ToolExecutor {
    /// Create an executor for one run.
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, policy: Option<ToolPolicy>) -> Self {
        Self { registry, policy }
    }

    /// Invoke a tool, emitting `tool_call_start` / `tool_call_result` on
    /// the run stream.
    pub async fn execute(
        &self,
        tool_id: &str,
        call_id: Option<String>,
        args: serde_json::Value,
        events: &mpsc::Sender<AiEvent>,
    ) -> ToolOutcome {
        let tool_call_id =
            call_id.unwrap_or_else(|| ToolCallId::generate().as_str().to_string());

        let _ = events
            .send(AiEvent::ToolCallStart {
                tool_call_id: tool_call_id.clone(),
                tool_name: tool_id.to_string(),
                args: args.clone(),
            })
            .await;

        let outcome = self.run_checked(tool_id, &tool_call_id, args).await;

        let _ = events
            .send(AiEvent::ToolCallResult {
                tool_call_id: outcome.tool_call_id.clone(),
                tool_name: tool_id.to_string(),
                output: outcome.output.clone(),
                is_error: outcome.is_error,
            })
            .await;

        outcome
    }

    async fn run_checked(
        &self,
        tool_id: &str,
        tool_call_id: &str,
        args: serde_json::Value,
    ) -> ToolOutcome {
        let failure = |code: ToolErrorCode, message: String| ToolOutcome {
            tool_call_id: tool_call_id.to_string(),
            output: serde_json::json!({ "error": message }),
            is_error: true,
            error_code: Some(code),
        };

        // Policy first. Absence of a policy is deny-all.
        let permitted = self
            .policy
            .as_ref()
            .is_some_and(|policy| policy.permits(tool_id));
        if !permitted {
            return failure(
                ToolErrorCode::Denied,
                format!("tool {tool_id} is not allowed for this run"),
            );
        }

        let Some(tool) = self.registry.get(tool_id) else {
            return failure(ToolErrorCode::UnknownTool, format!("unknown tool: {tool_id}"));
        };

        if let Err(message) = tool.input_schema().validate(&args) {
            return failure(ToolErrorCode::InvalidInput, message);
        }

        let raw = match tool.invoke(args).await {
            Ok(raw) => raw,
            Err(message) => return failure(ToolErrorCode::ExecutionFailed, message),
        };

        if let Err(message) = tool.output_schema().validate(&raw) {
            return failure(ToolErrorCode::InvalidOutput, message);
        }

        let Some(allowlist) = tool.output_allowlist() else {
            return failure(
                ToolErrorCode::RedactionFailed,
                format!("tool {tool_id} has no output allowlist"),
            );
        };

        match redact(&raw, allowlist) {
            Ok(output) => ToolOutcome {
                tool_call_id: tool_call_id.to_string(),
                output,
                is_error: false,
                error_code: None,
            },
            Err(message) => failure(ToolErrorCode::RedactionFailed, message),
        }
    }
}

/// Keep only allowlisted top-level fields of a tool output.
fn redact(raw: &serde_json::Value, allowlist: &[String]) -> Result<serde_json::Value, String> {
    let Some(object) = raw.as_object() else {
        return Err("tool output must be a JSON object".into());
    };

    let mut kept = serde_json::Map::new();
    for field in allowlist {
        if let Some(value) = object.get(field) {
            kept.insert(field.clone(), value.clone());
        }
    }

    if kept.is_empty() && !object.is_empty() {
        return Err("redaction removed every output field".into());
    }

    Ok(serde_json::Value::Object(kept))
}
