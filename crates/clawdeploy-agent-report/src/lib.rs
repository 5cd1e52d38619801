//! Wire types for the heartbeat decision agent.
//!
//! The agent streams [`AgentEvent`]s while it works through a health-check
//! cycle. Its terminal `report_result` tool call carries a
//! [`ReportEnvelope`], which must pass [`ReportEnvelope::validate`] before the
//! supervisor acts on any of the listed instance ids.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const HEALTH_REPORT_SCHEMA_V1: &str = "clawdeploy.heartbeat.report.v1";
pub const REPORT_TOOL_NAME: &str = "report_result";
pub const HEARTBEAT_PROMPT: &str = "Perform health check cycle on all instances.";

const MAX_INSTANCE_ID_LEN: usize = 64;

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    ToolResult,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    AgentStart,
    TurnStart,
    TurnEnd,
    MessageEnd {
        role: MessageRole,
        /// Spend attributed to this message, in USD.
        #[serde(default)]
        cost: f64,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        result: Value,
    },
    AutoRetryStart {
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },
    AgentEnd,
}

impl AgentEvent {
    /// Returns the report payload when this event is a successful terminal
    /// `report_result` tool call.
    pub fn report_payload(&self) -> Option<&Value> {
        match self {
            AgentEvent::ToolExecutionEnd {
                tool_name,
                is_error: false,
                result,
                ..
            } if tool_name == REPORT_TOOL_NAME => Some(result),
            _ => None,
        }
    }

    pub fn assistant_cost(&self) -> Option<f64> {
        match self {
            AgentEvent::MessageEnd {
                role: MessageRole::Assistant,
                cost,
            } if cost.is_finite() && *cost > 0.0 => Some(*cost),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    #[serde(default)]
    pub restarted_instances: Vec<String>,
    #[serde(default)]
    pub failed_restarts: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ReportEnvelope {
    pub schema: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub data: HealthReport,
}

/// Shape of the `report_result` tool output: `{"details": <envelope>}`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
struct ReportToolResult {
    details: ReportEnvelope,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReportError {
    #[error("report payload does not decode: {0}")]
    Decode(String),
    #[error("unsupported report schema: {0}")]
    Schema(String),
    #[error("invalid instance id in report: {0:?}")]
    InvalidInstanceId(String),
    #[error("instance {0} is listed as both restarted and failed")]
    Contradiction(String),
}

impl ReportEnvelope {
    pub fn v1(data: HealthReport, summary: Option<String>) -> Self {
        Self {
            schema: HEALTH_REPORT_SCHEMA_V1.to_string(),
            summary,
            data,
        }
    }

    /// Decodes and validates the raw result of a `report_result` tool call.
    pub fn from_tool_result(result: &Value) -> Result<Self, ReportError> {
        let decoded = serde_json::from_value::<ReportToolResult>(result.clone())
            .map_err(|err| ReportError::Decode(err.to_string()))?;
        decoded.details.validate()?;
        Ok(decoded.details)
    }

    pub fn to_tool_result(&self) -> Value {
        serde_json::json!({ "details": self })
    }

    pub fn validate(&self) -> Result<(), ReportError> {
        if self.schema != HEALTH_REPORT_SCHEMA_V1 {
            return Err(ReportError::Schema(self.schema.clone()));
        }
        for id in self
            .data
            .restarted_instances
            .iter()
            .chain(self.data.failed_restarts.iter())
        {
            if !is_valid_instance_id(id) {
                return Err(ReportError::InvalidInstanceId(id.clone()));
            }
        }
        let restarted: HashSet<&str> = self
            .data
            .restarted_instances
            .iter()
            .map(String::as_str)
            .collect();
        if let Some(both) = self
            .data
            .failed_restarts
            .iter()
            .find(|id| restarted.contains(id.as_str()))
        {
            return Err(ReportError::Contradiction(both.clone()));
        }
        Ok(())
    }
}

pub fn is_valid_instance_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_INSTANCE_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}
