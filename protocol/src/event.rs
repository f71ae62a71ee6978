use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

use crate::message::Role;
use crate::tool::ToolStatus;

/// One decoded live-stream event. This is the closed variant set the rest
/// of the engine consumes; unrecognized wire kinds are dropped at the decode
/// boundary and never reach it.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text for the item identified by `item_id`.
    MessageDelta {
        delta: String,
        item_id: Option<String>,
        output_index: Option<u32>,
        content_index: Option<u32>,
        sequence_number: Option<u64>,
    },
    /// Tool lifecycle update: descriptor metadata plus the mapped status.
    ToolStatusUpdate {
        call_id: String,
        status: ToolStatus,
        tool_type: Option<String>,
        name: Option<String>,
        query: Option<String>,
        agent: Option<String>,
        output_index: Option<u32>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Tool produced its result (or an error payload).
    ToolOutput {
        call_id: String,
        tool_type: Option<String>,
        output: Value,
        success: Option<bool>,
        timestamp: Option<DateTime<Utc>>,
    },
    /// Terminal completion summary for the turn.
    Completed {
        response_id: String,
        response_text: Option<String>,
        usage: Option<TokenUsage>,
    },
    /// Terminal transport or server failure for the turn.
    Error { message: String },
}

/// Token accounting reported on the terminal `final` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// Kind of persisted run item. Unknown kinds fold to `Other` so additive
/// schema evolution on the history store never breaks a reload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunItemType {
    ToolCall,
    ToolResult,
    McpCall,
    #[default]
    #[serde(other)]
    Other,
}

impl RunItemType {
    pub fn is_tool_invocation(self) -> bool {
        matches!(self, RunItemType::ToolCall | RunItemType::McpCall)
    }
}

/// One persisted history record, ordered by `sequence_no` within its
/// conversation. Consumed read-only to backfill aggregation and anchoring
/// after a reload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEvent {
    pub sequence_no: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(default)]
    pub run_item_type: RunItemType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_arguments: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConversationEvent {
    pub fn is_user_message(&self) -> bool {
        self.role == Some(Role::User) && self.run_item_type == RunItemType::Other
    }
}

/// Summary record for conversation lists; the shape the generic recency
/// merge operates on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
}
