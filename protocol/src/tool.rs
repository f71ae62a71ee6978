use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use strum_macros::Display;

/// Lifecycle stage of a tool invocation. Totally ordered via [`rank`]:
/// aggregation only ever moves a tool forward through these stages, so a
/// stale event replayed from either data source can never regress state.
///
/// [`rank`]: ToolStatus::rank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ToolStatus {
    #[default]
    InputStreaming,
    InputAvailable,
    OutputAvailable,
    OutputError,
}

impl ToolStatus {
    /// The two terminal states share the top rank; which of them wins on a
    /// tie is the merge layer's call, not an ordering question.
    pub fn rank(self) -> u8 {
        match self {
            ToolStatus::InputStreaming => 0,
            ToolStatus::InputAvailable => 1,
            ToolStatus::OutputAvailable | ToolStatus::OutputError => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

/// Accumulated state of one tool invocation, keyed by its call id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolState {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_index: Option<u32>,
    pub status: ToolStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ToolState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            tool_type: None,
            agent: None,
            output_index: None,
            status: ToolStatus::default(),
            input: None,
            output: None,
            error_text: None,
        }
    }
}

/// Message id → tool ids in discovery order. A tool id appears in at most
/// one anchor's list at any time.
pub type ToolEventAnchors = HashMap<String, Vec<String>>;

/// Tool-call id → incremental side-channel payload. Merged with the same
/// overlay-preference rule as [`ToolState`].
pub type SideChannelStreamMap = HashMap<String, Value>;
