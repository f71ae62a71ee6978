use std::borrow::Cow;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use strum_macros::Display;

/// Author of a timeline entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Cursor glyph a renderer may append to a message while it is streaming.
/// It is presentation-only; strip it before any content comparison.
pub const STREAM_CURSOR: &str = "▌";

/// Remove every occurrence of the streaming cursor marker. Borrows when the
/// content carries no marker, which is the common case.
pub fn strip_stream_cursor(content: &str) -> Cow<'_, str> {
    if content.contains(STREAM_CURSOR) {
        Cow::Owned(content.replace(STREAM_CURSOR, ""))
    } else {
        Cow::Borrowed(content)
    }
}

/// One entry in the externally observable timeline.
///
/// `content` is mutable while the message streams and frozen once
/// finalized; `timestamp` is absent until finalization. A message created
/// from live deltas carries a locally-generated (ephemeral) id until the
/// persisted history supersedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_streaming: bool,
}

impl ChatMessage {
    pub fn new(id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role,
            content: content.into(),
            timestamp: None,
            is_streaming: false,
        }
    }

    /// Content with the transient cursor marker removed.
    pub fn semantic_content(&self) -> Cow<'_, str> {
        strip_stream_cursor(&self.content)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn role_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Role::Assistant).unwrap(), "\"assistant\"");
        assert_eq!(Role::User.to_string(), "user");
    }

    #[test]
    fn strip_stream_cursor_is_borrowed_without_marker() {
        let stripped = strip_stream_cursor("plain text");
        assert!(matches!(stripped, Cow::Borrowed(_)));
        assert_eq!(stripped, "plain text");
    }

    #[test]
    fn strip_stream_cursor_removes_all_markers() {
        let content = format!("Hel{STREAM_CURSOR}lo{STREAM_CURSOR}");
        assert_eq!(strip_stream_cursor(&content), "Hello");
    }
}
