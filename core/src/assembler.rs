use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use tracing::debug;
use uuid::Uuid;

use splice_protocol::message::ChatMessage;
use splice_protocol::message::Role;
use splice_protocol::message::strip_stream_cursor;

/// Folds `message.delta` events into live assistant messages for one turn
/// and decides, on finalization, whether the turn yields zero or one
/// assistant message.
///
/// The assembler owns its messages while the turn streams; the
/// per-conversation state takes them over on finalization and may later
/// replace them wholesale when persisted history supersedes the ephemeral
/// ids.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    /// In-progress messages keyed by wire item id, in discovery order.
    in_progress: IndexMap<String, ChatMessage>,
    /// Item id carrying the primary user-visible text channel. Output
    /// index 0 is the convention; the first delta-bearing item stands in
    /// until an index-0 delta claims the slot.
    primary_item: Option<String>,
    /// Key synthesized for deltas that arrive without an item id.
    fallback_item: Option<String>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while any message of the current turn is still streaming.
    pub fn is_streaming(&self) -> bool {
        self.in_progress.values().any(|m| m.is_streaming)
    }

    /// Live view of the turn's in-progress messages, discovery order.
    pub fn current_messages(&self) -> Vec<ChatMessage> {
        self.in_progress.values().cloned().collect()
    }

    fn key_for(&mut self, item_id: Option<&str>) -> String {
        match item_id {
            Some(id) => id.to_string(),
            None => self
                .fallback_item
                .get_or_insert_with(|| Uuid::new_v4().to_string())
                .clone(),
        }
    }

    /// Append one text delta to the message keyed by `item_id`, creating it
    /// on first sight. The message id is the wire item id when present, or
    /// a locally-generated ephemeral id otherwise.
    pub fn apply_delta(&mut self, item_id: Option<&str>, delta: &str, output_index: Option<u32>) {
        let key = self.key_for(item_id);
        let message = self.in_progress.entry(key.clone()).or_insert_with(|| {
            let mut m = ChatMessage::new(key.clone(), Role::Assistant, "");
            m.is_streaming = true;
            m
        });
        message.content.push_str(delta);
        message.is_streaming = true;

        if output_index == Some(0) || self.primary_item.is_none() {
            self.primary_item = Some(key);
        }
    }

    /// Finalize the turn with the authoritative response text.
    ///
    /// A tool-only turn (no authoritative text, no delta-bearing message)
    /// produces no assistant message at all rather than an empty bubble.
    /// Otherwise the authoritative text overrides any diverging accumulated
    /// deltas, the finalize timestamp is set, and streaming ends.
    pub fn finalize(
        &mut self,
        response_text: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ChatMessage> {
        let authoritative = response_text.filter(|t| !t.is_empty());
        let primary = self
            .primary_item
            .take()
            .and_then(|key| self.in_progress.shift_remove(&key));
        self.in_progress.clear();
        self.fallback_item = None;

        let mut message = match (primary, authoritative) {
            (None, None) => return None,
            (Some(m), _) => m,
            (None, Some(_)) => {
                // Authoritative text with no streamed deltas: synthesize the
                // message now under an ephemeral id.
                ChatMessage::new(Uuid::new_v4().to_string(), Role::Assistant, "")
            }
        };

        if let Some(text) = authoritative {
            let accumulated = strip_stream_cursor(&message.content);
            if accumulated != text {
                debug!(
                    "authoritative final text overrides accumulated deltas (accumulated {} chars)",
                    accumulated.len()
                );
            }
            message.content = text.to_string();
        } else {
            message.content = strip_stream_cursor(&message.content).into_owned();
        }
        message.timestamp = Some(now);
        message.is_streaming = false;
        Some(message)
    }

    /// Terminal failure: freeze whatever partial content exists and mark
    /// every in-flight message terminal. The caller surfaces the error; no
    /// retry happens here.
    pub fn apply_error(&mut self, now: DateTime<Utc>) -> Vec<ChatMessage> {
        self.primary_item = None;
        self.fallback_item = None;
        self.in_progress
            .drain(..)
            .map(|(_, mut m)| {
                m.content = strip_stream_cursor(&m.content).into_owned();
                m.is_streaming = false;
                m.timestamp = Some(now);
                m
            })
            .collect()
    }
}
