use std::collections::HashMap;
use std::collections::HashSet;

use tracing::debug;

use splice_protocol::event::ConversationEvent;
use splice_protocol::message::ChatMessage;
use splice_protocol::message::Role;
use splice_protocol::tool::ToolEventAnchors;

/// O(1) anchoring for the live stream: while a turn is actively streaming,
/// the anchor for every discovered tool is simply the most recent
/// user-message id, no persisted data required. This lets tool cards land
/// under the correct turn before history ever loads.
#[derive(Debug, Default)]
pub struct LiveAnchorTracker {
    current_anchor: Option<String>,
    anchors: ToolEventAnchors,
    anchored: HashSet<String>,
}

impl LiveAnchorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A user turn opened; subsequent tool discoveries anchor to it.
    pub fn note_user_message(&mut self, message_id: &str) {
        self.current_anchor = Some(message_id.to_string());
    }

    /// Anchor a newly discovered tool to the current pointer. Re-anchoring
    /// an already-known tool is a no-op, preserving the invariant that a
    /// tool id lives in at most one anchor list.
    pub fn anchor_tool(&mut self, call_id: &str) {
        let Some(anchor) = self.current_anchor.clone() else {
            debug!("tool {call_id} discovered before any user message; left unanchored");
            return;
        };
        if self.anchored.insert(call_id.to_string()) {
            self.anchors.entry(anchor).or_default().push(call_id.to_string());
        }
    }

    pub fn anchors(&self) -> &ToolEventAnchors {
        &self.anchors
    }

    pub fn take_anchors(&mut self) -> ToolEventAnchors {
        self.anchored.clear();
        std::mem::take(&mut self.anchors)
    }

    /// Drop the anchors of an aborted in-flight turn, keeping everything
    /// anchored to earlier turns. Returns the tool ids that were discarded
    /// with it so the caller can drop their partial state too.
    pub fn discard_current_turn(&mut self) -> Vec<String> {
        let Some(anchor) = self.current_anchor.take() else {
            return Vec::new();
        };
        let ids = self.anchors.remove(&anchor).unwrap_or_default();
        for id in &ids {
            self.anchored.remove(id);
        }
        ids
    }
}

/// Bind each tool id found in the persisted `events` to a message id from
/// `messages`.
///
/// Strategy selection: when the persisted record holds at least as many
/// user-message events as there are user messages, the audit trail is
/// complete and sequence alignment is exact; otherwise fall back to
/// timestamp anchoring. A tool resolvable by neither strategy is omitted
/// from the map (it stays in the tool-state list); attaching unanchored
/// tools to the currently open turn is a presentation-layer policy, not
/// this engine's.
pub fn resolve_anchors(events: &[ConversationEvent], messages: &[ChatMessage]) -> ToolEventAnchors {
    let user_events = events.iter().filter(|e| e.is_user_message()).count();
    let user_messages = messages.iter().filter(|m| m.role == Role::User).count();
    if user_events >= user_messages {
        resolve_by_sequence(events, messages)
    } else {
        resolve_by_timestamp(events, messages)
    }
}

/// Exact anchoring over a complete audit trail: walk events by sequence
/// number, align the last N user-message events to the last N user
/// messages positionally, and carry a current-anchor pointer that every
/// tool event anchors to.
fn resolve_by_sequence(events: &[ConversationEvent], messages: &[ChatMessage]) -> ToolEventAnchors {
    let mut sorted: Vec<&ConversationEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.sequence_no);

    let user_message_ids: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.id.as_str())
        .collect();
    let user_event_positions: Vec<usize> = sorted
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_user_message())
        .map(|(i, _)| i)
        .collect();

    // Align tails: the last k user events correspond to the last k user
    // messages. Earlier user events have no message counterpart, so tools
    // under them stay unanchored rather than mis-attached.
    let k = user_event_positions.len().min(user_message_ids.len());
    let mut aligned: HashMap<usize, &str> = HashMap::new();
    let ev_tail = &user_event_positions[user_event_positions.len() - k..];
    let msg_tail = &user_message_ids[user_message_ids.len() - k..];
    for (pos, message_id) in ev_tail.iter().zip(msg_tail.iter()) {
        aligned.insert(*pos, *message_id);
    }

    let mut anchors = ToolEventAnchors::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current: Option<&str> = None;
    for (i, event) in sorted.iter().enumerate() {
        if event.is_user_message() {
            current = aligned.get(&i).copied();
        } else if let Some(call_id) = event.tool_call_id.as_deref() {
            let Some(anchor) = current else {
                debug!("tool {call_id} outside the aligned window; left unanchored");
                continue;
            };
            if seen.insert(call_id) {
                anchors
                    .entry(anchor.to_string())
                    .or_default()
                    .push(call_id.to_string());
            }
        }
    }
    anchors
}

/// Best-effort anchoring when the audit trail is incomplete: binary-search
/// a time-sorted message index for the latest message at or before each
/// tool's first-observed timestamp. A tool earlier than every indexed
/// message is left unanchored rather than mis-attached.
pub(crate) fn resolve_by_timestamp(
    events: &[ConversationEvent],
    messages: &[ChatMessage],
) -> ToolEventAnchors {
    let mut index: Vec<(&str, i64)> = messages
        .iter()
        .filter_map(|m| m.timestamp.map(|t| (m.id.as_str(), t.timestamp_millis())))
        .collect();
    index.sort_by_key(|(_, ts)| *ts);

    let mut sorted: Vec<&ConversationEvent> = events.iter().collect();
    sorted.sort_by_key(|e| e.sequence_no);

    let mut anchors = ToolEventAnchors::new();
    let mut seen: HashSet<&str> = HashSet::new();
    for event in sorted {
        let Some(call_id) = event.tool_call_id.as_deref() else {
            continue;
        };
        if !seen.insert(call_id) {
            continue;
        }
        let Some(ts) = event.timestamp else {
            debug!("tool {call_id} has no timestamp; left unanchored");
            continue;
        };
        let ts = ts.timestamp_millis();
        let pos = index.partition_point(|(_, message_ts)| *message_ts <= ts);
        if pos == 0 {
            debug!("tool {call_id} precedes the earliest indexed message; left unanchored");
            continue;
        }
        let (message_id, _) = index[pos - 1];
        anchors
            .entry(message_id.to_string())
            .or_default()
            .push(call_id.to_string());
    }
    anchors
}
