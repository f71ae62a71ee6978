use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use futures::Stream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;
use uuid::Uuid;

use splice_protocol::ConversationId;
use splice_protocol::event::ConversationEvent;
use splice_protocol::event::StreamEvent;
use splice_protocol::event::TokenUsage;
use splice_protocol::message::ChatMessage;
use splice_protocol::message::Role;
use splice_protocol::tool::SideChannelStreamMap;
use splice_protocol::tool::ToolEventAnchors;
use splice_protocol::tool::ToolState;

use crate::aggregator::ToolAggregator;
use crate::anchor::LiveAnchorTracker;
use crate::anchor::resolve_anchors;
use crate::assembler::MessageAssembler;
use crate::error::Result;
use crate::error::SpliceErr;
use crate::merge::DEFAULT_REANCHOR_WINDOW;
use crate::merge::merge_stream_maps;
use crate::merge::merge_tool_event_anchors;
use crate::merge::merge_tool_states;
use crate::merge::reanchor_tool_event_anchors;

/// Tunables injected into every conversation handle. Both windows exist so
/// tests can pin them; production callers use the defaults.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Bound for the timestamp fallback when reanchoring after a message
    /// list replacement.
    pub reanchor_window: Duration,
    /// How long the live decode loop waits for the next frame before
    /// treating the stream as disconnected.
    pub stream_idle_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reanchor_window: DEFAULT_REANCHOR_WINDOW,
            stream_idle_timeout: Duration::from_secs(75),
        }
    }
}

/// The outbound contract to presentation collaborators: an ordered message
/// list, the tool states in discovery order, the anchor map, and the
/// per-turn streaming/error flags.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelineSnapshot {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolState>,
    pub anchors: ToolEventAnchors,
    pub is_streaming: bool,
    pub last_error: Option<String>,
}

/// All mutable state for one conversation.
///
/// Created on conversation open, discarded on close, and passed explicitly
/// — never parked in a process-wide map. Everything here is mutated from
/// the conversation's own event-processing context, so no locking is
/// needed; the live stream and the persisted-history fetch may complete in
/// either order and converge through the commutative merges.
#[derive(Debug)]
pub struct ConversationState {
    conversation_id: ConversationId,
    config: ReconcileConfig,
    /// Finalized timeline, oldest first. Replaced wholesale when persisted
    /// history supersedes the ephemeral view.
    messages: Vec<ChatMessage>,
    assembler: MessageAssembler,
    aggregator: ToolAggregator,
    live_anchors: LiveAnchorTracker,
    /// Durable anchor map; live-turn anchors fold in at turn end.
    anchors: ToolEventAnchors,
    side_channel: SideChannelStreamMap,
    last_error: Option<String>,
    usage: Option<TokenUsage>,
    last_response_id: Option<String>,
}

impl ConversationState {
    pub fn new(conversation_id: ConversationId, config: ReconcileConfig) -> Self {
        Self {
            conversation_id,
            config,
            messages: Vec::new(),
            assembler: MessageAssembler::new(),
            aggregator: ToolAggregator::new(),
            live_anchors: LiveAnchorTracker::new(),
            anchors: ToolEventAnchors::new(),
            side_channel: SideChannelStreamMap::new(),
            last_error: None,
            usage: None,
            last_response_id: None,
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn usage(&self) -> Option<&TokenUsage> {
        self.usage.as_ref()
    }

    pub fn last_response_id(&self) -> Option<&str> {
        self.last_response_id.as_deref()
    }

    /// Open a new turn: append the user's message under an ephemeral id and
    /// point live anchoring at it. Returns the ephemeral message id.
    pub fn push_user_message(&mut self, content: &str, now: DateTime<Utc>) -> String {
        let id = Uuid::new_v4().to_string();
        let mut message = ChatMessage::new(id.clone(), Role::User, content);
        message.timestamp = Some(now);
        self.messages.push(message);
        self.live_anchors.note_user_message(&id);
        self.last_error = None;
        id
    }

    /// Fold one decoded live event into the conversation. Events arrive in
    /// a single total order (arrival order); duplicates are harmless.
    pub fn apply_stream_event(&mut self, event: &StreamEvent, now: DateTime<Utc>) {
        match event {
            StreamEvent::MessageDelta {
                delta,
                item_id,
                output_index,
                ..
            } => {
                self.assembler
                    .apply_delta(item_id.as_deref(), delta, *output_index);
            }
            StreamEvent::ToolStatusUpdate { call_id, .. } => {
                self.aggregator.apply_event(event);
                self.live_anchors.anchor_tool(call_id);
            }
            StreamEvent::ToolOutput { call_id, .. } => {
                self.aggregator.apply_event(event);
                self.live_anchors.anchor_tool(call_id);
            }
            StreamEvent::Completed {
                response_id,
                response_text,
                usage,
            } => {
                if let Some(message) = self.assembler.finalize(response_text.as_deref(), now) {
                    self.messages.push(message);
                }
                self.fold_live_anchors();
                if !response_id.is_empty() {
                    self.last_response_id = Some(response_id.clone());
                }
                if usage.is_some() {
                    self.usage = usage.clone();
                }
            }
            StreamEvent::Error { message } => {
                self.messages.extend(self.assembler.apply_error(now));
                self.fold_live_anchors();
                self.last_error = Some(message.clone());
            }
        }
    }

    fn fold_live_anchors(&mut self) {
        let live = self.live_anchors.take_anchors();
        if !live.is_empty() {
            self.anchors = merge_tool_event_anchors(&self.anchors, &live);
        }
    }

    /// Backfill from an ordered persisted-history snapshot. The history
    /// view acts as the overlay for tool state and anchors, and the whole
    /// operation is idempotent, so reloading the same events twice (or
    /// after the live stream already saw the same tool ids) changes
    /// nothing.
    pub fn ingest_history(&mut self, events: &[ConversationEvent]) {
        if events.is_empty() {
            return;
        }
        let mut history = ToolAggregator::new();
        for event in events {
            if event.tool_call_id.is_some() {
                history.ingest_history_event(event);
            }
        }
        let history_anchors = resolve_anchors(events, &self.messages);

        self.aggregator
            .replace_tools(merge_tool_states(self.aggregator.tools(), history.tools()));
        self.anchors = merge_tool_event_anchors(&self.anchors, &history_anchors);
        debug!(
            "history backfill: {} events, {} tools, {} anchored",
            events.len(),
            self.aggregator.tools().len(),
            self.anchors.values().map(Vec::len).sum::<usize>()
        );
    }

    /// Merge a side-channel overlay (tool-call id → incremental payload).
    pub fn merge_side_channel(&mut self, overlay: &SideChannelStreamMap) {
        self.side_channel = merge_stream_maps(&self.side_channel, overlay);
    }

    pub fn side_channel(&self) -> &SideChannelStreamMap {
        &self.side_channel
    }

    /// Replace the message list wholesale (ephemeral ids superseded by
    /// persisted ids) and rebind every stale anchor id onto the new list.
    pub fn replace_messages(&mut self, persisted: Vec<ChatMessage>) {
        self.fold_live_anchors();
        self.anchors = reanchor_tool_event_anchors(
            &self.anchors,
            &self.messages,
            &persisted,
            self.config.reanchor_window,
        );
        self.messages = persisted;
        // Re-point live anchoring at the newest durable user turn so tools
        // still streaming attach to a real id.
        if let Some(last_user) = self
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.id.clone())
        {
            self.live_anchors.note_user_message(&last_user);
        }
    }

    /// Pull-based live loop for one turn: consume decoded events until the
    /// terminal record, honoring cancellation. Cancellation discards only
    /// the in-flight turn's partial state; finalized messages stay.
    pub async fn run_turn<S>(&mut self, events: S, cancel: &CancellationToken) -> Result<()>
    where
        S: Stream<Item = Result<StreamEvent>> + Unpin,
    {
        let mut events = events;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort_in_flight();
                    return Err(SpliceErr::Interrupted);
                }
                next = events.next() => {
                    match next {
                        Some(Ok(event)) => {
                            let failed = match &event {
                                StreamEvent::Completed { .. } => {
                                    self.apply_stream_event(&event, Utc::now());
                                    return Ok(());
                                }
                                StreamEvent::Error { message } => Some(message.clone()),
                                _ => None,
                            };
                            self.apply_stream_event(&event, Utc::now());
                            if let Some(message) = failed {
                                return Err(SpliceErr::Stream(message));
                            }
                        }
                        Some(Err(e)) => {
                            warn!("live stream failed: {e}");
                            self.note_stream_failure(&e);
                            return Err(e);
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Terminal transport failure: freeze partial state and flag the turn.
    /// No retry happens here; that is the transport collaborator's job.
    pub fn note_stream_failure(&mut self, err: &SpliceErr) {
        self.messages.extend(self.assembler.apply_error(Utc::now()));
        self.fold_live_anchors();
        self.last_error = Some(err.surface_message());
    }

    fn abort_in_flight(&mut self) {
        // Partial assembler content is dropped, not frozen: the turn never
        // reached a terminal event.
        let _ = self.assembler.apply_error(Utc::now());
        for call_id in self.live_anchors.discard_current_turn() {
            self.aggregator.remove(&call_id);
        }
    }

    /// The externally observable timeline: finalized messages plus the
    /// turn's in-progress messages, tool states in discovery order, and the
    /// merged anchor map.
    pub fn snapshot(&self) -> TimelineSnapshot {
        let mut messages = self.messages.clone();
        messages.extend(self.assembler.current_messages());
        TimelineSnapshot {
            messages,
            tools: self.aggregator.states(),
            anchors: merge_tool_event_anchors(&self.anchors, self.live_anchors.anchors()),
            is_streaming: self.assembler.is_streaming(),
            last_error: self.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use splice_protocol::event::RunItemType;
    use splice_protocol::tool::ToolStatus;

    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_754_000_000 + secs, 0).unwrap()
    }

    fn new_state() -> ConversationState {
        ConversationState::new(ConversationId::new(), ReconcileConfig::default())
    }

    fn tool_status(call_id: &str) -> StreamEvent {
        StreamEvent::ToolStatusUpdate {
            call_id: call_id.to_string(),
            status: ToolStatus::InputAvailable,
            tool_type: Some("web_search".to_string()),
            name: None,
            query: None,
            agent: None,
            output_index: Some(0),
            timestamp: Some(t(1)),
        }
    }

    fn tool_output(call_id: &str) -> StreamEvent {
        StreamEvent::ToolOutput {
            call_id: call_id.to_string(),
            tool_type: None,
            output: json!({"ok": true}),
            success: None,
            timestamp: Some(t(2)),
        }
    }

    fn completed(response_text: Option<&str>) -> StreamEvent {
        StreamEvent::Completed {
            response_id: "resp1".to_string(),
            response_text: response_text.map(str::to_string),
            usage: None,
        }
    }

    fn history_tool_events(call_id: &str) -> Vec<ConversationEvent> {
        vec![
            ConversationEvent {
                sequence_no: 2,
                role: Some(Role::Assistant),
                content_text: None,
                run_item_type: RunItemType::ToolCall,
                tool_call_id: Some(call_id.to_string()),
                tool_name: Some("web_search".to_string()),
                call_arguments: Some(json!({"query": "rust"})),
                call_output: None,
                timestamp: Some(t(1)),
            },
            ConversationEvent {
                sequence_no: 3,
                role: Some(Role::Assistant),
                content_text: None,
                run_item_type: RunItemType::ToolResult,
                tool_call_id: Some(call_id.to_string()),
                tool_name: None,
                call_arguments: None,
                call_output: Some(json!({"ok": true})),
                timestamp: Some(t(2)),
            },
        ]
    }

    #[test]
    fn tool_only_turn_yields_tools_but_no_assistant_message() {
        let mut state = new_state();
        let user_id = state.push_user_message("search for rust", t(0));
        state.apply_stream_event(&tool_status("t1"), t(1));
        state.apply_stream_event(&tool_output("t1"), t(2));
        state.apply_stream_event(&completed(None), t(3));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.tools.len(), 1);
        assert_eq!(snapshot.tools[0].status, ToolStatus::OutputAvailable);
        assert_eq!(snapshot.anchors[&user_id], vec!["t1".to_string()]);
        assert!(!snapshot.is_streaming);
        assert_eq!(snapshot.last_error, None);
    }

    #[test]
    fn deltas_then_final_yield_one_assistant_message() {
        let mut state = new_state();
        state.push_user_message("say hello", t(0));
        for (delta, now) in [("Hel", t(1)), ("lo", t(2))] {
            state.apply_stream_event(
                &StreamEvent::MessageDelta {
                    delta: delta.to_string(),
                    item_id: Some("m1".to_string()),
                    output_index: Some(0),
                    content_index: None,
                    sequence_number: None,
                },
                now,
            );
        }
        assert!(state.snapshot().is_streaming);
        state.apply_stream_event(&completed(Some("Hello")), t(3));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, "Hello");
        assert!(!snapshot.messages[1].is_streaming);
        assert!(!snapshot.is_streaming);
    }

    #[test]
    fn history_and_stream_converge_in_either_order() {
        let run = |history_first: bool| {
            let mut state = new_state();
            let user_id = state.push_user_message("search", t(0));
            let history = history_tool_events("t1");
            if history_first {
                state.ingest_history(&history);
            }
            state.apply_stream_event(&tool_status("t1"), t(1));
            state.apply_stream_event(&tool_output("t1"), t(2));
            state.apply_stream_event(&completed(None), t(3));
            if !history_first {
                state.ingest_history(&history);
            }
            (user_id, state.snapshot())
        };

        let (user_a, a) = run(true);
        let (user_b, b) = run(false);
        assert_eq!(a.tools, b.tools);
        assert_eq!(a.tools[0].status, ToolStatus::OutputAvailable);
        assert_eq!(a.tools[0].input, Some(json!({"query": "rust"})));
        assert_eq!(a.anchors[&user_a], vec!["t1".to_string()]);
        assert_eq!(b.anchors[&user_b], vec!["t1".to_string()]);
    }

    #[test]
    fn ingest_history_twice_is_idempotent() {
        let mut state = new_state();
        state.push_user_message("search", t(0));
        let history = history_tool_events("t1");
        state.ingest_history(&history);
        let first = state.snapshot();
        state.ingest_history(&history);
        assert_eq!(state.snapshot(), first);
    }

    #[test]
    fn replace_messages_rebinds_anchors_to_persisted_ids() {
        let mut state = new_state();
        state.push_user_message("run it", t(0));
        state.apply_stream_event(&tool_status("t1"), t(1));
        state.apply_stream_event(&completed(Some("done")), t(2));

        let mut persisted_user = ChatMessage::new("db-u1", Role::User, "run it");
        persisted_user.timestamp = Some(t(0));
        let mut persisted_assistant = ChatMessage::new("db-a1", Role::Assistant, "done");
        persisted_assistant.timestamp = Some(t(2));
        state.replace_messages(vec![persisted_user, persisted_assistant]);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.anchors[&"db-u1".to_string()], vec!["t1".to_string()]);
        assert_eq!(snapshot.messages[0].id, "db-u1");
        assert_eq!(snapshot.messages[1].id, "db-a1");
    }

    #[tokio::test]
    async fn cancellation_discards_only_the_in_flight_turn() {
        let mut state = new_state();
        state.push_user_message("first", t(0));
        state.apply_stream_event(&completed(Some("first answer")), t(1));

        state.push_user_message("second", t(2));
        state.apply_stream_event(
            &StreamEvent::MessageDelta {
                delta: "partial".to_string(),
                item_id: Some("m2".to_string()),
                output_index: Some(0),
                content_index: None,
                sequence_number: None,
            },
            t(3),
        );
        state.apply_stream_event(&tool_status("t9"), t(3));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let pending = futures::stream::pending::<Result<StreamEvent>>();
        let err = state.run_turn(pending, &cancel).await.unwrap_err();
        assert!(matches!(err, SpliceErr::Interrupted));

        let snapshot = state.snapshot();
        // The finalized first turn is untouched; the in-flight turn's
        // partial message and tool are gone.
        assert_eq!(snapshot.messages.len(), 3);
        assert_eq!(snapshot.messages[1].content, "first answer");
        assert!(snapshot.tools.is_empty());
        assert!(!snapshot.is_streaming);
    }

    #[tokio::test]
    async fn transport_failure_freezes_partial_state() {
        let mut state = new_state();
        state.push_user_message("go", t(0));

        let events: Vec<Result<StreamEvent>> = vec![
            Ok(StreamEvent::MessageDelta {
                delta: "half an ans".to_string(),
                item_id: Some("m1".to_string()),
                output_index: Some(0),
                content_index: None,
                sequence_number: None,
            }),
            Err(SpliceErr::Stream("connection reset".to_string())),
        ];
        let stream = futures::stream::iter(events);
        let cancel = CancellationToken::new();
        let err = state.run_turn(stream, &cancel).await.unwrap_err();
        assert!(matches!(err, SpliceErr::Stream(_)));

        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, "half an ans");
        assert!(!snapshot.is_streaming);
        assert_eq!(snapshot.last_error.as_deref(), Some("stream disconnected before completion: connection reset"));
    }

    #[tokio::test]
    async fn terminal_error_event_flags_the_turn() {
        let mut state = new_state();
        state.push_user_message("go", t(0));

        let events: Vec<Result<StreamEvent>> = vec![Ok(StreamEvent::Error {
            message: "overloaded".to_string(),
        })];
        let stream = futures::stream::iter(events);
        let cancel = CancellationToken::new();
        let err = state.run_turn(stream, &cancel).await.unwrap_err();
        assert!(matches!(err, SpliceErr::Stream(_)));
        assert_eq!(state.snapshot().last_error.as_deref(), Some("overloaded"));
    }
}
