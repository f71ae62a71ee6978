use indexmap::IndexMap;
use serde_json::Value;
use serde_json::json;
use tracing::debug;

use splice_protocol::event::ConversationEvent;
use splice_protocol::event::RunItemType;
use splice_protocol::event::StreamEvent;
use splice_protocol::tool::ToolState;
use splice_protocol::tool::ToolStatus;

/// Accumulates one [`ToolState`] per tool-call id across lifecycle events,
/// in discovery order. Status only advances; replaying an already-applied
/// event is a no-op, so at-least-once delivery from either data source is
/// safe.
#[derive(Debug, Default)]
pub struct ToolAggregator {
    tools: IndexMap<String, ToolState>,
}

/// Whether a result payload signals failure. An explicit `success` flag
/// wins; otherwise look for the conventional `ok: false` / non-null `error`
/// shapes.
fn output_signals_failure(output: &Value, success: Option<bool>) -> bool {
    if let Some(ok) = success {
        return !ok;
    }
    match output {
        Value::Object(map) => {
            matches!(map.get("ok"), Some(Value::Bool(false)))
                || map.get("error").is_some_and(|e| !e.is_null())
        }
        _ => false,
    }
}

fn error_text_from_output(output: &Value) -> Option<String> {
    match output.get("error") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Object(map)) => map.get("message").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Advance `current` to `incoming` without ever moving backward. On a
/// terminal-rank tie `output-error` wins: an error report must not be
/// hidden by a replayed success, and the rule keeps aggregation order-
/// independent.
pub(crate) fn advance_status(current: ToolStatus, incoming: ToolStatus) -> ToolStatus {
    if incoming.rank() > current.rank() {
        incoming
    } else if incoming.rank() == current.rank() && incoming == ToolStatus::OutputError {
        ToolStatus::OutputError
    } else {
        current
    }
}

impl ToolAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool states in discovery order.
    pub fn states(&self) -> Vec<ToolState> {
        self.tools.values().cloned().collect()
    }

    pub fn tools(&self) -> &IndexMap<String, ToolState> {
        &self.tools
    }

    pub fn get(&self, call_id: &str) -> Option<&ToolState> {
        self.tools.get(call_id)
    }

    /// Replace the whole map, e.g. with the result of a reconciliation
    /// merge against the persisted-history view.
    pub fn replace_tools(&mut self, tools: IndexMap<String, ToolState>) {
        self.tools = tools;
    }

    /// Drop a tool, used when an aborted turn's partial state is discarded.
    pub fn remove(&mut self, call_id: &str) -> Option<ToolState> {
        self.tools.shift_remove(call_id)
    }

    fn entry(&mut self, call_id: &str) -> &mut ToolState {
        self.tools
            .entry(call_id.to_string())
            .or_insert_with(|| ToolState::new(call_id))
    }

    /// Fold one decoded live event into the per-tool state. Events that do
    /// not concern tools are ignored.
    pub fn apply_event(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::ToolStatusUpdate {
                call_id,
                status,
                tool_type,
                name,
                query,
                agent,
                output_index,
                ..
            } => {
                let tool = self.entry(call_id);
                if let Some(name) = name {
                    tool.name = Some(name.clone());
                }
                if let Some(tool_type) = tool_type {
                    tool.tool_type = Some(tool_type.clone());
                }
                if let Some(agent) = agent {
                    tool.agent = Some(agent.clone());
                }
                if output_index.is_some() {
                    tool.output_index = *output_index;
                }
                // Avoid unstable `let` chains: expand into nested conditionals.
                if tool.input.is_none() {
                    if let Some(query) = query {
                        tool.input = Some(json!({ "query": query }));
                    }
                }
                tool.status = advance_status(tool.status, *status);
            }
            StreamEvent::ToolOutput {
                call_id,
                tool_type,
                output,
                success,
                ..
            } => {
                let tool = self.entry(call_id);
                if tool.tool_type.is_none() {
                    tool.tool_type = tool_type.clone();
                }
                tool.output = Some(output.clone());
                if output_signals_failure(output, *success) {
                    tool.error_text = error_text_from_output(output);
                    tool.status = advance_status(tool.status, ToolStatus::OutputError);
                } else {
                    tool.status = advance_status(tool.status, ToolStatus::OutputAvailable);
                }
            }
            _ => {}
        }
    }

    /// Fold one persisted history record through the same monotonic rules,
    /// so a reload backfills tool state without regressing anything the
    /// live stream already observed.
    pub fn ingest_history_event(&mut self, event: &ConversationEvent) {
        let Some(call_id) = event.tool_call_id.as_deref() else {
            return;
        };

        if event.run_item_type.is_tool_invocation() {
            let tool = self.entry(call_id);
            if let Some(name) = &event.tool_name {
                tool.name = Some(name.clone());
            }
            if let Some(args) = &event.call_arguments {
                tool.input = Some(args.clone());
            }
            tool.status = advance_status(tool.status, ToolStatus::InputAvailable);
            // A fully persisted call may carry its result inline.
            if let Some(output) = &event.call_output {
                tool.output = Some(output.clone());
                if output_signals_failure(output, None) {
                    tool.error_text = error_text_from_output(output);
                    tool.status = advance_status(tool.status, ToolStatus::OutputError);
                } else {
                    tool.status = advance_status(tool.status, ToolStatus::OutputAvailable);
                }
            }
        } else if event.run_item_type == RunItemType::ToolResult {
            let tool = self.entry(call_id);
            if let Some(output) = &event.call_output {
                tool.output = Some(output.clone());
                if output_signals_failure(output, None) {
                    tool.error_text = error_text_from_output(output);
                    tool.status = advance_status(tool.status, ToolStatus::OutputError);
                } else {
                    tool.status = advance_status(tool.status, ToolStatus::OutputAvailable);
                }
            }
        } else {
            debug!("ignoring non-tool history event seq={}", event.sequence_no);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use splice_protocol::event::RunItemType;

    use super::*;

    fn status_event(call_id: &str, status: ToolStatus) -> StreamEvent {
        StreamEvent::ToolStatusUpdate {
            call_id: call_id.to_string(),
            status,
            tool_type: Some("web_search".to_string()),
            name: None,
            query: Some("rust".to_string()),
            agent: None,
            output_index: None,
            timestamp: None,
        }
    }

    fn output_event(call_id: &str, output: Value, success: Option<bool>) -> StreamEvent {
        StreamEvent::ToolOutput {
            call_id: call_id.to_string(),
            tool_type: None,
            output,
            success,
            timestamp: None,
        }
    }

    #[test]
    fn status_then_output_reaches_output_available() {
        let mut agg = ToolAggregator::new();
        agg.apply_event(&status_event("t1", ToolStatus::InputAvailable));
        agg.apply_event(&output_event("t1", json!({"ok": true}), None));

        let tool = agg.get("t1").unwrap();
        assert_eq!(tool.status, ToolStatus::OutputAvailable);
        assert_eq!(tool.input, Some(json!({"query": "rust"})));
        assert_eq!(tool.output, Some(json!({"ok": true})));
    }

    #[test]
    fn status_never_regresses() {
        let mut agg = ToolAggregator::new();
        agg.apply_event(&output_event("t1", json!({"ok": true}), None));
        agg.apply_event(&status_event("t1", ToolStatus::InputStreaming));

        assert_eq!(agg.get("t1").unwrap().status, ToolStatus::OutputAvailable);
    }

    #[test]
    fn replay_is_a_no_op() {
        let mut agg = ToolAggregator::new();
        let ev = status_event("t1", ToolStatus::InputAvailable);
        agg.apply_event(&ev);
        let before = agg.states();
        agg.apply_event(&ev);
        assert_eq!(agg.states(), before);
    }

    #[test]
    fn failure_payload_sets_output_error() {
        let mut agg = ToolAggregator::new();
        agg.apply_event(&output_event(
            "t1",
            json!({"error": {"message": "boom"}}),
            None,
        ));

        let tool = agg.get("t1").unwrap();
        assert_eq!(tool.status, ToolStatus::OutputError);
        assert_eq!(tool.error_text.as_deref(), Some("boom"));
    }

    #[test]
    fn explicit_success_flag_wins_over_payload_shape() {
        let mut agg = ToolAggregator::new();
        agg.apply_event(&output_event("t1", json!({"error": "ignored"}), Some(true)));
        assert_eq!(agg.get("t1").unwrap().status, ToolStatus::OutputAvailable);
    }

    #[test]
    fn error_wins_terminal_tie_regardless_of_order() {
        let mut a = ToolAggregator::new();
        a.apply_event(&output_event("t1", json!({"ok": true}), None));
        a.apply_event(&output_event("t1", json!({"ok": false}), None));

        let mut b = ToolAggregator::new();
        b.apply_event(&output_event("t1", json!({"ok": false}), None));
        b.apply_event(&output_event("t1", json!({"ok": true}), None));

        assert_eq!(a.get("t1").unwrap().status, ToolStatus::OutputError);
        assert_eq!(b.get("t1").unwrap().status, ToolStatus::OutputError);
    }

    #[test]
    fn history_backfill_matches_live_semantics() {
        let mut agg = ToolAggregator::new();
        agg.ingest_history_event(&ConversationEvent {
            sequence_no: 4,
            role: None,
            content_text: None,
            run_item_type: RunItemType::ToolCall,
            tool_call_id: Some("t1".to_string()),
            tool_name: Some("web_search".to_string()),
            call_arguments: Some(json!({"query": "rust"})),
            call_output: None,
            timestamp: None,
        });
        agg.ingest_history_event(&ConversationEvent {
            sequence_no: 5,
            role: None,
            content_text: None,
            run_item_type: RunItemType::ToolResult,
            tool_call_id: Some("t1".to_string()),
            tool_name: None,
            call_arguments: None,
            call_output: Some(json!({"ok": true})),
            timestamp: None,
        });

        let tool = agg.get("t1").unwrap();
        assert_eq!(tool.status, ToolStatus::OutputAvailable);
        assert_eq!(tool.name.as_deref(), Some("web_search"));
        assert_eq!(tool.input, Some(json!({"query": "rust"})));
    }

    #[test]
    fn discovery_order_is_preserved() {
        let mut agg = ToolAggregator::new();
        agg.apply_event(&status_event("t2", ToolStatus::InputAvailable));
        agg.apply_event(&status_event("t1", ToolStatus::InputAvailable));
        let ids: Vec<String> = agg.states().into_iter().map(|t| t.id).collect();
        assert_eq!(ids, vec!["t2".to_string(), "t1".to_string()]);
    }
}
