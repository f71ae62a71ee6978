use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use eventsource_stream::Eventsource;
use futures::prelude::*;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::io::ReaderStream;
use tracing::debug;
use tracing::trace;

use splice_protocol::event::StreamEvent;
use splice_protocol::event::TokenUsage;
use splice_protocol::tool::ToolStatus;

use crate::error::Result;
use crate::error::SpliceErr;

/// Decoded events produced by [`process_stream`], consumed by the
/// per-conversation loop as a pull-based asynchronous iteration.
pub struct EventStream {
    pub(crate) rx_event: mpsc::Receiver<Result<StreamEvent>>,
}

impl Stream for EventStream {
    type Item = Result<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx_event.poll_recv(cx)
    }
}

/// One raw record as it appears on the wire: the envelope plus every
/// kind-specific payload field, all optional so a single loose parse covers
/// the whole closed kind set. Unknown `kind` values are dropped after the
/// parse; malformed frames are transport noise and are skipped entirely.
#[derive(Debug, Deserialize)]
struct WireEvent {
    kind: String,
    #[allow(dead_code)]
    schema: Option<String>,
    event_id: Option<u64>,
    #[allow(dead_code)]
    stream_id: Option<String>,
    server_timestamp: Option<DateTime<Utc>>,
    #[allow(dead_code)]
    conversation_id: Option<String>,
    response_id: Option<String>,
    agent: Option<String>,

    // message.delta
    delta: Option<String>,
    item_id: Option<String>,
    output_index: Option<u32>,
    content_index: Option<u32>,

    // tool.status
    tool: Option<WireToolDescriptor>,

    // tool.output
    tool_call_id: Option<String>,
    tool_type: Option<String>,
    output: Option<Value>,
    success: Option<bool>,

    // final
    response: Option<Value>,

    // error
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireToolDescriptor {
    #[serde(rename = "type")]
    tool_type: Option<String>,
    call_id: String,
    status: Option<String>,
    name: Option<String>,
    query: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCompleted {
    #[allow(dead_code)]
    status: Option<String>,
    response_text: Option<String>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    input_tokens_details: Option<WireInputTokensDetails>,
    output_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct WireInputTokensDetails {
    cached_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(val: WireUsage) -> Self {
        TokenUsage {
            input_tokens: val.input_tokens,
            cached_input_tokens: val.input_tokens_details.map(|d| d.cached_tokens),
            output_tokens: val.output_tokens,
            total_tokens: val.total_tokens,
        }
    }
}

/// Map a wire status descriptor onto the monotonic lifecycle. Any active
/// descriptor we do not recognize ("searching", "running", ...) means the
/// input is fully formed and the call is underway.
fn tool_status_from_wire(raw: Option<&str>) -> ToolStatus {
    match raw {
        Some("input-streaming") | Some("arguments-streaming") => ToolStatus::InputStreaming,
        Some("output-available") | Some("completed") => ToolStatus::OutputAvailable,
        Some("output-error") | Some("failed") => ToolStatus::OutputError,
        Some(_) => ToolStatus::InputAvailable,
        None => ToolStatus::InputStreaming,
    }
}

/// Parse the live wire stream into typed [`StreamEvent`]s.
///
/// The terminal `final` summary is held back and emitted when the stream
/// closes; a stream that closes without one surfaces as a stream error so
/// the caller can flag the turn. A terminal `error` record ends the loop
/// immediately. Unrecognized kinds are skipped for forward compatibility.
pub async fn process_stream<S>(
    stream: S,
    tx_event: mpsc::Sender<Result<StreamEvent>>,
    idle_timeout: Duration,
) where
    S: Stream<Item = Result<Bytes>> + Unpin,
{
    let mut stream = stream.eventsource();

    // The completion summary from the "final" record, reported on close.
    let mut completed: Option<StreamEvent> = None;
    // Track the current item id so deltas lacking one still correlate.
    let mut current_item_id: Option<String> = None;
    // Monotonic guard: drop duplicate/out-of-order deltas per
    // (item_id, output_index) using the envelope's event_id.
    let mut last_delta_event_id: HashMap<(String, u32), u64> = HashMap::new();

    loop {
        let frame = match timeout(idle_timeout, stream.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("stream transport error: {e:#}");
                let _ = tx_event.send(Err(SpliceErr::Stream(e.to_string()))).await;
                return;
            }
            Ok(None) => {
                match completed.take() {
                    Some(ev) => {
                        let _ = tx_event.send(Ok(ev)).await;
                    }
                    None => {
                        let _ = tx_event
                            .send(Err(SpliceErr::Stream(
                                "stream closed before final event".into(),
                            )))
                            .await;
                    }
                }
                return;
            }
            Err(_) => {
                let _ = tx_event.send(Err(SpliceErr::Timeout)).await;
                return;
            }
        };

        trace!("wire event: {}", frame.data);

        let event: WireEvent = match serde_json::from_str(&frame.data) {
            Ok(event) => event,
            Err(e) => {
                let mut excerpt = frame.data.clone();
                const MAX: usize = 600;
                if excerpt.len() > MAX {
                    excerpt.truncate(MAX);
                }
                debug!("failed to parse wire event: {e}, data: {excerpt}");
                continue;
            }
        };

        match event.kind.as_str() {
            "message.delta" => {
                let Some(delta) = event.delta else { continue };
                // Prefer the explicit item id from the record; fall back to
                // the last one seen.
                if let Some(ref id) = event.item_id {
                    current_item_id = Some(id.clone());
                }
                let item_id = event.item_id.or_else(|| current_item_id.clone());
                if let (Some(id), Some(event_id)) = (&item_id, event.event_id) {
                    let key = (id.clone(), event.output_index.unwrap_or(0));
                    let last = last_delta_event_id.entry(key).or_insert(0);
                    if *last >= event_id {
                        debug!("dropping duplicate delta event_id={event_id} item={id}");
                        continue;
                    }
                    *last = event_id;
                }
                let ev = StreamEvent::MessageDelta {
                    delta,
                    item_id,
                    output_index: event.output_index,
                    content_index: event.content_index,
                    sequence_number: event.event_id,
                };
                if tx_event.send(Ok(ev)).await.is_err() {
                    return;
                }
            }
            "tool.status" => {
                let Some(tool) = event.tool else {
                    debug!("tool.status record without tool descriptor");
                    continue;
                };
                let ev = StreamEvent::ToolStatusUpdate {
                    call_id: tool.call_id,
                    status: tool_status_from_wire(tool.status.as_deref()),
                    tool_type: tool.tool_type,
                    name: tool.name,
                    query: tool.query,
                    agent: event.agent,
                    output_index: event.output_index,
                    timestamp: event.server_timestamp,
                };
                if tx_event.send(Ok(ev)).await.is_err() {
                    return;
                }
            }
            "tool.output" => {
                let Some(call_id) = event.tool_call_id else {
                    debug!("tool.output record without tool_call_id");
                    continue;
                };
                let ev = StreamEvent::ToolOutput {
                    call_id,
                    tool_type: event.tool_type,
                    output: event.output.unwrap_or(Value::Null),
                    success: event.success,
                    timestamp: event.server_timestamp,
                };
                if tx_event.send(Ok(ev)).await.is_err() {
                    return;
                }
            }
            "final" => {
                let Some(resp_val) = event.response else { continue };
                match serde_json::from_value::<WireCompleted>(resp_val) {
                    Ok(summary) => {
                        completed = Some(StreamEvent::Completed {
                            response_id: event.response_id.unwrap_or_default(),
                            response_text: summary.response_text,
                            usage: summary.usage.map(Into::into),
                        });
                    }
                    Err(e) => {
                        debug!("failed to parse completion summary: {e}");
                        continue;
                    }
                }
            }
            "error" => {
                let message = event
                    .message
                    .unwrap_or_else(|| "terminal error event".to_string());
                let _ = tx_event.send(Ok(StreamEvent::Error { message })).await;
                return;
            }
            _ => {}
        }
    }
}

/// Replay a newline-delimited fixture of wire records through the decode
/// loop; used in tests and offline debugging.
pub fn stream_from_fixture(
    path: impl AsRef<Path>,
    idle_timeout: Duration,
) -> Result<EventStream> {
    let (tx_event, rx_event) = mpsc::channel::<Result<StreamEvent>>(1600);
    let f = std::fs::File::open(path.as_ref())?;
    let lines = std::io::BufReader::new(f).lines();

    // insert \n\n after each line for proper frame splitting
    let mut content = String::new();
    for line in lines {
        content.push_str(&line?);
        content.push_str("\n\n");
    }

    let rdr = std::io::Cursor::new(content);
    let stream = ReaderStream::new(rdr).map_err(SpliceErr::Io);
    tokio::spawn(process_stream(stream, tx_event, idle_timeout));
    Ok(EventStream { rx_event })
}
