//! Pure merge operations combining the live-stream view with the
//! persisted-history view. Every operation is idempotent
//! (`merge(X, X) == X`) and an empty overlay or base returns the other side
//! unmodified; the two sources may complete in either order, so the
//! externally observable result must not depend on which one observed a
//! tool id first.

use std::collections::HashMap;
use std::collections::HashSet;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use splice_protocol::message::ChatMessage;
use splice_protocol::message::Role;
use splice_protocol::message::strip_stream_cursor;
use splice_protocol::tool::SideChannelStreamMap;
use splice_protocol::tool::ToolEventAnchors;
use splice_protocol::tool::ToolState;
use splice_protocol::tool::ToolStatus;

/// Default window for the timestamp fallback during reanchoring. Injectable
/// through `ReconcileConfig`; two minutes bounds the damage of a wrong
/// nearest-neighbor match across turns.
pub const DEFAULT_REANCHOR_WINDOW: Duration = Duration::from_secs(120);

fn merged_status(a: ToolStatus, b: ToolStatus) -> ToolStatus {
    if a.rank() > b.rank() {
        a
    } else if b.rank() > a.rank() {
        b
    } else if a == ToolStatus::OutputError || b == ToolStatus::OutputError {
        // Terminal tie: an error report must not be hidden by a success
        // observed on the other channel, whichever side it came from.
        ToolStatus::OutputError
    } else {
        a
    }
}

fn merge_tool_state(base: &ToolState, overlay: &ToolState) -> ToolState {
    ToolState {
        id: base.id.clone(),
        name: overlay.name.clone().or_else(|| base.name.clone()),
        tool_type: overlay.tool_type.clone().or_else(|| base.tool_type.clone()),
        agent: overlay.agent.clone().or_else(|| base.agent.clone()),
        output_index: overlay.output_index.or(base.output_index),
        status: merged_status(base.status, overlay.status),
        input: overlay.input.clone().or_else(|| base.input.clone()),
        output: overlay.output.clone().or_else(|| base.output.clone()),
        error_text: overlay.error_text.clone().or_else(|| base.error_text.clone()),
    }
}

/// Merge two per-tool state maps. Per shared id the overlay's defined
/// fields win and the base fills gaps; merged status rank is never lower
/// than either input. Base discovery order is kept, overlay-only tools
/// append in overlay order.
pub fn merge_tool_states(
    base: &IndexMap<String, ToolState>,
    overlay: &IndexMap<String, ToolState>,
) -> IndexMap<String, ToolState> {
    if overlay.is_empty() {
        return base.clone();
    }
    if base.is_empty() {
        return overlay.clone();
    }

    let mut merged = IndexMap::with_capacity(base.len() + overlay.len());
    for (id, base_state) in base {
        let state = match overlay.get(id) {
            Some(overlay_state) => merge_tool_state(base_state, overlay_state),
            None => base_state.clone(),
        };
        merged.insert(id.clone(), state);
    }
    for (id, overlay_state) in overlay {
        if !merged.contains_key(id) {
            merged.insert(id.clone(), overlay_state.clone());
        }
    }
    merged
}

/// Merge two anchor maps. The overlay wins unconditionally for every tool
/// id it mentions anywhere: that id is first removed from the base's lists,
/// then the remaining lists union, deduplicated per anchor with discovery
/// order preserved (base entries first).
pub fn merge_tool_event_anchors(
    base: &ToolEventAnchors,
    overlay: &ToolEventAnchors,
) -> ToolEventAnchors {
    if overlay.is_empty() {
        return base.clone();
    }
    if base.is_empty() {
        return overlay.clone();
    }

    let overlaid: HashSet<&str> = overlay.values().flatten().map(String::as_str).collect();

    let mut merged = ToolEventAnchors::new();
    for (anchor, ids) in base {
        let kept: Vec<String> = ids
            .iter()
            .filter(|id| !overlaid.contains(id.as_str()))
            .cloned()
            .collect();
        if !kept.is_empty() {
            merged.insert(anchor.clone(), kept);
        }
    }
    for (anchor, ids) in overlay {
        let entry = merged.entry(anchor.clone()).or_default();
        for id in ids {
            if !entry.contains(id) {
                entry.push(id.clone());
            }
        }
    }
    merged
}

/// Merge two side-channel maps with the same overlay preference as tool
/// states: overlay wins per key, base fills gaps.
pub fn merge_stream_maps(
    base: &SideChannelStreamMap,
    overlay: &SideChannelStreamMap,
) -> SideChannelStreamMap {
    if overlay.is_empty() {
        return base.clone();
    }
    if base.is_empty() {
        return overlay.clone();
    }
    let mut merged = base.clone();
    for (id, payload) in overlay {
        merged.insert(id.clone(), payload.clone());
    }
    merged
}

/// Role plus content with streaming markers stripped: the identity a
/// message keeps across the ephemeral-to-persisted id swap.
fn signature(message: &ChatMessage) -> (Role, String) {
    (message.role, strip_stream_cursor(&message.content).into_owned())
}

/// Rebind an anchor map after the message list behind it was replaced
/// wholesale (ephemeral ids superseded by persisted ids).
///
/// Per anchor id: keep it if the target list still contains it; else match
/// by signature, disambiguating by ordinal position among same-signature
/// messages (first ephemeral maps to first persisted, and so on); else fall
/// back to the nearest same-role target by timestamp then by index, bounded
/// by `window`. An anchor resolvable by none of these is dropped rather
/// than guessed.
pub fn reanchor_tool_event_anchors(
    anchors: &ToolEventAnchors,
    source_messages: &[ChatMessage],
    target_messages: &[ChatMessage],
    window: Duration,
) -> ToolEventAnchors {
    if anchors.is_empty() {
        return ToolEventAnchors::new();
    }

    let target_ids: HashSet<&str> = target_messages.iter().map(|m| m.id.as_str()).collect();
    let target_signatures: Vec<(Role, String)> =
        target_messages.iter().map(signature).collect();

    // Process anchors in source-list order so that two source anchors
    // collapsing onto one target id always concatenate deterministically.
    let mut ordered: Vec<(&String, &Vec<String>)> = anchors.iter().collect();
    let source_position: HashMap<&str, usize> = source_messages
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();
    ordered.sort_by(|(a, _), (b, _)| {
        let pa = source_position.get(a.as_str()).copied().unwrap_or(usize::MAX);
        let pb = source_position.get(b.as_str()).copied().unwrap_or(usize::MAX);
        pa.cmp(&pb).then_with(|| a.cmp(b))
    });

    let mut merged = ToolEventAnchors::new();
    for (anchor, ids) in ordered {
        let Some(new_anchor) = resolve_anchor_target(
            anchor,
            source_messages,
            target_messages,
            &target_ids,
            &target_signatures,
            window,
        ) else {
            debug!("anchor {anchor} has no counterpart in the replacement list; dropped");
            continue;
        };
        let entry = merged.entry(new_anchor).or_default();
        for id in ids {
            if !entry.contains(id) {
                entry.push(id.clone());
            }
        }
    }
    merged
}

fn resolve_anchor_target(
    anchor: &str,
    source_messages: &[ChatMessage],
    target_messages: &[ChatMessage],
    target_ids: &HashSet<&str>,
    target_signatures: &[(Role, String)],
    window: Duration,
) -> Option<String> {
    // Already a durable id.
    if target_ids.contains(anchor) {
        return Some(anchor.to_string());
    }

    let source_index = source_messages.iter().position(|m| m.id == anchor)?;
    let source = &source_messages[source_index];
    let source_signature = signature(source);

    // Ordinal among same-signature source messages.
    let ordinal = source_messages[..source_index]
        .iter()
        .filter(|m| signature(m) == source_signature)
        .count();
    let candidates: Vec<usize> = target_signatures
        .iter()
        .enumerate()
        .filter(|(_, s)| **s == source_signature)
        .map(|(i, _)| i)
        .collect();
    if let Some(target_index) = candidates.get(ordinal) {
        return Some(target_messages[*target_index].id.clone());
    }

    // Nearest by timestamp, then by index, inside the window.
    let window_ms = window.as_millis() as i64;
    let source_ts = source.timestamp.map(|t| t.timestamp_millis());
    let mut best: Option<(i64, i64, &ChatMessage)> = None;
    for (target_index, target) in target_messages.iter().enumerate() {
        if target.role != source.role {
            continue;
        }
        let ts_distance = match (source_ts, target.timestamp.map(|t| t.timestamp_millis())) {
            (Some(a), Some(b)) => (a - b).abs(),
            _ => continue,
        };
        if ts_distance > window_ms {
            continue;
        }
        let index_distance = (source_index as i64 - target_index as i64).abs();
        let key = (ts_distance, index_distance);
        if best.is_none_or(|(d, i, _)| key < (d, i)) {
            best = Some((ts_distance, index_distance, target));
        }
    }
    best.map(|(_, _, target)| target.id.clone())
}
