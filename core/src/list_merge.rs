use std::cmp::Reverse;
use std::collections::HashSet;

use chrono::DateTime;
use chrono::Utc;

use splice_protocol::event::ConversationSummary;

/// Record shape the generic recency merge operates over: conversation
/// summaries, billing events, anything `{id, updatedAt}`-like.
pub trait MergeRecord {
    fn id(&self) -> &str;
    fn updated_at(&self) -> DateTime<Utc>;
}

impl MergeRecord for ConversationSummary {
    fn id(&self) -> &str {
        &self.id
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

/// Merge two record lists: the live/stream source wins on id collision over
/// the history source, the combined set is deduplicated by id, sorted
/// descending by timestamp, and optionally truncated.
pub fn merge_by_recency<T>(live: &[T], history: &[T], limit: Option<usize>) -> Vec<T>
where
    T: MergeRecord + Clone,
{
    let mut seen: HashSet<&str> = HashSet::new();
    let mut merged: Vec<T> = Vec::with_capacity(live.len() + history.len());
    for record in live.iter().chain(history) {
        if seen.insert(record.id()) {
            merged.push(record.clone());
        }
    }
    merged.sort_by_key(|r| Reverse(r.updated_at()));
    if let Some(limit) = limit {
        merged.truncate(limit);
    }
    merged
}
