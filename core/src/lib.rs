//! Reconciliation engine for a conversational client: fuses the live event
//! stream and the separately-fetched persisted history into one stable,
//! ordered timeline of messages and tool invocations, with every tool call
//! anchored to the turn that produced it even while anchor targets are
//! still ephemeral ids.
//!
//! The engine is a pure transformation layer between the transport and
//! persistence collaborators on one side and presentation on the other: it
//! performs no network or storage I/O and renders nothing.

pub mod aggregator;
pub mod anchor;
pub mod assembler;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod list_merge;
pub mod merge;

pub use conversation::ConversationState;
pub use conversation::ReconcileConfig;
pub use conversation::TimelineSnapshot;
pub use error::Result;
pub use error::SpliceErr;
