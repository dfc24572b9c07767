//! In-memory stores owned by the sync engine.
//!
//! Each store publishes an immutable snapshot after every mutation, so readers
//! never observe a partial update.

pub mod conversations;
pub mod messages;

pub use conversations::{ConversationStore, PreviewOutcome};
pub use messages::MessageStore;
