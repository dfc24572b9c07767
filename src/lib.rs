//! Client-side chat synchronization core.
//!
//! Keeps a local view of conversations and messages for one user coherent
//! across a push channel (new messages, deletions, typing, presence) and a
//! request/response API (pages, creates, updates, deletes).

pub mod api;
pub mod app;
pub mod engine;
pub mod error;
pub mod presence;
pub mod session;
pub mod storage;
pub mod utils;

pub use engine::{EngineConfig, FetchTicket, Followup, SendOutcome, SendRequest, SyncEngine};
pub use error::{ConnectionError, RequestError, SyncError};
