//! Persistence layer — libSQL-backed storage for jobs, tasks, and conversations.

mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{ConversationMessage, JobStore, LeaseClaim};
