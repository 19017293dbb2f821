//! Automation runner — lease-based execution engine for automation jobs.

pub mod config;
pub mod error;
pub mod executor;
pub mod identity;
pub mod job;
pub mod runner;
pub mod store;
