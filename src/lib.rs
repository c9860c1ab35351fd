//! hoopsync: idempotent basketball statistics sync.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod api;
pub mod config;
pub mod engine;
pub mod normalize;
pub mod retry;
pub mod stop;
pub mod storage;
pub mod types;
