//! Core engine: the fetch → normalize → upsert pass.

pub mod coordinator;

pub use coordinator::{Coordinator, SyncSettings};
