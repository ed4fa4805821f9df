//! Resumable chunked file-upload client core.
//!
//! Takes user-selected media files, negotiates upload sessions with a remote
//! backend, transfers chunks concurrently under a global cap with
//! exponential-backoff retry, and survives pause/resume, cancel, and process
//! restarts by persisting per-session progress. A local HTTP API with SSE
//! events is the control surface for host shells.

pub mod api;
pub mod blob;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod events;
pub mod hasher;
pub mod logging;
pub mod store;
pub mod types;
