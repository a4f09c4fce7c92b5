//! Route handlers for the HTTP API.

pub mod health;
pub mod ingest;
pub mod jobs;
pub mod progress;
pub mod realtime;
pub mod stats;
pub mod stream;
pub mod streaming_helpers;
pub mod videos;
