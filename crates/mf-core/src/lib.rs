//! mf-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for the other mf-* crates,
//! providing type-safe identifiers, a unified error type (including the
//! structured [`TranscodeError`]), the preset/metadata media model,
//! application configuration, progress records, statistics snapshots and
//! the broadcast event bus used by the realtime channel.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;
pub mod progress;
pub mod stats;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result, TranscodeError, TranscodeErrorCode};
pub use ids::*;
pub use media::*;
