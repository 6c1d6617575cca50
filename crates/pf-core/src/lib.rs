//! pf-core: shared types, IDs, errors, configuration, events and task
//! supervision for the playforged transcoding core.
//!
//! Every other pf-* crate depends on this one for its error type, the
//! media and device vocabulary, the JSON configuration, the broadcast event
//! bus and the panic-safe background task helpers.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod media;
pub mod report;
pub mod task;
pub mod tools;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, ErrorKind, Result};
pub use ids::*;
pub use media::*;
