//! playforged - transcoding orchestration and playback decisions
//!
//! This library crate wires the pf-* crates into a runnable [`app::App`] and
//! re-exports them for integration testing.

pub mod app;

pub use pf_core as core;
pub use pf_playback as playback;
pub use pf_transcode as transcode;
