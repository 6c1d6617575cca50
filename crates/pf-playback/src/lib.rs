//! # pf-playback
//!
//! Pure playback planning for the playforged server.
//!
//! - **Decision engine** ([`PlaybackDecisionEngine`]) -- classifies a media
//!   file against a device profile as direct play, remux, or transcode.
//! - **ABR ladder** ([`ladder`]) -- quality rungs derived from the source
//!   resolution, with bandwidth-based rung selection.
//! - **Probing** ([`MediaProbe`], [`FfprobeProber`]) -- the seam that supplies
//!   [`pf_core::MediaCharacteristics`].

pub mod decision;
pub mod ladder;
pub mod probe;

// ---- Re-exports for convenience ----

pub use decision::{
    decide, PlaybackDecision, PlaybackDecisionEngine, PlaybackMethod, TranscodeParams,
    COPY_CODEC, DEFAULT_QUALITY,
};
pub use ladder::{
    apply_per_title, avc_codec_string, generate_ladder, get_optimal_rung, per_title_multiplier,
    storage_requirements, BitrateLadderRung, ContentType, H264Profile, StorageEstimate,
};
pub use probe::{FfprobeProber, MediaProbe};
