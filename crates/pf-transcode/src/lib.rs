//! # pf-transcode
//!
//! Transcode orchestration for the playforged server.
//!
//! - **Providers** ([`TranscodingProvider`], [`ProviderRegistry`]) -- pluggable
//!   encoder backends and capability-based selection. [`FfmpegProvider`] is
//!   the bundled implementation.
//! - **Admission** ([`ResourceManager`]) -- concurrency cap, bounded wait
//!   queue and session timeouts.
//! - **Processes** ([`ProcessSupervisor`]) -- encoder PID tracking, process
//!   group termination with SIGTERM→SIGKILL escalation, orphan sweeps.
//! - **Retention** ([`RetentionSweeper`]) -- expiry of finished sessions,
//!   orphaned output directories and the output size cap.
//! - **Service** ([`TranscodeService`]) -- the facade callers use.

pub mod ffmpeg;
pub mod hardware;
pub mod output;
pub mod process;
pub mod provider;
pub mod registry;
pub mod resource;
pub mod retention;
pub mod service;
pub mod store;
pub mod types;

// ---- Re-exports for convenience ----

pub use ffmpeg::FfmpegProvider;
pub use hardware::{HardwareSupport, HwAccel};
pub use output::{OutputLayout, Published};
pub use process::{CleanupReport, ProcessInfo, ProcessSupervisor};
pub use provider::TranscodingProvider;
pub use registry::{ProviderRegistry, ProviderSummary, RegisteredProvider};
pub use resource::{
    start_fn, Eviction, EvictionReason, ResourceLimits, ResourceManager, ResourceUsage,
    SessionResource, StartFn,
};
pub use retention::{RetentionPolicy, RetentionReport, RetentionSweeper};
pub use service::{request_for_params, ServiceComponents, TranscodeService};
pub use store::{MemorySessionStore, SessionRecord, SessionStore, SessionUpdate};
pub use types::{
    ContainerFormat, ProviderCapabilities, ProviderInfo, StreamHandle, TranscodeHandle,
    TranscodeRequest, TranscodeResult, TranscodeStatus, TranscodingProgress,
};
