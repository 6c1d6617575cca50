//! The encoder plugin boundary.

use async_trait::async_trait;

use pf_core::{Error, Result, SessionId};

use crate::types::{
    ProviderCapabilities, ProviderInfo, StreamHandle, TranscodeHandle, TranscodeRequest,
    TranscodingProgress,
};

/// An encoding backend.
///
/// Providers are black boxes that advertise what they can produce through
/// [`capabilities`](Self::capabilities). They may run in-process or front a
/// remote service. Any OS processes they spawn should be registered with the
/// [`ProcessSupervisor`](crate::process::ProcessSupervisor) so they can be
/// reaped if the provider loses track of them.
#[async_trait]
pub trait TranscodingProvider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    fn capabilities(&self) -> ProviderCapabilities;

    /// Begin encoding. The request always carries a session ID by the time
    /// a provider sees it.
    async fn start_transcode(&self, request: &TranscodeRequest) -> Result<TranscodeHandle>;

    async fn progress(&self, session_id: SessionId) -> Result<TranscodingProgress>;

    async fn stop_transcode(&self, session_id: SessionId) -> Result<()>;

    async fn start_stream(&self, request: &TranscodeRequest) -> Result<StreamHandle> {
        let _ = request;
        Err(Error::Unsupported(format!("{} does not support streaming", self.info().id)))
    }

    async fn get_stream(&self, stream_id: &str) -> Result<StreamHandle> {
        let _ = stream_id;
        Err(Error::Unsupported(format!("{} does not support streaming", self.info().id)))
    }

    async fn stop_stream(&self, stream_id: &str) -> Result<()> {
        let _ = stream_id;
        Err(Error::Unsupported(format!("{} does not support streaming", self.info().id)))
    }
}
