//! Speech backends: native system voices, the remote neural service, and
//! the offline synthesizer. The engine and the fallback coordinator only
//! ever see [`SpeechBackend`].

pub mod native;
pub mod offline;
pub mod remote;
#[cfg(unix)]
pub mod speechd;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::voices::EngineKind;
use crate::error::ChunkFailure;

/// One chunk to speak.
#[derive(Debug, Clone)]
pub struct ChunkRequest<'a> {
    pub text: &'a str,
    pub voice: Option<&'a str>,
    pub rate: f32,
}

/// A chunk that was spoken to the end.
#[derive(Debug, Clone, Default)]
pub struct ChunkSpoken {
    pub elapsed: Duration,
    /// Encoded audio, when the backend produced a downloadable file.
    pub audio: Option<Bytes>,
}

pub type AdapterResult = Result<ChunkSpoken, ChunkFailure>;

/// Fractional position within the current chunk, 0.0–1.0.
pub type ProgressTx = watch::Sender<f64>;

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Largest chunk this backend accepts, in characters.
    fn max_chunk_chars(&self) -> usize;

    /// Whether this backend can be chosen for a new session.
    fn is_available(&self) -> bool;

    /// Voice used when the caller did not pick one for this engine.
    fn default_voice(&self) -> Option<String> {
        None
    }

    /// Speak one chunk. Resolves when the audio has finished, failed, or
    /// `cancel` fires. Sends progress ticks while audio is playing.
    async fn speak(
        &self,
        request: ChunkRequest<'_>,
        progress: &ProgressTx,
        cancel: &CancellationToken,
    ) -> AdapterResult;

    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}
