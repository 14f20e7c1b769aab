//! Error types for the read-aloud engine.

use std::fmt;

use thiserror::Error;

/// Errors surfaced to the caller of the playback engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    #[error("Type or paste some text to read aloud")]
    EmptyInput,

    #[error("A session is already playing; stop it before starting another")]
    SessionActive,

    #[error("No voices available on this device, and no fallback audio configured")]
    NoVoiceAvailable,

    #[error("All speech backends failed: {0}")]
    BackendsExhausted(String),
}

/// Why a single chunk could not be spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// One chunk failed; skip it and keep going.
    Synthesis,
    /// The neural service rejected or timed out on the request.
    RemoteSynthesis,
    /// The audio element or synthesizer itself broke.
    PlaybackDevice,
    /// The chunk was abandoned because the session was stopped.
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Synthesis => write!(f, "synthesis failure"),
            Self::RemoteSynthesis => write!(f, "remote synthesis failure"),
            Self::PlaybackDevice => write!(f, "playback device failure"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Failure half of an adapter result.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {reason}")]
pub struct ChunkFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl ChunkFailure {
    pub fn synthesis(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Synthesis,
            reason: reason.into(),
        }
    }

    pub fn remote(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::RemoteSynthesis,
            reason: reason.into(),
        }
    }

    pub fn device(reason: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::PlaybackDevice,
            reason: reason.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            reason: "session stopped".into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == FailureKind::Cancelled
    }
}

/// Errors from a platform speech service (Speech Dispatcher and friends).
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("Speech service unavailable: {0}")]
    Unavailable(String),

    #[error("Speech service protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the local audio output.
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Audio output unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode audio: {0}")]
    Decode(String),
}

impl From<AudioError> for ChunkFailure {
    fn from(err: AudioError) -> Self {
        ChunkFailure::device(err.to_string())
    }
}
