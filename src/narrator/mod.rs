//! Read-aloud narration: segmenting text, choosing voices and backends,
//! and driving playback sessions.

pub mod api;
pub mod audio;
pub mod backend;
pub mod engine;
pub mod fallback;
pub mod history;
pub mod progress;
pub mod segmenter;
pub mod session;
pub mod voices;

pub use engine::{EngineEvent, EngineStatus, PlaybackEngine, StartOptions};
pub use session::{Lifecycle, Outcome, ProgressReport, SessionId, SessionSummary};
pub use voices::{EngineKind, Voice, VoiceCatalog};
