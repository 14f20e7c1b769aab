//! The unit of work for one "speak this text" request.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::progress::{percent, remaining_seconds};
use super::segmenter::{segment, Chunk};
use super::voices::EngineKind;

/// Identity of a session. Results tagged with an older id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Idle,
    Speaking,
    Paused,
    Finished,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Speaking => write!(f, "SPEAKING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Snapshot delivered to progress subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub percent: u8,
    pub chars_processed: usize,
    pub total_chars: usize,
    pub elapsed_seconds: f64,
    pub remaining_seconds_estimate: f64,
    /// Live character offset (for word highlighting). Equals
    /// `chars_processed` at every chunk boundary.
    pub position: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Finished,
    Stopped,
    Failed,
}

/// What happened in a session, for logging and history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: SessionId,
    pub outcome: Outcome,
    pub initial_backend: EngineKind,
    pub final_backend: EngineKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    pub total_chars: usize,
    pub chars_processed: usize,
    pub chunks: usize,
    pub skipped_chunks: usize,
    pub remote_chunks: usize,
    pub elapsed_ms: u64,
}

pub struct PlaybackSession {
    id: SessionId,
    text: String,
    chunks: Vec<Chunk>,
    next: usize,
    cursor: usize,
    position: usize,
    total_chars: usize,
    started_at: Instant,
    speaking_time: Duration,
    speaking_since: Option<Instant>,
    lifecycle: Lifecycle,
    voice: Option<String>,
    initial_backend: EngineKind,
    backend: EngineKind,
    rate: f32,
    skipped: usize,
    audio: Vec<Bytes>,
    cancel: CancellationToken,
    resume: Arc<Notify>,
}

impl PlaybackSession {
    pub fn new(
        id: SessionId,
        text: String,
        max_chunk_chars: usize,
        backend: EngineKind,
        voice: Option<String>,
        rate: f32,
        now: Instant,
    ) -> Self {
        let chunks = segment(&text, max_chunk_chars);
        let total_chars = text.chars().count();
        Self {
            id,
            text,
            chunks,
            next: 0,
            cursor: 0,
            position: 0,
            total_chars,
            started_at: now,
            speaking_time: Duration::ZERO,
            speaking_since: Some(now),
            lifecycle: Lifecycle::Speaking,
            voice,
            initial_backend: backend,
            backend,
            rate,
            skipped: 0,
            audio: Vec::new(),
            cancel: CancellationToken::new(),
            resume: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_active(&self) -> bool {
        matches!(self.lifecycle, Lifecycle::Speaking | Lifecycle::Paused)
    }

    pub fn backend(&self) -> EngineKind {
        self.backend
    }

    pub fn voice(&self) -> Option<&str> {
        self.voice.as_deref()
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Characters processed so far (spoken or skipped).
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total_chars(&self) -> usize {
        self.total_chars
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn resume_signal(&self) -> Arc<Notify> {
        self.resume.clone()
    }

    /// Index of the chunk to speak next.
    pub fn chunk_index(&self) -> usize {
        self.next
    }

    /// The chunk to speak next, if any remain.
    pub fn current_chunk(&self) -> Option<&Chunk> {
        self.chunks.get(self.next)
    }

    /// Record progress inside the current chunk. Never moves backwards.
    pub fn set_chunk_fraction(&mut self, fraction: f64) {
        let Some(chunk) = self.chunks.get(self.next) else {
            return;
        };
        let within = (chunk.len() as f64 * fraction.clamp(0.0, 1.0)).floor() as usize;
        self.position = self.position.max(self.cursor + within).min(self.total_chars);
    }

    /// The current chunk was spoken.
    pub fn complete_chunk(&mut self, audio: Option<Bytes>) {
        if let Some(audio) = audio {
            self.audio.push(audio);
        }
        self.advance();
    }

    /// The current chunk failed; count its characters as processed.
    pub fn skip_chunk(&mut self) {
        self.skipped += 1;
        self.advance();
    }

    fn advance(&mut self) {
        if let Some(chunk) = self.chunks.get(self.next) {
            self.cursor = (self.cursor + chunk.len()).min(self.total_chars);
            self.position = self.position.max(self.cursor);
            self.next += 1;
        }
    }

    /// Switch backend and re-split the unspoken text at its chunk limit.
    pub fn demote(&mut self, backend: EngineKind, voice: Option<String>, max_chunk_chars: usize) {
        self.backend = backend;
        self.voice = voice;

        let Some(first) = self.chunks.get(self.next) else {
            return;
        };
        let start = first.start();
        let byte_start = self
            .text
            .char_indices()
            .nth(start)
            .map_or(self.text.len(), |(i, _)| i);
        let rest: Vec<Chunk> = segment(&self.text[byte_start..], max_chunk_chars)
            .into_iter()
            .map(|c| c.shifted(start))
            .collect();
        self.chunks.truncate(self.next);
        self.chunks.extend(rest);
    }

    pub fn pause(&mut self, now: Instant) {
        if let Some(since) = self.speaking_since.take() {
            self.speaking_time += now.saturating_duration_since(since);
        }
        self.lifecycle = Lifecycle::Paused;
    }

    pub fn resume(&mut self, now: Instant) {
        if self.speaking_since.is_none() {
            self.speaking_since = Some(now);
        }
        self.lifecycle = Lifecycle::Speaking;
        self.resume.notify_one();
    }

    pub fn finish(&mut self, now: Instant) {
        if let Some(since) = self.speaking_since.take() {
            self.speaking_time += now.saturating_duration_since(since);
        }
        self.cursor = self.total_chars;
        self.position = self.total_chars;
        self.next = self.chunks.len();
        self.lifecycle = Lifecycle::Finished;
    }

    /// Time actually spent speaking, excluding pauses.
    pub fn speaking_time(&self, now: Instant) -> Duration {
        let running = self
            .speaking_since
            .map_or(Duration::ZERO, |since| now.saturating_duration_since(since));
        self.speaking_time + running
    }

    pub fn progress(&self, now: Instant, assumed_chars_per_second: f64) -> ProgressReport {
        ProgressReport {
            percent: percent(self.cursor, self.total_chars),
            chars_processed: self.cursor,
            total_chars: self.total_chars,
            elapsed_seconds: now.saturating_duration_since(self.started_at).as_secs_f64(),
            remaining_seconds_estimate: remaining_seconds(
                self.cursor,
                self.position,
                self.total_chars,
                self.speaking_time(now),
                assumed_chars_per_second,
                f64::from(self.rate),
            ),
            position: self.position,
        }
    }

    /// Concatenated remote audio, once finished with at least one remote chunk.
    pub fn download(&self) -> Option<Bytes> {
        if self.lifecycle != Lifecycle::Finished || self.audio.is_empty() {
            return None;
        }
        let mut joined = Vec::with_capacity(self.audio.iter().map(Bytes::len).sum());
        for part in &self.audio {
            joined.extend_from_slice(part);
        }
        Some(Bytes::from(joined))
    }

    pub fn summary(&self, outcome: Outcome, now: Instant) -> SessionSummary {
        SessionSummary {
            session: self.id,
            outcome,
            initial_backend: self.initial_backend,
            final_backend: self.backend,
            voice: self.voice.clone(),
            total_chars: self.total_chars,
            chars_processed: self.cursor,
            chunks: self.chunks.len(),
            skipped_chunks: self.skipped,
            remote_chunks: self.audio.len(),
            elapsed_ms: u64::try_from(now.saturating_duration_since(self.started_at).as_millis())
                .unwrap_or(u64::MAX),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(text: &str, limit: usize) -> PlaybackSession {
        PlaybackSession::new(
            SessionId(1),
            text.to_string(),
            limit,
            EngineKind::Neural,
            None,
            1.0,
            Instant::now(),
        )
    }

    #[test]
    fn cursor_advances_by_chunk_length() {
        let mut s = session("Hello world. This is a test.", 12);
        assert_eq!(s.chunks().len(), 2);
        s.complete_chunk(None);
        assert_eq!(s.cursor(), 12);
        s.skip_chunk();
        assert_eq!(s.cursor(), s.total_chars());
        assert!(s.current_chunk().is_none());
    }

    #[test]
    fn chunk_fraction_never_moves_backwards() {
        let mut s = session("abcdefghij", 10);
        s.set_chunk_fraction(0.5);
        assert_eq!(s.progress(Instant::now(), 15.0).position, 5);
        s.set_chunk_fraction(0.2);
        assert_eq!(s.progress(Instant::now(), 15.0).position, 5);
        assert_eq!(s.progress(Instant::now(), 15.0).chars_processed, 0);
    }

    #[test]
    fn percent_follows_the_cursor_and_reaches_100_at_finish() {
        let mut s = session("abcdefghij", 10);
        s.set_chunk_fraction(1.0);
        let live = s.progress(Instant::now(), 15.0);
        assert_eq!(live.position, 10);
        assert_eq!(live.percent, 0);

        s.finish(Instant::now());
        assert_eq!(s.progress(Instant::now(), 15.0).percent, 100);
    }

    #[test]
    fn demotion_resegments_only_unspoken_text() {
        let text = "One. Two. Three. Four. Five.";
        let mut s = session(text, 100);
        assert_eq!(s.chunks().len(), 1);
        s.demote(EngineKind::Native, None, 6);
        let joined: String = s.chunks().iter().map(Chunk::text).collect();
        assert_eq!(joined, text);
        assert!(s.chunks().len() > 1);
        assert_eq!(s.backend(), EngineKind::Native);

        let mut s = session(text, 10);
        s.complete_chunk(None);
        let spoken = s.chunks()[0].clone();
        s.demote(EngineKind::Offline, Some("en".into()), 100);
        assert_eq!(s.chunks()[0], spoken);
        assert_eq!(s.chunks().len(), 2);
        assert_eq!(s.chunks()[1].start(), spoken.end());
        let joined: String = s.chunks().iter().map(Chunk::text).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn download_requires_finished_with_audio() {
        let mut s = session("One. Two.", 5);
        s.complete_chunk(Some(Bytes::from_static(b"ab")));
        assert!(s.download().is_none());
        s.complete_chunk(Some(Bytes::from_static(b"cd")));
        s.finish(Instant::now());
        assert_eq!(s.download().as_deref(), Some(&b"abcd"[..]));
    }
}
