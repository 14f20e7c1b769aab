//! Playback engine: the session state machine and its chunk driver.
//!
//! IDLE → SPEAKING ⇄ PAUSED → FINISHED, and back to IDLE on stop.
//!
//! Control calls (`start`, `pause`, `resume`, `stop`) are synchronous and
//! never wait on audio. A spawned driver task feeds chunks to the active
//! backend one at a time. Every result the driver applies is checked
//! against the session id it was started for, so results from a stopped or
//! replaced session are dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{AdapterResult, ChunkRequest, SpeechBackend};
use super::fallback::{FailureTracker, FallbackCoordinator, Verdict};
use super::session::{
    Lifecycle, Outcome, PlaybackSession, ProgressReport, SessionId, SessionSummary,
};
use super::voices::{EngineKind, VoiceCatalog};
use crate::error::PlaybackError;

const EVENT_CAPACITY: usize = 256;

/// Options for [`PlaybackEngine::start`].
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub voice_id: Option<String>,
    pub rate: f32,
    pub engine: Option<EngineKind>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            voice_id: None,
            rate: 1.0,
            engine: None,
        }
    }
}

/// Notifications for subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Lifecycle {
        session: SessionId,
        state: Lifecycle,
    },
    Progress {
        session: SessionId,
        progress: ProgressReport,
    },
    Warning {
        session: SessionId,
        message: String,
    },
    Demoted {
        session: SessionId,
        from: EngineKind,
        to: EngineKind,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        session: Option<SessionId>,
        message: String,
    },
    Ended {
        summary: SessionSummary,
    },
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: Lifecycle,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<EngineKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<ProgressReport>,
    pub download_ready: bool,
}

#[derive(Default)]
struct Inner {
    session: Option<PlaybackSession>,
    backend: Option<Arc<dyn SpeechBackend>>,
}

struct Shared {
    coordinator: FallbackCoordinator,
    catalog: Option<Arc<VoiceCatalog>>,
    assumed_chars_per_second: f64,
    inner: Mutex<Inner>,
    events: broadcast::Sender<EngineEvent>,
    next_id: AtomicU64,
}

/// Handle to the engine. Cheap to clone.
#[derive(Clone)]
pub struct PlaybackEngine {
    shared: Arc<Shared>,
}

enum Step {
    Wait(Arc<Notify>),
    Speak {
        backend: Arc<dyn SpeechBackend>,
        text: String,
        voice: Option<String>,
        rate: f32,
    },
    Finish,
}

impl PlaybackEngine {
    pub fn new(
        coordinator: FallbackCoordinator,
        catalog: Option<Arc<VoiceCatalog>>,
        assumed_chars_per_second: f64,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                coordinator,
                catalog,
                assumed_chars_per_second,
                inner: Mutex::new(Inner::default()),
                events,
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn coordinator(&self) -> &FallbackCoordinator {
        &self.shared.coordinator
    }

    /// Begin reading `text` aloud. Must be called within a tokio runtime.
    pub fn start(&self, text: &str, options: StartOptions) -> Result<SessionId, PlaybackError> {
        match self.try_start(text, options) {
            Ok(id) => Ok(id),
            Err(e) => {
                warn!("Start rejected: {e}");
                self.shared.emit(EngineEvent::Error {
                    session: None,
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn try_start(&self, text: &str, options: StartOptions) -> Result<SessionId, PlaybackError> {
        if text.trim().is_empty() {
            return Err(PlaybackError::EmptyInput);
        }

        let shared = &self.shared;
        let mut inner = shared.lock();
        if inner.session.as_ref().is_some_and(PlaybackSession::is_active) {
            return Err(PlaybackError::SessionActive);
        }

        let requested = options.voice_id.as_deref();
        let hint = options.engine.or_else(|| shared.engine_of(requested?));
        let backend = shared.coordinator.select(hint)?;
        let voice = shared.voice_for(requested, backend.as_ref());
        let rate = if options.rate.is_finite() && options.rate > 0.0 {
            options.rate
        } else {
            1.0
        };

        let id = SessionId(shared.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let session = PlaybackSession::new(
            id,
            text.to_string(),
            backend.max_chunk_chars(),
            backend.kind(),
            voice,
            rate,
            Instant::now(),
        );
        let cancel = session.cancel_token();
        info!(
            "State: IDLE → SPEAKING ({id}, {} chars in {} chunks on {})",
            session.total_chars(),
            session.chunks().len(),
            backend.kind()
        );
        let progress = session.progress(Instant::now(), shared.assumed_chars_per_second);
        inner.session = Some(session);
        inner.backend = Some(backend);
        drop(inner);

        shared.emit(EngineEvent::Lifecycle {
            session: id,
            state: Lifecycle::Speaking,
        });
        shared.emit(EngineEvent::Progress { session: id, progress });

        tokio::spawn(drive(self.shared.clone(), id, cancel));
        Ok(id)
    }

    /// Speaking → Paused. Returns false when there was nothing to pause.
    pub fn pause(&self) -> bool {
        let mut inner = self.shared.lock();
        let Inner { session, backend } = &mut *inner;
        let Some(session) = session.as_mut().filter(|s| s.lifecycle() == Lifecycle::Speaking) else {
            return false;
        };
        session.pause(Instant::now());
        if let Some(backend) = backend {
            backend.pause();
        }
        info!("State: SPEAKING → PAUSED ({})", session.id());
        self.shared.emit(EngineEvent::Lifecycle {
            session: session.id(),
            state: Lifecycle::Paused,
        });
        true
    }

    /// Paused → Speaking. Returns false when nothing was paused.
    pub fn resume(&self) -> bool {
        let mut inner = self.shared.lock();
        let Inner { session, backend } = &mut *inner;
        let Some(session) = session.as_mut().filter(|s| s.lifecycle() == Lifecycle::Paused) else {
            return false;
        };
        if let Some(backend) = backend {
            backend.resume();
        }
        session.resume(Instant::now());
        info!("State: PAUSED → SPEAKING ({})", session.id());
        self.shared.emit(EngineEvent::Lifecycle {
            session: session.id(),
            state: Lifecycle::Speaking,
        });
        true
    }

    /// Any state → Idle. Returns false when already idle.
    pub fn stop(&self) -> bool {
        let mut inner = self.shared.lock();
        let Some(session) = inner.session.take() else {
            return false;
        };
        let backend = inner.backend.take();
        drop(inner);

        let id = session.id();
        let from = session.lifecycle();
        if session.is_active() {
            session.cancel_token().cancel();
            if let Some(backend) = backend {
                backend.stop();
            }
            self.shared.emit(EngineEvent::Ended {
                summary: session.summary(Outcome::Stopped, Instant::now()),
            });
        }
        info!("State: {from} → IDLE ({id})");
        self.shared.emit(EngineEvent::Lifecycle {
            session: id,
            state: Lifecycle::Idle,
        });
        true
    }

    pub fn status(&self) -> EngineStatus {
        let inner = self.shared.lock();
        match &inner.session {
            Some(session) => EngineStatus {
                state: session.lifecycle(),
                session: Some(session.id()),
                backend: Some(session.backend()),
                voice: session.voice().map(String::from),
                progress: Some(session.progress(Instant::now(), self.shared.assumed_chars_per_second)),
                download_ready: session.lifecycle() == Lifecycle::Finished
                    && session.download().is_some(),
            },
            None => EngineStatus {
                state: Lifecycle::Idle,
                session: None,
                backend: None,
                voice: None,
                progress: None,
                download_ready: false,
            },
        }
    }

    /// Remote audio of the last finished session.
    pub fn download(&self) -> Option<Bytes> {
        self.shared.lock().session.as_ref().and_then(PlaybackSession::download)
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn engine_of(&self, voice_id: &str) -> Option<EngineKind> {
        self.catalog.as_ref()?.find(voice_id).map(|v| v.engine)
    }

    /// The requested voice if it belongs to `backend`, else its default.
    fn voice_for(&self, requested: Option<&str>, backend: &dyn SpeechBackend) -> Option<String> {
        let Some(voice_id) = requested else {
            return backend.default_voice();
        };
        match self.engine_of(voice_id) {
            Some(engine) if engine == backend.kind() => Some(voice_id.to_string()),
            None if self.catalog.is_none() => Some(voice_id.to_string()),
            _ => {
                debug!("Voice {voice_id} is not a {} voice, using default", backend.kind());
                backend.default_voice()
            }
        }
    }

    fn next_step(&self, id: SessionId) -> Option<Step> {
        let inner = self.lock();
        let session = inner.session.as_ref().filter(|s| s.id() == id)?;
        match session.lifecycle() {
            Lifecycle::Paused => Some(Step::Wait(session.resume_signal())),
            Lifecycle::Speaking => match session.current_chunk() {
                Some(chunk) => Some(Step::Speak {
                    backend: inner.backend.clone()?,
                    text: chunk.text().to_string(),
                    voice: session.voice().map(String::from),
                    rate: session.rate(),
                }),
                None => Some(Step::Finish),
            },
            Lifecycle::Idle | Lifecycle::Finished => None,
        }
    }

    /// Resume signal to wait on while session `id` is paused.
    fn paused(&self, id: SessionId) -> Option<Arc<Notify>> {
        let inner = self.lock();
        let session = inner.session.as_ref().filter(|s| s.id() == id)?;
        (session.lifecycle() == Lifecycle::Paused).then(|| session.resume_signal())
    }

    /// Count a whitespace-only chunk as spoken without a backend round trip.
    fn pass_blank(&self, id: SessionId) {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut().filter(|s| s.id() == id && s.lifecycle() == Lifecycle::Speaking) else {
            return;
        };
        session.complete_chunk(None);
        let progress = session.progress(Instant::now(), self.assumed_chars_per_second);
        self.emit(EngineEvent::Progress { session: id, progress });
    }

    fn on_tick(&self, id: SessionId, fraction: f64) {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut().filter(|s| s.id() == id) else {
            return;
        };
        if session.lifecycle() != Lifecycle::Speaking {
            return;
        }
        session.set_chunk_fraction(fraction);
        let progress = session.progress(Instant::now(), self.assumed_chars_per_second);
        self.emit(EngineEvent::Progress { session: id, progress });
    }

    /// Apply one chunk result. Returns false when the driver should exit.
    fn apply_result(&self, id: SessionId, result: AdapterResult, tracker: &mut FailureTracker) -> bool {
        let mut inner = self.lock();
        let Inner { session: slot, backend } = &mut *inner;
        let Some(session) = slot.as_mut().filter(|s| s.id() == id && s.is_active()) else {
            debug!("Dropping result for stale session {id}");
            return false;
        };
        let index = session.chunk_index() + 1;
        let total = session.chunks().len();

        match result {
            Ok(spoken) => {
                tracker.record_success();
                debug!("Chunk {index}/{total} spoken in {:?}", spoken.elapsed);
                session.complete_chunk(spoken.audio);
            }
            Err(failure) if failure.is_cancelled() => return false,
            Err(failure) => {
                let from = session.backend();
                let verdict = tracker.record_failure(from, &failure);
                warn!("Chunk {index}/{total} failed on {from}: {failure}");
                session.skip_chunk();
                self.emit(EngineEvent::Warning {
                    session: id,
                    message: format!("Skipped part {index} of {total}: {}", failure.reason),
                });

                if verdict == Verdict::Demote {
                    match self.coordinator.demotion_target(from) {
                        Some(next) => {
                            self.coordinator.on_demoted(from);
                            let voice = self.voice_for(session.voice(), next.as_ref());
                            session.demote(next.kind(), voice, next.max_chunk_chars());
                            warn!("Demoted {id} from {from} to {}", next.kind());
                            self.emit(EngineEvent::Demoted {
                                session: id,
                                from,
                                to: next.kind(),
                            });
                            *backend = Some(next);
                        }
                        None => {
                            self.coordinator.on_demoted(from);
                            let error = PlaybackError::BackendsExhausted(failure.reason.clone());
                            warn!("{error}");
                            let summary = session.summary(Outcome::Failed, Instant::now());
                            *slot = None;
                            *backend = None;
                            info!("State: SPEAKING → IDLE ({id})");
                            self.emit(EngineEvent::Error {
                                session: Some(id),
                                message: error.to_string(),
                            });
                            self.emit(EngineEvent::Lifecycle {
                                session: id,
                                state: Lifecycle::Idle,
                            });
                            self.emit(EngineEvent::Ended { summary });
                            return false;
                        }
                    }
                }
            }
        }

        let progress = session.progress(Instant::now(), self.assumed_chars_per_second);
        self.emit(EngineEvent::Progress { session: id, progress });
        true
    }

    fn finish(&self, id: SessionId) {
        let mut inner = self.lock();
        let Some(session) = inner.session.as_mut().filter(|s| s.id() == id) else {
            return;
        };
        let now = Instant::now();
        session.finish(now);
        let progress = session.progress(now, self.assumed_chars_per_second);
        let summary = session.summary(Outcome::Finished, now);
        inner.backend = None;
        info!("State: SPEAKING → FINISHED ({id}, {}ms)", summary.elapsed_ms);
        self.emit(EngineEvent::Progress { session: id, progress });
        self.emit(EngineEvent::Lifecycle {
            session: id,
            state: Lifecycle::Finished,
        });
        self.emit(EngineEvent::Ended { summary });
    }
}

/// Feed the session's chunks to its backend until done, stopped, or replaced.
async fn drive(shared: Arc<Shared>, id: SessionId, cancel: CancellationToken) {
    let mut tracker = shared.coordinator.tracker();

    while let Some(step) = shared.next_step(id) {
        match step {
            Step::Wait(resume) => {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = resume.notified() => {}
                }
            }
            Step::Speak {
                backend,
                text,
                voice,
                rate,
            } => {
                if text.trim().is_empty() {
                    debug!("Chunk of {} whitespace chars needs no speech", text.len());
                    shared.pass_blank(id);
                    continue;
                }

                let (progress_tx, mut progress_rx) = watch::channel(0.0);
                let request = ChunkRequest {
                    text: &text,
                    voice: voice.as_deref(),
                    rate,
                };
                let speak = backend.speak(request, &progress_tx, &cancel);
                tokio::pin!(speak);

                let result = loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return,
                        result = &mut speak => break result,
                        Ok(()) = progress_rx.changed() => {
                            let fraction = *progress_rx.borrow_and_update();
                            shared.on_tick(id, fraction);
                        }
                    }
                };

                // A chunk that ends while paused only counts once resumed.
                while let Some(resume) = shared.paused(id) {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = resume.notified() => {}
                    }
                }
                if !shared.apply_result(id, result, &mut tracker) {
                    return;
                }
            }
            Step::Finish => {
                shared.finish(id);
                return;
            }
        }
    }
}
