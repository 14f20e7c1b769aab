//! Integration tests for the playback engine state machine.
//!
//! Backends are scripted fakes; time is paused so chunk "audio" is instant.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use readaloud::error::{ChunkFailure, PlaybackError};
use readaloud::narrator::backend::{AdapterResult, ChunkRequest, ChunkSpoken, ProgressTx, SpeechBackend};
use readaloud::narrator::fallback::{AvailabilityProbe, Backends, FallbackCoordinator, HealthCheck};
use readaloud::narrator::{
    EngineEvent, EngineKind, Lifecycle, Outcome, PlaybackEngine, SessionSummary, StartOptions,
};

const TEXT: &str = "First sentence here. Second one is here. Third one now. Last sentence!";

#[derive(Debug, Clone, Copy)]
enum Step {
    Speak,
    RemoteFail,
    DeviceFail,
}

struct Scripted {
    kind: EngineKind,
    max_chars: usize,
    chunk_time: Duration,
    honor_cancel: bool,
    script: Mutex<VecDeque<Step>>,
    spoken: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(kind: EngineKind, max_chars: usize) -> Arc<Self> {
        Self::with_script(kind, max_chars, &[])
    }

    fn with_script(kind: EngineKind, max_chars: usize, script: &[Step]) -> Arc<Self> {
        Arc::new(Self {
            kind,
            max_chars,
            chunk_time: Duration::from_secs(2),
            honor_cancel: true,
            script: Mutex::new(script.iter().copied().collect()),
            spoken: Mutex::new(Vec::new()),
        })
    }

    fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechBackend for Scripted {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn max_chunk_chars(&self) -> usize {
        self.max_chars
    }

    fn is_available(&self) -> bool {
        true
    }

    async fn speak(
        &self,
        request: ChunkRequest<'_>,
        progress: &ProgressTx,
        cancel: &CancellationToken,
    ) -> AdapterResult {
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Speak);
        match step {
            Step::RemoteFail => return Err(ChunkFailure::remote("HTTP 500")),
            Step::DeviceFail => return Err(ChunkFailure::device("output device gone")),
            Step::Speak => {}
        }

        let half = self.chunk_time / 2;
        let play = async {
            tokio::time::sleep(half).await;
            let _ = progress.send(0.5);
            tokio::time::sleep(half).await;
        };
        if self.honor_cancel {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ChunkFailure::cancelled()),
                _ = play => {}
            }
        } else {
            play.await;
        }

        self.spoken.lock().unwrap().push(request.text.to_string());
        let _ = progress.send(1.0);
        Ok(ChunkSpoken {
            elapsed: self.chunk_time,
            audio: (self.kind == EngineKind::Neural).then(|| Bytes::from(request.text.to_string())),
        })
    }

    fn pause(&self) {}
    fn resume(&self) {}
    fn stop(&self) {}
}

struct AlwaysUp;

#[async_trait]
impl HealthCheck for AlwaysUp {
    async fn check(&self, _timeout: Duration) -> bool {
        true
    }
}

async fn reachable_probe() -> Arc<AvailabilityProbe> {
    let probe = Arc::new(AvailabilityProbe::new(
        Arc::new(AlwaysUp),
        vec![Duration::from_millis(100)],
        Duration::from_secs(300),
    ));
    assert!(probe.probe().await);
    probe
}

fn engine(backends: Backends, probe: Option<Arc<AvailabilityProbe>>) -> PlaybackEngine {
    let coordinator = FallbackCoordinator::new(backends, probe, 2);
    PlaybackEngine::new(coordinator, None, 14.0)
}

fn native_only(backend: &Arc<Scripted>) -> Backends {
    Backends {
        native: Some(backend.clone()),
        ..Backends::default()
    }
}

/// Collect events until the session ends.
async fn until_ended(rx: &mut broadcast::Receiver<EngineEvent>) -> (Vec<EngineEvent>, SessionSummary) {
    let mut seen = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(600), rx.recv())
            .await
            .expect("session did not end")
            .expect("event channel closed");
        if let EngineEvent::Ended { summary } = &event {
            let summary = summary.clone();
            seen.push(event);
            return (seen, summary);
        }
        seen.push(event);
    }
}

fn last_percent(events: &[EngineEvent]) -> Option<u8> {
    events.iter().rev().find_map(|e| match e {
        EngineEvent::Progress { progress, .. } => Some(progress.percent),
        _ => None,
    })
}

#[tokio::test(start_paused = true)]
async fn session_reads_every_chunk_and_finishes_at_full_progress() {
    let native = Scripted::new(EngineKind::Native, 25);
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    let id = engine.start(TEXT, StartOptions::default()).unwrap();
    assert_eq!(engine.status().state, Lifecycle::Speaking);

    let (events, summary) = until_ended(&mut rx).await;
    assert_eq!(summary.session, id);
    assert_eq!(summary.outcome, Outcome::Finished);
    assert_eq!(summary.chars_processed, TEXT.chars().count());
    assert_eq!(summary.chunks, 4);
    assert_eq!(summary.skipped_chunks, 0);
    assert_eq!(last_percent(&events), Some(100));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Lifecycle { state: Lifecycle::Finished, .. }
    )));

    assert_eq!(native.spoken().concat(), TEXT);
    let status = engine.status();
    assert_eq!(status.state, Lifecycle::Finished);
    assert!(!status.download_ready);
}

#[tokio::test(start_paused = true)]
async fn progress_never_goes_backwards() {
    let native = Scripted::new(EngineKind::Native, 25);
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    engine.start(TEXT, StartOptions::default()).unwrap();
    let (events, _) = until_ended(&mut rx).await;

    let positions: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Progress { progress, .. } => Some(progress.position),
            _ => None,
        })
        .collect();
    assert!(positions.len() > 4);
    assert!(positions.windows(2).all(|w| w[0] <= w[1]));
}

#[tokio::test(start_paused = true)]
async fn finished_neural_session_offers_its_audio() {
    let remote = Scripted::new(EngineKind::Neural, 25);
    let backends = Backends {
        remote: Some(remote.clone()),
        native: Some(Scripted::new(EngineKind::Native, 25)),
        ..Backends::default()
    };
    let engine = engine(backends, Some(reachable_probe().await));
    let mut rx = engine.subscribe();

    engine.start(TEXT, StartOptions::default()).unwrap();
    assert!(engine.download().is_none());
    let (_, summary) = until_ended(&mut rx).await;

    assert_eq!(summary.initial_backend, EngineKind::Neural);
    assert_eq!(summary.remote_chunks, 4);
    assert!(engine.status().download_ready);
    assert_eq!(engine.download().unwrap(), Bytes::from(TEXT));
}

#[tokio::test(start_paused = true)]
async fn stop_discards_results_that_arrive_late() {
    let native = Arc::new(Scripted {
        kind: EngineKind::Native,
        max_chars: 25,
        chunk_time: Duration::from_secs(10),
        honor_cancel: false,
        script: Mutex::new(VecDeque::new()),
        spoken: Mutex::new(Vec::new()),
    });
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    let id = engine.start(TEXT, StartOptions::default()).unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(engine.stop());
    assert!(!engine.stop());

    let (_, summary) = until_ended(&mut rx).await;
    assert_eq!(summary.session, id);
    assert_eq!(summary.outcome, Outcome::Stopped);
    assert_eq!(summary.chars_processed, 0);

    let idle = rx.recv().await.unwrap();
    assert!(matches!(idle, EngineEvent::Lifecycle { state: Lifecycle::Idle, .. }));

    // Let the fake finish its chunk; nothing may be applied.
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(matches!(rx.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
    assert_eq!(engine.status().state, Lifecycle::Idle);
}

#[tokio::test(start_paused = true)]
async fn pause_keeps_the_cursor_until_resume() {
    let native = Scripted::new(EngineKind::Native, 25);
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    engine.start(TEXT, StartOptions::default()).unwrap();
    assert!(!engine.resume());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(engine.pause());
    assert!(!engine.pause());
    assert_eq!(engine.status().state, Lifecycle::Paused);
    let paused_at = engine.status().progress.unwrap().chars_processed;
    assert_eq!(paused_at, 0);

    // The fake ignores pause, so its chunk ends while paused. It must not
    // count, and nothing further is spoken.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(native.spoken().len(), 1);
    assert_eq!(engine.status().state, Lifecycle::Paused);
    assert_eq!(engine.status().progress.unwrap().chars_processed, paused_at);

    assert!(engine.resume());
    let (events, summary) = until_ended(&mut rx).await;
    assert_eq!(summary.outcome, Outcome::Finished);
    assert_eq!(native.spoken().len(), 4);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Lifecycle { state: Lifecycle::Paused, .. }
    )));
    assert!(summary.elapsed_ms >= 20_000);
}

#[tokio::test(start_paused = true)]
async fn whitespace_only_chunks_are_not_sent_to_the_backend() {
    let native = Scripted::new(EngineKind::Native, 12);
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    engine.start("Hello world.\n", StartOptions::default()).unwrap();
    let (events, summary) = until_ended(&mut rx).await;

    assert_eq!(native.spoken(), vec!["Hello world.".to_string()]);
    assert_eq!(summary.outcome, Outcome::Finished);
    assert_eq!(summary.skipped_chunks, 0);
    assert_eq!(summary.chars_processed, summary.total_chars);
    assert!(!events.iter().any(|e| matches!(e, EngineEvent::Warning { .. })));
    assert_eq!(last_percent(&events), Some(100));
}

#[tokio::test(start_paused = true)]
async fn two_remote_failures_demote_to_native() {
    let remote = Scripted::with_script(
        EngineKind::Neural,
        25,
        &[Step::RemoteFail, Step::RemoteFail],
    );
    let native = Scripted::new(EngineKind::Native, 100);
    let probe = reachable_probe().await;
    let backends = Backends {
        remote: Some(remote.clone()),
        native: Some(native.clone()),
        ..Backends::default()
    };
    let engine = engine(backends, Some(probe.clone()));
    let mut rx = engine.subscribe();

    engine.start(TEXT, StartOptions::default()).unwrap();
    let (events, summary) = until_ended(&mut rx).await;

    let warnings = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::Warning { .. }))
        .count();
    assert_eq!(warnings, 2);
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::Demoted { from: EngineKind::Neural, to: EngineKind::Native, .. }
    )));

    assert_eq!(summary.outcome, Outcome::Finished);
    assert_eq!(summary.initial_backend, EngineKind::Neural);
    assert_eq!(summary.final_backend, EngineKind::Native);
    assert_eq!(summary.skipped_chunks, 2);
    assert_eq!(summary.chars_processed, TEXT.chars().count());

    // The rest of the text is re-split for the native limit: one chunk.
    assert!(remote.spoken().is_empty());
    assert_eq!(native.spoken(), vec![" Third one now. Last sentence!".to_string()]);
    assert!(!probe.is_reachable());
}

#[tokio::test(start_paused = true)]
async fn device_failure_with_nowhere_to_go_fails_the_session() {
    let native = Scripted::with_script(EngineKind::Native, 25, &[Step::Speak, Step::DeviceFail]);
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    engine.start(TEXT, StartOptions::default()).unwrap();
    let (events, summary) = until_ended(&mut rx).await;

    assert_eq!(summary.outcome, Outcome::Failed);
    assert_eq!(summary.skipped_chunks, 1);
    assert!(events.iter().any(|e| matches!(e, EngineEvent::Error { session: Some(_), .. })));
    assert_eq!(engine.status().state, Lifecycle::Idle);

    // The engine is usable again.
    assert!(engine.start("Again.", StartOptions::default()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn second_start_is_rejected_while_a_session_is_active() {
    let native = Scripted::new(EngineKind::Native, 25);
    let engine = engine(native_only(&native), None);

    let first = engine.start(TEXT, StartOptions::default()).unwrap();
    assert_eq!(
        engine.start("Another text.", StartOptions::default()),
        Err(PlaybackError::SessionActive)
    );

    engine.pause();
    assert_eq!(
        engine.start("Another text.", StartOptions::default()),
        Err(PlaybackError::SessionActive)
    );

    engine.stop();
    let second = engine.start("Another text.", StartOptions::default()).unwrap();
    assert!(second.0 > first.0);
}

#[tokio::test(start_paused = true)]
async fn empty_text_is_rejected_with_an_error_event() {
    let native = Scripted::new(EngineKind::Native, 25);
    let engine = engine(native_only(&native), None);
    let mut rx = engine.subscribe();

    assert_eq!(
        engine.start("  \n\t ", StartOptions::default()),
        Err(PlaybackError::EmptyInput)
    );
    assert!(matches!(
        rx.recv().await.unwrap(),
        EngineEvent::Error { session: None, .. }
    ));
    assert_eq!(engine.status().state, Lifecycle::Idle);
}

#[tokio::test(start_paused = true)]
async fn no_backend_means_no_voice() {
    let engine = engine(Backends::default(), None);
    assert_eq!(
        engine.start(TEXT, StartOptions::default()),
        Err(PlaybackError::NoVoiceAvailable)
    );
}

#[tokio::test(start_paused = true)]
async fn engine_hint_picks_a_lower_backend() {
    let remote = Scripted::new(EngineKind::Neural, 25);
    let offline = Scripted::new(EngineKind::Offline, 25);
    let backends = Backends {
        remote: Some(remote.clone()),
        offline: Some(offline.clone()),
        ..Backends::default()
    };
    let engine = engine(backends, Some(reachable_probe().await));
    let mut rx = engine.subscribe();

    let options = StartOptions {
        engine: Some(EngineKind::Offline),
        ..StartOptions::default()
    };
    engine.start(TEXT, options).unwrap();
    let (_, summary) = until_ended(&mut rx).await;

    assert_eq!(summary.final_backend, EngineKind::Offline);
    assert!(remote.spoken().is_empty());
    assert_eq!(offline.spoken().len(), 4);
}
