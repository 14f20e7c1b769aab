//! Native system voices.
//!
//! The platform speech service sits behind [`SpeechPlatform`]; on Linux that
//! is Speech Dispatcher (see `speechd`). Word boundary events arrive only
//! occasionally, so the adapter extrapolates progress between them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AdapterResult, ChunkRequest, ChunkSpoken, ProgressTx, SpeechBackend};
use crate::error::{ChunkFailure, PlatformError};
use crate::narrator::progress::ProgressEstimator;
use crate::narrator::voices::{EngineKind, Voice};

/// Events for one utterance.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
    /// Character offset within the utterance now being spoken.
    Boundary { char_index: usize },
    End,
    /// The utterance failed; later ones may still work.
    Error(String),
    /// The synthesizer itself is broken.
    DeviceError(String),
}

pub type UtteranceEvents = mpsc::UnboundedReceiver<PlatformEvent>;

#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub voice: Option<String>,
    pub rate: f32,
}

/// A platform speech service.
#[async_trait]
pub trait SpeechPlatform: Send + Sync {
    fn name(&self) -> &str;

    /// Voices enumerated so far. May be empty until the service warms up.
    fn voices(&self) -> Vec<Voice>;

    /// Resolves the next time the voice list changes.
    async fn voices_changed(&self);

    /// Nudge a service that only enumerates voices after first use.
    async fn prime(&self);

    /// Queue an utterance. Events stream until `End`, an error, or cancel.
    async fn utter(&self, utterance: Utterance) -> Result<UtteranceEvents, PlatformError>;

    fn pause(&self);
    fn resume(&self);
    fn cancel(&self);
}

pub struct NativeSpeechAdapter {
    platform: Arc<dyn SpeechPlatform>,
    chars_per_second: f64,
    max_chunk_chars: usize,
    tick: Duration,
    paused: watch::Sender<bool>,
}

impl NativeSpeechAdapter {
    pub fn new(
        platform: Arc<dyn SpeechPlatform>,
        chars_per_second: f64,
        max_chunk_chars: usize,
        tick: Duration,
    ) -> Self {
        Self {
            platform,
            chars_per_second,
            max_chunk_chars,
            tick,
            paused: watch::Sender::new(false),
        }
    }
}

#[async_trait]
impl SpeechBackend for NativeSpeechAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Native
    }

    fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    fn is_available(&self) -> bool {
        !self.platform.voices().is_empty()
    }

    async fn speak(
        &self,
        request: ChunkRequest<'_>,
        progress: &ProgressTx,
        cancel: &CancellationToken,
    ) -> AdapterResult {
        let started = Instant::now();
        let utterance = Utterance {
            text: request.text.to_string(),
            voice: request.voice.map(String::from),
            rate: request.rate,
        };

        let mut events = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChunkFailure::cancelled()),
            queued = self.platform.utter(utterance) => {
                queued.map_err(|e| ChunkFailure::device(e.to_string()))?
            }
        };

        let chunk_chars = request.text.chars().count();
        let cps = self.chars_per_second * f64::from(request.rate.max(0.1));
        let mut estimator = ProgressEstimator::new(chunk_chars, cps, started);

        let mut paused_rx = self.paused.subscribe();
        if *paused_rx.borrow_and_update() {
            estimator.pause(started);
        }

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.platform.cancel();
                    return Err(ChunkFailure::cancelled());
                }
                event = events.recv() => match event {
                    Some(PlatformEvent::Boundary { char_index }) => {
                        let now = Instant::now();
                        estimator.correct(char_index, now);
                        let _ = progress.send(estimator.fraction(now));
                    }
                    Some(PlatformEvent::End) => {
                        let _ = progress.send(1.0);
                        let elapsed = started.elapsed();
                        debug!("{} spoke {chunk_chars} chars in {elapsed:?}", self.platform.name());
                        return Ok(ChunkSpoken { elapsed, audio: None });
                    }
                    Some(PlatformEvent::Error(reason)) => {
                        return Err(ChunkFailure::synthesis(reason));
                    }
                    Some(PlatformEvent::DeviceError(reason)) => {
                        return Err(ChunkFailure::device(reason));
                    }
                    None => {
                        warn!("{} dropped the utterance without an end event", self.platform.name());
                        return Err(ChunkFailure::device("speech service closed the utterance"));
                    }
                },
                _ = ticker.tick() => {
                    if !estimator.is_paused() {
                        let _ = progress.send(estimator.fraction(Instant::now()));
                    }
                }
                Ok(()) = paused_rx.changed() => {
                    let now = Instant::now();
                    if *paused_rx.borrow_and_update() {
                        estimator.pause(now);
                    } else {
                        estimator.resume(now);
                    }
                }
            }
        }
    }

    fn pause(&self) {
        self.paused.send_replace(true);
        self.platform.pause();
    }

    fn resume(&self) {
        self.paused.send_replace(false);
        self.platform.resume();
    }

    fn stop(&self) {
        self.paused.send_replace(false);
        self.platform.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Hands out pre-built event senders so a test can drive the utterance.
    struct ScriptedPlatform {
        senders: Mutex<Vec<mpsc::UnboundedSender<PlatformEvent>>>,
        cancels: AtomicUsize,
    }

    impl ScriptedPlatform {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                senders: Mutex::new(Vec::new()),
                cancels: AtomicUsize::new(0),
            })
        }

        fn send(&self, event: PlatformEvent) {
            for tx in self.senders.lock().unwrap().iter() {
                let _ = tx.send(event.clone());
            }
        }
    }

    #[async_trait]
    impl SpeechPlatform for ScriptedPlatform {
        fn name(&self) -> &str {
            "scripted"
        }
        fn voices(&self) -> Vec<Voice> {
            vec![Voice::native("Alex", "en-US")]
        }
        async fn voices_changed(&self) {
            std::future::pending::<()>().await
        }
        async fn prime(&self) {}
        async fn utter(&self, _utterance: Utterance) -> Result<UtteranceEvents, PlatformError> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(rx)
        }
        fn pause(&self) {}
        fn resume(&self) {}
        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request(text: &str) -> ChunkRequest<'_> {
        ChunkRequest {
            text,
            voice: None,
            rate: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extrapolates_then_snaps_to_boundary() {
        let platform = ScriptedPlatform::new();
        let adapter = Arc::new(NativeSpeechAdapter::new(
            platform.clone(),
            10.0,
            900,
            Duration::from_millis(100),
        ));
        let (tx, mut rx) = watch::channel(0.0);
        let cancel = CancellationToken::new();

        let task = {
            let adapter = adapter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let text = "a".repeat(100);
                adapter.speak(request(&text), &tx, &cancel).await
            })
        };

        tokio::time::sleep(Duration::from_millis(2050)).await;
        let estimate = *rx.borrow_and_update();
        assert!((estimate - 0.2).abs() < 0.02, "estimate {estimate}");

        // The engine is slower than assumed.
        platform.send(PlatformEvent::Boundary { char_index: 5 });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let corrected = *rx.borrow_and_update();
        assert!(corrected < 0.1, "corrected {corrected}");

        platform.send(PlatformEvent::End);
        let spoken = task.await.unwrap().unwrap();
        assert!(spoken.audio.is_none());
        assert_eq!(*rx.borrow(), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_never_speaks() {
        let platform = ScriptedPlatform::new();
        let adapter = NativeSpeechAdapter::new(platform.clone(), 15.0, 900, Duration::from_millis(100));
        let (tx, _rx) = watch::channel(0.0);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = adapter.speak(request("Hello."), &tx, &cancel).await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn platform_error_is_a_chunk_failure() {
        let platform = ScriptedPlatform::new();
        let adapter = Arc::new(NativeSpeechAdapter::new(
            platform.clone(),
            15.0,
            900,
            Duration::from_millis(100),
        ));
        let (tx, _rx) = watch::channel(0.0);
        let cancel = CancellationToken::new();
        let task = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.speak(request("Hello."), &tx, &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        platform.send(PlatformEvent::Error("voice crashed".into()));
        let failure = task.await.unwrap().unwrap_err();
        assert_eq!(failure.kind, crate::error::FailureKind::Synthesis);
        assert_eq!(platform.cancels.load(Ordering::SeqCst), 0);
    }
}
