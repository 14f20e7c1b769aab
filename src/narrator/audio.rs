//! Local audio output: a "media element" the remote and offline backends
//! play through.
//!
//! The real output is rodio (default `playback` feature). Builds without
//! it still run native voices; remote and offline audio report the output
//! as unavailable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::backend::ProgressTx;
use super::progress::ProgressEstimator;
use crate::error::{AudioError, ChunkFailure};

/// One playing clip.
pub trait MediaHandle: Send + Sync {
    /// Play position from the start of the clip.
    fn position(&self) -> Duration;
    /// Total length, when the decoder knows it.
    fn duration(&self) -> Option<Duration>;
    fn is_finished(&self) -> bool;
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
}

/// Exact play-position ratio, if the clip length is known.
pub fn play_fraction(handle: &dyn MediaHandle) -> Option<f64> {
    let total = handle.duration()?.as_secs_f64();
    if total <= 0.0 {
        return None;
    }
    Some((handle.position().as_secs_f64() / total).clamp(0.0, 1.0))
}

pub trait AudioOutput: Send + Sync {
    /// Decode and start playing an encoded clip (MP3, WAV, ...).
    fn play_encoded(&self, audio: Bytes) -> Result<Arc<dyn MediaHandle>, AudioError>;

    /// Start playing interleaved f32 samples.
    fn play_samples(
        &self,
        channels: u16,
        sample_rate: u32,
        samples: Vec<f32>,
    ) -> Result<Arc<dyn MediaHandle>, AudioError>;
}

/// The clip a backend is currently playing, plus its paused flag.
///
/// Pausing before the clip exists (still synthesizing) makes the clip
/// start paused.
#[derive(Default)]
pub struct ClipSlot {
    current: Mutex<Option<Arc<dyn MediaHandle>>>,
    paused: AtomicBool,
}

impl ClipSlot {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn MediaHandle>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        if let Some(clip) = self.slot().as_ref() {
            clip.pause();
        }
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if let Some(clip) = self.slot().as_ref() {
            clip.resume();
        }
    }

    pub fn stop(&self) {
        self.paused.store(false, Ordering::SeqCst);
        if let Some(clip) = self.slot().take() {
            clip.stop();
        }
    }

    /// Play `clip` to the end, reporting its position every `tick`.
    ///
    /// Clips whose length the decoder could not work out report `estimate`
    /// instead, frozen while the slot is paused.
    pub async fn drive(
        &self,
        clip: Arc<dyn MediaHandle>,
        mut estimate: ProgressEstimator,
        tick: Duration,
        progress: &ProgressTx,
        cancel: &CancellationToken,
    ) -> Result<(), ChunkFailure> {
        if self.paused.load(Ordering::SeqCst) {
            clip.pause();
            estimate.pause(Instant::now());
        }
        *self.slot() = Some(clip.clone());

        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let outcome = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    clip.stop();
                    break Err(ChunkFailure::cancelled());
                }
                _ = ticker.tick() => {
                    if clip.is_finished() {
                        let _ = progress.send(1.0);
                        break Ok(());
                    }
                    let now = Instant::now();
                    match (self.paused.load(Ordering::SeqCst), estimate.is_paused()) {
                        (true, false) => estimate.pause(now),
                        (false, true) => estimate.resume(now),
                        _ => {}
                    }
                    let fraction = play_fraction(clip.as_ref()).unwrap_or_else(|| estimate.fraction(now));
                    let _ = progress.send(fraction);
                }
            }
        };

        let mut slot = self.slot();
        if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, &clip)) {
            *slot = None;
        }
        outcome
    }
}

/// Open the system's default audio device.
#[cfg(feature = "playback")]
pub fn open_default_output() -> Result<Arc<dyn AudioOutput>, AudioError> {
    Ok(Arc::new(rodio_output::RodioOutput::open()?))
}

#[cfg(not(feature = "playback"))]
pub fn open_default_output() -> Result<Arc<dyn AudioOutput>, AudioError> {
    Err(AudioError::Unavailable(
        "built without the `playback` feature".into(),
    ))
}

#[cfg(feature = "playback")]
mod rodio_output {
    use std::io::Cursor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use rodio::buffer::SamplesBuffer;
    use rodio::{Decoder, OutputStream, OutputStreamBuilder, Sink, Source};
    use tracing::{debug, info};

    use super::{AudioOutput, MediaHandle};
    use crate::error::AudioError;

    /// Default output device, kept open for the process lifetime.
    pub struct RodioOutput {
        stream: OutputStream,
    }

    impl RodioOutput {
        pub fn open() -> Result<Self, AudioError> {
            let stream = OutputStreamBuilder::open_default_stream()
                .map_err(|e| AudioError::Unavailable(format!("Failed to open audio output: {e}")))?;
            info!("Audio output opened");
            Ok(Self { stream })
        }

        fn start(&self, source: impl Source + Send + 'static, duration: Option<Duration>) -> Arc<dyn MediaHandle> {
            // rodio 0.21: Sink::connect_new takes &Mixer
            let sink = Sink::connect_new(self.stream.mixer());
            sink.append(source);
            Arc::new(RodioClip {
                sink,
                duration,
                stopped: AtomicBool::new(false),
            })
        }
    }

    impl AudioOutput for RodioOutput {
        fn play_encoded(&self, audio: Bytes) -> Result<Arc<dyn MediaHandle>, AudioError> {
            // Without the byte length the MP3 decoder cannot compute a duration.
            let decoder = Decoder::builder()
                .with_data(Cursor::new(audio.to_vec()))
                .with_byte_len(audio.len() as u64)
                .with_seekable(true)
                .build()
                .map_err(|e| AudioError::Decode(e.to_string()))?;
            let duration = decoder.total_duration();
            debug!("Decoded {} bytes, duration {:?}", audio.len(), duration);
            Ok(self.start(decoder, duration))
        }

        fn play_samples(
            &self,
            channels: u16,
            sample_rate: u32,
            samples: Vec<f32>,
        ) -> Result<Arc<dyn MediaHandle>, AudioError> {
            if channels == 0 || sample_rate == 0 {
                return Err(AudioError::Decode("invalid sample format".into()));
            }
            let frames = samples.len() as f64 / f64::from(channels);
            let duration = Duration::from_secs_f64(frames / f64::from(sample_rate));
            let source = SamplesBuffer::new(channels, sample_rate, samples);
            Ok(self.start(source, Some(duration)))
        }
    }

    struct RodioClip {
        sink: Sink,
        duration: Option<Duration>,
        stopped: AtomicBool,
    }

    impl MediaHandle for RodioClip {
        fn position(&self) -> Duration {
            self.sink.get_pos()
        }

        fn duration(&self) -> Option<Duration> {
            self.duration
        }

        fn is_finished(&self) -> bool {
            self.stopped.load(Ordering::Relaxed) || self.sink.empty()
        }

        fn pause(&self) {
            self.sink.pause();
        }

        fn resume(&self) {
            self.sink.play();
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::Relaxed);
            self.sink.stop();
        }
    }
}
