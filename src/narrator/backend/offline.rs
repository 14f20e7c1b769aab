//! Offline synthesizer: espeak-ng rendered to WAV, played locally.
//!
//! Used only when neither the neural service nor system voices are viable.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AdapterResult, ChunkRequest, ChunkSpoken, ProgressTx, SpeechBackend};
use crate::config::OfflineConfig;
use crate::error::ChunkFailure;
use crate::narrator::audio::{AudioOutput, ClipSlot};
use crate::narrator::progress::ProgressEstimator;
use crate::narrator::voices::EngineKind;

/// Decoded PCM, interleaved.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAudio {
    pub channels: u16,
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// A local synthesizer that renders a whole chunk at once.
#[async_trait]
pub trait OfflineSynth: Send + Sync {
    fn is_loaded(&self) -> bool;

    async fn render(&self, text: &str, voice: &str, rate: f32) -> Result<RenderedAudio, ChunkFailure>;
}

pub struct EspeakSynth {
    program: Option<PathBuf>,
    words_per_minute: f64,
}

impl EspeakSynth {
    pub fn new(config: &OfflineConfig) -> Self {
        let program = locate_program(&config.program);
        match &program {
            Some(path) => info!("Offline synthesizer: {}", path.display()),
            None => warn!("{} not found, offline voices disabled", config.program),
        }
        Self {
            program,
            words_per_minute: config.words_per_minute,
        }
    }
}

/// Resolve a program name against `$PATH`; paths are taken as-is.
fn locate_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|p| p.is_file())
}

#[async_trait]
impl OfflineSynth for EspeakSynth {
    fn is_loaded(&self) -> bool {
        self.program.is_some()
    }

    async fn render(&self, text: &str, voice: &str, rate: f32) -> Result<RenderedAudio, ChunkFailure> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| ChunkFailure::device("espeak-ng is not installed"))?;
        let speed = (self.words_per_minute * f64::from(rate)).round().clamp(80.0, 450.0) as u32;

        let mut child = Command::new(program)
            .args(["--stdout", "-v", voice, "-s", &speed.to_string()])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChunkFailure::device(format!("failed to start espeak-ng: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .map_err(|e| ChunkFailure::synthesis(format!("failed to write to espeak-ng: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ChunkFailure::device(format!("espeak-ng failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChunkFailure::synthesis(format!(
                "espeak-ng exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        decode_wav(&output.stdout)
    }
}

/// Decode a WAV byte stream to f32 samples.
///
/// espeak-ng writes to a pipe, so the header's length fields may be bogus;
/// reading stops at the first short or bad sample.
pub fn decode_wav(bytes: &[u8]) -> Result<RenderedAudio, ChunkFailure> {
    let reader = hound::WavReader::new(Cursor::new(bytes))
        .map_err(|e| ChunkFailure::synthesis(format!("bad WAV from synthesizer: {e}")))?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.into_samples::<f32>().map_while(Result::ok).collect(),
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
            reader
                .into_samples::<i32>()
                .map_while(Result::ok)
                .map(|s| s as f32 / scale)
                .collect()
        }
    };

    if samples.is_empty() {
        return Err(ChunkFailure::synthesis("synthesizer produced no audio"));
    }
    Ok(RenderedAudio {
        channels: spec.channels,
        sample_rate: spec.sample_rate,
        samples,
    })
}

pub struct OfflineSynthAdapter {
    synth: Arc<dyn OfflineSynth>,
    output: Option<Arc<dyn AudioOutput>>,
    default_voice: String,
    max_chunk_chars: usize,
    chars_per_second: f64,
    tick: Duration,
    clip: ClipSlot,
}

impl OfflineSynthAdapter {
    pub fn new(
        synth: Arc<dyn OfflineSynth>,
        output: Option<Arc<dyn AudioOutput>>,
        default_voice: impl Into<String>,
        max_chunk_chars: usize,
        chars_per_second: f64,
        tick: Duration,
    ) -> Self {
        Self {
            synth,
            output,
            default_voice: default_voice.into(),
            max_chunk_chars,
            chars_per_second,
            tick,
            clip: ClipSlot::default(),
        }
    }
}

#[async_trait]
impl SpeechBackend for OfflineSynthAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Offline
    }

    fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    fn is_available(&self) -> bool {
        self.synth.is_loaded() && self.output.is_some()
    }

    fn default_voice(&self) -> Option<String> {
        Some(self.default_voice.clone())
    }

    async fn speak(
        &self,
        request: ChunkRequest<'_>,
        progress: &ProgressTx,
        cancel: &CancellationToken,
    ) -> AdapterResult {
        let started = Instant::now();
        let voice = request.voice.unwrap_or(self.default_voice.as_str());
        let rendered = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChunkFailure::cancelled()),
            rendered = self.synth.render(request.text, voice, request.rate) => rendered?,
        };
        debug!(
            "Rendered {} samples at {} Hz in {:?}",
            rendered.samples.len(),
            rendered.sample_rate,
            started.elapsed()
        );

        let Some(output) = &self.output else {
            return Err(ChunkFailure::device("no audio output"));
        };
        let clip = output.play_samples(rendered.channels, rendered.sample_rate, rendered.samples)?;
        let cps = self.chars_per_second * f64::from(request.rate.max(0.1));
        let estimate = ProgressEstimator::new(request.text.chars().count(), cps, Instant::now());
        self.clip.drive(clip, estimate, self.tick, progress, cancel).await?;

        Ok(ChunkSpoken {
            elapsed: started.elapsed(),
            audio: None,
        })
    }

    fn pause(&self) {
        self.clip.pause();
    }

    fn resume(&self) {
        self.clip.resume();
    }

    fn stop(&self) {
        self.clip.stop();
    }
}
