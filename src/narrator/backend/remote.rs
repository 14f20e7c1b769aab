//! Remote neural voices: one HTTP synthesis request per chunk, audio played
//! locally.
//!
//! API:
//! - `GET /` liveness probe, any 2xx means up
//! - `POST /api/tts` `{text, voice, rate: "+N%", pitch}` → audio/mpeg,
//!   or `{detail}` with a non-2xx status

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{AdapterResult, ChunkRequest, ChunkSpoken, ProgressTx, SpeechBackend};
use crate::config::RemoteConfig;
use crate::error::ChunkFailure;
use crate::narrator::audio::{AudioOutput, ClipSlot};
use crate::narrator::progress::ProgressEstimator;
use crate::narrator::fallback::HealthCheck;
use crate::narrator::voices::EngineKind;

#[derive(Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice: &'a str,
    rate: String,
    pitch: &'a str,
}

#[derive(Deserialize)]
struct TtsErrorBody {
    detail: String,
}

/// Rate multiplier as the service's signed percentage: 1.2 → `+20%`.
pub fn rate_to_api(rate: f32) -> String {
    let pct = ((f64::from(rate) - 1.0) * 100.0).round() as i64;
    if pct >= 0 {
        format!("+{pct}%")
    } else {
        format!("{pct}%")
    }
}

pub struct RemoteNeuralAdapter {
    client: reqwest::Client,
    base_url: String,
    pitch: String,
    default_voice: String,
    max_chunk_chars: usize,
    chars_per_second: f64,
    tick: Duration,
    output: Option<Arc<dyn AudioOutput>>,
    clip: ClipSlot,
}

impl RemoteNeuralAdapter {
    pub fn new(
        config: &RemoteConfig,
        max_chunk_chars: usize,
        chars_per_second: f64,
        tick: Duration,
        output: Option<Arc<dyn AudioOutput>>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            pitch: config.pitch.clone(),
            default_voice: config.default_voice.clone(),
            max_chunk_chars,
            chars_per_second,
            tick,
            output,
            clip: ClipSlot::default(),
        })
    }

    /// Fetch the audio for one chunk.
    pub async fn synthesize(&self, text: &str, voice: Option<&str>, rate: f32) -> Result<Bytes, ChunkFailure> {
        let body = TtsRequest {
            text,
            voice: voice.unwrap_or(self.default_voice.as_str()),
            rate: rate_to_api(rate),
            pitch: &self.pitch,
        };
        let url = format!("{}/api/tts", self.base_url);
        debug!("POST {url} ({} chars, voice {}, rate {})", text.chars().count(), body.voice, body.rate);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ChunkFailure::remote(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TtsErrorBody>(&text)
                .map(|b| b.detail)
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(ChunkFailure::remote(reason));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| ChunkFailure::remote(format!("failed to read audio: {e}")))?;
        if audio.is_empty() {
            return Err(ChunkFailure::remote("service returned no audio"));
        }
        Ok(audio)
    }
}

#[async_trait]
impl SpeechBackend for RemoteNeuralAdapter {
    fn kind(&self) -> EngineKind {
        EngineKind::Neural
    }

    fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    /// Reachability is the probe's business; this only needs somewhere to
    /// play the audio.
    fn is_available(&self) -> bool {
        self.output.is_some()
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
        let audio = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ChunkFailure::cancelled()),
            fetched = self.synthesize(request.text, request.voice, request.rate) => fetched?,
        };
        debug!("Synthesized {} bytes in {:?}", audio.len(), started.elapsed());

        let Some(output) = &self.output else {
            return Err(ChunkFailure::device("no audio output"));
        };
        let clip = output.play_encoded(audio.clone())?;
        let cps = self.chars_per_second * f64::from(request.rate.max(0.1));
        let estimate = ProgressEstimator::new(request.text.chars().count(), cps, Instant::now());
        self.clip.drive(clip, estimate, self.tick, progress, cancel).await?;

        Ok(ChunkSpoken {
            elapsed: started.elapsed(),
            audio: Some(audio),
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

#[async_trait]
impl HealthCheck for RemoteNeuralAdapter {
    async fn check(&self, timeout: Duration) -> bool {
        let url = format!("{}/", self.base_url);
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                debug!("Probe {url}: HTTP {}", response.status());
                false
            }
            Err(e) => {
                warn!("Probe {url} failed: {e}");
                false
            }
        }
    }
}
