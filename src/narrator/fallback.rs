//! Backend selection, mid-session demotion, and remote availability probing.
//!
//! Preference: remote neural (if probed reachable) → native (if it has
//! voices) → offline (if installed). Demotion only ever moves down that
//! list, and a session never goes back up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::SpeechBackend;
use super::voices::EngineKind;
use crate::error::{ChunkFailure, FailureKind, PlaybackError};

/// A cheap liveness check against a remote service.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, timeout: Duration) -> bool;
}

/// Tracks whether the remote service is reachable.
///
/// Each probe makes one attempt per configured timeout (increasing). The
/// monitor probes at startup, then again every `reprobe_interval` while the
/// service was last seen down.
pub struct AvailabilityProbe {
    target: Arc<dyn HealthCheck>,
    timeouts: Vec<Duration>,
    reprobe_interval: Duration,
    reachable: AtomicBool,
}

impl AvailabilityProbe {
    pub fn new(target: Arc<dyn HealthCheck>, timeouts: Vec<Duration>, reprobe_interval: Duration) -> Self {
        Self {
            target,
            timeouts,
            reprobe_interval,
            reachable: AtomicBool::new(false),
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    /// Record that the service failed mid-session; periodic probing resumes.
    pub fn mark_unreachable(&self) {
        if self.reachable.swap(false, Ordering::SeqCst) {
            info!("Remote voices marked unreachable");
        }
    }

    pub async fn probe(&self) -> bool {
        for (attempt, timeout) in self.timeouts.iter().enumerate() {
            if self.target.check(*timeout).await {
                if !self.reachable.swap(true, Ordering::SeqCst) {
                    info!("Remote voices reachable");
                }
                return true;
            }
            debug!("Probe attempt {} ({timeout:?}) failed", attempt + 1);
        }
        self.reachable.store(false, Ordering::SeqCst);
        warn!(
            "Remote voices unreachable after {} attempts, retrying in {:?}",
            self.timeouts.len(),
            self.reprobe_interval
        );
        false
    }

    /// Probe now, then periodically while unreachable, until `cancel`.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            probe.probe().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(probe.reprobe_interval) => {
                        if !probe.is_reachable() {
                            probe.probe().await;
                        }
                    }
                }
            }
        })
    }
}

/// The backends available to the engine. Any may be absent.
#[derive(Clone, Default)]
pub struct Backends {
    pub remote: Option<Arc<dyn SpeechBackend>>,
    pub native: Option<Arc<dyn SpeechBackend>>,
    pub offline: Option<Arc<dyn SpeechBackend>>,
}

const PREFERENCE: [EngineKind; 3] = [EngineKind::Neural, EngineKind::Native, EngineKind::Offline];

pub struct FallbackCoordinator {
    backends: Backends,
    probe: Option<Arc<AvailabilityProbe>>,
    demotion_threshold: u32,
}

impl FallbackCoordinator {
    pub fn new(backends: Backends, probe: Option<Arc<AvailabilityProbe>>, demotion_threshold: u32) -> Self {
        Self {
            backends,
            probe,
            demotion_threshold: demotion_threshold.max(1),
        }
    }

    pub fn backend(&self, kind: EngineKind) -> Option<&Arc<dyn SpeechBackend>> {
        match kind {
            EngineKind::Neural => self.backends.remote.as_ref(),
            EngineKind::Native => self.backends.native.as_ref(),
            EngineKind::Offline => self.backends.offline.as_ref(),
        }
    }

    pub fn probe(&self) -> Option<&Arc<AvailabilityProbe>> {
        self.probe.as_ref()
    }

    /// Whether a new session could use this backend right now.
    pub fn is_viable(&self, kind: EngineKind) -> bool {
        let Some(backend) = self.backend(kind) else {
            return false;
        };
        if !backend.is_available() {
            return false;
        }
        match kind {
            // Remote needs a confirmed probe; without a probe it is never trusted.
            EngineKind::Neural => self.probe.as_ref().is_some_and(|p| p.is_reachable()),
            _ => true,
        }
    }

    /// Pick the backend for a new session. A viable hint wins.
    pub fn select(&self, hint: Option<EngineKind>) -> Result<Arc<dyn SpeechBackend>, PlaybackError> {
        if let Some(kind) = hint {
            if self.is_viable(kind) {
                return self.backend(kind).cloned().ok_or(PlaybackError::NoVoiceAvailable);
            }
            debug!("Requested {kind} backend is not viable, using default order");
        }
        PREFERENCE
            .into_iter()
            .find(|&kind| self.is_viable(kind))
            .and_then(|kind| self.backend(kind).cloned())
            .ok_or(PlaybackError::NoVoiceAvailable)
    }

    /// Next viable backend below `from`.
    pub fn demotion_target(&self, from: EngineKind) -> Option<Arc<dyn SpeechBackend>> {
        PREFERENCE
            .into_iter()
            .skip_while(|&kind| kind != from)
            .skip(1)
            .find(|&kind| self.is_viable(kind))
            .and_then(|kind| self.backend(kind).cloned())
    }

    /// Bookkeeping after a session left `from`.
    pub fn on_demoted(&self, from: EngineKind) {
        if from == EngineKind::Neural {
            if let Some(probe) = &self.probe {
                probe.mark_unreachable();
            }
        }
    }

    pub fn tracker(&self) -> FailureTracker {
        FailureTracker {
            threshold: self.demotion_threshold,
            consecutive_remote: 0,
        }
    }
}

/// What to do after a chunk failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Skip the chunk, stay on this backend.
    Continue,
    /// Move the rest of the session to a lower backend.
    Demote,
}

/// Per-session failure counting.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    threshold: u32,
    consecutive_remote: u32,
}

impl FailureTracker {
    pub fn record_success(&mut self) {
        self.consecutive_remote = 0;
    }

    pub fn record_failure(&mut self, backend: EngineKind, failure: &ChunkFailure) -> Verdict {
        match failure.kind {
            FailureKind::PlaybackDevice => Verdict::Demote,
            FailureKind::RemoteSynthesis if backend == EngineKind::Neural => {
                self.consecutive_remote += 1;
                if self.consecutive_remote >= self.threshold {
                    self.consecutive_remote = 0;
                    Verdict::Demote
                } else {
                    Verdict::Continue
                }
            }
            _ => Verdict::Continue,
        }
    }
}
