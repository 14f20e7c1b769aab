//! Progress math: in-chunk estimation, percentages, remaining time.

use std::time::Duration;

use tokio::time::Instant;

/// Estimates how far into a chunk a voice has spoken.
///
/// Between authoritative boundary events the position is extrapolated
/// linearly from elapsed speaking time at an assumed rate. A boundary
/// event re-anchors the estimate at the reported character offset.
/// Paused time does not count.
#[derive(Debug, Clone)]
pub struct ProgressEstimator {
    chunk_chars: usize,
    chars_per_second: f64,
    anchor_chars: usize,
    anchor_at: Instant,
    paused_at: Option<Instant>,
}

impl ProgressEstimator {
    pub fn new(chunk_chars: usize, chars_per_second: f64, now: Instant) -> Self {
        Self {
            chunk_chars,
            chars_per_second: chars_per_second.max(f64::MIN_POSITIVE),
            anchor_chars: 0,
            anchor_at: now,
            paused_at: None,
        }
    }

    /// Estimated fraction of the chunk spoken, 0.0–1.0.
    pub fn fraction(&self, now: Instant) -> f64 {
        if self.chunk_chars == 0 {
            return 1.0;
        }
        let until = self.paused_at.unwrap_or(now);
        let elapsed = until.saturating_duration_since(self.anchor_at).as_secs_f64();
        let position = self.anchor_chars as f64 + elapsed * self.chars_per_second;
        (position / self.chunk_chars as f64).clamp(0.0, 1.0)
    }

    /// Authoritative boundary event at `char_index` within the chunk.
    pub fn correct(&mut self, char_index: usize, now: Instant) {
        self.anchor_chars = char_index.min(self.chunk_chars);
        self.anchor_at = self.paused_at.unwrap_or(now);
    }

    pub fn pause(&mut self, now: Instant) {
        if self.paused_at.is_none() {
            self.paused_at = Some(now);
        }
    }

    pub fn resume(&mut self, now: Instant) {
        if let Some(paused_at) = self.paused_at.take() {
            self.anchor_at += now.saturating_duration_since(paused_at);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }
}

/// `round(processed / total * 100)`, 0 for empty text.
pub fn percent(processed: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    let p = (processed.min(total) as f64 / total as f64 * 100.0).round();
    p as u8
}

/// Seconds left to speak.
///
/// Before any chunk has completed the assumed rate (scaled by the user's
/// rate multiplier) is used; afterwards the observed throughput.
pub fn remaining_seconds(
    cursor: usize,
    position: usize,
    total: usize,
    speaking_time: Duration,
    assumed_chars_per_second: f64,
    rate: f64,
) -> f64 {
    let left = total.saturating_sub(position.max(cursor)) as f64;
    if left == 0.0 {
        return 0.0;
    }
    let secs = speaking_time.as_secs_f64();
    let throughput = if cursor > 0 && secs > 0.0 {
        cursor as f64 / secs
    } else {
        assumed_chars_per_second * rate
    };
    if throughput > 0.0 {
        left / throughput
    } else {
        0.0
    }
}

/// `HH:MM:SS` for progress displays.
pub fn format_clock(seconds: f64) -> String {
    let s = seconds.max(0.0).floor() as u64;
    format!("{:02}:{:02}:{:02}", s / 3600, s % 3600 / 60, s % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_grows_with_time_and_caps() {
        let t0 = Instant::now();
        let est = ProgressEstimator::new(30, 15.0, t0);
        assert_eq!(est.fraction(t0), 0.0);
        let half = est.fraction(t0 + Duration::from_secs(1));
        assert!((half - 0.5).abs() < 1e-9);
        assert_eq!(est.fraction(t0 + Duration::from_secs(10)), 1.0);
    }

    #[test]
    fn boundary_corrects_estimate() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(100, 10.0, t0);
        // Estimate says 50 chars after 5s, engine reports only 20.
        let t5 = t0 + Duration::from_secs(5);
        assert!((est.fraction(t5) - 0.5).abs() < 1e-9);
        est.correct(20, t5);
        assert!((est.fraction(t5) - 0.2).abs() < 1e-9);
        assert!((est.fraction(t5 + Duration::from_secs(1)) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn paused_time_does_not_count() {
        let t0 = Instant::now();
        let mut est = ProgressEstimator::new(100, 10.0, t0);
        est.pause(t0 + Duration::from_secs(2));
        let frozen = est.fraction(t0 + Duration::from_secs(9));
        assert!((frozen - 0.2).abs() < 1e-9);
        est.resume(t0 + Duration::from_secs(10));
        let after = est.fraction(t0 + Duration::from_secs(11));
        assert!((after - 0.3).abs() < 1e-9);
    }

    #[test]
    fn percent_rounds() {
        assert_eq!(percent(0, 0), 0);
        assert_eq!(percent(1, 3), 33);
        assert_eq!(percent(2, 3), 67);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(5, 3), 100);
    }

    #[test]
    fn remaining_uses_assumed_rate_scaled_by_user_rate() {
        // 300 chars at 15 cps × 2.0 = 10s
        let r = remaining_seconds(0, 0, 300, Duration::ZERO, 15.0, 2.0);
        assert!((r - 10.0).abs() < 1e-9);
    }

    #[test]
    fn remaining_switches_to_observed_throughput() {
        // 100 chars done in 20s → 5 cps; 200 left → 40s
        let r = remaining_seconds(100, 100, 300, Duration::from_secs(20), 15.0, 1.0);
        assert!((r - 40.0).abs() < 1e-9);
    }

    #[test]
    fn clock_formats_hours_minutes_seconds() {
        assert_eq!(format_clock(0.0), "00:00:00");
        assert_eq!(format_clock(61.9), "00:01:01");
        assert_eq!(format_clock(3723.0), "01:02:03");
    }
}
