// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Reconnect controller (spec §4.5): per-camera state machine with
//! exponential backoff, jitter, and a circuit breaker that throttles
//! rapid reconnect storms.
//!
//! Grounded on the teacher's `camera.rs::supervised_connect` backoff
//! loop (`2u64.pow(attempt.min(6))`), generalized into the full phase
//! enum and breaker the teacher's loop lacked.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::ErrorCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Ready,
    Stalled,
    Cooldown,
    OpenBreaker,
    Stopped,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "IDLE",
            Phase::Connecting => "CONNECTING",
            Phase::Ready => "READY",
            Phase::Stalled => "STALLED",
            Phase::Cooldown => "COOLDOWN",
            Phase::OpenBreaker => "OPEN_BREAKER",
            Phase::Stopped => "STOPPED",
        }
    }
}

/// Lightweight status record published on every transition (spec §4.5,
/// §6.2 `cam:<id>:status`).
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub phase: Phase,
    pub last_error_code: Option<ErrorCode>,
    pub next_attempt_at: Option<Instant>,
    pub consecutive_failures: u32,
}

pub struct ReconnectController {
    camera_id: String,
    phase: Phase,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
    breaker_opened_at: Option<Instant>,
    last_error_code: Option<ErrorCode>,
    ready_since: Option<Instant>,
    breaker_threshold: u32,
    breaker_open_ms: u64,
    backoff_base_ms: u64,
    backoff_max_ms: u64,
}

const READY_SUSTAIN_SECS: u64 = 5;
const JITTER_MAX: f64 = 0.25;

impl ReconnectController {
    pub fn new(camera_id: impl Into<String>, runtime: &RuntimeConfig) -> Self {
        Self {
            camera_id: camera_id.into(),
            phase: Phase::Idle,
            consecutive_failures: 0,
            next_attempt_at: None,
            breaker_opened_at: None,
            last_error_code: None,
            ready_since: None,
            breaker_threshold: runtime.breaker_threshold,
            breaker_open_ms: runtime.breaker_open_ms,
            backoff_base_ms: runtime.backoff_base_ms,
            backoff_max_ms: runtime.backoff_max_ms,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_error_code(&self) -> Option<ErrorCode> {
        self.last_error_code
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    fn status(&self) -> StatusRecord {
        StatusRecord {
            phase: self.phase,
            last_error_code: self.last_error_code,
            next_attempt_at: self.next_attempt_at,
            consecutive_failures: self.consecutive_failures,
        }
    }

    fn transition(&mut self, to: Phase) -> StatusRecord {
        info!(camera = %self.camera_id, from = self.phase.as_str(), to = to.as_str(), "reconnect phase transition");
        self.phase = to;
        self.status()
    }

    /// IDLE → CONNECTING on `start`.
    pub fn start(&mut self) -> Result<StatusRecord, ErrorCode> {
        if self.is_breaker_open() {
            return Err(ErrorCode::BreakerOpen);
        }
        if matches!(self.phase, Phase::Connecting | Phase::Ready | Phase::Stalled) {
            return Ok(self.status()); // idempotent
        }
        Ok(self.transition(Phase::Connecting))
    }

    /// CONNECTING → READY once the readiness criterion is satisfied.
    pub fn mark_ready(&mut self) -> StatusRecord {
        self.ready_since = Some(Instant::now());
        self.transition(Phase::Ready)
    }

    /// Called periodically while READY; resets the failure count once the
    /// stream has been sustained for `READY_SUSTAIN_SECS`.
    pub fn tick_ready(&mut self) {
        if self.phase == Phase::Ready {
            if let Some(since) = self.ready_since {
                if since.elapsed() >= Duration::from_secs(READY_SUSTAIN_SECS) {
                    self.consecutive_failures = 0;
                }
            }
        }
    }

    /// CONNECTING → COOLDOWN on decoder exit or readiness timeout, or
    /// READY/STALLED → COOLDOWN after a confirmed stall.
    pub fn mark_failed(&mut self, code: ErrorCode) -> StatusRecord {
        self.consecutive_failures += 1;
        self.last_error_code = Some(code);
        self.ready_since = None;
        warn!(
            camera = %self.camera_id,
            code = code.as_str(),
            consecutive_failures = self.consecutive_failures,
            "capture failure observed"
        );

        if self.consecutive_failures >= self.breaker_threshold
            || (code.is_persistent_config() && self.consecutive_failures >= self.breaker_threshold.min(2))
        {
            self.breaker_opened_at = Some(Instant::now());
            self.next_attempt_at = Some(Instant::now() + Duration::from_millis(self.breaker_open_ms));
            return self.transition(Phase::OpenBreaker);
        }

        let delay = self.backoff_delay();
        self.next_attempt_at = Some(Instant::now() + delay);
        self.transition(Phase::Cooldown)
    }

    /// READY → STALLED, Watchdog-triggered.
    pub fn mark_stalled(&mut self) -> StatusRecord {
        self.transition(Phase::Stalled)
    }

    /// STALLED → COOLDOWN after the grace period confirms the stall.
    pub fn confirm_stall(&mut self, code: ErrorCode) -> StatusRecord {
        self.mark_failed(code)
    }

    /// COOLDOWN → CONNECTING once `next_attempt_at` is reached and the
    /// breaker is not open; COOLDOWN → OPEN_BREAKER handled in
    /// `mark_failed`. Returns `None` if it's not yet time to retry.
    pub fn try_retry(&mut self) -> Option<StatusRecord> {
        match self.phase {
            Phase::Cooldown => {
                if let Some(at) = self.next_attempt_at {
                    if Instant::now() >= at {
                        return Some(self.transition(Phase::Connecting));
                    }
                }
                None
            }
            Phase::OpenBreaker => {
                if let Some(opened) = self.breaker_opened_at {
                    if opened.elapsed() >= Duration::from_millis(self.breaker_open_ms) {
                        // Half-open retry.
                        self.breaker_opened_at = None;
                        return Some(self.transition(Phase::Cooldown));
                    }
                }
                None
            }
            _ => None,
        }
    }

    pub fn is_breaker_open(&self) -> bool {
        matches!(self.phase, Phase::OpenBreaker)
    }

    /// any → STOPPED on `stop`/`remove`.
    pub fn stop(&mut self) -> StatusRecord {
        self.breaker_opened_at = None;
        self.next_attempt_at = None;
        self.transition(Phase::Stopped)
    }

    fn backoff_delay(&self) -> Duration {
        let exp = self.consecutive_failures.min(6);
        let base = self.backoff_base_ms.saturating_mul(1u64 << exp);
        let capped = base.min(self.backoff_max_ms);
        let jitter = rand::thread_rng().gen_range(-JITTER_MAX..=JITTER_MAX);
        let jittered = (capped as f64) * (1.0 + jitter);
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> ReconnectController {
        ReconnectController::new("cam1", &RuntimeConfig::default())
    }

    #[test]
    fn idle_to_connecting_on_start() {
        let mut c = controller();
        assert_eq!(c.phase(), Phase::Idle);
        c.start().unwrap();
        assert_eq!(c.phase(), Phase::Connecting);
    }

    #[test]
    fn start_is_idempotent_while_connecting() {
        let mut c = controller();
        c.start().unwrap();
        c.start().unwrap();
        assert_eq!(c.phase(), Phase::Connecting);
    }

    #[test]
    fn three_failures_open_the_breaker() {
        let mut c = controller();
        c.start().unwrap();
        c.mark_failed(ErrorCode::ConnectFailed);
        assert_eq!(c.phase(), Phase::Cooldown);
        // Force immediate retry for the test.
        c.next_attempt_at = Some(Instant::now());
        c.try_retry().unwrap();
        c.mark_failed(ErrorCode::ConnectFailed);
        c.next_attempt_at = Some(Instant::now());
        c.try_retry().unwrap();
        c.mark_failed(ErrorCode::ConnectFailed);
        assert_eq!(c.phase(), Phase::OpenBreaker);
        assert!(c.is_breaker_open());
    }

    #[test]
    fn breaker_refuses_start_while_open() {
        let mut c = controller();
        c.breaker_opened_at = Some(Instant::now());
        c.next_attempt_at = Some(Instant::now() + Duration::from_secs(15));
        c.phase = Phase::OpenBreaker;
        assert_eq!(c.start().unwrap_err(), ErrorCode::BreakerOpen);
    }

    #[test]
    fn breaker_half_opens_after_window() {
        let mut c = controller();
        c.breaker_opened_at = Some(Instant::now() - Duration::from_millis(20_000));
        c.phase = Phase::OpenBreaker;
        let status = c.try_retry().expect("should half-open");
        assert_eq!(status.phase, Phase::Cooldown);
    }

    #[test]
    fn sustained_ready_resets_failure_count() {
        let mut c = controller();
        c.consecutive_failures = 2;
        c.phase = Phase::Ready;
        c.ready_since = Some(Instant::now() - Duration::from_secs(10));
        c.tick_ready();
        assert_eq!(c.consecutive_failures, 0);
    }

    #[test]
    fn backoff_delay_grows_and_caps() {
        let mut c = controller();
        c.consecutive_failures = 0;
        let d0 = c.backoff_delay();
        c.consecutive_failures = 10; // clamps to 6
        let d6 = c.backoff_delay();
        assert!(d6 >= d0);
        assert!(d6.as_millis() as u64 <= (c.backoff_max_ms as f64 * 1.25) as u64);
    }
}
