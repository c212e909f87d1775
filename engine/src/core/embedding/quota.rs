//! Quota Gate
//!
//! Process-wide quota state shared by every embedding caller. A rate-limit
//! signal opens a blocking window; callers arriving during the window wait
//! for it to close (or fail fast when non-blocking).
//!
//! Windows escalate: without a provider hint the first window is `min_wait`
//! and each consecutive rate-limit doubles it up to `max_wait`. A successful
//! call resets the escalation.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::clock::{Clock, Sleeper, TokioClock, TokioSleeper};
use super::policy::duration_ms;
use crate::core::{CoreError, CoreResult};

// =============================================================================
// Configuration
// =============================================================================

/// Quota window settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QuotaConfig {
    /// First window when the provider gives no retry hint
    #[serde(with = "duration_ms")]
    pub min_wait: Duration,
    /// Upper bound for escalated windows
    #[serde(with = "duration_ms")]
    pub max_wait: Duration,
    /// Quota waits a single call may sit through before giving up
    pub max_quota_waits: u32,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            min_wait: Duration::from_secs(60),
            max_wait: Duration::from_secs(300),
            max_quota_waits: 3,
        }
    }
}

// =============================================================================
// Quota Gate
// =============================================================================

#[derive(Debug, Default)]
struct QuotaState {
    blocked_until: Option<Instant>,
    /// Consecutive rate-limit signals since the last success
    strikes: u32,
}

/// Snapshot of the gate for diagnostics
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QuotaStatus {
    pub remaining: Option<Duration>,
    pub strikes: u32,
}

/// Shared quota state with an injectable clock and sleeper
pub struct QuotaGate {
    config: QuotaConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    state: Mutex<QuotaState>,
}

impl QuotaGate {
    /// Creates a gate on tokio time
    pub fn new(config: QuotaConfig) -> Self {
        Self::with_time(config, Arc::new(TokioClock), Arc::new(TokioSleeper))
    }

    /// Creates a gate on the given time source
    pub fn with_time(config: QuotaConfig, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            config,
            clock,
            sleeper,
            state: Mutex::new(QuotaState::default()),
        }
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    /// Sleeper shared with the retry loop
    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        Arc::clone(&self.sleeper)
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        // State is plain data; a panic mid-update cannot leave it inconsistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Time left in the current window, if any
    pub fn remaining(&self) -> Option<Duration> {
        let state = self.lock();
        let now = self.clock.now();
        state
            .blocked_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    pub fn status(&self) -> QuotaStatus {
        let strikes = self.lock().strikes;
        QuotaStatus {
            remaining: self.remaining(),
            strikes,
        }
    }

    /// Records a rate-limit signal and returns the time until the window closes.
    ///
    /// A signal that arrives while a window is already open joins that window
    /// instead of escalating it, so concurrent callers hitting the same limit
    /// count once.
    pub fn record_rate_limited(&self, retry_after: Option<Duration>) -> Duration {
        let mut state = self.lock();
        let now = self.clock.now();

        if let Some(until) = state.blocked_until.filter(|until| *until > now) {
            return until - now;
        }

        let escalated = self
            .config
            .min_wait
            .checked_mul(2u32.saturating_pow(state.strikes.min(31)))
            .unwrap_or(self.config.max_wait)
            .min(self.config.max_wait);
        let window = retry_after.unwrap_or(escalated);

        state.strikes = state.strikes.saturating_add(1);
        state.blocked_until = Some(now + window);

        tracing::warn!(
            window_ms = window.as_millis() as u64,
            strikes = state.strikes,
            "Embedding quota exhausted, pausing calls"
        );

        window
    }

    /// Records a successful call, resetting escalation
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.strikes > 0 {
            tracing::info!("Embedding quota recovered");
        }
        state.strikes = 0;
    }

    /// Waits until no window is open.
    ///
    /// Non-blocking callers get [`CoreError::QuotaExhausted`] instead of
    /// waiting. The wait ends early with [`CoreError::Cancelled`] when
    /// `cancel` fires.
    pub async fn wait_until_available(
        &self,
        blocking: bool,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        while let Some(remaining) = self.remaining() {
            if !blocking {
                return Err(CoreError::QuotaExhausted {
                    reset_in: remaining,
                });
            }

            tracing::debug!(
                delay_ms = remaining.as_millis() as u64,
                "Waiting for embedding quota window"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(CoreError::Cancelled("quota wait cancelled".to_string()));
                }
                _ = self.sleeper.sleep(remaining) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::embedding::clock::{ManualClock, RecordingSleeper};

    fn manual_gate() -> (Arc<QuotaGate>, ManualClock, RecordingSleeper) {
        let clock = ManualClock::new();
        let sleeper = RecordingSleeper::with_clock(clock.clone());
        let gate = Arc::new(QuotaGate::with_time(
            QuotaConfig::default(),
            Arc::new(clock.clone()),
            Arc::new(sleeper.clone()),
        ));
        (gate, clock, sleeper)
    }

    // -------------------------------------------------------------------------
    // Window escalation
    // -------------------------------------------------------------------------

    #[test]
    fn test_window_escalates_and_caps() {
        let (gate, clock, _) = manual_gate();

        assert_eq!(gate.record_rate_limited(None), Duration::from_secs(60));
        clock.advance(Duration::from_secs(61));
        assert_eq!(gate.record_rate_limited(None), Duration::from_secs(120));
        clock.advance(Duration::from_secs(121));
        assert_eq!(gate.record_rate_limited(None), Duration::from_secs(240));
        clock.advance(Duration::from_secs(241));
        assert_eq!(gate.record_rate_limited(None), Duration::from_secs(300));
    }

    #[test]
    fn test_signal_inside_window_does_not_double() {
        let (gate, clock, _) = manual_gate();

        gate.record_rate_limited(None);
        clock.advance(Duration::from_secs(20));
        let joined = gate.record_rate_limited(None);

        assert_eq!(joined, Duration::from_secs(40));
        assert_eq!(gate.status().strikes, 1);
    }

    #[test]
    fn test_success_resets_escalation() {
        let (gate, clock, _) = manual_gate();

        gate.record_rate_limited(None);
        clock.advance(Duration::from_secs(61));
        gate.record_success();

        assert_eq!(gate.record_rate_limited(None), Duration::from_secs(60));
    }

    #[test]
    fn test_retry_after_hint_wins() {
        let (gate, _, _) = manual_gate();
        assert_eq!(
            gate.record_rate_limited(Some(Duration::from_secs(7))),
            Duration::from_secs(7)
        );
    }

    // -------------------------------------------------------------------------
    // Waiting
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_caller_mid_window_waits_for_remainder() {
        let (gate, clock, sleeper) = manual_gate();

        gate.record_rate_limited(None);
        clock.advance(Duration::from_secs(10));
        gate.wait_until_available(true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(sleeper.sleeps(), vec![Duration::from_secs(50)]);
        assert!(gate.remaining().is_none());
    }

    #[tokio::test]
    async fn test_non_blocking_caller_fails_fast() {
        let (gate, _, sleeper) = manual_gate();

        gate.record_rate_limited(None);
        let err = gate
            .wait_until_available(false, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            CoreError::QuotaExhausted { reset_in } => assert_eq!(reset_in, Duration::from_secs(60)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(sleeper.sleeps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_is_cancellable() {
        let gate = Arc::new(QuotaGate::new(QuotaConfig::default()));
        gate.record_rate_limited(None);

        let cancel = CancellationToken::new();
        let waiter = {
            let gate = Arc::clone(&gate);
            let cancel = cancel.clone();
            tokio::spawn(async move { gate.wait_until_available(true, &cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_window_is_free() {
        let gate = QuotaGate::new(QuotaConfig::default());
        let start = Instant::now();

        gate.wait_until_available(true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(Instant::now(), start);
    }
}
