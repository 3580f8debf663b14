//! Connection timers.
//!
//! - [`Deadline`]: the one-shot connect/operation timer. Armed with the
//!   connect timeout on connect and with the request timeout on write.
//! - [`KeepAlive`]: the periodic idle detector. Ticks every detection
//!   interval and decides whether to probe or fail an idle connection.
//!
//! Both run on the tokio clock, so tests can drive them with
//! `tokio::time::pause` and `advance`.

use crate::status::Status;
use std::future::pending;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

// ============================================================================
// Deadline
// ============================================================================

/// Optional one-shot timer.
///
/// Awaiting an unarmed deadline never completes, so it can sit in a
/// `select!` next to the I/O it guards.
#[derive(Debug, Default)]
pub struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
    armed_for: Duration,
}

impl Deadline {
    /// Create an unarmed deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm (or rearm) to fire after `duration`.
    pub fn arm(&mut self, duration: Duration) {
        self.sleep = Some(Box::pin(tokio::time::sleep(duration)));
        self.armed_for = duration;
    }

    /// Disarm. A no-op when not armed.
    pub fn cancel(&mut self) {
        self.sleep = None;
    }

    /// Check if the deadline is pending.
    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    /// Wait until the deadline fires and disarm it.
    ///
    /// Returns the duration it was armed with. Cancel safe.
    pub async fn expired(&mut self) -> Duration {
        let Some(sleep) = self.sleep.as_mut() else {
            return pending().await;
        };
        sleep.as_mut().await;
        self.sleep = None;
        self.armed_for
    }
}

// ============================================================================
// Keep-alive
// ============================================================================

/// What a keep-alive tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleCheck {
    /// Nothing to do.
    Active,
    /// Idle past the threshold; send a probe.
    Probe,
    /// Fail the connection; it has been idle for this long.
    Expired(Duration),
}

/// Periodic idle detector.
#[derive(Debug)]
pub struct KeepAlive {
    interval: Interval,
    idle_time: Duration,
    detection_interval: Duration,
    probe_sent_at: Option<Instant>,
}

impl KeepAlive {
    /// Create a detector ticking every `detection_interval`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(idle_time: Duration, detection_interval: Duration) -> Self {
        let mut interval =
            tokio::time::interval_at(Instant::now() + detection_interval, detection_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval,
            idle_time,
            detection_interval,
            probe_sent_at: None,
        }
    }

    /// Wait for the next tick. Cancel safe.
    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    /// Restart the period after activity.
    pub fn touch(&mut self) {
        self.interval.reset();
    }

    /// Idle threshold.
    pub fn idle_time(&self) -> Duration {
        self.idle_time
    }

    /// Tick period.
    pub fn detection_interval(&self) -> Duration {
        self.detection_interval
    }

    /// Check if a probe is waiting for its answer.
    pub fn is_probing(&self) -> bool {
        self.probe_sent_at.is_some()
    }

    /// Record that a probe went out at `now`.
    pub fn probe_sent(&mut self, now: Instant) {
        self.probe_sent_at = Some(now);
    }

    /// Forget the outstanding probe.
    pub fn clear_probe(&mut self) {
        self.probe_sent_at = None;
    }

    /// Decide what a tick at `now` means for a connection in `status`.
    ///
    /// `can_probe` tells whether the codec has a probe frame.
    pub fn check(
        &self,
        status: Status,
        last_activity: Instant,
        now: Instant,
        can_probe: bool,
    ) -> IdleCheck {
        let idle = now.saturating_duration_since(last_activity);
        match status {
            Status::Free => match self.probe_sent_at {
                Some(sent) if now.saturating_duration_since(sent) >= self.detection_interval => {
                    IdleCheck::Expired(idle)
                }
                Some(_) => IdleCheck::Active,
                None if idle < self.idle_time => IdleCheck::Active,
                None if can_probe => IdleCheck::Probe,
                None => IdleCheck::Expired(idle),
            },
            // The in-flight request doubles as the probe.
            Status::Writing | Status::Waiting => {
                if idle >= self.idle_time + self.detection_interval {
                    IdleCheck::Expired(idle)
                } else {
                    IdleCheck::Active
                }
            }
            Status::Undefined | Status::Connecting | Status::ConnectFailed | Status::Stopped => {
                IdleCheck::Active
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDLE: Duration = Duration::from_secs(60);
    const TICK: Duration = Duration::from_secs(10);

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_secs(5));
        assert!(deadline.is_armed());

        let start = Instant::now();
        let armed_for = deadline.expired().await;
        assert_eq!(armed_for, Duration::from_secs(5));
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(!deadline.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unarmed_deadline_pends() {
        let mut deadline = Deadline::new();
        let fired = tokio::time::timeout(Duration::from_secs(3600), deadline.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadline_pends() {
        let mut deadline = Deadline::new();
        deadline.arm(Duration::from_millis(10));
        deadline.cancel();
        let fired = tokio::time::timeout(Duration::from_secs(1), deadline.expired()).await;
        assert!(fired.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_ticks_each_interval() {
        let mut keepalive = KeepAlive::new(IDLE, TICK);
        let start = Instant::now();
        let first = keepalive.tick().await;
        assert_eq!(first - start, TICK);
        let second = keepalive.tick().await;
        assert_eq!(second - first, TICK);
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_postpones_tick() {
        let mut keepalive = KeepAlive::new(IDLE, TICK);
        let start = Instant::now();
        tokio::time::advance(Duration::from_secs(7)).await;
        keepalive.touch();
        let tick = keepalive.tick().await;
        assert_eq!(tick - start, Duration::from_secs(17));
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_probe_then_expire() {
        let mut keepalive = KeepAlive::new(IDLE, TICK);
        let last = Instant::now();

        let now = last + Duration::from_secs(30);
        assert_eq!(keepalive.check(Status::Free, last, now, true), IdleCheck::Active);

        let now = last + IDLE;
        assert_eq!(keepalive.check(Status::Free, last, now, true), IdleCheck::Probe);
        keepalive.probe_sent(now);

        let later = now + Duration::from_secs(5);
        assert_eq!(keepalive.check(Status::Free, last, later, true), IdleCheck::Active);

        let later = now + TICK;
        assert_eq!(
            keepalive.check(Status::Free, last, later, true),
            IdleCheck::Expired(IDLE + TICK)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_free_without_probe_expires() {
        let keepalive = KeepAlive::new(IDLE, TICK);
        let last = Instant::now();
        assert_eq!(
            keepalive.check(Status::Free, last, last + IDLE, false),
            IdleCheck::Expired(IDLE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_grace_period() {
        let keepalive = KeepAlive::new(IDLE, TICK);
        let last = Instant::now();
        assert_eq!(
            keepalive.check(Status::Waiting, last, last + IDLE, true),
            IdleCheck::Active
        );
        assert_eq!(
            keepalive.check(Status::Writing, last, last + IDLE + TICK, true),
            IdleCheck::Expired(IDLE + TICK)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignored_without_socket() {
        let keepalive = KeepAlive::new(IDLE, TICK);
        let last = Instant::now();
        let now = last + Duration::from_secs(3600);
        for status in [Status::Undefined, Status::Connecting, Status::ConnectFailed, Status::Stopped] {
            assert_eq!(keepalive.check(status, last, now, true), IdleCheck::Active);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_probe() {
        let mut keepalive = KeepAlive::new(IDLE, TICK);
        keepalive.probe_sent(Instant::now());
        assert!(keepalive.is_probing());
        keepalive.clear_probe();
        assert!(!keepalive.is_probing());
    }
}
