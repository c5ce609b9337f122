//! # Worker Availability
//!
//! A worker is always in exactly one of three states:
//!
//! ```text
//!            try_acquire               release (no break due)
//!   Idle ─────────────────▶ Busy ─────────────────────────▶ Idle
//!    ▲                       │
//!    │                       │ release (break due)
//!    │     break timer       ▼
//!    └──────────────────── OnBreak ◀──── break due while Idle
//! ```
//!
//! Breaks come from two places: the periodic schedule of a [`BreakPolicy`] and explicit
//! [`request_break`](WorkerAvailability::request_break) calls (a smoke after an item, a
//! cooldown after a capacity rejection). A break that comes due while the worker is
//! `Busy` is recorded and starts the moment the current item is released. An item is
//! never interrupted.
//!
//! The state lives behind a short `std::sync::Mutex`. Each transition is one critical
//! section, so concurrent `try_acquire` calls admit exactly one caller. Time is read from
//! `tokio::time`, so tests can drive breaks with a paused clock.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Idle,
    Busy,
    OnBreak,
}

impl std::fmt::Display for Availability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Availability::Idle => write!(f, "idle"),
            Availability::Busy => write!(f, "busy"),
            Availability::OnBreak => write!(f, "on break"),
        }
    }
}

/// How long a break lasts: `base`, stretched by `extension_factor` with
/// probability `extension_probability`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakDraw {
    pub base: Duration,
    pub extension_probability: f64,
    pub extension_factor: f64,
}

/// One drawn break duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakLength {
    pub duration: Duration,
    pub extended: bool,
}

impl BreakDraw {
    pub fn fixed(base: Duration) -> Self {
        Self {
            base,
            extension_probability: 0.0,
            extension_factor: 1.0,
        }
    }

    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> BreakLength {
        let p = self.extension_probability;
        let extended = if p.is_nan() || p <= 0.0 {
            false
        } else if p >= 1.0 {
            true
        } else {
            rng.gen_bool(p)
        };
        if !extended {
            return BreakLength {
                duration: self.base,
                extended,
            };
        }
        BreakLength {
            duration: scale_saturating(self.base, self.extension_factor),
            extended,
        }
    }
}

/// `base * factor`, clamped to `[0, Duration::MAX]`.
///
/// The result can be too long to add to an [`Instant`]; see [`deadline_after`].
pub fn scale_saturating(base: Duration, factor: f64) -> Duration {
    if factor.is_nan() || factor <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// The instant `delay` from now, or `None` when that lies beyond what the clock can
/// represent. A `None` deadline never fires.
pub fn deadline_after(delay: Duration) -> Option<Instant> {
    Instant::now().checked_add(delay)
}

/// Periodic break schedule. Without a `period` the worker only takes requested breaks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakPolicy {
    pub period: Option<Duration>,
    pub draw: BreakDraw,
}

impl BreakPolicy {
    pub fn never() -> Self {
        Self {
            period: None,
            draw: BreakDraw::fixed(Duration::ZERO),
        }
    }

    pub fn every(period: Duration, draw: BreakDraw) -> Self {
        Self {
            period: Some(period),
            draw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakKind {
    /// From the periodic schedule; its length is drawn from the policy.
    Scheduled,
    /// Asked for explicitly, with a fixed length.
    Requested(Duration),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BreakStats {
    pub breaks_taken: u64,
    pub extended_breaks: u64,
    pub deferred_breaks: u64,
    pub total_break_time: Duration,
}

#[derive(Debug)]
struct WorkerState {
    availability: Availability,
    break_due: Option<BreakKind>,
    current_item: Option<String>,
    current_break: Option<BreakKind>,
    next_break_at: Option<Instant>,
    break_ends_at: Option<Instant>,
    since: Instant,
    /// Start of the current uninterrupted stretch of breaks.
    on_break_since: Option<Instant>,
    stats: BreakStats,
}

/// Shared availability of one worker.
#[derive(Debug)]
pub struct WorkerAvailability {
    name: String,
    policy: BreakPolicy,
    state: Mutex<WorkerState>,
    rng: Mutex<StdRng>,
    status_tx: watch::Sender<Availability>,
    wake: Notify,
}

impl WorkerAvailability {
    pub fn new(name: impl Into<String>, policy: BreakPolicy) -> Arc<Self> {
        Self::with_rng(name, policy, StdRng::from_entropy())
    }

    /// Same as [`new`](Self::new) with a deterministic random source.
    pub fn with_rng(name: impl Into<String>, policy: BreakPolicy, rng: StdRng) -> Arc<Self> {
        let (status_tx, _) = watch::channel(Availability::Idle);
        let now = Instant::now();
        Arc::new(Self {
            name: name.into(),
            policy,
            state: Mutex::new(WorkerState {
                availability: Availability::Idle,
                break_due: None,
                current_item: None,
                current_break: None,
                next_break_at: policy.period.and_then(|period| now.checked_add(period)),
                break_ends_at: None,
                since: now,
                on_break_since: None,
                stats: BreakStats::default(),
            }),
            rng: Mutex::new(rng),
            status_tx,
            wake: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> Availability {
        self.lock().availability
    }

    pub fn is_break_due(&self) -> bool {
        self.lock().break_due.is_some()
    }

    pub fn current_item(&self) -> Option<String> {
        self.lock().current_item.clone()
    }

    pub fn stats(&self) -> BreakStats {
        self.lock().stats
    }

    /// How long the worker has been on break, if it is on one. Breaks that follow
    /// each other without the worker becoming available count as one.
    pub fn on_break_for(&self) -> Option<Duration> {
        self.lock().on_break_since.map(|since| since.elapsed())
    }

    /// Watches availability transitions.
    pub fn subscribe(&self) -> watch::Receiver<Availability> {
        self.status_tx.subscribe()
    }

    /// A short human-readable description of what the worker is doing.
    pub fn describe(&self) -> String {
        let state = self.lock();
        match (state.availability, state.current_item.as_deref()) {
            (Availability::OnBreak, _) => "on break".to_string(),
            (Availability::Busy, Some(item)) if state.break_due.is_some() => {
                format!("working on {item}, break due after it")
            }
            (Availability::Busy, Some(item)) => format!("working on {item}"),
            (Availability::Busy, None) => "working".to_string(),
            (Availability::Idle, _) => "idle".to_string(),
        }
    }

    /// Moves `Idle -> Busy` and returns true. Any other state is left unchanged.
    pub fn try_acquire(&self, item: impl Into<String>) -> bool {
        let mut state = self.lock();
        if state.availability != Availability::Idle {
            debug!(worker = %self.name, status = %state.availability, "Acquire refused");
            return false;
        }
        let item = item.into();
        debug!(worker = %self.name, %item, "Acquired");
        state.current_item = Some(item);
        self.transition(&mut state, Availability::Busy);
        true
    }

    /// Like [`try_acquire`](Self::try_acquire), returning a guard that releases on drop.
    pub fn acquire(self: &Arc<Self>, item: impl Into<String>) -> Option<BusyGuard> {
        self.try_acquire(item).then(|| BusyGuard {
            availability: Arc::clone(self),
        })
    }

    /// Moves `Busy -> Idle`, or straight into a break that came due during the item.
    ///
    /// Releasing a worker that is not busy is a caller bug; it is logged and ignored.
    pub fn release(&self) {
        let mut state = self.lock();
        if state.availability != Availability::Busy {
            let status = state.availability;
            drop(state);
            error!(worker = %self.name, %status, "Release without acquire");
            debug_assert!(false, "release without acquire while {status}");
            return;
        }
        let item = state.current_item.take();
        debug!(worker = %self.name, item = ?item, "Released");
        match state.break_due.take() {
            Some(kind) => self.start_break(&mut state, kind),
            None => self.transition(&mut state, Availability::Idle),
        }
    }

    /// Arms the periodic break timer to fire after `delay`.
    pub fn schedule_break(&self, delay: Duration) {
        let mut state = self.lock();
        state.next_break_at = deadline_after(delay);
        drop(state);
        self.wake.notify_one();
    }

    /// Takes a break of `duration` now if idle, or as soon as the current item ends.
    ///
    /// While already on break the request is ignored.
    pub fn request_break(&self, duration: Duration) {
        let mut state = self.lock();
        match state.availability {
            Availability::Idle => self.start_break(&mut state, BreakKind::Requested(duration)),
            Availability::Busy => {
                let merged = match state.break_due {
                    Some(BreakKind::Requested(existing)) => BreakKind::Requested(existing.max(duration)),
                    Some(BreakKind::Scheduled) => BreakKind::Scheduled,
                    None => BreakKind::Requested(duration),
                };
                state.break_due = Some(merged);
                debug!(worker = %self.name, ?duration, "Break requested while busy, deferred");
            }
            Availability::OnBreak => {
                debug!(worker = %self.name, ?duration, "Already on break, request ignored");
            }
        }
    }

    /// Called when the periodic break timer fires.
    pub fn break_timer_expired(&self) {
        let mut state = self.lock();
        state.next_break_at = None;
        match state.availability {
            Availability::Idle => self.start_break(&mut state, BreakKind::Scheduled),
            Availability::Busy => {
                state.break_due = Some(BreakKind::Scheduled);
                state.stats.deferred_breaks += 1;
                info!(
                    worker = %self.name,
                    item = ?state.current_item,
                    "Break due, deferred until current work is released"
                );
            }
            Availability::OnBreak => {
                state.break_due = Some(BreakKind::Scheduled);
                debug!(worker = %self.name, "Break due while on break, queued");
            }
        }
    }

    /// Called when the current break's duration has elapsed.
    pub fn end_break(&self) {
        let mut state = self.lock();
        if state.availability != Availability::OnBreak {
            return;
        }
        let elapsed = state.since.elapsed();
        state.stats.total_break_time = state.stats.total_break_time.saturating_add(elapsed);
        state.break_ends_at = None;
        let finished = state.current_break.take();
        info!(worker = %self.name, ?elapsed, "Break finished");

        if finished == Some(BreakKind::Scheduled) && state.next_break_at.is_none() {
            state.next_break_at = self.policy.period.and_then(deadline_after);
        }
        match state.break_due.take() {
            Some(kind) => self.start_break(&mut state, kind),
            None => self.transition(&mut state, Availability::Idle),
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Resolves once the worker is not on break. Returns false if cancelled first.
    pub async fn wait_until_available(&self, cancel: &CancellationToken) -> bool {
        let mut status = self.subscribe();
        loop {
            if *status.borrow_and_update() != Availability::OnBreak {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                changed = status.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    /// Spawns the task that fires periodic breaks and ends breaks on time.
    pub fn spawn_break_timer(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let availability = Arc::clone(self);
        tokio::spawn(async move { availability.run_break_timer(cancel).await })
    }

    async fn run_break_timer(&self, cancel: CancellationToken) {
        info!(worker = %self.name, period = ?self.policy.period, "Break timer started");
        loop {
            let woken = self.wake.notified();
            let (next_break_at, break_ends_at) = {
                let state = self.lock();
                (state.next_break_at, state.break_ends_at)
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep_until_some(break_ends_at) => self.end_break(),
                _ = sleep_until_some(next_break_at) => self.break_timer_expired(),
                _ = woken => {}
            }
        }
        info!(worker = %self.name, "Break timer stopped");
    }

    fn start_break(&self, state: &mut WorkerState, kind: BreakKind) {
        let length = match kind {
            BreakKind::Scheduled => {
                let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                self.policy.draw.draw(&mut *rng)
            }
            BreakKind::Requested(duration) => BreakLength {
                duration,
                extended: false,
            },
        };
        state.break_due = None;
        state.current_break = Some(kind);
        state.break_ends_at = deadline_after(length.duration);
        if state.break_ends_at.is_none() {
            warn!(worker = %self.name, duration = ?length.duration, "Break too long to schedule an end");
        }
        state.stats.breaks_taken += 1;
        if length.extended {
            state.stats.extended_breaks += 1;
        }
        info!(
            worker = %self.name,
            duration = ?length.duration,
            extended = length.extended,
            scheduled = kind == BreakKind::Scheduled,
            "Break started"
        );
        self.transition(state, Availability::OnBreak);
        self.wake.notify_one();
    }

    fn transition(&self, state: &mut WorkerState, next: Availability) {
        let now = Instant::now();
        state.on_break_since = match next {
            Availability::OnBreak => Some(state.on_break_since.unwrap_or(now)),
            Availability::Idle | Availability::Busy => None,
        };
        state.availability = next;
        state.since = now;
        self.status_tx.send_replace(next);
    }

    fn lock(&self) -> MutexGuard<'_, WorkerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Keeps a worker `Busy` for as long as it lives.
#[derive(Debug)]
pub struct BusyGuard {
    availability: Arc<WorkerAvailability>,
}

impl BusyGuard {
    pub fn availability(&self) -> &Arc<WorkerAvailability> {
        &self.availability
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.availability.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(policy: BreakPolicy) -> Arc<WorkerAvailability> {
        WorkerAvailability::with_rng("test", policy, StdRng::seed_from_u64(7))
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let w = worker(BreakPolicy::never());
        assert!(w.try_acquire("order_1"));
        assert_eq!(w.status(), Availability::Busy);
        assert_eq!(w.describe(), "working on order_1");
        assert!(!w.try_acquire("order_2"));
        w.release();
        assert_eq!(w.status(), Availability::Idle);
        assert_eq!(w.current_item(), None);
    }

    #[tokio::test]
    async fn break_due_while_busy_is_deferred_until_release() {
        let w = worker(BreakPolicy::every(Duration::from_secs(60), BreakDraw::fixed(Duration::from_secs(5))));
        assert!(w.try_acquire("order_1"));
        w.break_timer_expired();
        assert_eq!(w.status(), Availability::Busy);
        assert!(w.is_break_due());
        assert_eq!(w.describe(), "working on order_1, break due after it");

        w.release();
        assert_eq!(w.status(), Availability::OnBreak);
        assert_eq!(w.stats().deferred_breaks, 1);
        assert!(!w.try_acquire("order_2"));
    }

    #[tokio::test]
    async fn requested_break_while_idle_starts_immediately() {
        let w = worker(BreakPolicy::never());
        w.request_break(Duration::from_secs(1));
        assert_eq!(w.status(), Availability::OnBreak);
        w.end_break();
        assert_eq!(w.status(), Availability::Idle);
        assert_eq!(w.stats().breaks_taken, 1);
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let w = worker(BreakPolicy::never());
        {
            let _guard = w.acquire("order_1").expect("idle worker");
            assert_eq!(w.status(), Availability::Busy);
        }
        assert_eq!(w.status(), Availability::Idle);
    }

    #[tokio::test]
    #[cfg_attr(debug_assertions, should_panic(expected = "release without acquire"))]
    async fn release_while_idle_is_ignored() {
        let w = worker(BreakPolicy::never());
        w.release();
        assert_eq!(w.status(), Availability::Idle);
    }

    #[test]
    fn draw_extends_with_certainty() {
        let draw = BreakDraw {
            base: Duration::from_secs(10),
            extension_probability: 1.0,
            extension_factor: 2.5,
        };
        let length = draw.draw(&mut StdRng::seed_from_u64(1));
        assert!(length.extended);
        assert_eq!(length.duration, Duration::from_secs(25));

        let never = BreakDraw { extension_probability: 0.0, ..draw };
        assert_eq!(never.draw(&mut StdRng::seed_from_u64(1)).duration, Duration::from_secs(10));
    }

    #[test]
    fn huge_factor_saturates() {
        assert_eq!(scale_saturating(Duration::from_secs(u64::MAX / 2), 1e12), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_runs_periodic_breaks() {
        let w = worker(BreakPolicy::every(Duration::from_secs(10), BreakDraw::fixed(Duration::from_secs(3))));
        let cancel = CancellationToken::new();
        let handle = w.spawn_break_timer(cancel.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(w.status(), Availability::OnBreak);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(w.status(), Availability::Idle);
        assert_eq!(w.stats().breaks_taken, 1);

        // Re-armed after the break ended.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(w.status(), Availability::OnBreak);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn wait_until_available_resolves_after_break() {
        let w = worker(BreakPolicy::never());
        let cancel = CancellationToken::new();
        let _timer = w.spawn_break_timer(cancel.clone());

        w.request_break(Duration::from_secs(5));
        let started = Instant::now();
        assert!(w.wait_until_available(&cancel).await);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(w.status(), Availability::Idle);
        cancel.cancel();
    }

    #[tokio::test]
    async fn wait_until_available_honours_cancellation() {
        let w = worker(BreakPolicy::never());
        w.request_break(Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!w.wait_until_available(&cancel).await);
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_break_waits_for_release() {
        let w = worker(BreakPolicy {
            period: None,
            draw: BreakDraw::fixed(Duration::from_secs(2)),
        });
        let cancel = CancellationToken::new();
        let timer = w.spawn_break_timer(cancel.clone());

        assert!(w.try_acquire("order_1"));
        w.schedule_break(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(w.status(), Availability::Busy);
        assert!(w.is_break_due());

        w.release();
        assert_eq!(w.status(), Availability::OnBreak);
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(w.status(), Availability::Idle);
        assert_eq!(w.stats().deferred_breaks, 1);

        cancel.cancel();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn break_too_long_for_the_clock_does_not_end() {
        let w = worker(BreakPolicy {
            period: None,
            draw: BreakDraw {
                base: Duration::from_secs(2),
                extension_probability: 1.0,
                extension_factor: 1e300,
            },
        });
        let cancel = CancellationToken::new();
        let timer = w.spawn_break_timer(cancel.clone());

        w.break_timer_expired();
        assert_eq!(w.status(), Availability::OnBreak);
        assert_eq!(w.stats().extended_breaks, 1);

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(w.status(), Availability::OnBreak);
        assert!(!timer.is_finished());

        let other = worker(BreakPolicy::never());
        other.request_break(Duration::MAX);
        assert_eq!(other.status(), Availability::OnBreak);

        cancel.cancel();
        timer.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn chained_breaks_count_as_one_stretch() {
        let w = worker(BreakPolicy::every(Duration::from_secs(3600), BreakDraw::fixed(Duration::from_secs(10))));
        let cancel = CancellationToken::new();
        let timer = w.spawn_break_timer(cancel.clone());

        w.request_break(Duration::from_secs(5));
        tokio::time::sleep(Duration::from_secs(1)).await;
        w.break_timer_expired();

        // The requested break ends at 5s and the queued nap follows straight away.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(w.status(), Availability::OnBreak);
        assert_eq!(w.stats().breaks_taken, 2);
        assert!(w.on_break_for().expect("on break") >= Duration::from_secs(7));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(w.status(), Availability::Idle);
        assert_eq!(w.on_break_for(), None);

        cancel.cancel();
        timer.await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquire_admits_one() {
        let w = worker(BreakPolicy::never());
        let mut handles = Vec::new();
        for i in 0..16 {
            let w = w.clone();
            handles.push(tokio::spawn(async move { w.try_acquire(format!("order_{i}")) }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
