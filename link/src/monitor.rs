//! Connection liveness and reconnection.
//!
//! The [`Monitor`] listens to its cable's events. While connected it polls
//! for stale connections (no ping within `max_missing_pings` intervals);
//! after an unexpected disconnect it schedules reconnect attempts with the
//! configured [`ReconnectStrategy`] and gives up by closing the cable once
//! `max_reconnect_attempts` is reached.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cable::{CableEvent, CableEventKind};
use crate::error::{CableError, Result};
use crate::events::{Event, EventBus, Unbind};
use crate::logger::Logger;
use crate::models::{BackoffOptions, MonitorOptions};
use crate::sync::{lock, spawn};

/// Delay before reconnect attempt `n` (0-based).
pub type ReconnectStrategy = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff with jitter.
///
/// Attempt `n` waits a random delay in `[interval * rate^n, interval *
/// rate^(n+1)]`, stretched by up to `2 * jitter_ratio` and capped at
/// `max_interval_ms`. With the defaults attempt 0 waits 1 to 4 seconds.
pub fn backoff_with_jitter(interval: Duration, options: BackoffOptions) -> ReconnectStrategy {
    Arc::new(move |attempts: u32| {
        let mut rng = rand::rng();
        let rate = options.backoff_rate.max(1.0);
        let left = interval.as_secs_f64() * rate.powi(attempts.min(i32::MAX as u32) as i32);
        let right = left * rate;

        let mut delay = if right > left { rng.random_range(left..=right) } else { left };
        let jitter = options.jitter_ratio.max(0.0);
        if jitter > 0.0 {
            delay *= 1.0 + rng.random_range(0.0..=2.0 * jitter);
        }
        if let Some(max_ms) = options.max_interval_ms {
            delay = delay.min(max_ms as f64 / 1000.0);
        }
        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    })
}

/// What the monitor needs from its cable.
pub trait MonitorTarget: Send + Sync {
    fn events(&self) -> &EventBus<CableEvent>;

    fn connect(&self) -> BoxFuture<'static, Result<()>>;

    /// Treat the connection as lost.
    fn disconnected(&self, err: CableError);

    /// Give up: close for good.
    fn close(&self, err: CableError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    PendingConnect,
    Connected,
    PendingDisconnect,
    PendingReconnect,
    Disconnected,
}

struct MonitorCore {
    state: MonitorState,
    attempts: u32,
    pinged_at: Instant,
    disconnected_at: Option<Instant>,
    poll: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    target: Option<Weak<dyn MonitorTarget>>,
    unbind: Option<Unbind>,
}

impl MonitorCore {
    fn cancel_poll(&mut self) {
        if let Some(task) = self.poll.take() {
            task.abort();
        }
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }
}

struct MonitorInner {
    ping_interval: Duration,
    max_missing_pings: u32,
    max_reconnect_attempts: Option<u32>,
    strategy: ReconnectStrategy,
    core: Mutex<MonitorCore>,
    logger: Logger,
}

#[derive(Clone)]
pub struct Monitor {
    inner: Arc<MonitorInner>,
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = lock(&self.inner.core);
        f.debug_struct("Monitor")
            .field("state", &core.state)
            .field("attempts", &core.attempts)
            .finish()
    }
}

impl Monitor {
    pub fn new(options: &MonitorOptions, logger: Logger) -> Self {
        let strategy = options.reconnect_strategy.clone().unwrap_or_else(|| {
            backoff_with_jitter(
                Duration::from_millis(options.base_reconnect_interval_ms),
                options.backoff,
            )
        });
        Self {
            inner: Arc::new(MonitorInner {
                ping_interval: Duration::from_millis(options.ping_interval_ms),
                max_missing_pings: options.max_missing_pings,
                max_reconnect_attempts: options.max_reconnect_attempts,
                strategy,
                core: Mutex::new(MonitorCore {
                    state: MonitorState::PendingConnect,
                    attempts: 0,
                    pinged_at: Instant::now(),
                    disconnected_at: None,
                    poll: None,
                    reconnect: None,
                    target: None,
                    unbind: None,
                }),
                logger,
            }),
        }
    }

    /// Start following `target`'s events. Replaces any previous target.
    pub fn watch(&self, target: Weak<dyn MonitorTarget>) {
        let Some(strong) = target.upgrade() else {
            return;
        };
        let monitor = Arc::downgrade(&self.inner);
        let unbind = strong.events().on_any(move |event| {
            if let Some(monitor) = monitor.upgrade() {
                monitor.handle(event);
            }
        });

        let previous = {
            let mut core = lock(&self.inner.core);
            core.target = Some(target);
            core.unbind.replace(unbind)
        };
        if let Some(previous) = previous {
            previous.unbind();
        }
    }

    pub fn state(&self) -> MonitorState {
        lock(&self.inner.core).state
    }

    pub fn attempts(&self) -> u32 {
        lock(&self.inner.core).attempts
    }

    /// Time since the connection was lost, while not connected.
    pub fn disconnected_for(&self) -> Option<Duration> {
        lock(&self.inner.core).disconnected_at.map(|at| at.elapsed())
    }

    /// Reconnect immediately instead of waiting for the scheduled attempt.
    ///
    /// Returns `false` when connected, already connecting or closed for good.
    pub fn reconnect_now(&self) -> bool {
        let target = {
            let mut core = lock(&self.inner.core);
            if matches!(
                core.state,
                MonitorState::Connected | MonitorState::PendingConnect | MonitorState::Disconnected
            ) {
                return false;
            }
            core.cancel_reconnect();
            core.state = MonitorState::PendingConnect;
            core.target.as_ref().and_then(Weak::upgrade)
        };
        match target {
            Some(target) => {
                self.inner.logger.info(format_args!("reconnecting now"));
                self.inner.spawn_connect(target);
                true
            },
            None => false,
        }
    }

    /// Stop watching and cancel every timer.
    pub fn dispose(&self) {
        let unbind = {
            let mut core = lock(&self.inner.core);
            core.cancel_poll();
            core.cancel_reconnect();
            core.state = MonitorState::Disconnected;
            core.target = None;
            core.unbind.take()
        };
        if let Some(unbind) = unbind {
            unbind.unbind();
        }
    }
}

impl MonitorInner {
    fn handle(self: &Arc<Self>, event: &CableEvent) {
        match event.kind() {
            CableEventKind::Connect => self.connected(),
            CableEventKind::Keepalive => lock(&self.core).pinged_at = Instant::now(),
            CableEventKind::Disconnect => self.disconnected(),
            CableEventKind::Close => {
                let mut core = lock(&self.core);
                core.cancel_poll();
                core.cancel_reconnect();
                core.state = MonitorState::Disconnected;
            },
            CableEventKind::Info => {},
        }
    }

    fn connected(self: &Arc<Self>) {
        let mut core = lock(&self.core);
        core.cancel_reconnect();
        core.cancel_poll();
        core.state = MonitorState::Connected;
        core.attempts = 0;
        core.pinged_at = Instant::now();
        core.disconnected_at = None;
        core.poll = self.start_polling();
        self.logger.debug(format_args!("monitor: connected"));
    }

    fn start_polling(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.ping_interval.is_zero() {
            return None;
        }
        let monitor = Arc::downgrade(self);
        let interval = self.ping_interval;
        spawn(async move {
            loop {
                tokio::time::sleep(poll_interval(interval)).await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                if !monitor.check_stale() {
                    break;
                }
            }
        })
    }

    /// Returns whether polling should continue.
    fn check_stale(&self) -> bool {
        let target = {
            let mut core = lock(&self.core);
            if core.state != MonitorState::Connected {
                return false;
            }
            let threshold = self.ping_interval * self.max_missing_pings;
            if core.pinged_at.elapsed() <= threshold {
                return true;
            }
            core.state = MonitorState::PendingDisconnect;
            core.poll = None;
            core.target.as_ref().and_then(Weak::upgrade)
        };

        self.logger.warn(format_args!(
            "stale connection: no pings for more than {} intervals",
            self.max_missing_pings
        ));
        if let Some(target) = target {
            target.disconnected(CableError::StaleConnection);
        }
        false
    }

    fn disconnected(self: &Arc<Self>) {
        let give_up = {
            let mut core = lock(&self.core);
            if core.state == MonitorState::Disconnected {
                return;
            }
            core.cancel_poll();
            core.cancel_reconnect();
            if core.disconnected_at.is_none() {
                core.disconnected_at = Some(Instant::now());
            }

            let exhausted = self
                .max_reconnect_attempts
                .is_some_and(|max| core.attempts >= max);
            if exhausted {
                core.state = MonitorState::Disconnected;
                core.target.as_ref().and_then(Weak::upgrade)
            } else {
                let delay = (self.strategy)(core.attempts);
                core.attempts += 1;
                core.state = MonitorState::PendingReconnect;
                self.logger.info(format_args!(
                    "reconnecting in {:?} (attempt {})",
                    delay, core.attempts
                ));
                let monitor = Arc::downgrade(self);
                core.reconnect = spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(monitor) = monitor.upgrade() {
                        monitor.reconnect_due();
                    }
                });
                None
            }
        };

        if let Some(target) = give_up {
            self.logger.warn(format_args!("max reconnect attempts reached, closing"));
            // Not from inside the cable's own Disconnect emit.
            spawn(async move {
                target.close(CableError::disconnected("max_reconnect_attempts"));
            });
        }
    }

    fn reconnect_due(&self) {
        let target = {
            let mut core = lock(&self.core);
            if core.state != MonitorState::PendingReconnect {
                return;
            }
            core.state = MonitorState::PendingConnect;
            core.reconnect = None;
            core.target.as_ref().and_then(Weak::upgrade)
        };
        if let Some(target) = target {
            self.spawn_connect(target);
        }
    }

    fn spawn_connect(&self, target: Arc<dyn MonitorTarget>) {
        let logger = self.logger;
        let connect = target.connect();
        spawn(async move {
            if let Err(err) = connect.await {
                logger.debug(format_args!("reconnect failed: {}", err));
            }
        });
    }
}

/// `interval` +/- 25%.
fn poll_interval(interval: Duration) -> Duration {
    let factor = 1.0 + (rand::rng().random::<f64>() - 0.5) * 0.5;
    interval.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures_util::FutureExt;

    use super::*;
    use crate::events::ConnectInfo;

    struct FakeCable {
        events: EventBus<CableEvent>,
        connects: AtomicUsize,
        disconnects: Mutex<Vec<CableError>>,
        closes: Mutex<Vec<CableError>>,
    }

    impl FakeCable {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: EventBus::new(),
                connects: AtomicUsize::new(0),
                disconnects: Mutex::new(Vec::new()),
                closes: Mutex::new(Vec::new()),
            })
        }
    }

    impl MonitorTarget for FakeCable {
        fn events(&self) -> &EventBus<CableEvent> {
            &self.events
        }

        fn connect(&self) -> BoxFuture<'static, Result<()>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }.boxed()
        }

        fn disconnected(&self, err: CableError) {
            lock(&self.disconnects).push(err.clone());
            self.events.emit(&CableEvent::Disconnect(err));
        }

        fn close(&self, err: CableError) {
            lock(&self.closes).push(err.clone());
            self.events.emit(&CableEvent::Close(Some(err)));
        }
    }

    fn fixed(ms: u64) -> ReconnectStrategy {
        Arc::new(move |_| Duration::from_millis(ms))
    }

    fn watch(options: MonitorOptions) -> (Monitor, Arc<FakeCable>) {
        let cable = FakeCable::new();
        let monitor = Monitor::new(&options, Logger::default());
        let target: Arc<dyn MonitorTarget> = cable.clone();
        monitor.watch(Arc::downgrade(&target));
        (monitor, cable)
    }

    fn connect_event() -> CableEvent {
        CableEvent::Connect(ConnectInfo::default())
    }

    #[test]
    fn test_backoff_bounds_for_first_attempt() {
        let strategy = backoff_with_jitter(Duration::from_secs(1), BackoffOptions::default());
        for _ in 0..1000 {
            let delay = strategy(0);
            assert!(delay >= Duration::from_millis(1000), "{:?}", delay);
            assert!(delay <= Duration::from_millis(4000), "{:?}", delay);
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let options = BackoffOptions {
            max_interval_ms: Some(10_000),
            ..BackoffOptions::default()
        };
        let strategy = backoff_with_jitter(Duration::from_secs(1), options);
        for _ in 0..100 {
            assert!(strategy(2) >= Duration::from_secs(4));
            assert!(strategy(20) <= Duration::from_secs(10));
        }
    }

    #[test]
    fn test_backoff_without_jitter_stays_within_rate_window() {
        let options = BackoffOptions {
            jitter_ratio: 0.0,
            ..BackoffOptions::default()
        };
        let strategy = backoff_with_jitter(Duration::from_millis(500), options);
        for _ in 0..100 {
            let delay = strategy(1);
            assert!(delay >= Duration::from_millis(1000) && delay <= Duration::from_millis(2000));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_schedules_reconnect() {
        let (monitor, cable) = watch(MonitorOptions::new().with_reconnect_strategy(fixed(100)));
        cable.events.emit(&connect_event());
        assert_eq!(monitor.state(), MonitorState::Connected);

        cable.events.emit(&CableEvent::Disconnect(CableError::disconnected("blip")));
        assert_eq!(monitor.state(), MonitorState::PendingReconnect);
        assert_eq!(monitor.attempts(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cable.connects.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), MonitorState::PendingConnect);

        cable.events.emit(&connect_event());
        assert_eq!(monitor.attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connection_forces_disconnect() {
        let options = MonitorOptions::new()
            .with_ping_interval_ms(1000)
            .with_max_missing_pings(2)
            .with_reconnect_strategy(fixed(60_000));
        let (monitor, cable) = watch(options);
        cable.events.emit(&connect_event());

        // Pings keep the connection alive.
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(900)).await;
            cable.events.emit(&CableEvent::Keepalive(None));
        }
        assert!(lock(&cable.disconnects).is_empty());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(*lock(&cable.disconnects), vec![CableError::StaleConnection]);
        assert_eq!(monitor.state(), MonitorState::PendingReconnect);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let options = MonitorOptions::new()
            .with_max_reconnect_attempts(Some(2))
            .with_reconnect_strategy(fixed(10));
        let (monitor, cable) = watch(options);
        cable.events.emit(&connect_event());

        for _ in 0..2 {
            cable.events.emit(&CableEvent::Disconnect(CableError::disconnected("down")));
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(cable.connects.load(Ordering::SeqCst), 2);

        cable.events.emit(&CableEvent::Disconnect(CableError::disconnected("down")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(lock(&cable.closes).len(), 1);
        assert_eq!(monitor.state(), MonitorState::Disconnected);
        assert_eq!(cable.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_reconnect() {
        let (monitor, cable) = watch(MonitorOptions::new().with_reconnect_strategy(fixed(100)));
        cable.events.emit(&connect_event());
        cable.events.emit(&CableEvent::Disconnect(CableError::disconnected("blip")));
        cable.events.emit(&CableEvent::Close(None));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(cable.connects.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state(), MonitorState::Disconnected);
        assert!(!monitor.reconnect_now());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_now_skips_the_wait() {
        let (monitor, cable) = watch(MonitorOptions::new().with_reconnect_strategy(fixed(60_000)));
        assert!(!monitor.reconnect_now(), "mid-connect");

        cable.events.emit(&connect_event());
        assert!(!monitor.reconnect_now(), "connected");

        cable.events.emit(&CableEvent::Disconnect(CableError::disconnected("blip")));
        assert!(monitor.reconnect_now());
        tokio::task::yield_now().await;
        assert_eq!(cable.connects.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), MonitorState::PendingConnect);
    }
}
