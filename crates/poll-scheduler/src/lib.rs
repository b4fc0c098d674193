mod schedule;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use protocol::encode_request;
use types::{AddressBook, PollTarget};
use udp_transport::Transport;

pub use schedule::{default_rotation, effective_interval, QueryMessage, ScheduleState, TickPlan};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Hard lower bound on the poll period.
    pub floor: Duration,
    /// Period used when no device declares a usable interval.
    pub default_interval: Duration,
    pub jitter_ms: u64,
    /// Pause between consecutive sends within one tick.
    pub inter_send_delay: Duration,
    pub rotation: Vec<QueryMessage>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(5),
            default_interval: Duration::from_secs(15),
            jitter_ms: 50,
            inter_send_delay: Duration::from_millis(100),
            rotation: default_rotation(),
        }
    }
}

/// Polls every tracked device with one shared timer.
#[derive(Clone)]
pub struct PollScheduler {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Transport,
    addresses: Arc<dyn AddressBook>,
    config: SchedulerConfig,
    state: Mutex<ScheduleState>,
    timer: Mutex<Option<Timer>>,
}

struct Timer {
    period: watch::Sender<Duration>,
    task: JoinHandle<()>,
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl PollScheduler {
    pub fn new(transport: Transport, addresses: Arc<dyn AddressBook>, config: SchedulerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                addresses,
                config,
                state: Mutex::new(ScheduleState::default()),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Tracks `target`. The first device starts the timer and is polled immediately.
    pub fn start(&self, target: PollTarget) {
        let device_id = target.device_id.clone();
        let first = self.shared.state().insert(target);
        info!(device = %device_id, "polling started");

        if first || !self.is_running() {
            self.spawn_timer();
        } else {
            self.update_interval();
        }
    }

    /// Stops polling `device_id`; the timer stops with the last device.
    pub fn stop(&self, device_id: &str) -> bool {
        let (removed, now_empty) = {
            let mut state = self.shared.state();
            let removed = state.remove(device_id).is_some();
            (removed, state.is_empty())
        };
        if removed {
            info!(device = %device_id, "polling stopped");
        }
        if now_empty {
            self.cancel_timer();
        } else if removed {
            self.update_interval();
        }
        removed
    }

    /// Recomputes the period from the tracked devices and re-arms a running timer.
    pub fn update_interval(&self) -> Duration {
        let interval = self.effective_interval();
        if let Some(timer) = self.shared.timer().as_ref() {
            let changed = timer.period.send_if_modified(|period| {
                if *period == interval {
                    false
                } else {
                    *period = interval;
                    true
                }
            });
            if changed {
                info!(interval_ms = interval.as_millis() as u64, "poll interval updated");
            }
        }
        interval
    }

    pub fn effective_interval(&self) -> Duration {
        let config = &self.shared.config;
        self.shared
            .state()
            .interval(config.floor, config.default_interval)
    }

    pub fn tracked(&self) -> Vec<String> {
        self.shared.state().device_ids()
    }

    pub fn is_running(&self) -> bool {
        self.shared
            .timer()
            .as_ref()
            .map(|timer| !timer.task.is_finished())
            .unwrap_or(false)
    }

    /// Sends the next rotation entry now.
    pub async fn tick(&self) {
        self.shared.tick().await;
    }

    /// Cancels the timer; tracked devices are kept.
    pub fn shutdown(&self) {
        self.cancel_timer();
    }

    fn spawn_timer(&self) {
        let interval = self.effective_interval();
        let (period, period_rx) = watch::channel(interval);
        let task = tokio::spawn(run(self.shared.clone(), period_rx));
        info!(interval_ms = interval.as_millis() as u64, "poll timer started");
        *self.shared.timer() = Some(Timer { period, task });
    }

    fn cancel_timer(&self) {
        if self.shared.timer().take().is_some() {
            info!("poll timer stopped");
        }
    }
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timer(&self) -> MutexGuard<'_, Option<Timer>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn tick(&self) {
        let plan = self
            .state()
            .plan_tick(&self.config.rotation, self.addresses.as_ref());
        let Some(plan) = plan else {
            return;
        };
        metrics::counter!("poll_ticks_total").increment(1);

        let kind = plan.message.kind;
        let payload = match encode_request(kind.poll_id(), kind.method(), &kind.params()) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(method = kind.method(), error = %err, "poll request encoding failed");
                return;
            }
        };

        for device in &plan.unaddressed {
            debug!(device = %device, method = kind.method(), "no known address, poll skipped");
        }

        let mut sent = 0usize;
        if plan.broadcast {
            if let Err(err) = self.transport.broadcast(&payload, None).await {
                metrics::counter!("poll_send_failures_total").increment(1);
                warn!(method = kind.method(), error = %err, "poll broadcast failed");
            }
            sent += 1;
        }

        for (device, addr) in &plan.unicast {
            if sent > 0 && !self.config.inter_send_delay.is_zero() {
                sleep(self.config.inter_send_delay).await;
            }
            if let Err(err) = self.transport.send_to(&payload, *addr).await {
                metrics::counter!("poll_send_failures_total").increment(1);
                warn!(device = %device, ip = %addr, method = kind.method(), error = %err, "poll send failed");
            }
            sent += 1;
        }

        debug!(
            method = kind.method(),
            broadcast = plan.broadcast,
            unicast = plan.unicast.len(),
            skipped = plan.unaddressed.len(),
            "poll tick complete"
        );
    }
}

async fn run(shared: Arc<Shared>, mut period: watch::Receiver<Duration>) {
    loop {
        shared.tick().await;

        let mut delay = jittered_delay(*period.borrow_and_update(), shared.config.jitter_ms);
        loop {
            tokio::select! {
                _ = sleep(delay) => break,
                changed = period.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    // Re-arm with the new period without an extra tick.
                    delay = jittered_delay(*period.borrow_and_update(), shared.config.jitter_ms);
                }
            }
        }
    }
}

/// `base` plus a uniform random extra of up to `jitter_ms`.
pub fn jittered_delay(base: Duration, jitter_ms: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
}
