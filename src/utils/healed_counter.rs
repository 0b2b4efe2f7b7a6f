//! Decaying fault counter.
//!
//! A [`HealedCounter`] counts faults and forgets one of them every heal
//! interval. When the number of outstanding faults reaches the configured
//! maximum the owner's saturation callback runs, synchronously, on the task
//! that recorded the fault. It will not run again until the counter has
//! healed below the maximum and climbed back up.
//!
//! Transient faults heal away; sustained instability saturates the counter
//! and triggers the owner's policy (dispose a connection, stop an accept
//! loop, force a client to disconnect).

use crate::config::{InstabilityConfig, MIN_HEAL_TIME};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

type SaturationFn = dyn Fn() + Send + Sync + 'static;

struct CounterState {
    name: String,
    // Saturated exactly while value == max; the step from max - 1 to max
    // is the only one that fires
    value: AtomicU32,
    max: u32,
    on_saturated: Box<SaturationFn>,
}

impl CounterState {
    fn heal(&self) {
        let healed = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));

        if let Ok(previous) = healed {
            trace!(counter = %self.name, value = previous - 1, "Instability healed");
        }
    }
}

/// Fault counter that heals one unit per interval and fires once per saturation.
pub struct HealedCounter {
    state: Arc<CounterState>,
    heal_time: Duration,
    stop: CancellationToken,
}

impl HealedCounter {
    /// Create a counter and start its heal task.
    ///
    /// Must be called from within a Tokio runtime. A `max` of zero is treated
    /// as one and `heal_time` is raised to at least [`MIN_HEAL_TIME`].
    pub fn new<F>(name: impl Into<String>, max: u32, heal_time: Duration, on_saturated: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let heal_time = heal_time.max(MIN_HEAL_TIME);
        let state = Arc::new(CounterState {
            name: name.into(),
            value: AtomicU32::new(0),
            max: max.max(1),
            on_saturated: Box::new(on_saturated),
        });
        let stop = CancellationToken::new();

        let heal_state = Arc::clone(&state);
        let heal_stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + heal_time, heal_time);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = heal_stop.cancelled() => break,
                    _ = ticker.tick() => heal_state.heal(),
                }
            }
            trace!(counter = %heal_state.name, "Heal task stopped");
        });

        debug!(counter = %state.name, max = state.max, heal_ms = heal_time.as_millis() as u64, "Instability counter started");

        Self {
            state,
            heal_time,
            stop,
        }
    }

    /// Create a counter from an [`InstabilityConfig`].
    pub fn from_config<F>(name: impl Into<String>, config: &InstabilityConfig, on_saturated: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::new(name, config.max, config.heal_time, on_saturated)
    }

    /// Record one fault.
    ///
    /// Returns `true` only for the increment that saturated the counter.
    pub fn increment(&self) -> bool {
        let state = &self.state;
        let bumped = state
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                (v < state.max).then_some(v + 1)
            });

        match bumped {
            Ok(previous) if previous + 1 == state.max => {
                warn!(counter = %state.name, max = state.max, "Instability counter saturated");
                crate::utils::metrics::global_metrics().saturation();
                (state.on_saturated)();
                true
            }
            Ok(previous) => {
                debug!(counter = %state.name, value = previous + 1, max = state.max, "Instability recorded");
                false
            }
            Err(_) => false,
        }
    }

    pub fn value(&self) -> u32 {
        self.state.value.load(Ordering::Acquire)
    }

    pub fn max(&self) -> u32 {
        self.state.max
    }

    /// Whether outstanding faults are at the maximum.
    pub fn is_saturated(&self) -> bool {
        self.value() == self.state.max
    }

    pub fn heal_time(&self) -> Duration {
        self.heal_time
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    /// Stop healing. The counter keeps its current value.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl Drop for HealedCounter {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl fmt::Debug for HealedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealedCounter")
            .field("name", &self.state.name)
            .field("value", &self.value())
            .field("max", &self.state.max)
            .field("heal_time", &self.heal_time)
            .finish()
    }
}
