use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use lever_channels::ChannelRegistry;
use lever_core::{
    AlertConfig, AlertPayload, ChannelType, Clock, EventBus, LeverEvent, Metric, RunId,
    ThresholdSignal,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::metrics::EngineMetrics;

/// Result of one channel for one alert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    Delivered,
    Failed(String),
    Suppressed(String),
}

/// Fans signals out to channel adapters, throttled per channel.
///
/// A channel accepts at most `max_alerts_per_run` alerts per run, and at most
/// one per `min_interval_secs` for the same metric. Slots are reserved before
/// dispatch so concurrent emits cannot overrun the cap.
pub struct AlertEmitter {
    registry: ChannelRegistry,
    clock: Arc<dyn Clock>,
    metrics: EngineMetrics,
    bus: EventBus,
    sent: DashMap<(RunId, ChannelType), u32>,
    last_sent: DashMap<(RunId, Metric, ChannelType), DateTime<Utc>>,
    in_flight: InFlight,
}

impl AlertEmitter {
    pub fn new(
        registry: ChannelRegistry,
        clock: Arc<dyn Clock>,
        metrics: EngineMetrics,
        bus: EventBus,
    ) -> Self {
        Self {
            registry,
            clock,
            metrics,
            bus,
            sent: DashMap::new(),
            last_sent: DashMap::new(),
            in_flight: InFlight::default(),
        }
    }

    /// Dispatch in the background; the caller never waits on a channel.
    pub fn spawn_emit(self: &Arc<Self>, signal: ThresholdSignal, config: AlertConfig) {
        let guard = self.in_flight.enter();
        let emitter = Arc::clone(self);
        tokio::spawn(async move {
            emitter.emit(&signal, &config).await;
            drop(guard);
        });
    }

    pub async fn emit(
        &self,
        signal: &ThresholdSignal,
        config: &AlertConfig,
    ) -> Vec<(ChannelType, ChannelOutcome)> {
        let payload = AlertPayload::from(signal);
        let now = self.clock.now();

        let mut outcomes = Vec::new();
        let mut dispatches = Vec::new();
        for &channel in &config.channels {
            match self.reserve(signal, channel, config, now) {
                Err(reason) => {
                    self.metrics.inc_alerts_suppressed();
                    debug!(run_id = %signal.run_id, channel = %channel, %reason, "alert suppressed");
                    self.bus.publish(LeverEvent::AlertSuppressed {
                        run_id: signal.run_id,
                        channel,
                        reason: reason.clone(),
                    });
                    outcomes.push((channel, ChannelOutcome::Suppressed(reason)));
                }
                Ok(()) => {
                    let adapter = self.registry.get(channel);
                    let payload = &payload;
                    dispatches.push(async move {
                        let result = match adapter {
                            Some(adapter) => adapter.send(payload).await,
                            None => Err(lever_core::LeverError::ChannelDispatch {
                                channel: channel.to_string(),
                                reason: "no adapter registered".into(),
                            }),
                        };
                        (channel, result)
                    });
                }
            }
        }

        for (channel, result) in join_all(dispatches).await {
            let outcome = match result {
                Ok(()) => {
                    self.metrics.inc_alerts_dispatched();
                    self.bus.publish(LeverEvent::AlertDispatched {
                        run_id: signal.run_id,
                        channel,
                    });
                    ChannelOutcome::Delivered
                }
                Err(e) => {
                    self.metrics.inc_channel_failures();
                    warn!(
                        run_id = %signal.run_id,
                        channel = %channel,
                        code = e.code(),
                        error = %e,
                        "alert dispatch failed"
                    );
                    self.bus.publish(LeverEvent::AlertFailed {
                        run_id: signal.run_id,
                        channel,
                        error: e.to_string(),
                    });
                    ChannelOutcome::Failed(e.to_string())
                }
            };
            outcomes.push((channel, outcome));
        }
        outcomes
    }

    fn reserve(
        &self,
        signal: &ThresholdSignal,
        channel: ChannelType,
        config: &AlertConfig,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let mut count = self.sent.entry((signal.run_id, channel)).or_insert(0);
        if *count >= config.max_alerts_per_run {
            return Err(format!(
                "max_alerts_per_run ({}) reached",
                config.max_alerts_per_run
            ));
        }
        let key = (signal.run_id, signal.metric, channel);
        if let Some(last) = self.last_sent.get(&key) {
            let elapsed = now.signed_duration_since(*last).num_seconds();
            if elapsed < i64::try_from(config.min_interval_secs).unwrap_or(i64::MAX) {
                return Err(format!(
                    "min_interval_secs ({}) not elapsed for {}",
                    config.min_interval_secs, signal.metric
                ));
            }
        }
        *count += 1;
        self.last_sent.insert(key, now);
        Ok(())
    }

    /// Wait for every background dispatch started so far.
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await;
    }

    pub fn forget_run(&self, run_id: RunId) {
        self.sent.retain(|(run, _), _| *run != run_id);
        self.last_sent.retain(|(run, _, _), _| *run != run_id);
    }
}

/// Counts spawned dispatch tasks so tests and shutdown can wait for them.
#[derive(Clone, Default)]
struct InFlight {
    count: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

struct InFlightGuard(InFlight);

impl InFlight {
    fn enter(&self) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}
