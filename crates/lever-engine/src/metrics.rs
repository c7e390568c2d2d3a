//! Prometheus-compatible counters for the engine and its HTTP surface.

use std::fmt::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Shared counter registry. Clones share the same counters.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct Counters {
    runs_admitted_total: AtomicU64,
    runs_denied_total: AtomicU64,
    near_signals_total: AtomicU64,
    breach_signals_total: AtomicU64,
    near_suppressed_total: AtomicU64,
    actions_applied_total: AtomicU64,
    actions_downgraded_total: AtomicU64,
    actions_duplicate_total: AtomicU64,
    alerts_dispatched_total: AtomicU64,
    alerts_suppressed_total: AtomicU64,
    channel_failures_total: AtomicU64,
    audit_write_failures_total: AtomicU64,
    audit_dropped_total: AtomicU64,
    overrides_authorized_total: AtomicU64,
    overrides_denied_total: AtomicU64,
    http_requests_total: AtomicU64,
    http_errors_total: AtomicU64,
}

#[derive(Debug)]
struct MetricsInner {
    counters: Counters,
    started_at: Instant,
}

macro_rules! counter {
    ($($inc:ident => $field:ident),* $(,)?) => {
        impl EngineMetrics {
            $(
                pub fn $inc(&self) {
                    self.inner.counters.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    inc_runs_admitted => runs_admitted_total,
    inc_runs_denied => runs_denied_total,
    inc_near_signals => near_signals_total,
    inc_breach_signals => breach_signals_total,
    inc_near_suppressed => near_suppressed_total,
    inc_actions_applied => actions_applied_total,
    inc_actions_downgraded => actions_downgraded_total,
    inc_actions_duplicate => actions_duplicate_total,
    inc_alerts_dispatched => alerts_dispatched_total,
    inc_alerts_suppressed => alerts_suppressed_total,
    inc_channel_failures => channel_failures_total,
    inc_audit_write_failures => audit_write_failures_total,
    inc_audit_dropped => audit_dropped_total,
    inc_overrides_authorized => overrides_authorized_total,
    inc_overrides_denied => overrides_denied_total,
    inc_http_requests => http_requests_total,
    inc_http_errors => http_errors_total,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counters: Counters::default(),
                started_at: Instant::now(),
            }),
        }
    }

    fn table(&self) -> [(&'static str, &'static str, &AtomicU64); 17] {
        let c = &self.inner.counters;
        [
            ("runs_admitted_total", "Runs admitted with a bound policy.", &c.runs_admitted_total),
            ("runs_denied_total", "Runs denied at admission.", &c.runs_denied_total),
            ("near_signals_total", "Near signals emitted.", &c.near_signals_total),
            ("breach_signals_total", "Breach signals emitted.", &c.breach_signals_total),
            ("near_suppressed_total", "Repeated Near signals suppressed.", &c.near_suppressed_total),
            ("actions_applied_total", "Enforcement actions applied.", &c.actions_applied_total),
            ("actions_downgraded_total", "Enforcement actions downgraded by an override.", &c.actions_downgraded_total),
            ("actions_duplicate_total", "Repeated enforcement requests for a known breach.", &c.actions_duplicate_total),
            ("alerts_dispatched_total", "Alerts delivered to a channel.", &c.alerts_dispatched_total),
            ("alerts_suppressed_total", "Alerts suppressed by throttling.", &c.alerts_suppressed_total),
            ("channel_failures_total", "Alert deliveries that failed.", &c.channel_failures_total),
            ("audit_write_failures_total", "Audit records lost after retries ran out.", &c.audit_write_failures_total),
            ("audit_dropped_total", "Audit records dropped because the queue was full.", &c.audit_dropped_total),
            ("overrides_authorized_total", "Overrides authorized.", &c.overrides_authorized_total),
            ("overrides_denied_total", "Override requests denied.", &c.overrides_denied_total),
            ("http_requests_total", "HTTP requests served.", &c.http_requests_total),
            ("http_errors_total", "HTTP responses with a 4xx/5xx status.", &c.http_errors_total),
        ]
    }

    /// Current value of a counter by its unprefixed name.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.table()
            .into_iter()
            .find(|(n, _, _)| *n == name)
            .map(|(_, _, v)| v.load(Ordering::Relaxed))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.inner.started_at.elapsed().as_secs()
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        let uptime = self.uptime_secs();
        let _ = writeln!(out, "# HELP lever_uptime_seconds Time since the engine started.");
        let _ = writeln!(out, "# TYPE lever_uptime_seconds gauge");
        let _ = writeln!(out, "lever_uptime_seconds {uptime}");
        for (name, help, value) in self.table() {
            let _ = writeln!(out);
            let _ = writeln!(out, "# HELP lever_{name} {help}");
            let _ = writeln!(out, "# TYPE lever_{name} counter");
            let _ = writeln!(out, "lever_{name} {}", value.load(Ordering::Relaxed));
        }
        out
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
