use lever_core::{AdmissionDenial, EnforcementRecord, PolicySnapshot, Result, ThresholdSignal};
use lever_store::PolicyStore;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::metrics::EngineMetrics;

/// One row destined for an append-only audit table.
#[derive(Debug, Clone)]
pub enum AuditRecord {
    Signal(ThresholdSignal),
    Snapshot(PolicySnapshot),
    Enforcement(EnforcementRecord),
    Denial(AdmissionDenial),
}

impl AuditRecord {
    fn kind(&self) -> &'static str {
        match self {
            Self::Signal(_) => "threshold_signal",
            Self::Snapshot(_) => "policy_snapshot",
            Self::Enforcement(_) => "enforcement_action",
            Self::Denial(_) => "admission_denial",
        }
    }

    fn write(&self, store: &PolicyStore) -> Result<bool> {
        match self {
            Self::Signal(s) => store.insert_signal(s),
            Self::Snapshot(s) => store.insert_snapshot(s),
            Self::Enforcement(e) => store.insert_enforcement(e),
            Self::Denial(d) => store.insert_denial(d),
        }
    }
}

enum Command {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Retry settings for audit writes.
#[derive(Debug, Clone, Copy)]
pub struct AuditSettings {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl From<&lever_config::AuditConfig> for AuditSettings {
    fn from(cfg: &lever_config::AuditConfig) -> Self {
        Self {
            queue_capacity: cfg.queue_capacity.max(1),
            max_retries: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
        }
    }
}

/// Handle to the background audit writer. Recording never blocks the
/// caller; a full queue drops the record and counts it.
#[derive(Clone)]
pub struct AuditWriter {
    tx: mpsc::Sender<Command>,
    metrics: EngineMetrics,
}

impl AuditWriter {
    /// Start the writer task on the current tokio runtime.
    pub fn spawn(store: PolicyStore, settings: AuditSettings, metrics: EngineMetrics) -> Self {
        let (tx, mut rx) = mpsc::channel(settings.queue_capacity);
        let task_metrics = metrics.clone();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    Command::Record(record) => {
                        write_with_retry(&store, &record, &settings, &task_metrics).await;
                    }
                    Command::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("audit writer stopped");
        });
        Self { tx, metrics }
    }

    pub fn record(&self, record: AuditRecord) {
        let kind = record.kind();
        if let Err(e) = self.tx.try_send(Command::Record(record)) {
            self.metrics.inc_audit_dropped();
            error!(kind, error = %e, "audit record dropped");
        }
    }

    /// Wait until every record queued before this call has been handled.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn write_with_retry(
    store: &PolicyStore,
    record: &AuditRecord,
    settings: &AuditSettings,
    metrics: &EngineMetrics,
) {
    let mut attempt = 0u32;
    loop {
        match record.write(store) {
            Ok(inserted) => {
                if !inserted {
                    debug!(kind = record.kind(), "audit record already present");
                }
                return;
            }
            Err(e) if attempt < settings.max_retries => {
                let delay = settings
                    .base_delay
                    .saturating_mul(2u32.saturating_pow(attempt));
                warn!(
                    kind = record.kind(),
                    attempt = attempt + 1,
                    max = settings.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "audit write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                metrics.inc_audit_write_failures();
                error!(
                    kind = record.kind(),
                    retries = settings.max_retries,
                    error = %e,
                    "audit write failed permanently"
                );
                return;
            }
        }
    }
}
