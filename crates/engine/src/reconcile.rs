//! Periodic recount of cached unread totals.
//!
//! Direct-notification totals already reconcile on every create and
//! destroy; this pass repairs drift left by counter-store outages during
//! read/unread transitions. Fan-out counters are not touched.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use notice_common::error::AppError;

use crate::lifecycle::NotificationLifecycle;
use crate::store::NotificationStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub receivers: usize,
    pub failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn NotificationStore>,
    lifecycle: NotificationLifecycle,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        lifecycle: NotificationLifecycle,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            lifecycle,
            interval,
        }
    }

    /// Recount every receiver once.
    pub async fn run_once(&self) -> Result<PassSummary, AppError> {
        let receivers = self.store.receivers().await?;
        let mut summary = PassSummary {
            receivers: receivers.len(),
            failed: 0,
        };

        for receiver in &receivers {
            if let Err(e) = self.lifecycle.reconcile(receiver, None).await {
                summary.failed += 1;
                tracing::warn!(receiver = %receiver, error = %e, "Reconciliation failed");
            }
        }
        Ok(summary)
    }

    /// Run passes on a fixed interval until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Reconciler started");

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Reconciler stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(summary) if summary.failed > 0 => tracing::warn!(
                            receivers = summary.receivers,
                            failed = summary.failed,
                            "Reconciliation pass finished with failures"
                        ),
                        Ok(summary) => tracing::debug!(
                            receivers = summary.receivers,
                            "Reconciliation pass finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Reconciliation pass failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterKey, CounterStore, MemoryCounterStore};
    use crate::store::MemoryStore;
    use notice_common::types::{EntityRef, NewNotification};

    #[tokio::test]
    async fn test_pass_repairs_drifted_totals() {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let lifecycle = NotificationLifecycle::new(store.clone(), counters.clone());
        let receiver = EntityRef::new("User", 1);

        store.insert(&NewNotification::to(receiver.clone())).await.unwrap();
        store.insert(&NewNotification::to(receiver.clone())).await.unwrap();
        counters
            .overwrite(&CounterKey::total(&receiver), 9)
            .await
            .unwrap();

        let reconciler = Reconciler::new(store, lifecycle, Duration::from_secs(60));
        let summary = reconciler.run_once().await.unwrap();
        assert_eq!(summary, PassSummary { receivers: 1, failed: 0 });
        assert_eq!(counters.read(&CounterKey::total(&receiver)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_pass_counts_failures() {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let lifecycle = NotificationLifecycle::new(store.clone(), counters.clone());
        store
            .insert(&NewNotification::to(EntityRef::new("User", 1)))
            .await
            .unwrap();
        counters.set_unavailable(true);

        let reconciler = Reconciler::new(store, lifecycle, Duration::from_secs(60));
        let summary = reconciler.run_once().await.unwrap();
        assert_eq!(summary.failed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(MemoryCounterStore::new());
        let lifecycle = NotificationLifecycle::new(store.clone(), counters);
        let reconciler = Reconciler::new(store, lifecycle, Duration::from_millis(10));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(reconciler.run(cancel.clone()));
        cancel.cancel();
        handle.await.unwrap();
    }
}
