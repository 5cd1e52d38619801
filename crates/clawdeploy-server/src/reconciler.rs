use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::models::instance::{InstancePatch, InstanceStatus};
use crate::runtime::{ContainerRuntime, ContainerStatus};
use crate::store::InstanceStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub checked: usize,
    pub updated: usize,
}

/// Logical status implied by what the engine reports. `None` leaves the
/// record alone.
pub fn reconciled_status(observed: ContainerStatus) -> Option<InstanceStatus> {
    match observed {
        ContainerStatus::Running => Some(InstanceStatus::Running),
        ContainerStatus::Exited | ContainerStatus::Dead => Some(InstanceStatus::Stopped),
        ContainerStatus::NotFound => Some(InstanceStatus::Error),
        ContainerStatus::Unknown => None,
    }
}

pub struct Reconciler {
    store: Arc<dyn InstanceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            runtime,
            interval,
        }
    }

    /// One pass over records that claim a live container. Failures on one
    /// record are logged and do not stop the pass.
    pub async fn reconcile_once(&self) -> anyhow::Result<SyncReport> {
        let candidates = self
            .store
            .list_with_status(&[InstanceStatus::Running, InstanceStatus::Creating])
            .await?;

        let mut report = SyncReport::default();
        for instance in candidates {
            let Some(container_ref) = instance.container_ref.as_deref() else {
                continue;
            };
            report.checked += 1;

            let observed = match self.runtime.status(container_ref).await {
                Ok(observed) => observed,
                Err(e) => {
                    warn!(instance_id = %instance.id, container_ref, error = %e, "failed to inspect container");
                    continue;
                }
            };
            let Some(expected) = reconciled_status(observed) else {
                debug!(instance_id = %instance.id, %observed, "no mapping for observed status");
                continue;
            };
            if expected == instance.status {
                continue;
            }

            match self
                .store
                .update(&instance.id, InstancePatch::status(expected))
                .await
            {
                Ok(_) => {
                    info!(
                        instance_id = %instance.id,
                        from = %instance.status,
                        to = %expected,
                        %observed,
                        "corrected instance status drift"
                    );
                    report.updated += 1;
                }
                Err(e) => {
                    warn!(instance_id = %instance.id, error = %format!("{e:#}"), "failed to persist reconciled status")
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "reconciler starting");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.reconcile_once().await {
                Ok(report) => debug!(checked = report.checked, updated = report.updated, "reconcile pass finished"),
                Err(e) => error!(error = %format!("{e:#}"), "reconcile pass failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{instance, FakeRuntime, MemoryInstanceStore};

    fn bound(id: &str, status: InstanceStatus, container_ref: &str) -> crate::models::instance::Instance {
        let mut record = instance(id, "owner", status);
        record.container_ref = Some(container_ref.to_string());
        record.port = Some(12000);
        record
    }

    fn reconciler(store: &Arc<MemoryInstanceStore>, runtime: &Arc<FakeRuntime>) -> Reconciler {
        Reconciler::new(store.clone(), runtime.clone(), Duration::from_secs(60))
    }

    #[test]
    fn engine_status_mapping() {
        assert_eq!(
            reconciled_status(ContainerStatus::Running),
            Some(InstanceStatus::Running)
        );
        assert_eq!(
            reconciled_status(ContainerStatus::Exited),
            Some(InstanceStatus::Stopped)
        );
        assert_eq!(
            reconciled_status(ContainerStatus::Dead),
            Some(InstanceStatus::Stopped)
        );
        assert_eq!(
            reconciled_status(ContainerStatus::NotFound),
            Some(InstanceStatus::Error)
        );
        assert_eq!(reconciled_status(ContainerStatus::Unknown), None);
    }

    #[tokio::test]
    async fn vanished_container_marks_instance_error() {
        let store = Arc::new(MemoryInstanceStore::default());
        let runtime = Arc::new(FakeRuntime::default());
        store.insert(bound("inst-1", InstanceStatus::Running, "c-gone"));

        let report = reconciler(&store, &runtime).reconcile_once().await.unwrap();

        assert_eq!(report, SyncReport { checked: 1, updated: 1 });
        assert_eq!(store.get("inst-1").unwrap().status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn matching_status_is_left_alone() {
        let store = Arc::new(MemoryInstanceStore::default());
        let runtime = Arc::new(FakeRuntime::default());
        runtime.seed_running("c-1", "inst-1", 12000);
        store.insert(bound("inst-1", InstanceStatus::Running, "c-1"));

        let report = reconciler(&store, &runtime).reconcile_once().await.unwrap();

        assert_eq!(report, SyncReport { checked: 1, updated: 0 });
        assert_eq!(store.get("inst-1").unwrap().status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn one_failing_instance_does_not_block_the_batch() {
        let store = Arc::new(MemoryInstanceStore::default());
        let runtime = Arc::new(FakeRuntime::default());
        runtime.seed_running("c-a", "inst-a", 12001);
        runtime.fail_status("c-a");
        runtime.seed_running("c-b", "inst-b", 12002);
        runtime.set_status("c-b", ContainerStatus::Exited);
        runtime.seed_running("c-c", "inst-c", 12003);
        runtime.set_status("c-c", ContainerStatus::Unknown);
        store.insert(bound("inst-a", InstanceStatus::Running, "c-a"));
        store.insert(bound("inst-b", InstanceStatus::Creating, "c-b"));
        store.insert(bound("inst-c", InstanceStatus::Running, "c-c"));
        // not selected: wrong status or no container
        store.insert(bound("inst-d", InstanceStatus::Stopped, "c-d"));
        store.insert(instance("inst-e", "owner", InstanceStatus::Running));

        let report = reconciler(&store, &runtime).reconcile_once().await.unwrap();

        assert_eq!(report, SyncReport { checked: 3, updated: 1 });
        assert_eq!(store.get("inst-a").unwrap().status, InstanceStatus::Running);
        assert_eq!(store.get("inst-b").unwrap().status, InstanceStatus::Stopped);
        assert_eq!(store.get("inst-c").unwrap().status, InstanceStatus::Running);
        assert_eq!(store.get("inst-d").unwrap().status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn run_loop_exits_on_shutdown() {
        let store = Arc::new(MemoryInstanceStore::default());
        let runtime = Arc::new(FakeRuntime::default());
        store.insert(bound("inst-1", InstanceStatus::Running, "c-gone"));
        let (tx, rx) = watch::channel(false);

        let reconciler = reconciler(&store, &runtime);
        let handle = tokio::spawn(async move { reconciler.run(rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reconciler should stop")
            .unwrap();

        assert_eq!(store.get("inst-1").unwrap().status, InstanceStatus::Error);
    }
}
