use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::error::{LifecycleError, LifecycleResult};
use crate::ingress::IngressSync;
use crate::instance_config::{
    generate_gateway_token, InstanceSecrets, InstanceSpec, InstanceStorage, OpenClawConfig,
};
use crate::models::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};
use crate::ports::PortAllocator;
use crate::rebuild::{ImageBuilder, RebuildLock};
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerStatus, CreatedContainer};
use crate::store::InstanceStore;

pub const DEFAULT_LOG_TAIL: usize = 100;

fn new_instance_id() -> String {
    let mut rng = rand::thread_rng();
    format!("inst-{:08x}{:08x}", rng.r#gen::<u32>(), rng.r#gen::<u32>())
}

fn secrets_of(instance: &Instance) -> InstanceSecrets {
    InstanceSecrets {
        ai_provider: instance.ai_provider.clone(),
        api_key: instance.api_key.clone(),
        channel: instance.channel.clone(),
        bot_token: instance.bot_token.clone(),
    }
}

/// Held while an operation owns an instance id. Dropping it frees the id.
pub struct InstanceGuard {
    busy: Arc<Mutex<HashSet<String>>>,
    instance_id: String,
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(&self.instance_id);
        }
    }
}

/// A failed swap step plus the replacement container, if one was created.
struct SwapFailure {
    error: LifecycleError,
    replacement: Option<String>,
}

impl SwapFailure {
    fn before_replacement(error: impl Into<LifecycleError>) -> Self {
        Self {
            error: error.into(),
            replacement: None,
        }
    }
}

/// Drives instances through create, update, stop and delete against the
/// store and the container runtime.
pub struct LifecycleController {
    store: Arc<dyn InstanceStore>,
    runtime: Arc<dyn ContainerRuntime>,
    ports: PortAllocator,
    rebuild_lock: RebuildLock,
    builder: Arc<dyn ImageBuilder>,
    ingress: Arc<dyn IngressSync>,
    storage: InstanceStorage,
    busy: Arc<Mutex<HashSet<String>>>,
}

impl LifecycleController {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        runtime: Arc<dyn ContainerRuntime>,
        ports: PortAllocator,
        rebuild_lock: RebuildLock,
        builder: Arc<dyn ImageBuilder>,
        ingress: Arc<dyn IngressSync>,
        storage: InstanceStorage,
    ) -> Self {
        Self {
            store,
            runtime,
            ports,
            rebuild_lock,
            builder,
            ingress,
            storage,
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Claims `instance_id` for one operation, failing fast when another
    /// operation holds it.
    pub fn lock_instance(&self, instance_id: &str) -> LifecycleResult<InstanceGuard> {
        let mut busy = self
            .busy
            .lock()
            .map_err(|_| LifecycleError::InstanceBusy(instance_id.to_string()))?;
        if !busy.insert(instance_id.to_string()) {
            return Err(LifecycleError::InstanceBusy(instance_id.to_string()));
        }
        Ok(InstanceGuard {
            busy: self.busy.clone(),
            instance_id: instance_id.to_string(),
        })
    }

    async fn load_owned(&self, owner_id: &str, instance_id: &str) -> LifecycleResult<Instance> {
        let instance = self
            .store
            .find_by_id(instance_id)
            .await
            .map_err(LifecycleError::Store)?
            .ok_or_else(|| LifecycleError::InstanceNotFound(instance_id.to_string()))?;
        if instance.owner_id != owner_id {
            warn!(instance_id, owner_id, "rejected access to instance of another owner");
            return Err(LifecycleError::Ownership(instance_id.to_string()));
        }
        Ok(instance)
    }

    async fn sync_ingress(&self) {
        if let Err(e) = self.ingress.sync().await {
            warn!(error = %format!("{e:#}"), "ingress sync failed");
        }
    }

    async fn set_status(&self, instance_id: &str, status: InstanceStatus) {
        if let Err(e) = self
            .store
            .update(instance_id, InstancePatch::status(status))
            .await
        {
            error!(instance_id, %status, error = %format!("{e:#}"), "failed to persist status");
        }
    }

    async fn discard_container(&self, container_ref: &str) {
        match self.runtime.remove(container_ref).await {
            Ok(()) => debug!(container_ref, "removed container"),
            Err(e) if e.is_not_found() => debug!(container_ref, "container already gone"),
            Err(e) => warn!(container_ref, error = %e, "failed to remove container"),
        }
    }

    pub async fn create(&self, owner_id: &str, spec: InstanceSpec) -> LifecycleResult<Instance> {
        let spec = spec.validate()?;
        let instance_id = new_instance_id();
        let _guard = self.lock_instance(&instance_id)?;

        let record = self
            .store
            .create(NewInstance {
                id: instance_id.clone(),
                owner_id: owner_id.to_string(),
                name: spec.name.clone(),
                model: spec.model.clone(),
                channel: spec.channel.clone(),
                ai_provider: spec.ai_provider.clone(),
                api_key: spec.api_key.clone(),
                bot_token: spec.bot_token.clone(),
                status: InstanceStatus::Creating,
            })
            .await
            .map_err(LifecycleError::Store)?;
        info!(instance_id = %record.id, owner_id, "creating instance");

        match self.provision_and_start(&record).await {
            Ok(instance) => {
                info!(
                    instance_id = %instance.id,
                    container_ref = ?instance.container_ref,
                    port = ?instance.port,
                    "instance running"
                );
                self.sync_ingress().await;
                Ok(instance)
            }
            Err(e) => {
                error!(instance_id = %record.id, error = %e, "instance creation failed");
                self.storage.remove(&record.id).await;
                self.set_status(&record.id, InstanceStatus::Error).await;
                Err(e)
            }
        }
    }

    async fn provision_and_start(&self, record: &Instance) -> LifecycleResult<Instance> {
        let gateway_token = generate_gateway_token();
        let secrets = secrets_of(record);
        let config = OpenClawConfig::new(&gateway_token, &secrets);
        self.storage
            .provision(&record.id, &config, &secrets)
            .await
            .map_err(LifecycleError::Storage)?;

        let spec = ContainerSpec {
            instance_id: record.id.clone(),
            gateway_token: gateway_token.clone(),
            env: secrets.container_env(),
        };
        let CreatedContainer {
            container_ref,
            port,
        } = self
            .ports
            .create_container(self.runtime.as_ref(), &spec)
            .await?;

        let patch = InstancePatch::bound(&container_ref, port, InstanceStatus::Running)
            .with_gateway_token(&gateway_token);
        match self.store.update(&record.id, patch).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.discard_container(&container_ref).await;
                Err(LifecycleError::Store(e))
            }
        }
    }

    /// Rebuilds the image (unless another rebuild is in flight) and swaps the
    /// instance onto a fresh container. On failure the previous container is
    /// restored; if that fails too the instance is marked `error`. The
    /// triggering error is returned either way.
    pub async fn update(&self, owner_id: &str, instance_id: &str) -> LifecycleResult<Instance> {
        let _guard = self.lock_instance(instance_id)?;
        let instance = self.load_owned(owner_id, instance_id).await?;
        let (old_ref, old_port) = match (instance.container_ref.clone(), instance.host_port()) {
            (Some(container_ref), Some(port)) => (container_ref, port),
            _ => return Err(LifecycleError::MissingContainer(instance_id.to_string())),
        };
        let gateway_token = instance
            .gateway_token
            .clone()
            .ok_or_else(|| LifecycleError::MissingGatewayToken(instance_id.to_string()))?;

        self.store
            .update(instance_id, InstancePatch::status(InstanceStatus::Updating))
            .await
            .map_err(LifecycleError::Store)?;
        info!(instance_id, container_ref = %old_ref, "updating instance");

        match self.swap_container(&instance, &old_ref, &gateway_token).await {
            Ok(updated) => {
                self.discard_container(&old_ref).await;
                info!(
                    instance_id,
                    old_container_ref = %old_ref,
                    container_ref = ?updated.container_ref,
                    port = ?updated.port,
                    "instance updated"
                );
                self.sync_ingress().await;
                Ok(updated)
            }
            Err(SwapFailure { error, replacement }) => {
                error!(instance_id, error = %error, "update failed, rolling back");
                if let Some(replacement) = replacement {
                    self.discard_container(&replacement).await;
                }
                match self.restore_previous(instance_id, &old_ref, old_port).await {
                    Ok(()) => warn!(instance_id, container_ref = %old_ref, "restored previous container"),
                    Err(rollback) => {
                        error!(
                            instance_id,
                            error = %rollback,
                            "rollback failed, marking instance as error"
                        );
                        self.set_status(instance_id, InstanceStatus::Error).await;
                    }
                }
                Err(error)
            }
        }
    }

    async fn swap_container(
        &self,
        instance: &Instance,
        old_ref: &str,
        gateway_token: &str,
    ) -> Result<Instance, SwapFailure> {
        match self.runtime.stop(old_ref).await {
            Ok(()) => debug!(instance_id = %instance.id, container_ref = old_ref, "stopped previous container"),
            Err(e) if e.is_not_found() => {
                warn!(instance_id = %instance.id, container_ref = old_ref, "previous container already gone")
            }
            Err(e) => return Err(SwapFailure::before_replacement(e)),
        }

        match self.rebuild_lock.try_acquire() {
            Some(_rebuild) => {
                self.builder
                    .rebuild()
                    .await
                    .map_err(|e| SwapFailure::before_replacement(LifecycleError::Rebuild(e)))?;
            }
            None => info!(
                instance_id = %instance.id,
                "image rebuild already in progress, reusing current image"
            ),
        }

        let spec = ContainerSpec {
            instance_id: instance.id.clone(),
            gateway_token: gateway_token.to_string(),
            env: secrets_of(instance).container_env(),
        };
        let created = self
            .ports
            .create_container(self.runtime.as_ref(), &spec)
            .await
            .map_err(SwapFailure::before_replacement)?;

        let fail_with_replacement = |error: LifecycleError| SwapFailure {
            error,
            replacement: Some(created.container_ref.clone()),
        };

        let status = self
            .runtime
            .status(&created.container_ref)
            .await
            .map_err(|e| fail_with_replacement(e.into()))?;
        if status != ContainerStatus::Running {
            self.runtime
                .start(&created.container_ref)
                .await
                .map_err(|e| fail_with_replacement(e.into()))?;
        }

        self.store
            .update(
                &instance.id,
                InstancePatch::bound(&created.container_ref, created.port, InstanceStatus::Running),
            )
            .await
            .map_err(|e| fail_with_replacement(LifecycleError::Store(e)))
    }

    async fn restore_previous(
        &self,
        instance_id: &str,
        old_ref: &str,
        old_port: u16,
    ) -> LifecycleResult<()> {
        self.runtime.start(old_ref).await?;
        self.store
            .update(
                instance_id,
                InstancePatch::bound(old_ref, old_port, InstanceStatus::Running),
            )
            .await
            .map_err(LifecycleError::Store)?;
        Ok(())
    }

    /// Safe to retry: a container or storage tree that is already gone is
    /// not an error.
    pub async fn delete(&self, owner_id: &str, instance_id: &str) -> LifecycleResult<()> {
        let _guard = self.lock_instance(instance_id)?;
        let instance = self.load_owned(owner_id, instance_id).await?;

        if let Some(container_ref) = &instance.container_ref {
            match self.runtime.remove(container_ref).await {
                Ok(()) => debug!(instance_id, container_ref = %container_ref, "removed container"),
                Err(e) if e.is_not_found() => {
                    warn!(instance_id, container_ref = %container_ref, "container already gone")
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.storage.remove(instance_id).await;
        self.store
            .delete(instance_id)
            .await
            .map_err(LifecycleError::Store)?;
        info!(instance_id, "instance deleted");

        self.sync_ingress().await;
        Ok(())
    }

    pub async fn stop(&self, owner_id: &str, instance_id: &str) -> LifecycleResult<Instance> {
        let _guard = self.lock_instance(instance_id)?;
        let instance = self.load_owned(owner_id, instance_id).await?;
        let container_ref = instance
            .container_ref
            .as_deref()
            .ok_or_else(|| LifecycleError::MissingContainer(instance_id.to_string()))?;

        self.runtime.stop(container_ref).await?;
        let stopped = self
            .store
            .update(instance_id, InstancePatch::status(InstanceStatus::Stopped))
            .await
            .map_err(LifecycleError::Store)?;
        info!(instance_id, container_ref, "instance stopped");

        self.sync_ingress().await;
        Ok(stopped)
    }

    pub async fn get(&self, owner_id: &str, instance_id: &str) -> LifecycleResult<Instance> {
        self.load_owned(owner_id, instance_id).await
    }

    pub async fn list(&self, owner_id: &str) -> LifecycleResult<Vec<Instance>> {
        self.store
            .list_for_owner(owner_id)
            .await
            .map_err(LifecycleError::Store)
    }

    pub async fn logs(
        &self,
        owner_id: &str,
        instance_id: &str,
        tail: usize,
    ) -> LifecycleResult<String> {
        let instance = self.load_owned(owner_id, instance_id).await?;
        let container_ref = instance
            .container_ref
            .as_deref()
            .ok_or_else(|| LifecycleError::MissingContainer(instance_id.to_string()))?;
        Ok(self.runtime.logs(container_ref, tail).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::DEFAULT_PORT_RANGE;
    use crate::rebuild::DEFAULT_LOCK_TTL;
    use crate::runtime::RuntimeError;
    use crate::testing::{
        instance, FakeImageBuilder, FakeRuntime, MemoryInstanceStore, RecordingIngress,
    };

    const OWNER: &str = "user_owner";

    struct Harness {
        store: Arc<MemoryInstanceStore>,
        runtime: Arc<FakeRuntime>,
        builder: Arc<FakeImageBuilder>,
        ingress: Arc<RecordingIngress>,
        lock: RebuildLock,
        storage: InstanceStorage,
        controller: LifecycleController,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        fn with(builder: FakeImageBuilder, ingress: RecordingIngress) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(MemoryInstanceStore::default());
            let runtime = Arc::new(FakeRuntime::default());
            let builder = Arc::new(builder);
            let ingress = Arc::new(ingress);
            let lock = RebuildLock::new(dir.path().join("rebuild.lock"), DEFAULT_LOCK_TTL);
            let storage = InstanceStorage::new(dir.path().join("data")).without_chown();
            let controller = LifecycleController::new(
                store.clone(),
                runtime.clone(),
                PortAllocator::default(),
                lock.clone(),
                builder.clone(),
                ingress.clone(),
                storage.clone(),
            );
            Self {
                store,
                runtime,
                builder,
                ingress,
                lock,
                storage,
                controller,
                _dir: dir,
            }
        }

        fn new() -> Self {
            Self::with(FakeImageBuilder::default(), RecordingIngress::default())
        }

        async fn running_instance(&self) -> Instance {
            self.controller.create(OWNER, spec()).await.unwrap()
        }

        fn record(&self, id: &str) -> Instance {
            self.store.get(id).expect("record exists")
        }
    }

    fn spec() -> InstanceSpec {
        InstanceSpec {
            name: "support bot".into(),
            model: "claude-opus-4.5".into(),
            channel: "telegram".into(),
            bot_token: Some("123:abc".into()),
            api_key: Some("sk-ant".into()),
            ai_provider: Some("anthropic".into()),
        }
    }

    fn assert_settled(instance: &Instance) {
        match instance.status {
            InstanceStatus::Running => {
                assert!(instance.container_ref.is_some(), "running without container");
                assert!(instance.port.is_some(), "running without port");
            }
            InstanceStatus::Error => {}
            other => panic!("instance left in {other}"),
        }
    }

    #[tokio::test]
    async fn create_fails_before_any_container_when_store_rejects_record() {
        let h = Harness::new();
        h.store.fail_creates();

        let err = h.controller.create(OWNER, spec()).await.unwrap_err();

        assert!(matches!(err, LifecycleError::Store(_)));
        assert_eq!(h.runtime.create_attempts(), 0);
        assert_eq!(h.store.len(), 0);
        assert_eq!(h.ingress.syncs(), 0);
    }

    #[tokio::test]
    async fn create_provisions_storage_and_starts_container() {
        let h = Harness::new();
        let created = h.running_instance().await;

        assert_eq!(created.status, InstanceStatus::Running);
        assert!(created.id.starts_with("inst-"));
        let port = created.host_port().unwrap();
        assert!(DEFAULT_PORT_RANGE.contains(&port));

        let container_ref = created.container_ref.clone().unwrap();
        assert!(h.runtime.is_running(&container_ref));
        let container = h.runtime.container(&container_ref).unwrap();
        let token = created.gateway_token.clone().unwrap();
        assert_eq!(token.len(), 64);
        assert_eq!(
            container.env.get("OPENCLAW_GATEWAY_TOKEN"),
            Some(&token)
        );
        assert_eq!(
            container.env.get("ANTHROPIC_API_KEY").map(String::as_str),
            Some("sk-ant")
        );

        let paths = h.storage.paths(&created.id);
        let config: OpenClawConfig =
            serde_json::from_str(&std::fs::read_to_string(&paths.config_file).unwrap()).unwrap();
        assert_eq!(config.gateway.auth.token, token);
        assert!(paths.env_file.exists());
        assert_eq!(h.ingress.syncs(), 1);
    }

    #[tokio::test]
    async fn create_rejects_invalid_spec_before_any_write() {
        let h = Harness::new();
        let err = h
            .controller
            .create(
                OWNER,
                InstanceSpec {
                    model: "gpt-3".into(),
                    ..spec()
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::InvalidSpec(_)));
        assert_eq!(h.store.len(), 0);
        assert_eq!(h.runtime.create_attempts(), 0);
    }

    #[tokio::test]
    async fn failed_create_keeps_record_as_error_and_removes_storage() {
        let h = Harness::new();
        h.runtime.fail_next_create("image not found");

        let err = h.controller.create(OWNER, spec()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Runtime(RuntimeError::Other { .. })));

        let records = h.controller.list(OWNER).await.unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.status, InstanceStatus::Error);
        assert!(record.container_ref.is_none());
        assert!(!h.storage.paths(&record.id).base.exists());
        assert_eq!(h.ingress.syncs(), 0);
    }

    #[tokio::test]
    async fn port_exhaustion_fails_create() {
        let h = Harness::new();
        h.runtime.fail_creates_with_port_conflict(usize::MAX);

        let err = h.controller.create(OWNER, spec()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::PortExhaustion { attempts: 10 }));
        assert_eq!(h.runtime.create_attempts(), 10);
        let records = h.controller.list(OWNER).await.unwrap();
        assert_eq!(records[0].status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn failed_persistence_after_create_discards_container() {
        let h = Harness::new();
        h.store.fail_nth_update(1);

        let err = h.controller.create(OWNER, spec()).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Store(_)));
        assert_eq!(h.runtime.container_count(), 0);
        let records = h.controller.list(OWNER).await.unwrap();
        assert_eq!(records[0].status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn update_rebuilds_and_swaps_container() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let old_ref = created.container_ref.clone().unwrap();

        let updated = h.controller.update(OWNER, &created.id).await.unwrap();

        let new_ref = updated.container_ref.clone().unwrap();
        assert_ne!(new_ref, old_ref);
        assert_eq!(updated.status, InstanceStatus::Running);
        assert!(h.runtime.is_running(&new_ref));
        assert!(!h.runtime.exists(&old_ref));
        assert_eq!(h.builder.builds(), 1);
        assert!(!h.lock.path().exists(), "rebuild lock must be released");
        assert_eq!(
            h.runtime.container(&new_ref).unwrap().env.get("OPENCLAW_GATEWAY_TOKEN"),
            created.gateway_token.as_ref()
        );
        assert_eq!(h.ingress.syncs(), 2);
    }

    #[tokio::test]
    async fn update_skips_rebuild_while_lock_is_held_elsewhere() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let held = h.lock.try_acquire().expect("acquire lock");

        let updated = h.controller.update(OWNER, &created.id).await.unwrap();

        assert_eq!(h.builder.builds(), 0);
        assert_eq!(updated.status, InstanceStatus::Running);
        assert_ne!(updated.container_ref, created.container_ref);
        assert!(h.lock.path().exists(), "foreign holder keeps the lock");
        drop(held);
    }

    #[tokio::test]
    async fn failed_replacement_restores_previous_container() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let old_ref = created.container_ref.clone().unwrap();
        h.runtime.fail_next_create("no space left on device");

        let err = h.controller.update(OWNER, &created.id).await.unwrap_err();

        match err {
            LifecycleError::Runtime(RuntimeError::Other { message, .. }) => {
                assert_eq!(message, "no space left on device")
            }
            other => panic!("unexpected error {other:?}"),
        }
        let record = h.record(&created.id);
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.container_ref.as_deref(), Some(old_ref.as_str()));
        assert_eq!(record.port, created.port);
        assert!(h.runtime.is_running(&old_ref));
    }

    #[tokio::test]
    async fn update_starts_replacement_that_came_up_stopped() {
        let h = Harness::new();
        let created = h.running_instance().await;
        h.runtime.create_stopped();

        let updated = h.controller.update(OWNER, &created.id).await.unwrap();

        let new_ref = updated.container_ref.clone().unwrap();
        assert_eq!(updated.status, InstanceStatus::Running);
        assert!(h.runtime.calls().contains(&format!("start:{new_ref}")));
        assert!(h.runtime.is_running(&new_ref));
    }

    #[tokio::test]
    async fn failed_replacement_start_discards_it_and_restores() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let old_ref = created.container_ref.clone().unwrap();
        h.runtime.create_stopped();
        h.runtime.fail_next_start("engine refused start");

        let err = h.controller.update(OWNER, &created.id).await.unwrap_err();

        match err {
            LifecycleError::Runtime(RuntimeError::Other { message, .. }) => {
                assert_eq!(message, "engine refused start")
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(h.runtime.container_count(), 1);
        assert!(h.runtime.is_running(&old_ref));
        let record = h.record(&created.id);
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.container_ref.as_deref(), Some(old_ref.as_str()));
        assert_eq!(record.port, created.port);
    }

    #[tokio::test]
    async fn failed_persistence_removes_replacement_and_restores() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let old_ref = created.container_ref.clone().unwrap();
        // 1st update flips to updating, 2nd persists the replacement
        h.store.fail_nth_update(2);

        let err = h.controller.update(OWNER, &created.id).await.unwrap_err();

        assert!(matches!(err, LifecycleError::Store(_)));
        assert_eq!(h.runtime.container_count(), 1);
        let record = h.record(&created.id);
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.container_ref.as_deref(), Some(old_ref.as_str()));
    }

    #[tokio::test]
    async fn failed_rebuild_rolls_back_and_releases_lock() {
        let h = Harness::with(FakeImageBuilder::failing(), RecordingIngress::default());
        let created = h.running_instance().await;

        let err = h.controller.update(OWNER, &created.id).await.unwrap_err();

        assert!(matches!(err, LifecycleError::Rebuild(_)));
        assert!(!h.lock.path().exists());
        let record = h.record(&created.id);
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(record.container_ref, created.container_ref);
        assert_eq!(h.runtime.create_attempts(), 1);
    }

    #[tokio::test]
    async fn failed_rollback_escalates_to_error_with_original_cause() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let old_ref = created.container_ref.clone().unwrap();
        h.runtime.fail_next_create("registry timeout");
        h.runtime.fail_start(&old_ref);

        let err = h.controller.update(OWNER, &created.id).await.unwrap_err();

        assert!(
            matches!(&err, LifecycleError::Runtime(RuntimeError::Other { operation: "create_container", .. })),
            "original cause must be returned, got {err:?}"
        );
        assert_eq!(h.record(&created.id).status, InstanceStatus::Error);
    }

    #[tokio::test]
    async fn update_tolerates_vanished_previous_container() {
        let h = Harness::new();
        let created = h.running_instance().await;
        h.runtime.vanish(created.container_ref.as_deref().unwrap());

        let updated = h.controller.update(OWNER, &created.id).await.unwrap();

        assert_eq!(updated.status, InstanceStatus::Running);
        assert!(h.runtime.is_running(updated.container_ref.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn update_never_ends_in_updating() {
        type Inject = fn(&Harness, &str);
        let injections: [(&str, Inject); 6] = [
            ("stop", |h, old| h.runtime.fail_stop(old)),
            ("create", |h, _| h.runtime.fail_next_create("boom")),
            ("create+restart", |h, old| {
                h.runtime.fail_next_create("boom");
                h.runtime.fail_start(old);
            }),
            ("persist", |h, _| h.store.fail_nth_update(2)),
            ("persist+restore", |h, _| {
                h.store.fail_nth_update(2);
                h.store.fail_nth_update(3);
            }),
            ("remove old", |h, old| h.runtime.fail_remove(old)),
        ];

        for (label, inject) in injections {
            let h = Harness::new();
            let created = h.running_instance().await;
            inject(&h, created.container_ref.as_deref().unwrap());

            let _ = h.controller.update(OWNER, &created.id).await;

            let record = h.record(&created.id);
            assert_settled(&record);
            if record.status == InstanceStatus::Running {
                let container_ref = record.container_ref.as_deref().unwrap();
                assert!(
                    h.runtime.exists(container_ref),
                    "{label}: running record points at a missing container"
                );
            }
        }
    }

    #[tokio::test]
    async fn update_requires_container_and_token() {
        let h = Harness::new();
        h.store.insert(instance("inst-bare", OWNER, InstanceStatus::Error));

        let err = h.controller.update(OWNER, "inst-bare").await.unwrap_err();
        assert!(matches!(err, LifecycleError::MissingContainer(_)));

        let mut tokenless = instance("inst-tokenless", OWNER, InstanceStatus::Running);
        tokenless.container_ref = Some("fake-x".into());
        tokenless.port = Some(12000);
        tokenless.gateway_token = None;
        h.store.insert(tokenless);
        let err = h.controller.update(OWNER, "inst-tokenless").await.unwrap_err();
        assert!(matches!(err, LifecycleError::MissingGatewayToken(_)));
        assert_eq!(h.record("inst-tokenless").status, InstanceStatus::Running);
    }

    #[tokio::test]
    async fn foreign_owner_cannot_touch_instance() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let calls_before = h.runtime.calls().len();

        for err in [
            h.controller.update("user_other", &created.id).await.unwrap_err(),
            h.controller.delete("user_other", &created.id).await.unwrap_err(),
            h.controller.stop("user_other", &created.id).await.unwrap_err(),
            h.controller.get("user_other", &created.id).await.unwrap_err(),
        ] {
            assert!(matches!(err, LifecycleError::Ownership(_)));
            assert_eq!(err.to_string(), format!("instance {} not found", created.id));
        }

        assert_eq!(h.runtime.calls().len(), calls_before);
        assert_eq!(h.record(&created.id).status, InstanceStatus::Running);
        assert!(h.controller.list("user_other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_removes_container_storage_and_record() {
        let h = Harness::new();
        let created = h.running_instance().await;
        let container_ref = created.container_ref.clone().unwrap();

        h.controller.delete(OWNER, &created.id).await.unwrap();

        assert!(!h.runtime.exists(&container_ref));
        assert!(!h.storage.paths(&created.id).base.exists());
        assert!(h.store.get(&created.id).is_none());
        assert_eq!(h.ingress.syncs(), 2);
    }

    #[tokio::test]
    async fn delete_succeeds_when_container_already_gone() {
        let h = Harness::new();
        let created = h.running_instance().await;
        h.runtime.vanish(created.container_ref.as_deref().unwrap());

        h.controller.delete(OWNER, &created.id).await.unwrap();

        assert!(h.store.get(&created.id).is_none());
        assert!(!h.storage.paths(&created.id).base.exists());
    }

    #[tokio::test]
    async fn delete_of_unknown_instance_has_no_side_effects() {
        let h = Harness::new();

        let err = h.controller.delete(OWNER, "inst-missing").await.unwrap_err();

        assert!(matches!(err, LifecycleError::InstanceNotFound(_)));
        assert!(h.runtime.calls().is_empty());
        assert_eq!(h.ingress.syncs(), 0);
    }

    #[tokio::test]
    async fn delete_keeps_record_when_engine_refuses_removal() {
        let h = Harness::new();
        let created = h.running_instance().await;
        h.runtime.fail_remove(created.container_ref.as_deref().unwrap());

        let err = h.controller.delete(OWNER, &created.id).await.unwrap_err();

        assert!(matches!(err, LifecycleError::Runtime(RuntimeError::Other { .. })));
        assert!(h.store.get(&created.id).is_some());
    }

    #[tokio::test]
    async fn ingress_failures_never_fail_operations() {
        let h = Harness::with(FakeImageBuilder::default(), RecordingIngress::failing());

        let created = h.running_instance().await;
        h.controller.update(OWNER, &created.id).await.unwrap();
        h.controller.delete(OWNER, &created.id).await.unwrap();

        assert_eq!(h.ingress.syncs(), 3);
    }

    #[tokio::test]
    async fn concurrent_operation_on_same_instance_is_refused() {
        let h = Harness::new();
        let created = h.running_instance().await;

        let guard = h.controller.lock_instance(&created.id).unwrap();
        let err = h.controller.delete(OWNER, &created.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstanceBusy(_)));
        let err = h.controller.update(OWNER, &created.id).await.unwrap_err();
        assert!(matches!(err, LifecycleError::InstanceBusy(_)));

        drop(guard);
        h.controller.delete(OWNER, &created.id).await.unwrap();
    }

    #[tokio::test]
    async fn stop_persists_stopped_status() {
        let h = Harness::new();
        let created = h.running_instance().await;

        let stopped = h.controller.stop(OWNER, &created.id).await.unwrap();

        assert_eq!(stopped.status, InstanceStatus::Stopped);
        assert_eq!(stopped.container_ref, created.container_ref);
        assert!(!h.runtime.is_running(created.container_ref.as_deref().unwrap()));
    }

    #[tokio::test]
    async fn logs_and_reads_are_owner_scoped_and_redacted() {
        let h = Harness::new();
        let created = h.running_instance().await;

        let logs = h
            .controller
            .logs(OWNER, &created.id, DEFAULT_LOG_TAIL)
            .await
            .unwrap();
        assert!(logs.contains("tail=100"));

        let fetched = h.controller.get(OWNER, &created.id).await.unwrap();
        let json = serde_json::to_value(&fetched).unwrap();
        assert_eq!(json["id"], created.id.as_str());
        assert!(json.get("api_key").is_none());
        assert!(json.get("bot_token").is_none());
        assert!(json.get("gateway_token").is_none());
    }
}
