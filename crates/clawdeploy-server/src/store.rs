use anyhow::Context;
use async_trait::async_trait;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::PgConnection;

use crate::models::instance::{Instance, InstancePatch, InstanceStatus, NewInstance};

pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// CRUD over instance records. Everything the orchestrator persists goes
/// through this seam.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn create(&self, new: NewInstance) -> anyhow::Result<Instance>;

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Instance>>;

    async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Instance>>;

    async fn list_with_status(&self, statuses: &[InstanceStatus]) -> anyhow::Result<Vec<Instance>>;

    /// Applies a partial update and returns the stored record.
    async fn update(&self, id: &str, patch: InstancePatch) -> anyhow::Result<Instance>;

    /// Returns `false` when no record matched.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    async fn ping(&self) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgInstanceStore {
    pool: DbPool,
}

impl PgInstanceStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceStore for PgInstanceStore {
    async fn create(&self, new: NewInstance) -> anyhow::Result<Instance> {
        let mut conn = self.pool.get()?;
        Instance::insert(&mut conn, &new).with_context(|| format!("insert instance {}", new.id))
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        let mut conn = self.pool.get()?;
        Instance::find(&mut conn, id)
    }

    async fn list_for_owner(&self, owner_id: &str) -> anyhow::Result<Vec<Instance>> {
        let mut conn = self.pool.get()?;
        Instance::list_for_owner(&mut conn, owner_id)
    }

    async fn list_with_status(&self, statuses: &[InstanceStatus]) -> anyhow::Result<Vec<Instance>> {
        let mut conn = self.pool.get()?;
        Instance::list_with_status(&mut conn, statuses)
    }

    async fn update(&self, id: &str, patch: InstancePatch) -> anyhow::Result<Instance> {
        let mut conn = self.pool.get()?;
        Instance::apply_patch(&mut conn, id, &patch)?
            .with_context(|| format!("instance {id} vanished during update"))
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let mut conn = self.pool.get()?;
        Instance::delete(&mut conn, id)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        use diesel::RunQueryDsl;
        let mut conn = self.pool.get()?;
        diesel::sql_query("SELECT 1")
            .execute(&mut conn)
            .context("database ping")?;
        Ok(())
    }
}
