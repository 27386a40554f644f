use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::Result;
use crate::models::{
    Backup, BackupStatus, BackupUpdate, Instance, InstanceStatus, InstanceUpdate, LeakedResource,
    NewBackup, NewInstance, NewLeakedResource,
};

/// Persistence contract for instance and backup records.
///
/// Status writes are single-record compare-and-set operations: they apply
/// only while the record is still in one of the `expected` statuses and
/// return `None` otherwise, so a stale writer can never overwrite a newer
/// state.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    async fn insert_instance(&self, new: &NewInstance) -> Result<Instance>;

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>>;

    async fn list_instances(&self, owner: &str) -> Result<Vec<Instance>>;

    async fn list_instances_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>>;

    async fn update_instance_status(
        &self,
        id: Uuid,
        expected: &[InstanceStatus],
        update: &InstanceUpdate,
    ) -> Result<Option<Instance>>;

    async fn insert_backup(&self, new: &NewBackup) -> Result<Backup>;

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>>;

    async fn list_backups(&self, owner: &str) -> Result<Vec<Backup>>;

    async fn list_backups_by_status(&self, status: BackupStatus) -> Result<Vec<Backup>>;

    async fn update_backup_status(
        &self,
        id: Uuid,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> Result<Option<Backup>>;

    /// Journal a provider resource that compensation failed to remove.
    async fn record_leak(&self, leak: &NewLeakedResource) -> Result<()>;

    async fn list_leaks(&self) -> Result<Vec<LeakedResource>>;
}

/// PostgreSQL-backed store.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = crate::create_pool(database_url).await?;
        crate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_instance(&self, new: &NewInstance) -> Result<Instance> {
        Ok(Instance::insert(&self.pool, new).await?)
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        Ok(Instance::get_by_id(&self.pool, id).await?)
    }

    async fn list_instances(&self, owner: &str) -> Result<Vec<Instance>> {
        Ok(Instance::list_for_owner(&self.pool, owner).await?)
    }

    async fn list_instances_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>> {
        Ok(Instance::list_by_status(&self.pool, status).await?)
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        expected: &[InstanceStatus],
        update: &InstanceUpdate,
    ) -> Result<Option<Instance>> {
        Ok(Instance::update_status(&self.pool, id, expected, update).await?)
    }

    async fn insert_backup(&self, new: &NewBackup) -> Result<Backup> {
        Ok(Backup::insert(&self.pool, new).await?)
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        Ok(Backup::get_by_id(&self.pool, id).await?)
    }

    async fn list_backups(&self, owner: &str) -> Result<Vec<Backup>> {
        Ok(Backup::list_for_owner(&self.pool, owner).await?)
    }

    async fn list_backups_by_status(&self, status: BackupStatus) -> Result<Vec<Backup>> {
        Ok(Backup::list_by_status(&self.pool, status).await?)
    }

    async fn update_backup_status(
        &self,
        id: Uuid,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> Result<Option<Backup>> {
        Ok(Backup::update_status(&self.pool, id, expected, update).await?)
    }

    async fn record_leak(&self, leak: &NewLeakedResource) -> Result<()> {
        LeakedResource::insert(&self.pool, leak).await?;
        Ok(())
    }

    async fn list_leaks(&self) -> Result<Vec<LeakedResource>> {
        Ok(LeakedResource::list(&self.pool).await?)
    }
}
