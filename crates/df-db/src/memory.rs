use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::Result;
use crate::models::{
    Backup, BackupStatus, BackupUpdate, Instance, InstanceStatus, InstanceUpdate, LeakedResource,
    NewBackup, NewInstance, NewLeakedResource,
};
use crate::store::Store;

/// In-process store for local runs without PostgreSQL.
///
/// A single lock serialises writes, which gives the same compare-and-set
/// guarantees as the SQL `UPDATE .. WHERE status = ANY(..)` path.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<Uuid, Instance>,
    backups: HashMap<Uuid, Backup>,
    leaks: Vec<LeakedResource>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted<T, F: Fn(&T) -> chrono::DateTime<Utc>>(mut items: Vec<T>, key: F) -> Vec<T> {
    items.sort_by_key(|item| key(item));
    items
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_instance(&self, new: &NewInstance) -> Result<Instance> {
        let now = Utc::now();
        let link = new.provider.as_ref();
        let instance = Instance {
            id: Uuid::new_v4(),
            owner: new.owner.clone(),
            name: new.name.clone(),
            image_id: new.image_id.clone(),
            cpu_cores: new.cpu_cores,
            ram_gb: new.ram_gb,
            storage_gb: new.storage_gb,
            gpu: new.gpu,
            region: new.region.clone(),
            status: new.status,
            error_message: new.error_message.clone(),
            provider_instance_id: link.map(|l| l.provider_instance_id.clone()),
            zone: link.map(|l| l.zone.clone()),
            machine_type: link.map(|l| l.machine_type.clone()),
            project_id: link.map(|l| l.project_id.clone()),
            external_ip: None,
            source_backup_id: new.source_backup_id,
            created_at: now,
            updated_at: now,
        };
        self.inner
            .write()
            .await
            .instances
            .insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        Ok(self.inner.read().await.instances.get(&id).cloned())
    }

    async fn list_instances(&self, owner: &str) -> Result<Vec<Instance>> {
        let inner = self.inner.read().await;
        let items = inner
            .instances
            .values()
            .filter(|i| i.owner == owner)
            .cloned()
            .collect();
        Ok(sorted(items, |i: &Instance| i.created_at))
    }

    async fn list_instances_by_status(&self, status: InstanceStatus) -> Result<Vec<Instance>> {
        let inner = self.inner.read().await;
        let items = inner
            .instances
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect();
        Ok(sorted(items, |i: &Instance| i.created_at))
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        expected: &[InstanceStatus],
        update: &InstanceUpdate,
    ) -> Result<Option<Instance>> {
        let mut inner = self.inner.write().await;
        let Some(instance) = inner.instances.get_mut(&id) else {
            return Ok(None);
        };
        if !expected.contains(&instance.status) {
            return Ok(None);
        }
        instance.status = update.status;
        instance.error_message = update.error_message.clone();
        if update.external_ip.is_some() {
            instance.external_ip = update.external_ip.clone();
        }
        instance.updated_at = Utc::now();
        Ok(Some(instance.clone()))
    }

    async fn insert_backup(&self, new: &NewBackup) -> Result<Backup> {
        let backup = Backup {
            id: Uuid::new_v4(),
            owner: new.owner.clone(),
            instance_id: new.instance_id,
            name: new.name.clone(),
            status: BackupStatus::Creating,
            storage_bytes: None,
            error_message: None,
            image_name: new.image_name.clone(),
            source_instance_name: new.source_instance_name.clone(),
            source_zone: new.source_zone.clone(),
            created_at: new.created_at,
            updated_at: new.created_at,
        };
        self.inner
            .write()
            .await
            .backups
            .insert(backup.id, backup.clone());
        Ok(backup)
    }

    async fn get_backup(&self, id: Uuid) -> Result<Option<Backup>> {
        Ok(self.inner.read().await.backups.get(&id).cloned())
    }

    async fn list_backups(&self, owner: &str) -> Result<Vec<Backup>> {
        let inner = self.inner.read().await;
        let items = inner
            .backups
            .values()
            .filter(|b| b.owner == owner)
            .cloned()
            .collect();
        Ok(sorted(items, |b: &Backup| b.created_at))
    }

    async fn list_backups_by_status(&self, status: BackupStatus) -> Result<Vec<Backup>> {
        let inner = self.inner.read().await;
        let items = inner
            .backups
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        Ok(sorted(items, |b: &Backup| b.created_at))
    }

    async fn update_backup_status(
        &self,
        id: Uuid,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> Result<Option<Backup>> {
        let mut inner = self.inner.write().await;
        let Some(backup) = inner.backups.get_mut(&id) else {
            return Ok(None);
        };
        if !expected.contains(&backup.status) {
            return Ok(None);
        }
        backup.status = update.status;
        backup.error_message = update.error_message.clone();
        if backup.storage_bytes.is_none() {
            backup.storage_bytes = update.storage_bytes;
        }
        backup.updated_at = Utc::now();
        Ok(Some(backup.clone()))
    }

    async fn record_leak(&self, leak: &NewLeakedResource) -> Result<()> {
        self.inner.write().await.leaks.push(LeakedResource {
            id: Uuid::new_v4(),
            kind: leak.kind.to_string(),
            provider_id: leak.provider_id.clone(),
            zone: leak.zone.clone(),
            owner: leak.owner.clone(),
            reason: leak.reason.clone(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn list_leaks(&self) -> Result<Vec<LeakedResource>> {
        Ok(self.inner.read().await.leaks.clone())
    }
}
