//! One procedure per user-facing operation on instances and backups.
//!
//! Each procedure validates, calls the compute gateway, persists the outcome
//! and compensates when a step after a provider side effect fails. Without a
//! gateway the coordinator runs in demo mode: instances and backups are
//! simulated locally and complete on timers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use df_db::Store;
use df_db::models::{
    Backup, BackupStatus, BackupUpdate, Instance, InstanceStatus, InstanceUpdate,
    LeakedResource, NewBackup, NewInstance, NewLeakedResource, ProviderLink,
};
use df_infra::ComputeGateway;
use df_infra::types::{InstanceSpec, ProviderMetadata, ProviderState, RestoreSpec};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cost::Resources;
use crate::error::{EntityKind, Error, Record, Result, TransitionError, ValidationError};
use crate::lifecycle::{self, LIVE_INSTANCE};
use crate::reconciler::{GIB, Reconciler, ReconcilerSettings};
use crate::validate::{self, BackupInput, InstanceConfig, InstanceInput, Limits, RestoreInput};

#[derive(Debug, Clone)]
pub struct Settings {
    pub limits: Limits,
    pub reconciler: ReconcilerSettings,
    /// Sizing of a restored instance whose source record is gone.
    pub restore_defaults: Resources,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            reconciler: ReconcilerSettings::default(),
            restore_defaults: Resources {
                cpu_cores: 2,
                ram_gb: 8,
                storage_gb: 50,
                gpu: df_db::models::GpuKind::None,
            },
        }
    }
}

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<dyn Store>,
    gateway: Option<Arc<dyn ComputeGateway>>,
    reconciler: Reconciler,
    limits: Limits,
    restore_defaults: Resources,
}

/// Map the provider's view after a start/stop onto the local enum. Anything
/// that is not running or on its way there counts as STOPPED.
pub fn verified_status(state: ProviderState) -> InstanceStatus {
    match state {
        ProviderState::Running | ProviderState::Provisioning => InstanceStatus::Running,
        ProviderState::Stopping
        | ProviderState::Stopped
        | ProviderState::Suspended
        | ProviderState::Terminated
        | ProviderState::Unknown => InstanceStatus::Stopped,
    }
}

/// Provider VM name for a new instance.
fn vm_name() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("vd-{}", &id[..12])
}

/// Image name for a backup of `instance_id`. The random tail separates
/// backups taken in the same millisecond.
pub fn image_name(instance_id: Uuid, created_at: DateTime<Utc>) -> String {
    let tail = Uuid::new_v4().simple().to_string();
    format!(
        "bk-{}-{}-{}",
        instance_id.simple(),
        created_at.timestamp_millis(),
        &tail[..6]
    )
}

fn link_from(meta: ProviderMetadata) -> ProviderLink {
    ProviderLink {
        provider_instance_id: meta.instance_id,
        zone: meta.zone,
        machine_type: meta.machine_type,
        project_id: meta.project_id,
    }
}

fn new_instance(owner: &str, config: &InstanceConfig) -> NewInstance {
    NewInstance {
        owner: owner.to_string(),
        name: config.name.clone(),
        image_id: config.image_id.clone(),
        cpu_cores: config.cpu_cores,
        ram_gb: config.ram_gb,
        storage_gb: config.storage_gb,
        gpu: config.gpu,
        region: config.region.clone(),
        status: InstanceStatus::Provisioning,
        error_message: None,
        provider: None,
        source_backup_id: None,
    }
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Option<Arc<dyn ComputeGateway>>,
        settings: Settings,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone(), gateway.clone(), settings.reconciler);
        Self {
            store,
            gateway,
            reconciler,
            limits: settings.limits,
            restore_defaults: settings.restore_defaults,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn is_demo(&self) -> bool {
        self.gateway.is_none()
    }

    fn gateway_for(&self, kind: EntityKind, id: Uuid) -> Result<Arc<dyn ComputeGateway>> {
        self.gateway
            .clone()
            .ok_or(Error::ProviderUnavailable { kind, id })
    }

    async fn owned_instance(&self, owner: &str, id: Uuid) -> Result<Instance> {
        let instance = self.store.get_instance(id).await?.ok_or(Error::NotFound {
            kind: EntityKind::Instance,
            id,
        })?;
        if instance.owner != owner {
            return Err(Error::Forbidden {
                kind: EntityKind::Instance,
                id,
            });
        }
        Ok(instance)
    }

    async fn owned_backup(&self, owner: &str, id: Uuid) -> Result<Backup> {
        let backup = self.store.get_backup(id).await?.ok_or(Error::NotFound {
            kind: EntityKind::Backup,
            id,
        })?;
        if backup.owner != owner {
            return Err(Error::Forbidden {
                kind: EntityKind::Backup,
                id,
            });
        }
        Ok(backup)
    }

    async fn write_instance(
        &self,
        instance: &Instance,
        expected: &[InstanceStatus],
        update: InstanceUpdate,
    ) -> Result<Instance> {
        self.store
            .update_instance_status(instance.id, expected, &update)
            .await?
            .ok_or(Error::Conflict {
                kind: EntityKind::Instance,
                id: instance.id,
            })
    }

    /// Persist ERROR with the provider's reason and build the error returned
    /// to the caller.
    async fn instance_failure(
        &self,
        instance: &Instance,
        message: String,
        cause: &df_infra::Error,
    ) -> Error {
        warn!(instance_id = %instance.id, category = %cause.category(), "{message}");
        let record = match self
            .store
            .update_instance_status(instance.id, &LIVE_INSTANCE, &InstanceUpdate::error(&message))
            .await
        {
            Ok(updated) => updated.map(|i| Record::Instance(Box::new(i))),
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "could not record provider failure");
                None
            }
        };
        Error::provider(cause, message, record)
    }

    /// Undo a VM whose record could not be written. Failures are logged and
    /// journaled, never retried.
    async fn compensate_vm(&self, owner: &str, link: &ProviderLink, cause: &df_db::Error) {
        error!(
            provider_instance_id = %link.provider_instance_id,
            zone = %link.zone,
            error = %cause,
            "record write failed after VM creation, deleting VM"
        );
        let Some(gateway) = &self.gateway else {
            return;
        };
        let Err(e) = gateway
            .delete_instance(&link.provider_instance_id, &link.zone)
            .await
        else {
            info!(provider_instance_id = %link.provider_instance_id, "compensating delete succeeded");
            return;
        };

        error!(
            provider_instance_id = %link.provider_instance_id,
            zone = %link.zone,
            owner,
            error = %e,
            "compensating delete failed, VM leaked"
        );
        let leak = NewLeakedResource {
            kind: "instance",
            provider_id: link.provider_instance_id.clone(),
            zone: Some(link.zone.clone()),
            owner: owner.to_string(),
            reason: format!("record write failed: {cause}; delete failed: {e}"),
        };
        if let Err(journal) = self.store.record_leak(&leak).await {
            error!(
                provider_instance_id = %link.provider_instance_id,
                error = %journal,
                "could not journal leaked VM"
            );
        }
    }

    /// Insert the record of a VM the provider just created, compensating if
    /// the write fails.
    async fn persist_provisioned(
        &self,
        mut new: NewInstance,
        meta: ProviderMetadata,
    ) -> Result<Instance> {
        let link = link_from(meta);
        new.provider = Some(link.clone());
        match self.store.insert_instance(&new).await {
            Ok(instance) => Ok(instance),
            Err(e) => {
                self.compensate_vm(&new.owner, &link, &e).await;
                Err(e.into())
            }
        }
    }

    /// Insert an ERROR record for a create the provider refused.
    async fn persist_refused(
        &self,
        mut new: NewInstance,
        message: String,
        cause: &df_infra::Error,
    ) -> Error {
        new.status = InstanceStatus::Error;
        new.error_message = Some(message.clone());
        match self.store.insert_instance(&new).await {
            Ok(record) => Error::provider(cause, message, Some(Record::Instance(Box::new(record)))),
            Err(e) => e.into(),
        }
    }

    // ── Instances ───────────────────────────────────────────────────

    pub async fn create_instance(&self, owner: &str, input: &InstanceInput) -> Result<Instance> {
        let config = validate::instance_config(input, &self.limits)?;
        let new = new_instance(owner, &config);

        let Some(gateway) = self.gateway.clone() else {
            let instance = self.store.insert_instance(&new).await?;
            info!(instance_id = %instance.id, owner, "demo instance provisioning");
            self.reconciler.schedule_boot(instance.clone());
            return Ok(instance);
        };

        let spec = InstanceSpec {
            name: vm_name(),
            image_id: config.image_id.clone(),
            region: config.region.clone(),
            cpu_cores: config.cpu_cores,
            ram_gb: config.ram_gb,
            storage_gb: config.storage_gb,
            accelerator: config.gpu.accelerator_type().map(String::from),
        };

        let meta = match gateway.create_instance(&spec).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(owner, vm = %spec.name, category = %e.category(), error = %e, "provider refused instance");
                let message = format!("provisioning failed: {e}");
                return Err(self.persist_refused(new, message, &e).await);
            }
        };

        let instance = self.persist_provisioned(new, meta).await?;
        info!(
            instance_id = %instance.id,
            owner,
            vm = %spec.name,
            provider = gateway.name(),
            "instance provisioning"
        );
        self.reconciler.schedule_boot(instance.clone());
        Ok(instance)
    }

    pub async fn get_instance(&self, owner: &str, id: Uuid) -> Result<Instance> {
        self.owned_instance(owner, id).await
    }

    pub async fn list_instances(&self, owner: &str) -> Result<Vec<Instance>> {
        Ok(self.store.list_instances(owner).await?)
    }

    /// Start or stop an instance. A DELETED request is a delete.
    pub async fn change_status(
        &self,
        owner: &str,
        id: Uuid,
        requested: InstanceStatus,
    ) -> Result<Instance> {
        match requested {
            InstanceStatus::Running | InstanceStatus::Stopped => {}
            InstanceStatus::Deleted => return self.delete_instance(owner, id).await,
            InstanceStatus::Provisioning | InstanceStatus::Error => {
                return Err(ValidationError::NotInSet {
                    field: "status",
                    allowed: "RUNNING, STOPPED, DELETED".into(),
                }
                .into());
            }
        }

        let instance = self.owned_instance(owner, id).await?;
        lifecycle::check_instance(instance.status, requested)?;

        let Some(link) = instance.provider_link() else {
            let updated = self
                .write_instance(&instance, &[instance.status], InstanceUpdate::status(requested))
                .await?;
            info!(instance_id = %id, status = %requested, "demo instance status changed");
            return Ok(updated);
        };
        let gateway = self.gateway_for(EntityKind::Instance, id)?;

        let (action, result) = if requested == InstanceStatus::Running {
            (
                "start",
                gateway
                    .start_instance(&link.provider_instance_id, &link.zone)
                    .await,
            )
        } else {
            (
                "stop",
                gateway
                    .stop_instance(&link.provider_instance_id, &link.zone)
                    .await,
            )
        };
        if let Err(e) = result {
            return Err(self
                .instance_failure(&instance, format!("{action} failed: {e}"), &e)
                .await);
        }

        let observed = match gateway
            .describe_status(&link.provider_instance_id, &link.zone)
            .await
        {
            Ok(observed) => observed,
            Err(e) => {
                return Err(self
                    .instance_failure(&instance, format!("status check after {action} failed: {e}"), &e)
                    .await);
            }
        };

        let verified = verified_status(observed.state);
        if verified != requested {
            warn!(
                instance_id = %id,
                %requested,
                %verified,
                provider_state = ?observed.state,
                "provider state differs from requested status"
            );
        }
        let update = InstanceUpdate::status(verified).with_external_ip(observed.external_ip);
        let updated = self.write_instance(&instance, &LIVE_INSTANCE, update).await?;
        info!(instance_id = %id, status = %verified, "instance {action} verified");
        Ok(updated)
    }

    /// Soft-delete. A provider-managed VM must be gone before the record is
    /// marked DELETED.
    pub async fn delete_instance(&self, owner: &str, id: Uuid) -> Result<Instance> {
        let instance = self.owned_instance(owner, id).await?;
        lifecycle::check_instance(instance.status, InstanceStatus::Deleted)?;

        if let Some(link) = instance.provider_link() {
            let gateway = self.gateway_for(EntityKind::Instance, id)?;
            if let Err(e) = gateway
                .delete_instance(&link.provider_instance_id, &link.zone)
                .await
            {
                return Err(self
                    .instance_failure(&instance, format!("delete failed: {e}"), &e)
                    .await);
            }
        }

        let deleted = self
            .write_instance(&instance, &LIVE_INSTANCE, InstanceUpdate::status(InstanceStatus::Deleted))
            .await?;
        info!(instance_id = %id, owner, "instance deleted");
        Ok(deleted)
    }

    // ── Backups ─────────────────────────────────────────────────────

    /// Persist a CREATING backup and hand the image build to the reconciler.
    pub async fn create_backup(&self, owner: &str, input: &BackupInput) -> Result<Backup> {
        let name = validate::backup_name(input.name.as_deref())?;
        let instance_id = input
            .instance_id
            .ok_or(ValidationError::Missing { field: "instance_id" })?;

        let instance = self.owned_instance(owner, instance_id).await?;
        if instance.status == InstanceStatus::Deleted {
            return Err(TransitionError::NotAllowedIn {
                kind: EntityKind::Instance,
                status: instance.status.as_str(),
                operation: "backup",
                required: "an instance that is not DELETED",
            }
            .into());
        }

        let link = instance.provider_link();
        if let Some(link) = &link {
            let gateway = self.gateway_for(EntityKind::Instance, instance_id)?;
            if let Err(e) = gateway
                .describe_status(&link.provider_instance_id, &link.zone)
                .await
            {
                let message = if e.is_not_found() {
                    format!(
                        "VM {} no longer exists at the provider",
                        link.provider_instance_id
                    )
                } else {
                    format!("could not verify VM at the provider: {e}")
                };
                warn!(%instance_id, error = %e, "backup rejected");
                return Err(Error::provider(&e, message, None));
            }
        }

        let created_at = Utc::now();
        let new = NewBackup {
            owner: owner.to_string(),
            instance_id,
            name,
            image_name: link.as_ref().map(|_| image_name(instance_id, created_at)),
            source_instance_name: instance.name.clone(),
            source_zone: Some(
                link.as_ref()
                    .map(|l| l.zone.clone())
                    .unwrap_or_else(|| instance.region.clone()),
            ),
            created_at,
        };
        let backup = self.store.insert_backup(&new).await?;
        info!(backup_id = %backup.id, %instance_id, owner, "backup creating");

        match link {
            Some(link) => self.reconciler.schedule_image_build(backup.clone(), link),
            None => self
                .reconciler
                .schedule_demo_backup(backup.id, i64::from(instance.storage_gb) * GIB),
        };
        Ok(backup)
    }

    pub async fn get_backup(&self, owner: &str, id: Uuid) -> Result<Backup> {
        self.owned_backup(owner, id).await
    }

    pub async fn list_backups(&self, owner: &str) -> Result<Vec<Backup>> {
        Ok(self.store.list_backups(owner).await?)
    }

    /// Provider resources that compensation failed to remove for this owner.
    pub async fn leaked_resources(&self, owner: &str) -> Result<Vec<LeakedResource>> {
        let leaks = self.store.list_leaks().await?;
        Ok(leaks.into_iter().filter(|leak| leak.owner == owner).collect())
    }

    /// Soft-delete. The provider image, if any, is removed first.
    pub async fn delete_backup(&self, owner: &str, id: Uuid) -> Result<Backup> {
        let backup = self.owned_backup(owner, id).await?;
        lifecycle::check_backup(backup.status, BackupStatus::Deleted)?;
        let deletable = [BackupStatus::Completed, BackupStatus::Error];

        if let Some(image) = &backup.image_name {
            let gateway = self.gateway_for(EntityKind::Backup, id)?;
            if let Err(e) = gateway.delete_image(image).await {
                let message = format!("image deletion failed: {e}");
                warn!(backup_id = %id, category = %e.category(), "{message}");
                // Status and size stay as they were; only the reason is noted.
                let note = BackupUpdate {
                    status: backup.status,
                    error_message: Some(message.clone()),
                    storage_bytes: None,
                };
                let record = match self.store.update_backup_status(id, &[backup.status], &note).await {
                    Ok(Some(updated)) => updated,
                    Ok(None) => backup,
                    Err(db) => {
                        error!(backup_id = %id, error = %db, "could not record image deletion failure");
                        backup
                    }
                };
                return Err(Error::provider(&e, message, Some(Record::Backup(Box::new(record)))));
            }
        }

        let deleted = self
            .store
            .update_backup_status(id, &deletable, &BackupUpdate::status(BackupStatus::Deleted))
            .await?
            .ok_or(Error::Conflict {
                kind: EntityKind::Backup,
                id,
            })?;
        info!(backup_id = %id, owner, "backup deleted");
        Ok(deleted)
    }

    /// Create a new instance from a COMPLETED backup.
    pub async fn restore_backup(
        &self,
        owner: &str,
        backup_id: Uuid,
        input: &RestoreInput,
    ) -> Result<Instance> {
        let backup = self.owned_backup(owner, backup_id).await?;
        lifecycle::check_restorable(backup.status)?;
        let name = validate::provider_name("name", input.name.as_deref())?;
        let zone = validate::zone(input.zone.as_deref().or(backup.source_zone.as_deref()))?;

        let sizing = match self.store.get_instance(backup.instance_id).await? {
            Some(source) => Resources::from(&source),
            None => self.restore_defaults,
        };

        let new = NewInstance {
            owner: owner.to_string(),
            name: name.clone(),
            image_id: backup
                .image_name
                .clone()
                .unwrap_or_else(|| format!("backup-{}", backup.id.simple())),
            cpu_cores: sizing.cpu_cores,
            ram_gb: sizing.ram_gb,
            storage_gb: sizing.storage_gb,
            gpu: sizing.gpu,
            region: zone.clone(),
            status: InstanceStatus::Provisioning,
            error_message: None,
            provider: None,
            source_backup_id: Some(backup.id),
        };

        let Some(image) = backup.image_name.clone() else {
            let instance = self.store.insert_instance(&new).await?;
            info!(instance_id = %instance.id, %backup_id, "demo restore provisioning");
            self.reconciler.schedule_boot(instance.clone());
            return Ok(instance);
        };
        let gateway = self.gateway_for(EntityKind::Backup, backup_id)?;

        let spec = RestoreSpec {
            name,
            zone,
            image_name: image,
            cpu_cores: sizing.cpu_cores,
            ram_gb: sizing.ram_gb,
            storage_gb: sizing.storage_gb,
            accelerator: sizing.gpu.accelerator_type().map(String::from),
        };
        let meta = match gateway.create_from_image(&spec).await {
            Ok(meta) => meta,
            Err(e) => {
                warn!(%backup_id, category = %e.category(), error = %e, "provider refused restore");
                let message = format!("restore failed: {e}");
                return Err(self.persist_refused(new, message, &e).await);
            }
        };

        let instance = self.persist_provisioned(new, meta).await?;
        info!(instance_id = %instance.id, %backup_id, owner, "restore provisioning");
        self.reconciler.schedule_restore_watch(instance.clone());
        Ok(instance)
    }
}
