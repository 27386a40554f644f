use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

// ── Enums ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "instance_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Provisioning,
    Running,
    Stopped,
    Error,
    Deleted,
}

impl InstanceStatus {
    pub const ALL: [Self; 5] = [
        Self::Provisioning,
        Self::Running,
        Self::Stopped,
        Self::Error,
        Self::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        }
    }

    fn db_name(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "backup_status", rename_all = "lowercase")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Creating,
    Completed,
    Error,
    Deleted,
}

impl BackupStatus {
    pub const ALL: [Self; 4] = [Self::Creating, Self::Completed, Self::Error, Self::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Deleted => "DELETED",
        }
    }

    fn db_name(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// GPU attached to an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "gpu_kind", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GpuKind {
    None,
    NvidiaT4,
    NvidiaL4,
    NvidiaV100,
    NvidiaA100,
}

impl GpuKind {
    pub const ALL: [Self; 5] = [
        Self::None,
        Self::NvidiaT4,
        Self::NvidiaL4,
        Self::NvidiaV100,
        Self::NvidiaA100,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::NvidiaT4 => "NVIDIA_T4",
            Self::NvidiaL4 => "NVIDIA_L4",
            Self::NvidiaV100 => "NVIDIA_V100",
            Self::NvidiaA100 => "NVIDIA_A100",
        }
    }

    /// Compute Engine accelerator type, `None` for CPU-only instances.
    pub fn accelerator_type(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::NvidiaT4 => Some("nvidia-tesla-t4"),
            Self::NvidiaL4 => Some("nvidia-l4"),
            Self::NvidiaV100 => Some("nvidia-tesla-v100"),
            Self::NvidiaA100 => Some("nvidia-tesla-a100"),
        }
    }
}

impl fmt::Display for GpuKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GpuKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|gpu| gpu.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

fn status_names<T>(statuses: &[T], name: fn(&T) -> &'static str) -> Vec<String> {
    statuses.iter().map(|s| name(s).to_string()).collect()
}

// ── Instance ────────────────────────────────────────────────────────

/// Provider-side linkage of a provider-managed instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLink {
    pub provider_instance_id: String,
    pub zone: String,
    pub machine_type: String,
    pub project_id: String,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Instance {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub image_id: String,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub storage_gb: i32,
    pub gpu: GpuKind,
    pub region: String,
    pub status: InstanceStatus,
    pub error_message: Option<String>,
    pub provider_instance_id: Option<String>,
    pub zone: Option<String>,
    pub machine_type: Option<String>,
    pub project_id: Option<String>,
    pub external_ip: Option<String>,
    pub source_backup_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    /// Linkage fields, present only for provider-managed instances.
    pub fn provider_link(&self) -> Option<ProviderLink> {
        match (
            &self.provider_instance_id,
            &self.zone,
            &self.machine_type,
            &self.project_id,
        ) {
            (Some(id), Some(zone), Some(machine_type), Some(project_id)) => Some(ProviderLink {
                provider_instance_id: id.clone(),
                zone: zone.clone(),
                machine_type: machine_type.clone(),
                project_id: project_id.clone(),
            }),
            _ => None,
        }
    }

    pub fn is_provider_managed(&self) -> bool {
        self.provider_instance_id.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub owner: String,
    pub name: String,
    pub image_id: String,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub storage_gb: i32,
    pub gpu: GpuKind,
    pub region: String,
    pub status: InstanceStatus,
    pub error_message: Option<String>,
    pub provider: Option<ProviderLink>,
    pub source_backup_id: Option<Uuid>,
}

/// Single-record status write. `error_message` replaces the stored value
/// (`None` clears it); `external_ip` only overwrites when present.
#[derive(Debug, Clone)]
pub struct InstanceUpdate {
    pub status: InstanceStatus,
    pub error_message: Option<String>,
    pub external_ip: Option<String>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status,
            error_message: None,
            external_ip: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: InstanceStatus::Error,
            error_message: Some(message.into()),
            external_ip: None,
        }
    }

    pub fn with_external_ip(mut self, ip: Option<String>) -> Self {
        self.external_ip = ip;
        self
    }
}

impl Instance {
    pub async fn insert(pool: &PgPool, new: &NewInstance) -> sqlx::Result<Self> {
        let link = new.provider.as_ref();
        sqlx::query_as(
            r#"INSERT INTO instances (owner, name, image_id, cpu_cores, ram_gb, storage_gb, gpu, region,
                                      status, error_message, provider_instance_id, zone, machine_type,
                                      project_id, source_backup_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
               RETURNING *"#,
        )
        .bind(&new.owner)
        .bind(&new.name)
        .bind(&new.image_id)
        .bind(new.cpu_cores)
        .bind(new.ram_gb)
        .bind(new.storage_gb)
        .bind(new.gpu)
        .bind(&new.region)
        .bind(new.status)
        .bind(&new.error_message)
        .bind(link.map(|l| l.provider_instance_id.as_str()))
        .bind(link.map(|l| l.zone.as_str()))
        .bind(link.map(|l| l.machine_type.as_str()))
        .bind(link.map(|l| l.project_id.as_str()))
        .bind(new.source_backup_id)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM instances WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_owner(pool: &PgPool, owner: &str) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM instances WHERE owner = $1 ORDER BY created_at")
            .bind(owner)
            .fetch_all(pool)
            .await
    }

    pub async fn list_by_status(pool: &PgPool, status: InstanceStatus) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM instances WHERE status = $1 ORDER BY created_at")
            .bind(status)
            .fetch_all(pool)
            .await
    }

    /// Compare-and-set status write: applies only while the row is still in
    /// one of `expected`. Returns `None` when the row moved on (or is absent).
    pub async fn update_status(
        pool: &PgPool,
        id: Uuid,
        expected: &[InstanceStatus],
        update: &InstanceUpdate,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as(
            r#"UPDATE instances
               SET status        = $3,
                   error_message = $4,
                   external_ip   = COALESCE($5, external_ip),
                   updated_at    = now()
               WHERE id = $1 AND status::text = ANY($2)
               RETURNING *"#,
        )
        .bind(id)
        .bind(status_names(expected, InstanceStatus::db_name))
        .bind(update.status)
        .bind(&update.error_message)
        .bind(&update.external_ip)
        .fetch_optional(pool)
        .await
    }
}

// ── Backup ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Backup {
    pub id: Uuid,
    pub owner: String,
    pub instance_id: Uuid,
    pub name: String,
    pub status: BackupStatus,
    pub storage_bytes: Option<i64>,
    pub error_message: Option<String>,
    pub image_name: Option<String>,
    pub source_instance_name: String,
    pub source_zone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBackup {
    pub owner: String,
    pub instance_id: Uuid,
    pub name: String,
    pub image_name: Option<String>,
    pub source_instance_name: String,
    pub source_zone: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Single-record status write. `storage_bytes` is write-once: an already
/// recorded size is never replaced.
#[derive(Debug, Clone)]
pub struct BackupUpdate {
    pub status: BackupStatus,
    pub error_message: Option<String>,
    pub storage_bytes: Option<i64>,
}

impl BackupUpdate {
    pub fn status(status: BackupStatus) -> Self {
        Self {
            status,
            error_message: None,
            storage_bytes: None,
        }
    }

    pub fn completed(storage_bytes: i64) -> Self {
        Self {
            status: BackupStatus::Completed,
            error_message: None,
            storage_bytes: Some(storage_bytes),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: BackupStatus::Error,
            error_message: Some(message.into()),
            storage_bytes: None,
        }
    }
}

impl Backup {
    pub async fn insert(pool: &PgPool, new: &NewBackup) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO backups (owner, instance_id, name, status, image_name,
                                    source_instance_name, source_zone, created_at, updated_at)
               VALUES ($1, $2, $3, 'creating', $4, $5, $6, $7, $7)
               RETURNING *"#,
        )
        .bind(&new.owner)
        .bind(new.instance_id)
        .bind(&new.name)
        .bind(&new.image_name)
        .bind(&new.source_instance_name)
        .bind(&new.source_zone)
        .bind(new.created_at)
        .fetch_one(pool)
        .await
    }

    pub async fn get_by_id(pool: &PgPool, id: Uuid) -> sqlx::Result<Option<Self>> {
        sqlx::query_as("SELECT * FROM backups WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn list_for_owner(pool: &PgPool, owner: &str) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM backups WHERE owner = $1 ORDER BY created_at")
            .bind(owner)
            .fetch_all(pool)
            .await
    }

    pub async fn list_by_status(pool: &PgPool, status: BackupStatus) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM backups WHERE status = $1 ORDER BY created_at")
            .bind(status)
            .fetch_all(pool)
            .await
    }

    /// Compare-and-set status write, see [`Instance::update_status`].
    pub async fn update_status(
        pool: &PgPool,
        id: Uuid,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> sqlx::Result<Option<Self>> {
        sqlx::query_as(
            r#"UPDATE backups
               SET status        = $3,
                   error_message = $4,
                   storage_bytes = COALESCE(storage_bytes, $5),
                   updated_at    = now()
               WHERE id = $1 AND status::text = ANY($2)
               RETURNING *"#,
        )
        .bind(id)
        .bind(status_names(expected, BackupStatus::db_name))
        .bind(update.status)
        .bind(&update.error_message)
        .bind(update.storage_bytes)
        .fetch_optional(pool)
        .await
    }
}

// ── LeakedResource ──────────────────────────────────────────────────

/// A provider resource that compensation failed to clean up.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct LeakedResource {
    pub id: Uuid,
    pub kind: String,
    pub provider_id: String,
    pub zone: Option<String>,
    pub owner: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLeakedResource {
    pub kind: &'static str,
    pub provider_id: String,
    pub zone: Option<String>,
    pub owner: String,
    pub reason: String,
}

impl LeakedResource {
    pub async fn insert(pool: &PgPool, new: &NewLeakedResource) -> sqlx::Result<Self> {
        sqlx::query_as(
            r#"INSERT INTO leaked_resources (kind, provider_id, zone, owner, reason)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING *"#,
        )
        .bind(new.kind)
        .bind(&new.provider_id)
        .bind(&new.zone)
        .bind(&new.owner)
        .bind(&new.reason)
        .fetch_one(pool)
        .await
    }

    pub async fn list(pool: &PgPool) -> sqlx::Result<Vec<Self>> {
        sqlx::query_as("SELECT * FROM leaked_resources ORDER BY created_at")
            .fetch_all(pool)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parse_is_case_insensitive() {
        assert_eq!("running".parse::<InstanceStatus>(), Ok(InstanceStatus::Running));
        assert_eq!("DELETED".parse::<InstanceStatus>(), Ok(InstanceStatus::Deleted));
        assert!("paused".parse::<InstanceStatus>().is_err());
    }

    #[test]
    fn statuses_serialize_upper_case() {
        let json = serde_json::to_string(&InstanceStatus::Provisioning).unwrap();
        assert_eq!(json, "\"PROVISIONING\"");
        let json = serde_json::to_string(&BackupStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
        let gpu: GpuKind = serde_json::from_str("\"NVIDIA_T4\"").unwrap();
        assert_eq!(gpu, GpuKind::NvidiaT4);
    }

    #[test]
    fn gpu_kinds_round_trip_through_names() {
        for gpu in GpuKind::ALL {
            assert_eq!(gpu.as_str().parse::<GpuKind>(), Ok(gpu));
        }
        assert_eq!(GpuKind::None.accelerator_type(), None);
        assert_eq!(GpuKind::NvidiaL4.accelerator_type(), Some("nvidia-l4"));
    }
}
