use chrono::{DateTime, Utc};
use df_core::ValidationError;
use df_core::cost::{self, CostSummary, Pricing};
use df_db::models::{Backup, Instance, InstanceStatus};
use serde::{Deserialize, Serialize};

// ── Requests ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChangeStatusRequest {
    pub status: Option<String>,
}

impl ChangeStatusRequest {
    pub fn target(&self) -> Result<InstanceStatus, ValidationError> {
        let raw = self
            .status
            .as_deref()
            .ok_or(ValidationError::Missing { field: "status" })?;
        raw.trim()
            .parse()
            .map_err(|_| ValidationError::NotInSet {
                field: "status",
                allowed: "RUNNING, STOPPED, DELETED".into(),
            })
    }
}

// ── Responses ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct InstanceResponse {
    #[serde(flatten)]
    pub instance: Instance,
    #[serde(flatten)]
    pub cost: CostSummary,
}

impl InstanceResponse {
    pub fn priced(pricing: &Pricing, instance: Instance, now: DateTime<Utc>) -> Self {
        Self {
            cost: cost::instance_cost(pricing, &instance, now),
            instance,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BackupResponse {
    #[serde(flatten)]
    pub backup: Backup,
    #[serde(flatten)]
    pub cost: CostSummary,
}

impl BackupResponse {
    pub fn priced(pricing: &Pricing, backup: Backup, now: DateTime<Utc>) -> Self {
        Self {
            cost: cost::backup_cost(pricing, &backup, now),
            backup,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub demo: bool,
    pub in_flight: usize,
}
