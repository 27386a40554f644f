//! Hourly and accrued cost of instances and backups.
//!
//! Everything here is pure: the clock reading is always passed in.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use df_db::models::{Backup, BackupStatus, GpuKind, Instance, InstanceStatus};
use serde::Serialize;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone)]
pub struct Pricing {
    pub per_cpu_hour: f64,
    pub per_ram_gb_hour: f64,
    pub per_storage_gb_hour: f64,
    pub per_gpu_hour: HashMap<GpuKind, f64>,
    pub markup: f64,
    pub backup_per_gb_hour: f64,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            per_cpu_hour: 0.0332,
            per_ram_gb_hour: 0.0045,
            per_storage_gb_hour: 0.000055,
            per_gpu_hour: HashMap::from([
                (GpuKind::None, 0.0),
                (GpuKind::NvidiaT4, 0.35),
                (GpuKind::NvidiaL4, 0.56),
                (GpuKind::NvidiaV100, 2.48),
                (GpuKind::NvidiaA100, 2.93),
            ]),
            markup: 1.2,
            backup_per_gb_hour: 0.000068,
        }
    }
}

impl Pricing {
    pub fn gpu_rate(&self, gpu: GpuKind) -> f64 {
        self.per_gpu_hour.get(&gpu).copied().unwrap_or(0.0)
    }
}

/// Resource quantities billed per hour.
#[derive(Debug, Clone, Copy)]
pub struct Resources {
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub storage_gb: i32,
    pub gpu: GpuKind,
}

impl From<&Instance> for Resources {
    fn from(instance: &Instance) -> Self {
        Self {
            cpu_cores: instance.cpu_cores,
            ram_gb: instance.ram_gb,
            storage_gb: instance.storage_gb,
            gpu: instance.gpu,
        }
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn hourly_rate(pricing: &Pricing, resources: &Resources) -> f64 {
    let base = f64::from(resources.cpu_cores) * pricing.per_cpu_hour
        + f64::from(resources.ram_gb) * pricing.per_ram_gb_hour
        + f64::from(resources.storage_gb) * pricing.per_storage_gb_hour
        + pricing.gpu_rate(resources.gpu);
    base * pricing.markup
}

/// Storage rate of a backup; zero until its size is known.
pub fn backup_hourly_rate(pricing: &Pricing, storage_bytes: Option<i64>) -> f64 {
    match storage_bytes {
        Some(bytes) if bytes > 0 => {
            (bytes as f64 / GIB) * pricing.backup_per_gb_hour * pricing.markup
        }
        _ => 0.0,
    }
}

pub fn cost(hourly_rate: f64, hours: f64) -> f64 {
    round2(hourly_rate * hours)
}

/// Hours between `created_at` and `end`, never negative.
pub fn elapsed_hours(created_at: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - created_at).num_milliseconds();
    (millis as f64 / 3_600_000.0).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostSummary {
    pub hourly_cost: f64,
    pub accrued_cost: f64,
}

fn billing_end(deleted: bool, updated_at: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    if deleted { updated_at } else { now }
}

pub fn instance_cost(pricing: &Pricing, instance: &Instance, now: DateTime<Utc>) -> CostSummary {
    let rate = hourly_rate(pricing, &Resources::from(instance));
    let end = billing_end(
        instance.status == InstanceStatus::Deleted,
        instance.updated_at,
        now,
    );
    CostSummary {
        hourly_cost: round2(rate),
        accrued_cost: cost(rate, elapsed_hours(instance.created_at, end)),
    }
}

pub fn backup_cost(pricing: &Pricing, backup: &Backup, now: DateTime<Utc>) -> CostSummary {
    let rate = backup_hourly_rate(pricing, backup.storage_bytes);
    let end = billing_end(backup.status == BackupStatus::Deleted, backup.updated_at, now);
    CostSummary {
        hourly_cost: round2(rate),
        accrued_cost: cost(rate, elapsed_hours(backup.created_at, end)),
    }
}
