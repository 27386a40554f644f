//! Input validation. Runs before any gateway call or write.

use df_db::models::GpuKind;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ValidationError;

pub const MAX_INSTANCE_NAME: usize = 100;
pub const MAX_BACKUP_NAME: usize = 100;
/// Compute Engine resource names are at most 63 characters.
pub const MAX_PROVIDER_NAME: usize = 63;

/// Upper bounds on requested resources.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_cpu_cores: i64,
    pub max_ram_gb: i64,
    pub max_storage_gb: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_cpu_cores: 96,
            max_ram_gb: 624,
            max_storage_gb: 65_536,
        }
    }
}

/// Raw create-instance payload. Fields stay untyped so a wrong JSON type is
/// reported against the field that carried it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstanceInput {
    #[serde(default)]
    pub name: Option<Value>,
    #[serde(default, alias = "imageId")]
    pub image_id: Option<Value>,
    #[serde(default, alias = "cpuCores")]
    pub cpu_cores: Option<Value>,
    #[serde(default, alias = "ramGb")]
    pub ram_gb: Option<Value>,
    #[serde(default, alias = "storageGb")]
    pub storage_gb: Option<Value>,
    #[serde(default)]
    pub gpu: Option<Value>,
    #[serde(default)]
    pub region: Option<Value>,
}

/// Validated, immutable instance configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub name: String,
    pub image_id: String,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub storage_gb: i32,
    pub gpu: GpuKind,
    pub region: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackupInput {
    #[serde(default, alias = "instanceId")]
    pub instance_id: Option<Uuid>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Target of a restore. `zone` defaults to the source instance's zone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RestoreInput {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub zone: Option<String>,
}

pub fn instance_config(
    input: &InstanceInput,
    limits: &Limits,
) -> Result<InstanceConfig, ValidationError> {
    let name = required_str("name", input.name.as_ref())?;
    if name.chars().count() > MAX_INSTANCE_NAME {
        return Err(ValidationError::TooLong {
            field: "name",
            max: MAX_INSTANCE_NAME,
        });
    }

    Ok(InstanceConfig {
        name,
        image_id: required_str("image_id", input.image_id.as_ref())?,
        cpu_cores: positive_int("cpu_cores", input.cpu_cores.as_ref(), limits.max_cpu_cores)?,
        ram_gb: positive_int("ram_gb", input.ram_gb.as_ref(), limits.max_ram_gb)?,
        storage_gb: positive_int(
            "storage_gb",
            input.storage_gb.as_ref(),
            limits.max_storage_gb,
        )?,
        gpu: gpu_kind(input.gpu.as_ref())?,
        region: required_str("region", input.region.as_ref())?,
    })
}

fn required_str(field: &'static str, value: Option<&Value>) -> Result<String, ValidationError> {
    match value {
        None | Some(Value::Null) => Err(ValidationError::Missing { field }),
        Some(Value::String(s)) if s.trim().is_empty() => Err(ValidationError::Missing { field }),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(_) => Err(ValidationError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn positive_int(
    field: &'static str,
    value: Option<&Value>,
    max: i64,
) -> Result<i32, ValidationError> {
    let n = match value {
        None | Some(Value::Null) => return Err(ValidationError::Missing { field }),
        Some(Value::Number(n)) => n.as_i64().ok_or(ValidationError::WrongType {
            field,
            expected: "an integer",
        })?,
        Some(_) => {
            return Err(ValidationError::WrongType {
                field,
                expected: "an integer",
            });
        }
    };
    if n < 1 || n > max {
        return Err(ValidationError::OutOfRange { field, min: 1, max });
    }
    i32::try_from(n).map_err(|_| ValidationError::OutOfRange { field, min: 1, max })
}

fn gpu_kind(value: Option<&Value>) -> Result<GpuKind, ValidationError> {
    match value {
        None | Some(Value::Null) => Ok(GpuKind::None),
        Some(Value::String(s)) => s.parse().map_err(|_| ValidationError::NotInSet {
            field: "gpu",
            allowed: GpuKind::ALL.map(|g| g.as_str()).join(", "),
        }),
        Some(_) => Err(ValidationError::WrongType {
            field: "gpu",
            expected: "a string",
        }),
    }
}

/// Backup display name: letters, digits, space, `-` and `_`.
pub fn backup_name(value: Option<&str>) -> Result<String, ValidationError> {
    let name = value.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ValidationError::Missing { field: "name" });
    }
    if name.chars().count() > MAX_BACKUP_NAME {
        return Err(ValidationError::TooLong {
            field: "name",
            max: MAX_BACKUP_NAME,
        });
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_');
    if !name.chars().all(allowed) {
        return Err(ValidationError::DisallowedCharacters { field: "name" });
    }
    Ok(name.to_string())
}

/// Name for a VM created at the provider: starts with a lowercase letter,
/// then lowercase letters, digits or `-`, not ending in `-`.
pub fn provider_name(field: &'static str, value: Option<&str>) -> Result<String, ValidationError> {
    let name = value.map(str::trim).unwrap_or_default();
    if name.is_empty() {
        return Err(ValidationError::Missing { field });
    }
    if name.len() > MAX_PROVIDER_NAME {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_PROVIDER_NAME,
        });
    }
    let body_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_ok = name.starts_with(|c: char| c.is_ascii_lowercase());
    if !body_ok || !starts_ok || name.ends_with('-') {
        return Err(ValidationError::DisallowedCharacters { field });
    }
    Ok(name.to_string())
}

/// Zone (or region) identifier such as `us-central1-a`.
pub fn zone(value: Option<&str>) -> Result<String, ValidationError> {
    let zone = value.map(str::trim).unwrap_or_default();
    if zone.is_empty() {
        return Err(ValidationError::Missing { field: "zone" });
    }
    if !zone
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(ValidationError::DisallowedCharacters { field: "zone" });
    }
    Ok(zone.to_string())
}
