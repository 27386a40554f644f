pub mod gce;
pub mod types;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use types::{ImageInfo, InstanceSpec, ProviderMetadata, ProviderStatus, RestoreSpec};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compute provider error: {0}")]
    Gce(#[from] gce_api::Error),

    #[error("{0} not found at provider")]
    NotFound(String),

    #[error("{message}")]
    Provider {
        category: ErrorCategory,
        message: String,
    },

    #[error("missing env var: {0}")]
    MissingEnv(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse, machine-readable classification of a provider failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Transient,
    NotFound,
    Quota,
    Permission,
    InvalidRequest,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::NotFound => "not_found",
            Self::Quota => "quota",
            Self::Permission => "permission",
            Self::InvalidRequest => "invalid_request",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify the failure so callers can tell transient from quota from
    /// permission problems without parsing provider messages.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Gce(e) => classify_gce(e),
            Self::NotFound(_) => ErrorCategory::NotFound,
            Self::Provider { category, .. } => *category,
            Self::MissingEnv(_) => ErrorCategory::InvalidRequest,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }

    /// The resource already exists, e.g. a repeated image insert.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Gce(e) if e.status().is_some_and(|s| s.as_u16() == 409))
    }
}

fn classify_gce(e: &gce_api::Error) -> ErrorCategory {
    match e {
        gce_api::Error::Request(_) => ErrorCategory::Transient,
        gce_api::Error::Api { status, body, .. } => {
            let quota = body.to_ascii_lowercase().contains("quota");
            match status.as_u16() {
                404 => ErrorCategory::NotFound,
                403 if quota => ErrorCategory::Quota,
                401 | 403 => ErrorCategory::Permission,
                429 => ErrorCategory::Transient,
                400 | 409 | 412 => ErrorCategory::InvalidRequest,
                500..=599 => ErrorCategory::Transient,
                _ => ErrorCategory::Unknown,
            }
        }
        gce_api::Error::Operation { message, .. } => {
            if message.contains("QUOTA") {
                ErrorCategory::Quota
            } else if message.contains("RESOURCE_POOL_EXHAUSTED") {
                ErrorCategory::Transient
            } else if message.contains("NOT_FOUND") {
                ErrorCategory::NotFound
            } else {
                ErrorCategory::Unknown
            }
        }
    }
}

/// Backend-agnostic interface to the compute provider that hosts desktop VMs
/// and their machine images.
///
/// Implementations own their configuration, loaded from environment
/// variables at construction.
#[async_trait]
pub trait ComputeGateway: Send + Sync + 'static {
    /// Create and boot a VM with the given spec.
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProviderMetadata>;

    async fn start_instance(&self, id: &str, zone: &str) -> Result<()>;

    async fn stop_instance(&self, id: &str, zone: &str) -> Result<()>;

    /// Destroy a VM permanently. Deleting an already-absent VM succeeds.
    async fn delete_instance(&self, id: &str, zone: &str) -> Result<()>;

    /// Current status of a VM; `Error::NotFound` when it does not exist.
    async fn describe_status(&self, id: &str, zone: &str) -> Result<ProviderStatus>;

    /// Start building a machine image from a VM's boot disk. Returns once the
    /// build is accepted; completion is observed through `describe_image`.
    async fn create_image(&self, image_name: &str, source_id: &str, zone: &str) -> Result<()>;

    async fn describe_image(&self, image_name: &str) -> Result<ImageInfo>;

    /// Delete a machine image. Deleting an already-absent image succeeds.
    async fn delete_image(&self, image_name: &str) -> Result<()>;

    /// Create and boot a VM from a machine image.
    async fn create_from_image(&self, spec: &RestoreSpec) -> Result<ProviderMetadata>;

    /// Look a VM up by name; `None` when it does not exist (yet).
    async fn describe_instance(&self, name: &str, zone: &str) -> Result<Option<ProviderStatus>>;

    /// Provider identifier for logs.
    fn name(&self) -> &'static str;
}

/// Build the compute gateway if its required env vars are present.
///
/// Returns `None` when no provider is configured; the service then runs in
/// demo mode with locally simulated instances.
pub fn build_gateway() -> Option<Arc<dyn ComputeGateway>> {
    dotenvy::dotenv().ok();

    match gce::GceGateway::from_env() {
        Ok(g) => {
            tracing::info!(project = %g.project(), "registered Compute Engine gateway");
            Some(Arc::new(g))
        }
        Err(e) => {
            tracing::info!("no compute provider configured, running in demo mode: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, body: &str) -> Error {
        Error::Gce(gce_api::Error::Api {
            endpoint: "test",
            status: reqwest::StatusCode::from_u16(status).unwrap(),
            body: body.into(),
        })
    }

    #[test]
    fn api_statuses_map_to_categories() {
        assert_eq!(api(404, "").category(), ErrorCategory::NotFound);
        assert_eq!(api(403, "Quota 'CPUS' exceeded").category(), ErrorCategory::Quota);
        assert_eq!(api(403, "permission denied").category(), ErrorCategory::Permission);
        assert_eq!(api(401, "").category(), ErrorCategory::Permission);
        assert_eq!(api(503, "").category(), ErrorCategory::Transient);
        assert_eq!(api(400, "bad machine type").category(), ErrorCategory::InvalidRequest);
    }

    #[test]
    fn operation_errors_map_to_categories() {
        let op = |message: &str| {
            Error::Gce(gce_api::Error::Operation {
                operation: "op".into(),
                message: message.into(),
            })
        };
        assert_eq!(op("QUOTA_EXCEEDED: GPUS").category(), ErrorCategory::Quota);
        assert_eq!(
            op("ZONE_RESOURCE_POOL_EXHAUSTED: try later").category(),
            ErrorCategory::Transient
        );
        assert_eq!(op("something odd").category(), ErrorCategory::Unknown);
    }

    #[test]
    fn not_found_is_detectable() {
        assert!(Error::NotFound("vd-1".into()).is_not_found());
        assert!(api(404, "").is_not_found());
        assert!(!api(500, "").is_not_found());
    }

    #[test]
    fn repeated_insert_is_a_conflict() {
        assert!(api(409, "already exists").is_conflict());
        assert!(!api(400, "bad request").is_conflict());
        assert!(!Error::NotFound("img".into()).is_conflict());
    }
}
