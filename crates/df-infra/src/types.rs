/// Parameters for creating a provider VM.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    /// Provider-side VM name (lowercase, digits, hyphens).
    pub name: String,
    pub image_id: String,
    pub region: String,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub storage_gb: i32,
    /// Provider accelerator type, e.g. `nvidia-tesla-t4`.
    pub accelerator: Option<String>,
}

/// Parameters for creating a provider VM from a machine image.
#[derive(Debug, Clone)]
pub struct RestoreSpec {
    pub name: String,
    pub zone: String,
    pub image_name: String,
    pub cpu_cores: i32,
    pub ram_gb: i32,
    pub storage_gb: i32,
    pub accelerator: Option<String>,
}

/// Linkage returned by the provider once a VM exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub instance_id: String,
    pub zone: String,
    pub machine_type: String,
    pub project_id: String,
}

/// Provider-reported VM status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderStatus {
    pub state: ProviderState,
    pub external_ip: Option<String>,
}

/// Provider VM state vocabulary, normalised across providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Suspended,
    Terminated,
    Unknown,
}

/// Provider-reported machine image status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInfo {
    pub state: ImageState,
    pub size_bytes: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Pending,
    Ready,
    Failed,
    Deleting,
}

impl ImageInfo {
    /// Size of a fully materialized image; `None` while still building.
    pub fn materialized_size(&self) -> Option<i64> {
        match self.state {
            ImageState::Ready => self.size_bytes,
            _ => None,
        }
    }
}
