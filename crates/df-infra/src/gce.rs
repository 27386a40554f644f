use std::collections::HashMap;

use async_trait::async_trait;
use gce_api::{
    AcceleratorConfig, AccessConfig, AttachedDisk, DiskInitializeParams, GceClient,
    InsertImageRequest, InsertInstanceRequest, NetworkInterface, Operation, Scheduling,
};
use tracing::{info, warn};

use crate::types::{
    ImageInfo, ImageState, InstanceSpec, ProviderMetadata, ProviderState, ProviderStatus,
    RestoreSpec,
};
use crate::{ComputeGateway, Error, ErrorCategory, Result};

const GIB: i64 = 1024 * 1024 * 1024;

/// Google Compute Engine gateway.
///
/// Delegates to `gce_api::GceClient` for all HTTP calls. VMs are addressed
/// by name, so the provider instance id is the VM name.
pub struct GceGateway {
    client: GceClient,
    network: String,
    default_zone_suffix: String,
}

impl GceGateway {
    /// Create from env vars:
    ///
    /// - `GCE_PROJECT_ID` (required)
    /// - `GCE_ACCESS_TOKEN` (required, OAuth2 bearer token)
    /// - `GCE_NETWORK` (default: `"global/networks/default"`)
    /// - `GCE_ZONE_SUFFIX` (default: `"a"`, appended to bare regions)
    /// - `GCE_API_URL` (optional endpoint override)
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let project = std::env::var("GCE_PROJECT_ID")
            .map_err(|_| Error::MissingEnv("GCE_PROJECT_ID".into()))?;
        let token = std::env::var("GCE_ACCESS_TOKEN")
            .map_err(|_| Error::MissingEnv("GCE_ACCESS_TOKEN".into()))?;
        let network =
            std::env::var("GCE_NETWORK").unwrap_or_else(|_| "global/networks/default".into());
        let default_zone_suffix = std::env::var("GCE_ZONE_SUFFIX").unwrap_or_else(|_| "a".into());

        let client = match std::env::var("GCE_API_URL") {
            Ok(url) => GceClient::with_base_url(token, project, url),
            Err(_) => GceClient::new(token, project),
        };

        Ok(Self::new(client, network, default_zone_suffix))
    }

    pub fn new(client: GceClient, network: impl Into<String>, default_zone_suffix: impl Into<String>) -> Self {
        Self {
            client,
            network: network.into(),
            default_zone_suffix: default_zone_suffix.into(),
        }
    }

    pub fn project(&self) -> &str {
        self.client.project()
    }

    /// Accept either a zone (`us-east1-b`) or a bare region (`us-east1`).
    fn zone_for(&self, region: &str) -> String {
        let looks_like_zone = region
            .rsplit_once('-')
            .is_some_and(|(_, tail)| tail.len() == 1 && tail.chars().all(|c| c.is_ascii_lowercase()));
        if looks_like_zone {
            region.to_string()
        } else {
            format!("{region}-{}", self.default_zone_suffix)
        }
    }

    /// Map cores and memory to a predefined machine type. GPU VMs need the
    /// N1 family.
    fn machine_type(cpu_cores: i32, ram_gb: i32, gpu: bool) -> &'static str {
        match (gpu, cpu_cores, ram_gb) {
            (false, 0..=2, 0..=8) => "e2-standard-2",
            (false, 0..=4, 0..=16) => "e2-standard-4",
            (false, 0..=8, 0..=32) => "e2-standard-8",
            (false, _, _) => "e2-standard-16",
            (true, 0..=4, 0..=15) => "n1-standard-4",
            (true, 0..=8, 0..=30) => "n1-standard-8",
            (true, _, _) => "n1-standard-16",
        }
    }

    fn parse_state(status: &str) -> ProviderState {
        match status {
            "PROVISIONING" | "STAGING" | "REPAIRING" => ProviderState::Provisioning,
            "RUNNING" => ProviderState::Running,
            "STOPPING" | "SUSPENDING" => ProviderState::Stopping,
            "STOPPED" => ProviderState::Stopped,
            "SUSPENDED" => ProviderState::Suspended,
            "TERMINATED" => ProviderState::Terminated,
            _ => ProviderState::Unknown,
        }
    }

    fn parse_image_state(status: &str) -> ImageState {
        match status {
            "READY" => ImageState::Ready,
            "FAILED" => ImageState::Failed,
            "DELETING" => ImageState::Deleting,
            _ => ImageState::Pending,
        }
    }

    fn source_image(image_id: &str) -> String {
        if image_id.contains('/') {
            image_id.to_string()
        } else {
            format!("global/images/{image_id}")
        }
    }

    fn insert_request(
        &self,
        name: &str,
        zone: &str,
        machine_type: &str,
        source_image: String,
        storage_gb: i32,
        accelerator: Option<&str>,
    ) -> InsertInstanceRequest {
        let guest_accelerators: Vec<AcceleratorConfig> = accelerator
            .map(|kind| AcceleratorConfig {
                accelerator_type: format!("zones/{zone}/acceleratorTypes/{kind}"),
                accelerator_count: 1,
            })
            .into_iter()
            .collect();

        // GPU VMs cannot live-migrate.
        let scheduling = (!guest_accelerators.is_empty()).then(|| Scheduling {
            on_host_maintenance: "TERMINATE".into(),
            automatic_restart: true,
        });

        let mut labels = HashMap::new();
        labels.insert("managed-by".to_string(), "deskfleet".to_string());

        InsertInstanceRequest {
            name: name.to_string(),
            machine_type: format!("zones/{zone}/machineTypes/{machine_type}"),
            disks: vec![AttachedDisk {
                boot: true,
                auto_delete: true,
                initialize_params: DiskInitializeParams {
                    disk_name: name.to_string(),
                    source_image,
                    disk_size_gb: storage_gb.to_string(),
                },
            }],
            network_interfaces: vec![NetworkInterface {
                network: Some(self.network.clone()),
                network_ip: None,
                access_configs: vec![AccessConfig {
                    kind: Some("ONE_TO_ONE_NAT".into()),
                    name: Some("External NAT".into()),
                    nat_ip: None,
                }],
            }],
            guest_accelerators,
            scheduling,
            labels,
        }
    }

    /// Wait for a zonal operation if the API returned it unfinished. An
    /// operation still running after the wait is a transient failure.
    async fn settle(&self, zone: &str, op: Operation) -> Result<()> {
        if op.is_done() {
            return Ok(());
        }
        let op = self.client.wait_zone_operation(zone, &op.name).await?;
        if !op.is_done() {
            warn!(operation = %op.name, zone, "gce: operation still running after wait");
            return Err(Error::Provider {
                category: ErrorCategory::Transient,
                message: format!("operation {} did not finish in time", op.name),
            });
        }
        Ok(())
    }

    async fn insert(&self, req: InsertInstanceRequest, zone: &str) -> Result<ProviderMetadata> {
        let machine_type = req
            .machine_type
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let name = req.name.clone();

        let op = self.client.insert_instance(zone, &req).await?;
        if let Err(e) = self.settle(zone, op).await {
            // The caller records a failure, so the VM must not outlive it.
            if let Err(cleanup) = self.client.delete_instance(zone, &name).await {
                warn!(instance = %name, zone, error = %cleanup, "gce: could not remove unsettled instance");
            }
            return Err(e);
        }

        info!(instance = %name, zone, machine_type = %machine_type, "gce: instance created");

        Ok(ProviderMetadata {
            instance_id: name,
            zone: zone.to_string(),
            machine_type,
            project_id: self.project().to_string(),
        })
    }

    fn status_of(instance: &gce_api::Instance) -> ProviderStatus {
        ProviderStatus {
            state: Self::parse_state(&instance.status),
            external_ip: instance.external_ip(),
        }
    }
}

#[async_trait]
impl ComputeGateway for GceGateway {
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<ProviderMetadata> {
        let zone = self.zone_for(&spec.region);
        let machine_type =
            Self::machine_type(spec.cpu_cores, spec.ram_gb, spec.accelerator.is_some());
        let req = self.insert_request(
            &spec.name,
            &zone,
            machine_type,
            Self::source_image(&spec.image_id),
            spec.storage_gb,
            spec.accelerator.as_deref(),
        );
        self.insert(req, &zone).await
    }

    async fn start_instance(&self, id: &str, zone: &str) -> Result<()> {
        let op = self.client.start_instance(zone, id).await?;
        self.settle(zone, op).await?;
        info!(instance = %id, zone, "gce: instance started");
        Ok(())
    }

    async fn stop_instance(&self, id: &str, zone: &str) -> Result<()> {
        let op = self.client.stop_instance(zone, id).await?;
        self.settle(zone, op).await?;
        info!(instance = %id, zone, "gce: instance stopped");
        Ok(())
    }

    async fn delete_instance(&self, id: &str, zone: &str) -> Result<()> {
        match self.client.delete_instance(zone, id).await {
            Ok(op) => self.settle(zone, op).await?,
            Err(e) if e.is_not_found() => {
                warn!(instance = %id, zone, "gce: instance already deleted");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
        info!(instance = %id, zone, "gce: instance deleted");
        Ok(())
    }

    async fn describe_status(&self, id: &str, zone: &str) -> Result<ProviderStatus> {
        match self.client.get_instance(zone, id).await {
            Ok(instance) => Ok(Self::status_of(&instance)),
            Err(e) if e.is_not_found() => Err(Error::NotFound(format!("instance {id}"))),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_image(&self, image_name: &str, source_id: &str, zone: &str) -> Result<()> {
        self.client
            .insert_image(&InsertImageRequest {
                name: image_name.to_string(),
                source_disk: format!("zones/{zone}/disks/{source_id}"),
                description: Some(format!("backup of {source_id}")),
            })
            .await?;
        info!(image = %image_name, source = %source_id, "gce: image build started");
        Ok(())
    }

    async fn describe_image(&self, image_name: &str) -> Result<ImageInfo> {
        let image = match self.client.get_image(image_name).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                return Err(Error::NotFound(format!("image {image_name}")));
            }
            Err(e) => return Err(e.into()),
        };

        let size_bytes = image
            .archive_size_bytes
            .as_deref()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| {
                image
                    .disk_size_gb
                    .as_deref()
                    .and_then(|s| s.parse::<i64>().ok())
                    .map(|gb| gb * GIB)
            });

        Ok(ImageInfo {
            state: Self::parse_image_state(&image.status),
            size_bytes,
        })
    }

    async fn delete_image(&self, image_name: &str) -> Result<()> {
        match self.client.delete_image(image_name).await {
            Ok(_) => {
                info!(image = %image_name, "gce: image deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(image = %image_name, "gce: image already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn create_from_image(&self, spec: &RestoreSpec) -> Result<ProviderMetadata> {
        let machine_type =
            Self::machine_type(spec.cpu_cores, spec.ram_gb, spec.accelerator.is_some());
        let req = self.insert_request(
            &spec.name,
            &spec.zone,
            machine_type,
            format!("global/images/{}", spec.image_name),
            spec.storage_gb,
            spec.accelerator.as_deref(),
        );
        self.insert(req, &spec.zone).await
    }

    async fn describe_instance(&self, name: &str, zone: &str) -> Result<Option<ProviderStatus>> {
        match self.client.get_instance(zone, name).await {
            Ok(instance) => Ok(Some(Self::status_of(&instance))),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "gce"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> GceGateway {
        GceGateway::new(
            GceClient::with_base_url("tok", "proj", server.uri()),
            "global/networks/default",
            "a",
        )
    }

    #[test]
    fn zone_for_accepts_regions_and_zones() {
        let g = GceGateway::new(GceClient::new("t", "p"), "n", "b");
        assert_eq!(g.zone_for("us-east1"), "us-east1-b");
        assert_eq!(g.zone_for("europe-west4-a"), "europe-west4-a");
    }

    #[test]
    fn machine_type_tracks_size_and_gpu() {
        assert_eq!(GceGateway::machine_type(4, 8, false), "e2-standard-4");
        assert_eq!(GceGateway::machine_type(2, 4, false), "e2-standard-2");
        assert_eq!(GceGateway::machine_type(32, 128, false), "e2-standard-16");
        assert_eq!(GceGateway::machine_type(4, 8, true), "n1-standard-4");
    }

    #[test]
    fn unexpected_states_are_unknown() {
        assert_eq!(GceGateway::parse_state("STAGING"), ProviderState::Provisioning);
        assert_eq!(GceGateway::parse_state("TERMINATED"), ProviderState::Terminated);
        assert_eq!(GceGateway::parse_state("MYSTERY"), ProviderState::Unknown);
    }

    #[tokio::test]
    async fn describe_image_reports_materialized_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/proj/global/images/bk-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "bk-1",
                "status": "READY",
                "diskSizeGb": "50",
                "archiveSizeBytes": "7340032000"
            })))
            .mount(&server)
            .await;

        let info = gateway(&server).describe_image("bk-1").await.unwrap();
        assert_eq!(info.materialized_size(), Some(7_340_032_000));
    }

    #[tokio::test]
    async fn pending_image_has_no_materialized_size() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/proj/global/images/bk-2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "name": "bk-2", "status": "PENDING" })),
            )
            .mount(&server)
            .await;

        let info = gateway(&server).describe_image("bk-2").await.unwrap();
        assert_eq!(info.state, ImageState::Pending);
        assert_eq!(info.materialized_size(), None);
    }

    #[tokio::test]
    async fn describe_instance_maps_404_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/projects/proj/zones/us-east1-a/instances/vd-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let g = gateway(&server);
        assert_eq!(g.describe_instance("vd-9", "us-east1-a").await.unwrap(), None);
        assert!(g.describe_status("vd-9", "us-east1-a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn delete_of_missing_instance_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/projects/proj/zones/us-east1-a/instances/vd-9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        gateway(&server).delete_instance("vd-9", "us-east1-a").await.unwrap();
    }

    #[tokio::test]
    async fn create_waits_for_pending_operation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/proj/zones/us-east1-a/instances"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "name": "op-1", "status": "RUNNING" })),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/projects/proj/zones/us-east1-a/operations/op-1/wait"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "name": "op-1", "status": "DONE" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let meta = gateway(&server)
            .create_instance(&InstanceSpec {
                name: "vd-abc".into(),
                image_id: "win-2022".into(),
                region: "us-east1".into(),
                cpu_cores: 4,
                ram_gb: 8,
                storage_gb: 50,
                accelerator: None,
            })
            .await
            .unwrap();

        assert_eq!(
            meta,
            ProviderMetadata {
                instance_id: "vd-abc".into(),
                zone: "us-east1-a".into(),
                machine_type: "e2-standard-4".into(),
                project_id: "proj".into(),
            }
        );
    }

    #[tokio::test]
    async fn unsettled_create_is_transient_and_cleaned_up() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/projects/proj/zones/us-east1-a/instances"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "name": "op-2", "status": "RUNNING" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/projects/proj/zones/us-east1-a/operations/op-2/wait"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "name": "op-2", "status": "RUNNING" })),
            )
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/projects/proj/zones/us-east1-a/instances/vd-slow"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "name": "op-3", "status": "DONE" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = gateway(&server)
            .create_instance(&InstanceSpec {
                name: "vd-slow".into(),
                image_id: "win-2022".into(),
                region: "us-east1".into(),
                cpu_cores: 2,
                ram_gb: 4,
                storage_gb: 50,
                accelerator: None,
            })
            .await
            .unwrap_err();

        assert_eq!(err.category(), ErrorCategory::Transient);
    }
}
