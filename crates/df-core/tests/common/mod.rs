#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use df_core::{Coordinator, ReconcilerSettings, Settings};
use df_db::models::{
    Backup, BackupStatus, BackupUpdate, Instance, InstanceStatus, InstanceUpdate, LeakedResource,
    NewBackup, NewInstance, NewLeakedResource,
};
use df_db::{MemoryStore, Store};
use df_infra::types::{
    ImageInfo, ImageState, InstanceSpec, ProviderMetadata, ProviderState, ProviderStatus,
    RestoreSpec,
};
use df_infra::{ComputeGateway, ErrorCategory};
use serde_json::json;
use uuid::Uuid;

pub const OWNER: &str = "ada@example.com";
pub const OTHER: &str = "bob@example.com";
pub const IP: &str = "34.120.7.9";

pub type ImageReply = Result<ImageInfo, ErrorCategory>;

/// Compute gateway double. Operations succeed unless told to fail; the
/// image and restore polls replay scripted answers.
pub struct FakeGateway {
    calls: Mutex<Vec<&'static str>>,
    failures: Mutex<HashMap<&'static str, ErrorCategory>>,
    status: Mutex<Option<ProviderStatus>>,
    images: Mutex<VecDeque<ImageReply>>,
    restored: Mutex<VecDeque<Option<ProviderStatus>>>,
}

impl FakeGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            status: Mutex::new(Some(running())),
            images: Mutex::new(VecDeque::new()),
            restored: Mutex::new(VecDeque::new()),
        })
    }

    pub fn fail(&self, op: &'static str, category: ErrorCategory) {
        self.failures.lock().unwrap().insert(op, category);
    }

    pub fn heal(&self, op: &'static str) {
        self.failures.lock().unwrap().remove(op);
    }

    /// Status reported by `describe_status`; `None` means the VM is gone.
    pub fn set_status(&self, status: Option<ProviderStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn script_images(&self, replies: impl IntoIterator<Item = ImageReply>) {
        self.images.lock().unwrap().extend(replies);
    }

    pub fn script_restore(&self, replies: impl IntoIterator<Item = Option<ProviderStatus>>) {
        self.restored.lock().unwrap().extend(replies);
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    fn enter(&self, op: &'static str) -> df_infra::Result<()> {
        self.calls.lock().unwrap().push(op);
        match self.failures.lock().unwrap().get(op) {
            Some(category) => Err(df_infra::Error::Provider {
                category: *category,
                message: format!("{op} rejected by fake provider"),
            }),
            None => Ok(()),
        }
    }

    fn metadata(name: &str, zone: String) -> ProviderMetadata {
        ProviderMetadata {
            instance_id: name.to_string(),
            zone,
            machine_type: "e2-custom-4-8192".into(),
            project_id: "test-project".into(),
        }
    }
}

pub fn running() -> ProviderStatus {
    ProviderStatus {
        state: ProviderState::Running,
        external_ip: Some(IP.into()),
    }
}

pub fn reported(state: ProviderState) -> ProviderStatus {
    ProviderStatus {
        state,
        external_ip: None,
    }
}

pub fn pending_image() -> ImageReply {
    Ok(ImageInfo {
        state: ImageState::Pending,
        size_bytes: None,
    })
}

pub fn ready_image(size: i64) -> ImageReply {
    Ok(ImageInfo {
        state: ImageState::Ready,
        size_bytes: Some(size),
    })
}

#[async_trait]
impl ComputeGateway for FakeGateway {
    async fn create_instance(&self, spec: &InstanceSpec) -> df_infra::Result<ProviderMetadata> {
        self.enter("create_instance")?;
        Ok(Self::metadata(&spec.name, format!("{}-a", spec.region)))
    }

    async fn start_instance(&self, _id: &str, _zone: &str) -> df_infra::Result<()> {
        self.enter("start_instance")
    }

    async fn stop_instance(&self, _id: &str, _zone: &str) -> df_infra::Result<()> {
        self.enter("stop_instance")
    }

    async fn delete_instance(&self, _id: &str, _zone: &str) -> df_infra::Result<()> {
        self.enter("delete_instance")
    }

    async fn describe_status(&self, id: &str, _zone: &str) -> df_infra::Result<ProviderStatus> {
        self.enter("describe_status")?;
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| df_infra::Error::NotFound(id.to_string()))
    }

    async fn create_image(&self, _image: &str, _source: &str, _zone: &str) -> df_infra::Result<()> {
        self.enter("create_image")
    }

    async fn describe_image(&self, image_name: &str) -> df_infra::Result<ImageInfo> {
        self.enter("describe_image")?;
        match self.images.lock().unwrap().pop_front() {
            Some(Ok(info)) => Ok(info),
            Some(Err(category)) => Err(df_infra::Error::Provider {
                category,
                message: format!("image {image_name} not ready"),
            }),
            None => Ok(ImageInfo {
                state: ImageState::Pending,
                size_bytes: None,
            }),
        }
    }

    async fn delete_image(&self, _image_name: &str) -> df_infra::Result<()> {
        self.enter("delete_image")
    }

    async fn create_from_image(&self, spec: &RestoreSpec) -> df_infra::Result<ProviderMetadata> {
        self.enter("create_from_image")?;
        Ok(Self::metadata(&spec.name, spec.zone.clone()))
    }

    async fn describe_instance(
        &self,
        _name: &str,
        _zone: &str,
    ) -> df_infra::Result<Option<ProviderStatus>> {
        self.enter("describe_instance")?;
        Ok(self.restored.lock().unwrap().pop_front().flatten())
    }

    fn name(&self) -> &'static str {
        "fake"
    }
}

/// Memory store whose instance writes can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_instance_inserts: AtomicBool,
    fail_instance_updates: AtomicBool,
}

impl FlakyStore {
    pub fn fail_instance_inserts(&self) {
        self.fail_instance_inserts.store(true, Ordering::SeqCst);
    }

    pub fn fail_instance_updates(&self) {
        self.fail_instance_updates.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn insert_instance(&self, new: &NewInstance) -> df_db::Result<Instance> {
        if self.fail_instance_inserts.load(Ordering::SeqCst) {
            return Err(df_db::Error::Unavailable("injected write failure".into()));
        }
        self.inner.insert_instance(new).await
    }

    async fn get_instance(&self, id: Uuid) -> df_db::Result<Option<Instance>> {
        self.inner.get_instance(id).await
    }

    async fn list_instances(&self, owner: &str) -> df_db::Result<Vec<Instance>> {
        self.inner.list_instances(owner).await
    }

    async fn list_instances_by_status(&self, status: InstanceStatus) -> df_db::Result<Vec<Instance>> {
        self.inner.list_instances_by_status(status).await
    }

    async fn update_instance_status(
        &self,
        id: Uuid,
        expected: &[InstanceStatus],
        update: &InstanceUpdate,
    ) -> df_db::Result<Option<Instance>> {
        if self.fail_instance_updates.load(Ordering::SeqCst) {
            return Err(df_db::Error::Unavailable("injected write failure".into()));
        }
        self.inner.update_instance_status(id, expected, update).await
    }

    async fn insert_backup(&self, new: &NewBackup) -> df_db::Result<Backup> {
        self.inner.insert_backup(new).await
    }

    async fn get_backup(&self, id: Uuid) -> df_db::Result<Option<Backup>> {
        self.inner.get_backup(id).await
    }

    async fn list_backups(&self, owner: &str) -> df_db::Result<Vec<Backup>> {
        self.inner.list_backups(owner).await
    }

    async fn list_backups_by_status(&self, status: BackupStatus) -> df_db::Result<Vec<Backup>> {
        self.inner.list_backups_by_status(status).await
    }

    async fn update_backup_status(
        &self,
        id: Uuid,
        expected: &[BackupStatus],
        update: &BackupUpdate,
    ) -> df_db::Result<Option<Backup>> {
        self.inner.update_backup_status(id, expected, update).await
    }

    async fn record_leak(&self, leak: &NewLeakedResource) -> df_db::Result<()> {
        self.inner.record_leak(leak).await
    }

    async fn list_leaks(&self) -> df_db::Result<Vec<LeakedResource>> {
        self.inner.list_leaks().await
    }
}

pub fn settings() -> Settings {
    Settings {
        reconciler: ReconcilerSettings {
            demo_boot_delay: Duration::from_secs(10),
            provider_boot_delay: Duration::from_secs(180),
            demo_backup_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            restore_max_attempts: 4,
        },
        ..Settings::default()
    }
}

pub fn with_gateway(store: Arc<dyn Store>, gateway: &Arc<FakeGateway>) -> Coordinator {
    let gateway: Arc<dyn ComputeGateway> = gateway.clone();
    Coordinator::new(store, Some(gateway), settings())
}

pub fn demo(store: Arc<dyn Store>) -> Coordinator {
    Coordinator::new(store, None, settings())
}

pub fn desk() -> df_core::validate::InstanceInput {
    serde_json::from_value(json!({
        "name": "design desk",
        "image_id": "windows-server-2022",
        "cpuCores": 4,
        "ramGb": 8,
        "storageGb": 50,
        "gpu": "NONE",
        "region": "us-central1",
    }))
    .unwrap()
}

pub async fn advance(secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}
