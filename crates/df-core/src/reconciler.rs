//! Background tasks that converge local records with provider state.
//!
//! Every task is an independent tokio task tracked by the [`Reconciler`]'s
//! registry. A task owns a child of the registry's cancellation token; the
//! token only fires on process shutdown. Tasks write back through the same
//! compare-and-set store path as request handlers, so a late task never
//! overwrites a newer status.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use df_db::Store;
use df_db::models::{
    Backup, BackupStatus, BackupUpdate, Instance, InstanceStatus, InstanceUpdate, ProviderLink,
};
use df_infra::ComputeGateway;
use df_infra::types::{ImageState, ProviderState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const GIB: i64 = 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Boot time of a locally simulated instance.
    pub demo_boot_delay: Duration,
    /// Upper bound on boot and first-login setup of a provider VM.
    pub provider_boot_delay: Duration,
    /// Time for a simulated backup to complete.
    pub demo_backup_delay: Duration,
    pub poll_interval: Duration,
    /// Readiness checks before a restore is given up.
    pub restore_max_attempts: u32,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            demo_boot_delay: Duration::from_secs(10),
            provider_boot_delay: Duration::from_secs(180),
            demo_backup_delay: Duration::from_secs(5),
            poll_interval: Duration::from_secs(5),
            restore_max_attempts: 120,
        }
    }
}

/// How a task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Success state persisted.
    Completed,
    /// Failure state persisted.
    Failed,
    /// The record had already left the status this task was waiting on.
    Superseded,
    /// Gave up without persisting anything.
    Abandoned,
    /// Stopped by shutdown.
    Cancelled,
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn Store>,
    gateway: Option<Arc<dyn ComputeGateway>>,
    settings: ReconcilerSettings,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

/// What an image poll does when the provider has no image by that name.
#[derive(Debug, Clone)]
enum MissingImage {
    /// The build was just accepted; the image may not be visible yet.
    Wait,
    /// The build may never have been issued. Issue it once from this VM.
    Rebuild(ProviderLink),
    /// Nothing to rebuild from.
    Fail,
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(token: &CancellationToken, period: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(period) => true,
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Option<Arc<dyn ComputeGateway>>,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            settings,
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Cancel every task and wait for them to exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("reconciler stopped");
    }

    fn spawn<F>(&self, make: impl FnOnce(CancellationToken) -> F) -> JoinHandle<Outcome>
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        self.tasks.spawn(make(self.shutdown.child_token()))
    }

    pub fn boot_delay(&self, instance: &Instance) -> Duration {
        if instance.is_provider_managed() {
            self.settings.provider_boot_delay
        } else {
            self.settings.demo_boot_delay
        }
    }

    // ── Fixed-delay boot ────────────────────────────────────────────

    /// Move a PROVISIONING instance to RUNNING once its boot delay elapses.
    pub fn schedule_boot(&self, instance: Instance) -> JoinHandle<Outcome> {
        let delay = self.boot_delay(&instance);
        let this = self.clone();
        self.spawn(move |token| async move { this.run_boot(instance, delay, token).await })
    }

    async fn run_boot(self, instance: Instance, delay: Duration, token: CancellationToken) -> Outcome {
        debug!(instance_id = %instance.id, ?delay, "boot timer armed");
        if !pause(&token, delay).await {
            return Outcome::Cancelled;
        }

        // One read for the address; the timer itself is the readiness signal.
        let external_ip = match (&self.gateway, instance.provider_link()) {
            (Some(gateway), Some(link)) => {
                match gateway
                    .describe_status(&link.provider_instance_id, &link.zone)
                    .await
                {
                    Ok(status) => status.external_ip,
                    Err(e) => {
                        warn!(instance_id = %instance.id, error = %e, "could not read external IP at boot");
                        None
                    }
                }
            }
            _ => None,
        };

        let update = InstanceUpdate::status(InstanceStatus::Running).with_external_ip(external_ip);
        match self
            .store
            .update_instance_status(instance.id, &[InstanceStatus::Provisioning], &update)
            .await
        {
            Ok(Some(_)) => {
                info!(instance_id = %instance.id, "instance is running");
                Outcome::Completed
            }
            Ok(None) => {
                info!(instance_id = %instance.id, "instance left PROVISIONING before boot timer fired");
                Outcome::Superseded
            }
            Err(e) => {
                error!(instance_id = %instance.id, error = %e, "failed to mark instance running, giving up");
                Outcome::Abandoned
            }
        }
    }

    // ── Backup completion ───────────────────────────────────────────

    /// Trigger the provider image build for a freshly persisted backup and
    /// poll until the image is materialized. Polling has no timeout.
    pub fn schedule_image_build(&self, backup: Backup, source: ProviderLink) -> JoinHandle<Outcome> {
        let this = self.clone();
        self.spawn(move |token| async move { this.run_image_build(backup, source, token).await })
    }

    /// Resume polling for an image left by a previous process. If the
    /// provider has no such image, the build is issued once from `source`;
    /// without a source the backup fails.
    pub fn schedule_image_poll(
        &self,
        backup_id: Uuid,
        image_name: String,
        source: Option<ProviderLink>,
    ) -> JoinHandle<Outcome> {
        let this = self.clone();
        self.spawn(move |token| async move {
            let Some(gateway) = this.gateway.clone() else {
                warn!(%backup_id, "no compute provider configured, cannot poll image");
                return Outcome::Abandoned;
            };
            let missing = source.map_or(MissingImage::Fail, MissingImage::Rebuild);
            this.poll_image(backup_id, gateway, &image_name, missing, token)
                .await
        })
    }

    async fn run_image_build(self, backup: Backup, source: ProviderLink, token: CancellationToken) -> Outcome {
        let (Some(gateway), Some(image_name)) = (self.gateway.clone(), backup.image_name.clone())
        else {
            warn!(backup_id = %backup.id, "backup has no provider image to build");
            return self
                .fail_backup(backup.id, "no compute provider available to build the image".into())
                .await;
        };

        if let Err(e) = gateway
            .create_image(&image_name, &source.provider_instance_id, &source.zone)
            .await
        {
            warn!(backup_id = %backup.id, category = %e.category(), error = %e, "image creation failed");
            return self
                .fail_backup(backup.id, format!("image creation failed: {e}"))
                .await;
        }
        info!(backup_id = %backup.id, image = %image_name, "image build started");

        self.poll_image(backup.id, gateway, &image_name, MissingImage::Wait, token)
            .await
    }

    async fn poll_image(
        &self,
        backup_id: Uuid,
        gateway: Arc<dyn ComputeGateway>,
        image_name: &str,
        mut missing: MissingImage,
        token: CancellationToken,
    ) -> Outcome {
        let mut attempt: u64 = 0;
        loop {
            if !pause(&token, self.settings.poll_interval).await {
                return Outcome::Cancelled;
            }
            attempt += 1;

            let info = match gateway.describe_image(image_name).await {
                Ok(info) => info,
                Err(e) if e.is_not_found() => match std::mem::replace(&mut missing, MissingImage::Wait) {
                    MissingImage::Wait => {
                        debug!(%backup_id, attempt, "image not visible yet");
                        continue;
                    }
                    MissingImage::Fail => {
                        warn!(%backup_id, image = %image_name, "image missing and no source VM to rebuild from");
                        return self
                            .fail_backup(
                                backup_id,
                                format!("image {image_name} does not exist at the provider"),
                            )
                            .await;
                    }
                    MissingImage::Rebuild(source) => {
                        match gateway
                            .create_image(image_name, &source.provider_instance_id, &source.zone)
                            .await
                        {
                            Ok(()) => info!(%backup_id, image = %image_name, "image build reissued"),
                            Err(e) if e.is_conflict() => {
                                debug!(%backup_id, image = %image_name, "image build already accepted");
                            }
                            Err(e) => {
                                warn!(%backup_id, category = %e.category(), error = %e, "image creation failed");
                                return self
                                    .fail_backup(backup_id, format!("image creation failed: {e}"))
                                    .await;
                            }
                        }
                        continue;
                    }
                },
                Err(e) => {
                    debug!(%backup_id, attempt, error = %e, "image not ready yet");
                    continue;
                }
            };

            if let Some(size) = info.materialized_size() {
                match self
                    .store
                    .update_backup_status(
                        backup_id,
                        &[BackupStatus::Creating],
                        &BackupUpdate::completed(size),
                    )
                    .await
                {
                    Ok(Some(_)) => {
                        info!(%backup_id, size_bytes = size, attempt, "backup completed");
                        return Outcome::Completed;
                    }
                    Ok(None) => return Outcome::Superseded,
                    Err(e) => {
                        warn!(%backup_id, error = %e, "could not record completed backup, will retry");
                        continue;
                    }
                }
            }

            match info.state {
                ImageState::Failed | ImageState::Deleting => {
                    return self
                        .fail_backup(
                            backup_id,
                            format!("image {image_name} ended in state {:?}", info.state),
                        )
                        .await;
                }
                ImageState::Pending | ImageState::Ready => {
                    debug!(%backup_id, attempt, "image still building");
                }
            }
        }
    }

    /// Complete a simulated backup after a fixed delay.
    pub fn schedule_demo_backup(&self, backup_id: Uuid, size_bytes: i64) -> JoinHandle<Outcome> {
        let delay = self.settings.demo_backup_delay;
        let this = self.clone();
        self.spawn(move |token| async move {
            if !pause(&token, delay).await {
                return Outcome::Cancelled;
            }
            match this
                .store
                .update_backup_status(
                    backup_id,
                    &[BackupStatus::Creating],
                    &BackupUpdate::completed(size_bytes),
                )
                .await
            {
                Ok(Some(_)) => {
                    info!(%backup_id, size_bytes, "demo backup completed");
                    Outcome::Completed
                }
                Ok(None) => Outcome::Superseded,
                Err(e) => {
                    error!(%backup_id, error = %e, "failed to complete demo backup");
                    Outcome::Abandoned
                }
            }
        })
    }

    async fn fail_backup(&self, backup_id: Uuid, message: String) -> Outcome {
        match self
            .store
            .update_backup_status(
                backup_id,
                &[BackupStatus::Creating],
                &BackupUpdate::error(message),
            )
            .await
        {
            Ok(Some(_)) => Outcome::Failed,
            Ok(None) => Outcome::Superseded,
            Err(e) => {
                error!(%backup_id, error = %e, "failed to record backup failure");
                Outcome::Abandoned
            }
        }
    }

    // ── Restore readiness ───────────────────────────────────────────

    /// Poll a restored VM until it runs with an external address, fails, or
    /// the attempt budget runs out.
    pub fn schedule_restore_watch(&self, instance: Instance) -> JoinHandle<Outcome> {
        let this = self.clone();
        self.spawn(move |token| async move { this.run_restore_watch(instance, token).await })
    }

    async fn run_restore_watch(self, instance: Instance, token: CancellationToken) -> Outcome {
        let (Some(gateway), Some(link)) = (self.gateway.clone(), instance.provider_link()) else {
            warn!(instance_id = %instance.id, "restored instance is not provider-managed, nothing to watch");
            return Outcome::Abandoned;
        };

        let max_attempts = self.settings.restore_max_attempts;
        for attempt in 1..=max_attempts {
            if !pause(&token, self.settings.poll_interval).await {
                return Outcome::Cancelled;
            }

            let status = match gateway
                .describe_instance(&link.provider_instance_id, &link.zone)
                .await
            {
                Ok(Some(status)) => status,
                Ok(None) => {
                    debug!(instance_id = %instance.id, attempt, "restored VM not visible yet");
                    continue;
                }
                Err(e) => {
                    debug!(instance_id = %instance.id, attempt, error = %e, "restored VM status unavailable");
                    continue;
                }
            };

            match (status.state, status.external_ip) {
                (ProviderState::Running, Some(ip)) => {
                    return self.finish_restore(instance.id, ip).await;
                }
                (ProviderState::Stopped | ProviderState::Terminated | ProviderState::Suspended, _) => {
                    return self
                        .fail_instance(
                            instance.id,
                            format!("restored VM reported {:?} while booting", status.state),
                        )
                        .await;
                }
                (state, _) => {
                    debug!(instance_id = %instance.id, attempt, ?state, "restored VM not ready");
                }
            }
        }

        warn!(instance_id = %instance.id, max_attempts, "restored VM never became reachable");
        self.fail_instance(
            instance.id,
            format!("restored VM was not reachable after {max_attempts} checks"),
        )
        .await
    }

    async fn finish_restore(&self, instance_id: Uuid, ip: String) -> Outcome {
        let update = InstanceUpdate::status(InstanceStatus::Running).with_external_ip(Some(ip));
        match self
            .store
            .update_instance_status(instance_id, &[InstanceStatus::Provisioning], &update)
            .await
        {
            Ok(Some(_)) => {
                info!(%instance_id, "restored instance is running");
                Outcome::Completed
            }
            Ok(None) => Outcome::Superseded,
            Err(e) => {
                error!(%instance_id, error = %e, "failed to mark restored instance running");
                Outcome::Abandoned
            }
        }
    }

    async fn fail_instance(&self, instance_id: Uuid, message: String) -> Outcome {
        match self
            .store
            .update_instance_status(
                instance_id,
                &[InstanceStatus::Provisioning],
                &InstanceUpdate::error(message),
            )
            .await
        {
            Ok(Some(_)) => Outcome::Failed,
            Ok(None) => Outcome::Superseded,
            Err(e) => {
                error!(%instance_id, error = %e, "failed to record restore failure");
                Outcome::Abandoned
            }
        }
    }

    // ── Startup recovery ────────────────────────────────────────────

    /// Re-arm tasks for records a previous process left mid-flight.
    pub async fn resume(&self) -> df_db::Result<usize> {
        let mut resumed = 0;

        for instance in self
            .store
            .list_instances_by_status(InstanceStatus::Provisioning)
            .await?
        {
            if instance.source_backup_id.is_some() && instance.is_provider_managed() {
                self.schedule_restore_watch(instance);
            } else {
                self.schedule_boot(instance);
            }
            resumed += 1;
        }

        for backup in self
            .store
            .list_backups_by_status(BackupStatus::Creating)
            .await?
        {
            match backup.image_name {
                Some(image_name) => {
                    let source = self
                        .store
                        .get_instance(backup.instance_id)
                        .await?
                        .filter(|source| source.status != InstanceStatus::Deleted)
                        .and_then(|source| source.provider_link());
                    self.schedule_image_poll(backup.id, image_name, source);
                }
                None => {
                    let size = self
                        .store
                        .get_instance(backup.instance_id)
                        .await?
                        .map(|source| i64::from(source.storage_gb) * GIB)
                        .unwrap_or(0);
                    self.schedule_demo_backup(backup.id, size);
                }
            }
            resumed += 1;
        }

        if resumed > 0 {
            info!(resumed, "resumed in-flight reconciler tasks");
        }
        Ok(resumed)
    }
}
