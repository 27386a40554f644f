mod common;

use std::sync::Arc;

use common::*;
use df_core::validate::{BackupInput, RestoreInput};
use df_core::{Coordinator, Error, Outcome, Record, TransitionError};
use df_db::models::{
    Backup, BackupStatus, BackupUpdate, GpuKind, Instance, InstanceStatus, NewBackup, NewInstance, ProviderLink,
};
use df_db::{MemoryStore, Store};
use df_infra::ErrorCategory;
use df_infra::types::ProviderState;

const GIB: i64 = 1024 * 1024 * 1024;

fn backup_of(instance: &Instance, name: &str) -> BackupInput {
    BackupInput {
        instance_id: Some(instance.id),
        name: Some(name.into()),
    }
}

fn restore_as(name: &str) -> RestoreInput {
    RestoreInput {
        name: Some(name.into()),
        zone: None,
    }
}

async fn running_instance(coordinator: &Coordinator) -> Instance {
    let created = coordinator.create_instance(OWNER, &desk()).await.unwrap();
    advance(181).await;
    coordinator.get_instance(OWNER, created.id).await.unwrap()
}

#[tokio::test(start_paused = true)]
async fn backup_of_vm_missing_at_provider_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;

    gateway.set_status(None);
    let err = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Provider {
            category: ErrorCategory::NotFound,
            record: None,
            ..
        }
    ));
    assert!(coordinator.list_backups(OWNER).await.unwrap().is_empty());
    assert_eq!(gateway.count("create_image"), 0);
}

#[tokio::test(start_paused = true)]
async fn backup_completes_once_after_image_materializes() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;

    gateway.script_images([
        Err(ErrorCategory::NotFound),
        pending_image(),
        Err(ErrorCategory::Transient),
        pending_image(),
        pending_image(),
        ready_image(7 * GIB),
    ]);

    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "before upgrade"))
        .await
        .unwrap();
    assert_eq!(backup.status, BackupStatus::Creating);
    assert_eq!(backup.storage_bytes, None);
    assert_eq!(backup.source_instance_name, instance.name);
    assert_eq!(backup.source_zone, instance.zone);
    let image = backup.image_name.clone().unwrap();
    assert!(image.starts_with(&format!("bk-{}", instance.id.simple())));

    advance(26).await;
    let building = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(building.status, BackupStatus::Creating);
    assert_eq!(building.storage_bytes, None);
    assert_eq!(gateway.count("describe_image"), 5);

    advance(5).await;
    let done = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(done.status, BackupStatus::Completed);
    assert_eq!(done.storage_bytes, Some(7 * GIB));
    assert_eq!(gateway.count("create_image"), 1);
    assert_eq!(gateway.count("describe_image"), 6);

    // the poller has stopped and the size never changes
    gateway.script_images([ready_image(9 * GIB)]);
    advance(60).await;
    assert_eq!(gateway.count("describe_image"), 6);
    let later = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(later.storage_bytes, Some(7 * GIB));
}

#[tokio::test(start_paused = true)]
async fn failed_image_stops_polling_with_error() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;

    gateway.script_images([
        pending_image(),
        Ok(df_infra::types::ImageInfo {
            state: df_infra::types::ImageState::Failed,
            size_bytes: None,
        }),
    ]);
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();

    advance(11).await;
    let failed = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(failed.status, BackupStatus::Error);
    assert!(failed.error_message.is_some());
    assert_eq!(failed.storage_bytes, None);

    advance(30).await;
    assert_eq!(gateway.count("describe_image"), 2);
}

#[tokio::test(start_paused = true)]
async fn rejected_image_build_marks_backup_error() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;
    gateway.fail("create_image", ErrorCategory::Quota);

    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();
    assert_eq!(backup.status, BackupStatus::Creating);

    advance(1).await;
    let failed = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(failed.status, BackupStatus::Error);
    assert!(
        failed
            .error_message
            .as_deref()
            .unwrap_or_default()
            .starts_with("image creation failed")
    );
    assert_eq!(gateway.count("describe_image"), 0);
}

#[tokio::test(start_paused = true)]
async fn backup_name_is_validated_before_anything_else() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;
    let before = gateway.calls().len();

    let err = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly/../etc"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(gateway.calls().len(), before);

    let err = coordinator
        .create_backup(OTHER, &backup_of(&instance, "nightly"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden { .. }));
}

#[tokio::test(start_paused = true)]
async fn restore_requires_completed_backup() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;

    gateway.script_images([ready_image(3 * GIB)]);
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();

    let err = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("desk-restored"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Transition(TransitionError::NotAllowedIn { .. })
    ));
    assert_eq!(gateway.count("create_from_image"), 0);

    advance(6).await;
    gateway.script_restore([
        None,
        Some(reported(ProviderState::Provisioning)),
        Some(reported(ProviderState::Running)),
        Some(running()),
    ]);
    let restored = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("desk-restored"))
        .await
        .unwrap();
    assert_eq!(restored.status, InstanceStatus::Provisioning);
    assert_eq!(restored.source_backup_id, Some(backup.id));
    assert_eq!(restored.cpu_cores, instance.cpu_cores);
    assert_eq!(restored.storage_gb, instance.storage_gb);
    assert_eq!(restored.zone, instance.zone);
    assert_eq!(restored.provider_instance_id.as_deref(), Some("desk-restored"));
    assert_eq!(restored.external_ip, None);

    advance(16).await;
    let waiting = coordinator.get_instance(OWNER, restored.id).await.unwrap();
    assert_eq!(waiting.status, InstanceStatus::Provisioning);

    advance(5).await;
    let ready = coordinator.get_instance(OWNER, restored.id).await.unwrap();
    assert_eq!(ready.status, InstanceStatus::Running);
    assert_eq!(ready.external_ip.as_deref(), Some(IP));
    assert_eq!(gateway.count("describe_instance"), 4);
}

#[tokio::test(start_paused = true)]
async fn restore_gives_up_after_attempt_budget() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;
    gateway.script_images([ready_image(GIB)]);
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();
    advance(6).await;

    let restored = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("never-up"))
        .await
        .unwrap();
    advance(60).await;
    let failed = coordinator.get_instance(OWNER, restored.id).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Error);
    assert!(failed.error_message.unwrap().contains("not reachable"));
    assert_eq!(gateway.count("describe_instance"), 4);
}

#[tokio::test(start_paused = true)]
async fn restore_watch_stops_on_terminated_vm() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;
    gateway.script_images([ready_image(GIB)]);
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();
    advance(6).await;

    gateway.script_restore([Some(reported(ProviderState::Terminated))]);
    let restored = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("dead-on-arrival"))
        .await
        .unwrap();
    advance(30).await;
    let failed = coordinator.get_instance(OWNER, restored.id).await.unwrap();
    assert_eq!(failed.status, InstanceStatus::Error);
    assert_eq!(gateway.count("describe_instance"), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_restore_persists_error_instance() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;
    gateway.script_images([ready_image(GIB)]);
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();
    advance(6).await;

    gateway.fail("create_from_image", ErrorCategory::InvalidRequest);
    let err = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("taken-name"))
        .await
        .unwrap_err();
    let Error::Provider {
        record: Some(Record::Instance(record)),
        ..
    } = err
    else {
        panic!("expected provider error with record");
    };
    assert_eq!(record.status, InstanceStatus::Error);
    assert_eq!(record.source_backup_id, Some(backup.id));
}

#[tokio::test(start_paused = true)]
async fn restore_name_must_suit_the_provider() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = demo(store.clone());
    let instance = coordinator.create_instance(OWNER, &desk()).await.unwrap();
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();
    advance(6).await;

    let err = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("Desk Restored"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn delete_backup_removes_image_first() {
    let store = Arc::new(MemoryStore::new());
    let gateway = FakeGateway::new();
    let coordinator = with_gateway(store.clone(), &gateway);
    let instance = running_instance(&coordinator).await;
    gateway.script_images([ready_image(2 * GIB)]);
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "nightly"))
        .await
        .unwrap();

    let err = coordinator.delete_backup(OWNER, backup.id).await.unwrap_err();
    assert!(matches!(err, Error::Transition(_)), "creating backups stay");

    advance(6).await;
    gateway.fail("delete_image", ErrorCategory::Transient);
    let err = coordinator.delete_backup(OWNER, backup.id).await.unwrap_err();
    let Error::Provider {
        record: Some(Record::Backup(returned)),
        ..
    } = err
    else {
        panic!("expected provider error with record");
    };
    assert_eq!(returned.status, BackupStatus::Completed);
    let kept = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(kept.status, BackupStatus::Completed);
    assert_eq!(kept.storage_bytes, Some(2 * GIB));
    assert!(kept.error_message.as_deref().unwrap_or_default().starts_with("image deletion failed"));

    // a failed image removal leaves the backup restorable
    let restored = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("desk-after-failure"))
        .await
        .unwrap();
    assert_eq!(restored.status, InstanceStatus::Provisioning);

    gateway.heal("delete_image");
    let deleted = coordinator.delete_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(deleted.status, BackupStatus::Deleted);
    assert_eq!(deleted.storage_bytes, Some(2 * GIB));
    assert_eq!(gateway.count("delete_image"), 2);

    let err = coordinator.delete_backup(OWNER, backup.id).await.unwrap_err();
    assert!(matches!(err, Error::Transition(_)));
}

#[tokio::test(start_paused = true)]
async fn backup_survives_source_deletion() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = demo(store.clone());
    let instance = coordinator.create_instance(OWNER, &desk()).await.unwrap();
    let backup = coordinator
        .create_backup(OWNER, &backup_of(&instance, "keep me"))
        .await
        .unwrap();
    advance(6).await;

    coordinator.delete_instance(OWNER, instance.id).await.unwrap();
    let kept = coordinator.get_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(kept.status, BackupStatus::Completed);
    assert_eq!(kept.source_instance_name, "design desk");
    assert_eq!(kept.storage_bytes, Some(50 * GIB));

    let err = coordinator
        .create_backup(OWNER, &backup_of(&instance, "too late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Transition(_)));

    let restored = coordinator
        .restore_backup(OWNER, backup.id, &restore_as("phoenix"))
        .await
        .unwrap();
    assert_eq!(restored.region, "us-central1");
    assert_eq!(restored.ram_gb, 8);
    advance(11).await;
    let booted = coordinator.get_instance(OWNER, restored.id).await.unwrap();
    assert_eq!(booted.status, InstanceStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn startup_resumes_in_flight_work() {
    let store = Arc::new(MemoryStore::new());
    let source = store
        .insert_instance(&NewInstance {
            owner: OWNER.into(),
            name: "left over".into(),
            image_id: "windows-server-2022".into(),
            cpu_cores: 2,
            ram_gb: 4,
            storage_gb: 30,
            gpu: GpuKind::None,
            region: "europe-west1".into(),
            status: InstanceStatus::Provisioning,
            error_message: None,
            provider: None,
            source_backup_id: None,
        })
        .await
        .unwrap();
    let backup = store
        .insert_backup(&NewBackup {
            owner: OWNER.into(),
            instance_id: source.id,
            name: "interrupted".into(),
            image_name: None,
            source_instance_name: source.name.clone(),
            source_zone: Some(source.region.clone()),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let coordinator = demo(store.clone());
    assert_eq!(coordinator.reconciler().resume().await.unwrap(), 2);

    advance(11).await;
    let instance = store.get_instance(source.id).await.unwrap().unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    let backup = store.get_backup(backup.id).await.unwrap().unwrap();
    assert_eq!(backup.status, BackupStatus::Completed);
    assert_eq!(backup.storage_bytes, Some(30 * GIB));
}

#[tokio::test(start_paused = true)]
async fn restore_without_source_record_uses_default_sizing() {
    let store = Arc::new(MemoryStore::new());
    let orphan = store
        .insert_backup(&NewBackup {
            owner: OWNER.into(),
            instance_id: uuid::Uuid::new_v4(),
            name: "orphan".into(),
            image_name: None,
            source_instance_name: "long gone".into(),
            source_zone: Some("us-central1".into()),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();
    store
        .update_backup_status(orphan.id, &[BackupStatus::Creating], &BackupUpdate::completed(GIB))
        .await
        .unwrap()
        .unwrap();
    let coordinator = demo(store.clone());

    let restored = coordinator
        .restore_backup(OWNER, orphan.id, &restore_as("fresh-desk"))
        .await
        .unwrap();
    assert_eq!(restored.cpu_cores, 2);
    assert_eq!(restored.ram_gb, 8);
    assert_eq!(restored.storage_gb, 50);
    assert_eq!(restored.gpu, GpuKind::None);
    assert_eq!(restored.source_backup_id, Some(orphan.id));
}

async fn interrupted_image_backup(store: &MemoryStore, provider: Option<ProviderLink>) -> Backup {
    let source = store
        .insert_instance(&NewInstance {
            owner: OWNER.into(),
            name: "render box".into(),
            image_id: "windows-server-2022".into(),
            cpu_cores: 4,
            ram_gb: 8,
            storage_gb: 50,
            gpu: GpuKind::None,
            region: "us-central1".into(),
            status: InstanceStatus::Running,
            error_message: None,
            provider,
            source_backup_id: None,
        })
        .await
        .unwrap();
    store
        .insert_backup(&NewBackup {
            owner: OWNER.into(),
            instance_id: source.id,
            name: "before crash".into(),
            image_name: Some("bk-crashed".into()),
            source_instance_name: source.name.clone(),
            source_zone: Some("us-central1-a".into()),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn resumed_backup_reissues_a_build_that_never_ran() {
    let store = Arc::new(MemoryStore::new());
    let link = ProviderLink {
        provider_instance_id: "vd-0123456789ab".into(),
        zone: "us-central1-a".into(),
        machine_type: "e2-standard-4".into(),
        project_id: "test-project".into(),
    };
    let backup = interrupted_image_backup(&store, Some(link)).await;
    let gateway = FakeGateway::new();
    gateway.script_images([Err(ErrorCategory::NotFound), ready_image(4 * GIB)]);
    let coordinator = with_gateway(store.clone(), &gateway);

    assert_eq!(coordinator.reconciler().resume().await.unwrap(), 1);
    advance(11).await;

    assert_eq!(gateway.count("create_image"), 1);
    let done = store.get_backup(backup.id).await.unwrap().unwrap();
    assert_eq!(done.status, BackupStatus::Completed);
    assert_eq!(done.storage_bytes, Some(4 * GIB));
}

#[tokio::test(start_paused = true)]
async fn resumed_backup_without_image_or_source_fails() {
    let store = Arc::new(MemoryStore::new());
    let backup = interrupted_image_backup(&store, None).await;
    let gateway = FakeGateway::new();
    gateway.script_images([Err(ErrorCategory::NotFound)]);
    let coordinator = with_gateway(store.clone(), &gateway);

    coordinator.reconciler().resume().await.unwrap();
    advance(6).await;

    assert_eq!(gateway.count("create_image"), 0);
    let failed = store.get_backup(backup.id).await.unwrap().unwrap();
    assert_eq!(failed.status, BackupStatus::Error);
    assert_eq!(failed.storage_bytes, None);

    // an ERROR backup can be cleaned up by its owner
    let deleted = coordinator.delete_backup(OWNER, backup.id).await.unwrap();
    assert_eq!(deleted.status, BackupStatus::Deleted);
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_tasks() {
    let store = Arc::new(MemoryStore::new());
    let coordinator = demo(store.clone());
    let instance = coordinator.create_instance(OWNER, &desk()).await.unwrap();

    let reconciler = coordinator.reconciler();
    let handle = reconciler.schedule_boot(instance.clone());
    assert_eq!(reconciler.in_flight(), 2);

    reconciler.shutdown().await;
    assert_eq!(handle.await.unwrap(), Outcome::Cancelled);
    assert_eq!(reconciler.in_flight(), 0);

    let record = store.get_instance(instance.id).await.unwrap().unwrap();
    assert_eq!(record.status, InstanceStatus::Provisioning);
}
