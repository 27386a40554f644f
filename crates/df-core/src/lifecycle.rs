//! Legal status changes for instances and backups.

use df_db::models::{BackupStatus, InstanceStatus};

use crate::error::{EntityKind, TransitionError};

/// Statuses a user request may move an instance to from `from`.
pub fn instance_targets(from: InstanceStatus) -> &'static [InstanceStatus] {
    use InstanceStatus::*;
    match from {
        Provisioning => &[Running, Error, Deleted],
        Running => &[Stopped, Error, Deleted],
        Stopped => &[Running, Deleted],
        Error => &[Running, Deleted],
        Deleted => &[],
    }
}

pub fn backup_targets(from: BackupStatus) -> &'static [BackupStatus] {
    use BackupStatus::*;
    match from {
        Creating => &[Completed, Error],
        Completed => &[Deleted],
        Error => &[Deleted],
        Deleted => &[],
    }
}

pub fn check_instance(from: InstanceStatus, to: InstanceStatus) -> Result<(), TransitionError> {
    if instance_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::BadTransition {
            kind: EntityKind::Instance,
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

pub fn check_backup(from: BackupStatus, to: BackupStatus) -> Result<(), TransitionError> {
    if backup_targets(from).contains(&to) {
        Ok(())
    } else {
        Err(TransitionError::BadTransition {
            kind: EntityKind::Backup,
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// Only a COMPLETED backup can seed a new instance.
pub fn check_restorable(status: BackupStatus) -> Result<(), TransitionError> {
    if status == BackupStatus::Completed {
        Ok(())
    } else {
        Err(TransitionError::NotAllowedIn {
            kind: EntityKind::Backup,
            status: status.as_str(),
            operation: "restore",
            required: "status COMPLETED",
        })
    }
}

/// Instances that are not DELETED. Gateway-observed writes may land on any
/// of these but never on a deleted record.
pub const LIVE_INSTANCE: [InstanceStatus; 4] = [
    InstanceStatus::Provisioning,
    InstanceStatus::Running,
    InstanceStatus::Stopped,
    InstanceStatus::Error,
];
