//! `TEXT <-> enum` conversions for the status-like fields of §3. Kept here
//! rather than on the entities themselves, since the wire/storage encoding
//! is the catalog's concern, not the entity's.

use anyhow::{bail, Error};

use tbarr_types::{BackupSetStatus, BackupType, DriveOperationalStatus, JobExecutionStatus, SourceType, TapeStatus};

pub fn tape_status_to_str(s: TapeStatus) -> &'static str {
    match s {
        TapeStatus::Blank => "blank",
        TapeStatus::Active => "active",
        TapeStatus::Full => "full",
        TapeStatus::Expired => "expired",
        TapeStatus::Retired => "retired",
        TapeStatus::Exported => "exported",
    }
}

pub fn tape_status_from_str(s: &str) -> Result<TapeStatus, Error> {
    Ok(match s {
        "blank" => TapeStatus::Blank,
        "active" => TapeStatus::Active,
        "full" => TapeStatus::Full,
        "expired" => TapeStatus::Expired,
        "retired" => TapeStatus::Retired,
        "exported" => TapeStatus::Exported,
        other => bail!("unknown tape status '{other}'"),
    })
}

pub fn drive_status_to_str(s: DriveOperationalStatus) -> &'static str {
    match s {
        DriveOperationalStatus::Ready => "ready",
        DriveOperationalStatus::Busy => "busy",
        DriveOperationalStatus::Offline => "offline",
        DriveOperationalStatus::Error => "error",
    }
}

pub fn drive_status_from_str(s: &str) -> Result<DriveOperationalStatus, Error> {
    Ok(match s {
        "ready" => DriveOperationalStatus::Ready,
        "busy" => DriveOperationalStatus::Busy,
        "offline" => DriveOperationalStatus::Offline,
        "error" => DriveOperationalStatus::Error,
        other => bail!("unknown drive status '{other}'"),
    })
}

pub fn source_type_to_str(s: SourceType) -> &'static str {
    match s {
        SourceType::Local => "local",
        SourceType::Smb => "smb",
        SourceType::Nfs => "nfs",
    }
}

pub fn source_type_from_str(s: &str) -> Result<SourceType, Error> {
    Ok(match s {
        "local" => SourceType::Local,
        "smb" => SourceType::Smb,
        "nfs" => SourceType::Nfs,
        other => bail!("unknown source type '{other}'"),
    })
}

pub fn backup_type_to_str(s: BackupType) -> &'static str {
    match s {
        BackupType::Full => "full",
        BackupType::Incremental => "incremental",
    }
}

pub fn backup_type_from_str(s: &str) -> Result<BackupType, Error> {
    Ok(match s {
        "full" => BackupType::Full,
        "incremental" => BackupType::Incremental,
        other => bail!("unknown backup type '{other}'"),
    })
}

pub fn backup_set_status_to_str(s: BackupSetStatus) -> &'static str {
    match s {
        BackupSetStatus::Pending => "pending",
        BackupSetStatus::Running => "running",
        BackupSetStatus::Completed => "completed",
        BackupSetStatus::Failed => "failed",
        BackupSetStatus::Cancelled => "cancelled",
    }
}

pub fn backup_set_status_from_str(s: &str) -> Result<BackupSetStatus, Error> {
    Ok(match s {
        "pending" => BackupSetStatus::Pending,
        "running" => BackupSetStatus::Running,
        "completed" => BackupSetStatus::Completed,
        "failed" => BackupSetStatus::Failed,
        "cancelled" => BackupSetStatus::Cancelled,
        other => bail!("unknown backup set status '{other}'"),
    })
}

pub fn job_execution_status_to_str(s: JobExecutionStatus) -> &'static str {
    match s {
        JobExecutionStatus::Pending => "pending",
        JobExecutionStatus::Running => "running",
        JobExecutionStatus::Completed => "completed",
        JobExecutionStatus::Failed => "failed",
        JobExecutionStatus::Cancelled => "cancelled",
        JobExecutionStatus::Paused => "paused",
    }
}

pub fn job_execution_status_from_str(s: &str) -> Result<JobExecutionStatus, Error> {
    Ok(match s {
        "pending" => JobExecutionStatus::Pending,
        "running" => JobExecutionStatus::Running,
        "completed" => JobExecutionStatus::Completed,
        "failed" => JobExecutionStatus::Failed,
        "cancelled" => JobExecutionStatus::Cancelled,
        "paused" => JobExecutionStatus::Paused,
        other => bail!("unknown job execution status '{other}'"),
    })
}
