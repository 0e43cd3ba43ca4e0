//! Unit tests for the ArangoBackup lifecycle

use std::sync::atomic::Ordering;

use arango_operator::arangod::{BackupClient, CreateBackupRequest, TransferProgress};
use arango_operator::controller::backup_state_machine::{
    BackupEvent, BackupStateMachine, TransitionContext, TransitionResult, backup_label,
    deletion_status, step,
};
use arango_operator::crd::{
    ArangoBackup, ArangoDeployment, BackupDetails, BackupProgress, BackupState, BackupStatus,
};

use crate::common::*;

const MAX_RETRIES: u32 = 3;

const ALL_EVENTS: [BackupEvent; 16] = [
    BackupEvent::Accepted,
    BackupEvent::DownloadRequested,
    BackupEvent::CreateRequested,
    BackupEvent::Created,
    BackupEvent::CreatedForUpload,
    BackupEvent::TransferProgressed,
    BackupEvent::Downloaded,
    BackupEvent::Uploaded,
    BackupEvent::UploadRemoved,
    BackupEvent::UploadRequested,
    BackupEvent::Verified,
    BackupEvent::BackupMissing,
    BackupEvent::TemporaryFailure,
    BackupEvent::Failure,
    BackupEvent::SpecChanged,
    BackupEvent::DeletionRequested,
];

fn deployment() -> ArangoDeployment {
    DeploymentBuilder::cluster("db", "default").build()
}

/// Run one step and store the status the way the reconciler does
async fn advance(
    backup: &mut ArangoBackup,
    deployment: Option<&ArangoDeployment>,
    factory: &FakeClientFactory,
) -> Option<BackupEvent> {
    let outcome = step(backup, deployment, factory, MAX_RETRIES, test_now())
        .await
        .unwrap();
    let mut status = outcome.status;
    status.observed_generation = backup.metadata.generation;
    backup.status = Some(status);
    outcome.event
}

fn status(backup: &ArangoBackup) -> &BackupStatus {
    backup.status.as_ref().unwrap()
}

fn ready_status(id: &str) -> BackupStatus {
    BackupStatus {
        state: BackupState::Ready,
        available: true,
        backup: Some(BackupDetails {
            id: id.to_string(),
            version: "3.7.10".to_string(),
            ..Default::default()
        }),
        observed_generation: Some(1),
        ..Default::default()
    }
}

mod scenarios {
    use super::*;

    #[tokio::test]
    async fn test_backup_without_upload_becomes_ready() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = BackupBuilder::new("nightly", "default", "db").build();

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Accepted)
        );
        assert_eq!(status(&backup).state, BackupState::Scheduled);

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::CreateRequested)
        );
        assert_eq!(status(&backup).state, BackupState::Create);

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Created)
        );
        let status = status(&backup);
        assert_eq!(status.state, BackupState::Ready);
        assert!(status.available);
        assert_eq!(status.time.as_deref(), Some("2024-05-01T12:00:00Z"));
        let details = status.backup.as_ref().unwrap();
        assert_eq!(details.id, "2024-05-01T12.00.00Z_backup-uid-nightly");
        assert_eq!(details.uploaded, None);
        assert_eq!(factory.backups.create_count(), 1);
    }

    #[tokio::test]
    async fn test_ready_backup_missing_in_database_is_deleted() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_status(ready_status("gone"))
            .build();

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::BackupMissing)
        );
        assert_eq!(status(&backup).state, BackupState::Deleted);
        assert!(!status(&backup).available);

        // Deleted is terminal
        assert_eq!(advance(&mut backup, Some(&deployment), &factory).await, None);
        assert_eq!(status(&backup).state, BackupState::Deleted);
    }

    #[tokio::test]
    async fn test_upload_added_to_ready_backup() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        factory.backups.insert_backup(backup_meta("b1"));
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_upload("s3://bucket/backups")
            .with_status(ready_status("b1"))
            .build();

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::UploadRequested)
        );
        assert_eq!(status(&backup).state, BackupState::Upload);
        assert!(status(&backup).available);
    }
}

mod transfers {
    use super::*;

    #[tokio::test]
    async fn test_create_then_upload() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_upload("s3://bucket/backups")
            .build();

        advance(&mut backup, Some(&deployment), &factory).await;
        advance(&mut backup, Some(&deployment), &factory).await;
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::CreatedForUpload)
        );
        assert_eq!(status(&backup).state, BackupState::Upload);
        assert!(status(&backup).available);

        factory
            .backups
            .script_next_job(vec![TransferProgress::Running { percent: 40 }]);
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::TransferProgressed)
        );
        assert_eq!(
            status(&backup).progress,
            Some(BackupProgress {
                job_id: "upload-0".to_string(),
                progress: "0%".to_string(),
            })
        );

        advance(&mut backup, Some(&deployment), &factory).await;
        assert_eq!(
            status(&backup).progress.as_ref().map(|p| p.progress.as_str()),
            Some("40%")
        );

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Uploaded)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Ready);
        assert_eq!(current.progress, None);
        assert_eq!(current.backup.as_ref().unwrap().uploaded, Some(true));

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Verified)
        );
        assert_eq!(status(&backup).backup.as_ref().unwrap().uploaded, Some(true));
    }

    #[tokio::test]
    async fn test_download_restores_remote_backup() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = BackupBuilder::new("restore", "default", "db")
            .with_download("s3://bucket/backups", "remote-1")
            .build();

        advance(&mut backup, Some(&deployment), &factory).await;
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::DownloadRequested)
        );
        assert_eq!(status(&backup).state, BackupState::Download);

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::TransferProgressed)
        );
        assert!(!status(&backup).available);

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Downloaded)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Ready);
        assert!(current.available);
        let details = current.backup.as_ref().unwrap();
        assert_eq!(details.id, "remote-1");
        assert_eq!(details.downloaded, Some(true));
        assert_eq!(factory.backups.create_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_job_is_restarted() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        factory.backups.insert_backup(backup_meta("b1"));
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_upload("s3://bucket/backups")
            .with_status(BackupStatus {
                state: BackupState::Upload,
                ..ready_status("b1")
            })
            .build();

        factory.backups.script_next_job(vec![TransferProgress::Failed {
            message: "bucket unreachable".to_string(),
        }]);
        advance(&mut backup, Some(&deployment), &factory).await;
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::TemporaryFailure)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Upload);
        assert_eq!(current.retry_count, 1);
        assert_eq!(current.progress, None);
        assert!(current.message.as_deref().unwrap().contains("bucket unreachable"));

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::TransferProgressed)
        );
        let current = status(&backup);
        assert_eq!(current.progress.as_ref().unwrap().job_id, "upload-1");
        assert_eq!(current.retry_count, 1);

        // The restarted job completes and clears the budget
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Uploaded)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Ready);
        assert_eq!(current.retry_count, 0);
        assert_eq!(current.first_failure_time, None);
    }

    #[tokio::test]
    async fn test_upload_job_failing_every_time_exhausts_budget() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        factory.backups.insert_backup(backup_meta("b1"));
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_upload("s3://bucket/backups")
            .with_status(BackupStatus {
                state: BackupState::Upload,
                ..ready_status("b1")
            })
            .build();

        for _ in 0..40 {
            if status(&backup).state != BackupState::Upload {
                break;
            }
            if status(&backup).progress.is_none() {
                factory.backups.script_next_job(vec![TransferProgress::Failed {
                    message: "disk full".to_string(),
                }]);
            }
            advance(&mut backup, Some(&deployment), &factory).await;
        }

        let current = status(&backup);
        assert_eq!(current.state, BackupState::Failed);
        assert_eq!(current.retry_count, MAX_RETRIES + 1);
        assert!(!current.available);
        let message = current.message.as_deref().unwrap();
        assert!(message.contains("giving up after 3 retries"));
        assert!(message.contains("disk full"));
    }

    #[tokio::test]
    async fn test_download_job_failing_every_time_exhausts_budget() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = BackupBuilder::new("restore", "default", "db")
            .with_download("s3://bucket/backups", "remote-1")
            .with_status(BackupStatus {
                state: BackupState::Download,
                observed_generation: Some(1),
                ..Default::default()
            })
            .build();

        for _ in 0..40 {
            if status(&backup).state != BackupState::Download {
                break;
            }
            if status(&backup).progress.is_none() {
                factory.backups.script_next_job(vec![TransferProgress::Failed {
                    message: "checksum mismatch".to_string(),
                }]);
            }
            advance(&mut backup, Some(&deployment), &factory).await;
        }

        let current = status(&backup);
        assert_eq!(current.state, BackupState::Failed);
        assert!(current.message.as_deref().unwrap().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_upload_removed_during_upload() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        factory.backups.insert_backup(backup_meta("b1"));
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_status(BackupStatus {
                state: BackupState::Upload,
                progress: Some(BackupProgress {
                    job_id: "upload-7".to_string(),
                    progress: "10%".to_string(),
                }),
                ..ready_status("b1")
            })
            .build();

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::UploadRemoved)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Ready);
        assert_eq!(current.progress, None);
        assert!(current.available);
        assert!(factory.backups.has_backup("b1"));
    }

    #[tokio::test]
    async fn test_upload_removed_from_ready_backup_clears_flag() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        factory.backups.insert_backup(backup_meta("b1"));
        let mut status_in = ready_status("b1");
        status_in.backup.as_mut().unwrap().uploaded = Some(true);
        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_status(status_in)
            .build();

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::UploadRemoved)
        );
        assert_eq!(status(&backup).state, BackupState::Ready);
        assert_eq!(status(&backup).backup.as_ref().unwrap().uploaded, None);
    }
}

mod failures {
    use super::*;

    fn creating() -> ArangoBackup {
        BackupBuilder::new("nightly", "default", "db")
            .with_state(BackupState::Create)
            .build()
    }

    #[tokio::test]
    async fn test_temporary_failures_stay_in_create_until_budget_is_spent() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = creating();

        for attempt in 1..=MAX_RETRIES {
            factory.backups.fail_next(arango_unavailable());
            assert_eq!(
                advance(&mut backup, Some(&deployment), &factory).await,
                Some(BackupEvent::TemporaryFailure)
            );
            assert_eq!(status(&backup).state, BackupState::Create);
            assert_eq!(status(&backup).retry_count, attempt);
            assert!(status(&backup).first_failure_time.is_some());
        }

        factory.backups.fail_next(arango_unavailable());
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Failure)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Failed);
        assert!(!current.available);
        assert!(current.message.as_deref().unwrap().starts_with("giving up after 3 retries"));
    }

    #[tokio::test]
    async fn test_success_after_retry_resets_budget() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = creating();

        factory.backups.fail_next(arango_unavailable());
        advance(&mut backup, Some(&deployment), &factory).await;
        assert_eq!(status(&backup).retry_count, 1);

        advance(&mut backup, Some(&deployment), &factory).await;
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Ready);
        assert_eq!(current.retry_count, 0);
        assert_eq!(current.first_failure_time, None);
        assert_eq!(current.message, None);
    }

    #[tokio::test]
    async fn test_permanent_failure_fails_at_once() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = creating();

        factory.backups.fail_next(arango_unauthorized());
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::Failure)
        );
        assert_eq!(status(&backup).state, BackupState::Failed);
        assert_eq!(status(&backup).retry_count, 0);
    }

    #[tokio::test]
    async fn test_unreachable_database_is_retried() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        factory.unreachable.store(true, Ordering::SeqCst);
        let mut backup = creating();

        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::TemporaryFailure)
        );
        assert_eq!(status(&backup).state, BackupState::Create);
    }

    #[tokio::test]
    async fn test_missing_deployment_fails() {
        let factory = FakeClientFactory::new();
        let mut backup = creating();

        assert_eq!(
            advance(&mut backup, None, &factory).await,
            Some(BackupEvent::Failure)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Failed);
        assert!(current.message.as_deref().unwrap().contains("ArangoDeployment db"));
    }

    #[tokio::test]
    async fn test_retried_create_reuses_earlier_backup() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();
        let mut backup = creating();

        // An earlier pass created the backup but never recorded it
        factory
            .backups
            .create_backup(&CreateBackupRequest {
                label: backup_label(&backup),
                timeout: None,
                allow_inconsistent: false,
            })
            .await
            .unwrap();

        advance(&mut backup, Some(&deployment), &factory).await;
        assert_eq!(status(&backup).state, BackupState::Ready);
        assert_eq!(factory.backups.create_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_backup_restarts_only_after_spec_change() {
        let deployment = deployment();
        let factory = FakeClientFactory::new();

        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_state(BackupState::Failed)
            .build();
        assert_eq!(advance(&mut backup, Some(&deployment), &factory).await, None);
        assert_eq!(status(&backup).state, BackupState::Failed);

        let mut backup = BackupBuilder::new("nightly", "default", "db")
            .with_state(BackupState::Failed)
            .with_generation(2)
            .build();
        assert_eq!(
            advance(&mut backup, Some(&deployment), &factory).await,
            Some(BackupEvent::SpecChanged)
        );
        let current = status(&backup);
        assert_eq!(current.state, BackupState::Scheduled);
        assert_eq!(current.retry_count, 0);
        assert_eq!(current.backup, None);
    }
}

mod table {
    use super::*;

    #[test]
    fn test_every_pair_has_an_answer() {
        let machine = BackupStateMachine::new();
        let ctx = TransitionContext {
            spec_changed: true,
            upload_requested: true,
        };
        for state in BackupState::ALL {
            for event in ALL_EVENTS {
                let result = machine.transition(state, event, &ctx);
                match result {
                    TransitionResult::Success { from, .. } => assert_eq!(from, state),
                    TransitionResult::InvalidTransition { current, .. } => {
                        assert_eq!(current, state);
                        assert!(!machine.can_transition(state, event));
                    }
                    TransitionResult::GuardFailed { .. } => {
                        panic!("guards pass with a permissive context")
                    }
                }
            }
        }
    }

    #[test]
    fn test_terminal_states() {
        let machine = BackupStateMachine::new();
        assert!(machine.valid_events(BackupState::Deleted).is_empty());
        assert_eq!(
            machine.valid_events(BackupState::Failed),
            vec![BackupEvent::SpecChanged, BackupEvent::DeletionRequested]
        );
    }

    #[test]
    fn test_spec_change_detection() {
        let backup = BackupBuilder::new("nightly", "default", "db")
            .with_state(BackupState::Failed)
            .build();
        assert!(!TransitionContext::for_backup(&backup).spec_changed);

        let backup = BackupBuilder::new("nightly", "default", "db")
            .with_upload("s3://bucket")
            .with_state(BackupState::Failed)
            .with_generation(3)
            .build();
        let ctx = TransitionContext::for_backup(&backup);
        assert!(ctx.spec_changed);
        assert!(ctx.upload_requested);
    }

    #[test]
    fn test_deletion_status() {
        let backup = BackupBuilder::new("nightly", "default", "db")
            .with_status(ready_status("b1"))
            .build();
        let status = deletion_status(&backup, &test_now()).unwrap();
        assert_eq!(status.state, BackupState::Deleted);
        assert!(!status.available);

        let backup = BackupBuilder::new("nightly", "default", "db")
            .with_state(BackupState::Create)
            .build();
        assert_eq!(deletion_status(&backup, &test_now()), None);

        let backup = BackupBuilder::new("nightly", "default", "db")
            .with_state(BackupState::Failed)
            .build();
        assert_eq!(
            deletion_status(&backup, &test_now()).map(|s| s.state),
            Some(BackupState::Deleted)
        );
    }

    #[test]
    fn test_label_is_object_uid() {
        let backup = BackupBuilder::new("nightly", "default", "db").build();
        assert_eq!(backup_label(&backup), "backup-uid-nightly");
    }
}
