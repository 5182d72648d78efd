//! End-to-end runs against a scripted file server

mod common;

use assessor_sync::import::FieldValue;
use assessor_sync::run_log::RunEvent;
use assessor_sync::{ProductionStore, RunStatus, RunTrigger, SyncRun};
use common::{harness, harness_with, test_config, FakeServer, FIVE_PARCELS, TWO_PARCELS};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_run_downloads_stages_and_commits() {
    let h = harness(FakeServer::new().with_file("parcel_2024.csv", 3, FIVE_PARCELS));

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(run.status, RunStatus::Succeeded, "{:?}", run.errors);
    assert_eq!(run.files_downloaded, 1);
    assert_eq!(run.records_staged, 5);
    assert_eq!(run.records_committed, 4);
    assert_eq!(run.records_failed, 1);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].contains("row 3"), "{}", run.errors[0]);
    assert!(h.config.data_dir.join("parcel_2024.csv").exists());
    assert!(h.config.data_dir.join("metadata.json").exists());
    assert!(!h.server.is_connected());

    let record = h.production.get("property", "BC001").await.unwrap().unwrap();
    assert_eq!(record.fields["address"], FieldValue::Text("123 Main St".into()));
    assert_eq!(record.fields["parcelNumber"], FieldValue::Text("12345".into()));
    assert_eq!(record.fields["acres"], FieldValue::Decimal("0.25".parse().unwrap()));
    assert_eq!(record.fields["value"], FieldValue::Integer(150000));
    assert_eq!(h.production.count("property").await.unwrap(), 4);

    let staged = h.engine.get_staged_records(&run.import_ids[0]).await.unwrap();
    assert_eq!(staged.len(), 5);
    assert!(staged[2].committed_at.is_none());
}

#[tokio::test]
async fn test_transient_failures_are_retried_without_failing_the_run() {
    let h = harness(
        FakeServer::new()
            .with_file("parcel_2024.csv", 3, TWO_PARCELS)
            .flaky("parcel_2024.csv", 2),
    );

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(h.server.retrievals().len(), 3);
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.files_downloaded, 1);
    assert!(run.errors.is_empty(), "{:?}", run.errors);
    assert_eq!(h.production.count("property").await.unwrap(), 2);
}

#[tokio::test]
async fn test_exhausted_file_is_reported_and_others_continue() {
    let h = harness(
        FakeServer::new()
            .with_file("parcel_2024.csv", 3, TWO_PARCELS)
            .with_file("tax_roll_2023.csv", 2, FIVE_PARCELS)
            .flaky("tax_roll_2023.csv", 10),
    );

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.files_processed, 2);
    assert_eq!(run.files_downloaded, 1);
    assert!(run.errors.iter().any(|e| e.contains("tax_roll_2023.csv") && e.contains("3 attempt")));
    assert_eq!(h.production.count("property").await.unwrap(), 2);

    // Newest first, and retries do not reorder files.
    let retrievals = h.server.retrievals();
    assert_eq!(retrievals[0], "/exports/parcel_2024.csv");
    assert!(retrievals[1..].iter().all(|p| p == "/exports/tax_roll_2023.csv"));
}

#[tokio::test]
async fn test_repeated_runs_update_instead_of_duplicating() {
    let h = harness(FakeServer::new().with_file("parcel_2024.csv", 3, FIVE_PARCELS));
    let cancel = CancellationToken::new();

    let first = h.scheduler.run_once(RunTrigger::Manual, &cancel).await;
    let second = h.scheduler.run_once(RunTrigger::Scheduled, &cancel).await;

    assert_eq!(first.records_committed, 4);
    assert_eq!(second.records_committed, 4);
    assert_ne!(first.import_ids, second.import_ids);
    assert_eq!(h.production.count("property").await.unwrap(), 4);

    let last = SyncRun::load_last(&h.config.last_run_path()).unwrap().unwrap();
    assert_eq!(last.run_id, second.run_id);
}

#[tokio::test]
async fn test_unrecognised_file_is_skipped_and_reported() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.keywords.push("sales".into());
    let h = harness_with(dir, config, FakeServer::new().with_file("sales_2024.csv", 3, "a,b\n"));

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.files_downloaded, 1);
    assert_eq!(run.records_staged, 0);
    assert!(run.errors[0].contains("no entity type matches"));
}

#[tokio::test]
async fn test_staging_only_when_auto_commit_is_off() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.auto_commit = false;
    let h = harness_with(
        dir,
        config,
        FakeServer::new().with_file("parcel_2024.csv", 3, FIVE_PARCELS),
    );

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.records_staged, 5);
    assert_eq!(run.records_committed, 0);
    assert_eq!(h.production.count("property").await.unwrap(), 0);

    let result = h
        .engine
        .commit_import(&run.import_ids[0], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!((result.total, result.success_count, result.failure_count), (5, 4, 1));
}

#[tokio::test]
async fn test_rejected_login_fails_run_without_downloads() {
    let h = harness(
        FakeServer::new()
            .with_file("parcel_2024.csv", 3, FIVE_PARCELS)
            .refusing_login(),
    );

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.errors[0].contains("530"));
    assert_eq!(h.server.connects(), 1);
    assert!(h.server.retrievals().is_empty());
    assert!(!h.config.lock_path.exists());
}

#[tokio::test]
async fn test_cancelled_run_fails_and_releases_lock() {
    let h = harness(FakeServer::new().with_file("parcel_2024.csv", 3, FIVE_PARCELS));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let run = h.scheduler.run_once(RunTrigger::Manual, &cancel).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.errors[0].contains("cancelled"));
    assert!(h.server.retrievals().is_empty());
    assert!(!h.server.is_connected());
    assert!(!h.config.lock_path.exists());
}

#[tokio::test]
async fn test_every_record_error_reaches_the_run_artifact() {
    let body: String = (1..=60).map(|i| format!("BX{:03},broken row\n", i)).collect();
    let h = harness(FakeServer::new().with_file("parcel_2024.csv", 3, &body));

    let run = h.scheduler.run_once(RunTrigger::Manual, &CancellationToken::new()).await;

    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.records_failed, 60);
    assert!(run.errors.len() <= h.config.max_reported_errors);

    let artifact = std::fs::read_dir(h.config.runs_dir())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .find(|path| path.extension().is_some_and(|ext| ext == "jsonl"))
        .unwrap();
    let rows: Vec<u64> = std::fs::read_to_string(artifact)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str::<RunEvent>(line).unwrap())
        .filter(|event| event.message == "record rejected")
        .map(|event| {
            assert_eq!(event.fields["file"], "parcel_2024.csv");
            assert!(event.fields["error"].as_str().unwrap().starts_with("row "));
            event.fields["row"].as_u64().unwrap()
        })
        .collect();
    assert_eq!(rows, (1..=60).collect::<Vec<u64>>());
}
