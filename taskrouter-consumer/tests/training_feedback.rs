//! Training feedback loop tests against the in-process prediction service
//! stub: report on ack, buffer growth, and the retrain gate.

use std::time::Duration;

use taskrouter_consumer::training::TrainingReporter;
use taskrouter_producer::testing::PredictionServiceStub;
use taskrouter_shared::config::PredictionConfig;
use taskrouter_shared::metrics::ConsumerMetrics;
use taskrouter_shared::models::task::{Task, TaskType};

fn config_for(addr: std::net::SocketAddr) -> PredictionConfig {
    PredictionConfig {
        base_url: PredictionServiceStub::base_url(addr),
        timeout_ms: 2_000,
        ..Default::default()
    }
}

async fn wait_for_buffer(stub: &PredictionServiceStub, expected: usize) {
    for _ in 0..100 {
        if stub.training_buffer_len().await >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!(
        "training buffer never reached {expected} (has {})",
        stub.training_buffer_len().await
    );
}

#[tokio::test]
async fn successful_ack_posts_one_training_record() {
    let stub = PredictionServiceStub::new();
    let (addr, _server) = stub.spawn().await;
    let metrics = ConsumerMetrics::new().unwrap();
    let (reporter, _drain) = TrainingReporter::spawn(&config_for(addr), metrics, false);

    let mut task = Task::new(TaskType::EmailNotification, "welcome mail", 4);
    task.mark_started();
    task.mark_completed();
    task.duration_ms = Some(1_800);

    reporter.report_success(&task, "normal-priority-queue");
    wait_for_buffer(&stub, 1).await;

    let record = stub.last_training_record().await.expect("record stored");
    assert_eq!(record.task_id, task.id);
    assert_eq!(record.actual_duration_ms, 1_800);
    assert!(record.was_successful);
    assert_eq!(record.queue_name, "normal-priority-queue");

    // A retrain call gated on one record now succeeds.
    let url = format!(
        "{}/training/retrain?minRecords=1",
        PredictionServiceStub::base_url(addr)
    );
    let response = reqwest::Client::new().post(&url).send().await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(stub.retrain_count(), 1);
}

#[tokio::test]
async fn retrain_below_threshold_is_rejected() {
    let stub = PredictionServiceStub::new();
    let (addr, _server) = stub.spawn().await;

    let url = format!(
        "{}/training/retrain?minRecords=5",
        PredictionServiceStub::base_url(addr)
    );
    let response = reqwest::Client::new().post(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(stub.retrain_count(), 0);
}

#[tokio::test]
async fn dead_lettered_outcomes_report_only_under_the_policy_flag() {
    let stub = PredictionServiceStub::new();
    let (addr, _server) = stub.spawn().await;
    let metrics = ConsumerMetrics::new().unwrap();

    // Flag off: nothing is posted.
    let (reporter, _drain) = TrainingReporter::spawn(&config_for(addr), metrics.clone(), false);
    let task = Task::new(TaskType::DataProcessing, "crunch", 5);
    reporter.report_dead_lettered(&task, "high-priority-queue");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stub.training_buffer_len().await, 0);

    // Flag on: a failure record arrives.
    let (reporter, _drain) = TrainingReporter::spawn(&config_for(addr), metrics, true);
    reporter.report_dead_lettered(&task, "high-priority-queue");
    wait_for_buffer(&stub, 1).await;
    let record = stub.last_training_record().await.unwrap();
    assert!(!record.was_successful);
}

#[tokio::test]
async fn transport_failure_is_absorbed() {
    // Closed port: every post fails, but reporting never panics or blocks.
    let metrics = ConsumerMetrics::new().unwrap();
    let config = PredictionConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        timeout_ms: 200,
        ..Default::default()
    };
    let (reporter, _drain) = TrainingReporter::spawn(&config, metrics.clone(), false);

    let mut task = Task::new(TaskType::WebScraping, "crawl", 2);
    task.mark_started();
    task.mark_completed();
    reporter.report_success(&task, "low-priority-queue");

    for _ in 0..50 {
        if metrics
            .training_reports_total
            .with_label_values(&["failed"])
            .get()
            >= 1
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("transport failure was never counted");
}
