//! Publisher integration tests against a live RabbitMQ. Run the broker
//! locally (e.g. `docker run -p 5672:5672 rabbitmq:3`) and execute with
//! `cargo test -p taskrouter-producer -- --ignored`.

use std::sync::Arc;

use taskrouter_producer::prediction::PredictionClient;
use taskrouter_producer::publisher::TaskPublisher;
use taskrouter_producer::testing::PredictionServiceStub;
use taskrouter_shared::config::{BrokerConfig, PredictionConfig};
use taskrouter_shared::messaging::RabbitBroker;
use taskrouter_shared::metrics::{PredictionMetrics, ProducerMetrics};
use taskrouter_shared::models::destination::Destination;
use taskrouter_shared::models::features::{BusinessPriority, TaskFeatures, UserTier};
use taskrouter_shared::models::task::{Task, TaskType};

async fn publisher_with_stub(stub: &PredictionServiceStub) -> (Arc<RabbitBroker>, TaskPublisher) {
    let (addr, _server) = stub.spawn().await;
    let broker = Arc::new(
        RabbitBroker::connect(&BrokerConfig::default())
            .await
            .expect("broker reachable"),
    );
    broker.declare_topology().await.expect("topology declared");

    let prediction = Arc::new(
        PredictionClient::new(
            PredictionConfig {
                base_url: PredictionServiceStub::base_url(addr),
                ..Default::default()
            },
            PredictionMetrics::new().unwrap(),
        )
        .unwrap(),
    );
    let publisher = TaskPublisher::new(
        broker.clone(),
        prediction,
        ProducerMetrics::new().unwrap(),
    );
    (broker, publisher)
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn ai_optimized_critical_routing() {
    let stub = PredictionServiceStub::new();
    let (broker, publisher) = publisher_with_stub(&stub).await;
    broker.purge(Destination::Critical).await.unwrap();

    let mut features = TaskFeatures::default();
    features.user.tier = Some(UserTier::Enterprise);
    features.business.business_priority = Some(BusinessPriority::Critical);
    features.business.deadline = Some(chrono::Utc::now() + chrono::Duration::minutes(20));

    let mut task =
        Task::new(TaskType::ReportGeneration, "urgent quarterly report", 3).with_features(features);
    let decision = publisher.publish(&mut task).await.expect("publish succeeds");

    assert_eq!(decision.destination, Destination::Critical);
    assert_eq!(decision.routing_key, "priority.critical");
    assert!(decision.wire_priority >= 200);
    assert!(task.ai_processed);
    // round(0.7 * 9 + 0.3 * 3) = 7
    assert_eq!(task.effective_priority(), 7);
    assert_eq!(broker.queue_depth(Destination::Critical).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn prediction_outage_falls_back_to_manual_routing() {
    let stub = PredictionServiceStub::new();
    stub.set_failing(true);
    let (broker, publisher) = publisher_with_stub(&stub).await;
    broker.purge(Destination::Normal).await.unwrap();

    let mut task = Task::new(TaskType::EmailNotification, "welcome mail", 4);
    let decision = publisher.publish(&mut task).await.expect("publish succeeds");

    assert_eq!(decision.destination, Destination::Normal);
    assert_eq!(decision.routing_key, "priority.normal");
    assert!(decision.reason.starts_with("fallback:"));
    assert!(!task.ai_processed);
    assert!(task.ai_error.is_some());
    assert_eq!(broker.queue_depth(Destination::Normal).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn anomaly_routes_to_the_anomaly_exchange() {
    let stub = PredictionServiceStub::new();
    let (broker, publisher) = publisher_with_stub(&stub).await;
    broker.purge(Destination::Anomaly).await.unwrap();

    let mut features = TaskFeatures::default();
    features.quality.data_quality_score = Some(0.1); // anomaly rule

    let mut task = Task::new(TaskType::DataProcessing, "suspicious batch", 5).with_features(features);
    let decision = publisher.publish(&mut task).await.expect("publish succeeds");

    assert_eq!(decision.destination, Destination::Anomaly);
    assert_eq!(decision.exchange, "anomaly-exchange");
    assert_eq!(decision.routing_key, "anomaly.detected");
    assert_eq!(broker.queue_depth(Destination::Anomaly).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires RabbitMQ running (slow: fills the critical queue)"]
async fn overflow_rejection_surfaces_to_the_submitter() {
    let stub = PredictionServiceStub::new();
    stub.set_failing(true); // fallback routing keeps the test deterministic
    let (broker, publisher) = publisher_with_stub(&stub).await;
    broker.purge(Destination::Critical).await.unwrap();
    broker.purge(Destination::Normal).await.unwrap();

    // critical has the smallest x-max-length (1000) and reject-publish
    // overflow; fill it and one more must fail.
    let mut failures = 0;
    for i in 0..=Destination::Critical.max_depth() {
        let mut task = Task::new(TaskType::SystemMaintenance, format!("fill {i}"), 10);
        if let Err(e) = publisher.publish(&mut task).await {
            assert!(e.is_overflow(), "expected overflow, got: {e}");
            failures += 1;
        }
    }
    assert!(failures >= 1, "publishing past x-max-length must fail");

    // Other destinations are unaffected.
    let mut task = Task::new(TaskType::EmailNotification, "unaffected", 4);
    publisher.publish(&mut task).await.expect("normal queue still accepts");

    broker.purge(Destination::Critical).await.unwrap();
    broker.purge(Destination::Normal).await.unwrap();
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn batch_publish_returns_success_count() {
    let stub = PredictionServiceStub::new();
    let (broker, publisher) = publisher_with_stub(&stub).await;
    for destination in Destination::ALL {
        broker.purge(destination).await.unwrap();
    }

    let mut tasks: Vec<Task> = (0..10)
        .map(|i| Task::new(TaskType::DataExport, format!("dump {i}"), (i % 11) as u8))
        .collect();
    let sent = publisher.publish_batch(&mut tasks).await;
    assert_eq!(sent, 10);
    for task in &tasks {
        assert!(task.ai_processed);
    }
}
