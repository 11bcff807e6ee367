//! Consumer pool integration tests against a live RabbitMQ. Run the
//! broker locally and execute with
//! `cargo test -p taskrouter-consumer -- --ignored`.

use std::sync::Arc;
use std::time::Duration;

use lapin::options::{BasicGetOptions, QueuePurgeOptions};
use taskrouter_consumer::handlers::HandlerRegistry;
use taskrouter_consumer::pool::ConsumerPool;
use taskrouter_producer::prediction::PredictionClient;
use taskrouter_producer::publisher::TaskPublisher;
use taskrouter_producer::testing::PredictionServiceStub;
use taskrouter_shared::config::{PolicyOverride, PredictionConfig, TaskRouterConfig};
use taskrouter_shared::messaging::headers::{MessageHeaders, HEADER_RETRY_COUNT};
use taskrouter_shared::messaging::RabbitBroker;
use taskrouter_shared::metrics::{ConsumerMetrics, PredictionMetrics, ProducerMetrics};
use taskrouter_shared::models::destination::{Destination, DLQ_QUEUE};
use taskrouter_shared::models::task::{Task, TaskType};

/// Pool configuration with fast retry delays and the stub service.
fn test_config(stub_addr: std::net::SocketAddr) -> TaskRouterConfig {
    let mut config = TaskRouterConfig {
        prediction: PredictionConfig {
            base_url: PredictionServiceStub::base_url(stub_addr),
            timeout_ms: 2_000,
            ..Default::default()
        },
        ..Default::default()
    };
    for destination in Destination::ALL {
        config.consumer.destinations.insert(
            destination.as_str().to_string(),
            PolicyOverride {
                retry_delay_ms: Some(100),
                ..Default::default()
            },
        );
    }
    config
}

async fn publisher_for(
    broker: Arc<RabbitBroker>,
    stub_addr: std::net::SocketAddr,
    failing_predictions: bool,
) -> TaskPublisher {
    let stub_url = PredictionServiceStub::base_url(stub_addr);
    let base_url = if failing_predictions {
        // Unreachable port: predictions collapse to fallback routing.
        "http://127.0.0.1:1".to_string()
    } else {
        stub_url
    };
    let prediction = Arc::new(
        PredictionClient::new(
            PredictionConfig {
                base_url,
                timeout_ms: 300,
                ..Default::default()
            },
            PredictionMetrics::new().unwrap(),
        )
        .unwrap(),
    );
    TaskPublisher::new(broker, prediction, ProducerMetrics::new().unwrap())
}

async fn purge_all(broker: &RabbitBroker) {
    for destination in Destination::ALL {
        broker.purge(destination).await.unwrap();
    }
    let channel = broker.create_channel().await.unwrap();
    channel
        .queue_purge(DLQ_QUEUE, QueuePurgeOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn successful_delivery_acks_and_reports_training() {
    let stub = PredictionServiceStub::new();
    let (stub_addr, _server) = stub.spawn().await;

    let broker = Arc::new(
        RabbitBroker::connect(&Default::default())
            .await
            .expect("broker reachable"),
    );
    broker.declare_topology().await.unwrap();
    purge_all(&broker).await;

    let config = test_config(stub_addr);
    let metrics = ConsumerMetrics::new().unwrap();
    let pool = ConsumerPool::start(
        broker.clone(),
        &config,
        Arc::new(HandlerRegistry::with_demo_handlers()),
        metrics.clone(),
    )
    .await
    .unwrap();

    // Fallback routing: manual 4 lands on normal.
    let publisher = publisher_for(broker.clone(), stub_addr, true).await;
    let mut task = Task::new(TaskType::EmailNotification, "welcome mail", 4);
    publisher.publish(&mut task).await.unwrap();

    // Wait for ack + training record.
    for _ in 0..100 {
        if stub.training_buffer_len().await >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let record = stub.last_training_record().await.expect("training record");
    assert_eq!(record.task_id, task.id);
    assert!(record.was_successful);
    assert_eq!(record.queue_name, "normal-priority-queue");
    assert_eq!(
        metrics
            .tasks_processed_total
            .with_label_values(&["EmailNotification", "normal-priority-queue", "acked"])
            .get(),
        1
    );

    pool.shutdown().await;
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn retry_exhaustion_dead_letters_with_retry_state() {
    let stub = PredictionServiceStub::new();
    let (stub_addr, _server) = stub.spawn().await;

    let broker = Arc::new(
        RabbitBroker::connect(&Default::default())
            .await
            .expect("broker reachable"),
    );
    broker.declare_topology().await.unwrap();
    purge_all(&broker).await;

    let config = test_config(stub_addr);
    let pool = ConsumerPool::start(
        broker.clone(),
        &config,
        Arc::new(HandlerRegistry::with_demo_handlers()),
        ConsumerMetrics::new().unwrap(),
    )
    .await
    .unwrap();

    // Fallback routing: manual 5 lands on high (max_retries = 3). The
    // handler fails every delivery.
    let publisher = publisher_for(broker.clone(), stub_addr, true).await;
    let mut task = Task::new(TaskType::DataProcessing, "always failing", 5)
        .with_parameter("simulate_failure", serde_json::json!(true));
    publisher.publish(&mut task).await.unwrap();

    // Four deliveries at ~100ms retry delay each; allow generous time.
    let channel = broker.create_channel().await.unwrap();
    let mut dead = None;
    for _ in 0..200 {
        if let Some(delivery) = channel
            .basic_get(DLQ_QUEUE, BasicGetOptions { no_ack: true })
            .await
            .unwrap()
        {
            dead = Some(delivery);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let dead = dead.expect("message reached the DLQ");

    // Body preserved from the final redelivery: the full retry budget is
    // recorded and never exceeded.
    let body: Task = serde_json::from_slice(&dead.delivery.data).unwrap();
    assert_eq!(body.id, task.id);
    assert_eq!(body.retry_count, 3);
    assert_eq!(body.max_retries, 3);
    assert_eq!(body.error_history.len(), 3);
    assert!(body.last_error.as_deref().unwrap().contains("simulated failure"));

    let headers = dead
        .delivery
        .properties
        .headers()
        .clone()
        .unwrap_or_default();
    let parsed = MessageHeaders::parse(&headers).unwrap();
    assert_eq!(parsed.retry_count, 3, "{HEADER_RETRY_COUNT} on the final redelivery");

    pool.shutdown().await;
}

#[tokio::test]
#[ignore = "requires RabbitMQ running"]
async fn unparseable_body_goes_straight_to_the_dlq() {
    let stub = PredictionServiceStub::new();
    let (stub_addr, _server) = stub.spawn().await;

    let broker = Arc::new(
        RabbitBroker::connect(&Default::default())
            .await
            .expect("broker reachable"),
    );
    broker.declare_topology().await.unwrap();
    purge_all(&broker).await;

    let config = test_config(stub_addr);
    let metrics = ConsumerMetrics::new().unwrap();
    let pool = ConsumerPool::start(
        broker.clone(),
        &config,
        Arc::new(HandlerRegistry::with_demo_handlers()),
        metrics.clone(),
    )
    .await
    .unwrap();

    // Garbage straight onto the low queue, bypassing the publisher.
    broker
        .publish(
            "priority-exchange",
            "priority.low",
            b"not json at all",
            lapin::BasicProperties::default().with_delivery_mode(2),
        )
        .await
        .unwrap();

    for _ in 0..100 {
        if metrics
            .parse_errors_total
            .with_label_values(&["low-priority-queue"])
            .get()
            >= 1
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(
        metrics
            .parse_errors_total
            .with_label_values(&["low-priority-queue"])
            .get(),
        1
    );

    pool.shutdown().await;
}
