//! Dispatcher tests: chunk publication, result application, idempotence.

use std::time::Duration;

use vulnscan_protocol::{ChunkMessage, ResultMessage, TaskStatus};
use vulnscan_scheduler::dispatcher::{Dispatcher, DispatcherConfig};
use vulnscan_scheduler::task_manager::{CreateTask, TaskManager};
use vulnscan_store::{open_store, VulnStore, WorkBroker};

struct Setup {
    _tmp: tempfile::TempDir,
    store: VulnStore,
    broker: WorkBroker,
    dispatcher: Dispatcher,
}

async fn setup() -> Setup {
    let tmp = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", tmp.path().join("dispatch.db").display());
    let store = open_store(&url, 5).await.unwrap();
    let broker = WorkBroker::new(store.pool().clone(), "vulnscan");
    let tasks = TaskManager::new(store.clone());
    let dispatcher = Dispatcher::new(
        broker.clone(),
        tasks,
        DispatcherConfig {
            chunk_size: 2,
            ..DispatcherConfig::default()
        },
    );
    dispatcher.connect().await.unwrap();
    Setup {
        _tmp: tmp,
        store,
        broker,
        dispatcher,
    }
}

async fn drain_chunks(broker: &WorkBroker) -> Vec<ChunkMessage> {
    let mut chunks = Vec::new();
    while let Some(delivery) = broker
        .consume("scan.tasks", Duration::from_secs(30))
        .await
        .unwrap()
    {
        assert_eq!(delivery.routing_key, "task");
        chunks.push(serde_json::from_slice(&delivery.body).unwrap());
        broker.ack(delivery.delivery_id).await.unwrap();
    }
    chunks
}

#[tokio::test]
async fn dispatch_publishes_ordered_chunks_and_marks_running() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new(
            "t",
            vec!["a.com".to_string(), "b.com".to_string(), "c.com".to_string()],
        ))
        .await
        .unwrap();

    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    let chunks = drain_chunks(&s.broker).await;
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_id, 0);
    assert_eq!(chunks[0].targets, vec!["a.com".to_string(), "b.com".to_string()]);
    assert_eq!(chunks[1].chunk_id, 1);
    assert_eq!(chunks[1].targets, vec!["c.com".to_string()]);
    assert!(chunks.iter().all(|c| c.total_chunks == 2));
    assert!(chunks.iter().all(|c| c.task_id == task.id));
    assert!(chunks.iter().all(|c| c.message_type == "scan"));

    let row = s.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.status(), TaskStatus::Running);
}

#[tokio::test]
async fn cidr_task_dispatches_every_expanded_address() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new("cidr", vec!["192.168.1.0/30".to_string()]))
        .await
        .unwrap();
    assert_eq!(task.progress().total, 4);

    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    let chunks = drain_chunks(&s.broker).await;
    let total_targets: usize = chunks.iter().map(|c| c.targets.len()).sum();
    // chunked expansion covers exactly progress_total addresses
    assert_eq!(total_targets as u64, task.progress().total);
}

#[tokio::test]
async fn empty_expansion_completes_immediately() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new("empty", vec![]))
        .await
        .unwrap();
    assert_eq!(task.progress().total, 0);

    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    let row = s.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.status(), TaskStatus::Completed);
}

#[tokio::test]
async fn schedule_pending_dispatches_by_priority() {
    let s = setup().await;
    let tasks = s.dispatcher.task_manager();

    let mut low = CreateTask::new("low", vec!["a.com".to_string()]);
    low.priority = 1;
    let mut high = CreateTask::new("high", vec!["b.com".to_string()]);
    high.priority = 10;
    let low = tasks.create_task(low).await.unwrap();
    let high = tasks.create_task(high).await.unwrap();

    let dispatched = s.dispatcher.schedule_pending_tasks().await.unwrap();
    assert_eq!(dispatched, 2);

    // Chunks for the high-priority task were published first.
    let chunks = drain_chunks(&s.broker).await;
    assert_eq!(chunks[0].task_id, high.id);
    assert_eq!(chunks[1].task_id, low.id);

    for id in [&low.id, &high.id] {
        assert_eq!(
            s.store.get_task(id).await.unwrap().unwrap().status(),
            TaskStatus::Running
        );
    }
}

async fn publish_result(broker: &WorkBroker, message: &ResultMessage) {
    broker
        .publish(
            "result",
            &serde_json::to_vec(message).unwrap(),
            Some(&message.task_id),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn progress_results_accumulate_and_complete_the_task() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new(
            "p",
            vec!["a.com".to_string(), "b.com".to_string(), "c.com".to_string()],
        ))
        .await
        .unwrap();
    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    for _ in 0..3 {
        publish_result(&s.broker, &ResultMessage::progress(&task.id, 1)).await;
    }
    while s.dispatcher.consume_result_once().await.unwrap() {}

    let row = s.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.progress().completed, 3);
    assert_eq!(row.status(), TaskStatus::Completed);
}

#[tokio::test]
async fn redelivered_progress_clamps_at_total() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new("dup", vec!["a.com".to_string()]))
        .await
        .unwrap();
    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    // The same per-target delta delivered twice (at-least-once).
    publish_result(&s.broker, &ResultMessage::progress(&task.id, 1)).await;
    publish_result(&s.broker, &ResultMessage::progress(&task.id, 1)).await;
    while s.dispatcher.consume_result_once().await.unwrap() {}

    let row = s.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.progress().completed, 1);
    assert_eq!(row.progress().total, 1);
    assert_eq!(row.status(), TaskStatus::Completed);
}

#[tokio::test]
async fn failed_result_marks_task_failed() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new("f", vec!["a.com".to_string()]))
        .await
        .unwrap();
    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    publish_result(
        &s.broker,
        &ResultMessage::failed(&task.id, "handler exploded"),
    )
    .await;
    while s.dispatcher.consume_result_once().await.unwrap() {}

    let row = s.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(row.status(), TaskStatus::Failed);
    assert_eq!(row.error_message.as_deref(), Some("handler exploded"));
}

#[tokio::test]
async fn completed_result_finishes_running_task() {
    let s = setup().await;
    let task = s
        .dispatcher
        .task_manager()
        .create_task(CreateTask::new("c", vec!["a.com".to_string()]))
        .await
        .unwrap();
    s.dispatcher
        .dispatch_task(&task.id, &task.targets())
        .await
        .unwrap();

    publish_result(&s.broker, &ResultMessage::completed(&task.id)).await;
    while s.dispatcher.consume_result_once().await.unwrap() {}

    assert_eq!(
        s.store.get_task(&task.id).await.unwrap().unwrap().status(),
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn poison_results_are_acked_not_redelivered() {
    let s = setup().await;

    // Undecodable body
    s.broker
        .publish("result", b"not json at all", None)
        .await
        .unwrap();
    // Unknown kind
    s.broker
        .publish(
            "result",
            br#"{"task_id":"t-x","status":"resurrected"}"#,
            None,
        )
        .await
        .unwrap();

    while s.dispatcher.consume_result_once().await.unwrap() {}

    // Both were consumed and acked away.
    assert_eq!(s.broker.queue_depth("scan.results").await.unwrap(), 0);
}

#[tokio::test]
async fn progress_for_unknown_task_is_acked() {
    let s = setup().await;
    publish_result(&s.broker, &ResultMessage::progress("ghost", 1)).await;
    while s.dispatcher.consume_result_once().await.unwrap() {}
    assert_eq!(s.broker.queue_depth("scan.results").await.unwrap(), 0);
}
