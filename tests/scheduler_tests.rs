//! Scheduler behaviour over real WebSocket connections, driven by scripted
//! fake executors.


use std::time::Duration;

use nodeflow::error::Error;
use nodeflow::protocol::{Message, TaskMessage, TaskResult, UpdateStatus};
use nodeflow::scheduler::{Finished, Task, TaskStatus};
use serde_json::json;
use test_harness::{assert_eventually, TestScheduler};
use uuid::Uuid;

fn expect_task(message: Option<Message>) -> TaskMessage {
    match message {
        Some(Message::Task(task)) => task,
        other => panic!("expected task, got {:?}", other),
    }
}

#[tokio::test]
async fn test_task_waits_for_registration() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;

    assert_eventually(
        || {
            let ts = &ts;
            async move { ts.scheduler.all_executors().len() == 1 }
        },
        Duration::from_secs(5),
        "connection should appear in the roster",
    )
    .await;

    let task_id = ts.scheduler.add_task(Task::new("flows/a.yaml", "main"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        ts.scheduler.get_task(&task_id).unwrap().status,
        TaskStatus::Pending,
        "unregistered executors must not receive work"
    );

    fake.register(1).await;
    let task = expect_task(fake.recv().await);
    assert_eq!(task.task_id, task_id);
    assert_eq!(task.callable, "main");

    let stored = ts.scheduler.get_task(&task_id).unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert!(stored.executor_id.is_some());

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_priority_order_with_fifo_ties() {
    let ts = TestScheduler::start().await;

    let low = ts.scheduler.add_task(Task::new("a.yaml", "low").with_priority(1));
    let high = ts.scheduler.add_task(Task::new("a.yaml", "high").with_priority(5));
    let mid_first = ts.scheduler.add_task(Task::new("a.yaml", "mid1").with_priority(3));
    let mid_second = ts.scheduler.add_task(Task::new("a.yaml", "mid2").with_priority(3));

    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    let mut order = Vec::new();
    for _ in 0..4 {
        let task = expect_task(fake.recv().await);
        order.push(task.task_id);
        fake.send(&Message::TaskResult(TaskResult::completed(task.task_id, json!([]))))
            .await;
    }
    assert_eq!(order, vec![high, mid_first, mid_second, low]);

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_max_tasks_is_never_exceeded() {
    let ts = TestScheduler::start().await;
    for i in 0..5 {
        ts.scheduler.add_task(Task::new("a.yaml", format!("t{i}")));
    }

    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(2).await;

    let first = expect_task(fake.recv().await);
    let _second = expect_task(fake.recv().await);
    assert!(
        fake.recv_timeout(Duration::from_millis(300)).await.is_err(),
        "a third task was sent to an executor with max_tasks = 2"
    );

    let info = ts.scheduler.all_executors().pop().unwrap();
    assert_eq!(info.max_tasks, 2);
    assert_eq!(info.current_tasks, 2);

    fake.send(&Message::TaskResult(TaskResult::completed(first.task_id, json!([1]))))
        .await;
    let _third = expect_task(fake.recv().await);

    let info = ts.scheduler.all_executors().pop().unwrap();
    assert!(info.current_tasks <= info.max_tasks);

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_run_task_resolves_with_fake_result() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    let scheduler = ts.scheduler.clone();
    let run = tokio::spawn(async move {
        scheduler
            .submit("a.yaml", "main", Default::default(), Default::default(), false)
            .await
    });

    let task = expect_task(fake.recv().await);
    fake.send(&Message::UpdateStatus(UpdateStatus {
        task_id: task.task_id,
        status: TaskStatus::Running,
    }))
    .await;
    fake.send(&Message::TaskResult(TaskResult::completed(task.task_id, json!(["ok"]))))
        .await;

    let value = run.await.unwrap().unwrap();
    assert_eq!(value, json!(["ok"]));

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_failed_result_surfaces_error() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    let scheduler = ts.scheduler.clone();
    let run = tokio::spawn(async move { scheduler.run_task(Task::new("a.yaml", "main")).await });

    let task = expect_task(fake.recv().await);
    fake.send(&Message::TaskResult(TaskResult::failed(task.task_id, "boom")))
        .await;

    match run.await.unwrap() {
        Err(Error::TaskFailed { task_id, error }) => {
            assert_eq!(task_id, task.task_id);
            assert_eq!(error, "boom");
        }
        other => panic!("expected TaskFailed, got {:?}", other),
    }

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_wait_timeout_leaves_task_running() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    let task_id = ts.scheduler.add_task(Task::new("a.yaml", "slow"));
    expect_task(fake.recv().await);

    let result = ts
        .scheduler
        .wait_until_finished(Some(task_id), Some(Duration::from_millis(100)))
        .await;
    assert!(matches!(result, Err(Error::WaitTimeout)));
    assert_eq!(
        ts.scheduler.get_task(&task_id).unwrap().status,
        TaskStatus::Running
    );

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_disconnect_leaves_task_running() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    let task_id = ts.scheduler.add_task(Task::new("a.yaml", "main"));
    expect_task(fake.recv().await);
    fake.close().await;

    assert_eventually(
        || {
            let ts = &ts;
            async move { ts.active_executors() == 0 }
        },
        Duration::from_secs(5),
        "executor should go inactive after disconnecting",
    )
    .await;

    let task = ts.scheduler.get_task(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.executor_id.is_some());

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_unknown_results_are_ignored() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    fake.send(&Message::TaskResult(TaskResult::completed(Uuid::new_v4(), json!([]))))
        .await;

    // The connection stays usable and the next task is still delivered.
    let task_id = ts.scheduler.add_task(Task::new("a.yaml", "main"));
    let task = expect_task(fake.recv().await);
    assert_eq!(task.task_id, task_id);
    assert_eq!(ts.scheduler.all_tasks().len(), 1);

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_undecodable_frame_closes_connection() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    fake.send_raw("{not json").await;
    assert!(fake.recv().await.is_none());

    assert_eventually(
        || {
            let ts = &ts;
            async move { ts.active_executors() == 0 }
        },
        Duration::from_secs(5),
        "executor should go inactive",
    )
    .await;

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_cancel_only_affects_pending_tasks() {
    let ts = TestScheduler::start().await;

    let pending = ts.scheduler.add_task(Task::new("a.yaml", "later"));
    assert!(ts.scheduler.cancel_task(&pending).unwrap());
    assert_eq!(
        ts.scheduler.get_task(&pending).unwrap().status,
        TaskStatus::Cancelled
    );

    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;
    let running = ts.scheduler.add_task(Task::new("a.yaml", "now"));
    let task = expect_task(fake.recv().await);
    assert_eq!(task.task_id, running, "cancelled task must not be assigned");

    assert!(!ts.scheduler.cancel_task(&running).unwrap());
    assert!(matches!(
        ts.scheduler.cancel_task(&Uuid::new_v4()),
        Err(Error::TaskNotFound(_))
    ));

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_wait_for_all_tasks() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    for i in 0..3 {
        ts.scheduler.add_task(Task::new("a.yaml", format!("t{i}")));
    }

    let scheduler = ts.scheduler.clone();
    let waiter = tokio::spawn(async move {
        scheduler
            .wait_until_finished(None, Some(Duration::from_secs(5)))
            .await
    });

    for _ in 0..3 {
        let task = expect_task(fake.recv().await);
        fake.send(&Message::TaskResult(TaskResult::completed(task.task_id, json!([]))))
            .await;
    }

    match waiter.await.unwrap().unwrap() {
        Finished::All(tasks) => {
            assert_eq!(tasks.len(), 3);
            assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));
        }
        other => panic!("expected all tasks, got {:?}", other),
    }

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_stop_sends_kill_and_is_idempotent() {
    let ts = TestScheduler::start().await;
    let mut fake = ts.fake_executor("fake-1").await;
    fake.register(1).await;

    ts.scheduler.stop().await;
    assert!(matches!(fake.recv().await, Some(Message::Kill)));
    assert!(fake.recv().await.is_none());
    assert!(ts.scheduler.all_executors().is_empty());

    ts.scheduler.stop().await;
}

#[tokio::test]
async fn test_start_twice_fails() {
    let ts = TestScheduler::start().await;
    assert!(matches!(ts.scheduler.start().await, Err(Error::AlreadyStarted)));
    ts.scheduler.stop().await;
}
