//! Supervision: ready/init handshake, crash recovery, and the full
//! parent-queue/child-script loop against the helper binary.

use async_trait::async_trait;
use batchq::{
    BoxError, CallbackArgs, ChildCommand, NullApi, Queue, QueueOptions, RpcApi, Worker,
    WorkerEvent,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

fn helper_child() -> ChildCommand {
    ChildCommand::new(env!("CARGO_BIN_EXE_batchq-worker-child"))
}

/// Records every dispatched method; the EventEmitter stand-in for a queue.
#[derive(Default)]
struct RecordingApi {
    calls: Mutex<Vec<(String, Vec<Value>)>>,
}

#[async_trait]
impl RpcApi for RecordingApi {
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        _callbacks: CallbackArgs,
    ) -> Result<Value, BoxError> {
        self.calls.lock().unwrap().push((method.to_string(), args));
        Ok(Value::Null)
    }
}

impl RecordingApi {
    fn snapshot(&self) -> Vec<(String, Vec<Value>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[tokio::test]
async fn worker_reaches_ready_and_forwards_script_calls() {
    let api = Arc::new(RecordingApi::default());
    let worker = Worker::start(
        api.clone(),
        helper_child(),
        "relay",
        vec![json!("foo"), json!("bar")],
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(10), worker.ready())
        .await
        .expect("worker never became ready")
        .unwrap();

    // the relay script registers on(taskA) and emits taskA with its params
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let calls = api.snapshot();
        let registered = calls
            .iter()
            .any(|(method, args)| method == "on" && args.first() == Some(&json!("taskA")));
        let emitted = calls.iter().any(|(method, args)| {
            method == "emit"
                && args.first() == Some(&json!("taskA"))
                && args.get(1) == Some(&json!(["foo", "bar"]))
        });
        if registered && emitted {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("script calls never arrived: {calls:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    worker.stop();
}

#[tokio::test]
async fn crashing_child_is_respawned_until_stopped() {
    let api: Arc<dyn RpcApi> = Arc::new(NullApi);
    let command = ChildCommand::new("sh").arg("-c").arg("sleep 0.05; exit 1");
    let worker = Worker::start(api, command, "unused", vec![]).unwrap();

    let mut events = worker.subscribe();
    let mut exits = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while exits < 3 {
            match events.recv().await {
                Ok(WorkerEvent::Exited) => exits += 1,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("child was not respawned");

    worker.stop();
}

#[tokio::test]
async fn crashed_script_recovers_to_ready_without_host_action() {
    let api: Arc<dyn RpcApi> = Arc::new(NullApi);
    let worker = Worker::start(api, helper_child(), "fail", vec![]).unwrap();

    let mut events = worker.subscribe();
    let mut seen_exit = false;
    tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(WorkerEvent::Exited) => seen_exit = true,
                // a Ready after an Exited is the respawned child
                Ok(WorkerEvent::Ready) if seen_exit => break,
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("respawned child never became ready");

    worker.stop();
}

#[tokio::test]
async fn child_script_drives_the_parent_queue() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::with_options(
        dir.path(),
        QueueOptions::new().poll_interval(Duration::from_millis(25)),
    )
    .unwrap();

    let worker = Worker::start(
        Arc::new(queue.clone()),
        helper_child(),
        "relay",
        vec![json!("foo"), json!("bar")],
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(10), worker.ready())
        .await
        .expect("worker never became ready")
        .unwrap();

    // relay: child emits taskA, consumes it through the proxy, re-emits the
    // payload on taskB; taskB has no consumer and accumulates in queued/
    let task_b = dir.path().join("taskB").join("queued");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    loop {
        if std::fs::read_dir(&task_b).map(|d| d.count()).unwrap_or(0) >= 1 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("taskB was never emitted by the child");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let entry = std::fs::read_dir(&task_b).unwrap().next().unwrap().unwrap();
    let record: Value = serde_json::from_slice(&std::fs::read(entry.path()).unwrap()).unwrap();
    assert_eq!(record["data"], json!(["foo", "bar"]));

    worker.stop();
    queue.stop().await;
}
