//! RPC over a transport pair: round trips, error surfacing, timeouts,
//! callback marshaling, and the queue proxied end to end in one process.

use async_trait::async_trait;
use batchq::{
    BoxError, CallbackArgs, Error, NullApi, Queue, QueueClient, QueueOptions, Rpc, RpcApi,
    RpcOptions, Transport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn pair() -> (Transport, Transport) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (ar, aw) = tokio::io::split(a);
    let (br, bw) = tokio::io::split(b);
    (Transport::new(ar, aw), Transport::new(br, bw))
}

struct TestApi;

#[async_trait]
impl RpcApi for TestApi {
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        mut callbacks: CallbackArgs,
    ) -> Result<Value, BoxError> {
        match method {
            "sum" => {
                let a = args.first().and_then(Value::as_i64).unwrap_or(0);
                let b = args.get(1).and_then(Value::as_i64).unwrap_or(0);
                Ok(json!(a + b))
            }
            "boom" => Err("kaboom".into()),
            "slow" => {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!("late"))
            }
            "subscribe" => {
                let callback = callbacks
                    .remove(&0)
                    .ok_or_else(|| -> BoxError { "missing callback".into() })?;
                callback(vec![json!(1)]);
                callback(vec![json!(2)]);
                Ok(Value::Null)
            }
            other => Err(format!("no method {other}").into()),
        }
    }
}

fn bind(caller_timeout: Duration) -> Rpc {
    let (a, b) = pair();
    let _responder = Rpc::new(b, Arc::new(TestApi), RpcOptions::default());
    Rpc::new(a, Arc::new(NullApi), RpcOptions::timeout(caller_timeout))
}

#[tokio::test]
async fn remote_call_round_trips() {
    let caller = bind(Duration::from_secs(5));
    let result = caller
        .invoke("sum", vec![json!(1), json!(2)], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, json!(3));
}

#[tokio::test]
async fn remote_error_surfaces_name_and_message() {
    let caller = bind(Duration::from_secs(5));
    let error = caller
        .invoke("boom", vec![], HashMap::new())
        .await
        .unwrap_err();
    match error {
        Error::Remote(object) => {
            assert_eq!(object.name, "Error");
            assert_eq!(object.message, "kaboom");
        }
        other => panic!("expected a remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn caller_times_out_without_a_response() {
    let caller = bind(Duration::from_millis(50));
    let error = caller
        .invoke("slow", vec![], HashMap::new())
        .await
        .unwrap_err();
    assert!(matches!(error, Error::RpcTimeout(_)));
}

#[tokio::test]
async fn function_arguments_are_marshaled_as_callbacks() {
    let caller = bind(Duration::from_secs(5));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let mut fns: CallbackArgs = HashMap::new();
    fns.insert(0, Arc::new(move |args: Vec<Value>| sink.lock().unwrap().push(args)));

    caller
        .invoke("subscribe", vec![Value::Null], fns)
        .await
        .unwrap();

    // transport order: both callback events precede the response
    let received = received.lock().unwrap().clone();
    assert_eq!(received, vec![vec![json!(1)], vec![json!(2)]]);
}

#[tokio::test]
async fn stray_responses_are_discarded() {
    let (a, b) = pair();
    let _responder = Rpc::new(b.clone(), Arc::new(TestApi), RpcOptions::default());
    let caller = Rpc::new(a, Arc::new(NullApi), RpcOptions::default());

    // late or duplicate delivery: no pending request under this id
    b.emit(
        "response",
        vec![json!({"id": "8b6e4f80-0000-4000-8000-ba9c0ffee000", "result": 42})],
    );

    // the binding keeps working
    let result = caller
        .invoke("sum", vec![json!(20), json!(22)], HashMap::new())
        .await
        .unwrap();
    assert_eq!(result, json!(42));
}

#[tokio::test]
async fn queue_proxied_over_rpc_delivers_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::with_options(
        dir.path(),
        QueueOptions::new().poll_interval(Duration::from_millis(20)),
    )
    .unwrap();

    let (a, b) = pair();
    let _responder = Rpc::new(b, Arc::new(queue.clone()), RpcOptions::default());
    let client = QueueClient::new(Rpc::new(a, Arc::new(NullApi), RpcOptions::default()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .on("remote", move |job: batchq::Job| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(job);
            }
        })
        .await
        .unwrap();

    client.emit("remote", json!({"n": 7})).await.unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no delivery within deadline")
        .unwrap();
    assert_eq!(job.data, json!({"n": 7}));

    // proxied handlers are fire-and-forget: the engine records an immediate
    // success with a null result
    let done = dir.path().join("remote").join("done");
    for _ in 0..250 {
        if std::fs::read_dir(&done).map(|d| d.count()).unwrap_or(0) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let entry = std::fs::read_dir(&done).unwrap().next().unwrap().unwrap();
    let record: Value = serde_json::from_slice(&std::fs::read(entry.path()).unwrap()).unwrap();
    assert_eq!(record["attempts"][0]["status"], json!("success"));
    assert_eq!(record["attempts"][0]["result"], Value::Null);

    queue.stop().await;
}

#[tokio::test]
async fn dead_letters_reach_a_proxied_listener() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Queue::with_options(
        dir.path(),
        QueueOptions::new().poll_interval(Duration::from_millis(20)),
    )
    .unwrap();

    let (a, b) = pair();
    let _responder = Rpc::new(b, Arc::new(queue.clone()), RpcOptions::default());
    let client = QueueClient::new(Rpc::new(a, Arc::new(NullApi), RpcOptions::default()));

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client
        .dead(move |job: batchq::Job| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(job);
            }
        })
        .await
        .unwrap();

    // a local always-failing consumer runs the job into the ground
    queue.on("doomed", |_job: batchq::Job| async move {
        Err::<Value, BoxError>("no".into())
    });
    client
        .emit_opts(
            "doomed",
            json!("payload"),
            batchq::EmitOptions::new().max_attempts(1),
        )
        .await
        .unwrap();

    let job = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("dead letter never arrived")
        .unwrap();
    assert_eq!(job.data, json!("payload"));
    assert_eq!(job.attempts.len(), 1);

    queue.stop().await;
}
