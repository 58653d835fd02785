//! Child-side counterpart for the worker integration tests.
//!
//! Spawned by the tests through `CARGO_BIN_EXE_batchq-worker-child`. Keeps
//! stdout clean for the transport protocol and logs to stderr.

use batchq::{child, Job, QueueClient, ScriptRegistry};
use serde_json::Value;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let registry = ScriptRegistry::new()
        .register("relay", |queue: QueueClient, params: Vec<Value>| async move {
            let relay = queue.clone();
            queue
                .on("taskA", move |job: Job| {
                    let relay = relay.clone();
                    async move {
                        if let Err(error) = relay.emit("taskB", job.data).await {
                            tracing::warn!(%error, "relay emit failed");
                        }
                    }
                })
                .await?;

            if params.is_empty() {
                queue.emit("taskError", Value::Null).await?;
            } else {
                queue.emit("taskA", Value::Array(params)).await?;
            }
            Ok(())
        })
        .register("fail", |_queue: QueueClient, _params: Vec<Value>| async move {
            Err("forced failure".into())
        });

    if let Err(error) = child::run(registry).await {
        eprintln!("worker child error: {error}");
        std::process::exit(1);
    }
}
