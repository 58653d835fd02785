//! Child-side bootstrap
//!
//! Runs inside the worker process. Wires a transport over this process's
//! stdio, announces `ready`, and waits for `init {script, params}` from the
//! supervisor. The named script is resolved in a compiled-in
//! [`ScriptRegistry`] and invoked with a [`QueueClient`] standing in for the
//! queue plus the forwarded params.
//!
//! A script that fails or panics terminates the process with a non-zero
//! status; the supervisor's respawn is the recovery path. Keep stdout clean
//! in child binaries, it carries the protocol; log to stderr.
//!
//! # Example
//!
//! ```rust,no_run
//! use batchq::{child, QueueClient, ScriptRegistry};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> batchq::Result<()> {
//!     let registry = ScriptRegistry::new().register("greet", |queue: QueueClient, params| async move {
//!         queue.emit("greetings", json!({ "params": params })).await?;
//!         Ok(())
//!     });
//!     child::run(registry).await
//! }
//! ```

use crate::error::{BoxError, Result};
use crate::ipc::rpc::{NullApi, QueueClient, Rpc, RpcOptions};
use crate::ipc::transport::Transport;
use futures_util::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

type ScriptFuture = BoxFuture<'static, std::result::Result<(), BoxError>>;

/// A registered user script: invoked with the queue proxy and the params the
/// supervisor forwarded.
pub type ScriptFn = Arc<dyn Fn(QueueClient, Vec<Value>) -> ScriptFuture + Send + Sync>;

/// Named scripts compiled into the worker binary. The `init` message selects
/// one by name.
#[derive(Clone, Default)]
pub struct ScriptRegistry {
    scripts: HashMap<String, ScriptFn>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(mut self, name: impl Into<String>, script: F) -> Self
    where
        F: Fn(QueueClient, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = std::result::Result<(), BoxError>> + Send + 'static,
    {
        self.scripts.insert(
            name.into(),
            Arc::new(move |queue, params| Box::pin(script(queue, params))),
        );
        self
    }

    pub fn get(&self, name: &str) -> Option<ScriptFn> {
        self.scripts.get(name).cloned()
    }
}

#[derive(Debug, Deserialize)]
struct InitMessage {
    script: String,
    #[serde(default)]
    params: Vec<Value>,
}

/// Bootstrap this process as a worker child. Returns once the supervisor
/// side disconnects; script failures exit the process instead of returning.
pub async fn run(registry: ScriptRegistry) -> Result<()> {
    let transport = Transport::over_stdio();
    let rpc = Rpc::new(transport.clone(), Arc::new(NullApi), RpcOptions::default());

    let (exit_tx, exit_rx) = oneshot::channel::<()>();
    {
        let exit_tx = Arc::new(Mutex::new(Some(exit_tx)));
        transport.on("exit", move |_args| {
            if let Some(tx) = exit_tx.lock().expect("exit lock poisoned").take() {
                let _ = tx.send(());
            }
        });
    }

    transport.on("init", move |args| {
        let Some(value) = args.into_iter().next() else {
            tracing::error!("empty init message");
            std::process::exit(1);
        };
        let init: InitMessage = match serde_json::from_value(value) {
            Ok(init) => init,
            Err(error) => {
                tracing::error!(%error, "malformed init message");
                std::process::exit(1);
            }
        };
        let Some(script) = registry.get(&init.script) else {
            tracing::error!(script = %init.script, "unknown script");
            std::process::exit(1);
        };

        tracing::debug!(script = %init.script, "running script");
        let queue = QueueClient::new(rpc.clone());
        let running = tokio::spawn(script(queue, init.params));
        tokio::spawn(async move {
            match running.await {
                // consumers registered by the script keep serving after it
                // returns; only failure tears the process down
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    tracing::error!(%error, "script failed");
                    std::process::exit(1);
                }
                Err(join_error) => {
                    tracing::error!(%join_error, "script panicked");
                    std::process::exit(1);
                }
            }
        });
    });

    transport.emit("ready", vec![]);

    // Parent disconnect closes our stdin; exit cleanly instead of lingering.
    let _ = exit_rx.await;
    Ok(())
}
