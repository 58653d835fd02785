//! Correlation-based RPC over a [`Transport`]
//!
//! Three wire events carry the whole protocol:
//!
//! - `request {id, method, args, fds}` — `fds` maps argument positions to
//!   callback handles for arguments that are functions on the calling side.
//! - `response {id, result?, error?}` — correlation is purely by id; order
//!   is not guaranteed.
//! - `callback {id, args}` — fire-and-forget invocation of a function the
//!   caller registered; no response travels back for these.
//!
//! Functions are never serialized. A function argument stays owned by the
//! side that passed it; the remote side only holds a generated handle to
//! reach it (see [`QueueClient::on`]).

use crate::error::{BoxError, Error, Result};
use crate::ipc::transport::Transport;
use crate::job::{EmitOptions, ErrorObject, Job};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use uuid::Uuid;

/// A function crossing the process boundary by handle.
pub type CallbackFn = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Argument-position → callback map handed to [`RpcApi::dispatch`]. Invoking
/// an entry sends a `callback` event to the side that owns the function.
pub type CallbackArgs = HashMap<usize, CallbackFn>;

/// The local object whose methods the remote side may invoke.
#[async_trait]
pub trait RpcApi: Send + Sync + 'static {
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        callbacks: CallbackArgs,
    ) -> std::result::Result<Value, BoxError>;
}

/// Api exposing nothing; the child side of the queue protocol only calls out.
pub struct NullApi;

#[async_trait]
impl RpcApi for NullApi {
    async fn dispatch(
        &self,
        method: &str,
        _args: Vec<Value>,
        _callbacks: CallbackArgs,
    ) -> std::result::Result<Value, BoxError> {
        Err(Error::UnknownMethod(method.to_string()).into())
    }
}

#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// Per-call deadline, both for outgoing calls and for serving incoming
    /// ones.
    pub timeout: Duration,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10_000),
        }
    }
}

impl RpcOptions {
    pub fn timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    id: Uuid,
    method: String,
    args: Vec<Value>,
    #[serde(default)]
    fds: HashMap<usize, Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Response {
    id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<ErrorObject>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CallbackCall {
    id: Uuid,
    args: Vec<Value>,
}

/// One side of an RPC binding: caller and responder in one.
#[derive(Clone)]
pub struct Rpc {
    inner: Arc<RpcInner>,
}

struct RpcInner {
    transport: Transport,
    options: RpcOptions,
    /// Outgoing requests awaiting a response, keyed by request id.
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<Value>>>>,
    /// Functions this side passed out by handle.
    callbacks: Mutex<HashMap<Uuid, CallbackFn>>,
    /// Incoming requests currently being served.
    incoming: Mutex<HashSet<Uuid>>,
}

impl Rpc {
    pub fn new(transport: Transport, api: Arc<dyn RpcApi>, options: RpcOptions) -> Self {
        let inner = Arc::new(RpcInner {
            transport: transport.clone(),
            options,
            pending: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashSet::new()),
        });

        {
            let inner = inner.clone();
            transport.on("request", move |args| {
                let Some(request) = decode::<Request>(args, "request") else {
                    return;
                };
                if !inner.incoming.lock().expect("rpc lock poisoned").insert(request.id) {
                    tracing::warn!(id = %request.id, "duplicate request id, ignoring");
                    return;
                }
                let inner = inner.clone();
                let api = api.clone();
                tokio::spawn(serve(inner, api, request));
            });
        }
        {
            let inner = inner.clone();
            transport.on("response", move |args| {
                let Some(response) = decode::<Response>(args, "response") else {
                    return;
                };
                let Some(tx) = inner
                    .pending
                    .lock()
                    .expect("rpc lock poisoned")
                    .remove(&response.id)
                else {
                    // duplicate or late delivery
                    tracing::warn!(id = %response.id, "response for unknown request, discarding");
                    return;
                };
                let outcome = match response.error {
                    Some(error) => Err(Error::Remote(error)),
                    None => Ok(response.result.unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            });
        }
        {
            let inner = inner.clone();
            transport.on("callback", move |args| {
                let Some(call) = decode::<CallbackCall>(args, "callback") else {
                    return;
                };
                let callback = inner
                    .callbacks
                    .lock()
                    .expect("rpc lock poisoned")
                    .get(&call.id)
                    .cloned();
                match callback {
                    Some(callback) => callback(call.args),
                    None => tracing::warn!(id = %call.id, "callback for unknown handle, discarding"),
                }
            });
        }

        Self { inner }
    }

    /// Invoke a remote method by name. `fns` maps argument positions to
    /// local functions the remote side may call back; the corresponding
    /// `args` slots should hold `Value::Null`.
    pub async fn invoke(&self, method: &str, args: Vec<Value>, fns: CallbackArgs) -> Result<Value> {
        let id = Uuid::new_v4();

        let mut fds = HashMap::new();
        {
            let mut table = self.inner.callbacks.lock().expect("rpc lock poisoned");
            for (index, function) in fns {
                let handle = Uuid::new_v4();
                table.insert(handle, function);
                fds.insert(index, handle);
            }
        }

        let request = serde_json::to_value(&Request {
            id,
            method: method.to_string(),
            args,
            fds,
        })?;

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .expect("rpc lock poisoned")
            .insert(id, tx);
        self.inner.transport.emit("request", vec![request]);

        match tokio::time::timeout(self.inner.options.timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_closed)) => Err(Error::ChannelClosed),
            Err(_elapsed) => {
                self.inner
                    .pending
                    .lock()
                    .expect("rpc lock poisoned")
                    .remove(&id);
                Err(Error::RpcTimeout(method.to_string()))
            }
        }
    }
}

/// Serve one incoming request: materialize callback stubs, race the api
/// dispatch against the timeout, reply either way.
async fn serve(inner: Arc<RpcInner>, api: Arc<dyn RpcApi>, request: Request) {
    let Request {
        id,
        method,
        args,
        fds,
    } = request;

    let mut callbacks: CallbackArgs = HashMap::new();
    for (index, handle) in fds {
        let transport = inner.transport.clone();
        let stub: CallbackFn = Arc::new(move |args: Vec<Value>| {
            match serde_json::to_value(&CallbackCall { id: handle, args }) {
                Ok(call) => transport.emit("callback", vec![call]),
                Err(error) => tracing::warn!(%error, "unserializable callback invocation"),
            }
        });
        callbacks.insert(index, stub);
    }

    let outcome = tokio::time::timeout(inner.options.timeout, api.dispatch(&method, args, callbacks)).await;
    let response = match outcome {
        Ok(Ok(result)) => Response {
            id,
            result: Some(result),
            error: None,
        },
        Ok(Err(error)) => Response {
            id,
            result: None,
            error: Some(ErrorObject::from_box(&error)),
        },
        Err(_elapsed) => Response {
            id,
            result: None,
            error: Some(ErrorObject::timeout()),
        },
    };

    inner.incoming.lock().expect("rpc lock poisoned").remove(&id);
    match serde_json::to_value(&response) {
        Ok(value) => inner.transport.emit("response", vec![value]),
        Err(error) => tracing::warn!(%error, id = %id, "unserializable response"),
    }
}

fn decode<T: DeserializeOwned>(args: Vec<Value>, what: &str) -> Option<T> {
    let Some(value) = args.into_iter().next() else {
        tracing::warn!(what, "empty rpc envelope, discarding");
        return None;
    };
    match serde_json::from_value(value) {
        Ok(decoded) => Some(decoded),
        Err(error) => {
            tracing::warn!(what, %error, "malformed rpc envelope, discarding");
            None
        }
    }
}

/// Typed client for the queue api, standing in for a local
/// [`Queue`](crate::queue::Queue) inside a worker process. Every method
/// forwards over the transport through [`Rpc::invoke`].
#[derive(Clone)]
pub struct QueueClient {
    rpc: Rpc,
}

impl QueueClient {
    pub fn new(rpc: Rpc) -> Self {
        Self { rpc }
    }

    /// The underlying binding, for invoking methods beyond the queue surface.
    pub fn rpc(&self) -> &Rpc {
        &self.rpc
    }

    pub async fn emit(&self, topic: &str, data: Value) -> Result<()> {
        self.rpc
            .invoke("emit", vec![Value::String(topic.to_string()), data], HashMap::new())
            .await?;
        Ok(())
    }

    pub async fn emit_opts(&self, topic: &str, data: Value, opts: EmitOptions) -> Result<()> {
        let opts = serde_json::to_value(&opts)?;
        self.rpc
            .invoke(
                "emit",
                vec![Value::String(topic.to_string()), data, opts],
                HashMap::new(),
            )
            .await?;
        Ok(())
    }

    /// Register a consumer on the remote queue.
    ///
    /// Deliveries are fire-and-forget: the engine does not wait for this
    /// handler and records the attempt as an immediate success with a null
    /// result. The handler stays owned by this process; the engine only
    /// holds a callback handle.
    pub async fn on<F, Fut>(&self, topic: &str, handler: F) -> Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: CallbackFn = Arc::new(move |args: Vec<Value>| {
            let Some(value) = args.into_iter().next() else {
                return;
            };
            match serde_json::from_value::<Job>(value) {
                Ok(job) => {
                    tokio::spawn(handler(job));
                }
                Err(error) => tracing::warn!(%error, "discarding malformed job delivery"),
            }
        });

        let mut fns: CallbackArgs = HashMap::new();
        fns.insert(1, callback);
        self.rpc
            .invoke("on", vec![Value::String(topic.to_string()), Value::Null], fns)
            .await?;
        Ok(())
    }

    /// Register a dead-letter listener on the remote queue.
    pub async fn dead<F, Fut>(&self, listener: F) -> Result<()>
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let callback: CallbackFn = Arc::new(move |args: Vec<Value>| {
            let Some(value) = args.into_iter().next() else {
                return;
            };
            match serde_json::from_value::<Job>(value) {
                Ok(job) => {
                    tokio::spawn(listener(job));
                }
                Err(error) => tracing::warn!(%error, "discarding malformed dead letter"),
            }
        });

        let mut fns: CallbackArgs = HashMap::new();
        fns.insert(0, callback);
        self.rpc
            .invoke("dead", vec![Value::Null], fns)
            .await?;
        Ok(())
    }

    pub async fn reset(&self, topic: &str) -> Result<()> {
        self.rpc
            .invoke("reset", vec![Value::String(topic.to_string())], HashMap::new())
            .await?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.rpc.invoke("stop", vec![], HashMap::new()).await?;
        Ok(())
    }
}
