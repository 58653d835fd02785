//! Worker process supervision
//!
//! A [`Worker`] owns one child process running the bootstrap entry point
//! (see [`crate::child`]) and keeps it alive: whenever the child disconnects
//! while the worker has not been stopped, a fresh process is spawned and
//! wired up identically. The `Worker` value itself is stable across
//! respawns, as are any event subscriptions.
//!
//! The child talks to a proxy of the queue: the supervisor binds an RPC
//! responder for the given api over the child's stdio transport, so every
//! queue call the child makes lands on the real engine in this process.

use crate::error::{Error, Result};
use crate::ipc::rpc::{Rpc, RpcApi, RpcOptions};
use crate::ipc::transport::Transport;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;

/// Lifecycle notifications for host applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The child finished wiring its side and received `init`.
    Ready,
    /// The child's channel terminated. Followed by a respawn unless the
    /// worker was stopped.
    Exited,
}

/// The executable to run as the bootstrap child.
#[derive(Debug, Clone)]
pub struct ChildCommand {
    program: PathBuf,
    args: Vec<String>,
}

impl ChildCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Single-binary deployments: run this executable again as the child.
    /// The re-invoked main is expected to branch into
    /// [`child::run`](crate::child::run).
    pub fn current_exe() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

/// Supervisor for one worker child process.
pub struct Worker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    api: Arc<dyn RpcApi>,
    command: ChildCommand,
    script: String,
    params: Vec<Value>,
    rpc_options: RpcOptions,
    stopped: AtomicBool,
    child: Mutex<Option<Child>>,
    /// Keeps the current transport and responder alive until the next spawn.
    session: Mutex<Option<(Transport, Rpc)>>,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    /// Spawn a child process and proxy `api` to it. The child receives
    /// `init {script, params}` once it reports ready.
    pub fn start(
        api: Arc<dyn RpcApi>,
        command: ChildCommand,
        script: impl Into<String>,
        params: Vec<Value>,
    ) -> Result<Self> {
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(WorkerInner {
            api,
            command,
            script: script.into(),
            params,
            rpc_options: RpcOptions::default(),
            stopped: AtomicBool::new(false),
            child: Mutex::new(None),
            session: Mutex::new(None),
            events,
        });
        WorkerInner::spawn(&inner)?;
        Ok(Self { inner })
    }

    /// Subscribe to lifecycle events. Subscriptions survive respawns.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Wait for the next `Ready`.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.subscribe();
        loop {
            match rx.recv().await {
                Ok(WorkerEvent::Ready) => return Ok(()),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(Error::ChannelClosed),
            }
        }
    }

    /// Stop supervising and kill the current child. Disconnects after this
    /// point do not trigger a respawn.
    pub fn stop(&self) -> &Self {
        self.inner.stopped.store(true, Ordering::SeqCst);
        if let Some(child) = self
            .inner
            .child
            .lock()
            .expect("worker child lock poisoned")
            .as_mut()
        {
            if let Err(error) = child.start_kill() {
                tracing::debug!(%error, "worker child already gone");
            }
        }
        self
    }
}

impl WorkerInner {
    fn spawn(inner: &Arc<WorkerInner>) -> Result<()> {
        if inner.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = Command::new(&inner.command.program)
            .args(&inner.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let transport = Transport::for_child(&mut child)?;
        let rpc = Rpc::new(transport.clone(), inner.api.clone(), inner.rpc_options.clone());

        {
            let transport = transport.clone();
            let inner = inner.clone();
            // The bootstrap emits `ready` once; answer with the init payload.
            transport.clone().on("ready", move |_args| {
                let init = json!({ "script": inner.script, "params": inner.params });
                transport.emit("init", vec![init]);
                let _ = inner.events.send(WorkerEvent::Ready);
            });
        }
        {
            let inner = inner.clone();
            transport.on("exit", move |_args| {
                let _ = inner.events.send(WorkerEvent::Exited);
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                tracing::warn!("worker child disconnected, respawning");
                let inner = inner.clone();
                tokio::spawn(async move {
                    if let Err(error) = WorkerInner::spawn(&inner) {
                        tracing::error!(%error, "failed to respawn worker child");
                    }
                });
            });
        }

        *inner.child.lock().expect("worker child lock poisoned") = Some(child);
        *inner.session.lock().expect("worker session lock poisoned") = Some((transport, rpc));
        Ok(())
    }
}
