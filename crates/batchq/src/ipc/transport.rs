//! Named-event channel over a byte stream pair
//!
//! Frames `{channel, args}` envelopes as newline-delimited JSON. The parent
//! side wraps a child's piped stdin/stdout; the child side wraps its own
//! stdio, which is why child processes must keep stdout clean and log to
//! stderr.
//!
//! Once the peer goes away the transport is dead: further sends are logged
//! and swallowed rather than raised, and the termination itself is
//! re-dispatched as local `error`/`exit` events so a supervisor can react.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::Child;
use tokio::sync::mpsc;

/// One message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub args: Vec<Value>,
}

type EventHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

/// Bidirectional named-event emitter over a process boundary.
/// Cheap to clone; all clones share the channel.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<Envelope>,
    dead: AtomicBool,
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
}

impl Transport {
    /// Wire a transport over an arbitrary read/write pair.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            tx,
            dead: AtomicBool::new(false),
            handlers: Mutex::new(HashMap::new()),
        });

        tokio::spawn(write_loop(inner.clone(), rx, writer));
        tokio::spawn(read_loop(inner.clone(), reader));

        Self { inner }
    }

    /// Wire a transport to a spawned child's piped stdio.
    pub fn for_child(child: &mut Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Worker("child stdin is not piped".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Worker("child stdout is not piped".into()))?;
        Ok(Self::new(stdout, stdin))
    }

    /// Wire a transport to this process's own stdio (the child side).
    pub fn over_stdio() -> Self {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }

    /// Send an envelope to the peer. Swallowed with a diagnostic once the
    /// channel is dead.
    pub fn emit(&self, channel: &str, args: Vec<Value>) {
        if self.inner.dead.load(Ordering::SeqCst) {
            tracing::warn!(channel, "channel is dead, dropping message");
            return;
        }
        let envelope = Envelope {
            channel: channel.to_string(),
            args,
        };
        if self.inner.tx.send(envelope).is_err() {
            self.inner.dead.store(true, Ordering::SeqCst);
            tracing::warn!(channel, "writer is gone, dropping message");
        }
    }

    /// Register a handler for incoming envelopes on `channel`. The reserved
    /// channels `error` and `exit` report the peer's termination.
    pub fn on(&self, channel: &str, handler: impl Fn(Vec<Value>) + Send + Sync + 'static) -> &Self {
        self.inner
            .handlers
            .lock()
            .expect("transport handler lock poisoned")
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(handler));
        self
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn dispatch(&self, channel: &str, args: Vec<Value>) {
        let handlers = {
            let table = self.handlers.lock().expect("transport handler lock poisoned");
            table.get(channel).cloned().unwrap_or_default()
        };
        if handlers.is_empty() {
            tracing::trace!(channel, "no handlers for incoming envelope");
            return;
        }
        for handler in &handlers {
            handler(args.clone());
        }
    }
}

async fn write_loop<W>(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Envelope>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let mut line = match serde_json::to_string(&envelope) {
            Ok(line) => line,
            Err(error) => {
                tracing::warn!(%error, channel = %envelope.channel, "unserializable envelope");
                continue;
            }
        };
        line.push('\n');
        if let Err(error) = writer.write_all(line.as_bytes()).await {
            inner.dead.store(true, Ordering::SeqCst);
            tracing::warn!(%error, "channel write failed");
            break;
        }
        if let Err(error) = writer.flush().await {
            inner.dead.store(true, Ordering::SeqCst);
            tracing::warn!(%error, "channel flush failed");
            break;
        }
    }
}

async fn read_loop<R>(inner: Arc<Inner>, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Envelope>(&line) {
                    Ok(envelope) => inner.dispatch(&envelope.channel, envelope.args),
                    Err(error) => tracing::warn!(%error, "discarding malformed envelope"),
                }
            }
            Ok(None) => {
                inner.dead.store(true, Ordering::SeqCst);
                inner.dispatch("exit", vec![Value::Null]);
                break;
            }
            Err(error) => {
                inner.dead.store(true, Ordering::SeqCst);
                inner.dispatch("error", vec![Value::String(error.to_string())]);
                inner.dispatch("exit", vec![Value::Null]);
                break;
            }
        }
    }
}
