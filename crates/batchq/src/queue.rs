//! Disk-based job queue with at-least-once delivery
//!
//! One directory per topic, four stage directories per topic. A job is one
//! JSON file; moving the file between stage directories is the only state
//! transition, and the `queued/` → `inprogress/` rename doubles as the
//! exclusive claim. Any number of consumer loops may race on the same topic,
//! in this process or another one; the rename picks the winner.
//!
//! # Example
//!
//! ```rust,no_run
//! use batchq::{Job, Queue};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> batchq::Result<()> {
//!     let queue = Queue::new("./repo")?;
//!
//!     queue.emit("taskA", json!({"hello": "world"}))?;
//!     queue.on("taskA", |_job: Job| async move {
//!         Ok(json!({"ok": true}))
//!     });
//!     queue.dead(|job: &batchq::Job| println!("gave up on {}", job.id));
//!
//!     queue.stop().await;
//!     Ok(())
//! }
//! ```

use crate::error::{BoxError, Error, Result};
use crate::ipc::rpc::{CallbackArgs, RpcApi};
use crate::job::{Attempt, EmitOptions, ErrorObject, Job, QueueOptions, Stage};
use async_trait::async_trait;
use serde_json::Value;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;

/// Result of one handler invocation. The value lands in the attempt record.
pub type TaskResult = std::result::Result<Value, BoxError>;

/// A continuous consumer for one topic.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn run(&self, job: Job) -> TaskResult;
}

#[async_trait]
impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = TaskResult> + Send + 'static,
{
    async fn run(&self, job: Job) -> TaskResult {
        (self)(job).await
    }
}

type DeadListener = Arc<dyn Fn(&Job) + Send + Sync>;

/// Durable queue engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    options: QueueOptions,
    stopped: AtomicBool,
    /// Count of live polling loops; `stop()` waits for it to hit zero.
    loops: watch::Sender<usize>,
    dead_listeners: Mutex<Vec<DeadListener>>,
}

impl Queue {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_options(root, QueueOptions::default())
    }

    pub fn with_options(root: impl Into<PathBuf>, options: QueueOptions) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let (loops, _) = watch::channel(0usize);
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                options,
                stopped: AtomicBool::new(false),
                loops,
                dead_listeners: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn options(&self) -> &QueueOptions {
        &self.inner.options
    }

    /// Enqueue a job with the engine-wide defaults.
    pub fn emit(&self, topic: &str, data: Value) -> Result<()> {
        self.emit_opts(topic, data, EmitOptions::default())
    }

    /// Enqueue a job, overriding timeout and/or retry budget for this job only.
    pub fn emit_opts(&self, topic: &str, data: Value, opts: EmitOptions) -> Result<()> {
        let timeout = opts
            .task_timeout
            .map(Duration::from_millis)
            .unwrap_or(self.inner.options.task_timeout);
        let max_attempts = opts.max_attempts.unwrap_or(self.inner.options.max_attempts);
        let job = Job::new(data, timeout, max_attempts);
        self.inner.write(topic, Stage::Queued, &job)
    }

    /// Register a continuous consumer for `topic`.
    ///
    /// Spawns an independent polling loop. Registering several consumers for
    /// the same topic makes them compete for the queued listing, which is the
    /// load-balancing mechanism across workers.
    pub fn on<H: JobHandler>(&self, topic: &str, handler: H) -> &Self {
        let inner = self.inner.clone();
        let topic = topic.to_string();
        let handler: Arc<dyn JobHandler> = Arc::new(handler);

        inner.loops.send_modify(|n| *n += 1);
        tokio::spawn(async move {
            loop {
                if inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(error) = poll_once(&inner, &topic, &handler).await {
                    tracing::error!(topic = %topic, %error, "poll cycle failed");
                }
                tokio::time::sleep(inner.options.poll_interval).await;
            }
            inner.loops.send_modify(|n| *n -= 1);
        });
        self
    }

    /// Register a dead-letter listener, invoked synchronously in registration
    /// order whenever any consumer loop moves a job to `dead/`.
    pub fn dead(&self, listener: impl Fn(&Job) + Send + Sync + 'static) -> &Self {
        self.inner
            .dead_listeners
            .lock()
            .expect("dead listener lock poisoned")
            .push(Arc::new(listener));
        self
    }

    /// Delete the whole topic tree. Idempotent; active consumers are not
    /// signaled and simply see an empty listing afterwards.
    pub fn reset(&self, topic: &str) -> Result<()> {
        match fs::remove_dir_all(self.inner.topic_dir(topic)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Graceful shutdown: no new claims, in-flight handlers finish. Resolves
    /// once every polling loop has deregistered.
    pub async fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let mut rx = self.inner.loops.subscribe();
        while *rx.borrow_and_update() != 0 {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

async fn poll_once(inner: &Arc<Inner>, topic: &str, handler: &Arc<dyn JobHandler>) -> Result<()> {
    let Some(file_name) = inner.oldest_queued(topic) else {
        return Ok(());
    };
    // The claim. Losing the rename race to another consumer is not an error.
    if !inner.claim(topic, &file_name)? {
        return Ok(());
    }

    let mut job = inner.read(topic, Stage::Inprogress, &file_name)?;
    let mut attempt = Attempt::new();

    let task = {
        let handler = handler.clone();
        let job = job.clone();
        tokio::spawn(async move { handler.run(job).await })
    };

    // Race the handler against the job's own deadline. On timeout the task
    // keeps running detached; its eventual result is discarded.
    let outcome = match tokio::time::timeout(job.timeout(), task).await {
        Ok(Ok(Ok(result))) => Ok(result),
        Ok(Ok(Err(error))) => Err(ErrorObject::from_box(&error)),
        Ok(Err(join_error)) => Err(ErrorObject::new("Error", join_error.to_string())),
        Err(_elapsed) => Err(ErrorObject::timeout()),
    };

    match outcome {
        Ok(result) => {
            attempt.succeed(result);
            job.attempts.push(attempt);
            inner.write(topic, Stage::Done, &job)?;
            inner.remove(topic, Stage::Inprogress, &job)?;
        }
        Err(error) => {
            attempt.fail(error);
            job.attempts.push(attempt);
            let stage = if job.attempts.len() as u32 >= job.max_attempts {
                Stage::Dead
            } else {
                Stage::Queued
            };
            inner.write(topic, stage, &job)?;
            inner.remove(topic, Stage::Inprogress, &job)?;
            if stage == Stage::Dead {
                let listeners = inner
                    .dead_listeners
                    .lock()
                    .expect("dead listener lock poisoned")
                    .clone();
                for listener in &listeners {
                    listener(&job);
                }
            }
        }
    }
    Ok(())
}

impl Inner {
    fn topic_dir(&self, topic: &str) -> PathBuf {
        self.root.join(topic)
    }

    fn stage_dir(&self, topic: &str, stage: Stage) -> PathBuf {
        self.topic_dir(topic).join(stage.dir())
    }

    fn ensure_topic(&self, topic: &str) -> std::io::Result<()> {
        for stage in Stage::ALL {
            fs::create_dir_all(self.stage_dir(topic, stage))?;
        }
        Ok(())
    }

    fn write(&self, topic: &str, stage: Stage, job: &Job) -> Result<()> {
        self.ensure_topic(topic)?;
        let path = self.stage_dir(topic, stage).join(job.file_name());
        fs::write(path, serde_json::to_vec_pretty(job)?)?;
        Ok(())
    }

    fn read(&self, topic: &str, stage: Stage, file_name: &str) -> Result<Job> {
        let path = self.stage_dir(topic, stage).join(file_name);
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }

    fn remove(&self, topic: &str, stage: Stage, job: &Job) -> Result<()> {
        fs::remove_file(self.stage_dir(topic, stage).join(job.file_name()))?;
        Ok(())
    }

    /// Atomically move a job from `queued/` to `inprogress/`. `Ok(false)`
    /// means another consumer claimed it first.
    fn claim(&self, topic: &str, file_name: &str) -> Result<bool> {
        let from = self.stage_dir(topic, Stage::Queued).join(file_name);
        let to = self.stage_dir(topic, Stage::Inprogress).join(file_name);
        match fs::rename(from, to) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Oldest entry of `queued/` by last-modified time, the delivery order.
    /// Any listing error reads as an empty queue.
    fn oldest_queued(&self, topic: &str) -> Option<String> {
        let dir = self.stage_dir(topic, Stage::Queued);
        let entries = fs::read_dir(dir).ok()?;

        let mut files: Vec<(SystemTime, String)> = entries
            .filter_map(|entry| {
                let entry = entry.ok()?;
                let modified = entry.metadata().ok()?.modified().ok()?;
                Some((modified, entry.file_name().to_string_lossy().into_owned()))
            })
            .collect();
        files.sort();
        files.into_iter().next().map(|(_, name)| name)
    }
}

/// The queue as a remote api, so a [`Worker`](crate::worker::Worker) can hand
/// a child process a proxy of it. Method names mirror the local surface;
/// handler arguments arrive as callback handles and are invoked
/// fire-and-forget, so jobs consumed through a proxy settle with a null
/// result on the engine side.
#[async_trait]
impl RpcApi for Queue {
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        mut callbacks: CallbackArgs,
    ) -> std::result::Result<Value, BoxError> {
        match method {
            "emit" => {
                let topic = string_arg(&args, 0)?;
                let data = args.get(1).cloned().unwrap_or(Value::Null);
                let opts = match args.get(2) {
                    Some(value) if !value.is_null() => serde_json::from_value(value.clone())?,
                    _ => EmitOptions::default(),
                };
                self.emit_opts(&topic, data, opts)?;
                Ok(Value::Null)
            }
            "on" => {
                let topic = string_arg(&args, 0)?;
                let callback = callbacks
                    .remove(&1)
                    .ok_or_else(|| Error::Worker("on requires a handler callback".into()))?;
                self.on(&topic, move |job: Job| {
                    let callback = callback.clone();
                    async move {
                        callback(vec![serde_json::to_value(&job)?]);
                        Ok(Value::Null)
                    }
                });
                Ok(Value::Null)
            }
            "dead" => {
                let callback = callbacks
                    .remove(&0)
                    .ok_or_else(|| Error::Worker("dead requires a listener callback".into()))?;
                self.dead(move |job: &Job| match serde_json::to_value(job) {
                    Ok(value) => callback(vec![value]),
                    Err(error) => tracing::warn!(%error, "dropping dead-letter notification"),
                });
                Ok(Value::Null)
            }
            "reset" => {
                let topic = string_arg(&args, 0)?;
                self.reset(&topic)?;
                Ok(Value::Null)
            }
            "stop" => {
                self.stop().await;
                Ok(Value::Null)
            }
            other => Err(Error::UnknownMethod(other.to_string()).into()),
        }
    }
}

fn string_arg(args: &[Value], index: usize) -> std::result::Result<String, BoxError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| Error::Worker(format!("argument {index} must be a string")).into())
}
