//! Driver wiring one queue to a pool of worker processes.

use crate::error::Result;
use crate::ipc::rpc::RpcApi;
use crate::job::QueueOptions;
use crate::queue::Queue;
use crate::worker::{ChildCommand, Worker};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Root of the persistence tree.
    pub base: PathBuf,
    pub num_workers: usize,
    pub queue: QueueOptions,
}

impl BatchOptions {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            num_workers: 1,
            queue: QueueOptions::default(),
        }
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn queue(mut self, options: QueueOptions) -> Self {
        self.queue = options;
        self
    }
}

/// Build one queue and `num_workers` supervisors all running `script`.
/// Every worker's child holds a proxy of the same queue, so the workers
/// compete for the same topics.
pub fn batch(
    options: BatchOptions,
    command: ChildCommand,
    script: &str,
    params: Vec<Value>,
) -> Result<(Queue, Vec<Worker>)> {
    tracing::debug!(
        base = %options.base.display(),
        workers = options.num_workers,
        script,
        "initializing batch"
    );

    let queue = Queue::with_options(&options.base, options.queue.clone())?;
    let api: Arc<dyn RpcApi> = Arc::new(queue.clone());

    let mut workers = Vec::with_capacity(options.num_workers);
    for _ in 0..options.num_workers {
        workers.push(Worker::start(
            api.clone(),
            command.clone(),
            script,
            params.clone(),
        )?);
    }

    Ok((queue, workers))
}
