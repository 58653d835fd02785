//! Disk-persisted, at-least-once job queue with a process-based worker pool.
//!
//! Jobs are JSON files moving through four stage directories per topic
//! (`queued`, `inprogress`, `done`, `dead`); the atomic rename from `queued/`
//! to `inprogress/` is the claim. Worker child processes consume jobs through
//! an RPC proxy of the queue and are respawned by their supervisor when they
//! crash.
//!
//! Entry points: [`Queue`] for the engine, [`Worker`] + [`child::run`] for
//! the process pool, [`batch`] to wire both at once.

pub mod batch;
pub mod child;
pub mod error;
pub mod ipc;
pub mod job;
pub mod queue;
pub mod worker;

pub use batch::{batch, BatchOptions};
pub use child::{ScriptFn, ScriptRegistry};
pub use error::{BoxError, Error, Result};
pub use ipc::rpc::{CallbackArgs, CallbackFn, NullApi, QueueClient, Rpc, RpcApi, RpcOptions};
pub use ipc::transport::{Envelope, Transport};
pub use job::{Attempt, AttemptStatus, EmitOptions, ErrorObject, Job, QueueOptions, Stage};
pub use queue::{JobHandler, Queue, TaskResult};
pub use worker::{ChildCommand, Worker, WorkerEvent};
