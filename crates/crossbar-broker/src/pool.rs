// Bounded worker pool answering requests on the broker's behalf.
//
// Workers run arbitrary blocking user work functions, so they are OS threads
// rather than tasks on the broker runtime. The pool lock is kept separate
// from the core registry lock so a busy worker never stalls dispatch.
use crate::{BrokerError, Result};
use bytes::Bytes;
use crossbar_wire::{Flags, Message};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Worker-pool sizing knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    /// Idle time after which a worker above `min_workers` exits.
    pub idle_linger: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 4,
            idle_linger: Duration::from_secs(30),
        }
    }
}

/// Work function run by a worker; may mutate the cloned request in place to
/// form the reply payload.
pub type WorkFn = Box<dyn FnMut(&mut Message) + Send>;
/// Cleanup run after the reply is sent or discarded.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

pub(crate) struct Job {
    pub msg: Message,
    /// Writer channel of the owning peer; `None` once the peer is gone.
    pub reply_to: Option<mpsc::Sender<Bytes>>,
    pub work: WorkFn,
    pub release: Option<ReleaseFn>,
}

/// Per-cookie task record. One record services one peer; its state machine
/// guarantees at most one reply per request.
pub struct TaskRecord {
    slot: Mutex<TaskSlot>,
}

enum TaskSlot {
    /// No work outstanding.
    Idle,
    /// Queued, not yet claimed by a worker.
    Pending(Box<Job>),
    /// Claimed; the worker holds the job.
    Executing,
    /// Owning peer released; a worker still holding the job must discard
    /// its reply.
    Exited,
}

impl TaskRecord {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(TaskSlot::Idle),
        })
    }

    /// Tear down on peer release. Queued work is discarded immediately; an
    /// executing worker observes `Exited` and drops its reply.
    pub(crate) fn release(&self) {
        let previous = {
            let mut slot = self.slot.lock();
            std::mem::replace(&mut *slot, TaskSlot::Exited)
        };
        if let TaskSlot::Pending(mut job) = previous {
            if let Some(release) = job.release.take() {
                release();
            }
        }
    }

    #[cfg(test)]
    fn is_idle(&self) -> bool {
        matches!(*self.slot.lock(), TaskSlot::Idle)
    }
}

pub struct AsyncPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    state: Mutex<PoolState>,
    work_ready: Condvar,
}

struct PoolState {
    queue: VecDeque<Arc<TaskRecord>>,
    workers: usize,
    idle: usize,
    shutdown: bool,
}

impl AsyncPool {
    pub fn new(config: PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            config,
            state: Mutex::new(PoolState {
                queue: VecDeque::new(),
                workers: 0,
                idle: 0,
                shutdown: false,
            }),
            work_ready: Condvar::new(),
        });
        {
            let mut state = inner.state.lock();
            for _ in 0..config.min_workers {
                spawn_worker(&inner, &mut state);
            }
        }
        Self { inner }
    }

    /// Queue a job on a task record. Rejected unless the record is idle.
    pub(crate) fn execute(&self, task: &Arc<TaskRecord>, job: Job) -> Result<()> {
        {
            let mut slot = task.slot.lock();
            match &*slot {
                TaskSlot::Idle => {}
                TaskSlot::Exited => return Err(BrokerError::PeerGone),
                TaskSlot::Pending(_) | TaskSlot::Executing => return Err(BrokerError::TaskBusy),
            }
            *slot = TaskSlot::Pending(Box::new(job));
        }
        let mut state = self.inner.state.lock();
        if state.shutdown {
            task.release();
            return Err(BrokerError::PoolShutdown);
        }
        state.queue.push_back(Arc::clone(task));
        metrics::gauge!("crossbar_pool_queue_depth").set(state.queue.len() as f64);
        if state.idle > 0 {
            self.inner.work_ready.notify_one();
        } else if state.workers < self.inner.config.max_workers {
            spawn_worker(&self.inner, &mut state);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        state.shutdown = true;
        for task in state.queue.drain(..) {
            task.release();
        }
        self.inner.work_ready.notify_all();
    }
}

fn spawn_worker(inner: &Arc<PoolInner>, state: &mut PoolState) {
    let pool = Arc::clone(inner);
    match std::thread::Builder::new()
        .name("crossbar-pool".into())
        .spawn(move || worker_loop(pool))
    {
        Ok(_) => state.workers += 1,
        Err(err) => tracing::warn!(error = %err, "failed to spawn pool worker"),
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        let task = {
            let mut state = inner.state.lock();
            loop {
                if state.shutdown {
                    state.workers -= 1;
                    return;
                }
                if let Some(task) = state.queue.pop_front() {
                    metrics::gauge!("crossbar_pool_queue_depth").set(state.queue.len() as f64);
                    break task;
                }
                state.idle += 1;
                let timed_out = inner
                    .work_ready
                    .wait_for(&mut state, inner.config.idle_linger)
                    .timed_out();
                state.idle -= 1;
                if timed_out
                    && state.queue.is_empty()
                    && !state.shutdown
                    && state.workers > inner.config.min_workers
                {
                    state.workers -= 1;
                    return;
                }
            }
        };
        run_task(&task);
    }
}

fn run_task(task: &TaskRecord) {
    let mut job = {
        let mut slot = task.slot.lock();
        match std::mem::replace(&mut *slot, TaskSlot::Executing) {
            TaskSlot::Pending(job) => job,
            // Released (or double-queued) between enqueue and claim.
            other => {
                *slot = other;
                return;
            }
        }
    };

    // User work runs outside every lock.
    (job.work)(&mut job.msg);

    let exited = {
        let mut slot = task.slot.lock();
        match *slot {
            TaskSlot::Exited => true,
            _ => {
                *slot = TaskSlot::Idle;
                false
            }
        }
    };
    if !exited && job.msg.wants_reply() {
        if let Some(reply_to) = &job.reply_to {
            let mut reply = job.msg.clone();
            reply.flags.remove(Flags::ASYNC);
            if reply_to.blocking_send(reply.encode()).is_err() {
                tracing::debug!("async reply dropped: peer writer closed");
            }
        }
    }
    if let Some(release) = job.release.take() {
        release();
    }
}
