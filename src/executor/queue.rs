use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::{FuncId, LocalData};
use crate::error::ConfigError;
use crate::sync::{Checker, SubscriptionId, lock};

use super::panic_message;

/// A job run by a [`TaskQueueExecutor`]. It gets the worker's local value
/// and the executor's cancel flag, and nothing else.
pub type QueueFunc = Arc<dyn Fn(&mut LocalData, &Checker) -> anyhow::Result<()> + Send + Sync>;

/// Sequence number of a posted job. Ids start at 1 and increase with every
/// post.
pub type JobId = usize;

#[derive(Clone, Default)]
pub struct QueueFuncRegistry {
    funcs: HashMap<FuncId, QueueFunc>,
}

impl QueueFuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: FuncId, func: F) -> &mut Self
    where
        F: Fn(&mut LocalData, &Checker) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.funcs.insert(id, Arc::new(func));
        self
    }

    pub fn get(&self, id: FuncId) -> Result<&QueueFunc, ConfigError> {
        self.funcs.get(&id).ok_or(ConfigError::UnknownFunction(id))
    }
}

impl std::fmt::Debug for QueueFuncRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.funcs.keys()).finish()
    }
}

struct State {
    queue: VecDeque<(JobId, QueueFunc)>,
    running: Option<JobId>,
    next_id: JobId,
    failures: Vec<(JobId, anyhow::Error)>,
    exit: bool,
}

impl State {
    fn remaining(&self) -> usize {
        self.queue.len() + usize::from(self.running.is_some())
    }

    /// Whether `id` is still queued or running. Jobs leave the queue in id
    /// order, so only the front and the running job need checking.
    fn is_pending(&self, id: JobId) -> bool {
        self.running.is_some_and(|r| r <= id) || self.queue.front().is_some_and(|(q, _)| *q <= id)
    }
}

struct Shared {
    state: Mutex<State>,
    work: Condvar,
    done: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }
}

/// A single worker thread draining a FIFO of posted jobs.
///
/// Jobs are posted by function id and run one after another. When the cancel
/// flag is set, every job still waiting in the queue is dropped; the job
/// already running is expected to notice the flag itself.
///
/// Dropping the executor waits for the queue to drain.
pub struct TaskQueueExecutor {
    shared: Arc<Shared>,
    registry: Arc<QueueFuncRegistry>,
    cancel: Checker,
    subscription: SubscriptionId,
    thread: Option<JoinHandle<()>>,
}

impl TaskQueueExecutor {
    pub fn new(registry: Arc<QueueFuncRegistry>, cancel: Checker) -> Self {
        Self::with_local(registry, cancel, || ())
    }

    /// Like [`new`](Self::new), running `init` on the worker thread to build
    /// the local value handed to every job.
    pub fn with_local<T, F>(registry: Arc<QueueFuncRegistry>, cancel: Checker, init: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                running: None,
                next_id: 1,
                failures: Vec::new(),
                exit: false,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        });

        let subscription = {
            let shared = shared.clone();
            cancel.on_cancelled(move || {
                let _state = shared.lock();
                shared.work.notify_all();
            })
        };

        let thread = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            std::thread::Builder::new()
                .name(String::from("taskflow-queue"))
                .spawn(move || run(&shared, &cancel, LocalData::new(init())))
        };

        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::error!("failed to spawn queue thread: {e}");
                None
            }
        };

        Self {
            shared,
            registry,
            cancel,
            subscription,
            thread,
        }
    }

    /// Appends a job to the queue and returns its id.
    pub fn post(&self, func: FuncId) -> Result<JobId, ConfigError> {
        let func = self.registry.get(func)?.clone();

        let mut state = self.shared.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push_back((id, func));
        drop(state);

        self.shared.work.notify_one();
        Ok(id)
    }

    /// Drops every job that has not started yet.
    pub fn clear_queue(&self) {
        self.shared.lock().queue.clear();
        self.shared.done.notify_all();
    }

    /// Drops the jobs with ids `>= id` that have not started yet.
    pub fn clear_queue_from(&self, id: JobId) {
        self.shared.lock().queue.retain(|(q, _)| *q < id);
        self.shared.done.notify_all();
    }

    /// Number of jobs queued or running.
    pub fn remaining(&self) -> usize {
        self.shared.lock().remaining()
    }

    /// Blocks until the queue is empty and no job is running.
    pub fn wait(&self) {
        let state = self.shared.lock();
        let _state = self
            .shared
            .done
            .wait_while(state, |s| s.remaining() > 0)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Waits at most `timeout` and returns how many jobs are still left.
    pub fn wait_timeout(&self, timeout: Duration) -> usize {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .done
            .wait_timeout_while(state, timeout, |s| s.remaining() > 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.remaining()
    }

    /// Blocks until job `id` and every job posted before it have finished or
    /// were cleared.
    pub fn wait_for(&self, id: JobId) {
        let state = self.shared.lock();
        let _state = self
            .shared
            .done
            .wait_while(state, |s| s.is_pending(id))
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Bounded [`wait_for`](Self::wait_for). Returns `false` if the job was
    /// still pending when the timeout expired.
    pub fn wait_for_timeout(&self, id: JobId, timeout: Duration) -> bool {
        let state = self.shared.lock();
        let (state, _) = self
            .shared
            .done
            .wait_timeout_while(state, timeout, |s| s.is_pending(id))
            .unwrap_or_else(PoisonError::into_inner);
        !state.is_pending(id)
    }

    /// Errors returned by jobs since the last call, with the ids of the jobs
    /// that raised them.
    pub fn take_failures(&self) -> Vec<(JobId, anyhow::Error)> {
        std::mem::take(&mut self.shared.lock().failures)
    }
}

impl Drop for TaskQueueExecutor {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.wait();
        }

        self.shared.lock().exit = true;
        self.shared.work.notify_all();
        self.cancel.unsubscribe(self.subscription);

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("queue thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for TaskQueueExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskQueueExecutor")
            .field("remaining", &self.remaining())
            .finish()
    }
}

fn run(shared: &Shared, cancel: &Checker, mut local: LocalData) {
    loop {
        let (id, func) = {
            let mut state = shared.lock();
            loop {
                if state.exit {
                    return;
                }
                if cancel.is_cancelled() && !state.queue.is_empty() {
                    tracing::warn!(dropped = state.queue.len(), "queue cancelled");
                    state.queue.clear();
                    shared.done.notify_all();
                }
                if let Some((id, func)) = state.queue.pop_front() {
                    state.running = Some(id);
                    break (id, func);
                }
                state = shared.work.wait(state).unwrap_or_else(PoisonError::into_inner);
            }
        };

        let span = tracing::span!(tracing::Level::DEBUG, "job", id);
        let _enter = span.enter();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| func(&mut local, cancel)))
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic))));

        let mut state = shared.lock();
        state.running = None;
        if let Err(e) = result {
            tracing::error!("{e}");
            state.failures.push((id, e));
        }
        drop(state);
        shared.done.notify_all();
    }
}
