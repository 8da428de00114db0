use std::sync::Arc;

use tracing::Level;

use crate::core::{Dynamic, LocalData, ResourceType};
use crate::func::TaskState;
use crate::sync::ThreadNotifier;

use super::worker::{Job, Worker};
use super::{Outcome, StartParam, TaskExecutor, invoke};

/// Runs tasks on a single dedicated thread.
///
/// The thread owns a [`LocalData`] value that persists across every task it
/// runs. It is created on the worker thread itself by the closure given to
/// [`with_local`](Self::with_local).
pub struct ThreadedTaskExecutor {
    resource_type: ResourceType,
    shared: Dynamic,
    worker: Worker,
}

impl ThreadedTaskExecutor {
    pub fn new(resource_type: ResourceType) -> Self {
        Self::with_local(resource_type, || ())
    }

    /// Spawns the worker and runs `init` on it to build the thread-local
    /// value handed to stateful task functions.
    pub fn with_local<T, F>(resource_type: ResourceType, init: F) -> Self
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let worker = Worker::spawn(format!("taskflow-worker-{resource_type}"), move || {
            let mut local = LocalData::new(init());
            move |job: Job| execute(job, &mut local)
        });

        Self {
            resource_type,
            shared: Dynamic::new(()),
            worker,
        }
    }

    /// Read-only value passed to stateful functions. Applies to tasks started
    /// after the call.
    pub fn set_shared_data(&mut self, shared: Dynamic) {
        self.shared = shared;
    }

    pub fn with_shared_data(mut self, shared: Dynamic) -> Self {
        self.set_shared_data(shared);
        self
    }
}

fn execute(job: Job, local: &mut LocalData) -> Outcome {
    let span = tracing::span!(Level::DEBUG, "task", id = job.id, func = job.task.func_id);
    let _enter = span.enter();

    let mut state = TaskState::new(local, &job.shared);
    let outcome = invoke(
        job.id,
        &job.task,
        &job.registry,
        &job.inputs,
        &mut state,
        &job.cancel,
    );

    match &outcome {
        Ok(_) => tracing::debug!("task finished"),
        Err(e) => tracing::error!("{e}"),
    }
    outcome
}

impl TaskExecutor for ThreadedTaskExecutor {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    fn start(&mut self, param: StartParam) {
        self.worker.submit(param, self.shared.clone());
    }

    fn propagate_cb(&mut self) -> Option<Outcome> {
        self.worker.poll()
    }

    fn set_task_completion_notifier(&mut self, notifier: Arc<ThreadNotifier>) {
        self.worker.set_completion_notifier(notifier);
    }

    fn is_busy(&self) -> bool {
        self.worker.is_busy()
    }
}

impl std::fmt::Debug for ThreadedTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedTaskExecutor")
            .field("resource_type", &self.resource_type)
            .field("busy", &self.worker.is_busy())
            .finish()
    }
}
