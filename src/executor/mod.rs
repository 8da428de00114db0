//! Executors run one task at a time on behalf of a scheduler.
//!
//! An executor never blocks the scheduler: [`TaskExecutor::start`] hands the
//! task off and returns, and [`TaskExecutor::propagate_cb`] is a
//! non-blocking poll that yields the outcome once the task is done. All
//! bookkeeping therefore stays on the scheduler's thread while the work
//! itself happens elsewhere: on a dedicated thread
//! ([`ThreadedTaskExecutor`]) or in another process
//! ([`RemoteTaskExecutor`]).

pub mod queue;
#[cfg(feature = "remote")]
pub mod remote;
#[cfg(feature = "remote")]
pub mod service;
pub mod threaded;
mod worker;

use std::sync::Arc;

use crate::core::{Dynamic, ResourceType, Task, TaskId};
use crate::error::EngineError;
use crate::func::{TaskFuncRegistry, TaskState};
use crate::sync::{Checker, ThreadNotifier};

pub use queue::{QueueFunc, QueueFuncRegistry, TaskQueueExecutor};
#[cfg(feature = "remote")]
pub use remote::RemoteTaskExecutor;
#[cfg(feature = "remote")]
pub use service::{RemoteExecutorService, ServiceHandle};
pub use threaded::ThreadedTaskExecutor;

/// Output slots of a finished task, or the reason it did not finish.
///
/// A slot left `None` means the function did not produce that output, which
/// is what a cancelled task does.
pub type Outcome = Result<Vec<Option<Dynamic>>, EngineError>;

/// Everything an executor needs to run one task.
pub struct StartParam {
    pub id: TaskId,
    pub task: Task,
    pub inputs: Vec<Dynamic>,
    pub registry: Arc<TaskFuncRegistry>,
    pub cancel: Checker,
    /// Invoked on the polling thread when the outcome is collected.
    pub on_done: Option<Box<dyn FnOnce() + Send>>,
}

impl StartParam {
    pub fn new(id: TaskId, task: Task, inputs: Vec<Dynamic>, registry: Arc<TaskFuncRegistry>) -> Self {
        Self {
            id,
            task,
            inputs,
            registry,
            cancel: Checker::never(),
            on_done: None,
        }
    }

    pub fn with_cancel(mut self, cancel: Checker) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn on_done<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_done = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for StartParam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartParam")
            .field("id", &self.id)
            .field("task", &self.task)
            .field("inputs", &self.inputs)
            .finish_non_exhaustive()
    }
}

pub trait TaskExecutor: Send {
    /// The pool this executor belongs to.
    fn resource_type(&self) -> ResourceType;

    /// Begins running a task without blocking. Must only be called while the
    /// executor is idle.
    fn start(&mut self, param: StartParam);

    /// If the task started last has finished, invokes its `on_done` callback
    /// and returns its outcome. Returns `None` while it is still running or
    /// when nothing was started.
    fn propagate_cb(&mut self) -> Option<Outcome>;

    /// Signal to raise every time a task finishes, shared by all executors of
    /// one scheduler.
    fn set_task_completion_notifier(&mut self, notifier: Arc<ThreadNotifier>);

    fn is_busy(&self) -> bool;
}

impl TaskExecutor for Box<dyn TaskExecutor> {
    fn resource_type(&self) -> ResourceType {
        (**self).resource_type()
    }

    fn start(&mut self, param: StartParam) {
        (**self).start(param)
    }

    fn propagate_cb(&mut self) -> Option<Outcome> {
        (**self).propagate_cb()
    }

    fn set_task_completion_notifier(&mut self, notifier: Arc<ThreadNotifier>) {
        (**self).set_task_completion_notifier(notifier)
    }

    fn is_busy(&self) -> bool {
        (**self).is_busy()
    }
}

/// Looks up and calls the function behind `task`, turning both returned
/// errors and panics into [`EngineError::Task`].
pub(crate) fn invoke(
    id: TaskId,
    task: &Task,
    registry: &TaskFuncRegistry,
    inputs: &[Dynamic],
    state: &mut TaskState<'_>,
    cancel: &Checker,
) -> Outcome {
    let func = registry.get(task.func_id)?;
    let mut outputs = vec![None; task.output_count];

    // The function only sees its own outputs and borrowed state, so a panic
    // halfway through leaves nothing shared in a broken state.
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        func.call(&mut outputs, inputs, state, cancel)
    }));

    let source = match result {
        Ok(Ok(())) => return Ok(outputs),
        Ok(Err(source)) => source,
        Err(panic) => anyhow::anyhow!(panic_message(panic)),
    };

    Err(EngineError::Task {
        task: id,
        func: task.func_id,
        source,
    })
}

pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}
