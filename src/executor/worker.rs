use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::core::{Dynamic, Task, TaskId};
use crate::error::EngineError;
use crate::func::TaskFuncRegistry;
use crate::sync::{Checker, ThreadNotifier, lock};

use super::{Outcome, StartParam};

/// The part of a [`StartParam`] that travels to the worker thread.
pub(crate) struct Job {
    pub id: TaskId,
    pub task: Task,
    pub inputs: Vec<Dynamic>,
    pub registry: Arc<TaskFuncRegistry>,
    pub cancel: Checker,
    pub shared: Dynamic,
}

enum Phase {
    Idle,
    Submitted(Job),
    Running,
    Finished(Outcome),
}

struct State {
    phase: Phase,
    exit: bool,
}

struct Shared {
    state: Mutex<State>,
    incoming: ThreadNotifier,
    completion: Mutex<Option<Arc<ThreadNotifier>>>,
}

/// A background thread that runs one job at a time and parks the outcome
/// until the owner collects it.
pub(crate) struct Worker {
    shared: Arc<Shared>,
    on_done: Option<Box<dyn FnOnce() + Send>>,
    busy: bool,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawns the thread. `setup` runs on the new thread and produces the
    /// closure that handles each job, so anything it captures or creates
    /// stays thread-local.
    pub fn spawn<S, B>(name: String, setup: S) -> Self
    where
        S: FnOnce() -> B + Send + 'static,
        B: FnMut(Job) -> Outcome,
    {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Idle,
                exit: false,
            }),
            incoming: ThreadNotifier::new(),
            completion: Mutex::new(None),
        });

        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(name)
                .spawn(move || run(shared, setup))
        };

        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(e) => {
                tracing::error!("failed to spawn worker thread: {e}");
                None
            }
        };

        Self {
            shared,
            on_done: None,
            busy: false,
            thread,
        }
    }

    pub fn submit(&mut self, param: StartParam, shared: Dynamic) {
        debug_assert!(!self.busy, "executor started while busy");

        let StartParam {
            id,
            task,
            inputs,
            registry,
            cancel,
            on_done,
        } = param;

        self.on_done = on_done;
        self.busy = true;

        if self.thread.is_none() {
            lock(&self.shared.state).phase = Phase::Finished(Err(EngineError::WorkerGone));
            notify_completion(&self.shared);
            return;
        }

        lock(&self.shared.state).phase = Phase::Submitted(Job {
            id,
            task,
            inputs,
            registry,
            cancel,
            shared,
        });
        self.shared.incoming.notify_one();
    }

    pub fn poll(&mut self) -> Option<Outcome> {
        let outcome = {
            let mut state = lock(&self.shared.state);
            match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Finished(outcome) => outcome,
                other => {
                    state.phase = other;
                    return None;
                }
            }
        };

        self.busy = false;
        if let Some(on_done) = self.on_done.take() {
            on_done();
        }
        Some(outcome)
    }

    pub fn set_completion_notifier(&mut self, notifier: Arc<ThreadNotifier>) {
        *lock(&self.shared.completion) = Some(notifier);
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        lock(&self.shared.state).exit = true;
        self.shared.incoming.notify_all();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

fn notify_completion(shared: &Shared) {
    if let Some(notifier) = lock(&shared.completion).as_ref() {
        notifier.notify_all();
    }
}

fn run<S, B>(shared: Arc<Shared>, setup: S)
where
    S: FnOnce() -> B,
    B: FnMut(Job) -> Outcome,
{
    let mut body = setup();

    loop {
        shared.incoming.wait();

        let job = {
            let mut state = lock(&shared.state);
            if state.exit {
                return;
            }
            match std::mem::replace(&mut state.phase, Phase::Running) {
                Phase::Submitted(job) => job,
                other => {
                    state.phase = other;
                    continue;
                }
            }
        };

        let outcome = body(job);

        lock(&shared.state).phase = Phase::Finished(outcome);
        notify_completion(&shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Task;
    use std::time::Duration;

    fn param(id: TaskId) -> StartParam {
        StartParam::new(
            id,
            Task::new(0, 1, 0, 0),
            Vec::new(),
            Arc::new(TaskFuncRegistry::new()),
        )
    }

    #[test]
    fn test_outcome_is_parked_until_polled() {
        let mut worker = Worker::spawn("test-worker".into(), || {
            |job: Job| Ok(vec![Some(Dynamic::new(job.id))])
        });
        let notifier = Arc::new(ThreadNotifier::new());
        worker.set_completion_notifier(notifier.clone());

        worker.submit(param(7), Dynamic::new(()));
        assert!(worker.is_busy());
        assert!(notifier.wait_timeout(Duration::from_secs(5)));

        let outputs = worker.poll().unwrap().unwrap();
        assert_eq!(*outputs[0].as_ref().unwrap().downcast_ref::<usize>().unwrap(), 7);
        assert!(!worker.is_busy());
        assert!(worker.poll().is_none());
    }

    #[test]
    fn test_on_done_runs_on_poll() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut worker = Worker::spawn("test-worker".into(), || |_: Job| Ok(Vec::new()));
        let notifier = Arc::new(ThreadNotifier::new());
        worker.set_completion_notifier(notifier.clone());

        worker.submit(param(0).on_done(move || tx.send(()).unwrap()), Dynamic::new(()));
        assert!(notifier.wait_timeout(Duration::from_secs(5)));
        assert!(rx.try_recv().is_err());

        worker.poll().unwrap().unwrap();
        assert!(rx.try_recv().is_ok());
    }
}
