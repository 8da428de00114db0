use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::{Dynamic, ResourceType, Task};
use crate::error::ConfigError;
use crate::executor::{Outcome, StartParam, TaskExecutor};
use crate::func::TaskFuncRegistry;
use crate::sync::{CancelController, Checker, SubscriptionId, ThreadNotifier};

use super::pool::ResourcePool;

/// Handle for collecting the outcome of a task submitted to a
/// [`ParallelTaskScheduler`].
pub type Ticket = usize;

struct Queued {
    ticket: Ticket,
    task: Task,
    inputs: Vec<Dynamic>,
}

/// Runs independent tasks on pools of executors, first come first served
/// within each resource type.
///
/// When the cancel flag is set, tasks still waiting for an executor are
/// dropped and their outcome is a list of unset outputs, the same as a task
/// that noticed cancellation itself.
pub struct ParallelTaskScheduler {
    pools: BTreeMap<ResourceType, ResourcePool>,
    queues: BTreeMap<ResourceType, VecDeque<Queued>>,
    results: BTreeMap<Ticket, Outcome>,
    registry: Arc<TaskFuncRegistry>,
    notifier: Arc<ThreadNotifier>,
    controller: CancelController,
    subscription: SubscriptionId,
    next_ticket: Ticket,
}

impl ParallelTaskScheduler {
    pub fn new(registry: Arc<TaskFuncRegistry>) -> Self {
        Self::with_controller(registry, CancelController::new())
    }

    pub fn with_controller(registry: Arc<TaskFuncRegistry>, controller: CancelController) -> Self {
        let notifier = Arc::new(ThreadNotifier::new());
        let subscription = {
            let notifier = notifier.clone();
            controller.checker().on_cancelled(move || notifier.notify_all())
        };

        Self {
            pools: BTreeMap::new(),
            queues: BTreeMap::new(),
            results: BTreeMap::new(),
            registry,
            notifier,
            controller,
            subscription,
            next_ticket: 0,
        }
    }

    pub fn add_task_executor<E>(&mut self, executor: E) -> &mut Self
    where
        E: TaskExecutor + 'static,
    {
        let mut executor: Box<dyn TaskExecutor> = Box::new(executor);
        executor.set_task_completion_notifier(self.notifier.clone());
        self.pools.entry(executor.resource_type()).or_default().push(executor);
        self
    }

    pub fn checker(&self) -> Checker {
        self.controller.checker()
    }

    /// Queues a task and starts it right away if an executor is free. While
    /// the cancel flag is set the task only waits in the queue, to be
    /// dropped by the next [`propagate_cb`](Self::propagate_cb).
    pub fn add_task(&mut self, task: Task, inputs: Vec<Dynamic>) -> Result<Ticket, ConfigError> {
        if !self.pools.contains_key(&task.resource_type) {
            return Err(ConfigError::NoResource(task.resource_type));
        }

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        self.queues
            .entry(task.resource_type)
            .or_default()
            .push_back(Queued { ticket, task, inputs });
        if !self.controller.is_cancelled() {
            self.dispatch();
        }

        Ok(ticket)
    }

    /// Whether any task is queued or running.
    pub fn is_running(&self) -> bool {
        self.in_flight() > 0 || self.queues.values().any(|q| !q.is_empty())
    }

    /// Collects finished tasks and starts queued ones. Returns `true` once
    /// nothing is queued or running.
    pub fn propagate_cb(&mut self) -> bool {
        let results = &mut self.results;
        for pool in self.pools.values_mut() {
            pool.collect(|ticket, outcome| {
                results.insert(ticket, outcome);
            });
        }

        if self.controller.is_cancelled() {
            self.drop_queued();
        } else {
            self.dispatch();
        }

        !self.is_running()
    }

    pub fn join(&mut self) {
        while !self.propagate_cb() {
            self.notifier.wait();
        }
    }

    /// Returns `false` if tasks were still queued or running after `timeout`.
    pub fn maybe_join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.propagate_cb() {
                return true;
            }
            if !self.notifier.wait_until(deadline) {
                return false;
            }
        }
    }

    pub fn request_cancel(&self) {
        self.controller.cancel();
    }

    pub fn cancel_and_join(&mut self) {
        self.request_cancel();
        self.join();
    }

    pub fn resume(&self) {
        self.controller.resume();
    }

    /// Removes and returns the outcome of a finished task.
    pub fn take_result(&mut self, ticket: Ticket) -> Option<Outcome> {
        self.results.remove(&ticket)
    }

    /// Removes and returns the outcome of every finished task.
    pub fn take_results(&mut self) -> BTreeMap<Ticket, Outcome> {
        std::mem::take(&mut self.results)
    }

    fn in_flight(&self) -> usize {
        self.pools.values().map(ResourcePool::running).sum()
    }

    fn dispatch(&mut self) {
        for (resource_type, queue) in &mut self.queues {
            let Some(pool) = self.pools.get_mut(resource_type) else {
                continue;
            };

            while pool.has_free() {
                let Some(queued) = queue.pop_front() else {
                    break;
                };

                let param = StartParam::new(queued.ticket, queued.task, queued.inputs, self.registry.clone())
                    .with_cancel(self.controller.checker());

                if let Err(param) = pool.try_start(queued.ticket, param) {
                    queue.push_front(Queued {
                        ticket: param.id,
                        task: param.task,
                        inputs: param.inputs,
                    });
                    break;
                }
            }
        }
    }

    fn drop_queued(&mut self) {
        for queue in self.queues.values_mut() {
            if !queue.is_empty() {
                tracing::warn!(dropped = queue.len(), "queued tasks cancelled");
            }
            for queued in queue.drain(..) {
                self.results
                    .insert(queued.ticket, Ok(vec![None; queued.task.output_count]));
            }
        }
    }
}

impl Drop for ParallelTaskScheduler {
    fn drop(&mut self) {
        self.controller.checker().unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for ParallelTaskScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelTaskScheduler")
            .field("in_flight", &self.in_flight())
            .field("finished", &self.results.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadedTaskExecutor;
    use crate::func::TaskFunc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> Arc<TaskFuncRegistry> {
        let mut registry = TaskFuncRegistry::new();
        registry
            .register(0, TaskFunc::typed(|a: u64| a * a))
            .register(
                1,
                TaskFunc::cancellable(|_, out, _, cancel| {
                    while !cancel.is_cancelled() {
                        std::thread::sleep(Duration::from_millis(2));
                    }
                    out[0] = None;
                    Ok(())
                }),
            );
        Arc::new(registry)
    }

    fn scheduler(workers: usize) -> ParallelTaskScheduler {
        let mut scheduler = ParallelTaskScheduler::new(registry());
        for _ in 0..workers {
            scheduler.add_task_executor(ThreadedTaskExecutor::new(0));
        }
        scheduler
    }

    #[test]
    fn test_independent_tasks() {
        let mut scheduler = scheduler(3);
        let tickets: Vec<Ticket> = (0..10u64)
            .map(|n| scheduler.add_task(Task::new(1, 1, 0, 0), vec![Dynamic::new(n)]).unwrap())
            .collect();

        scheduler.join();
        assert!(!scheduler.is_running());

        for (n, ticket) in tickets.into_iter().enumerate() {
            let out = scheduler.take_result(ticket).unwrap().unwrap();
            assert_eq!(*out[0].as_ref().unwrap().downcast_ref::<u64>().unwrap(), (n * n) as u64);
        }
        assert!(scheduler.take_results().is_empty());
    }

    #[test]
    fn test_unknown_resource() {
        let mut scheduler = scheduler(1);
        let err = scheduler.add_task(Task::new(0, 0, 0, 5), Vec::new()).unwrap_err();
        assert_eq!(err, ConfigError::NoResource(5));
    }

    #[test]
    fn test_tasks_added_while_cancelled_never_start() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskFuncRegistry::new();
        {
            let calls = calls.clone();
            registry.register(
                0,
                TaskFunc::stateless(move |out, _| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    out[0] = Some(Dynamic::new(1u64));
                    Ok(())
                }),
            );
        }

        let mut scheduler = ParallelTaskScheduler::new(Arc::new(registry));
        scheduler.add_task_executor(ThreadedTaskExecutor::new(0));
        scheduler.request_cancel();

        let ticket = scheduler.add_task(Task::new(0, 1, 0, 0), Vec::new()).unwrap();
        scheduler.join();

        assert!(scheduler.take_result(ticket).unwrap().unwrap()[0].is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        scheduler.resume();
        let ticket = scheduler.add_task(Task::new(0, 1, 0, 0), Vec::new()).unwrap();
        scheduler.join();
        assert!(scheduler.take_result(ticket).unwrap().unwrap()[0].is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_drops_queue() {
        let mut scheduler = scheduler(1);
        let running = scheduler.add_task(Task::new(0, 1, 1, 0), Vec::new()).unwrap();
        let queued: Vec<Ticket> = (0..3u64)
            .map(|n| scheduler.add_task(Task::new(1, 1, 0, 0), vec![Dynamic::new(n)]).unwrap())
            .collect();

        assert!(!scheduler.maybe_join(Duration::from_millis(20)));
        scheduler.cancel_and_join();

        let results = scheduler.take_results();
        assert_eq!(results.len(), 4);
        assert!(results[&running].as_ref().unwrap()[0].is_none());
        for ticket in queued {
            assert!(results[&ticket].as_ref().unwrap()[0].is_none());
        }
    }
}
