//! Dataflow scheduling of a [`TaskGraph`] over pools of executors.
//!
//! The scheduler keeps, per task, a counter of inputs that already hold a
//! value. Root tasks start ready. Whenever a task finishes, its outputs are
//! written to the store and the counters of every input fed by them are
//! bumped; a task whose counter reaches its input count becomes ready and is
//! dispatched as soon as an executor of its resource type is free.
//!
//! All of this bookkeeping happens on the thread driving the [`Run`], inside
//! [`Run::propagate_cb`]. Executors only ever see cloned input values and
//! hand their outputs back, so the store is never touched concurrently.

mod cache;
pub mod parallel;
mod pool;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::Span;

use crate::core::{Dynamic, InputEndPoint, OutputEndPoint, ResourceType, TaskId};
use crate::error::{ConfigError, EngineError};
use crate::executor::{Outcome, StartParam, TaskExecutor};
use crate::func::TaskFuncRegistry;
use crate::graph::TaskGraph;
use crate::sync::{CancelController, Canceller, Checker, Resumer, SubscriptionId, ThreadNotifier};

pub use cache::Cache;
pub use parallel::{ParallelTaskScheduler, Ticket};

use cache::CacheData;
use pool::ResourcePool;

/// Runs task graphs on the executors registered with it.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use taskflow::*;
/// # fn main() -> Result<(), EngineError> {
/// let mut registry = TaskFuncRegistry::new();
/// registry.register(0, TaskFunc::typed(|a: i32, b: i32| a + b));
///
/// let mut builder = TaskGraphBuilder::new();
/// let t1 = builder.add_task(2, 1, 0, 0);
/// let t2 = builder.add_task(2, 1, 0, 0);
/// builder.connect(t1, 0, t2, 0);
/// let mut graph = builder.build()?;
/// graph.set_input(t1, 0, 1)?;
/// graph.set_input(t1, 1, 2)?;
/// graph.set_input(t2, 1, 4)?;
///
/// let mut executor = TaskGraphExecutor::new();
/// executor.add_task_executor(ThreadedTaskExecutor::new(0));
///
/// let mut cache = executor.make_cache();
/// executor.run(&mut graph, &mut cache, Arc::new(registry))?;
/// assert_eq!(*graph.output(t2, 0)?.unwrap().downcast_ref::<i32>()?, 7);
/// # Ok(())
/// # }
/// ```
pub struct TaskGraphExecutor {
    pools: BTreeMap<ResourceType, ResourcePool>,
    notifier: Arc<ThreadNotifier>,
    controller: CancelController,
    subscription: SubscriptionId,
}

impl TaskGraphExecutor {
    pub fn new() -> Self {
        Self::with_controller(CancelController::new())
    }

    /// Uses `controller` as the cancel flag observed by every run and passed
    /// on to every task.
    pub fn with_controller(controller: CancelController) -> Self {
        let notifier = Arc::new(ThreadNotifier::new());

        // Wake a blocked join so it notices the request without waiting
        // for the next task to finish.
        let subscription = {
            let notifier = notifier.clone();
            controller.checker().on_cancelled(move || notifier.notify_all())
        };

        Self {
            pools: BTreeMap::new(),
            notifier,
            controller,
            subscription,
        }
    }

    /// Adds an executor to the pool of its resource type.
    pub fn add_task_executor<E>(&mut self, executor: E) -> &mut Self
    where
        E: TaskExecutor + 'static,
    {
        let mut executor: Box<dyn TaskExecutor> = Box::new(executor);
        executor.set_task_completion_notifier(self.notifier.clone());

        let resource_type = executor.resource_type();
        self.pools.entry(resource_type).or_default().push(executor);
        tracing::debug!(resource_type, "executor added");
        self
    }

    /// Number of executors registered for `resource_type`.
    pub fn pool_size(&self, resource_type: ResourceType) -> usize {
        self.pools.get(&resource_type).map_or(0, ResourcePool::len)
    }

    pub fn make_cache(&self) -> Cache {
        Cache::new()
    }

    pub fn checker(&self) -> Checker {
        self.controller.checker()
    }

    pub fn canceller(&self) -> Canceller {
        self.controller.canceller()
    }

    pub fn resumer(&self) -> Resumer {
        self.controller.resumer()
    }

    pub fn is_cancelled(&self) -> bool {
        self.controller.is_cancelled()
    }

    /// Clears a previous cancellation so that new runs make progress.
    pub fn resume(&self) {
        self.controller.resume();
    }

    /// Starts running `graph` and returns without waiting.
    ///
    /// Every free input must hold a value. The returned [`Run`] has to be
    /// driven by calling [`Run::propagate_cb`] or one of the join methods.
    pub fn start<'a>(
        &'a mut self,
        graph: &'a mut TaskGraph,
        cache: &'a mut Cache,
        registry: Arc<TaskFuncRegistry>,
    ) -> Result<Run<'a>, EngineError> {
        self.start_inner(graph, cache, registry, None)
    }

    /// Like [`start`](Self::start); `on_complete` is called once, from the
    /// thread driving the run, when every task has completed.
    pub fn start_with_callback<'a, F>(
        &'a mut self,
        graph: &'a mut TaskGraph,
        cache: &'a mut Cache,
        registry: Arc<TaskFuncRegistry>,
        on_complete: F,
    ) -> Result<Run<'a>, EngineError>
    where
        F: FnOnce() + 'a,
    {
        self.start_inner(graph, cache, registry, Some(Box::new(on_complete)))
    }

    /// Runs `graph` to completion on the calling thread.
    pub fn run(
        &mut self,
        graph: &mut TaskGraph,
        cache: &mut Cache,
        registry: Arc<TaskFuncRegistry>,
    ) -> Result<(), EngineError> {
        self.start(graph, cache, registry)?.join()
    }

    fn start_inner<'a>(
        &'a mut self,
        graph: &'a mut TaskGraph,
        cache: &'a mut Cache,
        registry: Arc<TaskFuncRegistry>,
        on_complete: Option<Box<dyn FnOnce() + 'a>>,
    ) -> Result<Run<'a>, EngineError> {
        if self.pools.values().any(|pool| pool.running() > 0) {
            return Err(ConfigError::AlreadyRunning.into());
        }

        for info in graph.task_info() {
            let resource_type = info.task.resource_type;
            if !self.pools.contains_key(&resource_type) {
                return Err(ConfigError::NoResource(resource_type).into());
            }
        }

        let cache = cache.prepare(graph)?;

        for input in &cache.free_inputs {
            if graph.input(input.task, input.port)?.is_none() {
                return Err(ConfigError::UnsetInput(*input).into());
            }
        }

        graph.clear_outputs();

        let span = tracing::info_span!("task_graph", tasks = graph.task_count());
        span.in_scope(|| tracing::info!("run started"));

        let TaskGraphExecutor {
            pools,
            notifier,
            controller,
            ..
        } = self;

        let mut run = Run {
            pools,
            notifier: notifier.clone(),
            controller,
            ready: cache.roots.clone(),
            graph,
            cache,
            registry,
            completed_tasks: 0,
            computed_outputs: 0,
            failure: None,
            abandoned: false,
            running: true,
            on_complete,
            span,
        };

        run.advance();
        Ok(run)
    }
}

impl Default for TaskGraphExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TaskGraphExecutor {
    fn drop(&mut self) {
        self.controller.checker().unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for TaskGraphExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pools: BTreeMap<_, _> = self.pools.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("TaskGraphExecutor")
            .field("pools", &pools)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// One execution of a task graph.
///
/// The run borrows the graph, the cache and the executor for its whole
/// lifetime. Dropping an unfinished run stops dispatching and blocks until
/// the tasks already in flight have finished.
pub struct Run<'a> {
    pools: &'a mut BTreeMap<ResourceType, ResourcePool>,
    notifier: Arc<ThreadNotifier>,
    controller: &'a CancelController,
    graph: &'a mut TaskGraph,
    cache: &'a mut CacheData,
    registry: Arc<TaskFuncRegistry>,
    ready: Vec<TaskId>,
    completed_tasks: usize,
    computed_outputs: usize,
    failure: Option<EngineError>,
    abandoned: bool,
    running: bool,
    on_complete: Option<Box<dyn FnOnce() + 'a>>,
    span: Span,
}

impl Run<'_> {
    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Number of output values produced so far, counting the outputs of
    /// every completed task whether or not it actually set them.
    pub fn computed_output_count(&self) -> usize {
        self.computed_outputs
    }

    pub fn completed_task_count(&self) -> usize {
        self.completed_tasks
    }

    /// Collects finished tasks, makes their dependents ready and dispatches
    /// whatever can run. Never blocks.
    ///
    /// Returns `Ok(true)` once the run is over. If a task failed, the error
    /// is returned once every task still in flight has drained.
    pub fn propagate_cb(&mut self) -> Result<bool, EngineError> {
        if !self.running {
            return self.failure.take().map_or(Ok(true), Err);
        }

        let span = self.span.clone();
        let _enter = span.enter();

        let mut finished = Vec::new();
        for pool in self.pools.values_mut() {
            pool.collect(|task, outcome| finished.push((task, outcome)));
        }
        for (task, outcome) in finished {
            self.complete(task, outcome);
        }

        self.advance();

        match self.failure.take() {
            Some(e) if !self.running => Err(e),
            failure => {
                self.failure = failure;
                Ok(!self.running)
            }
        }
    }

    /// Blocks until the run is over.
    pub fn join(&mut self) -> Result<(), EngineError> {
        while !self.propagate_cb()? {
            self.notifier.wait();
        }
        Ok(())
    }

    /// Blocks for at most `timeout`. Returns `Ok(false)` if the run was still
    /// going when the time ran out.
    pub fn maybe_join(&mut self, timeout: Duration) -> Result<bool, EngineError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.propagate_cb()? {
                return Ok(true);
            }
            if !self.notifier.wait_until(deadline) {
                return Ok(false);
            }
        }
    }

    /// Sets the cancel flag without waiting. Tasks already running finish on
    /// their own terms; nothing new is dispatched.
    pub fn request_cancel(&self) {
        self.controller.cancel();
    }

    pub fn cancel_and_join(&mut self) -> Result<(), EngineError> {
        self.request_cancel();
        self.join()
    }

    fn stopping(&self) -> bool {
        self.failure.is_some() || self.abandoned || self.controller.is_cancelled()
    }

    fn complete(&mut self, task: TaskId, outcome: Outcome) {
        let outputs = match outcome {
            Ok(outputs) => outputs,
            Err(e) => {
                tracing::error!(task, "{e}");
                if self.failure.is_none() {
                    self.failure = Some(e);
                }
                return;
            }
        };

        let info = self.graph.tasks[task];
        for (port, value) in outputs.into_iter().take(info.task.output_count).enumerate() {
            if let Some(value) = value {
                let cell = self.graph.data_map[info.output_index + port];
                self.graph.data[cell] = Some(value);
            }
        }

        self.completed_tasks += 1;
        self.computed_outputs += info.task.output_count;
        tracing::debug!(task, "task completed");

        for port in 0..info.task.output_count {
            let Some(inputs) = self.cache.dependents.get(&OutputEndPoint { task, port }) else {
                continue;
            };
            for input in inputs {
                let available = &mut self.cache.available[input.task];
                *available += 1;
                if *available == self.graph.tasks[input.task].task.input_count {
                    self.ready.push(input.task);
                }
            }
        }
    }

    /// Dispatches ready tasks if allowed and decides whether the run is over.
    fn advance(&mut self) {
        if !self.stopping() {
            if let Err(e) = self.dispatch() {
                tracing::error!("{e}");
                self.failure = Some(e);
            }
        }

        let in_flight: usize = self.pools.values().map(ResourcePool::running).sum();

        if self.failure.is_none() && self.completed_tasks == self.graph.task_count() {
            debug_assert_eq!(self.computed_outputs, self.cache.total_output_count);
            self.running = false;
            tracing::info!(outputs = self.computed_outputs, "run finished");
            if let Some(on_complete) = self.on_complete.take() {
                on_complete();
            }
        } else if self.stopping() {
            self.ready.clear();
            if in_flight == 0 {
                self.running = false;
                if self.failure.is_none() {
                    tracing::warn!(
                        completed = self.completed_tasks,
                        total = self.graph.task_count(),
                        "run cancelled"
                    );
                }
            }
        }
    }

    fn dispatch(&mut self) -> Result<(), EngineError> {
        let mut i = 0;
        while i < self.ready.len() {
            let id = self.ready[i];
            let info = self.graph.tasks[id];
            let resource_type = info.task.resource_type;

            let pool = self
                .pools
                .get_mut(&resource_type)
                .ok_or(ConfigError::NoResource(resource_type))?;

            if !pool.has_free() {
                i += 1;
                continue;
            }

            let inputs = (0..info.task.input_count)
                .map(|port| {
                    let cell = self.graph.data_map[info.input_index + port];
                    self.graph.data[cell]
                        .clone()
                        .ok_or(ConfigError::UnsetInput(InputEndPoint { task: id, port }))
                })
                .collect::<Result<Vec<Dynamic>, _>>()?;

            let param = StartParam::new(id, info.task, inputs, self.registry.clone())
                .with_cancel(self.controller.checker());

            if pool.try_start(id, param).is_err() {
                i += 1;
                continue;
            }

            tracing::debug!(task = id, func = info.task.func_id, resource_type, "task dispatched");
            self.ready.remove(i);
        }
        Ok(())
    }
}

impl Drop for Run<'_> {
    fn drop(&mut self) {
        if !self.running {
            return;
        }

        self.abandoned = true;
        loop {
            match self.propagate_cb() {
                Ok(false) => self.notifier.wait(),
                Ok(true) | Err(_) => break,
            }
        }
    }
}

impl std::fmt::Debug for Run<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("running", &self.running)
            .field("completed_tasks", &self.completed_tasks)
            .field("ready", &self.ready)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ThreadedTaskExecutor;
    use crate::func::TaskFunc;
    use crate::graph::TaskGraphBuilder;
    use std::cell::Cell;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sum_registry() -> Arc<TaskFuncRegistry> {
        let mut registry = TaskFuncRegistry::new();
        registry.register(
            0,
            TaskFunc::stateless(|out, inputs| {
                let mut acc = 0i32;
                for input in inputs {
                    acc += *input.downcast_ref::<i32>()?;
                }
                out[0] = Some(Dynamic::new(acc));
                Ok(())
            }),
        );
        registry.register(1, TaskFunc::typed(|a: i32, b: i32| a + b));
        Arc::new(registry)
    }

    fn executor(workers: usize) -> TaskGraphExecutor {
        let mut exec = TaskGraphExecutor::new();
        for _ in 0..workers {
            exec.add_task_executor(ThreadedTaskExecutor::new(0));
        }
        exec
    }

    fn output_i32(graph: &TaskGraph, task: TaskId) -> i32 {
        *graph.output(task, 0).unwrap().unwrap().downcast_ref::<i32>().unwrap()
    }

    #[test]
    fn test_two_task_chain() {
        let mut b = TaskGraphBuilder::new();
        let t1 = b.add_task(2, 1, 1, 0);
        let t2 = b.add_task(2, 1, 1, 0);
        b.connect(t1, 0, t2, 0);
        let mut graph = b.build().unwrap();

        graph.set_input(t1, 0, 1).unwrap();
        graph.set_input(t1, 1, 2).unwrap();
        graph.set_input(t2, 1, 4).unwrap();

        let mut exec = executor(1);
        let mut cache = exec.make_cache();
        exec.run(&mut graph, &mut cache, sum_registry()).unwrap();

        assert_eq!(output_i32(&graph, t1), 3);
        assert_eq!(output_i32(&graph, t2), 7);
    }

    /// Four layers of 4, 3, 2 and 1 two-input adders, each task reading the
    /// two tasks below it.
    fn pyramid() -> (TaskGraph, Vec<TaskId>, TaskId) {
        let mut b = TaskGraphBuilder::new();
        let mut below: Vec<TaskId> = (0..4).map(|_| b.add_task(2, 1, 1, 0)).collect();
        let base = below.clone();

        while below.len() > 1 {
            let layer: Vec<TaskId> = below
                .windows(2)
                .map(|pair| {
                    let t = b.add_task(2, 1, 1, 0);
                    b.connect(pair[0], 0, t, 0).connect(pair[1], 0, t, 1);
                    t
                })
                .collect();
            below = layer;
        }

        (b.build().unwrap(), base, below[0])
    }

    #[test]
    fn test_pyramid() {
        let (mut graph, base, top) = pyramid();
        for (i, &t) in base.iter().enumerate() {
            graph.set_input(t, 0, 2 * i as i32 + 1).unwrap();
            graph.set_input(t, 1, 2 * i as i32 + 2).unwrap();
        }

        let mut exec = executor(3);
        let mut cache = exec.make_cache();
        exec.run(&mut graph, &mut cache, sum_registry()).unwrap();

        // Base sums 3, 7, 11, 15 -> 10, 18, 26 -> 28, 44 -> 72.
        assert_eq!(output_i32(&graph, top), 72);
    }

    #[test]
    fn test_cache_reuse_with_new_inputs() {
        let (mut graph, base, top) = pyramid();
        let mut exec = executor(2);
        let mut cache = exec.make_cache();

        for round in 0..3 {
            for &t in &base {
                graph.set_input(t, 0, round).unwrap();
                graph.set_input(t, 1, 1).unwrap();
            }
            exec.run(&mut graph, &mut cache, sum_registry()).unwrap();
            // Every base value reaches the top 1 + 3 + 3 + 1 = 8 times.
            assert_eq!(output_i32(&graph, top), 8 * (round + 1));
            assert!(cache.is_populated());
        }
    }

    #[test]
    fn test_pool_capacity_is_respected() {
        const TASKS: usize = 12;
        const WORKERS: usize = 3;

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(Mutex::new(vec![0usize; TASKS]));

        let mut registry = TaskFuncRegistry::new();
        {
            let (current, peak) = (current.clone(), peak.clone());
            registry.register(
                0,
                TaskFunc::stateless(move |out, inputs| {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    current.fetch_sub(1, Ordering::SeqCst);
                    out[0] = Some(inputs[0].clone());
                    Ok(())
                }),
            );
        }

        let mut b = TaskGraphBuilder::new();
        let tasks: Vec<TaskId> = (0..TASKS).map(|_| b.add_task(1, 1, 0, 0)).collect();
        let mut graph = b.build().unwrap();
        for &t in &tasks {
            graph.set_input(t, 0, t).unwrap();
        }

        let mut exec = executor(WORKERS);
        let mut cache = exec.make_cache();
        exec.run(&mut graph, &mut cache, Arc::new(registry)).unwrap();

        for &t in &tasks {
            let value = *graph.output(t, 0).unwrap().unwrap().downcast_ref::<usize>().unwrap();
            runs.lock().unwrap()[value] += 1;
        }
        assert!(runs.lock().unwrap().iter().all(|&n| n == 1));
        assert!(peak.load(Ordering::SeqCst) <= WORKERS);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn test_cancel_stops_dispatch() {
        let mut registry = TaskFuncRegistry::new();
        registry.register(
            0,
            TaskFunc::cancellable(|_, out, _, cancel| {
                for _ in 0..100 {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                out[0] = Some(Dynamic::new(0i32));
                Ok(())
            }),
        );

        let mut b = TaskGraphBuilder::new();
        let mut prev = b.add_task(0, 1, 0, 0);
        for _ in 0..4 {
            let next = b.add_task(1, 1, 0, 0);
            b.connect(prev, 0, next, 0);
            prev = next;
        }
        let mut graph = b.build().unwrap();

        let mut exec = executor(1);
        let checker = exec.checker();
        let mut cache = exec.make_cache();

        {
            let mut run = exec.start(&mut graph, &mut cache, Arc::new(registry)).unwrap();
            assert!(!run.maybe_join(Duration::from_millis(20)).unwrap());
            assert!(run.is_running());

            run.cancel_and_join().unwrap();
            assert!(!run.is_running());
            assert!(run.completed_task_count() <= 1);
        }

        assert!(checker.is_cancelled());
        assert!(graph.output(prev, 0).unwrap().is_none());
    }

    #[test]
    fn test_resume_after_cancel() {
        let mut b = TaskGraphBuilder::new();
        let t = b.add_task(2, 1, 1, 0);
        let mut graph = b.build().unwrap();
        graph.set_input(t, 0, 1).unwrap();
        graph.set_input(t, 1, 1).unwrap();

        let mut exec = executor(1);
        let mut cache = exec.make_cache();

        exec.canceller().cancel();
        exec.run(&mut graph, &mut cache, sum_registry()).unwrap();
        assert!(graph.output(t, 0).unwrap().is_none());

        exec.resume();
        exec.run(&mut graph, &mut cache, sum_registry()).unwrap();
        assert_eq!(output_i32(&graph, t), 2);
    }

    #[test]
    fn test_stateful_graph() {
        let mut registry = TaskFuncRegistry::new();
        registry.register(
            0,
            TaskFunc::stateful(|state, out, inputs| {
                let mut acc = *state.local::<i32>()? + *state.shared::<i32>()?;
                for input in inputs {
                    acc += *input.downcast_ref::<i32>()?;
                }
                for slot in out.iter_mut() {
                    *slot = Some(Dynamic::new(acc));
                }
                Ok(())
            }),
        );

        let mut b = TaskGraphBuilder::new();
        let t11 = b.add_task(0, 2, 0, 0);
        let t21 = b.add_task(1, 2, 0, 0);
        let t22 = b.add_task(1, 1, 0, 0);
        let t31 = b.add_task(1, 1, 0, 0);
        let t32 = b.add_task(2, 1, 0, 0);
        let t33 = b.add_task(1, 1, 0, 0);
        let t41 = b.add_task(2, 1, 0, 0);
        let t42 = b.add_task(2, 1, 0, 0);
        let t51 = b.add_task(2, 1, 0, 0);
        b.connect(t11, 0, t21, 0)
            .connect(t11, 1, t22, 0)
            .connect(t21, 0, t31, 0)
            .connect(t21, 1, t32, 0)
            .connect(t22, 0, t32, 1)
            .connect(t22, 0, t33, 0)
            .connect(t31, 0, t41, 0)
            .connect(t32, 0, t41, 1)
            .connect(t32, 0, t42, 0)
            .connect(t33, 0, t42, 1)
            .connect(t41, 0, t51, 0)
            .connect(t42, 0, t51, 1);
        let mut graph = b.build().unwrap();

        let mut exec = TaskGraphExecutor::new();
        for _ in 0..2 {
            exec.add_task_executor(
                ThreadedTaskExecutor::with_local(0, || 1i32).with_shared_data(Dynamic::new(2i32)),
            );
        }

        let mut cache = exec.make_cache();
        exec.run(&mut graph, &mut cache, Arc::new(registry)).unwrap();
        assert_eq!(output_i32(&graph, t51), 57);
    }

    #[test]
    fn test_callback_fires_once() {
        let (mut graph, base, _) = pyramid();
        for &t in &base {
            graph.set_input(t, 0, 0).unwrap();
            graph.set_input(t, 1, 0).unwrap();
        }

        let calls = Cell::new(0);
        let mut exec = executor(2);
        let mut cache = exec.make_cache();
        let mut run = exec
            .start_with_callback(&mut graph, &mut cache, sum_registry(), || calls.set(calls.get() + 1))
            .unwrap();

        while !run.propagate_cb().unwrap() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(run.propagate_cb().unwrap());
        assert_eq!(run.computed_output_count(), 10);
        drop(run);

        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_missing_pool_and_unset_input() {
        let mut b = TaskGraphBuilder::new();
        let t = b.add_task(1, 1, 0, 7);
        let mut graph = b.build().unwrap();

        let mut exec = executor(1);
        let mut cache = exec.make_cache();
        let err = exec.run(&mut graph, &mut cache, sum_registry()).unwrap_err();
        assert_eq!(err.as_config(), Some(&ConfigError::NoResource(7)));

        exec.add_task_executor(ThreadedTaskExecutor::new(7));
        let err = exec.run(&mut graph, &mut cache, sum_registry()).unwrap_err();
        assert_eq!(
            err.as_config(),
            Some(&ConfigError::UnsetInput(InputEndPoint { task: t, port: 0 }))
        );
    }

    #[test]
    fn test_cache_mismatch() {
        let (mut graph, base, _) = pyramid();
        for &t in &base {
            graph.set_input(t, 0, 0).unwrap();
            graph.set_input(t, 1, 0).unwrap();
        }

        let mut exec = executor(1);
        let mut cache = exec.make_cache();
        exec.run(&mut graph, &mut cache, sum_registry()).unwrap();

        let mut b = TaskGraphBuilder::new();
        b.add_task(0, 0, 0, 0);
        let mut other = b.build().unwrap();
        let err = exec.run(&mut other, &mut cache, sum_registry()).unwrap_err();
        assert_eq!(err.as_config(), Some(&ConfigError::CacheMismatch));
    }

    #[test]
    fn test_task_failure_drains_and_reports() {
        let mut registry = TaskFuncRegistry::new();
        registry
            .register(0, TaskFunc::stateless(|_, _| anyhow::bail!("broken")))
            .register(
                1,
                TaskFunc::stateless(|out, _| {
                    std::thread::sleep(Duration::from_millis(20));
                    out[0] = Some(Dynamic::new(1i32));
                    Ok(())
                }),
            );

        let mut b = TaskGraphBuilder::new();
        let failing = b.add_task(0, 1, 0, 0);
        let slow = b.add_task(0, 1, 1, 0);
        let after = b.add_task(2, 1, 1, 0);
        b.connect(failing, 0, after, 0).connect(slow, 0, after, 1);
        let mut graph = b.build().unwrap();

        let mut exec = executor(2);
        let mut cache = exec.make_cache();

        match exec.run(&mut graph, &mut cache, Arc::new(registry)) {
            Err(EngineError::Task { task, func, source }) => {
                assert_eq!(task, failing);
                assert_eq!(func, 0);
                assert_eq!(source.to_string(), "broken");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        // Both executors are idle again.
        assert!(exec.pools.values().all(|pool| pool.running() == 0));
        assert!(graph.output(after, 0).unwrap().is_none());
    }

    #[test]
    fn test_empty_graph_finishes_immediately() {
        let mut graph = TaskGraphBuilder::new().build().unwrap();
        let mut exec = TaskGraphExecutor::new();
        let mut cache = exec.make_cache();
        let run = exec.start(&mut graph, &mut cache, sum_registry()).unwrap();
        assert!(!run.is_running());
    }

    #[test]
    fn test_dropping_run_drains() {
        let (mut graph, base, _) = pyramid();
        for &t in &base {
            graph.set_input(t, 0, 0).unwrap();
            graph.set_input(t, 1, 0).unwrap();
        }

        let mut exec = executor(2);
        let mut cache = exec.make_cache();
        drop(exec.start(&mut graph, &mut cache, sum_registry()).unwrap());

        assert!(exec.pools.values().all(|pool| pool.running() == 0));
        assert!(!exec.is_cancelled());
    }

    #[cfg(feature = "remote")]
    mod remote {
        use super::*;
        use crate::config::RemoteConfig;
        use crate::executor::{RemoteExecutorService, RemoteTaskExecutor};
        use crate::wire::{Codec, CodecRegistry};

        const STEP: i32 = 2;

        /// Binds `services` workers, each reached by `per_service` executors.
        fn remote_executor(services: usize, per_service: usize) -> TaskGraphExecutor {
            let mut funcs = TaskFuncRegistry::new();
            funcs
                .register(1, TaskFunc::typed(|a: i32, b: i32| a + b))
                .register(
                    STEP,
                    TaskFunc::cancellable(|_, out, inputs, cancel| {
                        for _ in 0..40 {
                            if cancel.is_cancelled() {
                                return Ok(());
                            }
                            std::thread::sleep(Duration::from_millis(5));
                        }
                        let mut acc = 1i32;
                        for input in inputs {
                            acc += *input.downcast_ref::<i32>()?;
                        }
                        out[0] = Some(Dynamic::new(acc));
                        Ok(())
                    }),
                );

            let mut codecs = CodecRegistry::new();
            codecs
                .register(1, Codec::display_parse::<i32>())
                .register(STEP, Codec::display_parse::<i32>());

            let (funcs, codecs) = (Arc::new(funcs), Arc::new(codecs));
            let mut exec = TaskGraphExecutor::new();
            for _ in 0..services {
                let handle = RemoteExecutorService::new(funcs.clone(), codecs.clone())
                    .bind("127.0.0.1:0")
                    .unwrap();
                let config = RemoteConfig::new(handle.local_addr().to_string());
                for _ in 0..per_service {
                    exec.add_task_executor(RemoteTaskExecutor::new(0, config.clone(), codecs.clone()));
                }
            }
            exec
        }

        #[test]
        fn test_remote_pyramid() {
            let (mut graph, base, top) = pyramid();
            let mut exec = remote_executor(2, 2);
            let mut cache = exec.make_cache();

            for round in 0..2 {
                for (i, &t) in base.iter().enumerate() {
                    graph.set_input(t, 0, 2 * i as i32 + 1 + round).unwrap();
                    graph.set_input(t, 1, 2 * i as i32 + 2).unwrap();
                }
                exec.run(&mut graph, &mut cache, sum_registry()).unwrap();
                // Every base input reaches the top 1, 3, 3 and 1 times.
                assert_eq!(output_i32(&graph, top), 72 + 8 * round);
            }
        }

        #[test]
        fn test_remote_cancel_and_rerun() {
            let mut b = TaskGraphBuilder::new();
            let mut last = b.add_task(0, 1, STEP, 0);
            for _ in 0..3 {
                let next = b.add_task(1, 1, STEP, 0);
                b.connect(last, 0, next, 0);
                last = next;
            }
            let mut graph = b.build().unwrap();

            let mut exec = remote_executor(1, 1);
            let mut cache = exec.make_cache();

            {
                let mut run = exec.start(&mut graph, &mut cache, sum_registry()).unwrap();
                assert!(!run.maybe_join(Duration::from_millis(50)).unwrap());
                run.cancel_and_join().unwrap();
                assert!(run.completed_task_count() <= 1);
            }
            assert!(graph.output(last, 0).unwrap().is_none());

            exec.resume();
            exec.run(&mut graph, &mut cache, sum_registry()).unwrap();
            assert_eq!(output_i32(&graph, last), 4);
        }
    }
}
