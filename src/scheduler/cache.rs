use std::collections::HashMap;

use crate::core::{InputEndPoint, OutputEndPoint, TaskId};
use crate::error::ConfigError;
use crate::graph::{Fingerprint, TaskGraph};

/// Scheduling metadata derived from a graph's topology.
///
/// A cache is filled on the first run and reused by later runs of the same
/// graph, which then only reset the per-task readiness counters. A cache
/// remembers the fingerprint of the topology it was built for and refuses to
/// be used with any other.
#[derive(Debug, Default)]
pub struct Cache {
    data: Option<CacheData>,
}

#[derive(Debug)]
pub(crate) struct CacheData {
    pub fingerprint: Fingerprint,
    /// Tasks whose inputs are all free.
    pub roots: Vec<TaskId>,
    /// Inputs fed by each connected output.
    pub dependents: HashMap<OutputEndPoint, Vec<InputEndPoint>>,
    /// Number of free inputs per task.
    pub initial: Vec<usize>,
    /// Number of inputs per task that hold a value in the current run.
    pub available: Vec<usize>,
    pub free_inputs: Vec<InputEndPoint>,
    pub total_output_count: usize,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_populated(&self) -> bool {
        self.data.is_some()
    }

    /// Fingerprint of the topology the cache was built for, if built.
    pub fn fingerprint(&self) -> Option<Fingerprint> {
        self.data.as_ref().map(|data| data.fingerprint)
    }

    pub fn clear(&mut self) {
        self.data = None;
    }

    /// Makes the cache ready for a run of `graph`: builds it on first use,
    /// or resets its counters when reused.
    pub(crate) fn prepare(&mut self, graph: &TaskGraph) -> Result<&mut CacheData, ConfigError> {
        let data = match self.data.take() {
            Some(data) if data.fingerprint != graph.fingerprint() => {
                self.data = Some(data);
                return Err(ConfigError::CacheMismatch);
            }
            Some(mut data) => {
                data.available.clone_from(&data.initial);
                data
            }
            None => CacheData::build(graph),
        };

        Ok(self.data.insert(data))
    }
}

impl CacheData {
    fn build(graph: &TaskGraph) -> Self {
        let tasks = graph.task_info();

        let mut dependents: HashMap<OutputEndPoint, Vec<InputEndPoint>> = HashMap::new();
        let mut initial: Vec<usize> = tasks.iter().map(|info| info.task.input_count).collect();

        // Builder validation guarantees one connection per input at most.
        for c in graph.connections() {
            dependents.entry(c.from).or_default().push(c.to);
            initial[c.to.task] -= 1;
        }

        let roots: Vec<TaskId> = tasks
            .iter()
            .enumerate()
            .filter(|(id, info)| initial[*id] == info.task.input_count)
            .map(|(id, _)| id)
            .collect();

        tracing::debug!(
            roots = roots.len(),
            fingerprint = %graph.fingerprint().to_hex(),
            "built scheduler cache"
        );

        Self {
            fingerprint: graph.fingerprint(),
            roots,
            dependents,
            available: initial.clone(),
            initial,
            free_inputs: graph.free_inputs(),
            total_output_count: graph.total_output_count(),
        }
    }
}
