use std::collections::BTreeMap;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::{Connection, FuncId, InputEndPoint, OutputEndPoint, ResourceType, Task, TaskId};
use crate::error::ConfigError;
use crate::graph::{Fingerprint, TaskGraph, TaskInfo};

/// Incrementally collects tasks and connections and compiles them into a
/// [`TaskGraph`].
///
/// Connections are only recorded by [`connect`](Self::connect); all checks
/// happen in [`build`](Self::build).
///
/// # Example
///
/// ```rust
/// use taskflow::TaskGraphBuilder;
///
/// let mut builder = TaskGraphBuilder::new();
/// let a = builder.add_task(2, 1, 1, 0);
/// let b = builder.add_task(2, 1, 1, 0);
/// builder.connect(a, 0, b, 1);
///
/// let graph = builder.build().unwrap();
/// assert_eq!(graph.cell_count(), 5);
/// ```
#[derive(Debug, Default, Clone)]
pub struct TaskGraphBuilder {
    tasks: Vec<Task>,
    connections: Vec<Connection>,
}

impl TaskGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a task and returns its id. Ids are handed out sequentially.
    pub fn add_task(
        &mut self,
        input_count: usize,
        output_count: usize,
        func_id: FuncId,
        resource_type: ResourceType,
    ) -> TaskId {
        let id = self.tasks.len();
        self.tasks.push(Task {
            input_count,
            output_count,
            func_id,
            resource_type,
        });
        id
    }

    pub fn connect(
        &mut self,
        source_task: TaskId,
        source_port: usize,
        sink_task: TaskId,
        sink_port: usize,
    ) -> &mut Self {
        self.connections.push(Connection {
            from: OutputEndPoint {
                task: source_task,
                port: source_port,
            },
            to: InputEndPoint {
                task: sink_task,
                port: sink_port,
            },
        });
        self
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Validates the recorded topology and lays out the value store.
    ///
    /// One cell is allocated for every task output and for every input port
    /// without an incoming connection. A connected input resolves to the cell
    /// of the output feeding it.
    pub fn build(&self) -> Result<TaskGraph, ConfigError> {
        let i2o = self.validate()?;
        self.check_acyclic()?;

        let map_size: usize = self
            .tasks
            .iter()
            .map(|t| t.input_count + t.output_count)
            .sum();
        let data_size = map_size - self.connections.len();

        let mut tasks = Vec::with_capacity(self.tasks.len());
        let mut data_map = vec![0; map_size];
        let mut idata = 0;
        let mut imap = 0;

        // Outputs first, so that inputs can refer back to them.
        for task in &self.tasks {
            let output_index = imap;
            for _ in 0..task.output_count {
                data_map[imap] = idata;
                imap += 1;
                idata += 1;
            }
            tasks.push(TaskInfo {
                task: *task,
                input_index: 0,
                output_index,
            });
        }

        for (id, task) in self.tasks.iter().enumerate() {
            tasks[id].input_index = imap;
            for port in 0..task.input_count {
                data_map[imap] = match i2o.get(&InputEndPoint { task: id, port }) {
                    Some(source) => data_map[tasks[source.task].output_index + source.port],
                    None => {
                        idata += 1;
                        idata - 1
                    }
                };
                imap += 1;
            }
        }

        debug_assert_eq!(idata, data_size);
        debug_assert!(outputs_are_disjoint(&tasks, &data_map));

        tracing::debug!(
            tasks = tasks.len(),
            connections = self.connections.len(),
            cells = data_size,
            "compiled task graph"
        );

        Ok(TaskGraph {
            fingerprint: Fingerprint::of(&self.tasks, &self.connections),
            tasks,
            connections: self.connections.clone(),
            data: vec![None; data_size],
            data_map,
        })
    }

    fn validate(&self) -> Result<BTreeMap<InputEndPoint, OutputEndPoint>, ConfigError> {
        let mut i2o = BTreeMap::new();

        for c in &self.connections {
            let valid = self
                .tasks
                .get(c.from.task)
                .is_some_and(|t| c.from.port < t.output_count)
                && self
                    .tasks
                    .get(c.to.task)
                    .is_some_and(|t| c.to.port < t.input_count);

            if !valid {
                return Err(ConfigError::InvalidConnection {
                    from: c.from,
                    to: c.to,
                });
            }

            if i2o.insert(c.to, c.from).is_some() {
                return Err(ConfigError::DuplicateInput(c.to));
            }
        }

        Ok(i2o)
    }

    fn check_acyclic(&self) -> Result<(), ConfigError> {
        let mut graph = Graph::<(), ()>::with_capacity(self.tasks.len(), self.connections.len());
        for _ in &self.tasks {
            graph.add_node(());
        }
        for c in &self.connections {
            graph.add_edge(NodeIndex::new(c.from.task), NodeIndex::new(c.to.task), ());
        }

        petgraph::algo::toposort(&graph, None)
            .map(|_| ())
            .map_err(|cycle| ConfigError::CycleDetected(cycle.node_id().index()))
    }
}

/// Every cell is written by at most one output port.
fn outputs_are_disjoint(tasks: &[TaskInfo], data_map: &[usize]) -> bool {
    let mut seen = std::collections::HashSet::new();
    tasks.iter().all(|info| {
        (0..info.task.output_count).all(|port| seen.insert(data_map[info.output_index + port]))
    })
}
