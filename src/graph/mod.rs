//! Compiled task graph topology and its flat value store.
//!
//! A [`TaskGraph`] is produced once by a [`TaskGraphBuilder`] and can then be
//! executed any number of times. All payload data lives in a single store of
//! type-erased cells. Every task owns a contiguous range of entries in an
//! index map for its inputs and another for its outputs; those entries point
//! into the store. A connected input port points at the very same cell as the
//! output it is connected to, so values flow between tasks without copying.
//!
//! Between runs the caller only needs to rewrite the *free* inputs, i.e. the
//! input ports that have no incoming connection.

pub mod builder;

use std::fmt::Debug;

use crate::core::{Connection, Dynamic, InputEndPoint, Task, TaskId};
use crate::error::ConfigError;

pub use builder::TaskGraphBuilder;

/// Placement of one task's ports in the graph's index map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub task: Task,
    /// Inputs occupy `data_map[input_index..input_index + task.input_count]`.
    pub input_index: usize,
    /// Outputs occupy `data_map[output_index..output_index + task.output_count]`.
    pub output_index: usize,
}

/// A 32-byte BLAKE3 digest of a graph's topology.
///
/// Two graphs with the same tasks and connections share a fingerprint, which
/// is what allows a scheduler cache to be checked against the graph it is
/// being used with.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub(crate) fn of(tasks: &[Task], connections: &[Connection]) -> Self {
        let mut hasher = blake3::Hasher::new();

        hasher.update(&(tasks.len() as u64).to_le_bytes());
        for task in tasks {
            hasher.update(&(task.input_count as u64).to_le_bytes());
            hasher.update(&(task.output_count as u64).to_le_bytes());
            hasher.update(&task.func_id.to_le_bytes());
            hasher.update(&task.resource_type.to_le_bytes());
        }

        hasher.update(&(connections.len() as u64).to_le_bytes());
        for c in connections {
            hasher.update(&(c.from.task as u64).to_le_bytes());
            hasher.update(&(c.from.port as u64).to_le_bytes());
            hasher.update(&(c.to.task as u64).to_le_bytes());
            hasher.update(&(c.to.port as u64).to_le_bytes());
        }

        Fingerprint(hasher.finalize().into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for byte in self.0 {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

#[derive(Debug, Clone)]
pub struct TaskGraph {
    pub(crate) tasks: Vec<TaskInfo>,
    pub(crate) connections: Vec<Connection>,
    /// All values, free inputs and outputs alike.
    pub(crate) data: Vec<Option<Dynamic>>,
    /// Each element is an index into `data`.
    pub(crate) data_map: Vec<usize>,
    pub(crate) fingerprint: Fingerprint,
}

impl TaskGraph {
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id).map(|info| &info.task)
    }

    pub fn task_info(&self) -> &[TaskInfo] {
        &self.tasks
    }

    pub fn connections(&self) -> &[Connection] {
        &self.connections
    }

    /// Number of distinct value cells in the store.
    pub fn cell_count(&self) -> usize {
        self.data.len()
    }

    pub fn total_output_count(&self) -> usize {
        self.tasks.iter().map(|info| info.task.output_count).sum()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Store index of the cell behind an input port.
    pub fn input_cell(&self, task: TaskId, port: usize) -> Result<usize, ConfigError> {
        let info = self.tasks.get(task).ok_or(ConfigError::NoSuchPort(task, port))?;
        if port >= info.task.input_count {
            return Err(ConfigError::NoSuchPort(task, port));
        }
        Ok(self.data_map[info.input_index + port])
    }

    /// Store index of the cell behind an output port.
    pub fn output_cell(&self, task: TaskId, port: usize) -> Result<usize, ConfigError> {
        let info = self.tasks.get(task).ok_or(ConfigError::NoSuchPort(task, port))?;
        if port >= info.task.output_count {
            return Err(ConfigError::NoSuchPort(task, port));
        }
        Ok(self.data_map[info.output_index + port])
    }

    /// Current value seen by an input port, connected or not.
    pub fn input(&self, task: TaskId, port: usize) -> Result<Option<&Dynamic>, ConfigError> {
        let cell = self.input_cell(task, port)?;
        Ok(self.data[cell].as_ref())
    }

    /// Writes the value of an input port. Meant for free inputs; writing to a
    /// connected input overwrites the upstream output it aliases.
    pub fn set_input<T>(&mut self, task: TaskId, port: usize, value: T) -> Result<(), ConfigError>
    where
        T: Send + Sync + 'static,
    {
        self.set_input_dynamic(task, port, Dynamic::new(value))
    }

    pub fn set_input_dynamic(
        &mut self,
        task: TaskId,
        port: usize,
        value: Dynamic,
    ) -> Result<(), ConfigError> {
        let cell = self.input_cell(task, port)?;
        self.data[cell] = Some(value);
        Ok(())
    }

    pub fn output(&self, task: TaskId, port: usize) -> Result<Option<&Dynamic>, ConfigError> {
        let cell = self.output_cell(task, port)?;
        Ok(self.data[cell].as_ref())
    }

    /// Clears every output cell, leaving free inputs untouched.
    pub fn clear_outputs(&mut self) {
        for info in &self.tasks {
            for port in 0..info.task.output_count {
                self.data[self.data_map[info.output_index + port]] = None;
            }
        }
    }

    /// Input ports that have no incoming connection and must be supplied by
    /// the caller.
    pub fn free_inputs(&self) -> Vec<InputEndPoint> {
        let connected: std::collections::HashSet<InputEndPoint> =
            self.connections.iter().map(|c| c.to).collect();

        self.tasks
            .iter()
            .enumerate()
            .flat_map(|(task, info)| {
                (0..info.task.input_count).map(move |port| InputEndPoint { task, port })
            })
            .filter(|input| !connected.contains(input))
            .collect()
    }
}
