use std::any::{Any, type_name};
use std::fmt::Debug;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TypeMismatch;

/// Index of a task in the order it was added to a builder.
pub type TaskId = usize;

/// Key of a task function in a [`TaskFuncRegistry`](crate::TaskFuncRegistry).
pub type FuncId = i32;

/// Label of the worker pool a task has to run on.
pub type ResourceType = i32;

/// A scheduling unit with fixed input/output arity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Task {
    pub input_count: usize,
    pub output_count: usize,
    pub func_id: FuncId,
    pub resource_type: ResourceType,
}

impl Task {
    pub fn new(input_count: usize, output_count: usize, func_id: FuncId, resource_type: ResourceType) -> Self {
        Self {
            input_count,
            output_count,
            func_id,
            resource_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputEndPoint {
    pub task: TaskId,
    pub port: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputEndPoint {
    pub task: TaskId,
    pub port: usize,
}

/// An edge from one task's output port to another task's input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Connection {
    pub from: OutputEndPoint,
    pub to: InputEndPoint,
}

/// A type-erased, thread-safe container for task payload data.
///
/// Cloning only bumps a reference count, which is how connected ports share
/// a value instead of copying it. Recovering the concrete type is checked:
/// asking for the wrong type yields a [`TypeMismatch`] instead of garbage.
#[derive(Clone)]
pub struct Dynamic {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Dynamic {
    pub fn new<T>(value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        Self {
            value: Arc::new(value),
            type_name: type_name::<T>(),
        }
    }

    /// Name of the concrete type stored inside.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.value.is::<T>()
    }

    pub fn downcast_ref<T: 'static>(&self) -> Result<&T, TypeMismatch> {
        self.value.downcast_ref::<T>().ok_or(TypeMismatch {
            expected: type_name::<T>(),
            found: self.type_name,
        })
    }
}

impl Debug for Dynamic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Dynamic({})", self.type_name)
    }
}

/// The mutable per-executor value handed to stateful task functions.
///
/// It lives as long as the executor that owns it and is reused across every
/// task that executor runs.
pub struct LocalData {
    value: Box<dyn Any + Send>,
    type_name: &'static str,
}

impl LocalData {
    pub fn new<T>(value: T) -> Self
    where
        T: Send + 'static,
    {
        Self {
            value: Box::new(value),
            type_name: type_name::<T>(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: 'static>(&self) -> Result<&T, TypeMismatch> {
        self.value.downcast_ref::<T>().ok_or(TypeMismatch {
            expected: type_name::<T>(),
            found: self.type_name,
        })
    }

    pub fn downcast_mut<T: 'static>(&mut self) -> Result<&mut T, TypeMismatch> {
        let found = self.type_name;
        self.value.downcast_mut::<T>().ok_or(TypeMismatch {
            expected: type_name::<T>(),
            found,
        })
    }
}

impl Default for LocalData {
    fn default() -> Self {
        Self::new(())
    }
}

impl Debug for LocalData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LocalData({})", self.type_name)
    }
}
