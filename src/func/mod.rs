//! Task functions and the registry they are looked up in.
//!
//! Every task function follows one calling convention: it receives a slice of
//! output slots to fill and a slice of input values to read, both
//! type-erased. On top of that a function declares one of three capabilities,
//! and the executor supplies the matching extra parameters:
//!
//! * **Stateless** functions get only outputs and inputs.
//! * **Stateful** functions also get a [`TaskState`]: the executor's own
//!   mutable value and a read-only value shared by its whole pool.
//! * **Cancellable** functions additionally get a [`Checker`] they are
//!   expected to poll during long work, returning early (and leaving their
//!   outputs untouched) once it is set.
//!
//! Strongly-typed closures can be wrapped with [`TaskFunc::typed`], which
//! checks every input's type at call time.

pub mod adapter;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Dynamic, FuncId, LocalData};
use crate::error::{ConfigError, TypeMismatch};
use crate::sync::Checker;

pub use adapter::TypedFunc;

type StatelessFn = dyn Fn(&mut [Option<Dynamic>], &[Dynamic]) -> anyhow::Result<()> + Send + Sync;

type StatefulFn = dyn Fn(&mut TaskState<'_>, &mut [Option<Dynamic>], &[Dynamic]) -> anyhow::Result<()>
    + Send
    + Sync;

type CancellableFn = dyn Fn(&mut TaskState<'_>, &mut [Option<Dynamic>], &[Dynamic], &Checker) -> anyhow::Result<()>
    + Send
    + Sync;

/// What a task function expects to be handed besides its inputs and outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Stateless,
    Stateful,
    Cancellable,
}

/// Per-call view of the state an executor owns on behalf of its functions.
///
/// Both references are valid only for the duration of one call.
pub struct TaskState<'a> {
    local: &'a mut LocalData,
    shared: &'a Dynamic,
}

impl<'a> TaskState<'a> {
    pub fn new(local: &'a mut LocalData, shared: &'a Dynamic) -> Self {
        Self { local, shared }
    }

    /// The executor's persistent mutable value.
    pub fn local<T: 'static>(&mut self) -> Result<&mut T, TypeMismatch> {
        self.local.downcast_mut::<T>()
    }

    /// The read-only value shared by the executor's pool.
    pub fn shared<T: 'static>(&self) -> Result<&T, TypeMismatch> {
        self.shared.downcast_ref::<T>()
    }
}

#[derive(Clone)]
pub enum TaskFunc {
    Stateless(Arc<StatelessFn>),
    Stateful(Arc<StatefulFn>),
    Cancellable(Arc<CancellableFn>),
}

impl TaskFunc {
    pub fn stateless<F>(func: F) -> Self
    where
        F: Fn(&mut [Option<Dynamic>], &[Dynamic]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        TaskFunc::Stateless(Arc::new(func))
    }

    pub fn stateful<F>(func: F) -> Self
    where
        F: Fn(&mut TaskState<'_>, &mut [Option<Dynamic>], &[Dynamic]) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        TaskFunc::Stateful(Arc::new(func))
    }

    pub fn cancellable<F>(func: F) -> Self
    where
        F: Fn(&mut TaskState<'_>, &mut [Option<Dynamic>], &[Dynamic], &Checker) -> anyhow::Result<()>
            + Send
            + Sync
            + 'static,
    {
        TaskFunc::Cancellable(Arc::new(func))
    }

    /// Wraps a plain typed function such as `|a: i32, b: i32| a + b` into a
    /// stateless task function. Inputs are downcast and cloned on every call;
    /// the return value becomes output 0.
    pub fn typed<Args, F>(func: F) -> Self
    where
        F: TypedFunc<Args>,
    {
        TaskFunc::Stateless(Arc::new(move |outputs, inputs| {
            func.call_erased(outputs, inputs)
        }))
    }

    pub fn capability(&self) -> Capability {
        match self {
            TaskFunc::Stateless(_) => Capability::Stateless,
            TaskFunc::Stateful(_) => Capability::Stateful,
            TaskFunc::Cancellable(_) => Capability::Cancellable,
        }
    }

    /// Invokes the function, supplying only the parameters its capability
    /// asks for.
    pub fn call(
        &self,
        outputs: &mut [Option<Dynamic>],
        inputs: &[Dynamic],
        state: &mut TaskState<'_>,
        cancel: &Checker,
    ) -> anyhow::Result<()> {
        match self {
            TaskFunc::Stateless(func) => func(outputs, inputs),
            TaskFunc::Stateful(func) => func(state, outputs, inputs),
            TaskFunc::Cancellable(func) => func(state, outputs, inputs, cancel),
        }
    }
}

impl std::fmt::Debug for TaskFunc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TaskFunc::{:?}", self.capability())
    }
}

/// Maps function ids to task functions.
#[derive(Debug, Clone, Default)]
pub struct TaskFuncRegistry {
    funcs: HashMap<FuncId, TaskFunc>,
}

impl TaskFuncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: FuncId, func: TaskFunc) -> &mut Self {
        if self.funcs.insert(id, func).is_some() {
            tracing::warn!(func = id, "task function replaced");
        }
        self
    }

    pub fn get(&self, id: FuncId) -> Result<&TaskFunc, ConfigError> {
        self.funcs.get(&id).ok_or(ConfigError::UnknownFunction(id))
    }

    pub fn contains(&self, id: FuncId) -> bool {
        self.funcs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}
