use thiserror::Error;

use crate::core::{FuncId, InputEndPoint, OutputEndPoint, ResourceType, TaskId};

pub use anyhow::Error as RuntimeError;

/// Problems with the shape of a graph or with the resources supplied to run
/// it. These are detected at build or start time and are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid connection {from:?} -> {to:?}")]
    InvalidConnection {
        from: OutputEndPoint,
        to: InputEndPoint,
    },

    #[error("Task {0} has no port {1}")]
    NoSuchPort(TaskId, usize),

    #[error("Multiple connections to the same input port {0:?}")]
    DuplicateInput(InputEndPoint),

    #[error("Cycle detected in task graph at task {0}")]
    CycleDetected(TaskId),

    #[error("Unknown task function id {0}")]
    UnknownFunction(FuncId),

    #[error("No codec registered for task function id {0}")]
    MissingCodec(FuncId),

    #[error("No executors registered for resource type {0}")]
    NoResource(ResourceType),

    #[error("Input {0:?} has no value")]
    UnsetInput(InputEndPoint),

    #[error("Cache was built for a different task graph topology")]
    CacheMismatch,

    #[error("Executor is already running a task graph")]
    AlreadyRunning,
}

/// Raised when a type-erased slot holds a value of another type than the one
/// requested.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Expected value of type {expected}, found {found}")]
pub struct TypeMismatch {
    pub expected: &'static str,
    pub found: &'static str,
}

#[cfg(feature = "remote")]
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Transport failure:\n{0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Couldn't encode or decode value:\n{0}")]
    Codec(anyhow::Error),

    #[error("Malformed message:\n{0}")]
    Protocol(#[from] serde_json::Error),

    #[error("Remote worker reported an error: {0}")]
    Server(String),

    #[error("Remote worker returned {found} outputs, expected {expected}")]
    OutputCount { expected: usize, found: usize },

    #[error("Remote executor is no longer usable after a previous failure")]
    Dead,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatch),

    #[error("Task {task} (function {func}):\n{source}")]
    Task {
        task: TaskId,
        func: FuncId,
        source: anyhow::Error,
    },

    #[cfg(feature = "remote")]
    #[error("Remote execution failed:\n{0}")]
    Remote(#[from] RemoteError),

    #[error("Worker thread is gone")]
    WorkerGone,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Returns the `ConfigError` behind this error, if that is what it is.
    pub fn as_config(&self) -> Option<&ConfigError> {
        match self {
            EngineError::Config(err) => Some(err),
            _ => None,
        }
    }
}
