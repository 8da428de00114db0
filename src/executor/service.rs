use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use anyhow::{Context, bail};
use tungstenite::handshake::HandshakeError;

use crate::config::ServiceConfig;
use crate::core::{Dynamic, LocalData, Task};
use crate::error::{EngineError, RemoteError};
use crate::func::{TaskFuncRegistry, TaskState};
use crate::sync::{CancelController, lock};
use crate::wire::{CodecRegistry, Request, Response, RunId, transport};

use super::invoke;

/// Runs tasks on behalf of [`RemoteTaskExecutor`](super::RemoteTaskExecutor)s
/// connecting over WebSocket.
///
/// Every connection gets its own thread, but task runs are serialized on one
/// [`LocalData`] value, so the service behaves like a single executor.
///
/// A cancel request names the run it is meant for and normally arrives on a
/// second connection while that run is in progress. It sets the service's
/// cancel flag only while the named run is executing; a run still waiting
/// for its turn starts out cancelled instead. The interrupted run answers
/// with no outputs. Cancels for runs that already finished are ignored, and
/// the flag is cleared whenever a run begins, so a cancel never leaks into
/// an unrelated run.
pub struct RemoteExecutorService {
    registry: Arc<TaskFuncRegistry>,
    codecs: Arc<CodecRegistry>,
    controller: CancelController,
    local: LocalData,
    shared: Dynamic,
}

impl RemoteExecutorService {
    pub fn new(registry: Arc<TaskFuncRegistry>, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            registry,
            codecs,
            controller: CancelController::new(),
            local: LocalData::default(),
            shared: Dynamic::new(()),
        }
    }

    /// Value handed to stateful functions as their mutable local state.
    pub fn with_local<T: Send + 'static>(mut self, value: T) -> Self {
        self.local = LocalData::new(value);
        self
    }

    pub fn with_shared_data(mut self, shared: Dynamic) -> Self {
        self.shared = shared;
        self
    }

    /// The flag task functions on this service observe. It is reset at the
    /// start of every run.
    pub fn controller(&self) -> &CancelController {
        &self.controller
    }

    /// Binds to `config.address` and serves on a background thread.
    pub fn listen(self, config: &ServiceConfig) -> Result<ServiceHandle, EngineError> {
        self.bind(config.address.as_str())
    }

    pub fn bind(self, address: impl ToSocketAddrs) -> Result<ServiceHandle, EngineError> {
        let listener = TcpListener::bind(address)?;
        let local_addr = listener.local_addr()?;
        let controller = self.controller.clone();
        let handler = Arc::new(Handler::from(self));

        let thread = std::thread::Builder::new()
            .name(String::from("taskflow-service"))
            .spawn(move || accept_loop(listener, handler))?;

        tracing::info!(%local_addr, "remote executor service listening");

        Ok(ServiceHandle {
            local_addr,
            controller,
            thread,
        })
    }

    /// Serves connections from `listener` on the calling thread. Only
    /// returns if the listener stops yielding connections.
    pub fn serve(self, listener: TcpListener) {
        accept_loop(listener, Arc::new(Handler::from(self)));
    }
}

/// A service running on a background thread.
pub struct ServiceHandle {
    local_addr: SocketAddr,
    controller: CancelController,
    thread: JoinHandle<()>,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn controller(&self) -> &CancelController {
        &self.controller
    }

    /// Blocks for as long as the service runs.
    pub fn join(self) -> Result<(), EngineError> {
        self.thread.join().map_err(|_| EngineError::WorkerGone)
    }
}

/// Cancels remembered for runs whose request has not arrived yet.
const EARLY_CANCELS: usize = 64;

#[derive(Default)]
struct Runs {
    current: Option<RunId>,
    /// Received runs waiting for the local value, and whether a cancel
    /// already came in for them.
    waiting: HashMap<RunId, bool>,
    early: VecDeque<RunId>,
}

struct Handler {
    registry: Arc<TaskFuncRegistry>,
    codecs: Arc<CodecRegistry>,
    controller: CancelController,
    local: Mutex<LocalData>,
    shared: Dynamic,
    runs: Mutex<Runs>,
}

impl From<RemoteExecutorService> for Handler {
    fn from(service: RemoteExecutorService) -> Self {
        Self {
            registry: service.registry,
            codecs: service.codecs,
            controller: service.controller,
            local: Mutex::new(service.local),
            shared: service.shared,
            runs: Mutex::new(Runs::default()),
        }
    }
}

impl Handler {
    fn handle(&self, request: Request) -> Response {
        match request {
            Request::Run { run, task, inputs } => match self.run(run, &task, &inputs) {
                Ok(outputs) => Response::Run { outputs },
                Err(e) => {
                    tracing::error!(run, func = task.func_id, "remote task failed: {e}");
                    Response::Error {
                        message: e.to_string(),
                    }
                }
            },
            Request::Cancel { run } => {
                self.cancel(run);
                Response::Ack
            }
        }
    }

    fn cancel(&self, run: RunId) {
        let mut runs = lock(&self.runs);

        if runs.current == Some(run) {
            tracing::debug!(run, "cancel requested");
            self.controller.cancel();
        } else if let Some(cancelled) = runs.waiting.get_mut(&run) {
            *cancelled = true;
        } else {
            // Either finished already or the run request is still in transit.
            if runs.early.len() == EARLY_CANCELS {
                runs.early.pop_front();
            }
            runs.early.push_back(run);
        }
    }

    fn run(&self, run: RunId, task: &Task, inputs: &[String]) -> anyhow::Result<Vec<String>> {
        let codec = self.codecs.get(task.func_id)?;

        if inputs.len() != task.input_count {
            bail!("Expected {} inputs, got {}", task.input_count, inputs.len());
        }

        let inputs = inputs
            .iter()
            .enumerate()
            .map(|(i, text)| codec.decode(text).with_context(|| format!("Input {i}")))
            .collect::<anyhow::Result<Vec<_>>>()?;

        {
            let mut runs = lock(&self.runs);
            let position = runs.early.iter().position(|r| *r == run);
            let cancelled = position.and_then(|i| runs.early.remove(i)).is_some();
            runs.waiting.insert(run, cancelled);
        }

        let (outcome, cancelled) = {
            let mut local = lock(&self.local);
            self.begin(run);
            let outcome = {
                let mut state = TaskState::new(&mut local, &self.shared);
                invoke(0, task, &self.registry, &inputs, &mut state, &self.controller.checker())
            };
            (outcome, self.finish())
        };

        if cancelled {
            tracing::debug!(run, "run cancelled");
            return Ok(Vec::new());
        }

        outcome?
            .iter()
            .enumerate()
            .map(|(i, value)| match value {
                Some(value) => codec.encode(value),
                None => bail!("Output {i} was not set"),
            })
            .collect()
    }

    /// Makes `run` the current one. Must be called with the local value
    /// locked.
    fn begin(&self, run: RunId) {
        let mut runs = lock(&self.runs);
        let cancelled = runs.waiting.remove(&run).unwrap_or(false);

        self.controller.resume();
        runs.current = Some(run);
        if cancelled {
            self.controller.cancel();
        }
    }

    /// Ends the current run and reports whether it was cancelled.
    fn finish(&self) -> bool {
        let mut runs = lock(&self.runs);
        runs.current = None;

        let cancelled = self.controller.is_cancelled();
        self.controller.resume();
        cancelled
    }
}

fn accept_loop(listener: TcpListener, handler: Arc<Handler>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!("couldn't accept connection: {e}");
                continue;
            }
        };

        let handler = handler.clone();
        std::thread::spawn(move || {
            let peer = stream.peer_addr().ok();
            if let Err(e) = serve_connection(&handler, stream) {
                tracing::warn!(?peer, "connection closed: {e}");
            }
        });
    }
}

fn serve_connection(handler: &Handler, stream: TcpStream) -> Result<(), RemoteError> {
    let mut socket = match tungstenite::accept(stream) {
        Ok(socket) => socket,
        Err(HandshakeError::Failure(e)) => return Err(e.into()),
        Err(HandshakeError::Interrupted(_)) => {
            return Err(tungstenite::Error::Io(std::io::ErrorKind::WouldBlock.into()).into());
        }
    };

    while let Some(request) = transport::recv::<_, Request>(&mut socket)? {
        let response = handler.handle(request);
        transport::send(&mut socket, &response)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::func::TaskFunc;
    use crate::wire::Codec;

    fn handler() -> Handler {
        let mut funcs = TaskFuncRegistry::new();
        funcs
            .register(1, TaskFunc::typed(|a: i64, b: i64| a * b))
            .register(
                2,
                TaskFunc::stateful(|state, out, _| {
                    let calls = state.local::<u32>()?;
                    *calls += 1;
                    out[0] = Some(Dynamic::new(*calls));
                    Ok(())
                }),
            )
            .register(
                3,
                TaskFunc::cancellable(|_, out, _, cancel| {
                    if !cancel.is_cancelled() {
                        out[0] = Some(Dynamic::new(1u32));
                    }
                    Ok(())
                }),
            );

        let mut codecs = CodecRegistry::new();
        codecs
            .register(1, Codec::display_parse::<i64>())
            .register(2, Codec::display_parse::<u32>())
            .register(3, Codec::display_parse::<u32>());

        let service = RemoteExecutorService::new(Arc::new(funcs), Arc::new(codecs)).with_local(0u32);
        Handler::from(service)
    }

    fn run(id: RunId, func: i32, inputs: &[&str]) -> Request {
        Request::Run {
            run: id,
            task: Task::new(inputs.len(), 1, func, 0),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_run_decodes_and_encodes() {
        let handler = handler();
        assert_eq!(
            handler.handle(run(1, 1, &["6", "7"])),
            Response::Run {
                outputs: vec!["42".into()]
            }
        );
    }

    #[test]
    fn test_local_state_is_kept() {
        let handler = handler();
        handler.handle(run(1, 2, &[]));
        assert_eq!(
            handler.handle(run(2, 2, &[])),
            Response::Run {
                outputs: vec!["2".into()]
            }
        );
    }

    #[test]
    fn test_cancel_ahead_of_run_is_applied_to_it() {
        let handler = handler();
        assert_eq!(handler.handle(Request::Cancel { run: 7 }), Response::Ack);

        assert_eq!(handler.handle(run(7, 3, &[])), Response::Run { outputs: vec![] });
        assert!(!handler.controller.is_cancelled());

        assert_eq!(
            handler.handle(run(8, 3, &[])),
            Response::Run {
                outputs: vec!["1".into()]
            }
        );
    }

    #[test]
    fn test_late_cancel_does_not_affect_next_run() {
        let handler = handler();
        assert_eq!(
            handler.handle(run(1, 3, &[])),
            Response::Run {
                outputs: vec!["1".into()]
            }
        );

        // Arrives after run 1 has already answered.
        assert_eq!(handler.handle(Request::Cancel { run: 1 }), Response::Ack);
        assert!(!handler.controller.is_cancelled());

        assert_eq!(
            handler.handle(run(2, 3, &[])),
            Response::Run {
                outputs: vec!["1".into()]
            }
        );
    }

    #[test]
    fn test_stale_flag_is_cleared_when_run_begins() {
        let handler = handler();
        handler.controller.cancel();

        assert_eq!(
            handler.handle(run(1, 3, &[])),
            Response::Run {
                outputs: vec!["1".into()]
            }
        );
    }

    #[test]
    fn test_cancel_during_run() {
        let mut funcs = TaskFuncRegistry::new();
        funcs.register(
            4,
            TaskFunc::cancellable(|_, out, _, cancel| {
                for _ in 0..500 {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                out[0] = Some(Dynamic::new(1u32));
                Ok(())
            }),
        );
        let mut codecs = CodecRegistry::new();
        codecs.register(4, Codec::display_parse::<u32>());

        let handler = Arc::new(Handler::from(RemoteExecutorService::new(
            Arc::new(funcs),
            Arc::new(codecs),
        )));

        let running = {
            let handler = handler.clone();
            std::thread::spawn(move || handler.handle(run(5, 4, &[])))
        };

        while lock(&handler.runs).current != Some(5) {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        handler.handle(Request::Cancel { run: 6 });
        assert!(!handler.controller.is_cancelled());
        handler.handle(Request::Cancel { run: 5 });

        assert_eq!(running.join().unwrap(), Response::Run { outputs: vec![] });
        assert!(!handler.controller.is_cancelled());
        assert!(lock(&handler.runs).current.is_none());
    }

    #[test]
    fn test_errors_become_error_responses() {
        let handler = handler();

        let Response::Error { message } = handler.handle(run(1, 9, &[])) else {
            panic!("expected an error response");
        };
        assert!(message.contains("No codec"));

        let Response::Error { message } = handler.handle(run(2, 1, &["6", "x"])) else {
            panic!("expected an error response");
        };
        assert!(message.contains("Input 1"));

        let Response::Error { message } = handler.handle(run(3, 1, &["6"])) else {
            panic!("expected an error response");
        };
        assert!(message.contains("Expected 2 inputs, got 1"));
    }
}
