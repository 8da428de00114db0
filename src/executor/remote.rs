use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use tungstenite::WebSocket;
use tungstenite::handshake::HandshakeError;

use crate::config::RemoteConfig;
use crate::core::{Dynamic, ResourceType, Task};
use crate::error::{EngineError, RemoteError};
use crate::sync::ThreadNotifier;
use crate::wire::{Codec, CodecRegistry, Request, Response, RunId, transport};

use super::worker::{Job, Worker};
use super::{Outcome, StartParam, TaskExecutor};

/// Forwards tasks to a [`RemoteExecutorService`](super::RemoteExecutorService)
/// in another process.
///
/// Inputs and outputs are converted with the codec registered for the task's
/// function id. The connection is opened on first use and kept for later
/// tasks. While a request is waiting for its reply, cancelling the task's
/// checker sends a cancel for that request to the worker, from a separate
/// thread and over a separate connection.
///
/// A transport or protocol failure is final: every task started afterwards
/// fails with [`RemoteError::Dead`].
pub struct RemoteTaskExecutor {
    resource_type: ResourceType,
    config: RemoteConfig,
    worker: Worker,
}

impl RemoteTaskExecutor {
    pub fn new(resource_type: ResourceType, config: RemoteConfig, codecs: Arc<CodecRegistry>) -> Self {
        let name = format!("taskflow-remote-{resource_type}");
        let worker = {
            let config = config.clone();
            Worker::spawn(name, move || {
                let mut client = Client::new(config, codecs);
                move |job: Job| client.run(job)
            })
        };

        Self {
            resource_type,
            config,
            worker,
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }
}

impl TaskExecutor for RemoteTaskExecutor {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    fn start(&mut self, param: StartParam) {
        self.worker.submit(param, Dynamic::new(()));
    }

    fn propagate_cb(&mut self) -> Option<Outcome> {
        self.worker.poll()
    }

    fn set_task_completion_notifier(&mut self, notifier: Arc<ThreadNotifier>) {
        self.worker.set_completion_notifier(notifier);
    }

    fn is_busy(&self) -> bool {
        self.worker.is_busy()
    }
}

impl std::fmt::Debug for RemoteTaskExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTaskExecutor")
            .field("resource_type", &self.resource_type)
            .field("address", &self.config.address)
            .finish()
    }
}

/// Connection state living on the executor's worker thread.
struct Client {
    config: RemoteConfig,
    codecs: Arc<CodecRegistry>,
    socket: Option<WebSocket<TcpStream>>,
    dead: bool,
}

impl Client {
    fn new(config: RemoteConfig, codecs: Arc<CodecRegistry>) -> Self {
        Self {
            config,
            codecs,
            socket: None,
            dead: false,
        }
    }

    fn run(&mut self, job: Job) -> Outcome {
        if self.dead {
            return Err(RemoteError::Dead.into());
        }

        let codec = self.codecs.get(job.task.func_id)?.clone();
        let inputs = job
            .inputs
            .iter()
            .map(|value| codec.encode(value))
            .collect::<anyhow::Result<Vec<_>>>()
            .map_err(RemoteError::Codec)?;

        let run = next_run_id();
        let subscription = {
            let config = self.config.clone();
            job.cancel.on_cancelled(move || forward_cancel(config.clone(), run))
        };

        if job.cancel.is_cancelled() {
            job.cancel.unsubscribe(subscription);
            return Ok(vec![None; job.task.output_count]);
        }

        let request = Request::Run {
            run,
            task: job.task,
            inputs,
        };

        tracing::debug!(task = job.id, run, address = %self.config.address, "sending task");
        let response = self.call(&request);
        job.cancel.unsubscribe(subscription);

        let outputs = match response {
            Ok(Response::Run { outputs }) => outputs,
            Ok(Response::Error { message }) => return Err(RemoteError::Server(message).into()),
            Ok(Response::Ack) => return self.fail(RemoteError::Server("Unexpected acknowledgement".into())),
            Err(e) => return self.fail(e),
        };

        match decode_outputs(&job.task, &codec, &outputs) {
            Ok(outputs) => Ok(outputs),
            Err(e @ RemoteError::OutputCount { .. }) => self.fail(e),
            Err(e) => Err(e.into()),
        }
    }

    fn call(&mut self, request: &Request) -> Result<Response, RemoteError> {
        if self.socket.is_none() {
            self.socket = Some(connect(&self.config)?);
        }
        let socket = self.socket.as_mut().ok_or(RemoteError::Dead)?;

        transport::send(socket, request)?;
        transport::recv(socket)?.ok_or(RemoteError::Transport(tungstenite::Error::ConnectionClosed))
    }

    fn fail(&mut self, error: RemoteError) -> Outcome {
        tracing::error!(address = %self.config.address, "remote executor failed: {error}");
        self.dead = true;
        self.socket = None;
        Err(EngineError::Remote(error))
    }
}

fn decode_outputs(task: &Task, codec: &Codec, outputs: &[String]) -> Result<Vec<Option<Dynamic>>, RemoteError> {
    // A cancelled run answers with no outputs at all.
    if outputs.is_empty() {
        return Ok(vec![None; task.output_count]);
    }

    if outputs.len() != task.output_count {
        return Err(RemoteError::OutputCount {
            expected: task.output_count,
            found: outputs.len(),
        });
    }

    outputs
        .iter()
        .map(|text| codec.decode(text).map(Some))
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(RemoteError::Codec)
}

pub(crate) fn connect(config: &RemoteConfig) -> Result<WebSocket<TcpStream>, RemoteError> {
    let addr = config
        .address
        .to_socket_addrs()
        .map_err(tungstenite::Error::Io)?
        .next()
        .ok_or_else(|| {
            let e = io::Error::new(io::ErrorKind::NotFound, format!("Couldn't resolve {}", config.address));
            tungstenite::Error::Io(e)
        })?;

    let stream = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(tungstenite::Error::Io)?;
    stream.set_nodelay(true).map_err(tungstenite::Error::Io)?;
    // A peer that accepts but never answers must not hang the handshake.
    stream
        .set_read_timeout(Some(config.connect_timeout))
        .map_err(tungstenite::Error::Io)?;

    let url = config.url();
    match tungstenite::client::client(url.as_str(), stream) {
        Ok((socket, _)) => {
            socket.get_ref().set_read_timeout(None).map_err(tungstenite::Error::Io)?;
            Ok(socket)
        }
        Err(HandshakeError::Failure(e)) => Err(e.into()),
        Err(HandshakeError::Interrupted(_)) => {
            Err(tungstenite::Error::Io(io::ErrorKind::WouldBlock.into()).into())
        }
    }
}

/// Request ids start at a per-process value derived from the process id and
/// the start time, so that two clients of one worker are unlikely to share
/// an id.
fn next_run_id() -> RunId {
    static NEXT: OnceLock<AtomicU64> = OnceLock::new();

    NEXT.get_or_init(|| {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(&std::process::id().to_le_bytes());
        hasher.update(&now.as_nanos().to_le_bytes());

        let mut seed = [0u8; 8];
        seed.copy_from_slice(&hasher.finalize().as_bytes()[..8]);
        AtomicU64::new(u64::from_le_bytes(seed))
    })
    .fetch_add(1, Ordering::Relaxed)
}

/// Sends the cancel from a short-lived thread, so the thread setting the
/// flag never waits on the network.
fn forward_cancel(config: RemoteConfig, run: RunId) {
    let spawned = std::thread::Builder::new()
        .name(String::from("taskflow-cancel"))
        .spawn(move || send_cancel(&config, run));

    if let Err(e) = spawned {
        tracing::warn!(run, "couldn't spawn cancel thread: {e}");
    }
}

fn send_cancel(config: &RemoteConfig, run: RunId) {
    let result = connect(config).and_then(|mut socket| {
        transport::send(&mut socket, &Request::Cancel { run })?;
        let response = transport::recv::<_, Response>(&mut socket)?;
        let _ = socket.close(None);
        match response {
            Some(Response::Ack) => Ok(()),
            Some(Response::Error { message }) => Err(RemoteError::Server(message)),
            _ => Err(RemoteError::Server("Cancel was not acknowledged".into())),
        }
    });

    if let Err(e) = result {
        tracing::warn!(run, address = %config.address, "couldn't forward cancellation: {e}");
    }
}
