//! Value codecs and the messages exchanged with remote workers.
//!
//! Values cross process boundaries as strings. Which codec applies is
//! decided by the task's function id: every input and output of a function
//! is encoded with the codec registered under that id.
//!
//! Messages are JSON text frames on a WebSocket, one request answered by one
//! response on the same connection.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::{Dynamic, FuncId, Task};
use crate::error::ConfigError;

type EncodeFn = dyn Fn(&Dynamic) -> anyhow::Result<String> + Send + Sync;
type DecodeFn = dyn Fn(&str) -> anyhow::Result<Dynamic> + Send + Sync;

/// A pair of conversions between a [`Dynamic`] and its string form.
#[derive(Clone)]
pub struct Codec {
    encode: Arc<EncodeFn>,
    decode: Arc<DecodeFn>,
}

impl Codec {
    pub fn new<E, D>(encode: E, decode: D) -> Self
    where
        E: Fn(&Dynamic) -> anyhow::Result<String> + Send + Sync + 'static,
        D: Fn(&str) -> anyhow::Result<Dynamic> + Send + Sync + 'static,
    {
        Self {
            encode: Arc::new(encode),
            decode: Arc::new(decode),
        }
    }

    /// Codec for `T` through its `Display` and `FromStr` implementations.
    pub fn display_parse<T>() -> Self
    where
        T: Display + FromStr + Send + Sync + 'static,
        T::Err: std::error::Error + Send + Sync + 'static,
    {
        Self::new(
            |value| Ok(value.downcast_ref::<T>()?.to_string()),
            |text| {
                let value = text
                    .parse::<T>()
                    .with_context(|| format!("Couldn't parse {text:?}"))?;
                Ok(Dynamic::new(value))
            },
        )
    }

    /// Codec for `T` through its serde implementations, as JSON.
    pub fn json<T>() -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Self::new(
            |value| Ok(serde_json::to_string(value.downcast_ref::<T>()?)?),
            |text| Ok(Dynamic::new(serde_json::from_str::<T>(text)?)),
        )
    }

    pub fn encode(&self, value: &Dynamic) -> anyhow::Result<String> {
        (self.encode)(value)
    }

    pub fn decode(&self, text: &str) -> anyhow::Result<Dynamic> {
        (self.decode)(text)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Codec")
    }
}

#[derive(Debug, Clone, Default)]
pub struct CodecRegistry {
    codecs: HashMap<FuncId, Codec>,
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: FuncId, codec: Codec) -> &mut Self {
        self.codecs.insert(id, codec);
        self
    }

    pub fn get(&self, id: FuncId) -> Result<&Codec, ConfigError> {
        self.codecs.get(&id).ok_or(ConfigError::MissingCodec(id))
    }

    pub fn contains(&self, id: FuncId) -> bool {
        self.codecs.contains_key(&id)
    }
}

/// Identifies one `Run` request, so that a cancel can name the run it is
/// meant for. Chosen by the client and never reused.
pub type RunId = u64;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    /// Run one task with string-encoded inputs.
    Run {
        run: RunId,
        task: Task,
        inputs: Vec<String>,
    },
    /// Ask the worker to cancel `run` if it has not finished yet.
    Cancel { run: RunId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    /// String-encoded outputs. Empty when the run was cancelled.
    Run { outputs: Vec<String> },
    Ack,
    Error { message: String },
}

#[cfg(feature = "remote")]
pub(crate) mod transport {
    use std::io::{Read, Write};

    use serde::Serialize;
    use serde::de::DeserializeOwned;
    use tungstenite::{Message, WebSocket};

    use crate::error::RemoteError;

    pub fn send<S, T>(socket: &mut WebSocket<S>, message: &T) -> Result<(), RemoteError>
    where
        S: Read + Write,
        T: Serialize,
    {
        let text = serde_json::to_string(message)?;
        socket.send(Message::text(text))?;
        Ok(())
    }

    /// Reads the next data frame. Returns `None` once the peer closed the
    /// connection.
    pub fn recv<S, T>(socket: &mut WebSocket<S>) -> Result<Option<T>, RemoteError>
    where
        S: Read + Write,
        T: DeserializeOwned,
    {
        loop {
            match socket.read() {
                Ok(Message::Text(text)) => return Ok(Some(serde_json::from_str(&text)?)),
                Ok(Message::Binary(data)) => return Ok(Some(serde_json::from_slice(&data)?)),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed) => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }
}
