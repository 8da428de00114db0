//! Settings for the remote transport.
//!
//! Both structs deserialize from any serde format with every field optional,
//! so they can be embedded in an application's own configuration file.

use std::time::Duration;

use serde::Deserialize;

/// Where and how a [`RemoteTaskExecutor`](crate::RemoteTaskExecutor)
/// reaches its worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `host:port` of the worker service.
    pub address: String,
    #[serde(with = "millis")]
    pub connect_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/", self.address)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:50051"),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Address a [`RemoteExecutorService`](crate::RemoteExecutorService)
/// listens on.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub address: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:50051"),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
