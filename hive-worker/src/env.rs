//! Worker process configuration.
//!
//! The launcher communicates through `HIVE_*` environment variables:
//! identity, origin flag, pool size, broker addresses and the debug
//! flag. An empty broker address selects standalone mode, where the
//! whole pool is this one worker and the queue never leaves memory.

use serde::Deserialize;

use hive_core::Error;

fn default_worker_name() -> String {
    "worker0".to_string()
}

fn default_broker_name() -> String {
    "broker".to_string()
}

fn default_pool_size() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize)]
pub struct WorkerEnv {
    #[serde(default = "default_worker_name")]
    pub worker_name: String,

    #[serde(default = "default_broker_name")]
    pub broker_name: String,

    /// Task-socket address of the broker (`host:port`); empty for
    /// standalone mode.
    #[serde(default)]
    pub broker_address: String,

    /// Info-socket address of the broker.
    #[serde(default)]
    pub meta_address: String,

    /// `1` on the worker that runs the root task.
    #[serde(default)]
    pub is_origin: Option<u8>,

    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    #[serde(default)]
    pub debug: Option<u8>,

    /// Local queue depth before submissions spill to the broker.
    #[serde(default)]
    pub highwater: Option<usize>,
}

impl WorkerEnv {
    /// Reads `HIVE_WORKER_NAME`, `HIVE_BROKER_ADDRESS`, ...
    pub fn from_env() -> Result<Self, Error> {
        envy::prefixed("HIVE_")
            .from_env::<WorkerEnv>()
            .map_err(|err| Error::Config(err.to_string()))
    }

    /// A self-contained single-worker pool, used by tests and by
    /// programs run without a launcher.
    pub fn standalone(worker_name: impl Into<String>) -> Self {
        WorkerEnv {
            worker_name: worker_name.into(),
            broker_name: default_broker_name(),
            broker_address: String::new(),
            meta_address: String::new(),
            is_origin: Some(1),
            pool_size: 1,
            debug: None,
            highwater: None,
        }
    }

    pub fn is_origin(&self) -> bool {
        matches!(self.is_origin, Some(n) if n != 0)
    }

    pub fn is_standalone(&self) -> bool {
        self.broker_address.is_empty()
    }

    pub fn debug(&self) -> bool {
        matches!(self.debug, Some(n) if n != 0)
    }
}
