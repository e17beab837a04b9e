//! A distributed futures pool.
//!
//! User programs register task functions, then hand control to
//! [`startup`]. The same program text runs on every worker in the
//! pool; the origin executes the root task, any task may submit
//! further tasks, and a central broker moves surplus work to idle
//! workers and routes results back to whoever waits on them.
//!
//! ```no_run
//! use hive::prelude::*;
//!
//! fn main() {
//!     let mut registry = Registry::new();
//!     registry.register_fn("square", |args| Ok(json!(args.int(0)? * args.int(0)?)));
//!     registry.register("sum_squares", |args| async move {
//!         let n = args.int(0)?;
//!         let squares = hive::pool::map_join("square", (1..=n).map(|i| Args::new().arg(i))).await?;
//!         Ok(json!(squares.iter().filter_map(|v| v.as_i64()).sum::<i64>()))
//!     });
//!
//!     match hive::startup(registry, "sum_squares", Args::new().arg(10)) {
//!         Ok(Some(result)) => println!("{result}"),
//!         Ok(None) => {} // non-origin worker, served the pool
//!         Err(err) => {
//!             eprintln!("{err}");
//!             std::process::exit(1);
//!         }
//!     }
//! }
//! ```

pub mod demo;

pub use hive_core::{
    Args, CallRef, Callback, Error, FutureId, GroupId, Registry, Task, TaskError, TaskState, Value,
    WireTask, WorkerId,
};

pub use hive_worker::{startup, startup_with, shared, WorkerEnv};

/// The in-task pool operations: submit, map, wait, as_completed...
pub mod pool {
    pub use hive_worker::api::{
        as_completed, map, map_join, map_values, submit, wait, yield_now, AsCompleted,
        FutureHandle, Map, ReturnWhen,
    };
}

/// The broker, embeddable for single-host pools and tests.
pub mod broker {
    pub use hive_broker::{Broker, BrokerConfig, BrokerHandle};
}

pub mod prelude {
    pub use futures::StreamExt;
    pub use serde_json::json;

    pub use crate::pool::{FutureHandle, ReturnWhen};
    pub use crate::{Args, Error, GroupId, Registry, TaskError, Value, WorkerId};
}
