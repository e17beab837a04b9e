//! Core object model of the hive distributed futures pool.
//!
//! This crate defines everything the broker and the workers agree on:
//! task identities, the task lifecycle, the dynamically-typed argument
//! and result values, the callable registry that replaces by-name
//! dynamic lookup, and the multipart wire protocol spoken over the
//! broker's task and info sockets.
//!
//! Nothing in here performs I/O or scheduling; see `hive-broker` and
//! `hive-worker` for the moving parts.

pub mod error;
pub mod id;
pub mod protocol;
pub mod registry;
pub mod task;
pub mod value;

pub use crate::error::{Error, TaskError};
pub use crate::id::{FutureId, GroupId, WorkerId};
pub use crate::registry::{Registry, TaskFn, TaskResult};
pub use crate::task::{Callback, CallRef, Task, TaskState, WireTask};
pub use crate::value::{Args, Value};
