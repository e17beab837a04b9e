//! The hive worker: cooperative task execution over a broker-backed
//! future queue.
//!
//! A worker multiplexes any number of tasks onto a single thread.
//! Each task body is an ordinary future from the registry; awaiting a
//! child's result suspends the body and lets the controller run
//! whatever else is ready, pulling remote work from the broker when
//! the local queue runs dry.
//!
//! [`startup`] is the bootstrap entry point: the launcher starts the
//! same program on every worker, the origin runs the root task and
//! its return ends the whole pool.

pub mod api;
pub mod comm;
pub mod context;
pub mod controller;
pub mod env;
pub mod queue;
pub mod shared;

use std::rc::Rc;

use hive_core::{Args, Error, FutureId, Registry, Task, TaskError, Value, WorkerId};

use crate::comm::BrokerLink;
use crate::context::WorkerContext;
use crate::controller::Controller;
use crate::queue::FutureQueue;

pub use crate::api::{
    as_completed, map, map_join, map_values, submit, wait, yield_now, FutureHandle, ReturnWhen,
};
pub use crate::env::WorkerEnv;

/// Bootstraps this worker from `HIVE_*` environment variables and
/// runs the pool. On the origin the registered function `func` is
/// invoked with `args` as the root task and its value is returned;
/// other workers serve the pool until shutdown and return `None`.
pub fn startup(registry: Registry, func: &str, args: Args) -> Result<Option<Value>, Error> {
    startup_with(WorkerEnv::from_env()?, registry, func, args)
}

/// [`startup`] with an explicit environment, for tests and embedded
/// pools.
pub fn startup_with(
    env: WorkerEnv,
    registry: Registry,
    func: &str,
    args: Args,
) -> Result<Option<Value>, Error> {
    let worker = WorkerId::new(env.worker_name.clone());
    let is_origin = env.is_origin() || env.is_standalone();

    let mut snapshot = None;
    let mut headless = false;
    let mut queue = if env.is_standalone() {
        FutureQueue::standalone()
    } else {
        let link = BrokerLink::connect(&worker, &env)?;
        headless = link.config.get("headless").and_then(Value::as_bool).unwrap_or(false);
        snapshot = Some(link.variables.clone());
        FutureQueue::with_link(link)
    };
    if let Some(highwater) = env.highwater {
        queue.set_highwater(highwater);
    }

    let ctx = WorkerContext::new(worker, is_origin, env.debug(), registry, queue);
    ctx.set_headless(headless);
    if let Some(snapshot) = snapshot {
        ctx.seed_shared(&snapshot);
    }

    context::install(ctx.clone());
    let outcome = run_pool(&ctx, is_origin, func, args);
    context::uninstall();

    // The origin takes the pool down with it; everyone else just
    // closes their sockets.
    ctx.shutdown_queue();

    match outcome {
        Ok(root) => match root.outcome() {
            Some(Ok(value)) => Ok(Some(value)),
            Some(Err(err)) => Err(Error::Task(err)),
            None => Err(Error::Task(TaskError::runtime("root task never completed"))),
        },
        Err(Error::Shutdown) if !is_origin => Ok(None),
        Err(err) => Err(err),
    }
}

fn run_pool(
    ctx: &Rc<WorkerContext>,
    is_origin: bool,
    func: &str,
    args: Args,
) -> Result<Rc<Task>, Error> {
    let root = if is_origin {
        let root = Task::new(
            ctx.next_id(),
            FutureId::root_sentinel(ctx.worker().clone()),
            func,
            args,
        );
        ctx.adopt(root.clone());
        Some(root)
    } else {
        None
    };
    Controller::new(ctx.clone()).run(root)
}
