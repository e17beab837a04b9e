//! The cooperative controller.
//!
//! Every in-flight task owns a "task stack": a boxed local future
//! driving its registered body. A task that waits on an unfinished
//! child returns `Pending`, handing control back to the scheduling
//! loop; when the child reaches a terminal state on this worker the
//! controller switches straight back into the waiting parent. There
//! is no preemption and no implicit yield: a body that never awaits
//! runs to completion and blocks this worker's other futures for its
//! duration.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::Context;
use std::time::Instant;

use futures::future::{FutureExt, LocalBoxFuture};
use futures::task::{waker, ArcWake};

use hive_core::{Error, FutureId, Task, TaskError};

use crate::context::WorkerContext;

/// Wakes a parked task by queueing its id for the scheduler; used by
/// `yield_now` and by any conventional future a body might await.
struct TaskWaker {
    id: FutureId,
    woken: Arc<Mutex<VecDeque<FutureId>>>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.woken.lock().expect("woken list poisoned").push_back(arc_self.id.clone());
    }
}

pub struct Controller {
    ctx: Rc<WorkerContext>,
    stacks: HashMap<FutureId, LocalBoxFuture<'static, ()>>,
    woken: Arc<Mutex<VecDeque<FutureId>>>,
}

impl Controller {
    pub fn new(ctx: Rc<WorkerContext>) -> Controller {
        let woken = ctx.woken_handle();
        Controller { ctx, stacks: HashMap::new(), woken }
    }

    /// The scheduler main loop. The origin enters with the root task
    /// and leaves when it turns terminal; every other worker starts by
    /// pulling from the queue and leaves through the shutdown path.
    pub fn run(&mut self, root: Option<Rc<Task>>) -> Result<Rc<Task>, Error> {
        let mut task = match root {
            Some(root) => root,
            None => self.ctx.pop()?,
        };
        self.switch(&task);

        loop {
            if self.ctx.is_origin() && task.parent_id().is_root_sentinel() && task.is_terminal() {
                return Ok(task);
            }

            task = if task.is_terminal() {
                if task.owner() != self.ctx.worker() {
                    // Executed here on behalf of a remote owner: send
                    // it home and move on.
                    self.ctx.send_result(&task)?;
                    self.ctx.remove_task(task.id());
                    self.ctx.pop()?
                } else if task.index().is_some() {
                    // A resident parent is waiting on this child.
                    match self.resident_waiter(&task) {
                        Some(parent) => parent,
                        None => self.ctx.pop()?,
                    }
                } else {
                    // Nobody demands it yet; the result stays in the
                    // table until the parent asks.
                    self.ctx.pop()?
                }
            } else {
                // Suspended; it resumes when a child of its own
                // completes.
                self.ctx.pop()?
            };

            self.switch(&task);
        }
    }

    /// The waiting parent of `child`, provided it is resident, still
    /// suspended here, and has not already failed.
    fn resident_waiter(&self, child: &Task) -> Option<Rc<Task>> {
        let parent = self.ctx.get_task(child.parent_id())?;
        if parent.is_terminal() || !self.stacks.contains_key(parent.id()) {
            return None;
        }
        Some(parent)
    }

    /// Switches into a task: creates the stack on first entry, then
    /// polls it once. `Ready` retires the stack; `Pending` parks it.
    fn switch(&mut self, task: &Rc<Task>) {
        if task.is_terminal() {
            return;
        }
        let id = task.id().clone();
        let mut stack = match self.stacks.remove(&id) {
            Some(stack) => stack,
            None if !task.has_started() => self.make_stack(task.clone()),
            // A stray wake for a stack that already retired.
            None => return,
        };

        let waker = waker(Arc::new(TaskWaker { id: id.clone(), woken: self.woken.clone() }));
        let mut cx = Context::from_waker(&waker);
        let began = Instant::now();
        let previous = self.ctx.set_current(Some(task.clone()));
        let poll = stack.as_mut().poll(&mut cx);
        self.ctx.set_current(previous);
        task.add_exec_time(began.elapsed());

        if poll.is_pending() {
            self.stacks.insert(id, stack);
        }
    }

    /// Builds the task stack: resolve the callable, run it, capture
    /// the result or the exception, then fire callbacks if the task
    /// lives here.
    fn make_stack(&self, task: Rc<Task>) -> LocalBoxFuture<'static, ()> {
        task.mark_started();
        task.mark_running();
        let registry = self.ctx.registry();
        let local = self.ctx.worker().clone();
        async move {
            let outcome = match registry.resolve(&task.call().func) {
                Ok(func) => {
                    let body = func(task.call().args.clone());
                    match AssertUnwindSafe(body).catch_unwind().await {
                        Ok(result) => result,
                        Err(panic) => Err(TaskError::from_panic(panic)),
                    }
                }
                Err(err) => Err(err.into()),
            };
            if let Err(err) = &outcome {
                log::debug!("task {} ({}) failed: {err}", task.id(), task.call().func);
            }
            task.complete(outcome);
            if task.owner() == &local {
                task.run_callbacks();
            }
        }
        .boxed_local()
    }
}
