//! The user-facing pool operations.
//!
//! All of these are meaningful only inside a running task (or the
//! root body): they address the worker context installed by
//! `startup`. Submission is asynchronous and returns immediately; the
//! cooperative blocking points are `result`, the `map` /
//! `as_completed` streams and `wait`.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};

use hive_core::{Args, Callback, Error, FutureId, GroupId, Task, TaskError, Value};

use crate::context;

/// When `wait` should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnWhen {
    /// As soon as any future finishes.
    FirstCompleted,
    /// As soon as any future finishes by raising; equivalent to
    /// `AllCompleted` when none does.
    FirstException,
    /// Once every future finished.
    AllCompleted,
}

/// Handle to a submitted task. Cheap to clone; the underlying task is
/// shared with the worker's table.
#[derive(Clone)]
pub struct FutureHandle {
    task: Rc<Task>,
}

impl FutureHandle {
    pub(crate) fn new(task: Rc<Task>) -> Self {
        FutureHandle { task }
    }

    pub fn id(&self) -> &FutureId {
        self.task.id()
    }

    pub fn done(&self) -> bool {
        self.task.is_terminal()
    }

    pub fn failed(&self) -> bool {
        self.task.has_failed()
    }

    /// Terminal outcome, if any; never blocks.
    pub fn outcome(&self) -> Option<Result<Value, TaskError>> {
        self.task.outcome()
    }

    /// Cooperatively blocks the calling task until the result is
    /// available, re-raising the child's exception.
    pub async fn result(&self) -> Result<Value, TaskError> {
        if !self.task.is_terminal() {
            WaitNext::new(vec![self.task.clone()]).await;
        }
        // Consumed: the table entry is released, the handle keeps the
        // task alive for further reads.
        let _ = context::with(|ctx| {
            ctx.remove_task(self.task.id());
            Ok(())
        });
        match self.task.outcome() {
            Some(outcome) => outcome,
            None => Err(TaskError::runtime("future not terminal after wait")),
        }
    }

    /// Registers a completion observer; it runs on the owning worker,
    /// immediately if the task already finished. Panics in observers
    /// are swallowed.
    pub fn add_done_callback(&self, f: impl FnMut(&Task) + 'static) {
        self.install_callback(Callback::new(f));
    }

    /// Like [`add_done_callback`](Self::add_done_callback), tagged
    /// with a reduction group so a TASKEND fence can drop it.
    pub fn add_group_callback(&self, group: GroupId, f: impl FnMut(&Task) + 'static) {
        self.install_callback(Callback::grouped(group, f));
    }

    fn install_callback(&self, callback: Callback) {
        if self.task.is_terminal() {
            let mut callback = callback;
            let task = &self.task;
            if panic::catch_unwind(AssertUnwindSafe(|| callback.invoke(task))).is_err() {
                log::debug!("late callback on task {} panicked; ignored", task.id());
            }
        } else {
            self.task.push_callback(callback);
        }
    }
}

/// Spawns an independent child of the calling task. The child starts
/// out pending on this worker and may travel to any other.
pub fn submit(func: &str, args: impl Into<Args>) -> Result<FutureHandle, Error> {
    context::with(|ctx| {
        let parent = ctx.current().ok_or(Error::NotStarted)?;
        let task = Task::new(ctx.next_id(), parent.id().clone(), func, args.into());
        log::trace!("{} submits {} -> {}", parent.id(), func, task.id());
        ctx.adopt(task.clone());
        ctx.append(task.clone())?;
        Ok(FutureHandle::new(task))
    })
}

/// Resolves once any of the snapshot tasks is terminal. Pending
/// children get their wait index registered so the controller knows
/// whom to resume.
pub(crate) struct WaitNext {
    children: Vec<Rc<Task>>,
}

impl WaitNext {
    pub(crate) fn new(children: Vec<Rc<Task>>) -> Self {
        WaitNext { children }
    }
}

/// A waiter that goes away releases the wait-indices it registered,
/// so the scheduler stops routing completions to it.
fn release_pending(children: &[Rc<Task>]) {
    for child in children {
        if !child.is_terminal() {
            child.clear_index();
        }
    }
}

impl Drop for WaitNext {
    fn drop(&mut self) {
        release_pending(&self.children);
    }
}

impl Future for WaitNext {
    type Output = Rc<Task>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Rc<Task>> {
        for child in &self.children {
            if child.is_terminal() {
                // The waiter moves on; the scheduler no longer needs
                // to route this child back to it.
                child.clear_index();
                return Poll::Ready(child.clone());
            }
        }
        for (index, child) in self.children.iter().enumerate() {
            child.set_index(index);
        }
        Poll::Pending
    }
}

/// Lazy sequence of the given futures in completion order. A failed
/// child surfaces its exception and ends the sequence.
pub fn as_completed(handles: impl IntoIterator<Item = FutureHandle>) -> AsCompleted {
    let children: Vec<Rc<Task>> = handles.into_iter().map(|h| h.task).collect();
    let yielded = vec![false; children.len()];
    AsCompleted { children, yielded, fused: false }
}

pub struct AsCompleted {
    children: Vec<Rc<Task>>,
    yielded: Vec<bool>,
    fused: bool,
}

impl Drop for AsCompleted {
    fn drop(&mut self) {
        release_pending(&self.children);
    }
}

impl Stream for AsCompleted {
    type Item = Result<FutureHandle, TaskError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.fused {
            return Poll::Ready(None);
        }
        for (i, child) in this.children.iter().enumerate() {
            if this.yielded[i] || !child.is_terminal() {
                continue;
            }
            this.yielded[i] = true;
            child.clear_index();
            return Poll::Ready(Some(match child.outcome() {
                Some(Err(err)) => {
                    this.fused = true;
                    Err(err)
                }
                _ => Ok(FutureHandle::new(child.clone())),
            }));
        }
        if this.yielded.iter().all(|y| *y) {
            return Poll::Ready(None);
        }
        for (i, child) in this.children.iter().enumerate() {
            if !child.is_terminal() {
                child.set_index(i);
            }
        }
        Poll::Pending
    }
}

/// Parallel map: one child per argument set, results in positional
/// order regardless of completion order. The first failed child (in
/// positional order) raises; consumed children leave the task table.
pub fn map(func: &str, argsets: impl IntoIterator<Item = Args>) -> Result<Map, Error> {
    let children = argsets
        .into_iter()
        .map(|args| submit(func, args).map(|h| h.task))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Map { children, next: 0 })
}

/// `map` over single-argument calls, the overwhelmingly common case.
pub fn map_values(func: &str, values: impl IntoIterator<Item = Value>) -> Result<Map, Error> {
    map(func, values.into_iter().map(|v| Args::positional([v])))
}

pub struct Map {
    children: Vec<Rc<Task>>,
    next: usize,
}

impl Drop for Map {
    fn drop(&mut self) {
        release_pending(&self.children);
    }
}

impl Map {
    /// Accepted for interface compatibility; there are no timeout
    /// semantics in the pool.
    pub fn timeout(self, _timeout: Option<Duration>) -> Self {
        self
    }
}

impl Stream for Map {
    type Item = Result<Value, TaskError>;

    fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.next == this.children.len() {
            return Poll::Ready(None);
        }
        let child = this.children[this.next].clone();
        if !child.is_terminal() {
            child.set_index(this.next);
            return Poll::Pending;
        }
        this.next += 1;
        child.clear_index();
        let _ = context::with(|ctx| {
            ctx.remove_task(child.id());
            Ok(())
        });
        Poll::Ready(Some(match child.outcome() {
            Some(Ok(value)) => Ok(value),
            Some(Err(err)) => {
                this.next = this.children.len();
                Err(err)
            }
            None => Err(TaskError::runtime("future not terminal after wait")),
        }))
    }
}

/// Collects a whole `map` eagerly.
pub async fn map_join(
    func: &str,
    argsets: impl IntoIterator<Item = Args>,
) -> Result<Vec<Value>, TaskError> {
    let mut stream = map(func, argsets)?;
    let mut results = Vec::new();
    while let Some(item) = stream.next().await {
        results.push(item?);
    }
    Ok(results)
}

/// Waits for the given futures per `return_when`. Never raises; the
/// outcome of each future is inspected through its handle. `timeout`
/// is accepted for interface compatibility and ignored.
pub async fn wait(
    handles: &[FutureHandle],
    timeout: Option<Duration>,
    return_when: ReturnWhen,
) -> (Vec<FutureHandle>, Vec<FutureHandle>) {
    let _ = timeout;
    loop {
        let satisfied = match return_when {
            ReturnWhen::FirstCompleted => handles.iter().any(|h| h.done()),
            ReturnWhen::FirstException => {
                handles.iter().any(|h| h.failed()) || handles.iter().all(|h| h.done())
            }
            ReturnWhen::AllCompleted => handles.iter().all(|h| h.done()),
        };
        if satisfied {
            break;
        }
        let pending: Vec<Rc<Task>> =
            handles.iter().filter(|h| !h.done()).map(|h| h.task.clone()).collect();
        WaitNext::new(pending).await;
    }
    let (done, not_done) = handles.iter().partition::<Vec<_>, _>(|h| h.done());
    (done.into_iter().cloned().collect(), not_done.into_iter().cloned().collect())
}

/// One cooperative tick: reschedules the calling task behind anything
/// already runnable.
pub fn yield_now() -> YieldNow {
    YieldNow { polled: false }
}

pub struct YieldNow {
    polled: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.polled {
            Poll::Ready(())
        } else {
            this.polled = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}
