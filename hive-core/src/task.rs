//! The task object and its lifecycle.
//!
//! A `Task` is the resident form of one unit of work: identity,
//! parent linkage, payload, state and outcome. Workers share tasks
//! through `Rc`, so all mutation goes through `Cell`/`RefCell`; the
//! continuation (the suspended execution stack) is owned by the
//! controller and never lives on the task itself.
//!
//! `WireTask` is the travel projection: only identity, parentage,
//! payload and outcome cross worker boundaries. Continuations,
//! callbacks and timing metadata are strictly local.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{Error, TaskError};
use crate::id::{FutureId, GroupId, WorkerId};
use crate::value::{Args, Value};

/// Task lifecycle. Transitions are monotonic: once terminal (`Done` or
/// `Failed`) a task never changes again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Enqueued,
    Running,
    Done,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed)
    }
}

/// By-name reference to a registered task function plus its arguments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CallRef {
    pub func: String,
    pub args: Args,
}

/// A completion observer, run exactly once on the worker that owns the
/// task, after the result has arrived there. Callbacks are
/// non-essential: a panicking callback is swallowed.
pub struct Callback {
    pub group: Option<GroupId>,
    f: Box<dyn FnMut(&Task)>,
}

impl Callback {
    pub fn new(f: impl FnMut(&Task) + 'static) -> Self {
        Callback { group: None, f: Box::new(f) }
    }

    pub fn grouped(group: GroupId, f: impl FnMut(&Task) + 'static) -> Self {
        Callback { group: Some(group), f: Box::new(f) }
    }

    pub fn invoke(&mut self, task: &Task) {
        (self.f)(task);
    }
}

pub struct Task {
    id: FutureId,
    parent_id: FutureId,
    call: CallRef,
    state: Cell<TaskState>,
    result: RefCell<Option<Value>>,
    exception: RefCell<Option<TaskError>>,
    /// Position in the parent's pending-children list, or `None` while
    /// the parent is not waiting on this task.
    index: Cell<Option<usize>>,
    callbacks: RefCell<Vec<Callback>>,
    callbacks_run: Cell<bool>,
    started: Cell<bool>,
    created_at: Instant,
    wait_time: Cell<Option<Duration>>,
    exec_time: Cell<Duration>,
}

impl Task {
    pub fn new(id: FutureId, parent_id: FutureId, func: impl Into<String>, args: Args) -> Rc<Task> {
        Rc::new(Task {
            id,
            parent_id,
            call: CallRef { func: func.into(), args },
            state: Cell::new(TaskState::Created),
            result: RefCell::new(None),
            exception: RefCell::new(None),
            index: Cell::new(None),
            callbacks: RefCell::new(Vec::new()),
            callbacks_run: Cell::new(false),
            started: Cell::new(false),
            created_at: Instant::now(),
            wait_time: Cell::new(None),
            exec_time: Cell::new(Duration::ZERO),
        })
    }

    pub fn id(&self) -> &FutureId {
        &self.id
    }

    pub fn parent_id(&self) -> &FutureId {
        &self.parent_id
    }

    pub fn call(&self) -> &CallRef {
        &self.call
    }

    pub fn state(&self) -> TaskState {
        self.state.get()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.get().is_terminal()
    }

    pub fn has_failed(&self) -> bool {
        self.state.get() == TaskState::Failed
    }

    pub fn index(&self) -> Option<usize> {
        self.index.get()
    }

    pub fn set_index(&self, index: usize) {
        self.index.set(Some(index));
    }

    pub fn clear_index(&self) {
        self.index.set(None);
    }

    pub fn has_started(&self) -> bool {
        self.started.get()
    }

    pub fn mark_started(&self) {
        self.started.set(true);
    }

    fn advance(&self, next: TaskState) {
        let current = self.state.get();
        debug_assert!(
            next >= current && !current.is_terminal(),
            "task {} regressed {current:?} -> {next:?}",
            self.id
        );
        self.state.set(next);
    }

    pub fn mark_enqueued(&self) {
        self.advance(TaskState::Enqueued);
    }

    /// Records the transition onto an execution stack: the time spent
    /// between creation and first execution is the wait time.
    pub fn mark_running(&self) {
        if self.wait_time.get().is_none() {
            self.wait_time.set(Some(self.created_at.elapsed()));
        }
        self.advance(TaskState::Running);
    }

    /// Stores the outcome of the task body. Terminal; idempotence is a
    /// bug upstream and trips the monotonicity assertion.
    pub fn complete(&self, outcome: Result<Value, TaskError>) {
        match outcome {
            Ok(value) => {
                *self.result.borrow_mut() = Some(value);
                self.advance(TaskState::Done);
            }
            Err(err) => {
                *self.exception.borrow_mut() = Some(err);
                self.advance(TaskState::Failed);
            }
        }
    }

    pub fn result(&self) -> Option<Value> {
        self.result.borrow().clone()
    }

    pub fn exception(&self) -> Option<TaskError> {
        self.exception.borrow().clone()
    }

    /// Terminal outcome, if any.
    pub fn outcome(&self) -> Option<Result<Value, TaskError>> {
        match self.state.get() {
            TaskState::Done => Some(Ok(self.result().unwrap_or(Value::Null))),
            TaskState::Failed => {
                Some(Err(self.exception().unwrap_or_else(|| TaskError::runtime("lost exception"))))
            }
            _ => None,
        }
    }

    pub fn add_exec_time(&self, elapsed: Duration) {
        self.exec_time.set(self.exec_time.get() + elapsed);
    }

    pub fn wait_time(&self) -> Option<Duration> {
        self.wait_time.get()
    }

    pub fn exec_time(&self) -> Duration {
        self.exec_time.get()
    }

    pub fn push_callback(&self, callback: Callback) {
        self.callbacks.borrow_mut().push(callback);
    }

    /// Drops every callback tagged with `group` (a TASKEND fence).
    pub fn drop_group_callbacks(&self, group: &GroupId) {
        self.callbacks.borrow_mut().retain(|cb| cb.group.as_ref() != Some(group));
    }

    /// Runs completion callbacks, exactly once, swallowing panics.
    pub fn run_callbacks(self: &Rc<Self>) {
        if self.callbacks_run.replace(true) {
            return;
        }
        let mut callbacks = self.callbacks.take();
        for cb in &mut callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| (cb.f)(self))).is_err() {
                log::debug!("callback on task {} panicked; ignored", self.id);
            }
        }
    }

    pub fn to_wire(&self) -> WireTask {
        WireTask {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            call: self.call.clone(),
            result: self.result.borrow().clone(),
            exception: self.exception.borrow().clone(),
        }
    }

    /// Rebuilds a resident task from its travel form, on whichever
    /// worker received it.
    pub fn from_wire(wire: WireTask) -> Rc<Task> {
        let task = Task::new(wire.id, wire.parent_id, wire.call.func, wire.call.args);
        match (wire.result, wire.exception) {
            (Some(value), _) => {
                task.advance(TaskState::Done);
                *task.result.borrow_mut() = Some(value);
            }
            (None, Some(err)) => {
                task.advance(TaskState::Failed);
                *task.exception.borrow_mut() = Some(err);
            }
            (None, None) => task.advance(TaskState::Enqueued),
        }
        task
    }

    /// Merges a REPLY for this task into the resident copy on the
    /// owning worker and fires callbacks. A second delivery would
    /// violate at-most-once; it is dropped with a warning.
    pub fn absorb(self: &Rc<Self>, wire: WireTask) {
        debug_assert_eq!(wire.id, self.id);
        if self.is_terminal() {
            log::warn!("duplicate reply for task {} dropped", self.id);
            return;
        }
        match (wire.result, wire.exception) {
            (Some(value), _) => self.complete(Ok(value)),
            (None, Some(err)) => self.complete(Err(err)),
            (None, None) => {
                log::warn!("reply for task {} carried no outcome; dropped", self.id);
                return;
            }
        }
        self.run_callbacks();
    }

    /// The worker this task belongs to (where its callbacks run and
    /// its reply is routed).
    pub fn owner(&self) -> &WorkerId {
        &self.id.worker
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("func", &self.call.func)
            .field("state", &self.state.get())
            .field("index", &self.index.get())
            .finish()
    }
}

/// The serialized projection of a task. Exactly the fields that
/// travel: identity, parentage, call and outcome.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    pub id: FutureId,
    pub parent_id: FutureId,
    pub call: CallRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<TaskError>,
}

impl WireTask {
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn task() -> Rc<Task> {
        let worker = WorkerId::new("w0");
        Task::new(
            FutureId::new(worker.clone(), 1),
            FutureId::new(worker, 0),
            "square",
            Args::new().arg(4),
        )
    }

    #[test]
    fn lifecycle_is_monotonic() {
        let t = task();
        assert_eq!(t.state(), TaskState::Created);
        t.mark_enqueued();
        t.mark_running();
        t.complete(Ok(json!(16)));
        assert_eq!(t.state(), TaskState::Done);
        assert_eq!(t.outcome(), Some(Ok(json!(16))));
    }

    #[test]
    fn wait_index_is_set_and_cleared_by_the_waiter() {
        let t = task();
        assert_eq!(t.index(), None);
        t.set_index(3);
        assert_eq!(t.index(), Some(3));
        t.clear_index();
        assert_eq!(t.index(), None);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn terminal_tasks_never_mutate() {
        let t = task();
        t.mark_enqueued();
        t.mark_running();
        t.complete(Err(TaskError::new("err", "x")));
        t.complete(Ok(json!(0)));
    }

    #[test]
    fn wire_projection_omits_local_state() {
        let t = task();
        t.push_callback(Callback::new(|_| {}));
        t.mark_enqueued();
        let bytes = t.to_wire().encode().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("callback"));
        assert!(!text.contains("wait_time"));

        let back = Task::from_wire(WireTask::decode(&bytes).unwrap());
        assert_eq!(back.id(), t.id());
        assert_eq!(back.state(), TaskState::Enqueued);
    }

    #[test]
    fn absorbing_a_reply_fires_callbacks_once() {
        use std::cell::Cell;

        let t = task();
        t.mark_enqueued();
        let fired = Rc::new(Cell::new(0));
        let counter = fired.clone();
        t.push_callback(Callback::new(move |_| counter.set(counter.get() + 1)));

        let mut wire = t.to_wire();
        wire.result = Some(json!(16));
        t.absorb(wire.clone());
        assert_eq!(t.outcome(), Some(Ok(json!(16))));
        assert_eq!(fired.get(), 1);

        // A duplicate delivery is dropped.
        t.absorb(wire);
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn panicking_callbacks_are_swallowed() {
        let t = task();
        t.mark_enqueued();
        t.push_callback(Callback::new(|_| panic!("observer bug")));
        t.complete(Ok(json!(1)));
        t.run_callbacks();
        assert_eq!(t.state(), TaskState::Done);
    }
}
