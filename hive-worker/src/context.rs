//! Per-worker state.
//!
//! Everything that was once process-global — identity, origin flag,
//! the task table, the execution queue, shared variables — lives in a
//! single `WorkerContext`, installed in a thread-local for the
//! duration of `startup`. The public API reaches it through
//! [`with`]; calling any pool operation without an installed context
//! is the "not started properly" error.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use hive_core::protocol::InfoMsg;
use hive_core::{Error, FutureId, GroupId, Registry, Task, Value, WireTask, WorkerId};

use crate::queue::FutureQueue;

pub struct WorkerContext {
    worker: WorkerId,
    is_origin: bool,
    debug: bool,
    headless: Cell<bool>,
    registry: Rc<Registry>,
    seq: Cell<i64>,
    current: RefCell<Option<Rc<Task>>>,
    tasks: RefCell<HashMap<FutureId, Rc<Task>>>,
    queue: RefCell<FutureQueue>,
    /// Task ids whose wakers fired; drained by the queue ahead of any
    /// other work. Shared with `Waker`s, hence the mutex.
    woken: Arc<Mutex<VecDeque<FutureId>>>,
    /// owner identity -> name -> value, fed by the info channel.
    shared: RefCell<HashMap<String, HashMap<String, Value>>>,
    group_buffers: RefCell<HashMap<GroupId, Vec<(WorkerId, Value)>>>,
    finished_groups: RefCell<HashMap<GroupId, Value>>,
    fenced_groups: RefCell<Vec<GroupId>>,
    shutting_down: Cell<bool>,
}

impl WorkerContext {
    pub fn new(
        worker: WorkerId,
        is_origin: bool,
        debug: bool,
        registry: Registry,
        queue: FutureQueue,
    ) -> Rc<WorkerContext> {
        Rc::new(WorkerContext {
            worker,
            is_origin,
            debug,
            headless: Cell::new(false),
            registry: Rc::new(registry),
            seq: Cell::new(0),
            current: RefCell::new(None),
            tasks: RefCell::new(HashMap::new()),
            queue: RefCell::new(queue),
            woken: Arc::new(Mutex::new(VecDeque::new())),
            shared: RefCell::new(HashMap::new()),
            group_buffers: RefCell::new(HashMap::new()),
            finished_groups: RefCell::new(HashMap::new()),
            fenced_groups: RefCell::new(Vec::new()),
            shutting_down: Cell::new(false),
        })
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn is_origin(&self) -> bool {
        self.is_origin
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn headless(&self) -> bool {
        self.headless.get()
    }

    pub fn set_headless(&self, headless: bool) {
        self.headless.set(headless);
    }

    pub fn registry(&self) -> Rc<Registry> {
        self.registry.clone()
    }

    pub fn next_id(&self) -> FutureId {
        let seq = self.seq.get();
        self.seq.set(seq + 1);
        FutureId::new(self.worker.clone(), seq)
    }

    // --- task table ---------------------------------------------------

    pub fn adopt(&self, task: Rc<Task>) {
        self.tasks.borrow_mut().insert(task.id().clone(), task);
    }

    pub fn get_task(&self, id: &FutureId) -> Option<Rc<Task>> {
        self.tasks.borrow().get(id).cloned()
    }

    pub fn remove_task(&self, id: &FutureId) {
        self.tasks.borrow_mut().remove(id);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Merges an incoming REPLY into the resident task it belongs to.
    /// Unknown ids are dropped: the reply raced a consumed future.
    pub fn settle_reply(&self, wire: WireTask) -> Option<Rc<Task>> {
        match self.get_task(&wire.id) {
            Some(task) => {
                task.absorb(wire);
                Some(task)
            }
            None => {
                log::warn!("reply for unknown task {} dropped", wire.id);
                None
            }
        }
    }

    // --- scheduling hooks ---------------------------------------------

    pub fn current(&self) -> Option<Rc<Task>> {
        self.current.borrow().clone()
    }

    pub fn set_current(&self, task: Option<Rc<Task>>) -> Option<Rc<Task>> {
        self.current.replace(task)
    }

    pub fn woken_handle(&self) -> Arc<Mutex<VecDeque<FutureId>>> {
        self.woken.clone()
    }

    pub fn take_woken(&self) -> Option<FutureId> {
        self.woken.lock().expect("woken list poisoned").pop_front()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.get()
    }

    pub fn note_shutdown(&self) {
        self.shutting_down.set(true);
    }

    // --- queue forwarding ---------------------------------------------

    pub fn append(&self, task: Rc<Task>) -> Result<(), Error> {
        self.queue.borrow_mut().append(self, task)
    }

    pub fn pop(&self) -> Result<Rc<Task>, Error> {
        self.queue.borrow_mut().pop(self)
    }

    pub fn send_result(&self, task: &Task) -> Result<(), Error> {
        self.queue.borrow_mut().send_result(task)
    }

    pub fn publish_variable(&self, key: &str, value: &Value) -> Result<(), Error> {
        let owner = self.worker.clone();
        self.queue.borrow_mut().publish_variable(key, value, &owner)
    }

    pub fn publish_taskend(&self, group: &GroupId, result: &Value) -> Result<(), Error> {
        self.queue.borrow_mut().publish_taskend(group, result)
    }

    pub fn shutdown_queue(&self) {
        let origin = self.is_origin;
        self.queue.borrow_mut().shutdown(origin);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Drains whatever the info channel has buffered right now.
    pub fn pump_info(&self) {
        self.queue.borrow_mut().pump(self);
    }

    // --- info channel -------------------------------------------------

    pub fn apply_info(&self, msg: InfoMsg) {
        match msg {
            InfoMsg::Variable { key, value, owner } => {
                log::trace!("variable {key} from {owner}");
                self.shared
                    .borrow_mut()
                    .entry(owner.as_str().to_owned())
                    .or_default()
                    .insert(key, value);
            }
            InfoMsg::TaskEnd { group, result } => self.fence_group(group, result),
            InfoMsg::Shutdown => {
                log::debug!("{}: shutdown notification", self.worker);
                self.shutting_down.set(true);
            }
        }
    }

    /// Seeds the shared-variable mirror from the INIT snapshot.
    pub fn seed_shared(&self, snapshot: &Value) {
        if let Ok(map) = serde_json::from_value(snapshot.clone()) {
            *self.shared.borrow_mut() = map;
        }
    }

    pub fn record_shared(&self, key: &str, value: Value) {
        self.shared
            .borrow_mut()
            .entry(self.worker.as_str().to_owned())
            .or_default()
            .insert(key.to_owned(), value);
    }

    /// Looks a shared variable up, preferring this worker's own
    /// publication, then any owner in identity order.
    pub fn lookup_shared(&self, key: &str) -> Option<Value> {
        let shared = self.shared.borrow();
        if let Some(value) = shared.get(self.worker.as_str()).and_then(|m| m.get(key)) {
            return Some(value.clone());
        }
        let mut owners: Vec<&String> = shared.keys().collect();
        owners.sort();
        owners.into_iter().find_map(|owner| shared[owner].get(key).cloned())
    }

    // --- reduction groups ---------------------------------------------

    /// Buffers one partial result for a pending group operation.
    /// Partials arriving after the group's fence are dropped.
    pub fn stash_partial(&self, group: &GroupId, from: WorkerId, value: Value) {
        if self.fenced_groups.borrow().contains(group) {
            log::debug!("partial for fenced group {group} dropped");
            return;
        }
        self.group_buffers.borrow_mut().entry(group.clone()).or_default().push((from, value));
    }

    pub fn partials(&self, group: &GroupId) -> Vec<(WorkerId, Value)> {
        self.group_buffers.borrow().get(group).cloned().unwrap_or_default()
    }

    pub fn group_result(&self, group: &GroupId) -> Option<Value> {
        self.finished_groups.borrow().get(group).cloned()
    }

    /// The TASKEND fence: buffered partials for the group are dropped
    /// everywhere, along with any group-tagged callbacks.
    fn fence_group(&self, group: GroupId, result: Value) {
        log::debug!("group {group} finished");
        self.group_buffers.borrow_mut().remove(&group);
        for task in self.tasks.borrow().values() {
            task.drop_group_callbacks(&group);
        }
        if !self.fenced_groups.borrow().contains(&group) {
            self.fenced_groups.borrow_mut().push(group.clone());
        }
        self.finished_groups.borrow_mut().insert(group, result);
    }
}

thread_local! {
    static CONTEXT: RefCell<Option<Rc<WorkerContext>>> = RefCell::new(None);
}

pub fn install(ctx: Rc<WorkerContext>) {
    CONTEXT.with(|slot| *slot.borrow_mut() = Some(ctx));
}

pub fn uninstall() {
    CONTEXT.with(|slot| *slot.borrow_mut() = None);
}

/// Runs `f` against the installed context, or fails with
/// [`Error::NotStarted`] outside a managed run.
pub fn with<R>(f: impl FnOnce(&Rc<WorkerContext>) -> Result<R, Error>) -> Result<R, Error> {
    CONTEXT.with(|slot| match slot.borrow().as_ref() {
        Some(ctx) => f(ctx),
        None => Err(Error::NotStarted),
    })
}

pub fn installed() -> bool {
    CONTEXT.with(|slot| slot.borrow().is_some())
}
