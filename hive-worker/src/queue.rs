//! The hybrid future queue.
//!
//! One end is a plain deque of locally-created, not-yet-executed
//! tasks; the other end is the broker. Submission appends locally and
//! spills the oldest surplus to the broker past a high-water mark;
//! popping prefers the newest local task (depth-first), then woken
//! continuations, and only asks the broker when both are empty.

use std::collections::VecDeque;
use std::rc::Rc;

use hive_core::{Error, GroupId, Task, Value, WireTask, WorkerId};

use crate::comm::{BrokerLink, LinkEvent};
use crate::context::WorkerContext;

/// Local backlog beyond which submissions are published to the
/// broker for other workers to steal. Kept small: a deep local queue
/// starves the rest of the pool.
pub const DEFAULT_HIGHWATER: usize = 4;

pub struct FutureQueue {
    local: VecDeque<Rc<Task>>,
    link: Option<BrokerLink>,
    highwater: usize,
    request_outstanding: bool,
}

impl FutureQueue {
    /// A queue with no broker behind it: the whole pool is this one
    /// worker.
    pub fn standalone() -> Self {
        FutureQueue {
            local: VecDeque::new(),
            link: None,
            highwater: DEFAULT_HIGHWATER,
            request_outstanding: false,
        }
    }

    pub fn with_link(link: BrokerLink) -> Self {
        FutureQueue {
            local: VecDeque::new(),
            link: Some(link),
            highwater: DEFAULT_HIGHWATER,
            request_outstanding: false,
        }
    }

    pub fn set_highwater(&mut self, highwater: usize) {
        self.highwater = highwater.max(1);
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// Applies everything the info channel has buffered. The worker
    /// only observes variables, fences and shutdowns at these
    /// message boundaries.
    pub(crate) fn pump(&mut self, ctx: &WorkerContext) {
        let link = match &self.link {
            Some(link) => link,
            None => return,
        };
        loop {
            match link.try_info() {
                Ok(Some(msg)) => ctx.apply_info(msg),
                Ok(None) => break,
                Err(_) => {
                    ctx.note_shutdown();
                    break;
                }
            }
        }
    }

    /// Enqueues a locally-created task. Past the high-water mark the
    /// oldest tasks are serialized and offered to the broker; only
    /// tasks that never started can travel.
    pub fn append(&mut self, ctx: &WorkerContext, task: Rc<Task>) -> Result<(), Error> {
        self.pump(ctx);
        task.mark_enqueued();
        self.local.push_back(task);
        if let Some(link) = self.link.as_mut() {
            while self.local.len() > self.highwater {
                let surplus = self.local.pop_front().expect("non-empty past high water");
                debug_assert!(!surplus.has_started());
                log::trace!("publishing surplus task {} to broker", surplus.id());
                link.send_task(&surplus.to_wire())?;
            }
        }
        Ok(())
    }

    /// Produces the next task to schedule: the newest local task, a
    /// woken continuation, or whatever the broker sends back — a
    /// fresh TASK to execute, or a REPLY merged into its resident
    /// owner.
    pub fn pop(&mut self, ctx: &WorkerContext) -> Result<Rc<Task>, Error> {
        loop {
            self.pump(ctx);
            if ctx.is_shutting_down() {
                return Err(Error::Shutdown);
            }

            if let Some(task) = self.local.pop_back() {
                return Ok(task);
            }

            while let Some(id) = ctx.take_woken() {
                if let Some(task) = ctx.get_task(&id) {
                    if !task.is_terminal() {
                        return Ok(task);
                    }
                }
            }

            let link = match self.link.as_mut() {
                Some(link) => link,
                None => return Err(Error::Deadlock),
            };
            if !self.request_outstanding {
                link.send_request()?;
                self.request_outstanding = true;
            }
            match link.recv()? {
                LinkEvent::Info(msg) => ctx.apply_info(msg),
                LinkEvent::Task(payload) => {
                    self.request_outstanding = false;
                    match WireTask::decode(&payload) {
                        // Our own published task may come back to us;
                        // the resident copy keeps its callbacks.
                        Ok(wire) => match ctx.get_task(&wire.id) {
                            Some(resident) => return Ok(resident),
                            None => {
                                let task = Task::from_wire(wire);
                                ctx.adopt(task.clone());
                                return Ok(task);
                            }
                        },
                        Err(err) => log::warn!("undecodable task dropped: {err}"),
                    }
                }
                LinkEvent::Reply(payload) => match WireTask::decode(&payload) {
                    Ok(wire) => {
                        if let Some(task) = ctx.settle_reply(wire) {
                            return Ok(task);
                        }
                    }
                    Err(err) => log::warn!("undecodable reply dropped: {err}"),
                },
            }
        }
    }

    /// Sends a completed foreign task home to its owner.
    pub fn send_result(&mut self, task: &Task) -> Result<(), Error> {
        match self.link.as_mut() {
            Some(link) => link.send_reply(&task.to_wire(), task.owner()),
            None => {
                debug_assert!(false, "foreign task {} without a broker link", task.id());
                Ok(())
            }
        }
    }

    pub fn publish_variable(&mut self, key: &str, value: &Value, owner: &WorkerId) -> Result<(), Error> {
        match self.link.as_mut() {
            Some(link) => link.send_variable(key, value, owner),
            None => Ok(()),
        }
    }

    pub fn publish_taskend(&mut self, group: &GroupId, result: &Value) -> Result<(), Error> {
        match self.link.as_mut() {
            Some(link) => link.send_taskend(group, result),
            None => Ok(()),
        }
    }

    /// Origin workers take the whole pool down with them; everyone
    /// closes their own sockets.
    pub fn shutdown(&mut self, origin: bool) {
        if let Some(link) = self.link.as_mut() {
            if origin {
                if let Err(err) = link.send_shutdown() {
                    log::debug!("shutdown send failed: {err}");
                }
            }
            link.close();
        }
        self.link = None;
    }
}
