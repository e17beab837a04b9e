//! Routing state and the matching algorithm.
//!
//! Everything here is a pure function of the router state: a message
//! comes in, zero or more routes come out. Sockets never appear, so
//! the queue discipline is testable on its own.
//!
//! Two situations must be fast: finding an unassigned task for a
//! requesting worker and finding an available worker for an incoming
//! task. Workers are served in arrival order (fairness); tasks are
//! served newest-first so deep subtrees complete before new breadth
//! is explored, which bounds queue memory.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::{json, Map};

use hive_core::protocol::{Frame, InfoMsg, TaskMsg, WorkerMsg};
use hive_core::{Value, WorkerId};

/// Pool-level configuration, merged into each worker's own config at
/// INIT time.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// A headless pool has no attached console; workers suppress
    /// result echoing.
    pub headless: bool,
    /// Queue depth at which incoming tasks spill to a peer broker
    /// instead of queueing locally. Irrelevant without peers.
    pub spill_at: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig { headless: false, spill_at: 1024 }
    }
}

/// One routing decision. The server applies these to real sockets.
#[derive(Debug, PartialEq)]
pub enum Route {
    /// Deliver to a locally connected worker.
    Send { to: WorkerId, msg: WorkerMsg },
    /// Relay to a peer broker over its cluster link.
    Forward { to: WorkerId, msg: TaskMsg },
    /// Publish on the info socket.
    Publish(InfoMsg),
    /// Open cluster links to these task-socket addresses.
    Dial { addrs: Vec<String> },
    /// Stop the run loop.
    Halt,
}

pub struct RouterState {
    available_workers: VecDeque<WorkerId>,
    unassigned_tasks: VecDeque<Frame>,
    /// owner identity -> name -> value
    shared_variables: HashMap<String, HashMap<String, Value>>,
    workers: HashSet<WorkerId>,
    peers: Vec<WorkerId>,
    peer_addrs: HashSet<String>,
    next_peer: usize,
    config: BrokerConfig,
}

impl RouterState {
    pub fn new(config: BrokerConfig) -> Self {
        RouterState {
            available_workers: VecDeque::new(),
            unassigned_tasks: VecDeque::new(),
            shared_variables: HashMap::new(),
            workers: HashSet::new(),
            peers: Vec::new(),
            peer_addrs: HashSet::new(),
            next_peer: 0,
            config,
        }
    }

    /// Registers an established cluster link under its identity.
    pub fn register_peer(&mut self, id: WorkerId, addr: Option<String>) {
        if let Some(addr) = addr {
            self.peer_addrs.insert(addr);
        }
        if !self.peers.contains(&id) {
            self.peers.push(id);
        }
    }

    /// Forgets a vanished connection. A worker queued on REQUEST is
    /// dropped from the queue; any task it already took is lost with
    /// it (at-most-once, no redelivery).
    pub fn forget(&mut self, id: &WorkerId) {
        self.available_workers.retain(|w| w != id);
        self.workers.remove(id);
        self.peers.retain(|w| w != id);
    }

    pub fn depth(&self) -> (usize, usize) {
        (self.available_workers.len(), self.unassigned_tasks.len())
    }

    fn merged_config(&self, worker_config: &Value) -> Value {
        let mut merged = match worker_config {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        merged.insert("headless".into(), json!(self.config.headless));
        Value::Object(merged)
    }

    fn variables_snapshot(&self) -> Value {
        serde_json::to_value(&self.shared_variables).unwrap_or(Value::Null)
    }

    fn pick_peer(&mut self) -> Option<WorkerId> {
        if self.peers.is_empty() {
            return None;
        }
        let peer = self.peers[self.next_peer % self.peers.len()].clone();
        self.next_peer = self.next_peer.wrapping_add(1);
        Some(peer)
    }

    /// Dispatches one task-socket message. `from_peer` marks messages
    /// arriving over a cluster link; those are never re-forwarded.
    pub fn handle(&mut self, sender: &WorkerId, from_peer: bool, msg: TaskMsg, out: &mut Vec<Route>) {
        match msg {
            TaskMsg::Init { config } => {
                self.workers.insert(sender.clone());
                out.push(Route::Send {
                    to: sender.clone(),
                    msg: WorkerMsg::Init {
                        config: self.merged_config(&config),
                        variables: self.variables_snapshot(),
                        peers: self.peer_addrs.iter().cloned().collect(),
                    },
                });
            }

            TaskMsg::Task { payload } => match self.available_workers.pop_front() {
                Some(worker) => {
                    out.push(Route::Send { to: worker, msg: WorkerMsg::Task { payload } });
                }
                None => {
                    if !from_peer && self.unassigned_tasks.len() >= self.config.spill_at {
                        if let Some(peer) = self.pick_peer() {
                            log::debug!("spilling a task to {peer}");
                            out.push(Route::Forward { to: peer, msg: TaskMsg::Task { payload } });
                            self.assert_matched();
                            return;
                        }
                    }
                    self.unassigned_tasks.push_back(payload);
                }
            },

            TaskMsg::Request => match self.unassigned_tasks.pop_back() {
                Some(payload) => {
                    out.push(Route::Send { to: sender.clone(), msg: WorkerMsg::Task { payload } });
                }
                None => self.available_workers.push_back(sender.clone()),
            },

            TaskMsg::Reply { payload, dest } => {
                if self.workers.contains(&dest) {
                    out.push(Route::Send { to: dest, msg: WorkerMsg::Reply { payload } });
                } else if !from_peer && !self.peers.is_empty() {
                    // The owner lives behind some peer; every peer sees
                    // the reply once and the one holding the owner
                    // delivers it.
                    for peer in self.peers.clone() {
                        out.push(Route::Forward {
                            to: peer,
                            msg: TaskMsg::Reply { payload: payload.clone(), dest: dest.clone() },
                        });
                    }
                } else {
                    log::warn!("dropping reply for unknown worker {dest}");
                }
            }

            TaskMsg::Variable { key, value, owner } => {
                self.shared_variables
                    .entry(owner.as_str().to_owned())
                    .or_default()
                    .insert(key.clone(), value.clone());
                out.push(Route::Publish(InfoMsg::Variable {
                    key: key.clone(),
                    value: value.clone(),
                    owner: owner.clone(),
                }));
                if !from_peer {
                    for peer in self.peers.clone() {
                        out.push(Route::Forward {
                            to: peer,
                            msg: TaskMsg::Variable {
                                key: key.clone(),
                                value: value.clone(),
                                owner: owner.clone(),
                            },
                        });
                    }
                }
            }

            TaskMsg::TaskEnd { group, result } => {
                out.push(Route::Publish(InfoMsg::TaskEnd {
                    group: group.clone(),
                    result: result.clone(),
                }));
                if !from_peer {
                    for peer in self.peers.clone() {
                        out.push(Route::Forward {
                            to: peer,
                            msg: TaskMsg::TaskEnd { group: group.clone(), result: result.clone() },
                        });
                    }
                }
            }

            TaskMsg::Connect { peers } => {
                let fresh: Vec<String> =
                    peers.into_iter().filter(|addr| !self.peer_addrs.contains(addr)).collect();
                if !fresh.is_empty() {
                    for addr in &fresh {
                        self.peer_addrs.insert(addr.clone());
                    }
                    out.push(Route::Dial { addrs: fresh });
                }
            }

            TaskMsg::Shutdown => {
                out.push(Route::Publish(InfoMsg::Shutdown));
                out.push(Route::Halt);
            }
        }
        self.assert_matched();
    }

    /// Workers and tasks never wait at the same time.
    fn assert_matched(&self) {
        debug_assert!(
            self.available_workers.is_empty() || self.unassigned_tasks.is_empty(),
            "matching invariant violated: {} workers and {} tasks queued",
            self.available_workers.len(),
            self.unassigned_tasks.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn worker(n: usize) -> WorkerId {
        WorkerId::new(format!("w{n}"))
    }

    fn task(n: usize) -> TaskMsg {
        TaskMsg::Task { payload: format!("task{n}").into_bytes() }
    }

    fn state() -> RouterState {
        RouterState::new(BrokerConfig::default())
    }

    #[test]
    fn tasks_go_to_the_longest_waiting_worker() {
        let mut s = state();
        let mut out = Vec::new();
        s.handle(&worker(1), false, TaskMsg::Request, &mut out);
        s.handle(&worker(2), false, TaskMsg::Request, &mut out);
        assert!(out.is_empty());

        s.handle(&worker(0), false, task(0), &mut out);
        assert_eq!(
            out,
            vec![Route::Send {
                to: worker(1),
                msg: WorkerMsg::Task { payload: b"task0".to_vec() }
            }]
        );
    }

    #[test]
    fn requests_take_the_newest_task_first() {
        let mut s = state();
        let mut out = Vec::new();
        s.handle(&worker(0), false, task(0), &mut out);
        s.handle(&worker(0), false, task(1), &mut out);
        assert!(out.is_empty());

        s.handle(&worker(1), false, TaskMsg::Request, &mut out);
        s.handle(&worker(2), false, TaskMsg::Request, &mut out);
        let payloads: Vec<_> = out
            .iter()
            .map(|r| match r {
                Route::Send { msg: WorkerMsg::Task { payload }, .. } => payload.clone(),
                other => panic!("unexpected route {other:?}"),
            })
            .collect();
        assert_eq!(payloads, vec![b"task1".to_vec(), b"task0".to_vec()]);
    }

    #[test]
    fn queues_are_never_simultaneously_populated() {
        let mut s = state();
        let mut out = Vec::new();
        for round in 0..100usize {
            match round % 3 {
                0 => s.handle(&worker(round), false, TaskMsg::Request, &mut out),
                _ => s.handle(&worker(round), false, task(round), &mut out),
            }
            let (workers, tasks) = s.depth();
            assert!(workers == 0 || tasks == 0);
        }
    }

    #[test]
    fn init_answers_with_config_and_snapshot() {
        let mut s = state();
        let mut out = Vec::new();
        s.handle(
            &worker(1),
            false,
            TaskMsg::Variable { key: "k".into(), value: json!(7), owner: worker(1) },
            &mut out,
        );
        out.clear();

        s.handle(&worker(2), false, TaskMsg::Init { config: json!({"debug": true}) }, &mut out);
        match &out[0] {
            Route::Send { to, msg: WorkerMsg::Init { config, variables, .. } } => {
                assert_eq!(to, &worker(2));
                assert_eq!(config["debug"], json!(true));
                assert_eq!(config["headless"], json!(false));
                assert_eq!(variables["w1"]["k"], json!(7));
            }
            other => panic!("unexpected route {other:?}"),
        }
    }

    #[test]
    fn replies_route_to_known_workers_and_drop_otherwise() {
        let mut s = state();
        let mut out = Vec::new();
        s.handle(&worker(1), false, TaskMsg::Init { config: json!({}) }, &mut out);
        out.clear();

        let reply = TaskMsg::Reply { payload: b"r".to_vec(), dest: worker(1) };
        s.handle(&worker(2), false, reply, &mut out);
        assert!(matches!(&out[0], Route::Send { to, msg: WorkerMsg::Reply { .. } } if to == &worker(1)));

        out.clear();
        let reply = TaskMsg::Reply { payload: b"r".to_vec(), dest: worker(9) };
        s.handle(&worker(2), false, reply, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn shutdown_publishes_then_halts() {
        let mut s = state();
        let mut out = Vec::new();
        s.handle(&worker(1), false, TaskMsg::Shutdown, &mut out);
        assert_eq!(out, vec![Route::Publish(InfoMsg::Shutdown), Route::Halt]);
    }

    #[test]
    fn overloaded_brokers_spill_to_a_peer() {
        let mut s = RouterState::new(BrokerConfig { headless: false, spill_at: 2 });
        s.register_peer(WorkerId::new("peer:10.0.0.2:9000"), Some("10.0.0.2:9000".into()));
        let mut out = Vec::new();

        s.handle(&worker(0), false, task(0), &mut out);
        s.handle(&worker(0), false, task(1), &mut out);
        assert!(out.is_empty());

        s.handle(&worker(0), false, task(2), &mut out);
        assert!(matches!(&out[0], Route::Forward { msg: TaskMsg::Task { .. }, .. }));

        // Peer traffic never bounces back out.
        out.clear();
        s.handle(&WorkerId::new("peer:10.0.0.2:9000"), true, task(3), &mut out);
        assert!(out.is_empty());
        assert_eq!(s.depth().1, 3);
    }

    #[test]
    fn connect_dials_each_address_once() {
        let mut s = state();
        let mut out = Vec::new();
        let peers = vec!["10.0.0.2:9000".to_string(), "10.0.0.3:9000".to_string()];
        s.handle(&WorkerId::new("launcher"), false, TaskMsg::Connect { peers: peers.clone() }, &mut out);
        assert_eq!(out, vec![Route::Dial { addrs: peers.clone() }]);

        out.clear();
        s.handle(&WorkerId::new("launcher"), false, TaskMsg::Connect { peers }, &mut out);
        assert!(out.is_empty());
    }
}
