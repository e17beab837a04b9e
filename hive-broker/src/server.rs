//! TCP realization of the router.
//!
//! The wire contract mirrors a router/dealer socket pair: every task
//! connection opens with a single identity frame, the reader thread
//! then tags each inbound message with that identity, and outbound
//! messages are written to the connection registered under the
//! destination identity. Info connections carry no identity; they are
//! write-only subscribers.
//!
//! All state lives on the dispatch thread. Reader threads only move
//! bytes into the event channel, so each message is processed
//! atomically with respect to the queues.

use std::collections::HashMap;
use std::io::{self};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

use hive_core::protocol::{self, Frame, InfoMsg, TaskMsg};
use hive_core::{Error, WorkerId};

use crate::router::{BrokerConfig, Route, RouterState};

/// Identity prefix distinguishing cluster links from workers.
const PEER_PREFIX: &str = "peer:";

enum Event {
    Connected { id: WorkerId, stream: TcpStream },
    Message { id: WorkerId, frames: Vec<Frame> },
    Disconnected { id: WorkerId },
    Subscriber(TcpStream),
}

pub struct Broker {
    task_listener: TcpListener,
    info_listener: TcpListener,
    state: RouterState,
    events_tx: Sender<Event>,
    events_rx: Receiver<Event>,
    conns: HashMap<WorkerId, TcpStream>,
    subscribers: Vec<TcpStream>,
    accepting: Arc<AtomicBool>,
}

impl Broker {
    /// Binds both sockets. Use port 0 to let the OS pick; the chosen
    /// ports are available through [`Broker::ports`].
    pub fn bind(config: BrokerConfig, task_addr: &str, info_addr: &str) -> io::Result<Broker> {
        let task_listener = TcpListener::bind(task_addr)?;
        let info_listener = TcpListener::bind(info_addr)?;
        let (events_tx, events_rx) = unbounded();
        Ok(Broker {
            task_listener,
            info_listener,
            state: RouterState::new(config),
            events_tx,
            events_rx,
            conns: HashMap::new(),
            subscribers: Vec::new(),
            accepting: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn ports(&self) -> (u16, u16) {
        (
            self.task_listener.local_addr().map(|a| a.port()).unwrap_or(0),
            self.info_listener.local_addr().map(|a| a.port()).unwrap_or(0),
        )
    }

    pub fn task_addr(&self) -> String {
        self.task_listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| String::from("?"))
    }

    /// Runs the broker until SHUTDOWN. Spawns the accept threads and
    /// then processes every event on this thread.
    pub fn run(mut self) -> Result<(), Error> {
        let own_addr = self.task_addr();
        spawn_acceptor("task", self.task_listener.try_clone()?, self.events_tx.clone(), self.accepting.clone(), false);
        spawn_acceptor("info", self.info_listener.try_clone()?, self.events_tx.clone(), self.accepting.clone(), true);
        log::info!("broker up on {own_addr}");

        let events = self.events_rx.clone();
        while let Ok(event) = events.recv() {
            match event {
                Event::Connected { id, stream } => {
                    log::debug!("{id} connected");
                    if id.as_str().starts_with(PEER_PREFIX) {
                        let addr = id.as_str()[PEER_PREFIX.len()..].to_string();
                        self.state.register_peer(id.clone(), Some(addr));
                    }
                    self.conns.insert(id, stream);
                }
                Event::Disconnected { id } => {
                    log::debug!("{id} disconnected");
                    self.close(&id);
                }
                Event::Subscriber(stream) => self.subscribers.push(stream),
                Event::Message { id, frames } => {
                    let msg = match TaskMsg::decode(&frames) {
                        Ok(msg) => msg,
                        Err(err) => {
                            // The rest of the byte stream is garbage
                            // too; drop the connection, keep routing.
                            log::warn!("bad message from {id}: {err}; dropping connection");
                            self.close(&id);
                            continue;
                        }
                    };
                    let from_peer = id.as_str().starts_with(PEER_PREFIX);
                    let mut routes = Vec::new();
                    self.state.handle(&id, from_peer, msg, &mut routes);
                    let (workers, tasks) = self.state.depth();
                    log::trace!("from {id}: {workers} workers / {tasks} tasks queued");
                    if self.apply(routes, &own_addr) {
                        break;
                    }
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    /// Applies routing decisions; true means halt.
    fn apply(&mut self, routes: Vec<Route>, own_addr: &str) -> bool {
        for route in routes {
            match route {
                Route::Send { to, msg } => match msg.encode() {
                    Ok(frames) => self.deliver(&to, &frames),
                    Err(err) => log::error!("encoding reply for {to}: {err}"),
                },
                Route::Forward { to, msg } => match msg.encode() {
                    Ok(frames) => self.deliver(&to, &frames),
                    Err(err) => log::error!("encoding forward for {to}: {err}"),
                },
                Route::Publish(msg) => self.publish(&msg),
                Route::Dial { addrs } => {
                    for addr in addrs {
                        if let Err(err) = self.dial_peer(&addr, own_addr) {
                            log::warn!("cluster link to {addr} failed: {err}");
                        }
                    }
                }
                Route::Halt => return true,
            }
        }
        false
    }

    /// Writes one message to a registered connection. Delivery is
    /// at-most-once: a vanished destination loses the message.
    fn deliver(&mut self, to: &WorkerId, frames: &[Frame]) {
        let gone = match self.conns.get_mut(to) {
            Some(stream) => protocol::write_message(stream, frames).is_err(),
            None => {
                log::warn!("no connection for {to}; message dropped");
                return;
            }
        };
        if gone {
            log::warn!("connection to {to} broke; message dropped");
            self.close(to);
        }
    }

    fn publish(&mut self, msg: &InfoMsg) {
        let frames = match msg.encode() {
            Ok(frames) => frames,
            Err(err) => {
                log::error!("encoding info message: {err}");
                return;
            }
        };
        self.subscribers.retain_mut(|sub| protocol::write_message(sub, &frames).is_ok());
    }

    fn dial_peer(&mut self, addr: &str, own_addr: &str) -> Result<(), Error> {
        let mut stream = TcpStream::connect(addr)?;
        let identity = format!("{PEER_PREFIX}{own_addr}");
        protocol::write_message(&mut stream, &[identity.into_bytes()])?;

        let id = WorkerId::new(format!("{PEER_PREFIX}{addr}"));
        self.state.register_peer(id.clone(), Some(addr.to_string()));
        self.conns.insert(id.clone(), stream.try_clone()?);
        let events = self.events_tx.clone();
        let thread_id = id.clone();
        thread::Builder::new().name(format!("hive-peer-{addr}")).spawn(move || {
            read_into(thread_id, stream, &events);
        })?;
        log::info!("cluster link to {addr} established");
        Ok(())
    }

    fn close(&mut self, id: &WorkerId) {
        if let Some(stream) = self.conns.remove(id) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.state.forget(id);
    }

    fn shutdown(&mut self) {
        self.accepting.store(false, Ordering::SeqCst);
        for (_, stream) in self.conns.drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for sub in self.subscribers.drain(..) {
            let _ = sub.shutdown(Shutdown::Both);
        }
        // Unblock the accept threads.
        for listener in [&self.task_listener, &self.info_listener] {
            if let Ok(addr) = listener.local_addr() {
                let _ = TcpStream::connect(addr);
            }
        }
        log::info!("broker down");
    }

    /// Runs a broker on loopback in a background thread. This is the
    /// single-host form used by tests and in-process launchers.
    pub fn spawn(config: BrokerConfig) -> io::Result<BrokerHandle> {
        let broker = Broker::bind(config, "127.0.0.1:0", "127.0.0.1:0")?;
        let (task_port, info_port) = broker.ports();
        let join = thread::Builder::new()
            .name("hive-broker".into())
            .spawn(move || {
                if let Err(err) = broker.run() {
                    log::error!("broker failed: {err}");
                }
            })?;
        Ok(BrokerHandle {
            task_addr: format!("127.0.0.1:{task_port}"),
            info_addr: format!("127.0.0.1:{info_port}"),
            join: Some(join),
        })
    }
}

/// Control handle for a spawned broker.
pub struct BrokerHandle {
    pub task_addr: String,
    pub info_addr: String,
    join: Option<JoinHandle<()>>,
}

impl BrokerHandle {
    /// Introduces this broker to its cluster peers, the way the
    /// launcher does after starting every broker.
    pub fn connect_cluster(&self, peers: Vec<String>) -> Result<(), Error> {
        let mut control = self.control_conn()?;
        let frames = TaskMsg::Connect { peers }.encode()?;
        protocol::write_message(&mut control, &frames)?;
        Ok(())
    }

    /// Asks the broker to stop and waits for it.
    pub fn shutdown(mut self) -> Result<(), Error> {
        let mut control = self.control_conn()?;
        protocol::write_message(&mut control, &TaskMsg::Shutdown.encode()?)?;
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        Ok(())
    }

    fn control_conn(&self) -> Result<TcpStream, Error> {
        let mut stream = TcpStream::connect(&self.task_addr)?;
        protocol::write_message(&mut stream, &[b"launcher".to_vec()])?;
        Ok(stream)
    }
}

fn spawn_acceptor(
    name: &'static str,
    listener: TcpListener,
    events: Sender<Event>,
    accepting: Arc<AtomicBool>,
    info: bool,
) {
    let _ = thread::Builder::new().name(format!("hive-accept-{name}")).spawn(move || {
        loop {
            let (stream, addr) = match listener.accept() {
                Ok(conn) => conn,
                Err(err) => {
                    log::debug!("accept on {name} failed: {err}");
                    break;
                }
            };
            if !accepting.load(Ordering::SeqCst) {
                break;
            }
            if info {
                if events.send(Event::Subscriber(stream)).is_err() {
                    break;
                }
                continue;
            }
            let events = events.clone();
            let _ = thread::Builder::new().name(format!("hive-conn-{addr}")).spawn(move || {
                serve_conn(stream, events);
            });
        }
    });
}

/// Performs the identity handshake, then pumps messages until EOF.
fn serve_conn(mut stream: TcpStream, events: Sender<Event>) {
    let id = match protocol::read_message(&mut stream) {
        Ok(Some(frames)) if frames.len() == 1 => match WorkerId::from_bytes(&frames[0]) {
            Ok(id) => id,
            Err(err) => {
                log::warn!("rejecting connection: {err}");
                return;
            }
        },
        Ok(_) => {
            log::warn!("rejecting connection: missing identity handshake");
            return;
        }
        Err(err) => {
            log::warn!("rejecting connection: {err}");
            return;
        }
    };
    let reply_stream = match stream.try_clone() {
        Ok(clone) => clone,
        Err(err) => {
            log::warn!("rejecting {id}: {err}");
            return;
        }
    };
    if events.send(Event::Connected { id: id.clone(), stream: reply_stream }).is_err() {
        return;
    }
    read_into(id, stream, &events);
}

fn read_into(id: WorkerId, mut stream: TcpStream, events: &Sender<Event>) {
    loop {
        match protocol::read_message(&mut stream) {
            Ok(Some(frames)) => {
                if events.send(Event::Message { id: id.clone(), frames }).is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::debug!("reading from {id}: {err}");
                break;
            }
        }
    }
    let _ = events.send(Event::Disconnected { id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn handshake(addr: &str, identity: &str) -> TcpStream {
        let mut stream = TcpStream::connect(addr).unwrap();
        protocol::write_message(&mut stream, &[identity.as_bytes().to_vec()]).unwrap();
        stream
    }

    #[test]
    fn routes_a_task_to_a_requesting_worker() {
        let handle = Broker::spawn(BrokerConfig::default()).unwrap();

        let mut taker = handshake(&handle.task_addr, "taker");
        protocol::write_message(&mut taker, &TaskMsg::Request.encode().unwrap()).unwrap();

        let mut giver = handshake(&handle.task_addr, "giver");
        let msg = TaskMsg::Task { payload: b"payload".to_vec() };
        protocol::write_message(&mut giver, &msg.encode().unwrap()).unwrap();

        let frames = protocol::read_message(&mut taker).unwrap().unwrap();
        let received = hive_core::protocol::WorkerMsg::decode(&frames).unwrap();
        assert_eq!(received, hive_core::protocol::WorkerMsg::Task { payload: b"payload".to_vec() });

        handle.shutdown().unwrap();
    }

    #[test]
    fn shutdown_reaches_info_subscribers() {
        let handle = Broker::spawn(BrokerConfig::default()).unwrap();
        let mut sub = TcpStream::connect(&handle.info_addr).unwrap();
        // Let the subscription register before anything is published.
        std::thread::sleep(std::time::Duration::from_millis(100));

        // Subscribers see published variables and the final shutdown.
        let mut publisher = handshake(&handle.task_addr, "w1");
        let var = TaskMsg::Variable { key: "k".into(), value: json!(1), owner: WorkerId::new("w1") };
        protocol::write_message(&mut publisher, &var.encode().unwrap()).unwrap();

        let frames = protocol::read_message(&mut sub).unwrap().unwrap();
        assert!(matches!(InfoMsg::decode(&frames).unwrap(), InfoMsg::Variable { .. }));

        handle.shutdown().unwrap();
        let mut saw_shutdown = false;
        while let Ok(Some(frames)) = protocol::read_message(&mut sub) {
            if InfoMsg::decode(&frames).unwrap() == InfoMsg::Shutdown {
                saw_shutdown = true;
            }
        }
        assert!(saw_shutdown);
    }
}
