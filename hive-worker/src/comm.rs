//! The worker side of the broker connection.
//!
//! Two sockets, like the broker has: the task socket (request/reply,
//! identity-framed) and the info socket (subscription). Each gets a
//! reader thread that decodes messages into a channel; the worker
//! thread consumes them at its own pace, so a blocked REQUEST can
//! still observe a shutdown notification through `select!`.

use std::net::{Shutdown, TcpStream};
use std::thread;

use crossbeam_channel::{select, unbounded, Receiver, TryRecvError};
use serde_json::json;

use hive_core::protocol::{self, Frame, InfoMsg, TaskMsg, WorkerMsg};
use hive_core::{Error, GroupId, Value, WireTask, WorkerId};

use crate::env::WorkerEnv;

/// One incoming event on either socket.
pub enum LinkEvent {
    Task(Frame),
    Reply(Frame),
    Info(InfoMsg),
}

pub struct BrokerLink {
    worker: WorkerId,
    stream: TcpStream,
    task_rx: Receiver<WorkerMsg>,
    info_rx: Receiver<InfoMsg>,
    /// Pool configuration merged by the broker at INIT.
    pub config: Value,
    /// Shared-variable snapshot taken at INIT.
    pub variables: Value,
    /// Known cluster peers at INIT.
    pub peers: Vec<String>,
}

impl BrokerLink {
    /// Dials the broker, announces this worker and waits for the INIT
    /// reply. The reply always precedes any task traffic because the
    /// broker serializes per-connection handling.
    pub fn connect(worker: &WorkerId, env: &WorkerEnv) -> Result<BrokerLink, Error> {
        let mut stream = TcpStream::connect(&env.broker_address)?;
        protocol::write_message(&mut stream, &[worker.as_bytes().to_vec()])?;

        let announce = TaskMsg::Init {
            config: json!({
                "debug": env.debug(),
                "pool_size": env.pool_size,
                "broker_name": env.broker_name,
            }),
        };
        protocol::write_message(&mut stream, &announce.encode()?)?;

        let frames = protocol::read_message(&mut stream)?
            .ok_or_else(|| Error::Handshake("broker closed during init".into()))?;
        let (config, variables, peers) = match WorkerMsg::decode(&frames)? {
            WorkerMsg::Init { config, variables, peers } => (config, variables, peers),
            other => return Err(Error::Handshake(format!("expected INIT reply, got {other:?}"))),
        };

        let info_stream = TcpStream::connect(&env.meta_address)?;

        let (task_tx, task_rx) = unbounded();
        let task_reader = stream.try_clone()?;
        thread::Builder::new()
            .name(format!("hive-task-rx-{worker}"))
            .spawn(move || pump(task_reader, task_tx, WorkerMsg::decode))?;

        let (info_tx, info_rx) = unbounded();
        thread::Builder::new()
            .name(format!("hive-info-rx-{worker}"))
            .spawn(move || pump(info_stream, info_tx, InfoMsg::decode))?;

        log::debug!("{worker} linked to broker at {}", env.broker_address);
        Ok(BrokerLink { worker: worker.clone(), stream, task_rx, info_rx, config, variables, peers })
    }

    fn send(&mut self, msg: &TaskMsg) -> Result<(), Error> {
        let frames = msg.encode()?;
        // A dead broker socket means the pool is going away.
        protocol::write_message(&mut self.stream, &frames).map_err(|err| {
            log::debug!("{}: broker write failed: {err}", self.worker);
            Error::Shutdown
        })
    }

    pub fn send_request(&mut self) -> Result<(), Error> {
        self.send(&TaskMsg::Request)
    }

    pub fn send_task(&mut self, wire: &WireTask) -> Result<(), Error> {
        let payload = wire.encode()?;
        self.send(&TaskMsg::Task { payload })
    }

    pub fn send_reply(&mut self, wire: &WireTask, dest: &WorkerId) -> Result<(), Error> {
        let payload = wire.encode()?;
        self.send(&TaskMsg::Reply { payload, dest: dest.clone() })
    }

    pub fn send_variable(&mut self, key: &str, value: &Value, owner: &WorkerId) -> Result<(), Error> {
        self.send(&TaskMsg::Variable {
            key: key.to_owned(),
            value: value.clone(),
            owner: owner.clone(),
        })
    }

    pub fn send_taskend(&mut self, group: &GroupId, result: &Value) -> Result<(), Error> {
        self.send(&TaskMsg::TaskEnd { group: group.clone(), result: result.clone() })
    }

    pub fn send_shutdown(&mut self) -> Result<(), Error> {
        self.send(&TaskMsg::Shutdown)
    }

    /// Non-blocking read of the info channel.
    pub fn try_info(&self) -> Result<Option<InfoMsg>, Error> {
        match self.info_rx.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Shutdown),
        }
    }

    /// Blocks until something arrives on either socket. A vanished
    /// broker surfaces as `Shutdown`.
    pub fn recv(&self) -> Result<LinkEvent, Error> {
        loop {
            let msg = select! {
                recv(self.task_rx) -> msg => msg.map_err(|_| Error::Shutdown)?,
                recv(self.info_rx) -> msg => {
                    return msg.map(LinkEvent::Info).map_err(|_| Error::Shutdown);
                }
            };
            match msg {
                WorkerMsg::Task { payload } => return Ok(LinkEvent::Task(payload)),
                WorkerMsg::Reply { payload } => return Ok(LinkEvent::Reply(payload)),
                WorkerMsg::Init { .. } => {
                    log::warn!("{}: unexpected INIT reply ignored", self.worker);
                }
            }
        }
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Reads messages until EOF or a framing error, decoding each into
/// the channel. Unknown message types are skipped; the stream itself
/// stays usable after them.
fn pump<T>(
    mut stream: TcpStream,
    tx: crossbeam_channel::Sender<T>,
    decode: impl Fn(&[Frame]) -> Result<T, Error>,
) {
    loop {
        match protocol::read_message(&mut stream) {
            Ok(Some(frames)) => match decode(&frames) {
                Ok(msg) => {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
                Err(err) => log::warn!("undecodable broker message skipped: {err}"),
            },
            Ok(None) => break,
            Err(err) => {
                log::debug!("broker stream ended: {err}");
                break;
            }
        }
    }
}
