//! The broker wire protocol.
//!
//! Both broker sockets speak length-prefixed multipart messages: a
//! 32-bit frame count followed by a 32-bit length and payload per
//! frame, big endian throughout. On the task socket the transport
//! layer prepends the sender's identity frame on receipt (and strips
//! the destination frame on send), so the grammars below start at the
//! message-type frame.
//!
//! Task socket, worker or peer to broker:
//!
//! ```text
//! INIT     [config]
//! REQUEST  []
//! TASK     [wiretask]
//! REPLY    [wiretask, destination]
//! VARIABLE [key, value, owner]
//! TASKEND  [group, result]
//! CONNECT  [peer-address-list]
//! SHUTDOWN []
//! ```
//!
//! Task socket, broker to worker: `INIT [config, variables, peers]`,
//! `TASK [wiretask]`, `REPLY [wiretask]`. Info socket (pub):
//! `VARIABLE`, `TASKEND`, `SHUTDOWN` with the payloads above.

use std::io::{self, Read, Write};

use crate::error::Error;
use crate::id::{GroupId, WorkerId};
use crate::value::Value;

pub type Frame = Vec<u8>;

/// Sanity caps; anything beyond is a framing error, not a message.
pub const MAX_FRAMES: u32 = 64;
pub const MAX_FRAME_LEN: u32 = 16 << 20;

pub mod kind {
    pub const INIT: &[u8] = b"INIT";
    pub const REQUEST: &[u8] = b"REQUEST";
    pub const TASK: &[u8] = b"TASK";
    pub const REPLY: &[u8] = b"REPLY";
    pub const VARIABLE: &[u8] = b"VARIABLE";
    pub const TASKEND: &[u8] = b"TASKEND";
    pub const CONNECT: &[u8] = b"CONNECT";
    pub const SHUTDOWN: &[u8] = b"SHUTDOWN";
}

pub fn write_message<W: Write>(w: &mut W, frames: &[Frame]) -> io::Result<()> {
    w.write_all(&(frames.len() as u32).to_be_bytes())?;
    for frame in frames {
        w.write_all(&(frame.len() as u32).to_be_bytes())?;
        w.write_all(frame)?;
    }
    w.flush()
}

/// Reads one multipart message. `Ok(None)` is a clean end of stream
/// (the peer closed between messages); a close mid-message or an
/// implausible length is an error.
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<Vec<Frame>>, Error> {
    let count = match read_u32(r)? {
        Some(count) => count,
        None => return Ok(None),
    };
    if count == 0 || count > MAX_FRAMES {
        return Err(Error::Codec(format!("implausible frame count {count}")));
    }
    let mut frames = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u32(r)?.ok_or_else(|| Error::Codec("stream closed mid-message".into()))?;
        if len > MAX_FRAME_LEN {
            return Err(Error::Codec(format!("implausible frame length {len}")));
        }
        let mut frame = vec![0u8; len as usize];
        r.read_exact(&mut frame).map_err(Error::Io)?;
        frames.push(frame);
    }
    Ok(Some(frames))
}

fn read_u32<R: Read>(r: &mut R) -> Result<Option<u32>, Error> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        match r.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(Error::Codec("stream closed mid-message".into())),
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(Some(u32::from_be_bytes(buf)))
}

fn text_frame(frames: &[Frame], at: usize, what: &str) -> Result<String, Error> {
    let frame = frames.get(at).ok_or_else(|| Error::Codec(format!("missing {what} frame")))?;
    String::from_utf8(frame.clone()).map_err(|_| Error::Codec(format!("{what} frame is not utf-8")))
}

fn json_frame(frames: &[Frame], at: usize, what: &str) -> Result<Value, Error> {
    let frame = frames.get(at).ok_or_else(|| Error::Codec(format!("missing {what} frame")))?;
    serde_json::from_slice(frame).map_err(|e| Error::Codec(format!("bad {what} frame: {e}")))
}

fn byte_frame(frames: &[Frame], at: usize, what: &str) -> Result<Frame, Error> {
    frames.get(at).cloned().ok_or_else(|| Error::Codec(format!("missing {what} frame")))
}

/// Messages arriving on the broker's task socket (sender identity
/// already stripped by the transport).
#[derive(Clone, Debug, PartialEq)]
pub enum TaskMsg {
    Init { config: Value },
    Request,
    Task { payload: Frame },
    Reply { payload: Frame, dest: WorkerId },
    Variable { key: String, value: Value, owner: WorkerId },
    TaskEnd { group: GroupId, result: Value },
    Connect { peers: Vec<String> },
    Shutdown,
}

impl TaskMsg {
    pub fn encode(&self) -> Result<Vec<Frame>, Error> {
        Ok(match self {
            TaskMsg::Init { config } => vec![kind::INIT.to_vec(), serde_json::to_vec(config)?],
            TaskMsg::Request => vec![kind::REQUEST.to_vec()],
            TaskMsg::Task { payload } => vec![kind::TASK.to_vec(), payload.clone()],
            TaskMsg::Reply { payload, dest } => {
                vec![kind::REPLY.to_vec(), payload.clone(), dest.as_bytes().to_vec()]
            }
            TaskMsg::Variable { key, value, owner } => vec![
                kind::VARIABLE.to_vec(),
                key.clone().into_bytes(),
                serde_json::to_vec(value)?,
                owner.as_bytes().to_vec(),
            ],
            TaskMsg::TaskEnd { group, result } => vec![
                kind::TASKEND.to_vec(),
                group.as_str().as_bytes().to_vec(),
                serde_json::to_vec(result)?,
            ],
            TaskMsg::Connect { peers } => vec![kind::CONNECT.to_vec(), serde_json::to_vec(peers)?],
            TaskMsg::Shutdown => vec![kind::SHUTDOWN.to_vec()],
        })
    }

    pub fn decode(frames: &[Frame]) -> Result<TaskMsg, Error> {
        let tag = frames.first().ok_or_else(|| Error::Codec("empty message".into()))?;
        Ok(match tag.as_slice() {
            kind::INIT => TaskMsg::Init { config: json_frame(frames, 1, "config")? },
            kind::REQUEST => TaskMsg::Request,
            kind::TASK => TaskMsg::Task { payload: byte_frame(frames, 1, "task")? },
            kind::REPLY => TaskMsg::Reply {
                payload: byte_frame(frames, 1, "task")?,
                dest: WorkerId::from_bytes(&byte_frame(frames, 2, "destination")?)?,
            },
            kind::VARIABLE => TaskMsg::Variable {
                key: text_frame(frames, 1, "key")?,
                value: json_frame(frames, 2, "value")?,
                owner: WorkerId::from_bytes(&byte_frame(frames, 3, "owner")?)?,
            },
            kind::TASKEND => TaskMsg::TaskEnd {
                group: GroupId::new(text_frame(frames, 1, "group")?),
                result: json_frame(frames, 2, "result")?,
            },
            kind::CONNECT => TaskMsg::Connect {
                peers: serde_json::from_slice(&byte_frame(frames, 1, "peers")?)
                    .map_err(|e| Error::Codec(format!("bad peer list: {e}")))?,
            },
            kind::SHUTDOWN => TaskMsg::Shutdown,
            other => {
                return Err(Error::Codec(format!(
                    "unknown task message type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        })
    }
}

/// Messages a worker receives on its task socket.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMsg {
    Init { config: Value, variables: Value, peers: Vec<String> },
    Task { payload: Frame },
    Reply { payload: Frame },
}

impl WorkerMsg {
    pub fn encode(&self) -> Result<Vec<Frame>, Error> {
        Ok(match self {
            WorkerMsg::Init { config, variables, peers } => vec![
                kind::INIT.to_vec(),
                serde_json::to_vec(config)?,
                serde_json::to_vec(variables)?,
                serde_json::to_vec(peers)?,
            ],
            WorkerMsg::Task { payload } => vec![kind::TASK.to_vec(), payload.clone()],
            WorkerMsg::Reply { payload } => vec![kind::REPLY.to_vec(), payload.clone()],
        })
    }

    pub fn decode(frames: &[Frame]) -> Result<WorkerMsg, Error> {
        let tag = frames.first().ok_or_else(|| Error::Codec("empty message".into()))?;
        Ok(match tag.as_slice() {
            kind::INIT => WorkerMsg::Init {
                config: json_frame(frames, 1, "config")?,
                variables: json_frame(frames, 2, "variables")?,
                peers: serde_json::from_slice(&byte_frame(frames, 3, "peers")?)
                    .map_err(|e| Error::Codec(format!("bad peer list: {e}")))?,
            },
            kind::TASK => WorkerMsg::Task { payload: byte_frame(frames, 1, "task")? },
            kind::REPLY => WorkerMsg::Reply { payload: byte_frame(frames, 1, "task")? },
            other => {
                return Err(Error::Codec(format!(
                    "unknown worker message type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        })
    }
}

/// Messages published on the info socket. There is no per-subscriber
/// state; every connected worker sees every message.
#[derive(Clone, Debug, PartialEq)]
pub enum InfoMsg {
    Variable { key: String, value: Value, owner: WorkerId },
    TaskEnd { group: GroupId, result: Value },
    Shutdown,
}

impl InfoMsg {
    pub fn encode(&self) -> Result<Vec<Frame>, Error> {
        Ok(match self {
            InfoMsg::Variable { key, value, owner } => vec![
                kind::VARIABLE.to_vec(),
                key.clone().into_bytes(),
                serde_json::to_vec(value)?,
                owner.as_bytes().to_vec(),
            ],
            InfoMsg::TaskEnd { group, result } => vec![
                kind::TASKEND.to_vec(),
                group.as_str().as_bytes().to_vec(),
                serde_json::to_vec(result)?,
            ],
            InfoMsg::Shutdown => vec![kind::SHUTDOWN.to_vec()],
        })
    }

    pub fn decode(frames: &[Frame]) -> Result<InfoMsg, Error> {
        let tag = frames.first().ok_or_else(|| Error::Codec("empty message".into()))?;
        Ok(match tag.as_slice() {
            kind::VARIABLE => InfoMsg::Variable {
                key: text_frame(frames, 1, "key")?,
                value: json_frame(frames, 2, "value")?,
                owner: WorkerId::from_bytes(&byte_frame(frames, 3, "owner")?)?,
            },
            kind::TASKEND => InfoMsg::TaskEnd {
                group: GroupId::new(text_frame(frames, 1, "group")?),
                result: json_frame(frames, 2, "result")?,
            },
            kind::SHUTDOWN => InfoMsg::Shutdown,
            other => {
                return Err(Error::Codec(format!(
                    "unknown info message type {:?}",
                    String::from_utf8_lossy(other)
                )))
            }
        })
    }
}
