//! Identities: workers, tasks and reduction groups.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Byte-string identity of a single worker process, assigned by the
/// launcher and globally unique within a run. The same identity is
/// used for socket handshakes and for reply routing.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        WorkerId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Decodes an identity frame. Identities are required to be UTF-8;
    /// anything else is a framing error on the receiver.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::Error> {
        String::from_utf8(bytes.to_vec())
            .map(WorkerId)
            .map_err(|_| crate::Error::Codec("identity frame is not utf-8".into()))
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerId {
    fn from(s: &str) -> Self {
        WorkerId(s.to_owned())
    }
}

/// Globally unique task identity: the worker that created the task
/// plus a per-worker sequence number.
///
/// The identity names the *creator*, not the executor; replies are
/// routed back to `worker` regardless of where the task ran.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FutureId {
    pub worker: WorkerId,
    pub seq: i64,
}

impl FutureId {
    pub fn new(worker: WorkerId, seq: i64) -> Self {
        FutureId { worker, seq }
    }

    /// The parent identity of the root task on `origin`. No task ever
    /// carries this as its own identity (sequence numbers start at 0).
    pub fn root_sentinel(origin: WorkerId) -> Self {
        FutureId { worker: origin, seq: -1 }
    }

    pub fn is_root_sentinel(&self) -> bool {
        self.seq == -1
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.worker, self.seq)
    }
}

/// Identifier shared by all tasks participating in one reduction or
/// scan operation; `TASKEND` messages fence their buffered partials.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(name: impl Into<String>) -> Self {
        GroupId(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_never_a_task_id() {
        let origin = WorkerId::new("origin");
        let sentinel = FutureId::root_sentinel(origin.clone());
        assert!(sentinel.is_root_sentinel());
        assert_ne!(sentinel, FutureId::new(origin, 0));
    }

    #[test]
    fn identity_survives_byte_round_trip() {
        let id = WorkerId::new("worker3");
        assert_eq!(WorkerId::from_bytes(id.as_bytes()).unwrap(), id);
        assert!(WorkerId::from_bytes(&[0xff, 0xfe]).is_err());
    }
}
