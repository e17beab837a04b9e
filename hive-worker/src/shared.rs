//! Shared variables and group termination.
//!
//! A worker publishes a named value keyed by its own identity; the
//! broker records it and fans it out on the info channel. Delivery is
//! best-effort and unordered across publishers, but monotonic per key
//! from any one publisher.

use hive_core::{Error, Value};

use crate::context;

/// Publishes `key = value` under this worker's identity and records
/// it locally right away.
pub fn set(key: &str, value: impl Into<Value>) -> Result<(), Error> {
    context::with(|ctx| {
        let value = value.into();
        ctx.record_shared(key, value.clone());
        ctx.publish_variable(key, &value)
    })
}

/// Looks `key` up in the local mirror after draining the info
/// channel. A value published by this worker wins over other owners.
pub fn get(key: &str) -> Result<Option<Value>, Error> {
    context::with(|ctx| {
        ctx.pump_info();
        Ok(ctx.lookup_shared(key))
    })
}

/// Group operations: buffering of partial results for a pending
/// reduction/scan, and the TASKEND fence that retires them.
pub mod group {
    use hive_core::{Error, GroupId, Value, WorkerId};

    use crate::context;

    /// Buffers one partial result for `group` on this worker.
    /// Partials for an already-fenced group are dropped.
    pub fn stash(group: &GroupId, value: impl Into<Value>) -> Result<(), Error> {
        context::with(|ctx| {
            let from = ctx.worker().clone();
            ctx.stash_partial(group, from, value.into());
            Ok(())
        })
    }

    /// The partials buffered here so far.
    pub fn partials(group: &GroupId) -> Result<Vec<(WorkerId, Value)>, Error> {
        context::with(|ctx| Ok(ctx.partials(group)))
    }

    /// Declares `group` complete with `result`: emits TASKEND so
    /// every worker drops its buffered partials, and fences locally
    /// without waiting for the echo.
    pub fn finish(group: &GroupId, result: impl Into<Value>) -> Result<(), Error> {
        context::with(|ctx| {
            let result = result.into();
            ctx.publish_taskend(group, &result)?;
            ctx.apply_info(hive_core::protocol::InfoMsg::TaskEnd {
                group: group.clone(),
                result,
            });
            Ok(())
        })
    }

    /// The final result of a finished group, once its TASKEND has
    /// been observed here.
    pub fn result(group: &GroupId) -> Result<Option<Value>, Error> {
        context::with(|ctx| {
            ctx.pump_info();
            Ok(ctx.group_result(group))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_access_requires_a_running_pool() {
        assert!(matches!(set("k", 1), Err(Error::NotStarted)));
        assert!(matches!(get("k"), Err(Error::NotStarted)));
    }
}
