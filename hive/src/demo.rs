//! The reference task functions used by the demo worker binary and
//! the end-to-end tests.
//!
//! Besides the trivial `square` family there is a four-level cascade
//! (`func0`..`func4`) exercising nested submission, unordered
//! completion and exception recovery: `func4` raises past a square of
//! 20, `func3` folds that exception into its partial sum, `func2`
//! raises for arguments over 10, and `func1` folds those in turn.
//! The cascade is fully deterministic, whatever the pool shape.

use std::time::Duration;

use futures::StreamExt;
use serde_json::json;

use hive_core::{Args, Registry, TaskError, Value};
use hive_worker::api::{as_completed, submit, wait, yield_now, ReturnWhen};
use hive_worker::{map_values, shared};

fn payload_int(err: &TaskError) -> i64 {
    err.payload.as_ref().and_then(Value::as_i64).unwrap_or(0)
}

fn int_of(value: &Value) -> i64 {
    value.as_i64().unwrap_or(0)
}

/// Builds the demo registry. Every worker of a demo pool registers
/// the same table.
pub fn registry() -> Registry {
    let mut registry = Registry::new();

    registry.register_fn("square", |args| {
        let n = args.int(0)?;
        Ok(json!(n * n))
    });

    registry.register_fn("slow_square", |args| {
        let n = args.int(0)?;
        std::thread::sleep(Duration::from_millis(200));
        Ok(json!(n * n))
    });

    // Returns its first argument after the given number of
    // cooperative ticks.
    registry.register("spin", |args| async move {
        let value = args.int(0)?;
        let ticks = args.int(1)?;
        for _ in 0..ticks {
            yield_now().await;
        }
        Ok(json!(value))
    });

    registry.register_fn("boom", |args| {
        let payload = args.get(0).cloned().unwrap_or(Value::Null);
        Err(TaskError::new("value", "boom").with_payload(payload))
    });

    // Kills the whole worker process, replies and all. Only used to
    // exercise worker-loss behavior.
    registry.register_fn("die", |_args| std::process::abort());

    registry.register("sum_squares", |args| async move {
        let n = args.int(0)?;
        let squares = hive_worker::map_join("square", (1..=n).map(|i| Args::new().arg(i))).await?;
        Ok(json!(squares.iter().map(int_of).sum::<i64>()))
    });

    registry.register("slow_sum", |args| async move {
        let n = args.int(0)?;
        let squares =
            hive_worker::map_join("slow_square", (1..=n).map(|i| Args::new().arg(i))).await?;
        Ok(json!(squares.iter().map(int_of).sum::<i64>()))
    });

    // Polls the shared-variable mirror until `key` shows up, yielding
    // between attempts.
    registry.register("read_shared", |args| async move {
        let key = args.str(0)?.to_owned();
        let attempts = args.int(1).unwrap_or(5_000);
        for round in 0..attempts {
            if let Some(value) = shared::get(&key)? {
                return Ok(value);
            }
            if round % 50 == 49 {
                std::thread::sleep(Duration::from_millis(1));
            }
            yield_now().await;
        }
        Ok(Value::Null)
    });

    registry.register_fn("func4", |args| {
        let n = args.int(0)?;
        let square = n * n;
        if square > 20 {
            return Err(TaskError::new("value", "square out of range").with_payload(square));
        }
        Ok(json!(square))
    });

    registry.register("func3", |args| async move {
        let n = args.int(0)?;
        let mut stream = map_values("func4", (1..=n).map(|i| json!(i)))?;
        let mut sum = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => sum += int_of(&value),
                // Return what we can.
                Err(err) => return Ok(json!(sum + payload_int(&err))),
            }
        }
        Ok(json!(sum))
    });

    registry.register("func2", |args| async move {
        let n = args.int(0)?;
        if n > 10 {
            return Err(TaskError::new("value", "argument out of range").with_payload(10));
        }
        let mut launches = Vec::new();
        for i in 1..=n {
            launches.push(submit("func3", Args::new().arg(i))?);
        }
        // Fold completions in whatever order they arrive.
        let mut stream = as_completed(launches);
        let mut sum = 0;
        while let Some(item) = stream.next().await {
            let handle = item?;
            if let Some(Ok(value)) = handle.outcome() {
                sum += int_of(&value);
            }
        }
        Ok(json!(sum))
    });

    registry.register("func1", |args| async move {
        let n = args.int(0)?;
        let mut stream = map_values("func2", (1..=n).map(|i| json!(i)))?;
        let mut sum = 0;
        while let Some(item) = stream.next().await {
            match item {
                Ok(value) => sum += int_of(&value),
                Err(err) => sum += payload_int(&err),
            }
        }
        Ok(json!(sum))
    });

    registry.register("func0", |args| async move {
        let n = args.int(0)?;
        let child = submit("func1", Args::new().arg(n))?;
        child.result().await
    });

    registry.register("demo_main", |args| async move {
        let n = args.int(0)?;
        let task = submit("func0", Args::new().arg(n))?;
        wait(&[task.clone()], None, ReturnWhen::AllCompleted).await;
        task.result().await
    });

    registry
}

/// The value `demo_main(20)` settles on: func4 contributes squares up
/// to 16 and 25 as a recovered exception, giving func3 the series
/// 1, 5, 14, 30, 55, 55, ...; func2 folds those cumulatively and
/// func1 adds the recovered 10 from func2's failures past 10.
pub const DEMO_MAIN_20: i64 = 1_542;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_has_the_reference_functions() {
        let registry = registry();
        for name in ["square", "spin", "func0", "func4", "demo_main", "die"] {
            assert!(registry.contains(name), "missing {name}");
        }
    }
}
