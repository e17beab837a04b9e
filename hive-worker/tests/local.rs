//! Worker semantics in a standalone pool: one worker, no broker, the
//! full cooperative scheduler.

use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::rc::Rc;

use futures::StreamExt;
use serde_json::json;

use hive_core::{Args, Error, Registry, TaskError, Value};
use hive_worker::api::{as_completed, map_values, submit, wait, yield_now, ReturnWhen};
use hive_worker::env::WorkerEnv;
use hive_worker::{startup_with, shared};

fn run(registry: Registry, root: &str, args: Args) -> Result<Option<Value>, Error> {
    let _ = env_logger::builder().is_test(true).try_init();
    startup_with(WorkerEnv::standalone("w0"), registry, root, args)
}

fn base_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register_fn("square", |args| Ok(json!(args.int(0)? * args.int(0)?)));
    registry.register_fn("boom", |args| {
        Err(TaskError::new("value", "boom").with_payload(args.get(0).cloned().unwrap_or(Value::Null)))
    });
    registry.register("spin", |args| async move {
        let value = args.int(0)?;
        for _ in 0..args.int(1)? {
            yield_now().await;
        }
        Ok(json!(value))
    });
    registry
}

#[test]
fn pool_operations_require_startup() {
    assert!(matches!(submit("square", Args::new().arg(2)), Err(Error::NotStarted)));
}

#[test]
fn nested_submit_and_result() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let child = submit("square", Args::new().arg(6))?;
        child.result().await
    });
    assert_eq!(run(registry, "root", Args::new()).unwrap(), Some(json!(36)));
}

#[test]
fn submission_is_asynchronous() {
    // A child that nobody waits on must not have run by the time the
    // submitter resumes, and still runs before its value is taken.
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let child = submit("square", Args::new().arg(3))?;
        if child.done() {
            return Err(TaskError::new("test", "child ran synchronously"));
        }
        child.result().await
    });
    assert_eq!(run(registry, "root", Args::new()).unwrap(), Some(json!(9)));
}

#[test]
fn map_preserves_positional_order() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        // The i-th task spins longest for low i, so completion order
        // is the reverse of submission order.
        let mut stream = map_values("spin_pair", (0..20).map(|i| json!(i)))?;
        let mut values = Vec::new();
        while let Some(item) = stream.next().await {
            values.push(item?.as_i64().unwrap_or(-1));
        }
        Ok(json!(values))
    });
    registry.register("spin_pair", |args| async move {
        let i = args.int(0)?;
        for _ in 0..(20 - i) {
            yield_now().await;
        }
        Ok(json!(i))
    });

    let result = run(registry, "root", Args::new()).unwrap().unwrap();
    let values: Vec<i64> = result.as_array().unwrap().iter().filter_map(Value::as_i64).collect();
    assert_eq!(values, (0..20).collect::<Vec<_>>());
}

#[test]
fn as_completed_yields_in_completion_order() {
    let completion_order = Rc::new(RefCell::new(Vec::new()));
    let observed = completion_order.clone();

    let mut registry = base_registry();
    registry.register("root", move |_| {
        let observed = observed.clone();
        async move {
            let mut handles = Vec::new();
            for i in 0..50i64 {
                handles.push(submit("spin", Args::new().arg(i).arg(50 - i))?);
            }
            let mut stream = as_completed(handles);
            while let Some(item) = stream.next().await {
                let handle = item?;
                if let Some(Ok(value)) = handle.outcome() {
                    observed.borrow_mut().push(value.as_i64().unwrap_or(-1));
                }
            }
            Ok(Value::Null)
        }
    });
    run(registry, "root", Args::new()).unwrap();

    let order = completion_order.borrow();
    assert_eq!(order.len(), 50);
    // Fewer ticks finish earlier: non-increasing argument order.
    for pair in order.windows(2) {
        assert!(pair[0] >= pair[1], "out of completion order: {order:?}");
    }
}

#[test]
fn wait_first_exception_stops_early() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let mut handles = Vec::new();
        for i in 0..4i64 {
            handles.push(submit("spin", Args::new().arg(i).arg(100))?);
        }
        handles.push(submit("boom", Args::new().arg(7))?);

        let (done, not_done) = wait(&handles, None, ReturnWhen::FirstException).await;
        let failed = done.iter().filter(|h| h.failed()).count();
        if failed != 1 || not_done.is_empty() {
            return Err(TaskError::new("test", format!("{} done / {} pending", done.len(), not_done.len())));
        }

        let (_, not_done) = wait(&handles, None, ReturnWhen::AllCompleted).await;
        if !not_done.is_empty() {
            return Err(TaskError::new("test", "tasks left pending after ALL_COMPLETED"));
        }
        Ok(Value::Null)
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn wait_first_completed_returns_on_any() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let slow = submit("spin", Args::new().arg(1).arg(500))?;
        let fast = submit("spin", Args::new().arg(2).arg(1))?;
        let (done, not_done) = wait(&[slow, fast], None, ReturnWhen::FirstCompleted).await;
        if done.is_empty() || not_done.len() > 1 {
            return Err(TaskError::new("test", "FIRST_COMPLETED waited too long"));
        }
        Ok(Value::Null)
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn exceptions_cross_with_type_and_payload() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let child = submit("boom", Args::new().arg(7))?;
        match child.result().await {
            Err(err) if err == TaskError::new("value", "boom").with_payload(7) => Ok(Value::Null),
            other => Err(TaskError::new("test", format!("unexpected outcome: {other:?}"))),
        }
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn panics_become_task_errors() {
    let mut registry = base_registry();
    registry.register_fn("panicky", |_| panic!("blew up"));
    registry.register("root", |_| async move {
        let child = submit("panicky", Args::new())?;
        match child.result().await {
            Err(err) if err.kind == "panic" && err.message.contains("blew up") => Ok(Value::Null),
            other => Err(TaskError::new("test", format!("unexpected outcome: {other:?}"))),
        }
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn unknown_callables_fail_the_future_not_the_pool() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let child = submit("no_such_function", Args::new())?;
        match child.result().await {
            Err(err) if err.kind == "unknown-callable" => Ok(Value::Null),
            other => Err(TaskError::new("test", format!("unexpected outcome: {other:?}"))),
        }
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn root_failure_surfaces_from_startup() {
    let registry = base_registry();
    match run(registry, "boom", Args::new().arg(1)) {
        Err(Error::Task(err)) => assert_eq!(err.kind, "value"),
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[test]
fn callbacks_fire_once_on_completion() {
    let fired = Rc::new(Cell::new(0));
    let observed = fired.clone();

    let mut registry = base_registry();
    registry.register("root", move |_| {
        let fired = observed.clone();
        async move {
            let child = submit("square", Args::new().arg(5))?;
            let counter = fired.clone();
            child.add_done_callback(move |_| counter.set(counter.get() + 1));
            let value = child.result().await?;

            // Late registration on a finished future fires right away.
            let counter = fired.clone();
            child.add_done_callback(move |_| counter.set(counter.get() + 1));
            Ok(value)
        }
    });
    assert_eq!(run(registry, "root", Args::new()).unwrap(), Some(json!(25)));
    assert_eq!(fired.get(), 2);
}

#[test]
fn future_ids_are_pairwise_distinct() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let mut ids = HashSet::new();
        let mut handles = Vec::new();
        for i in 0..50i64 {
            let handle = submit("square", Args::new().arg(i))?;
            ids.insert(handle.id().clone());
            handles.push(handle);
        }
        if ids.len() != 50 {
            return Err(TaskError::new("test", "duplicate future identity"));
        }
        wait(&handles, None, ReturnWhen::AllCompleted).await;
        Ok(json!(handles.iter().all(|h| h.done())))
    });
    assert_eq!(run(registry, "root", Args::new()).unwrap(), Some(json!(true)));
}

#[test]
fn shared_variables_are_visible_locally() {
    let mut registry = base_registry();
    registry.register("root", |_| async move {
        shared::set("answer", 42)?;
        match shared::get("answer")? {
            Some(value) if value == json!(42) => Ok(Value::Null),
            other => Err(TaskError::new("test", format!("lookup found {other:?}"))),
        }
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn taskend_fences_buffered_partials() {
    use hive_core::GroupId;
    use hive_worker::shared::group;

    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let id = GroupId::new("reduce-1");
        group::stash(&id, 10)?;
        group::stash(&id, 32)?;
        if group::partials(&id)?.len() != 2 {
            return Err(TaskError::new("test", "partials not buffered"));
        }

        group::finish(&id, 42)?;
        if !group::partials(&id)?.is_empty() {
            return Err(TaskError::new("test", "fence left partials behind"));
        }
        // Late partials for a finished group are dropped too.
        group::stash(&id, 99)?;
        if !group::partials(&id)?.is_empty() {
            return Err(TaskError::new("test", "stash after fence survived"));
        }
        match group::result(&id)? {
            Some(value) if value == json!(42) => Ok(Value::Null),
            other => Err(TaskError::new("test", format!("group result {other:?}"))),
        }
    });
    run(registry, "root", Args::new()).unwrap();
}

#[test]
fn timeout_parameters_are_accepted_and_ignored() {
    use std::time::Duration;

    let mut registry = base_registry();
    registry.register("root", |_| async move {
        let slow = submit("spin", Args::new().arg(1).arg(2_000))?;
        // A "timeout" far shorter than the spin changes nothing.
        let (done, _) = wait(
            &[slow],
            Some(Duration::from_nanos(1)),
            ReturnWhen::AllCompleted,
        )
        .await;
        Ok(json!(done.len()))
    });
    assert_eq!(run(registry, "root", Args::new()).unwrap(), Some(json!(1)));
}
