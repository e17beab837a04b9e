//! Worker loss. Delivery is at-most-once with no redelivery: tasks
//! lost with a killed worker leave the origin blocked, and only a
//! pool shutdown resolves it — with an error, never a made-up
//! success.

use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use hive::broker::{Broker, BrokerConfig, BrokerHandle};

fn demo_worker(broker: &BrokerHandle, name: &str, origin: bool) -> Child {
    Command::new(env!("CARGO_BIN_EXE_hive-demo"))
        .env("HIVE_WORKER_NAME", name)
        .env("HIVE_IS_ORIGIN", if origin { "1" } else { "0" })
        .env("HIVE_BROKER_ADDRESS", &broker.task_addr)
        .env("HIVE_META_ADDRESS", &broker.info_addr)
        .env("HIVE_POOL_SIZE", "8")
        .env("HIVE_HIGHWATER", "1")
        .env("HIVE_DEMO_ROOT", "slow_sum")
        .env("HIVE_DEMO_ARG", "32")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn demo worker")
}

#[test]
fn lost_workers_stall_the_run_until_shutdown() {
    let broker = Broker::spawn(BrokerConfig::default()).unwrap();

    let mut origin = demo_worker(&broker, "w0", true);
    let mut helpers: Vec<Child> =
        (1..8).map(|i| demo_worker(&broker, &format!("w{i}"), false)).collect();

    // 32 tasks of ~200ms across 8 workers: by half a second everyone
    // has dequeued several and is mid-execution.
    thread::sleep(Duration::from_millis(500));
    for victim in helpers.drain(..2) {
        kill(victim);
    }

    // The tasks that died with the victims are never redelivered, so
    // the root cannot complete.
    thread::sleep(Duration::from_secs(2));
    assert!(
        origin.try_wait().expect("poll origin").is_none(),
        "origin finished despite lost tasks"
    );

    // Global shutdown is the only way out, and it is an error exit.
    broker.shutdown().unwrap();
    let status = origin.wait().expect("wait for origin");
    assert!(!status.success(), "origin exited cleanly after an aborted run");

    for helper in helpers {
        kill(helper);
    }
}

fn kill(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}
