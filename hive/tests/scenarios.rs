//! The nested-submit exception cascade, standalone and distributed.
//! Whatever the pool shape, the cascade folds recovered exceptions
//! into the same deterministic aggregate and nothing escapes the
//! root.

use std::thread;

use serde_json::json;

use hive::broker::{Broker, BrokerConfig};
use hive::{demo, startup_with, Args, WorkerEnv};

#[test]
fn exception_cascade_standalone() {
    let result = startup_with(
        WorkerEnv::standalone("w0"),
        demo::registry(),
        "demo_main",
        Args::new().arg(20),
    );
    assert_eq!(result.unwrap(), Some(json!(demo::DEMO_MAIN_20)));
}

#[test]
fn exception_cascade_across_workers() {
    let broker = Broker::spawn(BrokerConfig::default()).unwrap();

    let helpers: Vec<_> = (1..4)
        .map(|i| {
            let env = WorkerEnv {
                worker_name: format!("w{i}"),
                broker_name: "broker".to_string(),
                broker_address: broker.task_addr.clone(),
                meta_address: broker.info_addr.clone(),
                is_origin: Some(0),
                pool_size: 4,
                debug: None,
                highwater: Some(1),
            };
            thread::spawn(move || startup_with(env, demo::registry(), "unused", Args::new()))
        })
        .collect();

    let origin_env = WorkerEnv {
        worker_name: "w0".to_string(),
        broker_name: "broker".to_string(),
        broker_address: broker.task_addr.clone(),
        meta_address: broker.info_addr.clone(),
        is_origin: Some(1),
        pool_size: 4,
        debug: None,
        highwater: Some(1),
    };
    let result = startup_with(origin_env, demo::registry(), "demo_main", Args::new().arg(20));
    assert_eq!(result.unwrap(), Some(json!(demo::DEMO_MAIN_20)));

    for helper in helpers {
        assert_eq!(helper.join().unwrap().unwrap(), None);
    }
}
