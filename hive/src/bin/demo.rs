//! The demo worker process.
//!
//! Started once per pool slot by the launcher (or a test); reads its
//! identity and broker addresses from `HIVE_*` variables, registers
//! the reference functions and serves the pool. On the origin the
//! root function named by `HIVE_DEMO_ROOT` runs with the integer
//! argument `HIVE_DEMO_ARG`; its value goes to stdout and its status
//! becomes the exit code.

use std::process::ExitCode;

use hive::Args;

fn main() -> ExitCode {
    env_logger::Builder::from_default_env().format_timestamp_micros().init();

    let root = std::env::var("HIVE_DEMO_ROOT").unwrap_or_else(|_| "demo_main".to_string());
    let arg: i64 = std::env::var("HIVE_DEMO_ARG")
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(20);

    match hive::startup(hive::demo::registry(), &root, Args::new().arg(arg)) {
        Ok(Some(result)) => {
            println!("{result}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("hive-demo: {err}");
            ExitCode::FAILURE
        }
    }
}
