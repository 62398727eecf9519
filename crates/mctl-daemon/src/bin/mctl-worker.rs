//! Generic workload worker.
//!
//! The supervisor hands the workload body over the environment:
//! `MCTL_MODULE` and `MCTL_ENTRY_POINT` select a handler from the
//! compiled-in registry, `MCTL_PARAMS` carries the JSON invocation
//! arguments. Unknown module or entry point exits non-zero with a single
//! line on stderr.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;

type Params = BTreeMap<String, serde_json::Value>;

fn main() -> ExitCode {
    let module = std::env::var("MCTL_MODULE").unwrap_or_default();
    let entry_point =
        std::env::var("MCTL_ENTRY_POINT").unwrap_or_else(|_| "run".to_string());
    let params: Params = match std::env::var("MCTL_PARAMS") {
        Ok(raw) if !raw.is_empty() => match serde_json::from_str(&raw) {
            Ok(params) => params,
            Err(e) => {
                eprintln!("invalid MCTL_PARAMS: {e}");
                return ExitCode::FAILURE;
            }
        },
        _ => Params::new(),
    };

    if entry_point != "run" {
        eprintln!("module '{module}' has no entry point '{entry_point}'");
        return ExitCode::FAILURE;
    }

    match module.as_str() {
        "demo.heartbeat_agent" => heartbeat_agent(&params),
        "demo.counter_script" => counter_script(&params),
        "demo.ticker_service" => ticker_service(&params),
        _ => {
            eprintln!("unknown module '{module}'");
            ExitCode::FAILURE
        }
    }
}

fn param_f64(params: &Params, key: &str, default: f64) -> f64 {
    params
        .get(key)
        .and_then(serde_json::Value::as_f64)
        .unwrap_or(default)
}

fn param_u64(params: &Params, key: &str, default: u64) -> u64 {
    params
        .get(key)
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(default)
}

fn param_str<'a>(params: &'a Params, key: &str, default: &'a str) -> &'a str {
    params
        .get(key)
        .and_then(serde_json::Value::as_str)
        .unwrap_or(default)
}

/// Prints a greeting on an interval, forever.
fn heartbeat_agent(params: &Params) -> ExitCode {
    let message = param_str(params, "message", "hello from mctl");
    let interval = param_f64(params, "interval_s", 5.0).max(0.1);
    loop {
        println!("{message}");
        std::thread::sleep(Duration::from_secs_f64(interval));
    }
}

/// Counts up to a limit and exits cleanly.
fn counter_script(params: &Params) -> ExitCode {
    let limit = param_u64(params, "limit", 10);
    let interval = param_f64(params, "interval_s", 0.0);
    for i in 1..=limit {
        println!("count {i}/{limit}");
        if interval > 0.0 {
            std::thread::sleep(Duration::from_secs_f64(interval));
        }
    }
    ExitCode::SUCCESS
}

/// Emits a tick line on an interval, forever.
fn ticker_service(params: &Params) -> ExitCode {
    let interval = param_f64(params, "interval_s", 1.0).max(0.1);
    let mut tick: u64 = 0;
    loop {
        tick += 1;
        println!("tick {tick}");
        std::thread::sleep(Duration::from_secs_f64(interval));
    }
}
