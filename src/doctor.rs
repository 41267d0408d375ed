use std::sync::Arc;
use std::time::{Duration, Instant};

use flowlink_core::config::AppConfig;
use flowlink_engine::{EngineConfig, SyncEngine, WsConnector};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub async fn run_doctor(config: &AppConfig) {
    let mut checks = Vec::new();

    // 1. Endpoint looks like a WebSocket URL
    checks.push(check_endpoint(config));

    // 2. Timing settings are coherent
    checks.push(check_timing(config));

    // 3. Backend reachable
    checks.push(check_connectivity(config).await);

    // Print results
    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_endpoint(config: &AppConfig) -> CheckResult {
    let url = &config.connection.url;
    let detail = if url.contains("${") {
        Some(format!("{} (unresolved environment variable)", url))
    } else if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        Some(format!("{} (expected ws:// or wss://)", url))
    } else {
        None
    };

    match detail {
        Some(detail) => CheckResult {
            label: "Endpoint".into(),
            ok: false,
            detail,
        },
        None => CheckResult {
            label: "Endpoint".into(),
            ok: true,
            detail: url.clone(),
        },
    }
}

fn check_timing(config: &AppConfig) -> CheckResult {
    let keepalive_ms = config.connection.keepalive_interval_secs.saturating_mul(1000);
    let reconnect_ms = config.connection.reconnect_delay_ms;
    let timeout_secs = config.requests.default_timeout_secs;

    if reconnect_ms >= keepalive_ms {
        return CheckResult {
            label: "Timing".into(),
            ok: false,
            detail: format!(
                "reconnect_delay_ms ({}) >= keepalive interval ({}ms); drops will be slow to recover",
                reconnect_ms, keepalive_ms
            ),
        };
    }

    CheckResult {
        label: "Timing".into(),
        ok: true,
        detail: format!(
            "keepalive {}s, reconnect {}ms, request timeout {}s",
            config.connection.keepalive_interval_secs, reconnect_ms, timeout_secs
        ),
    }
}

async fn check_connectivity(config: &AppConfig) -> CheckResult {
    let engine = SyncEngine::new(
        EngineConfig::from(config),
        Arc::new(WsConnector::new(config.connection.url.clone())),
    );
    let started = Instant::now();
    engine.connect();
    let outcome = engine
        .wait_connected(Duration::from_secs(config.requests.default_timeout_secs))
        .await;
    let elapsed = started.elapsed();
    engine.close().await;

    match outcome {
        Ok(_) => CheckResult {
            label: "Backend".into(),
            ok: true,
            detail: format!("connected in {}ms", elapsed.as_millis()),
        },
        Err(e) => CheckResult {
            label: "Backend".into(),
            ok: false,
            detail: format!("{} ({})", config.connection.url, e),
        },
    }
}
