use portsync_harness::{contract_matrix, emit_json, run_conformance};
use portsync_sys::{SyncOps, dispatch};

#[test]
fn native_backend_passes_every_scenario_and_serializes() {
    let report = run_conformance(50);
    let failures: Vec<_> = report
        .scenarios
        .iter()
        .filter(|s| !s.passed)
        .map(|s| format!("{}: {}", s.name, s.detail))
        .collect();
    assert!(failures.is_empty(), "failed scenarios: {failures:#?}");
    assert!(report.ok);
    assert_eq!(report.failed, 0);
    assert_eq!(report.passed, report.scenarios.len());
    assert_eq!(report.timeout_ms, 50);
    assert_eq!(report.backend, SyncOps::native().name());
    assert!(!report.dispatch_replaced);

    let value = serde_json::to_value(&report).unwrap();
    for key in [
        "backend",
        "dispatch_replaced",
        "fallback_policy",
        "timeout_ms",
        "ok",
        "passed",
        "failed",
        "scenarios",
    ] {
        assert!(value.get(key).is_some(), "missing {key}");
    }
    let first = &value["scenarios"][0];
    assert!(first["name"].is_string());
    assert!(first["elapsed_micros"].is_u64());
    assert!(first["detail"].is_string());

    // An installed table is reported as such, even when it is the native one.
    dispatch::install(SyncOps::native());
    let replaced = run_conformance(20);
    dispatch::reset();
    assert!(replaced.ok);
    assert!(replaced.dispatch_replaced);
    assert_eq!(replaced.backend, SyncOps::native().name());
}

#[test]
fn contract_matrix_is_written_as_json_array() {
    let dir = std::env::temp_dir().join(format!("portsync-harness-{}", std::process::id()));
    let path = dir.join("contract.json");
    emit_json(&contract_matrix(), Some(&path)).unwrap();

    let body = std::fs::read_to_string(&path).unwrap();
    let rows: serde_json::Value = serde_json::from_str(&body).unwrap();
    let rows = rows.as_array().unwrap();
    assert_eq!(rows.len(), contract_matrix().len());
    assert!(rows.iter().any(|r| r["kind"] == "reentrant"
        && r["state"] == "HeldBySelf { depth: 1 }"
        && r["op"] == "Lock"
        && r["acquired"] == true));

    std::fs::remove_dir_all(&dir).unwrap();
}
