//! Out-of-process runners speaking the line-delimited JSON protocol, driven by `sh`.

use codevolve::invoker::ProcessInvoker;
use codevolve::*;
use serde_json::json;
use std::fs;
use std::time::{Duration, Instant};
use tempfile::tempdir;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn runner_script(body: &str) -> String {
    format!(
        "sum() {{\n{}\n}}\necho '{{\"ready\":true}}'\nwhile read -r line; do sum; done\n",
        body
    )
}

#[tokio::test]
async fn process_invoker_round_trip_and_faults() {
    let ok = ProcessInvoker::spawn(
        "ok",
        sh(r#"echo '{"ready":true}'; while read -r line; do echo '{"ok":{"sum":42}}'; done"#),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert_eq!(ok.invoke(&[json!(1)]).await.unwrap(), json!({"sum": 42}));
    assert_eq!(ok.invoke(&[json!(2)]).await.unwrap(), json!({"sum": 42}));

    let boom = ProcessInvoker::spawn(
        "boom",
        sh(r#"echo '{"ready":true}'; while read -r line; do echo '{"error":"boom"}'; done"#),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let err = boom.invoke(&[]).await.unwrap_err();
    assert_eq!(err.kind(), Some(FailureKind::RuntimeFault));
    assert!(err.to_string().contains("boom"));

    let broken = ProcessInvoker::spawn(
        "broken",
        sh(r#"echo '{"error":"missing export"}'"#),
        Duration::from_secs(5),
    )
    .await;
    match broken {
        Err(ForgeError::LoadFailure { reason, .. }) => assert_eq!(reason, "missing export"),
        Err(other) => panic!("expected a load failure, got {}", other),
        Ok(_) => panic!("expected a load failure"),
    }
}

#[tokio::test]
async fn abandoned_call_respawns_runner() {
    let invoker = ProcessInvoker::spawn(
        "flaky",
        sh(r#"echo '{"ready":true}'; while read -r line; do case "$line" in *slow*) sleep 3;; esac; echo '{"ok":1}'; done"#),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let first_pid = invoker.pid().expect("runner pid");

    let abandoned =
        tokio::time::timeout(Duration::from_millis(200), invoker.invoke(&[json!("slow")])).await;
    assert!(abandoned.is_err(), "the slow call should have been abandoned");

    let start = Instant::now();
    assert_eq!(invoker.invoke(&[json!("fast")]).await.unwrap(), json!(1));
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "the next call must not wait on the abandoned one"
    );
    assert_ne!(invoker.pid(), Some(first_pid), "a fresh runner replaces the abandoned one");
}

#[tokio::test]
async fn memory_is_sampled_from_the_runner_process() {
    let invoker = ProcessInvoker::spawn(
        "resident",
        sh(r#"echo '{"ready":true}'; while read -r line; do echo '{"ok":null}'; done"#),
        Duration::from_secs(5),
    )
    .await
    .unwrap();

    let pid = invoker.pid().expect("runner pid");
    assert_ne!(pid, std::process::id());
    assert!(harness::resident_memory_kb(Some(pid)).is_some());

    let in_process = FnInvoker::new(|_| Ok(json!(null)));
    assert_eq!(in_process.pid(), None);
    assert!(harness::resident_memory_kb(None).is_some());
}

#[tokio::test]
async fn bench_with_shell_runners() {
    let dir = tempdir().unwrap();
    let mut config = ForgeConfig {
        workspace: dir.path().join(".codevolve"),
        iterations: 2,
        case_timeout_ms: 300,
        ..ForgeConfig::default()
    };
    config.runner.commands.insert(
        "sh".to_string(),
        vec!["sh".to_string(), "{file}".to_string()],
    );
    let forge = Forge::new(config);

    let variants = forge.workspace().variants_dir("sum");
    fs::create_dir_all(&variants).unwrap();
    fs::write(variants.join("ok.sh"), runner_script("  echo '{\"ok\":6}'")).unwrap();
    fs::write(variants.join("boom.sh"), runner_script("  echo '{\"error\":\"boom\"}'")).unwrap();
    fs::write(variants.join("stall.sh"), runner_script("  sleep 5")).unwrap();
    fs::write(
        variants.join("broken.sh"),
        "sum() {\n  :\n}\necho '{\"error\":\"missing export\"}'\n",
    )
    .unwrap();
    fs::write(variants.join("absent.sh"), "echo '{\"ready\":true}'\n").unwrap();

    forge
        .store()
        .save(
            "sum",
            TargetType::Function,
            vec![
                TestCase::new("three", json!([3]), json!(6)),
                TestCase::new("again", json!([1, 2, 3]), json!(6)),
            ],
        )
        .unwrap();

    let mut journal = RunJournal::new();
    let start = Instant::now();
    let result = forge
        .bench("sum", TargetType::Function, Some("balanced"), &mut journal)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_secs(4), "the stalled runner must not hold the run");

    assert_eq!(result.variants.len(), 5);
    assert_eq!(result.winner.as_deref(), Some("ok"));

    let ok = result.variant("ok").unwrap();
    assert_eq!(ok.passed, 2);
    assert!(ok.metric("avg_duration_ms").is_some());

    let boom = result.variant("boom").unwrap();
    assert_eq!(boom.failed, 2);
    assert!(boom.errors.iter().all(|e| e.kind == FailureKind::RuntimeFault));

    let stall = result.variant("stall").unwrap();
    assert_eq!(stall.failed, 2);
    assert!(stall.errors.iter().all(|e| e.kind == FailureKind::EvaluationTimeout));

    for id in ["broken", "absent"] {
        let v = result.variant(id).unwrap();
        assert_eq!((v.passed, v.failed), (0, 2), "{}", id);
        assert_eq!(v.errors[0].kind, FailureKind::LoadFailure, "{}", id);
    }

    let report = forge.analyze("sum", None, &mut journal).unwrap();
    let md = fs::read_to_string(forge.workspace().report_md_path("sum")).unwrap();
    assert_eq!(report.table.len(), 5);
    assert!(md.contains("`stall`"));
    assert!(md.contains("missing export"));
}
