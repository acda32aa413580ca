use async_trait::async_trait;
use codevolve::config::GeneratorConfig;
use codevolve::*;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const SOURCE: &str = "const LIMIT = 100;\n\nfunction sum(n) {\n  let total = 0;\n  for (let i = 1; i <= n; i++) {\n    total += i;\n  }\n  return total;\n}\n\nmodule.exports = { sum, LIMIT };\n";

fn arg_n(args: &[Value]) -> std::result::Result<u64, String> {
    args.first()
        .and_then(Value::as_u64)
        .ok_or_else(|| "expected a non-negative integer".to_string())
}

/// Stands in for the runner processes: behaviour is chosen by variant id.
struct ById;

#[async_trait]
impl InvokerFactory for ById {
    async fn resolve(&self, variant: &VariantSource) -> codevolve::Result<Box<dyn Invokable>> {
        let invoker = match variant.id.as_str() {
            "baseline" | "d" => FnInvoker::new(|args| {
                std::thread::sleep(Duration::from_millis(2));
                let n = arg_n(args)?;
                Ok(json!((1..=n).sum::<u64>()))
            }),
            "c" => FnInvoker::new(|args| {
                let n = arg_n(args)?;
                // off by one for n == 4
                let out = if n == 4 { n * (n + 1) / 2 + 1 } else { n * (n + 1) / 2 };
                Ok(json!(out))
            }),
            _ => FnInvoker::new(|args| {
                let n = arg_n(args)?;
                Ok(json!(n * (n + 1) / 2))
            }),
        };
        Ok(Box::new(invoker))
    }
}

fn setup(root: &Path) -> (Forge, PathBuf) {
    let src = root.join("src");
    fs::create_dir_all(&src).unwrap();
    let source = src.join("math.js");
    fs::write(&source, SOURCE).unwrap();

    let config = ForgeConfig {
        workspace: root.join(".codevolve"),
        iterations: 3,
        ..ForgeConfig::default()
    };
    (Forge::with_factory(config, Arc::new(ById)), source)
}

fn record_cases(forge: &Forge) {
    let cases = (1..=5u64)
        .map(|n| TestCase::new(format!("n{}", n), json!([n]), json!(n * (n + 1) / 2)))
        .collect();
    forge.store().save("sum", TargetType::Function, cases).unwrap();
}

fn write_variant(forge: &Forge, id: &str, body: &str) {
    let dir = forge.workspace().variants_dir("sum");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{}.js", id)), format!("function sum(n) {{\n{}\n}}\n", body)).unwrap();
}

#[tokio::test]
async fn fastest_profile_picks_faster_variant_and_patch_round_trips() {
    let dir = tempdir().unwrap();
    let (forge, source) = setup(dir.path());
    let mut journal = RunJournal::new();

    let request = forge
        .prepare_request(&source, "sum", TargetType::Function, Some("fastest"), &mut journal)
        .unwrap();
    assert!(fs::read_to_string(&request).unwrap().contains("`sum`"));

    record_cases(&forge);
    write_variant(&forge, "b", "  return (n * (n + 1)) / 2;");
    write_variant(&forge, "c", "  return n === 4 ? 11 : (n * (n + 1)) / 2;");
    write_variant(&forge, "d", "  let t = 0;\n  for (let i = n; i > 0; i--) t += i;\n  return t;");

    let result = forge
        .bench("sum", TargetType::Function, Some("fastest"), &mut journal)
        .await
        .unwrap();
    assert_eq!(result.variants.len(), 4);
    assert_eq!(result.winner.as_deref(), Some("b"), "reason: {}", result.reason);

    let c = result.variant("c").unwrap();
    assert_eq!((c.passed, c.failed), (4, 1));
    assert!(!c.gated, "a variant failing a case must never win under a 100% gate");

    let report = forge.analyze("sum", None, &mut journal).unwrap();
    assert_eq!(report.profile, "fastest");
    assert_eq!(report.recommendation.winner.as_deref(), Some("b"));
    assert_eq!(report.recommendation.confidence, Confidence::High);
    assert_eq!(report.table.len(), 4);
    assert!(report.diff.is_some());
    assert!(forge.workspace().report_md_path("sum").exists());

    let outcome = forge.apply(&source, "sum", &mut journal).unwrap();
    let patch = match outcome {
        PatchOutcome::Applied(patch) => patch,
        other => panic!("expected a patch, got {:?}", other),
    };
    let patched = fs::read_to_string(&source).unwrap();
    assert!(patched.contains("return (n * (n + 1)) / 2;"));
    assert!(patched.starts_with("const LIMIT = 100;"));
    assert!(patched.ends_with("module.exports = { sum, LIMIT };\n"));
    assert_eq!(patch.line_delta, -4);

    let winners = forge.workspace().winners_dir("sum");
    assert!(winners.join("b.js").exists());
    assert!(winners.join("analysis.json").exists());

    forge.rollback(&source, &mut journal).unwrap();
    assert_eq!(fs::read_to_string(&source).unwrap(), SOURCE);

    let lineage = forge.lineage("sum").unwrap();
    assert_eq!(lineage.variants, 4);
    assert_eq!(lineage.agents.get("baseline").map(|s| s.attempts), Some(1));
    assert_eq!(lineage.agents.get("human").map(|s| s.attempts), Some(3));
}

#[tokio::test]
async fn no_cases_means_no_winner() {
    let dir = tempdir().unwrap();
    let (forge, source) = setup(dir.path());
    let mut journal = RunJournal::new();

    forge
        .prepare_request(&source, "sum", TargetType::Function, None, &mut journal)
        .unwrap();
    let result = forge
        .bench("sum", TargetType::Function, None, &mut journal)
        .await
        .unwrap();
    assert!(result.winner.is_none());
    assert!(journal.warnings().count() > 0);

    let err = forge.apply(&source, "sum", &mut journal).unwrap_err();
    assert!(matches!(err, ForgeError::NoValidVariant(_)));
    assert_eq!(fs::read_to_string(&source).unwrap(), SOURCE);
}

#[tokio::test]
async fn apply_scores_the_latest_bench_not_an_old_report() {
    let dir = tempdir().unwrap();
    let (forge, source) = setup(dir.path());
    let mut journal = RunJournal::new();

    forge
        .prepare_request(&source, "sum", TargetType::Function, Some("fastest"), &mut journal)
        .unwrap();
    forge
        .bench("sum", TargetType::Function, Some("fastest"), &mut journal)
        .await
        .unwrap();
    let stale = forge.analyze("sum", None, &mut journal).unwrap();
    assert!(stale.recommendation.winner.is_none());

    record_cases(&forge);
    write_variant(&forge, "b", "  return (n * (n + 1)) / 2;");
    let result = forge
        .bench("sum", TargetType::Function, Some("fastest"), &mut journal)
        .await
        .unwrap();
    assert_eq!(result.winner.as_deref(), Some("b"), "reason: {}", result.reason);

    let outcome = forge.apply(&source, "sum", &mut journal).unwrap();
    assert!(matches!(outcome, PatchOutcome::Applied(_)), "{:?}", outcome);
    assert!(fs::read_to_string(&source).unwrap().contains("return (n * (n + 1)) / 2;"));
    assert!(forge.workspace().winners_dir("sum").join("b.js").exists());
}

struct Greeter;

#[async_trait]
impl InvokerFactory for Greeter {
    async fn resolve(&self, _variant: &VariantSource) -> codevolve::Result<Box<dyn Invokable>> {
        Ok(Box::new(FnInvoker::new(|args| match args.first() {
            Some(Value::String(name)) if !name.is_empty() => Ok(json!(format!("Hello, {}", name))),
            _ => Err("name required".to_string()),
        })))
    }
}

#[tokio::test]
async fn mutate_keeps_only_inputs_the_baseline_accepts() {
    let dir = tempdir().unwrap();
    let source = dir.path().join("greet.js");
    fs::write(&source, "function greet(name) {\n  return `Hello, ${name}`;\n}\n").unwrap();

    let mut config = ForgeConfig {
        workspace: dir.path().join(".codevolve"),
        ..ForgeConfig::default()
    };
    config.mutation.seed = Some(1);
    let forge = Forge::with_factory(config, Arc::new(Greeter));
    let mut journal = RunJournal::new();

    forge
        .prepare_request(&source, "greet", TargetType::Function, None, &mut journal)
        .unwrap();
    forge
        .store()
        .save(
            "greet",
            TargetType::Function,
            vec![TestCase::new("ada", json!(["ada"]), json!("Hello, ada"))],
        )
        .unwrap();

    let report = forge
        .mutate("greet", TargetType::Function, &mut journal)
        .await
        .unwrap();
    assert_eq!(report.generated, 10);
    // empty string, null, undefined and the truncated call
    assert_eq!(report.dropped, 4);
    assert_eq!(report.added, 6);

    let cases = forge.store().load("greet").unwrap();
    let ids: Vec<&str> = cases.iter().map(|c| c.id.as_str()).collect();
    assert!(ids.contains(&"mut_ada_0_string_long"));
    assert!(ids.contains(&"mut_ada_0_string_unicode"));
    assert!(!ids.contains(&"mut_ada_0_string_empty"));
    assert!(cases.iter().all(|c| c.expected.is_some()));

    // Later runs sample other recorded cases and keep growing the store
    let mut later_added = 0;
    for seed in 2..=9 {
        let mut config = forge.config().clone();
        config.mutation.seed = Some(seed);
        let reseeded = Forge::with_factory(config, Arc::new(Greeter));
        let report = reseeded
            .mutate("greet", TargetType::Function, &mut journal)
            .await
            .unwrap();
        assert_eq!(report.generated, report.dropped + report.added + report.skipped);
        later_added += report.added;
    }
    assert!(later_added > 0, "runs after the first must still add cases");
    assert!(forge.store().load("greet").unwrap().len() > cases.len());
}

#[tokio::test]
async fn evolve_records_generator_output_with_lineage() {
    let dir = tempdir().unwrap();
    let (forge, source) = setup(dir.path());

    let script = r"cat > /dev/null; printf '```js\nfunction sum(n) {\n  return n * (n + 1) / 2;\n}\n```\ntags: closed-form\n'";
    let mut config = forge.config().clone();
    config.generator = Some(GeneratorConfig {
        command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        timeout_secs: 10,
        generations: 1,
        ..GeneratorConfig::default()
    });
    let forge = Forge::with_factory(config, Arc::new(ById));
    record_cases(&forge);

    let mut journal = RunJournal::new();
    let summary = forge
        .evolve(&source, "sum", TargetType::Function, Some("fastest"), None, &mut journal)
        .await
        .unwrap();

    assert_eq!(summary.generations.len(), 1);
    let first = &summary.generations[0];
    assert_eq!(first.parent, "baseline");
    assert_eq!(first.created.len(), 1, "failures: {:?}", first.failures);

    let id = &first.created[0];
    assert!(id.starts_with("gen1_"));
    let file = forge.workspace().variants_dir("sum").join(format!("{}.js", id));
    let meta = forge.tracker().load(&file).unwrap().unwrap();
    assert_eq!(meta.origin.as_deref(), Some("baseline"));
    assert_eq!(meta.generation, 1);
    assert_eq!(meta.agent, "generator");
    assert_eq!(meta.tags, vec!["closed-form".to_string()]);

    assert_eq!(summary.report.recommendation.winner.as_deref(), Some(id.as_str()));
    assert_eq!(forge.lineage("sum").unwrap().ancestor_counts.get("baseline"), Some(&1));
}
