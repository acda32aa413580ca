//! Variant Runner / Benchmark Harness
//!
//! Runs every variant of a target against the recorded cases, one variant at a
//! time and one case at a time. Per-variant failures (load errors, faults,
//! timeouts) are recorded on that variant and the run continues.
//!
//! # Timing protocol
//!
//! Each case calls the variant `iterations` times inside a single
//! `tokio::time::timeout`. The average call duration is recorded and only the
//! final call's output is compared against the expectation. A timeout fails
//! that case and every later case of the same variant; the invoker is dropped,
//! which kills a child runner.

use crate::config::ForgeConfig;
use crate::equality::deep_equal;
use crate::error::{FailureKind, ForgeError, Result, VariantError};
use crate::extractor::{self, placeholders};
use crate::invoker::{as_args, Invokable, InvokerFactory, RegexInvoker, VariantSource};
use crate::journal::{RunJournal, Stage};
use crate::scorer;
use crate::types::{BenchmarkResult, CaseResult, ExtractedItem, TargetType, TestCase, VariantResult};
use chrono::Utc;
use serde_json::Value;
use std::hint::black_box;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;

/// Floor on whole-corpus passes for regex throughput
pub const MIN_REGEX_PASSES: u32 = 1000;

#[derive(Debug, Clone)]
pub struct BenchSettings {
    pub iterations: u32,
    pub regex_iterations: u32,
    pub case_timeout: Duration,
}

impl BenchSettings {
    pub fn from_config(config: &ForgeConfig) -> Self {
        Self {
            iterations: config.iterations.max(1),
            regex_iterations: config.regex_iterations.max(MIN_REGEX_PASSES),
            case_timeout: config.case_timeout(),
        }
    }
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self::from_config(&ForgeConfig::default())
    }
}

/// A candidate file in `variants/<target>/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantFile {
    pub id: String,
    pub path: PathBuf,
    pub is_baseline: bool,
}

/// Candidate files in sorted name order; sidecars and hidden files are ignored.
pub fn discover_variants(dir: &Path) -> Result<Vec<VariantFile>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(dir).map_err(|e| ForgeError::io(dir, e))?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ForgeError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') || name.ends_with(".meta.json") {
            continue;
        }
        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name)
            .to_string();
        files.push(VariantFile {
            is_baseline: id == "baseline",
            id,
            path,
        });
    }
    files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(files)
}

/// Resident memory of `pid`, or of this process when `None`, in KiB.
pub fn resident_memory_kb(pid: Option<u32>) -> Option<f64> {
    let pid = match pid {
        Some(id) => sysinfo::Pid::from_u32(id),
        None => sysinfo::get_current_pid().ok()?,
    };
    let mut sys = System::new();
    sys.refresh_process(pid);
    sys.process(pid).map(|p| p.memory() as f64 / 1024.0)
}

/// Run `iterations` calls; returns the last output plus average and max call time (ms).
async fn run_iterations(
    invoker: &dyn Invokable,
    args: &[Value],
    iterations: u32,
) -> Result<(Value, f64, f64)> {
    let mut total_ms = 0.0;
    let mut max_ms: f64 = 0.0;
    let mut last = Value::Null;
    for _ in 0..iterations {
        let start = Instant::now();
        last = invoker.invoke(args).await?;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        total_ms += ms;
        max_ms = max_ms.max(ms);
    }
    Ok((last, total_ms / iterations.max(1) as f64, max_ms))
}

fn failed_case(case: &TestCase, error: VariantError) -> CaseResult {
    CaseResult {
        case_id: case.id.clone(),
        expected: case.expected.clone(),
        actual: None,
        duration_ms: 0.0,
        passed: false,
        error: Some(error),
    }
}

fn mark_load_failure(variant: &mut VariantResult, cases: usize, reason: String) {
    let err = ForgeError::LoadFailure {
        variant: variant.variant_id.clone(),
        reason,
    };
    variant.failed = cases;
    variant.errors.push(err.to_variant_error());
}

/// Whether brackets balance, ignoring anything inside quotes.
fn brackets_balanced(code: &str) -> bool {
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for c in code.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '(' | '[' | '{' => stack.push(c),
            ')' | ']' | '}' => {
                let open = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if stack.pop() != Some(open) {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

pub struct BenchmarkHarness {
    settings: BenchSettings,
    factory: Arc<dyn InvokerFactory>,
}

impl BenchmarkHarness {
    pub fn new(settings: BenchSettings, factory: Arc<dyn InvokerFactory>) -> Self {
        Self { settings, factory }
    }

    pub fn settings(&self) -> &BenchSettings {
        &self.settings
    }

    /// Benchmark every variant. The result is unscored and has no winner yet.
    pub async fn run(
        &self,
        target: &str,
        kind: TargetType,
        variants: &[VariantFile],
        cases: &[TestCase],
        journal: &mut RunJournal,
    ) -> BenchmarkResult {
        let degraded = !kind.has_live_backend();
        let usable: Vec<TestCase> = if degraded {
            cases.to_vec()
        } else {
            cases
                .iter()
                .filter(|c| {
                    if c.expected.is_none() {
                        journal.warn(
                            Stage::Bench,
                            format!("{}: case `{}` has no expected output, skipped", target, c.id),
                        );
                        false
                    } else {
                        true
                    }
                })
                .cloned()
                .collect()
        };

        log::info!(
            "Benchmarking {} `{}`: {} variant(s) x {} case(s)",
            kind,
            target,
            variants.len(),
            usable.len()
        );

        let mut result = BenchmarkResult {
            target: target.to_string(),
            target_type: kind,
            timestamp: Utc::now(),
            profile: String::new(),
            total_cases: usable.len(),
            variants: Vec::with_capacity(variants.len()),
            winner: None,
            reason: String::new(),
            degraded,
        };

        for file in variants {
            let vr = self.bench_variant(target, kind, file, &usable, journal).await;
            journal.incr("variants", 1);
            journal.note(
                Stage::Bench,
                format!(
                    "{}/{}: {}/{} passed, {} error(s)",
                    target,
                    vr.variant_id,
                    vr.passed,
                    vr.total(),
                    vr.errors.len()
                ),
            );
            result.variants.push(vr);
        }
        result
    }

    async fn bench_variant(
        &self,
        target: &str,
        kind: TargetType,
        file: &VariantFile,
        cases: &[TestCase],
        journal: &mut RunJournal,
    ) -> VariantResult {
        let mut vr = VariantResult::new(&file.id, &file.path, file.is_baseline);

        let source = match std::fs::read_to_string(&file.path) {
            Ok(s) => s,
            Err(e) => {
                mark_load_failure(&mut vr, cases.len(), format!("unreadable: {}", e));
                journal.warn(Stage::Bench, format!("{}: cannot read {}", file.id, file.path.display()));
                return vr;
            }
        };

        let Some(item) = extractor::find_unit(&source, &file.path, kind, target) else {
            let miss = ForgeError::ExtractionMiss {
                name: target.to_string(),
                kind,
                file: file.path.clone(),
            };
            journal.warn(Stage::Bench, format!("{}: {}", file.id, miss));
            mark_load_failure(&mut vr, cases.len(), miss.to_string());
            return vr;
        };
        vr.complexity = scorer::complexity(&item.code);

        match kind {
            TargetType::Function => self.bench_function(&mut vr, target, file, item, cases, journal).await,
            TargetType::Regex => self.bench_regex(&mut vr, &item, cases),
            _ => bench_static(&mut vr, &item, cases),
        }
        vr
    }

    async fn bench_function(
        &self,
        vr: &mut VariantResult,
        target: &str,
        file: &VariantFile,
        item: ExtractedItem,
        cases: &[TestCase],
        journal: &mut RunJournal,
    ) {
        let source = VariantSource {
            id: file.id.clone(),
            file: file.path.clone(),
            target: target.to_string(),
            item,
        };
        let invoker = match self.factory.resolve(&source).await {
            Ok(invoker) => invoker,
            Err(e) => {
                journal.warn(Stage::Bench, format!("{}: {}", file.id, e));
                let reason = match e {
                    ForgeError::LoadFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                mark_load_failure(vr, cases.len(), reason);
                return;
            }
        };

        let timeout = self.settings.case_timeout;
        // Child runners are measured themselves; in-process invokers fall back to this process.
        let sampled_pid = invoker.pid();
        let memory_before = resident_memory_kb(sampled_pid);
        let mut averages = Vec::new();
        let mut slowest: f64 = 0.0;
        let mut timed_out = false;

        for case in cases {
            if timed_out {
                vr.push_case(failed_case(
                    case,
                    VariantError::new(
                        FailureKind::EvaluationTimeout,
                        "not run: an earlier case timed out",
                    ),
                ));
                continue;
            }

            let args = as_args(&case.input);
            let run = run_iterations(invoker.as_ref(), &args, self.settings.iterations);
            match tokio::time::timeout(timeout, run).await {
                Err(_) => {
                    timed_out = true;
                    journal.warn(
                        Stage::Bench,
                        format!("{}: case `{}` exceeded {}ms", file.id, case.id, timeout.as_millis()),
                    );
                    vr.push_case(failed_case(
                        case,
                        ForgeError::EvaluationTimeout(timeout).to_variant_error(),
                    ));
                }
                Ok(Err(e)) => {
                    log::debug!("{}: case `{}` faulted: {}", file.id, case.id, e);
                    vr.push_case(failed_case(case, e.to_variant_error()));
                }
                Ok(Ok((actual, avg_ms, max_ms))) => {
                    let passed = case
                        .expected
                        .as_ref()
                        .map_or(false, |expected| deep_equal(&actual, expected));
                    averages.push(avg_ms);
                    slowest = slowest.max(max_ms);
                    vr.push_case(CaseResult {
                        case_id: case.id.clone(),
                        expected: case.expected.clone(),
                        actual: Some(actual),
                        duration_ms: avg_ms,
                        passed,
                        error: None,
                    });
                }
            }
        }

        // A respawned runner is a different process; its delta would be meaningless.
        let memory_after = if invoker.pid() == sampled_pid {
            resident_memory_kb(sampled_pid)
        } else {
            None
        };
        drop(invoker);

        if !averages.is_empty() {
            let avg = averages.iter().sum::<f64>() / averages.len() as f64;
            vr.metrics.insert("avg_duration_ms".to_string(), avg);
            vr.metrics.insert("max_duration_ms".to_string(), slowest);
        }
        if let (Some(before), Some(after)) = (memory_before, memory_after) {
            vr.metrics.insert("memory_delta_kb".to_string(), after - before);
        }
    }

    fn bench_regex(&self, vr: &mut VariantResult, item: &ExtractedItem, cases: &[TestCase]) {
        let pattern = item.meta_str("pattern").unwrap_or_default();
        let flags = item.meta_str("flags").unwrap_or_default();
        let regex = match RegexInvoker::compile(pattern, flags) {
            Ok(r) => r,
            Err(e) => {
                mark_load_failure(vr, cases.len(), format!("pattern does not compile: {}", e));
                return;
            }
        };

        let mut false_positives = 0.0;
        let mut false_negatives = 0.0;
        let mut corpus: Vec<&str> = Vec::new();

        for case in cases {
            let Some(input) = case.input.as_str() else {
                vr.push_case(failed_case(
                    case,
                    VariantError::new(FailureKind::RuntimeFault, "regex input must be a string"),
                ));
                continue;
            };
            corpus.push(input);

            let start = Instant::now();
            let actual = match &case.expected {
                Some(Value::Array(_)) => Value::from(regex.matches(input)),
                Some(Value::Bool(_)) | None => Value::Bool(regex.regex().is_match(input)),
                Some(_) => regex
                    .regex()
                    .find(input)
                    .map_or(Value::Null, |m| Value::from(m.as_str())),
            };
            let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

            let passed = case
                .expected
                .as_ref()
                .map_or(false, |expected| deep_equal(&actual, expected));
            if let (Some(Value::Bool(want)), Value::Bool(got)) = (&case.expected, &actual) {
                if *got && !*want {
                    false_positives += 1.0;
                }
                if !*got && *want {
                    false_negatives += 1.0;
                }
            }
            vr.push_case(CaseResult {
                case_id: case.id.clone(),
                expected: case.expected.clone(),
                actual: Some(actual),
                duration_ms,
                passed,
                error: None,
            });
        }

        vr.metrics.insert("false_positives".to_string(), false_positives);
        vr.metrics.insert("false_negatives".to_string(), false_negatives);
        vr.metrics.insert("accuracy".to_string(), vr.pass_rate());

        if corpus.is_empty() {
            return;
        }
        let passes = self.settings.regex_iterations.max(MIN_REGEX_PASSES);
        let start = Instant::now();
        for _ in 0..passes {
            for input in &corpus {
                black_box(regex.regex().is_match(black_box(input)));
            }
        }
        let elapsed = start.elapsed().as_secs_f64().max(1e-9);
        let matches = passes as f64 * corpus.len() as f64;
        let us_per_pass = elapsed * 1_000_000.0 / passes as f64;

        vr.metrics.insert("ops_per_sec".to_string(), matches / elapsed);
        vr.metrics.insert("us_per_pass".to_string(), us_per_pass);
        vr.metrics
            .insert("avg_duration_ms".to_string(), elapsed * 1000.0 / matches);
    }
}

/// Structural heuristic for types with no live backend. Every case passes.
fn bench_static(vr: &mut VariantResult, item: &ExtractedItem, cases: &[TestCase]) {
    vr.degraded = true;
    let estimated_tokens = (item.code.chars().count() as f64 / 4.0).ceil();
    let structure_ok = match item.kind {
        TargetType::Query => {
            let inner = item.code.trim_matches(|c| c == '`' || c == '"' || c == '\'');
            extractor::query_language(inner, item.meta_str("tag")).is_some() && brackets_balanced(inner)
        }
        _ => brackets_balanced(&item.code),
    };

    vr.metrics.insert("estimated_tokens".to_string(), estimated_tokens);
    vr.metrics
        .insert("placeholders".to_string(), placeholders(&item.code).len() as f64);
    vr.metrics
        .insert("structure_ok".to_string(), if structure_ok { 1.0 } else { 0.0 });

    for case in cases {
        vr.push_case(CaseResult {
            case_id: case.id.clone(),
            expected: case.expected.clone(),
            actual: None,
            duration_ms: 0.0,
            passed: true,
            error: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::FnInvoker;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::tempdir;

    struct Fixed;

    #[async_trait]
    impl InvokerFactory for Fixed {
        async fn resolve(&self, variant: &VariantSource) -> Result<Box<dyn Invokable>> {
            match variant.id.as_str() {
                "never" => Ok(Box::new(Stall)),
                "faulty" => Ok(Box::new(FnInvoker::new(|_| Err("boom".to_string())))),
                _ => Ok(Box::new(FnInvoker::new(|args| {
                    let n = args.first().and_then(Value::as_i64).unwrap_or(0);
                    Ok(json!(n + 1))
                }))),
            }
        }
    }

    /// Never completes
    struct Stall;

    #[async_trait]
    impl Invokable for Stall {
        async fn invoke(&self, _args: &[Value]) -> Result<Value> {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        }
    }

    fn cases() -> Vec<TestCase> {
        vec![
            TestCase::new("one", json!([1]), json!(2)),
            TestCase::new("two", json!([5]), json!(6)),
            TestCase::new("three", json!([9]), json!(10)),
        ]
    }

    fn write_variants(dir: &Path, ids: &[&str]) -> Vec<VariantFile> {
        for id in ids {
            std::fs::write(
                dir.join(format!("{}.js", id)),
                "function inc(n) {\n  return n + 1;\n}\n",
            )
            .unwrap();
        }
        std::fs::write(dir.join("b.js.meta.json"), "{}").unwrap();
        std::fs::write(dir.join(".hidden.js"), "").unwrap();
        discover_variants(dir).unwrap()
    }

    fn harness(timeout_ms: u64) -> BenchmarkHarness {
        BenchmarkHarness::new(
            BenchSettings {
                iterations: 3,
                regex_iterations: MIN_REGEX_PASSES,
                case_timeout: Duration::from_millis(timeout_ms),
            },
            Arc::new(Fixed),
        )
    }

    #[test]
    fn test_discover_variants_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        let found = write_variants(dir.path(), &["c", "baseline", "b"]);
        let ids: Vec<&str> = found.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "baseline", "c"]);
        assert!(found[1].is_baseline);
        assert!(discover_variants(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_function_bench_records_metrics() {
        let dir = tempdir().unwrap();
        let variants = write_variants(dir.path(), &["baseline", "faulty"]);
        let mut journal = RunJournal::new();

        let result = harness(1000)
            .run("inc", TargetType::Function, &variants, &cases(), &mut journal)
            .await;

        let baseline = result.variant("baseline").unwrap();
        assert_eq!(baseline.passed, 3);
        assert!(baseline.metric("avg_duration_ms").is_some());
        assert!(baseline.complexity > 0.0);

        let faulty = result.variant("faulty").unwrap();
        assert_eq!(faulty.failed, 3);
        assert_eq!(faulty.errors.len(), 3);
        assert!(faulty.errors.iter().all(|e| e.kind == FailureKind::RuntimeFault));
        assert_eq!(journal.counter("variants"), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_contained() {
        let dir = tempdir().unwrap();
        let variants = write_variants(dir.path(), &["never", "ok"]);
        let mut journal = RunJournal::new();

        let start = Instant::now();
        let result = harness(100)
            .run("inc", TargetType::Function, &variants, &cases(), &mut journal)
            .await;
        let elapsed = start.elapsed();

        // One timeout, then the remaining cases are skipped rather than re-run.
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(2000), "took {:?}", elapsed);

        let never = result.variant("never").unwrap();
        assert_eq!(never.passed, 0);
        assert!(never
            .errors
            .iter()
            .all(|e| e.kind == FailureKind::EvaluationTimeout));
        assert_eq!(never.errors.len(), 3);
        assert_eq!(result.variant("ok").unwrap().passed, 3);
    }

    #[tokio::test]
    async fn test_missing_unit_is_load_failure() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("baseline.js"), "function other() { return 1; }\n").unwrap();
        let variants = discover_variants(dir.path()).unwrap();
        let mut journal = RunJournal::new();

        let result = harness(1000)
            .run("inc", TargetType::Function, &variants, &cases(), &mut journal)
            .await;
        let baseline = result.baseline().unwrap();
        assert_eq!(baseline.passed, 0);
        assert_eq!(baseline.failed, 3);
        assert_eq!(baseline.errors[0].kind, FailureKind::LoadFailure);
        assert_eq!(journal.warnings().count(), 1);
    }

    #[tokio::test]
    async fn test_regex_bench() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("baseline.js"), "const email = /^\\S+@\\S+$/;\n").unwrap();
        std::fs::write(dir.path().join("loose.js"), "const email = /@/;\n").unwrap();
        std::fs::write(dir.path().join("broken.js"), "const email = /(?<=x/;\n").unwrap();
        let variants = discover_variants(dir.path()).unwrap();

        let corpus = vec![
            TestCase::new("ok", json!("a@b.co"), json!(true)),
            TestCase::new("space", json!("a b@c.d"), json!(false)),
            TestCase::new("none", json!("plain"), json!(false)),
        ];
        let mut journal = RunJournal::new();
        let result = harness(1000)
            .run("email", TargetType::Regex, &variants, &corpus, &mut journal)
            .await;

        let baseline = result.baseline().unwrap();
        assert_eq!(baseline.passed, 3);
        assert_eq!(baseline.metric("accuracy"), Some(1.0));
        assert!(baseline.metric("ops_per_sec").unwrap() > 0.0);

        let loose = result.variant("loose").unwrap();
        assert_eq!(loose.metric("false_positives"), Some(1.0));
        assert_eq!(loose.metric("false_negatives"), Some(0.0));

        let broken = result.variant("broken").unwrap();
        assert_eq!(broken.errors[0].kind, FailureKind::LoadFailure);
    }

    #[tokio::test]
    async fn test_static_types_are_degraded() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("baseline.js"),
            "const SUMMARY_PROMPT = `Summarize ${doc} briefly.`;\n",
        )
        .unwrap();
        let variants = discover_variants(dir.path()).unwrap();
        let cases = vec![TestCase {
            id: "doc".to_string(),
            input: json!({"doc": "text"}),
            expected: None,
            description: None,
            min_score: None,
        }];
        let mut journal = RunJournal::new();
        let result = harness(1000)
            .run("SUMMARY_PROMPT", TargetType::Prompt, &variants, &cases, &mut journal)
            .await;

        assert!(result.degraded);
        let baseline = result.baseline().unwrap();
        assert!(baseline.degraded);
        assert_eq!(baseline.passed, 1);
        assert_eq!(baseline.metric("placeholders"), Some(1.0));
        assert_eq!(baseline.metric("structure_ok"), Some(1.0));
    }
}
