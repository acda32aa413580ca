//! Mutation Generator - adversarial inputs derived from recorded cases
//!
//! A recorded case is sampled and each argument position is perturbed with
//! hostile values for its category. The trusted baseline then decides what the
//! expected output is; inputs the baseline itself rejects are out of contract
//! and dropped.
//!
//! Values JSON cannot carry travel as sentinel objects:
//! `{"$special": "Infinity" | "-Infinity" | "NaN" | "undefined"}`.

use crate::invoker::{as_args, Invokable};
use crate::types::TestCase;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Length of the "very long" string mutation
pub const VERY_LONG_LEN: usize = 10_000;

pub const SPECIAL_KEY: &str = "$special";

pub fn special(name: &str) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(SPECIAL_KEY.to_string(), Value::from(name));
    Value::Object(map)
}

/// The sentinel name if `value` is a non-JSON placeholder.
pub fn special_name(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(SPECIAL_KEY).and_then(Value::as_str),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgCategory {
    String,
    Number,
    /// null or undefined
    Absent,
    Other,
}

impl ArgCategory {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ArgCategory::String,
            Value::Number(_) => ArgCategory::Number,
            Value::Null => ArgCategory::Absent,
            v if special_name(v) == Some("undefined") => ArgCategory::Absent,
            v if special_name(v).is_some() => ArgCategory::Number,
            _ => ArgCategory::Other,
        }
    }
}

fn string_mutations() -> Vec<(&'static str, Value)> {
    vec![
        ("empty", json!("")),
        ("whitespace", json!(" \t\n  ")),
        ("long", json!("x".repeat(VERY_LONG_LEN))),
        ("unicode", json!("Ünïcødé 日本語 Ελληνικά")),
        ("emoji", json!("🚀🔥👍🏽👨‍👩‍👧")),
        ("markup", json!("<script>alert('x')</script>' OR '1'='1")),
        ("numeric", json!("12345")),
    ]
}

fn number_mutations() -> Vec<(&'static str, Value)> {
    vec![
        ("zero", json!(0)),
        ("one", json!(1)),
        ("neg_one", json!(-1)),
        ("max", json!(f64::MAX)),
        ("min", json!(f64::MIN)),
        ("min_positive", json!(f64::MIN_POSITIVE)),
        ("inf", special("Infinity")),
        ("neg_inf", special("-Infinity")),
        ("nan", special("NaN")),
        ("float_sum", json!(0.1 + 0.2)),
        ("unsafe_int", json!(9_007_199_254_740_993u64)),
    ]
}

/// Outcome of one `mutate` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationReport {
    pub generated: usize,
    /// Inputs the baseline itself rejected
    pub dropped: usize,
    pub added: usize,
    /// Already present in the store
    pub skipped: usize,
}

pub struct MutationGenerator {
    rng: fastrand::Rng,
}

impl MutationGenerator {
    /// A fixed seed makes sampling reproducible.
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            rng: seed.map(fastrand::Rng::with_seed).unwrap_or_else(fastrand::Rng::new),
        }
    }

    pub fn infer_categories(input: &Value) -> Vec<ArgCategory> {
        as_args(input).iter().map(ArgCategory::of).collect()
    }

    /// Mutated cases (without expectations) from one sampled case, capped at `max`.
    pub fn generate(&mut self, cases: &[TestCase], max: usize) -> Vec<TestCase> {
        if cases.is_empty() || max == 0 {
            return Vec::new();
        }
        let sample = &cases[self.rng.usize(..cases.len())];
        let spread = sample.input.is_array();
        let args = as_args(&sample.input);
        let categories = Self::infer_categories(&sample.input);

        let rebuild = |position: usize, value: Value| -> Value {
            if spread {
                let mut next = args.clone();
                next[position] = value;
                Value::Array(next)
            } else {
                value
            }
        };

        let mut out = Vec::new();
        for (position, category) in categories.iter().enumerate() {
            let typed: Vec<(&str, &str, Value)> = match category {
                ArgCategory::String => string_mutations()
                    .into_iter()
                    .map(|(label, v)| ("string", label, v))
                    .collect(),
                ArgCategory::Number => number_mutations()
                    .into_iter()
                    .map(|(label, v)| ("number", label, v))
                    .collect(),
                ArgCategory::Absent | ArgCategory::Other => Vec::new(),
            };

            let universal = [
                ("null", "null", Value::Null),
                ("undefined", "undefined", special("undefined")),
            ];

            for (kind, label, value) in typed.into_iter().chain(universal) {
                out.push(
                    TestCase {
                        id: format!("mut_{}_{}_{}_{}", sample.id, position, kind, label),
                        input: rebuild(position, value),
                        expected: None,
                        description: None,
                        min_score: None,
                    }
                    .with_description(format!(
                        "{} {} at argument {} (from `{}`)",
                        kind, label, position, sample.id
                    )),
                );
            }
        }

        if let Some(last) = args.len().checked_sub(1) {
            let truncated = Value::Array(args[..last].to_vec());
            out.push(
                TestCase {
                    id: format!("mut_{}_{}_missing_truncated", sample.id, last),
                    input: truncated,
                    expected: None,
                    description: None,
                    min_score: None,
                }
                .with_description(format!("argument {} omitted (from `{}`)", last, sample.id)),
            );
        }

        out.truncate(max);
        out
    }
}

/// Run the trusted baseline over `cases`, adopting its outputs as expectations.
/// Inputs the baseline faults or stalls on are dropped; the count is returned.
pub async fn establish_expectations(
    cases: Vec<TestCase>,
    baseline: &dyn Invokable,
    timeout: Duration,
) -> (Vec<TestCase>, usize) {
    let mut kept = Vec::with_capacity(cases.len());
    let mut dropped = 0;

    for mut case in cases {
        let args = as_args(&case.input);
        match tokio::time::timeout(timeout, baseline.invoke(&args)).await {
            Ok(Ok(output)) => {
                case.expected = Some(output);
                kept.push(case);
            }
            Ok(Err(e)) => {
                log::debug!("dropping `{}`: baseline rejected it ({})", case.id, e);
                dropped += 1;
            }
            Err(_) => {
                log::debug!("dropping `{}`: baseline timed out", case.id);
                dropped += 1;
            }
        }
    }
    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoker::FnInvoker;

    fn sample() -> Vec<TestCase> {
        vec![TestCase::new("greet", json!(["ada", 3]), json!("ada!!!"))]
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            MutationGenerator::infer_categories(&json!(["s", 1, null, true])),
            vec![
                ArgCategory::String,
                ArgCategory::Number,
                ArgCategory::Absent,
                ArgCategory::Other
            ]
        );
        assert_eq!(ArgCategory::of(&special("undefined")), ArgCategory::Absent);
        assert_eq!(ArgCategory::of(&special("NaN")), ArgCategory::Number);
    }

    #[test]
    fn test_generate_covers_hostile_strings() {
        let mut gen = MutationGenerator::new(Some(7));
        let cases = gen.generate(&sample(), 1000);

        let by_id = |id: &str| cases.iter().find(|c| c.id == id).unwrap();
        assert_eq!(by_id("mut_greet_0_string_empty").input, json!(["", 3]));
        assert_eq!(
            by_id("mut_greet_0_string_long").input[0].as_str().unwrap().len(),
            VERY_LONG_LEN
        );
        assert!(!by_id("mut_greet_0_string_unicode").input[0].as_str().unwrap().is_ascii());
        assert_eq!(by_id("mut_greet_1_number_nan").input, json!(["ada", {"$special": "NaN"}]));
        assert_eq!(by_id("mut_greet_1_null_null").input, json!(["ada", null]));
        assert_eq!(by_id("mut_greet_1_missing_truncated").input, json!(["ada"]));
        assert!(cases.iter().all(|c| c.expected.is_none()));

        let mut ids: Vec<&str> = cases.iter().map(|c| c.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), cases.len());
    }

    #[test]
    fn test_ids_carry_the_sampled_case() {
        let first = TestCase::new("s1", json!(["ada", 3]), json!("ada!!!"));
        let second = TestCase::new("s2", json!(["bo", 1]), json!("bo!"));
        let mut gen = MutationGenerator::new(Some(3));

        let from_first = gen.generate(std::slice::from_ref(&first), 1000);
        let from_second = gen.generate(std::slice::from_ref(&second), 1000);
        assert_eq!(from_first.len(), from_second.len());
        assert!(from_first.iter().all(|c| c.id.starts_with("mut_s1_")));
        assert!(from_second
            .iter()
            .all(|c| !from_first.iter().any(|f| f.id == c.id)));
    }

    #[test]
    fn test_scalar_input_and_cap() {
        let mut gen = MutationGenerator::new(Some(1));
        let cases = gen.generate(&[TestCase::new("n", json!(5), json!(25))], 3);
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[0].input, json!(0));
        assert!(gen.generate(&[], 10).is_empty());
    }

    #[tokio::test]
    async fn test_establish_drops_baseline_failures() {
        let baseline = FnInvoker::new(|args| match args.first() {
            Some(Value::String(s)) if !s.is_empty() => Ok(json!(s.len())),
            _ => Err("out of contract".to_string()),
        });
        let cases = vec![
            TestCase {
                id: "a".into(),
                input: json!(["abc"]),
                expected: None,
                description: None,
                min_score: None,
            },
            TestCase {
                id: "b".into(),
                input: json!([""]),
                expected: None,
                description: None,
                min_score: None,
            },
            TestCase {
                id: "c".into(),
                input: json!([null]),
                expected: None,
                description: None,
                min_score: None,
            },
        ];

        let (kept, dropped) =
            establish_expectations(cases, &baseline, Duration::from_secs(1)).await;
        assert_eq!(dropped, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].expected, Some(json!(3)));
    }
}
