//! TestCase Store - persisted input/expected pairs per target
//!
//! The store is append-only: merging never rewrites or removes an existing
//! case, and a case whose id is already present is skipped.

use crate::error::Result;
use crate::types::{TargetType, TestCase};
use crate::workspace::{self, Workspace};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// On-disk shape of `tests/<target>.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SuiteFile {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    cases: Vec<TestCase>,
    /// Regex targets keep their inputs under `corpus`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    corpus: Vec<TestCase>,
}

impl SuiteFile {
    fn into_cases(self) -> Vec<TestCase> {
        let mut all = self.cases;
        all.extend(self.corpus);
        all
    }

    fn from_cases(kind: TargetType, cases: Vec<TestCase>) -> Self {
        if kind.uses_corpus() {
            Self {
                cases: Vec::new(),
                corpus: cases,
            }
        } else {
            Self {
                cases,
                corpus: Vec::new(),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: usize,
    pub skipped: usize,
}

pub struct TestCaseStore {
    workspace: Workspace,
}

impl TestCaseStore {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// All cases for a target; a missing suite is empty. Blank ids become `case_<n>`.
    pub fn load(&self, target: &str) -> Result<Vec<TestCase>> {
        let path = self.workspace.tests_path(target);
        let suite: SuiteFile = workspace::read_json_opt(&path)?.unwrap_or_default();
        let mut cases = suite.into_cases();
        for (i, case) in cases.iter_mut().enumerate() {
            if case.id.trim().is_empty() {
                case.id = format!("case_{}", i + 1);
            }
        }
        Ok(cases)
    }

    pub fn save(&self, target: &str, kind: TargetType, cases: Vec<TestCase>) -> Result<()> {
        let path = self.workspace.tests_path(target);
        workspace::write_json(&path, &SuiteFile::from_cases(kind, cases))
    }

    /// Append cases whose ids are not yet present.
    pub fn merge(&self, target: &str, kind: TargetType, incoming: Vec<TestCase>) -> Result<MergeSummary> {
        let mut cases = self.load(target)?;
        let mut seen: HashSet<String> = cases.iter().map(|c| c.id.clone()).collect();
        let mut summary = MergeSummary::default();

        for case in incoming {
            if seen.insert(case.id.clone()) {
                cases.push(case);
                summary.added += 1;
            } else {
                summary.skipped += 1;
            }
        }

        if summary.added > 0 {
            self.save(target, kind, cases)?;
        }
        log::info!(
            "{}: merged {} case(s), skipped {} duplicate(s)",
            target,
            summary.added,
            summary.skipped
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_missing_suite_is_empty() {
        let dir = tempdir().unwrap();
        let store = TestCaseStore::new(Workspace::new(dir.path()));
        assert!(store.load("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_merge_dedupes_by_id() {
        let dir = tempdir().unwrap();
        let store = TestCaseStore::new(Workspace::new(dir.path()));

        let first = vec![
            TestCase::new("a", json!([1]), json!(2)),
            TestCase::new("b", json!([2]), json!(3)),
        ];
        assert_eq!(
            store.merge("inc", TargetType::Function, first).unwrap(),
            MergeSummary { added: 2, skipped: 0 }
        );

        let second = vec![
            TestCase::new("b", json!([99]), json!(0)),
            TestCase::new("c", json!([3]), json!(4)),
        ];
        let summary = store.merge("inc", TargetType::Function, second).unwrap();
        assert_eq!(summary, MergeSummary { added: 1, skipped: 1 });

        let cases = store.load("inc").unwrap();
        assert_eq!(cases.len(), 3);
        assert_eq!(cases[1].input, json!([2]));
    }

    #[test]
    fn test_regex_corpus_shape() {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        std::fs::create_dir_all(dir.path().join("tests")).unwrap();
        std::fs::write(
            ws.tests_path("email"),
            r#"{"corpus": [{"input": "a@b.co", "shouldMatch": true}, {"input": "nope", "shouldMatch": false}]}"#,
        )
        .unwrap();

        let store = TestCaseStore::new(ws.clone());
        let cases = store.load("email").unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].id, "case_1");
        assert_eq!(cases[1].expected, Some(json!(false)));

        store
            .merge(
                "email",
                TargetType::Regex,
                vec![TestCase::new("x", json!("x@y.z"), json!(true))],
            )
            .unwrap();
        let raw: serde_json::Value = workspace::read_json(&ws.tests_path("email")).unwrap();
        assert_eq!(raw["corpus"].as_array().unwrap().len(), 3);
        assert!(raw.get("cases").is_none());
    }
}
