//! Core data structures shared by extraction, benchmarking, scoring and patching.

use crate::error::VariantError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Category of code unit being optimized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Function,
    Regex,
    Prompt,
    Query,
    Config,
    Struct,
}

impl TargetType {
    pub const ALL: [TargetType; 6] = [
        TargetType::Function,
        TargetType::Regex,
        TargetType::Prompt,
        TargetType::Query,
        TargetType::Config,
        TargetType::Struct,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetType::Function => "function",
            TargetType::Regex => "regex",
            TargetType::Prompt => "prompt",
            TargetType::Query => "query",
            TargetType::Config => "config",
            TargetType::Struct => "struct",
        }
    }

    /// Pattern targets keep their test cases under `corpus` instead of `cases`.
    pub fn uses_corpus(&self) -> bool {
        matches!(self, TargetType::Regex)
    }

    /// Whether a live evaluation backend exists for this type.
    pub fn has_live_backend(&self) -> bool {
        matches!(self, TargetType::Function | TargetType::Regex)
    }
}

impl std::fmt::Display for TargetType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s.to_lowercase())
            .ok_or_else(|| {
                format!(
                    "invalid target type: {} (must be function/regex/prompt/query/config/struct)",
                    s
                )
            })
    }
}

/// A located unit of source code.
///
/// `code == source[start..end]` holds only for the file contents at extraction
/// time. Offsets go stale on any edit, so the patcher re-resolves by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedItem {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TargetType,
    pub code: String,
    pub start: usize,
    pub end: usize,
    pub file: PathBuf,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ExtractedItem {
    pub fn line_count(&self) -> usize {
        self.code.lines().count().max(1)
    }

    /// 1-based line of the unit's first character within `source`.
    pub fn start_line(&self, source: &str) -> usize {
        source[..self.start.min(source.len())].matches('\n').count() + 1
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }
}

/// A recorded input/expected-output pair for one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(default)]
    pub id: String,
    pub input: Value,
    #[serde(
        default,
        alias = "shouldMatch",
        alias = "should_match",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_score: Option<f64>,
}

impl TestCase {
    pub fn new(id: impl Into<String>, input: Value, expected: Value) -> Self {
        Self {
            id: id.into(),
            input,
            expected: Some(expected),
            description: None,
            min_score: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of one variant against one test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_id: String,
    pub expected: Option<Value>,
    pub actual: Option<Value>,
    /// Average over the iteration loop
    pub duration_ms: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<VariantError>,
}

/// Metrics and case detail for one variant. Only persisted inside a [`BenchmarkResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    pub variant_id: String,
    pub file: PathBuf,
    #[serde(default)]
    pub is_baseline: bool,
    pub passed: usize,
    pub failed: usize,
    pub metrics: BTreeMap<String, f64>,
    pub cases: Vec<CaseResult>,
    pub errors: Vec<VariantError>,
    /// Set when no live backend evaluated this variant
    #[serde(default)]
    pub degraded: bool,
    #[serde(default)]
    pub complexity: f64,
    #[serde(default)]
    pub speed: f64,
    #[serde(default)]
    pub score: f64,
    /// Cleared the profile's pass-rate and complexity constraints
    #[serde(default)]
    pub gated: bool,
}

impl VariantResult {
    pub fn new(variant_id: impl Into<String>, file: impl Into<PathBuf>, is_baseline: bool) -> Self {
        Self {
            variant_id: variant_id.into(),
            file: file.into(),
            is_baseline,
            passed: 0,
            failed: 0,
            metrics: BTreeMap::new(),
            cases: Vec::new(),
            errors: Vec::new(),
            degraded: false,
            complexity: 0.0,
            speed: 0.0,
            score: 0.0,
            gated: false,
        }
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed
    }

    pub fn pass_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.passed as f64 / n as f64,
        }
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }

    pub fn push_case(&mut self, case: CaseResult) {
        if case.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        if let Some(err) = &case.error {
            self.errors.push(err.clone());
        }
        self.cases.push(case);
    }
}

/// One benchmark run of every variant of a target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub target: String,
    pub target_type: TargetType,
    pub timestamp: DateTime<Utc>,
    pub profile: String,
    pub total_cases: usize,
    pub variants: Vec<VariantResult>,
    pub winner: Option<String>,
    pub reason: String,
    #[serde(default)]
    pub degraded: bool,
}

impl BenchmarkResult {
    pub fn variant(&self, id: &str) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.variant_id == id)
    }

    pub fn baseline(&self) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.is_baseline)
    }

    pub fn winner_result(&self) -> Option<&VariantResult> {
        self.winner.as_deref().and_then(|id| self.variant(id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        };
        f.write_str(s)
    }
}

/// Winner deltas against the baseline variant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Improvements {
    /// Positive means the winner is faster
    pub speed_pct: Option<f64>,
    pub pass_rate_delta: f64,
    pub score_delta: f64,
    pub complexity_delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub winner: Option<String>,
    pub reason: String,
    pub confidence: Confidence,
    pub improvements: Improvements,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRow {
    pub variant: String,
    pub baseline: bool,
    pub passed: usize,
    pub failed: usize,
    pub pass_rate: f64,
    pub speed: f64,
    pub complexity: f64,
    pub score: f64,
    pub gated: bool,
    pub degraded: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub target: String,
    pub target_type: TargetType,
    pub generated_at: DateTime<Utc>,
    pub profile: String,
    pub recommendation: Recommendation,
    pub table: Vec<ComparisonRow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
}

/// Which side of a patch failed to resolve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchSide {
    Original,
    Variant,
}

impl std::fmt::Display for PatchSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PatchSide::Original => f.write_str("original"),
            PatchSide::Variant => f.write_str("variant"),
        }
    }
}
