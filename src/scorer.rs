//! Profile / Scorer: composite fitness and winner selection
//!
//! # Scoring
//!
//! ```text
//! composite = pass_rate * w_correctness
//!           + 1 / (1 + speed) * w_speed
//!           + (1 - min(complexity, 50) / 50) * w_simplicity
//! ```
//!
//! Weights are normalized to sum to 1. A variant that misses the profile's
//! minimum pass rate (or exceeds its complexity ceiling) is scored but can never
//! be selected.
//!
//! # Ranking
//!
//! One comparator is used everywhere a variant order is needed: composite
//! descending at 1e-9 resolution, then the profile's tie-break, then variant id.

use crate::error::{ForgeError, Result};
use crate::types::{BenchmarkResult, Confidence, TargetType, VariantResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::OnceLock;

/// Complexity is clamped here before it enters the simplicity term
pub const COMPLEXITY_CAP: f64 = 50.0;

/// Scores closer than this are ties
pub const TIE_EPSILON: f64 = 1e-9;

/// Speed assigned to variants that produced no timing at all
pub const UNMEASURED_SPEED: f64 = f64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Lower speed metric wins
    #[default]
    LowerSpeed,
    /// The baseline wins a tie; otherwise lower speed metric
    PreferBaseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub correctness: f64,
    pub speed: f64,
    pub simplicity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default = "default_min_pass_rate")]
    pub min_pass_rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_complexity: Option<f64>,
    #[serde(default)]
    pub tie_break: TieBreak,
}

fn default_min_pass_rate() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub weights: Weights,
    pub constraints: Constraints,
}

impl Profile {
    fn builtin(
        name: &str,
        description: &str,
        (correctness, speed, simplicity): (f64, f64, f64),
        min_pass_rate: f64,
        max_complexity: Option<f64>,
        tie_break: TieBreak,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            weights: Weights {
                correctness,
                speed,
                simplicity,
            },
            constraints: Constraints {
                min_pass_rate,
                max_complexity,
                tie_break,
            },
        }
    }

    pub fn builtins() -> Vec<Profile> {
        vec![
            Self::builtin(
                "balanced",
                "Trade correctness, speed and simplicity evenly",
                (0.5, 0.3, 0.2),
                0.8,
                None,
                TieBreak::LowerSpeed,
            ),
            Self::builtin(
                "fastest",
                "Maximize speed among fully correct variants",
                (0.3, 0.7, 0.0),
                1.0,
                None,
                TieBreak::LowerSpeed,
            ),
            Self::builtin(
                "simplest",
                "Prefer the least complex fully correct variant",
                (0.4, 0.1, 0.5),
                1.0,
                Some(30.0),
                TieBreak::LowerSpeed,
            ),
            Self::builtin(
                "safe",
                "Only replace the baseline on a strict improvement",
                (0.6, 0.2, 0.2),
                1.0,
                None,
                TieBreak::PreferBaseline,
            ),
        ]
    }

    /// Find a profile by name; `extra` entries shadow built-ins of the same name.
    pub fn resolve(name: &str, extra: &[Profile]) -> Result<Profile> {
        extra
            .iter()
            .find(|p| p.name == name)
            .cloned()
            .or_else(|| Self::builtins().into_iter().find(|p| p.name == name))
            .ok_or_else(|| {
                let mut known: Vec<String> = Self::builtins().into_iter().map(|p| p.name).collect();
                known.extend(extra.iter().map(|p| p.name.clone()));
                ForgeError::Config(format!(
                    "unknown profile `{}` (known: {})",
                    name,
                    known.join(", ")
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.weights;
        if w.correctness < 0.0 || w.speed < 0.0 || w.simplicity < 0.0 {
            return Err(ForgeError::Config(format!(
                "profile `{}` has a negative weight",
                self.name
            )));
        }
        if w.correctness + w.speed + w.simplicity <= 0.0 {
            return Err(ForgeError::Config(format!(
                "profile `{}` weights sum to zero",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.constraints.min_pass_rate) {
            return Err(ForgeError::Config(format!(
                "profile `{}` min_pass_rate must be within 0..=1",
                self.name
            )));
        }
        Ok(())
    }
}

fn branch_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| {
        Regex::new(r"\b(?:if|elif|else|for|while|case|catch|except|match|switch|loop)\b|&&|\|\|")
            .expect("static branch pattern")
    })
}

fn ternary_pattern() -> &'static Regex {
    static CELL: OnceLock<Regex> = OnceLock::new();
    CELL.get_or_init(|| Regex::new(r"\s\?\s").expect("static ternary pattern"))
}

/// Maximum nesting: brace depth below the unit's own body, or indentation
/// levels for brace-free sources.
fn max_nesting(code: &str) -> usize {
    let mut depth: i64 = 0;
    let mut max_depth: i64 = 0;
    for c in code.chars() {
        match c {
            '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            '}' => depth -= 1,
            _ => {}
        }
    }
    if max_depth > 0 {
        return (max_depth - 1).max(0) as usize;
    }

    let indents: Vec<usize> = code
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .collect();
    let Some(&base) = indents.first() else {
        return 0;
    };
    let step = indents
        .iter()
        .filter(|&&i| i > base)
        .map(|&i| i - base)
        .min()
        .unwrap_or(4)
        .max(1);
    indents
        .iter()
        .map(|&i| i.saturating_sub(base) / step)
        .max()
        .unwrap_or(0)
        .saturating_sub(1)
}

/// Heuristic complexity score, 0..=50.
pub fn complexity(code: &str) -> f64 {
    let lines = code.lines().filter(|l| !l.trim().is_empty()).count() as f64;
    let nesting = max_nesting(code) as f64;
    let branches = branch_pattern().find_iter(code).count() as f64;
    let ternaries = ternary_pattern().find_iter(code).count() as f64;

    (lines / 5.0).min(10.0) + (nesting * 2.0).min(10.0) + branches.min(20.0) + (ternaries * 2.0).min(10.0)
}

/// The "lower is better" speed figure for a variant.
pub fn speed_metric(variant: &VariantResult, kind: TargetType) -> f64 {
    let metric = if variant.degraded {
        variant.metric("estimated_tokens").map(|t| t / 1000.0)
    } else if kind == TargetType::Regex {
        variant.metric("us_per_pass")
    } else {
        variant.metric("avg_duration_ms")
    };
    match metric {
        Some(m) if m.is_finite() && m >= 0.0 => m,
        _ => UNMEASURED_SPEED,
    }
}

pub fn composite(pass_rate: f64, speed: f64, complexity: f64, weights: &Weights) -> f64 {
    let total = weights.correctness + weights.speed + weights.simplicity;
    if total <= 0.0 {
        return 0.0;
    }
    let speed_term = 1.0 / (1.0 + speed.max(0.0));
    let simplicity_term = 1.0 - complexity.clamp(0.0, COMPLEXITY_CAP) / COMPLEXITY_CAP;

    (pass_rate * weights.correctness + speed_term * weights.speed + simplicity_term * weights.simplicity)
        / total
}

fn score_key(score: f64) -> i64 {
    (score / TIE_EPSILON).round() as i64
}

/// Weighted scoring, gating and ranking under one profile
pub struct Scorer {
    profile: Profile,
}

impl Scorer {
    pub fn new(profile: Profile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn passes_gate(&self, variant: &VariantResult) -> bool {
        let c = &self.profile.constraints;
        variant.total() > 0
            && variant.pass_rate() + TIE_EPSILON >= c.min_pass_rate
            && c.max_complexity.map_or(true, |max| variant.complexity <= max)
    }

    /// Fill `speed`, `score` and `gated` on every variant.
    pub fn score_all(&self, result: &mut BenchmarkResult) {
        let kind = result.target_type;
        for variant in &mut result.variants {
            variant.speed = speed_metric(variant, kind);
            variant.score = composite(
                variant.pass_rate(),
                variant.speed,
                variant.complexity,
                &self.profile.weights,
            );
            variant.gated = self.passes_gate(variant);
        }
    }

    pub fn compare(&self, a: &VariantResult, b: &VariantResult) -> Ordering {
        score_key(b.score)
            .cmp(&score_key(a.score))
            .then_with(|| match self.profile.constraints.tie_break {
                TieBreak::PreferBaseline => b
                    .is_baseline
                    .cmp(&a.is_baseline)
                    .then_with(|| a.speed.total_cmp(&b.speed)),
                TieBreak::LowerSpeed => a.speed.total_cmp(&b.speed),
            })
            .then_with(|| a.variant_id.cmp(&b.variant_id))
    }

    /// Variant indices, best first.
    pub fn rank(&self, variants: &[VariantResult]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..variants.len()).collect();
        order.sort_by(|&a, &b| self.compare(&variants[a], &variants[b]));
        order
    }

    /// Score, rank and record the winner (or the reason there is none).
    pub fn evaluate(&self, result: &mut BenchmarkResult) {
        self.score_all(result);
        result.profile = self.profile.name.clone();

        let order = self.rank(&result.variants);
        let winner = order.iter().copied().find(|&i| result.variants[i].gated);

        match winner {
            Some(i) => {
                let w = &result.variants[i];
                let runner_up = order
                    .iter()
                    .copied()
                    .find(|&j| j != i)
                    .map(|j| &result.variants[j]);
                let mut reason = format!(
                    "`{}` ranked first under `{}` (score {:.3}, {:.0}% pass, speed {:.4})",
                    w.variant_id,
                    self.profile.name,
                    w.score,
                    w.pass_rate() * 100.0,
                    w.speed
                );
                if let Some(r) = runner_up {
                    reason.push_str(&format!(
                        "; runner-up `{}` at {:.3}",
                        r.variant_id, r.score
                    ));
                }
                log::info!("{}: {}", result.target, reason);
                result.winner = Some(w.variant_id.clone());
                result.reason = reason;
            }
            None => {
                let reason = match order.first().map(|&i| &result.variants[i]) {
                    None => format!("no variants found for `{}`", result.target),
                    Some(_) if result.total_cases == 0 => {
                        format!("no test cases recorded for `{}`", result.target)
                    }
                    Some(best) => format!(
                        "{}; best was `{}` at {:.0}% pass (gate {:.0}%)",
                        ForgeError::NoValidVariant(result.target.clone()),
                        best.variant_id,
                        best.pass_rate() * 100.0,
                        self.profile.constraints.min_pass_rate * 100.0
                    ),
                };
                log::warn!("{}", reason);
                result.winner = None;
                result.reason = reason;
            }
        }
    }
}

/// Confidence tier of a scored result's winner.
///
/// High requires a fully passing winner plus one of: a score margin of at
/// least 0.1 over the runner-up, zero errors across the whole run, or an
/// average latency under 1 ms. Degraded (heuristic) runs cap at medium.
pub fn confidence(result: &BenchmarkResult, scorer: &Scorer) -> Confidence {
    let Some(winner) = result.winner_result() else {
        return Confidence::Low;
    };
    if winner.total() == 0 || winner.failed > 0 {
        return Confidence::Low;
    }
    if result.degraded || winner.degraded {
        return Confidence::Medium;
    }

    let order = scorer.rank(&result.variants);
    let margin = order
        .iter()
        .map(|&i| &result.variants[i])
        .find(|v| v.variant_id != winner.variant_id)
        .map(|r| winner.score - r.score)
        .unwrap_or(f64::INFINITY);
    let error_free = result.variants.iter().all(|v| v.errors.is_empty());
    let sub_ms = winner.metric("avg_duration_ms").map_or(false, |ms| ms < 1.0);

    if margin >= 0.1 || error_free || sub_ms {
        Confidence::High
    } else {
        Confidence::Medium
    }
}
