//! Analysis - recommendation, comparison table and diff for a scored run

use crate::scorer::{self, Scorer, UNMEASURED_SPEED};
use crate::types::{
    AnalysisReport, BenchmarkResult, ComparisonRow, Improvements, Recommendation, VariantResult,
};
use chrono::Utc;
use std::fmt::Write;

/// Above this many line pairs the diff degrades to remove-all/add-all
const DIFF_CELL_LIMIT: usize = 4_000_000;

fn improvements(winner: &VariantResult, baseline: &VariantResult) -> Improvements {
    let measured = |s: f64| s < UNMEASURED_SPEED;
    let speed_pct = if measured(winner.speed) && measured(baseline.speed) && baseline.speed > 0.0 {
        Some((baseline.speed - winner.speed) / baseline.speed * 100.0)
    } else {
        None
    };
    Improvements {
        speed_pct,
        pass_rate_delta: winner.pass_rate() - baseline.pass_rate(),
        score_delta: winner.score - baseline.score,
        complexity_delta: winner.complexity - baseline.complexity,
    }
}

fn row(v: &VariantResult) -> ComparisonRow {
    ComparisonRow {
        variant: v.variant_id.clone(),
        baseline: v.is_baseline,
        passed: v.passed,
        failed: v.failed,
        pass_rate: v.pass_rate(),
        speed: v.speed,
        complexity: v.complexity,
        score: v.score,
        gated: v.gated,
        degraded: v.degraded,
        errors: v.errors.iter().map(|e| e.to_string()).collect(),
    }
}

/// Build the report for a result that has already been through [`Scorer::evaluate`].
pub fn analyze(
    result: &BenchmarkResult,
    scorer: &Scorer,
    baseline_code: Option<&str>,
    winner_code: Option<&str>,
) -> AnalysisReport {
    let improvements = match (result.winner_result(), result.baseline()) {
        (Some(w), Some(b)) => improvements(w, b),
        _ => Improvements::default(),
    };

    let table = scorer
        .rank(&result.variants)
        .into_iter()
        .map(|i| row(&result.variants[i]))
        .collect();

    let diff = match (baseline_code, winner_code, result.winner_result()) {
        (Some(old), Some(new), Some(w)) if !w.is_baseline && old != new => Some(line_diff(old, new)),
        _ => None,
    };

    AnalysisReport {
        target: result.target.clone(),
        target_type: result.target_type,
        generated_at: Utc::now(),
        profile: scorer.profile().name.clone(),
        recommendation: Recommendation {
            winner: result.winner.clone(),
            reason: result.reason.clone(),
            confidence: scorer::confidence(result, scorer),
            improvements,
        },
        table,
        diff,
    }
}

/// Line diff via longest common subsequence. Lines are prefixed with
/// `"  "` (kept), `"- "` (removed) or `"+ "` (added).
pub fn line_diff(old: &str, new: &str) -> String {
    let a: Vec<&str> = old.lines().collect();
    let b: Vec<&str> = new.lines().collect();
    let mut out = String::new();

    if a.len().saturating_mul(b.len()) > DIFF_CELL_LIMIT {
        for line in &a {
            let _ = writeln!(out, "- {}", line);
        }
        for line in &b {
            let _ = writeln!(out, "+ {}", line);
        }
        return out;
    }

    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![vec![0u32; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] == b[j] {
            let _ = writeln!(out, "  {}", a[i]);
            i += 1;
            j += 1;
        } else if lcs[i + 1][j] >= lcs[i][j + 1] {
            let _ = writeln!(out, "- {}", a[i]);
            i += 1;
        } else {
            let _ = writeln!(out, "+ {}", b[j]);
            j += 1;
        }
    }
    for line in &a[i..] {
        let _ = writeln!(out, "- {}", line);
    }
    for line in &b[j..] {
        let _ = writeln!(out, "+ {}", line);
    }
    out
}

fn fmt_speed(speed: f64) -> String {
    if speed >= UNMEASURED_SPEED {
        "-".to_string()
    } else {
        format!("{:.4}", speed)
    }
}

/// Human-readable report. Every variant gets a row, including ones that never loaded.
pub fn render_markdown(report: &AnalysisReport) -> String {
    let mut md = String::new();
    let rec = &report.recommendation;

    let _ = writeln!(md, "# {} `{}`\n", report.target_type, report.target);
    let _ = writeln!(
        md,
        "Profile: `{}` | generated {}\n",
        report.profile,
        report.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    );

    let _ = writeln!(md, "## Recommendation\n");
    match &rec.winner {
        Some(w) => {
            let _ = writeln!(md, "**Winner:** `{}` (confidence: {})\n", w, rec.confidence);
        }
        None => {
            let _ = writeln!(md, "**No winner** (confidence: {})\n", rec.confidence);
        }
    }
    let _ = writeln!(md, "{}\n", rec.reason);

    if rec.winner.is_some() {
        let imp = &rec.improvements;
        if let Some(pct) = imp.speed_pct {
            let _ = writeln!(md, "- Speed vs baseline: {:+.1}%", pct);
        }
        let _ = writeln!(md, "- Pass rate delta: {:+.1}%", imp.pass_rate_delta * 100.0);
        let _ = writeln!(md, "- Score delta: {:+.3}", imp.score_delta);
        let _ = writeln!(md, "- Complexity delta: {:+.1}\n", imp.complexity_delta);
    }

    let _ = writeln!(md, "## Comparison\n");
    let _ = writeln!(
        md,
        "| Variant | Passed | Pass rate | Speed | Complexity | Score | Eligible | Errors |"
    );
    let _ = writeln!(md, "|---|---|---|---|---|---|---|---|");
    for r in &report.table {
        let mut name = format!("`{}`", r.variant);
        if r.baseline {
            name.push_str(" (baseline)");
        }
        if r.degraded {
            name.push_str(" *");
        }
        let errors = match r.errors.first() {
            None => String::new(),
            Some(first) if r.errors.len() == 1 => first.replace('|', "\\|"),
            Some(first) => format!("{} (+{} more)", first.replace('|', "\\|"), r.errors.len() - 1),
        };
        let _ = writeln!(
            md,
            "| {} | {}/{} | {:.0}% | {} | {:.1} | {:.3} | {} | {} |",
            name,
            r.passed,
            r.passed + r.failed,
            r.pass_rate * 100.0,
            fmt_speed(r.speed),
            r.complexity,
            r.score,
            if r.gated { "yes" } else { "no" },
            errors
        );
    }
    if report.table.iter().any(|r| r.degraded) {
        let _ = writeln!(
            md,
            "\n\\* heuristic evaluation only; no live backend for this target type"
        );
    }

    if let Some(diff) = &report.diff {
        let _ = writeln!(md, "\n## Diff (baseline -> winner)\n");
        let _ = writeln!(md, "```diff\n{}```", diff);
    }
    md
}
