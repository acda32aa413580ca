//! Generation requests
//!
//! The framework never decides what to change. It writes down what the unit is,
//! how it will be judged, and what has scored well before, then measures
//! whatever comes back.

use crate::error::Result;
use crate::extractor::{placeholders, standalone_source};
use crate::harness::discover_variants;
use crate::lineage::{LineageTracker, TagCount, VariantMeta};
use crate::scorer::Profile;
use crate::types::{ExtractedItem, TargetType, TestCase};
use crate::workspace::{self, Workspace};
use std::fmt::Write;
use std::path::PathBuf;

/// Cases quoted in a request
pub const SAMPLE_CASES: usize = 5;

/// Longest JSON rendering quoted for one case value
const VALUE_PREVIEW: usize = 200;

fn fence_language(item: &ExtractedItem) -> &str {
    match item.file.extension().and_then(|e| e.to_str()) {
        Some("js" | "cjs" | "mjs") => "javascript",
        Some("ts") => "typescript",
        Some("py") => "python",
        Some("rs") => "rust",
        Some(other) => other,
        None => "",
    }
}

fn preview(value: &serde_json::Value) -> String {
    let text = value.to_string();
    if text.chars().count() <= VALUE_PREVIEW {
        return text;
    }
    let cut: String = text.chars().take(VALUE_PREVIEW).collect();
    format!("{}... ({} chars)", cut, text.chars().count())
}

fn contract(item: &ExtractedItem) -> String {
    match item.kind {
        TargetType::Function => format!(
            "Keep the name `{}` and its parameter list; every recorded case must still produce the same output.",
            item.name
        ),
        TargetType::Regex => format!(
            "Keep the binding `{}`; the pattern must agree with every corpus entry.",
            item.name
        ),
        TargetType::Prompt => {
            let names = placeholders(&item.code);
            if names.is_empty() {
                format!("Keep the binding `{}`.", item.name)
            } else {
                format!(
                    "Keep the binding `{}` and every placeholder: {}.",
                    item.name,
                    names
                        .iter()
                        .map(|p| format!("`{}`", p))
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            }
        }
        TargetType::Query => format!(
            "Keep the binding `{}`, the query language{} and any row restriction.",
            item.name,
            item.meta_str("language")
                .map(|l| format!(" ({})", l))
                .unwrap_or_default()
        ),
        TargetType::Config | TargetType::Struct => format!(
            "Keep the name `{}` and every existing key.",
            item.name
        ),
    }
}

/// Markdown request for the next variant of `item`.
pub fn format_request(
    item: &ExtractedItem,
    cases: &[TestCase],
    profile: &Profile,
    top_tags: &[TagCount],
) -> String {
    let mut md = String::new();
    let w = &profile.weights;

    let _ = writeln!(md, "# Optimize {} `{}`\n", item.kind, item.name);
    let _ = writeln!(md, "Source: `{}`", item.file.display());
    let _ = writeln!(
        md,
        "Profile: `{}`: {} (correctness {:.2}, speed {:.2}, simplicity {:.2}; minimum pass rate {:.0}%)\n",
        profile.name,
        profile.description,
        w.correctness,
        w.speed,
        w.simplicity,
        profile.constraints.min_pass_rate * 100.0
    );
    if let Some(max) = profile.constraints.max_complexity {
        let _ = writeln!(md, "Complexity must stay at or below {:.0}.\n", max);
    }

    let _ = writeln!(md, "## Current implementation\n");
    let _ = writeln!(md, "```{}\n{}\n```\n", fence_language(item), item.code);

    let _ = writeln!(
        md,
        "## Test cases ({} recorded, showing up to {})\n",
        cases.len(),
        SAMPLE_CASES
    );
    if cases.is_empty() {
        let _ = writeln!(md, "_None recorded yet._");
    }
    for case in cases.iter().take(SAMPLE_CASES) {
        let expected = case
            .expected
            .as_ref()
            .map(preview)
            .unwrap_or_else(|| "(unset)".to_string());
        let _ = write!(md, "- `{}`: `{}` -> `{}`", case.id, preview(&case.input), expected);
        if let Some(desc) = &case.description {
            let _ = write!(md, " ({})", desc);
        }
        md.push('\n');
    }
    md.push('\n');

    if !top_tags.is_empty() {
        let _ = writeln!(md, "## Modifications that scored well before\n");
        for tag in top_tags {
            let _ = writeln!(md, "- {} ({}x)", tag.tag, tag.count);
        }
        md.push('\n');
    }

    let _ = writeln!(md, "## Requirements\n");
    let _ = writeln!(md, "- {}", contract(item));
    let _ = writeln!(md, "- Reply with the complete unit in a single fenced code block.");
    let _ = writeln!(
        md,
        "- Optionally add a line `tags: <tag>, <tag>` naming the modifications made."
    );
    md
}

/// Write `variants/<target>/baseline.<ext>` from the extracted unit, unless a
/// baseline already exists. Returns the baseline path.
pub fn seed_baseline(
    workspace: &Workspace,
    tracker: &LineageTracker,
    target: &str,
    item: &ExtractedItem,
) -> Result<PathBuf> {
    let dir = workspace.variants_dir(target);
    if let Some(existing) = discover_variants(&dir)?.into_iter().find(|v| v.is_baseline) {
        return Ok(existing.path);
    }

    let ext = item
        .file
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("txt");
    let path = dir.join(format!("baseline.{}", ext));
    workspace::write_atomic(&path, standalone_source(item).as_bytes())?;

    let meta = VariantMeta::root("baseline", "baseline")
        .with_prompt(format!("extracted from {}", item.file.display()));
    tracker.record(target, &path, &meta)?;
    log::info!("Seeded baseline for `{}` at {}", target, path.display());
    Ok(path)
}
