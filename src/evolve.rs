//! Evolve - multi-generation loop over an external generator command
//!
//! Each generation benchmarks what exists, takes the current winner (or the
//! baseline when nothing clears the gate) as parent, writes a request for it,
//! and asks the generator for new variants. A final bench and analysis close
//! the run.

use crate::config::GeneratorConfig;
use crate::error::{ForgeError, Result};
use crate::extractor;
use crate::journal::{RunJournal, Stage};
use crate::lineage::VariantMeta;
use crate::request::format_request;
use crate::types::{AnalysisReport, BenchmarkResult, TargetType, VariantResult};
use crate::workspace;
use crate::Forge;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Source text and modification tags parsed from generator output
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub code: String,
    pub tags: Vec<String>,
}

fn tag_line(line: &str) -> Option<&str> {
    let head = line.get(..5)?;
    if head.eq_ignore_ascii_case("tags:") {
        Some(&line[5..])
    } else {
        None
    }
}

/// The first fenced block (or the whole text when there is none), plus any
/// `tags:` lines found outside fences.
pub fn parse_candidate(output: &str) -> Option<Candidate> {
    let mut tags: Vec<String> = Vec::new();
    let mut fenced = Vec::new();
    let mut loose = Vec::new();
    let mut in_fence = false;
    let mut blocks = 0;

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            if in_fence {
                blocks += 1;
            }
            continue;
        }
        if in_fence {
            if blocks == 1 {
                fenced.push(line);
            }
            continue;
        }
        if let Some(list) = tag_line(trimmed) {
            for tag in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if !tags.iter().any(|t| t == tag) {
                    tags.push(tag.to_string());
                }
            }
            continue;
        }
        loose.push(line);
    }

    let body = if blocks > 0 { fenced } else { loose };
    let start = body.iter().position(|l| !l.trim().is_empty())?;
    let end = body.iter().rposition(|l| !l.trim().is_empty())?;
    Some(Candidate {
        code: body[start..=end].join("\n"),
        tags,
    })
}

/// Feed `request` to the generator on stdin and collect its stdout.
pub async fn run_generator(config: &GeneratorConfig, request: &str) -> Result<String> {
    let (program, args) = config
        .command
        .split_first()
        .ok_or_else(|| ForgeError::Config("generator command is empty".to_string()))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ForgeError::RuntimeFault(format!("cannot start generator `{}`: {}", program, e)))?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| ForgeError::RuntimeFault("generator stdin unavailable".to_string()))?;

    let payload = request.as_bytes().to_vec();
    let exchange = async move {
        if let Err(e) = stdin.write_all(&payload).await {
            // A generator that ignores its input may close stdin early
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(e);
            }
        }
        drop(stdin);
        child.wait_with_output().await
    };

    let budget = Duration::from_secs(config.timeout_secs);
    let output = match tokio::time::timeout(budget, exchange).await {
        Err(_) => return Err(ForgeError::EvaluationTimeout(budget)),
        Ok(Err(e)) => return Err(ForgeError::RuntimeFault(format!("generator I/O: {}", e))),
        Ok(Ok(output)) => output,
    };

    if !output.status.success() {
        return Err(ForgeError::RuntimeFault(format!(
            "generator exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationRecord {
    pub generation: u32,
    pub parent: String,
    pub created: Vec<String>,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvolveSummary {
    pub target: String,
    pub generations: Vec<GenerationRecord>,
    pub report: AnalysisReport,
}

fn pick_parent(result: &BenchmarkResult) -> Result<&VariantResult> {
    result
        .winner_result()
        .or_else(|| result.baseline())
        .ok_or_else(|| ForgeError::NoValidVariant(result.target.clone()))
}

/// Run `generations` rounds (default from config) for `target`, seeding the
/// baseline from `source` if needed.
pub async fn evolve(
    forge: &Forge,
    source: &Path,
    target: &str,
    kind: TargetType,
    profile: Option<&str>,
    generations: Option<u32>,
    journal: &mut RunJournal,
) -> Result<EvolveSummary> {
    let generator = forge
        .config()
        .generator
        .clone()
        .filter(|g| !g.command.is_empty())
        .ok_or_else(|| ForgeError::Config("evolve requires a [generator] command".to_string()))?;
    let rounds = generations.unwrap_or(generator.generations);
    let scorer = forge.scorer(profile)?;
    let tracker = forge.tracker();

    forge.prepare_request(source, target, kind, profile, journal)?;

    let mut records = Vec::with_capacity(rounds as usize);
    for generation in 1..=rounds {
        log::info!("Generation {}/{} for `{}`", generation, rounds, target);
        let result = forge.bench(target, kind, profile, journal).await?;
        let parent = pick_parent(&result)?;
        let (_, item) = extractor::resolve_unit(&parent.file, kind, target)?;
        let parent_generation = tracker.load(&parent.file)?.map_or(0, |m| m.generation);

        let cases = forge.store().load(target)?;
        let top_tags = tracker.analyze(target)?.top_tags;
        let request = format_request(&item, &cases, scorer.profile(), &top_tags);
        workspace::write_atomic(&forge.workspace().request_path(target), request.as_bytes())?;

        let ext = parent
            .file
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt")
            .to_string();
        let mut record = GenerationRecord {
            generation,
            parent: parent.variant_id.clone(),
            created: Vec::new(),
            failures: Vec::new(),
        };

        for _ in 0..generator.variants_per_generation.max(1) {
            let candidate = match run_generator(&generator, &request).await {
                Ok(stdout) => parse_candidate(&stdout),
                Err(e) => {
                    journal.warn(Stage::Evolve, format!("generation {}: {}", generation, e));
                    record.failures.push(e.to_string());
                    continue;
                }
            };
            let Some(candidate) = candidate else {
                journal.warn(Stage::Evolve, format!("generation {}: empty generator output", generation));
                record.failures.push("empty generator output".to_string());
                continue;
            };

            let short = uuid::Uuid::new_v4().simple().to_string();
            let id = format!("gen{}_{}", generation, &short[..8]);
            let path = forge
                .workspace()
                .variants_dir(target)
                .join(format!("{}.{}", id, ext));
            workspace::write_atomic(&path, format!("{}\n", candidate.code).as_bytes())?;

            let meta = VariantMeta::derived(&id, &parent.variant_id, &generator.agent, parent_generation + 1)
                .with_tags(candidate.tags)
                .with_prompt(format!("generation {} from `{}`", generation, parent.variant_id));
            tracker.record(target, &path, &meta)?;
            journal.incr("generated", 1);
            journal.note(Stage::Evolve, format!("{} <- {}", id, parent.variant_id));
            record.created.push(id);
        }
        records.push(record);
    }

    forge.bench(target, kind, profile, journal).await?;
    let report = forge.analyze(target, profile, journal)?;
    Ok(EvolveSummary {
        target: target.to_string(),
        generations: records,
        report,
    })
}
