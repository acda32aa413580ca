//! # codevolve
//!
//! Benchmark candidate rewrites of a named code unit, pick a winner under a
//! weighting profile, and patch it back into the source file.
//!
//! ## Architecture
//!
//! - **Extractor**: heuristic span finder for functions, regexes, prompts, queries, configs
//! - **Harness**: runs every variant against the recorded cases under a per-case timeout
//! - **Scorer**: composite correctness/speed/simplicity score with a pass-rate gate
//! - **Lineage**: sidecar metadata per variant and cross-generation analysis
//! - **Mutation**: adversarial inputs whose expectations come from the baseline
//! - **Patcher**: re-resolve, back up, splice, roll back
//!
//! ## Example
//!
//! ```no_run
//! use codevolve::{Forge, ForgeConfig, RunJournal, TargetType};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let forge = Forge::new(ForgeConfig::default());
//!     let mut journal = RunJournal::new();
//!
//!     forge.prepare_request("src/math.js".as_ref(), "sum", TargetType::Function, None, &mut journal)?;
//!     // ... author variants under .codevolve/variants/sum/ ...
//!     forge.bench("sum", TargetType::Function, Some("fastest"), &mut journal).await?;
//!     let report = forge.analyze("sum", None, &mut journal)?;
//!     println!("winner: {:?}", report.recommendation.winner);
//!
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod config;
pub mod equality;
pub mod error;
pub mod evolve;
pub mod extractor;
pub mod harness;
pub mod invoker;
pub mod journal;
pub mod lineage;
pub mod mutation;
pub mod patcher;
pub mod request;
pub mod scorer;
pub mod test_store;
pub mod types;
pub mod workspace;

pub use config::ForgeConfig;
pub use error::{FailureKind, ForgeError, Result, VariantError};
pub use evolve::EvolveSummary;
pub use harness::{BenchSettings, BenchmarkHarness};
pub use invoker::{FnInvoker, Invokable, InvokerFactory, ProcessInvokerFactory, VariantSource};
pub use journal::{RunJournal, Stage};
pub use lineage::{LineageReport, LineageTracker, VariantMeta};
pub use mutation::MutationReport;
pub use patcher::{PatchOutcome, PatchReport, Patcher};
pub use scorer::{Profile, Scorer};
pub use test_store::TestCaseStore;
pub use types::*;
pub use workspace::Workspace;

use harness::discover_variants;
use mutation::{establish_expectations, MutationGenerator};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Entry point tying every stage to one workspace and configuration
pub struct Forge {
    config: ForgeConfig,
    workspace: Workspace,
    factory: Arc<dyn InvokerFactory>,
}

impl Forge {
    /// Variants run out of process through the configured runner commands.
    pub fn new(config: ForgeConfig) -> Self {
        let factory = Arc::new(ProcessInvokerFactory::new(config.runner.clone()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: ForgeConfig, factory: Arc<dyn InvokerFactory>) -> Self {
        log::debug!("Workspace: {}", config.workspace.display());
        Self {
            workspace: Workspace::new(&config.workspace),
            config,
            factory,
        }
    }

    pub fn config(&self) -> &ForgeConfig {
        &self.config
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn store(&self) -> TestCaseStore {
        TestCaseStore::new(self.workspace.clone())
    }

    pub fn tracker(&self) -> LineageTracker {
        LineageTracker::new(self.workspace.clone(), self.config.lineage.clone())
    }

    /// Scorer for `profile`, or for the configured default profile.
    pub fn scorer(&self, profile: Option<&str>) -> Result<Scorer> {
        let name = profile.unwrap_or(&self.config.default_profile);
        Ok(Scorer::new(Profile::resolve(name, &self.config.profiles)?))
    }

    /// Extract every unit of `kind` from `file` into `extracted/<stem>.<kind>.json`.
    pub fn extract(&self, file: &Path, kind: TargetType, journal: &mut RunJournal) -> Result<Vec<ExtractedItem>> {
        let items = extractor::extract_file(file, kind)?;
        workspace::write_json(&self.workspace.extracted_path(file, kind), &items)?;
        journal.incr("extracted", items.len() as u64);
        journal.note(
            Stage::Extract,
            format!("{}: {} {} unit(s)", file.display(), items.len(), kind),
        );
        Ok(items)
    }

    /// Seed the baseline variant from `source` and write the generation request.
    pub fn prepare_request(
        &self,
        source: &Path,
        target: &str,
        kind: TargetType,
        profile: Option<&str>,
        journal: &mut RunJournal,
    ) -> Result<PathBuf> {
        let scorer = self.scorer(profile)?;
        let (_, item) = extractor::resolve_unit(source, kind, target).map_err(|e| {
            journal.warn(Stage::Extract, e.to_string());
            e
        })?;

        let tracker = self.tracker();
        let baseline = request::seed_baseline(&self.workspace, &tracker, target, &item)?;
        let cases = self.store().load(target)?;
        let top_tags = tracker.analyze(target)?.top_tags;

        let text = request::format_request(&item, &cases, scorer.profile(), &top_tags);
        let path = self.workspace.request_path(target);
        workspace::write_atomic(&path, text.as_bytes())?;
        journal.note(
            Stage::Request,
            format!(
                "{}: request at {}, baseline at {}",
                target,
                path.display(),
                baseline.display()
            ),
        );
        Ok(path)
    }

    /// Benchmark and score every variant of `target`; writes `results/<target>.json`
    /// and refreshes each variant's lineage sidecar.
    pub async fn bench(
        &self,
        target: &str,
        kind: TargetType,
        profile: Option<&str>,
        journal: &mut RunJournal,
    ) -> Result<BenchmarkResult> {
        let scorer = self.scorer(profile)?;
        let cases = self.store().load(target)?;
        let variants = discover_variants(&self.workspace.variants_dir(target))?;
        if variants.is_empty() {
            journal.warn(
                Stage::Bench,
                format!("no variants under {}", self.workspace.variants_dir(target).display()),
            );
        }
        if cases.is_empty() {
            journal.warn(Stage::Bench, format!("no test cases recorded for `{}`", target));
        }

        let harness = BenchmarkHarness::new(BenchSettings::from_config(&self.config), self.factory.clone());
        let mut result = harness.run(target, kind, &variants, &cases, journal).await;
        scorer.evaluate(&mut result);
        journal.note(Stage::Score, result.reason.clone());

        workspace::write_json(&self.workspace.results_path(target), &result)?;
        let updated = self.tracker().update_scores(&result)?;
        journal.note(Stage::Lineage, format!("{}: {} sidecar(s) updated", target, updated));
        Ok(result)
    }

    /// Re-score the stored result (under `profile` if given) and write the report pair.
    pub fn analyze(
        &self,
        target: &str,
        profile: Option<&str>,
        journal: &mut RunJournal,
    ) -> Result<AnalysisReport> {
        let mut result: BenchmarkResult = workspace::read_json(&self.workspace.results_path(target))?;
        let name = profile
            .map(str::to_string)
            .or_else(|| Some(result.profile.clone()).filter(|p| !p.is_empty()));
        let scorer = self.scorer(name.as_deref())?;
        scorer.evaluate(&mut result);
        workspace::write_json(&self.workspace.results_path(target), &result)?;

        let code_of = |variant: Option<&VariantResult>| -> Option<String> {
            let variant = variant?;
            let source = std::fs::read_to_string(&variant.file).ok()?;
            extractor::find_unit(&source, &variant.file, result.target_type, &result.target).map(|i| i.code)
        };
        let report = analysis::analyze(
            &result,
            &scorer,
            code_of(result.baseline()).as_deref(),
            code_of(result.winner_result()).as_deref(),
        );

        workspace::write_json(&self.workspace.report_json_path(target), &report)?;
        workspace::write_atomic(
            &self.workspace.report_md_path(target),
            analysis::render_markdown(&report).as_bytes(),
        )?;
        journal.note(
            Stage::Analyze,
            format!(
                "{}: winner {} ({} confidence)",
                target,
                report.recommendation.winner.as_deref().unwrap_or("none"),
                report.recommendation.confidence
            ),
        );
        Ok(report)
    }

    /// Re-analyze the stored result, archive its winner, then patch it into `source`.
    ///
    /// The report always reflects the latest bench, under the profile it was last scored with.
    /// The archive is written even when the patch cannot resolve its target.
    pub fn apply(&self, source: &Path, target: &str, journal: &mut RunJournal) -> Result<PatchOutcome> {
        let report = self.analyze(target, None, journal)?;
        let result: BenchmarkResult = workspace::read_json(&self.workspace.results_path(target))?;
        let winner = report
            .recommendation
            .winner
            .as_deref()
            .and_then(|id| result.variant(id))
            .ok_or_else(|| ForgeError::NoValidVariant(target.to_string()))?;

        let archived = patcher::archive_winner(&self.workspace, target, &winner.file, &report)?;
        journal.note(
            Stage::Patch,
            format!("archived `{}` to {}", winner.variant_id, archived.display()),
        );

        let outcome = Patcher::new().apply(source, &winner.file, &result.target, result.target_type)?;
        match &outcome {
            PatchOutcome::Applied(patch) => journal.note(
                Stage::Patch,
                format!(
                    "{}: {:+} line(s), backup {}",
                    patch.file.display(),
                    patch.line_delta,
                    patch.backup.display()
                ),
            ),
            PatchOutcome::TargetMissing { side, name } => journal.warn(
                Stage::Patch,
                ForgeError::PatchTargetMissing {
                    name: name.clone(),
                    side: *side,
                }
                .to_string(),
            ),
        }
        Ok(outcome)
    }

    /// Restore from `path` if it is a backup, else from the newest backup of `path`.
    pub fn rollback(&self, path: &Path, journal: &mut RunJournal) -> Result<PathBuf> {
        let backup = if patcher::backup_origin(path).is_some() {
            path.to_path_buf()
        } else {
            patcher::latest_backup(path)?.ok_or_else(|| {
                ForgeError::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no backup found"),
                )
            })?
        };
        let restored = Patcher::new().rollback(&backup)?;
        journal.note(
            Stage::Patch,
            format!("restored {} from {}", restored.display(), backup.display()),
        );
        Ok(restored)
    }

    /// Generate adversarial cases for a function target, keep those the
    /// baseline accepts, and merge them into the store.
    pub async fn mutate(
        &self,
        target: &str,
        kind: TargetType,
        journal: &mut RunJournal,
    ) -> Result<MutationReport> {
        if kind != TargetType::Function {
            return Err(ForgeError::Config(format!(
                "mutation needs a live backend; `{}` targets have none",
                kind
            )));
        }
        let store = self.store();
        let cases = store.load(target)?;
        let baseline = discover_variants(&self.workspace.variants_dir(target))?
            .into_iter()
            .find(|v| v.is_baseline)
            .ok_or_else(|| {
                ForgeError::Config(format!("`{}` has no baseline variant; run `prompt` first", target))
            })?;
        let (_, item) = extractor::resolve_unit(&baseline.path, kind, target)?;
        let invoker = self
            .factory
            .resolve(&VariantSource {
                id: baseline.id.clone(),
                file: baseline.path.clone(),
                target: target.to_string(),
                item,
            })
            .await?;

        let mut generator = MutationGenerator::new(self.config.mutation.seed);
        let generated = generator.generate(&cases, self.config.mutation.max_cases);
        let count = generated.len();
        let (kept, dropped) =
            establish_expectations(generated, invoker.as_ref(), self.config.case_timeout()).await;
        let merged = store.merge(target, kind, kept)?;

        journal.incr("mutations", count as u64);
        journal.note(
            Stage::Mutate,
            format!(
                "{}: {} generated, {} out of contract, {} added",
                target, count, dropped, merged.added
            ),
        );
        Ok(MutationReport {
            generated: count,
            dropped,
            added: merged.added,
            skipped: merged.skipped,
        })
    }

    pub fn lineage(&self, target: &str) -> Result<LineageReport> {
        self.tracker().analyze(target)
    }

    pub async fn evolve(
        &self,
        source: &Path,
        target: &str,
        kind: TargetType,
        profile: Option<&str>,
        generations: Option<u32>,
        journal: &mut RunJournal,
    ) -> Result<EvolveSummary> {
        evolve::evolve(self, source, target, kind, profile, generations, journal).await
    }
}
