//! Lineage Tracker - who produced each variant, from what, and how it scored
//!
//! Every variant file may carry a sidecar `<file>.meta.json`. Generation 0 is
//! reserved for the baseline and hand-authored variants; anything later must
//! name an existing variant as its origin.

use crate::config::LineageConfig;
use crate::error::{ForgeError, Result};
use crate::harness::{discover_variants, VariantFile};
use crate::types::BenchmarkResult;
use crate::workspace::{self, Workspace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Agent tags allowed at generation 0
pub const ROOT_AGENTS: &[&str] = &["human", "baseline"];

/// Pass rate a variant needs for its agent to be credited with a win
pub const WIN_PASS_RATE: f64 = 1.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantMeta {
    pub variant_id: String,
    #[serde(default)]
    pub origin: Option<String>,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub generation: u32,
    #[serde(default)]
    pub last_score: Option<f64>,
    #[serde(default)]
    pub last_pass_rate: Option<f64>,
}

impl VariantMeta {
    /// A generation-0 record
    pub fn root(variant_id: impl Into<String>, agent: &str) -> Self {
        Self {
            variant_id: variant_id.into(),
            origin: None,
            agent: agent.to_string(),
            prompt: None,
            tags: Vec::new(),
            created_at: Utc::now(),
            generation: 0,
            last_score: None,
            last_pass_rate: None,
        }
    }

    pub fn derived(
        variant_id: impl Into<String>,
        origin: impl Into<String>,
        agent: &str,
        generation: u32,
    ) -> Self {
        Self {
            origin: Some(origin.into()),
            generation,
            ..Self::root(variant_id, agent)
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    fn is_win(&self, threshold: f64) -> bool {
        matches!(
            (self.last_pass_rate, self.last_score),
            (Some(rate), Some(score)) if rate >= WIN_PASS_RATE && score >= threshold
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub attempts: usize,
    pub wins: usize,
    pub win_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageReport {
    pub target: String,
    pub variants: usize,
    /// Most frequent modification tags among high-scoring variants
    pub top_tags: Vec<TagCount>,
    /// Ancestor id -> number of variants descending from it
    pub ancestor_counts: BTreeMap<String, usize>,
    pub agents: BTreeMap<String, AgentStats>,
    pub most_reliable_agent: Option<String>,
}

pub fn sidecar_path(variant_file: &Path) -> PathBuf {
    let mut name = variant_file.as_os_str().to_os_string();
    name.push(".meta.json");
    PathBuf::from(name)
}

pub struct LineageTracker {
    workspace: Workspace,
    config: LineageConfig,
}

impl LineageTracker {
    pub fn new(workspace: Workspace, config: LineageConfig) -> Self {
        Self { workspace, config }
    }

    pub fn load(&self, variant_file: &Path) -> Result<Option<VariantMeta>> {
        workspace::read_json_opt(&sidecar_path(variant_file))
    }

    /// Every variant of `target` that has a sidecar.
    pub fn load_all(&self, target: &str) -> Result<Vec<(VariantFile, VariantMeta)>> {
        let mut out = Vec::new();
        for file in discover_variants(&self.workspace.variants_dir(target))? {
            if let Some(meta) = self.load(&file.path)? {
                out.push((file, meta));
            }
        }
        Ok(out)
    }

    /// Validate and write a sidecar for `variant_file`.
    pub fn record(&self, target: &str, variant_file: &Path, meta: &VariantMeta) -> Result<()> {
        match (&meta.origin, meta.generation) {
            (None, 0) => {
                if !ROOT_AGENTS.contains(&meta.agent.as_str()) {
                    return Err(ForgeError::Lineage(format!(
                        "generation 0 is reserved for {:?}, got agent `{}`",
                        ROOT_AGENTS, meta.agent
                    )));
                }
            }
            (None, g) => {
                return Err(ForgeError::Lineage(format!(
                    "`{}` is generation {} but names no origin",
                    meta.variant_id, g
                )))
            }
            (Some(_), 0) => {
                return Err(ForgeError::Lineage(format!(
                    "`{}` has an origin but claims generation 0",
                    meta.variant_id
                )))
            }
            (Some(origin), g) => {
                if origin == &meta.variant_id {
                    return Err(ForgeError::Lineage(format!(
                        "`{}` cannot be its own origin",
                        origin
                    )));
                }
                let variants = discover_variants(&self.workspace.variants_dir(target))?;
                let Some(parent) = variants.iter().find(|v| &v.id == origin) else {
                    return Err(ForgeError::Lineage(format!(
                        "origin `{}` does not exist among variants of `{}`",
                        origin, target
                    )));
                };
                if let Some(parent_meta) = self.load(&parent.path)? {
                    if g <= parent_meta.generation {
                        return Err(ForgeError::Lineage(format!(
                            "`{}` generation {} must follow origin `{}` generation {}",
                            meta.variant_id, g, origin, parent_meta.generation
                        )));
                    }
                }
            }
        }

        workspace::write_json(&sidecar_path(variant_file), meta)
    }

    /// Write each variant's latest score and pass rate into its sidecar,
    /// creating a generation-0 record for variants that have none.
    pub fn update_scores(&self, result: &BenchmarkResult) -> Result<usize> {
        let mut updated = 0;
        for variant in &result.variants {
            let mut meta = match self.load(&variant.file)? {
                Some(meta) => meta,
                None => {
                    let agent = if variant.is_baseline { "baseline" } else { "human" };
                    VariantMeta::root(&variant.variant_id, agent)
                }
            };
            meta.last_score = Some(variant.score);
            meta.last_pass_rate = Some(variant.pass_rate());
            workspace::write_json(&sidecar_path(&variant.file), &meta)?;
            updated += 1;
        }
        log::debug!("{}: updated {} sidecar(s)", result.target, updated);
        Ok(updated)
    }

    pub fn analyze(&self, target: &str) -> Result<LineageReport> {
        let metas: Vec<VariantMeta> = self.load_all(target)?.into_iter().map(|(_, m)| m).collect();
        let threshold = self.config.high_score_threshold;

        let mut tag_counts: HashMap<&str, usize> = HashMap::new();
        for meta in metas.iter().filter(|m| m.last_score.map_or(false, |s| s >= threshold)) {
            for tag in &meta.tags {
                *tag_counts.entry(tag.as_str()).or_insert(0) += 1;
            }
        }
        let mut top_tags: Vec<TagCount> = tag_counts
            .into_iter()
            .map(|(tag, count)| TagCount {
                tag: tag.to_string(),
                count,
            })
            .collect();
        top_tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        top_tags.truncate(self.config.top_tags);

        let origins: HashMap<&str, &str> = metas
            .iter()
            .filter_map(|m| m.origin.as_deref().map(|o| (m.variant_id.as_str(), o)))
            .collect();
        let mut ancestor_counts: BTreeMap<String, usize> = BTreeMap::new();
        for meta in &metas {
            let mut seen = HashSet::new();
            let mut cursor = meta.variant_id.as_str();
            while let Some(&parent) = origins.get(cursor) {
                if !seen.insert(parent) {
                    break;
                }
                *ancestor_counts.entry(parent.to_string()).or_insert(0) += 1;
                cursor = parent;
            }
        }

        let mut agents: BTreeMap<String, AgentStats> = BTreeMap::new();
        for meta in metas.iter().filter(|m| m.last_score.is_some()) {
            let stats = agents.entry(meta.agent.clone()).or_default();
            stats.attempts += 1;
            if meta.is_win(threshold) {
                stats.wins += 1;
            }
        }
        for stats in agents.values_mut() {
            stats.win_rate = stats.wins as f64 / stats.attempts as f64;
        }
        let most_reliable_agent = agents
            .iter()
            .filter(|(_, s)| s.wins > 0)
            .max_by(|(an, a), (bn, b)| {
                a.win_rate
                    .total_cmp(&b.win_rate)
                    .then_with(|| a.attempts.cmp(&b.attempts))
                    .then_with(|| bn.cmp(an))
            })
            .map(|(name, _)| name.clone());

        Ok(LineageReport {
            target: target.to_string(),
            variants: metas.len(),
            top_tags,
            ancestor_counts,
            agents,
            most_reliable_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TargetType, VariantResult};
    use std::fs;
    use tempfile::tempdir;

    fn setup(ids: &[&str]) -> (tempfile::TempDir, LineageTracker, Workspace) {
        let dir = tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let variants = ws.variants_dir("parse");
        fs::create_dir_all(&variants).unwrap();
        for id in ids {
            fs::write(variants.join(format!("{}.js", id)), "function parse() {}\n").unwrap();
        }
        let tracker = LineageTracker::new(ws.clone(), LineageConfig::default());
        (dir, tracker, ws)
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("v/parse/b.js")),
            PathBuf::from("v/parse/b.js.meta.json")
        );
    }

    #[test]
    fn test_generation_rules() {
        let (_dir, tracker, ws) = setup(&["baseline", "g1"]);
        let vdir = ws.variants_dir("parse");

        tracker
            .record("parse", &vdir.join("baseline.js"), &VariantMeta::root("baseline", "baseline"))
            .unwrap();

        // Generation 0 is reserved
        let err = tracker
            .record("parse", &vdir.join("g1.js"), &VariantMeta::root("g1", "gpt"))
            .unwrap_err();
        assert!(matches!(err, ForgeError::Lineage(_)));

        // Origin must exist
        let orphan = VariantMeta::derived("g1", "ghost", "gpt", 1);
        assert!(tracker.record("parse", &vdir.join("g1.js"), &orphan).is_err());

        // Origin without a later generation
        let flat = VariantMeta::derived("g1", "baseline", "gpt", 0);
        assert!(tracker.record("parse", &vdir.join("g1.js"), &flat).is_err());

        let ok = VariantMeta::derived("g1", "baseline", "gpt", 1).with_tags(vec!["memo".into()]);
        tracker.record("parse", &vdir.join("g1.js"), &ok).unwrap();
        assert_eq!(tracker.load(&vdir.join("g1.js")).unwrap(), Some(ok));
    }

    #[test]
    fn test_update_scores_creates_root_records() {
        let (_dir, tracker, ws) = setup(&["baseline", "b"]);
        let vdir = ws.variants_dir("parse");

        let mut base = VariantResult::new("baseline", vdir.join("baseline.js"), true);
        base.passed = 4;
        base.score = 0.7;
        let mut b = VariantResult::new("b", vdir.join("b.js"), false);
        b.passed = 3;
        b.failed = 1;
        b.score = 0.6;

        let result = BenchmarkResult {
            target: "parse".to_string(),
            target_type: TargetType::Function,
            timestamp: Utc::now(),
            profile: "balanced".to_string(),
            total_cases: 4,
            variants: vec![base, b],
            winner: None,
            reason: String::new(),
            degraded: false,
        };
        assert_eq!(tracker.update_scores(&result).unwrap(), 2);

        let meta = tracker.load(&vdir.join("b.js")).unwrap().unwrap();
        assert_eq!(meta.agent, "human");
        assert_eq!(meta.generation, 0);
        assert_eq!(meta.last_pass_rate, Some(0.75));
        let base_meta = tracker.load(&vdir.join("baseline.js")).unwrap().unwrap();
        assert_eq!(base_meta.agent, "baseline");
    }

    #[test]
    fn test_analyze() {
        let (_dir, tracker, ws) = setup(&["baseline", "a1", "a2", "b1"]);
        let vdir = ws.variants_dir("parse");

        let mut root = VariantMeta::root("baseline", "baseline");
        root.last_score = Some(0.6);
        root.last_pass_rate = Some(1.0);
        tracker.record("parse", &vdir.join("baseline.js"), &root).unwrap();

        let mut a1 = VariantMeta::derived("a1", "baseline", "alpha", 1)
            .with_tags(vec!["memoize".into(), "early-return".into()]);
        a1.last_score = Some(0.95);
        a1.last_pass_rate = Some(1.0);
        tracker.record("parse", &vdir.join("a1.js"), &a1).unwrap();

        let mut a2 = VariantMeta::derived("a2", "a1", "alpha", 2).with_tags(vec!["memoize".into()]);
        a2.last_score = Some(0.92);
        a2.last_pass_rate = Some(1.0);
        tracker.record("parse", &vdir.join("a2.js"), &a2).unwrap();

        let mut b1 = VariantMeta::derived("b1", "baseline", "beta", 1).with_tags(vec!["unroll".into()]);
        b1.last_score = Some(0.97);
        b1.last_pass_rate = Some(0.8);
        tracker.record("parse", &vdir.join("b1.js"), &b1).unwrap();

        let report = tracker.analyze("parse").unwrap();
        assert_eq!(report.variants, 4);
        assert_eq!(report.top_tags[0], TagCount { tag: "memoize".into(), count: 2 });
        assert_eq!(report.ancestor_counts.get("baseline"), Some(&3));
        assert_eq!(report.ancestor_counts.get("a1"), Some(&1));
        assert_eq!(report.agents["alpha"].wins, 2);
        assert_eq!(report.agents["beta"].wins, 0);
        assert_eq!(report.most_reliable_agent.as_deref(), Some("alpha"));
    }
}
