//! codevolve CLI
//!
//! Thin shell over [`codevolve::Forge`]: argument mapping and printing only.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codevolve::{analysis, Forge, ForgeConfig, PatchOutcome, RunJournal, TargetType};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codevolve")]
#[command(about = "codevolve - benchmark, score and patch candidate rewrites of a code unit", long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to ./codevolve.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Workspace directory for artifacts
    #[arg(short, long, value_name = "DIR", global = true)]
    workspace: Option<PathBuf>,

    /// Target type (function, regex, prompt, query, config, struct)
    #[arg(short = 't', long = "type", default_value = "function", global = true)]
    kind: TargetType,

    /// Scoring profile (balanced, fastest, simplest, safe, or one from the config)
    #[arg(short, long, global = true)]
    profile: Option<String>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List every unit of the selected type in a file
    Extract {
        file: PathBuf,
    },

    /// Seed the baseline variant and write a generation request
    Prompt {
        file: PathBuf,
        target: String,
    },

    /// Benchmark all variants of a target and pick a winner
    Bench {
        target: String,
    },

    /// Write and print the analysis report for the last bench
    Analyze {
        target: String,
    },

    /// Archive the winner and patch it into the source file
    Apply {
        file: PathBuf,
        target: String,
    },

    /// Restore a file from a backup (or from the newest backup of a source file)
    Rollback {
        path: PathBuf,
    },

    /// Add adversarial test cases whose expectations come from the baseline
    Mutate {
        target: String,
    },

    /// Show lineage statistics for a target's variants
    Lineage {
        target: String,
    },

    /// Run generator rounds, then bench and analyze
    Evolve {
        file: PathBuf,
        target: String,

        /// Number of generations (defaults to the config value)
        #[arg(short = 'g', long)]
        generations: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let mut config = ForgeConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }

    let forge = Forge::new(config);
    let mut journal = RunJournal::new();
    let profile = cli.profile.as_deref();
    let kind = cli.kind;

    match cli.command {
        Commands::Extract { file } => {
            let items = forge
                .extract(&file, kind, &mut journal)
                .with_context(|| format!("extracting from {}", file.display()))?;
            for item in &items {
                println!("  {} ({} lines, bytes {}..{})", item.name, item.line_count(), item.start, item.end);
            }
            println!(
                "✓ Extracted {} {} unit(s) to {}",
                items.len(),
                kind,
                forge.workspace().extracted_path(&file, kind).display()
            );
        }

        Commands::Prompt { file, target } => {
            let path = forge
                .prepare_request(&file, &target, kind, profile, &mut journal)
                .with_context(|| format!("preparing request for `{}`", target))?;
            println!("✓ Request written to {}", path.display());
            println!(
                "  Add candidates under {}",
                forge.workspace().variants_dir(&target).display()
            );
        }

        Commands::Bench { target } => {
            let result = forge
                .bench(&target, kind, profile, &mut journal)
                .await
                .with_context(|| format!("benchmarking `{}`", target))?;

            println!("\n=== {} `{}` ({}) ===", result.target_type, result.target, result.profile);
            for v in &result.variants {
                println!(
                    "{:<24} {:>3}/{:<3} score {:.3}{}{}",
                    v.variant_id,
                    v.passed,
                    v.total(),
                    v.score,
                    if v.gated { "" } else { "  (gated out)" },
                    if v.degraded { "  [heuristic]" } else { "" }
                );
            }
            match &result.winner {
                Some(w) => println!("\n✓ Winner: {}", w),
                None => println!("\n✗ No winner: {}", result.reason),
            }
        }

        Commands::Analyze { target } => {
            let report = forge
                .analyze(&target, profile, &mut journal)
                .with_context(|| format!("analyzing `{}` (run `bench` first)", target))?;
            println!("{}", analysis::render_markdown(&report));
        }

        Commands::Apply { file, target } => {
            let outcome = forge
                .apply(&file, &target, &mut journal)
                .with_context(|| format!("applying winner of `{}`", target))?;
            match outcome {
                PatchOutcome::Applied(patch) => {
                    println!(
                        "✓ Patched `{}` in {} ({:+} lines)",
                        patch.name,
                        patch.file.display(),
                        patch.line_delta
                    );
                    println!("  Backup: {}", patch.backup.display());
                }
                PatchOutcome::TargetMissing { side, name } => {
                    println!("✗ `{}` not found in the {} file; nothing was written", name, side);
                    println!(
                        "  The winner is archived under {}",
                        forge.workspace().winners_dir(&target).display()
                    );
                }
            }
        }

        Commands::Rollback { path } => {
            let restored = forge
                .rollback(&path, &mut journal)
                .with_context(|| format!("rolling back {}", path.display()))?;
            println!("✓ Restored {}", restored.display());
        }

        Commands::Mutate { target } => {
            let report = forge
                .mutate(&target, kind, &mut journal)
                .await
                .with_context(|| format!("mutating cases for `{}`", target))?;
            println!(
                "✓ {} generated, {} out of contract, {} added, {} already present",
                report.generated, report.dropped, report.added, report.skipped
            );
        }

        Commands::Lineage { target } => {
            let report = forge
                .lineage(&target)
                .with_context(|| format!("reading lineage of `{}`", target))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Evolve { file, target, generations } => {
            let summary = forge
                .evolve(&file, &target, kind, profile, generations, &mut journal)
                .await
                .with_context(|| format!("evolving `{}`", target))?;
            for g in &summary.generations {
                println!(
                    "generation {}: parent {}, created [{}]{}",
                    g.generation,
                    g.parent,
                    g.created.join(", "),
                    if g.failures.is_empty() {
                        String::new()
                    } else {
                        format!(", {} failure(s)", g.failures.len())
                    }
                );
            }
            let rec = &summary.report.recommendation;
            match &rec.winner {
                Some(w) => println!("\n✓ Winner: {} ({} confidence)", w, rec.confidence),
                None => println!("\n✗ No winner: {}", rec.reason),
            }
        }
    }

    let warnings = journal.warnings().count();
    if warnings > 0 {
        log::info!("{} warning(s) during this run", warnings);
    }
    log::debug!("Run journal: {}", journal.summary());
    Ok(())
}
