//! Patcher - splices a winning variant back into its source file
//!
//! Offsets recorded at extraction time are never trusted: both the original and
//! the variant are re-resolved by name at apply time. A backup is written and
//! synced before the original is replaced atomically.

use crate::error::{ForgeError, Result};
use crate::extractor;
use crate::types::{AnalysisReport, PatchSide, TargetType};
use crate::workspace::{self, Workspace};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const BACKUP_MARKER: &str = ".bak.";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatchReport {
    pub file: PathBuf,
    pub backup: PathBuf,
    pub name: String,
    pub old_lines: usize,
    pub new_lines: usize,
    pub line_delta: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatchOutcome {
    Applied(PatchReport),
    /// Nothing was written
    TargetMissing { side: PatchSide, name: String },
}

impl PatchOutcome {
    pub fn into_result(self) -> Result<PatchReport> {
        match self {
            PatchOutcome::Applied(report) => Ok(report),
            PatchOutcome::TargetMissing { side, name } => {
                Err(ForgeError::PatchTargetMissing { name, side })
            }
        }
    }
}

/// Leading whitespace of the line containing `offset`, up to `offset`.
fn indent_at(source: &str, offset: usize) -> &str {
    let line_start = source[..offset].rfind('\n').map_or(0, |p| p + 1);
    let prefix = &source[line_start..offset];
    if prefix.chars().all(|c| c == ' ' || c == '\t') {
        prefix
    } else {
        ""
    }
}

/// Move every line after the first from one indentation base to another.
fn reindent(code: &str, from: &str, to: &str) -> String {
    if from == to {
        return code.to_string();
    }
    let mut out = String::with_capacity(code.len());
    for (i, line) in code.split('\n').enumerate() {
        if i > 0 {
            out.push('\n');
            if line.trim().is_empty() {
                continue;
            }
            out.push_str(to);
            out.push_str(line.strip_prefix(from).unwrap_or(line.trim_start()));
        } else {
            out.push_str(line);
        }
    }
    out
}

fn backup_path(original: &Path) -> PathBuf {
    let mut millis = chrono::Utc::now().timestamp_millis();
    loop {
        let mut name = original.as_os_str().to_os_string();
        name.push(format!("{}{}", BACKUP_MARKER, millis));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        millis += 1;
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| ForgeError::io(path, e))?;
    file.write_all(bytes).map_err(|e| ForgeError::io(path, e))?;
    file.sync_all().map_err(|e| ForgeError::io(path, e))
}

/// The source file a backup belongs to, if `backup` is named `<file>.bak.<digits>`.
pub fn backup_origin(backup: &Path) -> Option<PathBuf> {
    let name = backup.file_name()?.to_str()?;
    let (stem, stamp) = name.rsplit_once(BACKUP_MARKER)?;
    if stem.is_empty() || stamp.is_empty() || !stamp.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some(backup.with_file_name(stem))
}

/// Newest backup beside `original`.
pub fn latest_backup(original: &Path) -> Result<Option<PathBuf>> {
    let dir = match original.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let Some(file_name) = original.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let prefix = format!("{}{}", file_name, BACKUP_MARKER);

    let mut best: Option<(u64, PathBuf)> = None;
    for entry in fs::read_dir(&dir).map_err(|e| ForgeError::io(&dir, e))? {
        let entry = entry.map_err(|e| ForgeError::io(&dir, e))?;
        let name = entry.file_name();
        let Some(stamp) = name.to_str().and_then(|n| n.strip_prefix(&prefix)) else {
            continue;
        };
        if let Ok(stamp) = stamp.parse::<u64>() {
            if best.as_ref().map_or(true, |(b, _)| stamp > *b) {
                best = Some((stamp, entry.path()));
            }
        }
    }
    Ok(best.map(|(_, path)| path))
}

pub struct Patcher {
    applied: Vec<PatchReport>,
}

impl Patcher {
    pub fn new() -> Self {
        Self {
            applied: Vec::new(),
        }
    }

    /// Replace unit `name` in `original` with the same-named unit from `variant`.
    pub fn apply(
        &mut self,
        original: &Path,
        variant: &Path,
        name: &str,
        kind: TargetType,
    ) -> Result<PatchOutcome> {
        let source = workspace::read_text(original)?;
        let Some(target) = extractor::find_unit(&source, original, kind, name) else {
            log::warn!("{} not found in {}", name, original.display());
            return Ok(PatchOutcome::TargetMissing {
                side: PatchSide::Original,
                name: name.to_string(),
            });
        };

        let variant_source = workspace::read_text(variant)?;
        let Some(replacement) = extractor::find_unit(&variant_source, variant, kind, name) else {
            log::warn!("{} not found in {}", name, variant.display());
            return Ok(PatchOutcome::TargetMissing {
                side: PatchSide::Variant,
                name: name.to_string(),
            });
        };

        let code = reindent(
            &replacement.code,
            indent_at(&variant_source, replacement.start),
            indent_at(&source, target.start),
        );

        let backup = backup_path(original);
        write_synced(&backup, source.as_bytes())?;
        if let Ok(meta) = fs::metadata(original) {
            fs::set_permissions(&backup, meta.permissions()).map_err(|e| ForgeError::io(&backup, e))?;
        }

        let mut patched = String::with_capacity(source.len() + code.len());
        patched.push_str(&source[..target.start]);
        patched.push_str(&code);
        patched.push_str(&source[target.end..]);
        workspace::write_atomic(original, patched.as_bytes())?;

        let old_lines = target.line_count();
        let new_lines = code.lines().count().max(1);
        let report = PatchReport {
            file: original.to_path_buf(),
            backup,
            name: name.to_string(),
            old_lines,
            new_lines,
            line_delta: new_lines as i64 - old_lines as i64,
        };
        log::info!(
            "Patched `{}` in {} ({:+} lines, backup {})",
            name,
            original.display(),
            report.line_delta,
            report.backup.display()
        );
        self.applied.push(report.clone());
        Ok(PatchOutcome::Applied(report))
    }

    /// Restore the file a backup was taken from, byte for byte. Returns that file's path.
    pub fn rollback(&mut self, backup: &Path) -> Result<PathBuf> {
        let original = backup_origin(backup).ok_or_else(|| {
            ForgeError::io(
                backup,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a `.bak.<millis>` backup"),
            )
        })?;
        let bytes = fs::read(backup).map_err(|e| ForgeError::io(backup, e))?;
        workspace::write_atomic(&original, &bytes)?;
        self.applied.retain(|p| p.backup != backup);
        log::warn!("Rolled back {} from {}", original.display(), backup.display());
        Ok(original)
    }

    pub fn applied(&self) -> &[PatchReport] {
        &self.applied
    }
}

impl Default for Patcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Copy the winning variant and its analysis into `winners/<target>/`.
pub fn archive_winner(
    workspace: &Workspace,
    target: &str,
    winner_file: &Path,
    report: &AnalysisReport,
) -> Result<PathBuf> {
    let dir = workspace.winners_dir(target);
    let file_name = winner_file
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("winner"));
    let dest = dir.join(file_name);

    let bytes = fs::read(winner_file).map_err(|e| ForgeError::io(winner_file, e))?;
    workspace::write_atomic(&dest, &bytes)?;
    workspace::write_json(&dir.join("analysis.json"), report)?;
    Ok(dest)
}
