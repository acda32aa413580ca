//! Workspace layout and artifact I/O
//!
//! ```text
//! <root>/
//!   extracted/<file-stem>.<type>.json
//!   tests/<target>.json
//!   variants/<target>/<id>.<ext>[.meta.json]
//!   results/<target>.json
//!   reports/<target>.{json,md}
//!   requests/<target>.md
//!   winners/<target>/<id>.<ext>, analysis.json
//! ```

use crate::error::{ForgeError, Result};
use crate::types::TargetType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Target names become path components; anything outside `[A-Za-z0-9._-]` is replaced.
    pub fn sanitize(target: &str) -> String {
        let cleaned: String = target
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        match cleaned.trim_matches('.') {
            "" => "_".to_string(),
            s => s.to_string(),
        }
    }

    pub fn extracted_path(&self, source: &Path, kind: TargetType) -> PathBuf {
        let stem = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("source");
        self.root
            .join("extracted")
            .join(format!("{}.{}.json", Self::sanitize(stem), kind))
    }

    pub fn tests_path(&self, target: &str) -> PathBuf {
        self.root
            .join("tests")
            .join(format!("{}.json", Self::sanitize(target)))
    }

    pub fn variants_dir(&self, target: &str) -> PathBuf {
        self.root.join("variants").join(Self::sanitize(target))
    }

    pub fn results_path(&self, target: &str) -> PathBuf {
        self.root
            .join("results")
            .join(format!("{}.json", Self::sanitize(target)))
    }

    pub fn report_json_path(&self, target: &str) -> PathBuf {
        self.root
            .join("reports")
            .join(format!("{}.json", Self::sanitize(target)))
    }

    pub fn report_md_path(&self, target: &str) -> PathBuf {
        self.root
            .join("reports")
            .join(format!("{}.md", Self::sanitize(target)))
    }

    pub fn request_path(&self, target: &str) -> PathBuf {
        self.root
            .join("requests")
            .join(format!("{}.md", Self::sanitize(target)))
    }

    pub fn winners_dir(&self, target: &str) -> PathBuf {
        self.root.join("winners").join(Self::sanitize(target))
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| ForgeError::io(path, e))
}

pub fn read_text(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| ForgeError::io(path, e))
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = read_text(path)?;
    serde_json::from_str(&text).map_err(|source| ForgeError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Like [`read_json`], but a missing file is `None` rather than an error.
pub fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut text = serde_json::to_string_pretty(value).map_err(|source| ForgeError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    text.push('\n');
    write_atomic(path, text.as_bytes())
}

/// Write through a synced temp file in the destination directory, then rename over it.
/// An existing destination keeps its permissions.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    ensure_dir(&dir)?;

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("artifact");
    let short = uuid::Uuid::new_v4().simple().to_string();
    let tmp = dir.join(format!(".{}.{}.tmp", name, &short[..8]));

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        if let Ok(existing) = fs::metadata(path) {
            fs::set_permissions(&tmp, existing.permissions())?;
        }
        fs::rename(&tmp, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp);
        return Err(ForgeError::io(path, e));
    }
    Ok(())
}
