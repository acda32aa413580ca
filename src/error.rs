//! Failure taxonomy.
//!
//! Most of these are recovered at the nearest component boundary and surfaced
//! as structured result fields ([`VariantError`], a null winner, a
//! `PatchOutcome`). Only artifact I/O is allowed to halt a run.

use crate::types::{PatchSide, TargetType};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, ForgeError>;

#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("no {kind} named `{name}` in {}", file.display())]
    ExtractionMiss {
        name: String,
        kind: TargetType,
        file: PathBuf,
    },

    #[error("failed to load variant `{variant}`: {reason}")]
    LoadFailure { variant: String, reason: String },

    #[error("evaluation exceeded {}ms", .0.as_millis())]
    EvaluationTimeout(Duration),

    #[error("runtime fault: {0}")]
    RuntimeFault(String),

    #[error("patch target `{name}` not found in {side} file")]
    PatchTargetMissing { name: String, side: PatchSide },

    #[error("no variant of `{0}` cleared the pass-rate gate")]
    NoValidVariant(String),

    #[error("invalid lineage record: {0}")]
    Lineage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("artifact I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artifact {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ForgeError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// The recoverable category of this error, if it has one.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::ExtractionMiss { .. } => Some(FailureKind::ExtractionMiss),
            Self::LoadFailure { .. } => Some(FailureKind::LoadFailure),
            Self::EvaluationTimeout(_) => Some(FailureKind::EvaluationTimeout),
            Self::RuntimeFault(_) => Some(FailureKind::RuntimeFault),
            Self::PatchTargetMissing { .. } => Some(FailureKind::PatchTargetMissing),
            Self::NoValidVariant(_) => Some(FailureKind::NoValidVariant),
            _ => None,
        }
    }

    /// Convert into the structured form stored in results.
    pub fn to_variant_error(&self) -> VariantError {
        VariantError {
            kind: self.kind().unwrap_or(FailureKind::RuntimeFault),
            message: self.to_string(),
        }
    }
}

/// Recoverable failure categories, as recorded in result artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    ExtractionMiss,
    LoadFailure,
    EvaluationTimeout,
    RuntimeFault,
    PatchTargetMissing,
    NoValidVariant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantError {
    pub kind: FailureKind,
    pub message: String,
}

impl VariantError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for VariantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}
