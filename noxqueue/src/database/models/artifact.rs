//! Artifact and job-link database models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A stored file, deduplicated by content checksum.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ArtifactDbModel {
    pub id: String,
    /// Free-form kind, e.g. `audio`, `video`, `stem`, `analysis`
    pub kind: String,
    pub name: String,
    pub format: Option<String>,
    /// Hex-encoded SHA-256 of the content
    pub checksum: String,
    pub size_bytes: i64,
    /// Path relative to the storage root
    pub path: String,
    pub created_at: i64,
}

/// Which side of a job an artifact is attached to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ArtifactRole {
    Input,
    Output,
}

impl ArtifactRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "input" => Some(Self::Input),
            "output" => Some(Self::Output),
            _ => None,
        }
    }
}

/// A link row joined with its artifact.
#[derive(Debug, Clone, FromRow)]
pub struct LinkedArtifactRow {
    pub role: String,
    pub label: Option<String>,
    #[sqlx(flatten)]
    pub artifact: ArtifactDbModel,
}
