use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::MigrationError;
use crate::ops::{invert, SchemaOp};

/// Human-supplied change description. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Description(String);

impl Description {
    pub fn new(raw: &str) -> Result<Self, MigrationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MigrationError::usage(
                "a non-empty change description is required, e.g. \"add user table\"",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lowercase, underscore-separated fragment used in artifact file names.
    pub fn slug(&self) -> String {
        let mut slug = String::new();
        for c in self.0.chars() {
            if c.is_ascii_alphanumeric() {
                slug.push(c.to_ascii_lowercase());
            } else if !slug.ends_with('_') && !slug.is_empty() {
                slug.push('_');
            }
        }
        let slug: String = slug.chars().take(48).collect();
        match slug.trim_end_matches('_') {
            "" => "revision".to_string(),
            trimmed => trimmed.to_string(),
        }
    }
}

/// An immutable, ordered unit of schema change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub revision: String,
    pub down_revision: Option<String>,
    pub sequence: u32,
    pub description: String,
    pub created_at: String,
    pub upgrade: Vec<SchemaOp>,
    pub downgrade: Vec<SchemaOp>,
}

impl Artifact {
    /// Build the artifact that follows `parent` (or starts the chain).
    pub fn next(
        parent: Option<&Artifact>,
        description: &Description,
        upgrade: Vec<SchemaOp>,
    ) -> Result<Self, MigrationError> {
        let created_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| MigrationError::generation(format!("cannot format timestamp: {e}")))?;
        Self::with_timestamp(parent, description, upgrade, created_at)
    }

    pub(crate) fn with_timestamp(
        parent: Option<&Artifact>,
        description: &Description,
        upgrade: Vec<SchemaOp>,
        created_at: String,
    ) -> Result<Self, MigrationError> {
        let down_revision = parent.map(|p| p.revision.clone());
        let sequence = parent.map_or(1, |p| p.sequence + 1);
        let revision = revision_id(
            down_revision.as_deref(),
            sequence,
            description.as_str(),
            &created_at,
            &upgrade,
        )?;

        let downgrade = invert(&upgrade);
        Ok(Self {
            revision,
            down_revision,
            sequence,
            description: description.as_str().to_string(),
            created_at,
            upgrade,
            downgrade,
        })
    }

    /// Check that the stored id still matches the content it was derived from
    /// and that the downgrade set is the exact inverse of the upgrade set.
    pub fn verify(&self) -> Result<(), MigrationError> {
        let expected = revision_id(
            self.down_revision.as_deref(),
            self.sequence,
            &self.description,
            &self.created_at,
            &self.upgrade,
        )
        .map_err(|e| MigrationError::chain(format!("revision {}: {e}", self.revision)))?;
        if expected != self.revision {
            return Err(MigrationError::chain(format!(
                "revision {} does not match its contents (expected {expected}); \
                 was the artifact edited after generation?",
                self.revision
            )));
        }
        if self.downgrade != invert(&self.upgrade) {
            return Err(MigrationError::chain(format!(
                "revision {} has a downgrade set that does not invert its upgrade set",
                self.revision
            )));
        }
        Ok(())
    }

    pub fn file_name(&self) -> String {
        let slug = Description::new(&self.description)
            .map(|d| d.slug())
            .unwrap_or_else(|_| "revision".to_string());
        format!("{:04}_{}_{}.json", self.sequence, self.revision, slug)
    }

    pub fn is_empty(&self) -> bool {
        self.upgrade.is_empty()
    }
}

/// First 12 hex digits of xxh3 over predecessor, sequence, description,
/// timestamp and the encoded upgrade set.
fn revision_id(
    down_revision: Option<&str>,
    sequence: u32,
    description: &str,
    created_at: &str,
    upgrade: &[SchemaOp],
) -> Result<String, MigrationError> {
    let ops = serde_json::to_string(upgrade)
        .map_err(|e| MigrationError::generation(format!("cannot encode operations: {e}")))?;
    let material = format!(
        "{}\n{sequence}\n{description}\n{created_at}\n{ops}",
        down_revision.unwrap_or("")
    );
    Ok(format!("{:016x}", xxh3_64(material.as_bytes()))[..12].to_string())
}
