//! Denormalized copy of a record as stored in the mirror

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{PublicationStatus, Record};

/// Row status in the mirror
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorStatus {
    #[default]
    Draft,
    Published,
    Archived,
}

impl MirrorStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Published => "published",
            Self::Archived => "archived",
        }
    }

    /// Mirror status for a source publication status.
    ///
    /// Only fully public records are published; detail-only records stay drafts.
    pub const fn from_publication(status: PublicationStatus) -> Self {
        match status {
            PublicationStatus::Public => Self::Published,
            PublicationStatus::Private | PublicationStatus::PublicOnDetail => Self::Draft,
        }
    }
}

impl fmt::Display for MirrorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MirrorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown mirror status: {other}")),
        }
    }
}

/// Column values written to the mirror for one record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorDraft {
    pub external_id: String,
    pub title: String,
    pub slug: String,
    pub content: Option<serde_json::Value>,
    pub status: MirrorStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub cover_image: Option<String>,
}

impl MirrorDraft {
    /// Map a source record onto mirror columns.
    ///
    /// `updated_at` carries the source's own timestamp, so a mirror row that
    /// later reports a newer `updated_at` was edited on the mirror side.
    pub fn from_record(record: &Record) -> Self {
        let status = MirrorStatus::from_publication(record.status);
        Self {
            external_id: record.id.clone(),
            title: record.title.clone(),
            slug: record.slug.clone(),
            content: serde_json::to_value(record).ok(),
            status,
            published_at: (status == MirrorStatus::Published).then_some(record.date),
            created_at: record.created_at,
            updated_at: record.updated_at,
            tags: record.tags.clone(),
            category: record.category.clone(),
            summary: record.summary.clone(),
            cover_image: record.thumbnail.clone(),
        }
    }
}

/// A row in the mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorRecord {
    /// Surrogate key owned by the mirror
    pub id: Uuid,
    pub external_id: String,
    pub title: String,
    pub slug: String,
    pub content: Option<serde_json::Value>,
    pub status: MirrorStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tags: BTreeSet<String>,
    pub category: Option<String>,
    pub summary: Option<String>,
    pub cover_image: Option<String>,
}

impl MirrorRecord {
    /// Build a row from written columns and its surrogate id
    pub fn from_draft(id: Uuid, draft: MirrorDraft) -> Self {
        Self {
            id,
            external_id: draft.external_id,
            title: draft.title,
            slug: draft.slug,
            content: draft.content,
            status: draft.status,
            published_at: draft.published_at,
            created_at: draft.created_at,
            updated_at: draft.updated_at,
            tags: draft.tags,
            category: draft.category,
            summary: draft.summary,
            cover_image: draft.cover_image,
        }
    }

    /// Reconstruct a source-shaped record from mirror columns.
    ///
    /// Published rows map back to public, everything else to private.
    pub fn to_record(&self) -> Record {
        Record {
            id: self.external_id.clone(),
            title: self.title.clone(),
            slug: self.slug.clone(),
            tags: self.tags.clone(),
            category: self.category.clone(),
            summary: self.summary.clone(),
            status: if self.status == MirrorStatus::Published {
                PublicationStatus::Public
            } else {
                PublicationStatus::Private
            },
            created_at: self.created_at,
            date: self.published_at.unwrap_or(self.created_at),
            updated_at: self.updated_at,
            thumbnail: self.cover_image.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;

    fn record(status: PublicationStatus) -> Record {
        Record {
            id: "n1".to_string(),
            title: "Hello".to_string(),
            slug: "hello".to_string(),
            tags: BTreeSet::from(["rust".to_string()]),
            category: Some("dev".to_string()),
            summary: None,
            status,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            date: Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).unwrap(),
            thumbnail: None,
        }
    }

    #[test]
    fn public_records_are_published_with_date() {
        let source = record(PublicationStatus::Public);
        let draft = MirrorDraft::from_record(&source);
        assert_eq!(draft.status, MirrorStatus::Published);
        assert_eq!(draft.published_at, Some(source.date));
        assert_eq!(draft.updated_at, source.updated_at);
    }

    #[test]
    fn detail_only_records_stay_drafts() {
        let draft = MirrorDraft::from_record(&record(PublicationStatus::PublicOnDetail));
        assert_eq!(draft.status, MirrorStatus::Draft);
        assert_eq!(draft.published_at, None);
    }

    #[test]
    fn draft_row_maps_back_to_private_with_created_date() {
        let source = record(PublicationStatus::Private);
        let row = MirrorRecord::from_draft(Uuid::now_v7(), MirrorDraft::from_record(&source));
        let restored = row.to_record();
        assert_eq!(restored.status, PublicationStatus::Private);
        assert_eq!(restored.date, source.created_at);
        assert_eq!(restored.tags, source.tags);
    }
}
