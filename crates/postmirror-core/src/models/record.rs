//! Canonical record owned by the source of truth

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Publication state as the source reports it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PublicationStatus {
    #[default]
    Private,
    Public,
    /// Reachable by direct link but hidden from listings
    PublicOnDetail,
}

impl PublicationStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Public => "public",
            Self::PublicOnDetail => "public-on-detail",
        }
    }

    /// Whether a detail page may be served for this status
    pub const fn is_visible_on_detail(self) -> bool {
        matches!(self, Self::Public | Self::PublicOnDetail)
    }
}

impl fmt::Display for PublicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PublicationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => Ok(Self::Private),
            "public" => Ok(Self::Public),
            "public-on-detail" | "publicondetail" => Ok(Self::PublicOnDetail),
            other => Err(format!("unknown publication status: {other}")),
        }
    }
}

/// A record as held by the source of truth
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Source-assigned identifier, immutable
    pub id: String,
    pub title: String,
    /// Unique URL slug
    pub slug: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub status: PublicationStatus,
    pub created_at: DateTime<Utc>,
    /// Publish date shown to readers
    pub date: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl Record {
    /// Whether the record appears in public listings
    pub fn is_public(&self) -> bool {
        self.status == PublicationStatus::Public
    }

    /// Whether the record changed strictly after `since`
    pub fn modified_after(&self, since: DateTime<Utc>) -> bool {
        self.updated_at > since
    }
}

/// A record together with its rendered body (opaque block map)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDetail {
    pub record: Record,
    pub body: serde_json::Value,
}
