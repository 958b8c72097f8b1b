//! Divergence detection and resolution between source records and mirror rows.
//!
//! Two detectors coexist. [`coarse_conflict`] is the cheap check used on the
//! plain sync path: it only asks whether the mirror row was touched after the
//! source record. [`ConflictResolver::analyze_conflict`] is the multi-signal
//! analysis the conflict-aware batch mode runs before every update. Both feed
//! the same [`ConflictResolver::resolve_conflict`].

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::TimeDelta;
use serde::Serialize;

use crate::models::{
    ConflictType, MirrorRecord, MirrorStatus, Record, ResolutionStrategy, SyncConflict,
};

/// Timestamps further apart than this count as a timestamp conflict
const TIMESTAMP_TOLERANCE_SECS: i64 = 60;
/// A mirror this much newer than the source is assumed to carry edits worth merging
const MIRROR_NEWER_MERGE_SECS: i64 = 5 * 60;

const TIMESTAMP_WEIGHT: u8 = 30;
const CONTENT_WEIGHT: u8 = 40;
const METADATA_WEIGHT: u8 = 30;

/// Confidence attached to conflicts found by the coarse timestamp check
pub const COARSE_CONFIDENCE: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictAnalysis {
    pub has_conflict: bool,
    pub conflict_types: Vec<ConflictType>,
    /// In `[0, 1]`
    pub confidence: f64,
    pub recommended_resolution: ResolutionStrategy,
    pub reason: String,
}

/// Record produced by a resolution, plus an audit of what was decided
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub record: Record,
    /// Sub-decisions applied, in order
    pub strategies: Vec<String>,
    pub warnings: Vec<String>,
}

/// Stateless; construct one wherever it is needed
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub const fn new() -> Self {
        Self
    }

    pub fn analyze_conflict(&self, source: &Record, mirror: &MirrorRecord) -> ConflictAnalysis {
        let mut conflict_types = Vec::new();
        let mut weight: u8 = 0;

        let drift = mirror.updated_at - source.updated_at;
        if drift.abs() > TimeDelta::seconds(TIMESTAMP_TOLERANCE_SECS) {
            conflict_types.push(ConflictType::Timestamp);
            weight += TIMESTAMP_WEIGHT;
        }

        let content_differs = source.title != mirror.title
            || source.summary.as_deref().unwrap_or_default()
                != mirror.summary.as_deref().unwrap_or_default()
            || source.slug != mirror.slug;
        if content_differs {
            conflict_types.push(ConflictType::Content);
            weight += CONTENT_WEIGHT;
        }

        let metadata_differs = source.tags != mirror.tags
            || source.category != mirror.category
            || MirrorStatus::from_publication(source.status) != mirror.status;
        if metadata_differs {
            conflict_types.push(ConflictType::Metadata);
            weight += METADATA_WEIGHT;
        }

        if conflict_types.is_empty() {
            return ConflictAnalysis {
                has_conflict: false,
                conflict_types,
                confidence: 0.0,
                recommended_resolution: ResolutionStrategy::SourceWins,
                reason: "No significant conflicts detected".to_string(),
            };
        }

        let confidence = (f64::from(weight) / 100.0).min(1.0);
        let (recommended_resolution, reason) =
            if drift > TimeDelta::seconds(MIRROR_NEWER_MERGE_SECS) {
                (
                    ResolutionStrategy::Merge,
                    "Mirror is significantly newer, merging to keep its edits",
                )
            } else if conflict_types.contains(&ConflictType::Content) {
                (
                    ResolutionStrategy::Merge,
                    "Content differs, merging to preserve both sides",
                )
            } else {
                (
                    ResolutionStrategy::SourceWins,
                    "Only timestamp or metadata drift, source is authoritative",
                )
            };

        ConflictAnalysis {
            has_conflict: true,
            conflict_types,
            confidence,
            recommended_resolution,
            reason: reason.to_string(),
        }
    }

    /// Apply `strategy`, or the conflict's own resolution when `None`.
    ///
    /// Pure: nothing is written anywhere.
    pub fn resolve_conflict(
        &self,
        conflict: &SyncConflict,
        strategy: Option<ResolutionStrategy>,
    ) -> MergeOutcome {
        match strategy.unwrap_or(conflict.resolution) {
            ResolutionStrategy::SourceWins => MergeOutcome {
                record: conflict.source.clone(),
                strategies: vec!["source-wins".to_string()],
                warnings: vec!["Mirror changes will be overwritten".to_string()],
            },
            ResolutionStrategy::MirrorWins => MergeOutcome {
                record: conflict.mirror.to_record(),
                strategies: vec!["mirror-wins".to_string()],
                warnings: vec!["Source changes will be ignored".to_string()],
            },
            ResolutionStrategy::Merge => merge(&conflict.source, &conflict.mirror),
            ResolutionStrategy::Skip => MergeOutcome {
                record: conflict.source.clone(),
                strategies: vec!["skip".to_string()],
                warnings: vec!["Conflict was skipped, no changes made".to_string()],
            },
        }
    }

    /// Full analysis of one pair, as a conflict carrying the recommendation
    pub fn check(&self, source: &Record, mirror: &MirrorRecord) -> Option<SyncConflict> {
        let analysis = self.analyze_conflict(source, mirror);
        analysis.has_conflict.then(|| SyncConflict {
            source: source.clone(),
            mirror: mirror.clone(),
            conflict_type: primary_type(&analysis.conflict_types),
            resolution: analysis.recommended_resolution,
            confidence: analysis.confidence,
        })
    }

    /// One conflict per source record whose mirror row diverges
    pub fn detect_conflicts(
        &self,
        sources: &[Record],
        mirrors: &[MirrorRecord],
    ) -> Vec<SyncConflict> {
        let by_external_id: HashMap<&str, &MirrorRecord> = mirrors
            .iter()
            .map(|row| (row.external_id.as_str(), row))
            .collect();

        sources
            .iter()
            .filter_map(|source| {
                let mirror = by_external_id.get(source.id.as_str())?;
                self.check(source, mirror)
            })
            .collect()
    }

    pub fn generate_conflict_report(&self, conflicts: &[SyncConflict]) -> String {
        if conflicts.is_empty() {
            return "No conflicts detected.".to_string();
        }

        let mut report = format!(
            "Conflict Report ({} conflicts detected)\n{}\n\n",
            conflicts.len(),
            "=".repeat(50)
        );
        for (index, conflict) in conflicts.iter().enumerate() {
            let analysis = self.analyze_conflict(&conflict.source, &conflict.mirror);
            let _ = writeln!(report, "Conflict #{}: {}", index + 1, conflict.source.title);
            let _ = writeln!(report, "- Type: {}", conflict.conflict_type);
            let _ = writeln!(report, "- Confidence: {}%", percent(conflict.confidence));
            let _ = writeln!(report, "- Recommended: {}", conflict.resolution);
            let _ = writeln!(report, "- Reason: {}", analysis.reason);
            let _ = writeln!(report, "- Source ID: {}", conflict.source.id);
            let _ = writeln!(report, "- Mirror ID: {}", conflict.mirror.id);
            report.push('\n');
        }
        report
    }
}

/// Conflict signal used by the plain sync path: the mirror row was written
/// after the source record last changed.
pub fn coarse_conflict(
    source: &Record,
    mirror: &MirrorRecord,
    strategy: ResolutionStrategy,
) -> Option<SyncConflict> {
    (mirror.updated_at > source.updated_at).then(|| SyncConflict {
        source: source.clone(),
        mirror: mirror.clone(),
        conflict_type: ConflictType::Timestamp,
        resolution: strategy,
        confidence: COARSE_CONFIDENCE,
    })
}

fn merge(source: &Record, mirror: &MirrorRecord) -> MergeOutcome {
    let mut record = source.clone();
    let mut strategies = vec!["merge".to_string()];
    let mut warnings = Vec::new();

    if mirror.title != source.title && mirror.title.len() > source.title.len() {
        warnings.push("Mirror had a longer title that was ignored".to_string());
    }
    strategies.push("title-from-source".to_string());

    record.tags.extend(mirror.tags.iter().cloned());
    strategies.push("tags-merged".to_string());

    if mirror.category.is_some() && mirror.category != source.category {
        warnings.push(format!(
            "Category conflict: source=\"{}\" vs mirror=\"{}\"",
            source.category.as_deref().unwrap_or_default(),
            mirror.category.as_deref().unwrap_or_default()
        ));
    }

    let source_summary = source.summary.as_deref().unwrap_or_default();
    let mirror_summary = mirror.summary.as_deref().unwrap_or_default();
    if mirror_summary.len() > source_summary.len() {
        record.summary = mirror.summary.clone();
        strategies.push("summary-from-mirror".to_string());
    } else {
        strategies.push("summary-from-source".to_string());
    }

    strategies.push("status-from-source".to_string());

    MergeOutcome {
        record,
        strategies,
        warnings,
    }
}

fn primary_type(types: &[ConflictType]) -> ConflictType {
    [
        ConflictType::Content,
        ConflictType::Metadata,
        ConflictType::Timestamp,
    ]
    .into_iter()
    .find(|candidate| types.contains(candidate))
    .unwrap_or(ConflictType::Timestamp)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent(confidence: f64) -> u32 {
    (confidence.clamp(0.0, 1.0) * 100.0).round() as u32
}
