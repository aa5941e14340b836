// src/models/record.rs

//! Typed reference records produced by the content parser.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of reference data a source page provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecordKind {
    Genre,
    MetaTag,
    Technique,
}

impl RecordKind {
    /// All kinds, in refresh order.
    pub const ALL: [RecordKind; 3] = [RecordKind::Genre, RecordKind::MetaTag, RecordKind::Technique];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Genre => "genre",
            RecordKind::MetaTag => "metaTag",
            RecordKind::Technique => "technique",
        }
    }

    /// Retry-engine operation kind for fetching pages of this kind.
    pub fn fetch_operation(&self) -> &'static str {
        match self {
            RecordKind::Genre => "fetch-genre-page",
            RecordKind::MetaTag => "fetch-meta-tag-page",
            RecordKind::Technique => "fetch-technique-page",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Provenance shared by every record variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    /// Confidence in [0, 1]
    pub confidence: f64,
}

impl RecordMeta {
    pub fn new(source_url: impl Into<String>, confidence: f64) -> Self {
        Self {
            source_url: source_url.into(),
            fetched_at: Utc::now(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// A genre (category) entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenreRecord {
    pub name: String,
    pub description: String,
    pub subgenres: Vec<String>,
    pub traits: Vec<String>,
    pub instruments: Vec<String>,
    pub moods: Vec<String>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// A meta-tag (structure/style tag) entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaTagRecord {
    pub tag: String,
    pub category: String,
    pub description: String,
    pub examples: Vec<String>,
    pub compatible_categories: Vec<String>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// A technique or tip entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TechniqueRecord {
    pub name: String,
    pub description: String,
    pub technique_kind: String,
    pub examples: Vec<String>,
    pub scenarios: Vec<String>,
    #[serde(flatten)]
    pub meta: RecordMeta,
}

/// One parsed reference record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DomainRecord {
    Genre(GenreRecord),
    MetaTag(MetaTagRecord),
    Technique(TechniqueRecord),
}

impl DomainRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            DomainRecord::Genre(_) => RecordKind::Genre,
            DomainRecord::MetaTag(_) => RecordKind::MetaTag,
            DomainRecord::Technique(_) => RecordKind::Technique,
        }
    }

    /// Display name of the record.
    pub fn name(&self) -> &str {
        match self {
            DomainRecord::Genre(r) => &r.name,
            DomainRecord::MetaTag(r) => &r.tag,
            DomainRecord::Technique(r) => &r.name,
        }
    }

    pub fn meta(&self) -> &RecordMeta {
        match self {
            DomainRecord::Genre(r) => &r.meta,
            DomainRecord::MetaTag(r) => &r.meta,
            DomainRecord::Technique(r) => &r.meta,
        }
    }

    pub fn as_genre(&self) -> Option<&GenreRecord> {
        match self {
            DomainRecord::Genre(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_meta_tag(&self) -> Option<&MetaTagRecord> {
        match self {
            DomainRecord::MetaTag(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_technique(&self) -> Option<&TechniqueRecord> {
        match self {
            DomainRecord::Technique(r) => Some(r),
            _ => None,
        }
    }
}

/// Degradation tier a record set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataSource {
    Live,
    Cached,
    Fallback,
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataSource::Live => "live",
            DataSource::Cached => "cached",
            DataSource::Fallback => "fallback",
        })
    }
}

/// Records for one kind together with their provenance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRecords {
    pub kind: RecordKind,
    pub records: Vec<DomainRecord>,
    pub data_source: DataSource,
    pub quality_score: f64,
    pub resolved_at: DateTime<Utc>,
    /// Non-fatal problems met while resolving
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_with_type_tag() {
        let record = DomainRecord::Genre(GenreRecord {
            name: "Ambient".into(),
            description: "atmospheric".into(),
            subgenres: vec![],
            traits: vec!["synthesized".into()],
            instruments: vec![],
            moods: vec![],
            meta: RecordMeta::new("https://example.com/genres", 0.9),
        });

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "genre");
        assert_eq!(json["name"], "Ambient");
        assert_eq!(json["sourceUrl"], "https://example.com/genres");
        assert_eq!(record.kind(), RecordKind::Genre);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(RecordMeta::new("x", 1.7).confidence, 1.0);
        assert_eq!(RecordMeta::new("x", -0.2).confidence, 0.0);
    }

    #[test]
    fn test_data_source_ordering_follows_quality() {
        assert!(DataSource::Live < DataSource::Cached);
        assert!(DataSource::Cached < DataSource::Fallback);
    }
}
