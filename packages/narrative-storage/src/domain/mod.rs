//! Domain entities for the narrative generation engine.
//!
//! JSON-shaped fields are stored as `TEXT` columns and serialized/deserialized
//! by the calling code rather than by the database — sqlx's SQLite driver has
//! no native JSON column type, only the `json` feature's `sqlx::types::Json`
//! wrapper, which this crate avoids so callers keep full control over
//! malformed-input handling (see `StorageError::Serialization`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Workflow cursor tag. Stored as its lowercase-kebab string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectStage {
    Created,
    Planning,
    WorldBuilding,
    Outline,
    DetailOutline,
    Writing,
    QualityCheck,
    Completed,
}

impl ProjectStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Planning => "planning",
            Self::WorldBuilding => "world-building",
            Self::Outline => "outline",
            Self::DetailOutline => "detail-outline",
            Self::Writing => "writing",
            Self::QualityCheck => "quality-check",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "created" => Self::Created,
            "planning" => Self::Planning,
            "world-building" => Self::WorldBuilding,
            "outline" => Self::Outline,
            "detail-outline" => Self::DetailOutline,
            "writing" => Self::Writing,
            "quality-check" => Self::QualityCheck,
            "completed" => Self::Completed,
            _ => return None,
        })
    }

    /// Numeric rank used for the `current_step` monotonicity invariant.
    pub fn rank(&self) -> i64 {
        match self {
            Self::Created => 0,
            Self::Planning => 1,
            Self::WorldBuilding => 2,
            Self::Outline => 3,
            Self::DetailOutline => 4,
            Self::Writing => 5,
            Self::QualityCheck => 6,
            Self::Completed => 6,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub title: String,
    pub author: Option<String>,
    pub genre: Option<String>,
    /// JSON array of short tag ids.
    pub plot_tags: String,
    pub description: Option<String>,
    pub planning_text: Option<String>,
    pub world_building_raw: Option<String>,
    pub outline_raw: Option<String>,
    pub stage: String,
    pub current_step: i64,
    /// Never serialized into a prompt; only read/written by explicit config operations.
    pub spoiler_global_config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    pub fn stage(&self) -> ProjectStage {
        ProjectStage::parse(&self.stage).unwrap_or(ProjectStage::Created)
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Volume {
    pub id: i64,
    pub project_id: i64,
    pub title: String,
    pub order: i64,
    pub description: Option<String>,
    /// JSON object; optional per-volume config that may appear in prompts.
    pub config: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub volume_id: i64,
    pub title: String,
    pub order: i64,
    pub content: String,
    pub summary: Option<String>,
    pub detail_outline: Option<String>,
    pub word_count: i64,
    /// JSON array of strings.
    pub key_events: String,
    /// JSON array of character names.
    pub characters_involved: String,
    /// JSON object.
    pub quality_report: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chapter {
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Character {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub archetype: Option<String>,
    pub background: Option<String>,
    /// JSON map string -> 1..10.
    pub personality_traits: String,
    /// JSON map name -> {kind, intimacy, first_met_chapter, notes}.
    pub relationships: String,
    /// JSON list of memory objects.
    pub memories: String,
    /// JSON list of short strings.
    pub lorebook_keywords: String,
    pub current_mood: Option<String>,
    pub current_status: Option<String>,
    /// JSON list of strings.
    pub goals: String,
    /// JSON list of strings.
    pub catchphrases: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldItemKind {
    Location,
    Organization,
    Item,
    Rule,
}

impl WorldItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Location => "location",
            Self::Organization => "organization",
            Self::Item => "item",
            Self::Rule => "rule",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "location" => Self::Location,
            "organization" => Self::Organization,
            "item" => Self::Item,
            "rule" => Self::Rule,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WorldItem {
    pub id: i64,
    pub project_id: i64,
    pub kind: String,
    pub name: String,
    pub description: String,
    /// JSON object, shape depends on `kind`.
    pub properties: String,
    /// JSON list of short strings.
    pub lorebook_keywords: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlotArcStatus {
    Planted,
    Developing,
    Resolved,
    Abandoned,
}

impl PlotArcStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planted => "planted",
            Self::Developing => "developing",
            Self::Resolved => "resolved",
            Self::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "planted" => Self::Planted,
            "developing" => Self::Developing,
            "resolved" => Self::Resolved,
            "abandoned" => Self::Abandoned,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Importance {
    High,
    Medium,
    Low,
}

impl Importance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "high" => Self::High,
            "medium" => Self::Medium,
            "low" => Self::Low,
            _ => return None,
        })
    }

    /// Lower is more important; used to sort arcs high-first.
    pub fn rank(&self) -> u8 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct PlotArc {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub description: String,
    pub status: String,
    pub planted_chapter: Option<i64>,
    pub resolved_chapter: Option<i64>,
    /// JSON list of character names.
    pub related_characters: String,
    /// JSON list of keyword strings.
    pub related_keywords: String,
    pub importance: String,
    /// JSON list of f32, stored as a JSON array of numbers.
    pub embedding: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PlotArc {
    pub fn status(&self) -> PlotArcStatus {
        PlotArcStatus::parse(&self.status).unwrap_or(PlotArcStatus::Planted)
    }

    pub fn importance(&self) -> Importance {
        Importance::parse(&self.importance).unwrap_or(Importance::Medium)
    }

    pub fn is_active(&self) -> bool {
        !self.status().is_terminal()
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct StyleProfile {
    pub id: i64,
    pub project_id: i64,
    pub name: String,
    pub source_text: String,
    /// JSON object of structured stylistic features.
    pub features: String,
    pub style_guide: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of a cost-ledger day's `calls` array. Persisted to the cost
/// ledger's JSON document, not to the relational store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostLedgerEntry {
    pub timestamp: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub task_tag: String,
}

/// A calendar day's aggregate in the cost ledger document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostLedgerDay {
    pub total_cost: f64,
    pub total_tokens: i64,
    pub call_count: i64,
    pub calls: Vec<CostLedgerEntry>,
}

/// One line of a chapter's append-only rewrite-history file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewriteHistoryEntry {
    pub history_id: String,
    pub timestamp: DateTime<Utc>,
    pub chapter_id: i64,
    pub chapter_title: String,
    pub instruction: String,
    pub rewrite_mode: String,
    pub scope: String,
    pub original_content: String,
    pub new_content: String,
}
