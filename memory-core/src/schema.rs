//! The shared data model: [`MemoryCell`] and its satellites.
//!
//! [`MemoryCell`] carries an explicit, typed field set for everything the
//! engine reasons about directly, plus a separate untyped `metadata` map for
//! the long tail of bookkeeping fields (merge history, promotion markers,
//! feedback counters). Backend payloads decode into this shape; unknown
//! payload keys land in `metadata` rather than widening the struct.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Episodic,
    Semantic,
    Preference,
    Relationship,
    Procedural,
    Profile,
    Core,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Public,
    Private,
    Secret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Critical,
    Important,
    Reference,
    Background,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Technical,
    Personal,
    Project,
    Knowledge,
    General,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceTag {
    Verified,
    Grounded,
    Inferred,
    Uncertain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Public,
    Private,
}

/// The vector-store partition a cell belongs to. Not serialized onto the
/// cell itself — derived from `classification`/`scope` at store time
/// and used to pick a collection name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    Shared,
    Private,
    Profiles,
    Skills,
}

/// The atomic unit of memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryCell {
    pub id: Uuid,
    pub content: String,
    pub category: Option<String>,

    pub memory_type: MemoryType,
    pub classification: Classification,
    pub urgency: Urgency,
    pub domain: Domain,
    pub confidence_tag: ConfidenceTag,

    pub confidence: f32,
    pub importance: f32,
    pub priority: f32,

    pub agent_id: String,
    pub user_id: Option<String>,
    pub scope: Scope,

    pub linked_memories: Vec<Uuid>,

    pub event_time: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    pub access_times: Vec<DateTime<Utc>>,
    pub access_count: u32,
    pub deleted: bool,

    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl MemoryCell {
    /// Build a new cell with engine defaults applied for any field a caller
    /// doesn't set explicitly.
    pub fn new(content: String, agent_id: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content,
            category: None,
            memory_type: MemoryType::Semantic,
            classification: Classification::Private,
            urgency: Urgency::Reference,
            domain: Domain::Knowledge,
            confidence_tag: ConfidenceTag::Inferred,
            confidence: 0.5,
            importance: 0.5,
            priority: 0.5,
            agent_id,
            user_id: None,
            scope: Scope::Private,
            linked_memories: Vec::new(),
            event_time: None,
            ingested_at: now,
            created_at: now,
            updated_at: now,
            access_times: Vec::new(),
            access_count: 0,
            deleted: false,
            metadata: HashMap::new(),
        }
    }

    /// Partition selector: `{secret→error, private→private, public→shared}`.
    /// Callers must already have rejected `secret`; this is a debug-time
    /// invariant check, not the policy gate itself.
    pub fn partition(&self) -> Option<Partition> {
        match self.classification {
            Classification::Secret => None,
            Classification::Private => Some(Partition::Private),
            Classification::Public => Some(Partition::Shared),
        }
    }

    /// cells of these types are never archived by decay or pruning.
    pub fn is_pinned(&self) -> bool {
        matches!(self.memory_type, MemoryType::Core | MemoryType::Procedural)
    }

    /// Clamp confidence to the floor after any update.
    pub fn clamp_confidence(&mut self) {
        self.confidence = self.confidence.clamp(0.1, 1.0);
    }

    pub fn record_access(&mut self, at: DateTime<Utc>) {
        self.access_times.push(at);
        self.access_count += 1;
    }

    /// Hours since the most recent access, or since `created_at` if the
    /// access list is empty (the "synthetic access" rule).
    pub fn hours_since_last_access(&self, now: DateTime<Utc>) -> f32 {
        let reference = self.access_times.last().copied().unwrap_or(self.created_at);
        ((now - reference).num_seconds().max(0) as f32 / 3600.0).max(0.001)
    }

    pub fn hours_since_creation(&self, now: DateTime<Utc>) -> f32 {
        (now - self.created_at).num_seconds().max(0) as f32 / 3600.0
    }
}

/// Kinds of discovered regularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternKind {
    CoOccurrence,
    Sequence,
    Cluster,
    RecurringError,
    Correlation,
    Anomaly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Uuid,
    pub kind: PatternKind,
    pub description: String,
    pub confidence: f32,
    pub occurrences: u32,
    pub evidence_ids: Vec<Uuid>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonType {
    Correction,
    Fix,
    Gotcha,
    Learned,
    AntiPattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lesson {
    pub id: Uuid,
    pub lesson_type: LessonType,
    pub wrong_assumption: Option<String>,
    pub correction: String,
    pub source_context: String,
    pub confidence: f32,
    pub source_memory_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedBlock {
    pub name: String,
    pub content: String,
    pub version: u64,
    pub last_writer: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceEntry {
    pub category: String,
    pub value: String,
    pub strength: f32,
    pub evidence_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub source_ids: Vec<Uuid>,
}

/// Per (user, agent) running preference model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserModel {
    pub preferences: HashMap<String, PreferenceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrustrationState {
    pub level: f32,
    pub consecutive_negative: u32,
    pub last_signal: Option<String>,
    pub last_updated: DateTime<Utc>,
    pub history: Vec<(DateTime<Utc>, f32)>,
}

impl Default for FrustrationState {
    fn default() -> Self {
        Self {
            level: 0.0,
            consecutive_negative: 0,
            last_signal: None,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastEvent {
    NewMemory,
    ConflictResolved,
    Critical,
    Invalidate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub memory_id: Uuid,
    pub agent_id: String,
    pub memory_type: MemoryType,
    pub scope: Scope,
    pub text_preview: String,
    pub event: BroadcastEvent,
    pub linked_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_cell_has_sane_defaults() {
        let cell = MemoryCell::new("hello".into(), "agent-1".into());
        assert_eq!(cell.access_count, 0);
        assert!(!cell.deleted);
        assert_eq!(cell.partition(), Some(Partition::Private));
    }

    #[test]
    fn secret_has_no_partition() {
        let mut cell = MemoryCell::new("hello".into(), "agent-1".into());
        cell.classification = Classification::Secret;
        assert_eq!(cell.partition(), None);
    }

    #[test]
    fn confidence_clamps_to_point_one_floor() {
        let mut cell = MemoryCell::new("hello".into(), "agent-1".into());
        cell.confidence = -1.0;
        cell.clamp_confidence();
        assert_eq!(cell.confidence, 0.1);
    }

    #[test]
    fn core_and_procedural_are_pinned() {
        let mut cell = MemoryCell::new("x".into(), "a".into());
        cell.memory_type = MemoryType::Core;
        assert!(cell.is_pinned());
        cell.memory_type = MemoryType::Procedural;
        assert!(cell.is_pinned());
        cell.memory_type = MemoryType::Episodic;
        assert!(!cell.is_pinned());
    }

    #[test]
    fn empty_access_list_uses_created_at() {
        let cell = MemoryCell::new("x".into(), "a".into());
        let now = cell.created_at + chrono::Duration::hours(5);
        assert!((cell.hours_since_last_access(now) - 5.0).abs() < 0.01);
    }
}
