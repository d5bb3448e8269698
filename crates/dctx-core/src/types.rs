//! Core data model: workspaces, active context, decisions, progress
//! entries, patterns, custom data, links, backend descriptors, snapshots,
//! events, and attention samples.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

/// A project root. Canonical form is an absolute filesystem path; two
/// `WorkspaceId`s are equal iff their canonical paths are equal.
pub type WorkspaceId = String;

// ---------------------------------------------------------------------------
// Active Context
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Plan,
    Act,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionState {
    Scattered,
    Focused,
    Hyperfocused,
    Transitioning,
    Overwhelmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyLevel {
    VeryLow,
    Low,
    Medium,
    High,
    Hyperfocus,
}

impl EnergyLevel {
    /// Ordinal distance used for `energy_match` scoring (§4.4): adjacent
    /// levels are a "one-step mismatch", anything further is "two-step".
    pub fn ordinal(self) -> i32 {
        match self {
            EnergyLevel::VeryLow => 0,
            EnergyLevel::Low => 1,
            EnergyLevel::Medium => 2,
            EnergyLevel::High => 3,
            EnergyLevel::Hyperfocus => 4,
        }
    }
}

/// The mutable, per-workspace singleton document describing "what the
/// user is doing right now" (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveContext {
    pub workspace_id: WorkspaceId,
    #[serde(default)]
    pub current_focus: Option<String>,
    #[serde(default)]
    pub current_task: Option<i64>,
    #[serde(default)]
    pub session_start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub session_end: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub attention_state: Option<AttentionState>,
    #[serde(default)]
    pub energy_level: Option<EnergyLevel>,
    #[serde(default)]
    pub on_break: bool,
    #[serde(default)]
    pub last_break: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,
    #[serde(default)]
    pub next_steps: Vec<String>,
    #[serde(default)]
    pub blockers: Vec<String>,
    #[serde(default)]
    pub git_state: Option<serde_json::Value>,
    #[serde(default)]
    pub open_files: Vec<String>,
    #[serde(default)]
    pub adhd_metrics: Option<serde_json::Value>,
}

impl ActiveContext {
    pub fn new(workspace_id: impl Into<WorkspaceId>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            current_focus: None,
            current_task: None,
            session_start: None,
            session_end: None,
            mode: None,
            attention_state: None,
            energy_level: None,
            on_break: false,
            last_break: None,
            completed_tasks: Vec::new(),
            next_steps: Vec::new(),
            blockers: Vec::new(),
            git_state: None,
            open_files: Vec::new(),
            adhd_metrics: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// An immutable record of an architectural or implementation choice.
/// Once created, `summary`, `rationale`, and `implementation_details`
/// never change (§8 property 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: i64,
    pub workspace_id: WorkspaceId,
    pub summary: String,
    pub rationale: String,
    pub implementation_details: Option<String>,
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Progress Entry (Task) — status DAG
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressStatus {
    Todo,
    InProgress,
    Blocked,
    Done,
    Cancelled,
}

impl ProgressStatus {
    /// Whether `self -> next` is a member of the allowed transition set (§3).
    ///
    /// `DONE`/`CANCELLED` are terminal and may only be left via an explicit
    /// undo, which this DAG does not expose as an ordinary transition.
    pub fn can_transition_to(self, next: ProgressStatus) -> bool {
        use ProgressStatus::*;
        match (self, next) {
            (_, Blocked) | (_, Cancelled) => true,
            (Todo, InProgress) => true,
            (InProgress, Done) | (InProgress, Blocked) | (InProgress, Todo) => true,
            (Blocked, Todo) | (Blocked, InProgress) | (Blocked, Cancelled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnergyRequired {
    Low,
    Medium,
    High,
}

impl EnergyRequired {
    /// Maps the three-valued task requirement onto the five-valued
    /// `EnergyLevel` ordinal space for scoring purposes.
    pub fn ordinal(self) -> i32 {
        match self {
            EnergyRequired::Low => 1,
            EnergyRequired::Medium => 2,
            EnergyRequired::High => 3,
        }
    }
}

/// A unit of work the user can run, complete, or abandon (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEntry {
    pub progress_id: i64,
    pub workspace_id: WorkspaceId,
    pub status: ProgressStatus,
    pub description: String,
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub complexity_score: Option<f64>,
    pub estimated_minutes: Option<u32>,
    pub energy_required: Option<EnergyRequired>,
    pub cognitive_load: Option<f64>,
    pub break_points: Vec<u32>,
}

impl ProgressEntry {
    /// Apply a validated transition, enforcing the `status=DONE` implies
    /// `completed_at` invariant from §3.
    pub fn apply_transition(
        &mut self,
        next: ProgressStatus,
        description: Option<String>,
    ) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::IllegalTransition {
                from: format!("{:?}", self.status),
                to: format!("{:?}", next),
            });
        }
        self.status = next;
        if let Some(d) = description {
            self.description = d;
        }
        self.updated_at = Utc::now();
        self.completed_at = if next == ProgressStatus::Done {
            Some(self.updated_at)
        } else {
            None
        };
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// System Pattern, Custom Data, Glossary Term
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemPattern {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub description: String,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomData {
    pub workspace_id: WorkspaceId,
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub workspace_id: WorkspaceId,
    pub name: String,
    pub definition: String,
}

// ---------------------------------------------------------------------------
// Link
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Relationship {
    Blocks,
    BlockedBy,
    Implements,
    Verifies,
    DependsOn,
    Produces,
    Consumes,
    DerivedFrom,
    RelatedTo,
    Clarifies,
    Resolves,
    Tracks,
    InformedBy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Decision,
    Progress,
    Pattern,
    CustomData,
    Glossary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Link {
    pub workspace_id: WorkspaceId,
    pub source_type: ItemType,
    pub source_id: String,
    pub target_type: ItemType,
    pub target_id: String,
    pub relationship: Relationship,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Backend Server (transient, in-memory)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transport {
    Http,
    Stdio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleTag {
    Documentation,
    CodeSearch,
    WebResearch,
    Reasoning,
    Memory,
    TaskPlanning,
    CodeEditing,
    Rerank,
    DesktopAutomation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Utility,
    Quality,
    Research,
    Workflow,
    CriticalPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Up,
    Degraded,
    Down,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendDescriptor {
    pub name: String,
    pub endpoint: String,
    pub transport: Transport,
    pub role_tags: Vec<RoleTag>,
    pub priority: Priority,
    #[serde(default)]
    pub probe_path: Option<String>,
    #[serde(default)]
    pub probe_port: Option<u16>,
    pub default_timeout_ms: u64,
    #[serde(default = "default_health")]
    pub health: Health,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_latency_ms: Option<u64>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

fn default_health() -> Health {
    Health::Unknown
}

// ---------------------------------------------------------------------------
// Workspace Snapshot (sync metadata)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub workspace_id: WorkspaceId,
    /// Sorted `(relative path, sha256 hex)` pairs.
    pub files: Vec<(String, String)>,
    /// Content-addressed digest over the sorted file list.
    pub digest: String,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetadata {
    #[serde(default)]
    pub broadcast: bool,
    #[serde(default)]
    pub requires_ack: bool,
    #[serde(default)]
    pub expected_sequence: Option<u64>,
}

impl Default for RoutingMetadata {
    fn default() -> Self {
        Self {
            broadcast: true,
            requires_ack: false,
            expected_sequence: None,
        }
    }
}

/// Tagged event payload, replacing the source's stringly-typed maps
/// per the design-notes redesign flag (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data", rename_all = "snake_case")]
pub enum EventData {
    TaskCreated { progress_id: i64 },
    StatusChanged { progress_id: i64, status: ProgressStatus },
    CodeChanged { paths: Vec<String> },
    DecisionLogged { decision_id: i64 },
    ToolInvoked { tool: String, backend_name: String },
    SessionStarted,
    SessionEnded,
    BreakStarted,
    BreakEnded,
    BreakRecommended,
    BreakRequired,
    HyperfocusDetected,
    OverwhelmDetected,
    DegradedMode,
}

impl EventData {
    /// The authoritative emitter for this event type (§4.5 authority matrix).
    pub fn required_source(&self) -> Option<&'static str> {
        match self {
            EventData::TaskCreated { .. } => Some("task-planning"),
            EventData::StatusChanged { .. } => Some("project-management"),
            EventData::CodeChanged { .. } => Some("code-navigation"),
            EventData::DecisionLogged { .. } => Some("session-store"),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventData::TaskCreated { .. } => "task_created",
            EventData::StatusChanged { .. } => "status_changed",
            EventData::CodeChanged { .. } => "code_changed",
            EventData::DecisionLogged { .. } => "decision_logged",
            EventData::ToolInvoked { .. } => "tool_invoked",
            EventData::SessionStarted => "session_started",
            EventData::SessionEnded => "session_ended",
            EventData::BreakStarted => "break_started",
            EventData::BreakEnded => "break_ended",
            EventData::BreakRecommended => "break_recommended",
            EventData::BreakRequired => "break_required",
            EventData::HyperfocusDetected => "hyperfocus_detected",
            EventData::OverwhelmDetected => "overwhelm_detected",
            EventData::DegradedMode => "degraded_mode",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_system: String,
    pub target_systems: Vec<String>,
    pub priority: EventPriority,
    pub data: EventData,
    #[serde(default)]
    pub routing: RoutingMetadata,
}

impl Event {
    pub fn new(source_system: impl Into<String>, data: EventData, priority: EventPriority) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_system: source_system.into(),
            target_systems: Vec::new(),
            priority,
            data,
            routing: RoutingMetadata::default(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.data.type_name()
    }
}

// ---------------------------------------------------------------------------
// Attention Sample
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionSample {
    pub user_id: String,
    pub typing_cadence: f64,
    pub session_duration_minutes: f64,
    pub task_switching_rate: f64,
    #[serde(default)]
    pub explicit_state: Option<AttentionState>,
    pub derived_attention_state: AttentionState,
    pub derived_energy_level: EnergyLevel,
    pub timestamp: DateTime<Utc>,
}

/// Recent-activity summary returned by `get_recent_activity_summary` (§4.3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecentActivitySummary {
    pub decisions: Vec<Decision>,
    pub progress: Vec<ProgressEntry>,
    pub patterns: Vec<SystemPattern>,
}

/// Extra, free-form metadata on a descriptor that the core preserves but
/// never interprets (§6.4: "extra fields are preserved but ignored").
pub type ExtraFields = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_dag_allows_forward_path() {
        assert!(ProgressStatus::Todo.can_transition_to(ProgressStatus::InProgress));
        assert!(ProgressStatus::InProgress.can_transition_to(ProgressStatus::Done));
    }

    #[test]
    fn progress_dag_rejects_reopen_from_done() {
        assert!(!ProgressStatus::Done.can_transition_to(ProgressStatus::InProgress));
        assert!(!ProgressStatus::Cancelled.can_transition_to(ProgressStatus::Todo));
    }

    #[test]
    fn progress_dag_any_state_can_block_or_cancel() {
        assert!(ProgressStatus::Todo.can_transition_to(ProgressStatus::Blocked));
        assert!(ProgressStatus::InProgress.can_transition_to(ProgressStatus::Cancelled));
        assert!(ProgressStatus::Blocked.can_transition_to(ProgressStatus::Cancelled));
    }

    #[test]
    fn apply_transition_sets_completed_at_on_done() {
        let mut entry = ProgressEntry {
            progress_id: 1,
            workspace_id: "/tmp/proj".into(),
            status: ProgressStatus::InProgress,
            description: "write tests".into(),
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            complexity_score: None,
            estimated_minutes: None,
            energy_required: None,
            cognitive_load: None,
            break_points: Vec::new(),
        };
        entry.apply_transition(ProgressStatus::Done, None).unwrap();
        assert!(entry.completed_at.is_some());
        assert_eq!(entry.status, ProgressStatus::Done);
    }

    #[test]
    fn apply_transition_rejects_illegal_and_leaves_state_unchanged() {
        let mut entry = ProgressEntry {
            progress_id: 1,
            workspace_id: "/tmp/proj".into(),
            status: ProgressStatus::Done,
            description: "write tests".into(),
            parent_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: Some(Utc::now()),
            complexity_score: None,
            estimated_minutes: None,
            energy_required: None,
            cognitive_load: None,
            break_points: Vec::new(),
        };
        let err = entry
            .apply_transition(ProgressStatus::InProgress, Some("reopen".into()))
            .unwrap_err();
        assert!(matches!(err, CoreError::IllegalTransition { .. }));
        assert_eq!(entry.status, ProgressStatus::Done);
    }

    #[test]
    fn event_authority_matrix() {
        let e = EventData::TaskCreated { progress_id: 1 };
        assert_eq!(e.required_source(), Some("task-planning"));
        let e = EventData::ToolInvoked {
            tool: "lookup".into(),
            backend_name: "docs".into(),
        };
        assert_eq!(e.required_source(), None);
    }
}
