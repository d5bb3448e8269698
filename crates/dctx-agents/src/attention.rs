//! The Attention Engine (§4.4): infers the user's attention/energy state
//! from behavioral samples, scores task suitability against that state,
//! and enforces the break policy the broker consults before accepting a
//! new invocation.
//!
//! Grounded on the finite-enum + transition-history pattern from
//! `state_machine.rs`'s `AgentStateMachine` (`current`/`history: Vec<(from,
//! to, at)>`), generalized from agent-process lifecycle transitions to
//! per-user attention/energy classification history.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use dctx_bridge::event_bus::EventBus;
use dctx_core::config::AttentionConfig;
use dctx_core::types::{
    AttentionSample, AttentionState, EnergyLevel, EnergyRequired, Event, EventData, EventPriority,
};

/// Source system attributed to engine-originated events; carries no
/// authority-matrix constraint (§4.5), since none of this engine's
/// event types appear in the authority matrix.
const SOURCE_SYSTEM: &str = "attention-engine";

/// A task's attributes relevant to suitability scoring (§4.4), mirroring
/// the fields of `dctx_core::types::ProgressEntry` this engine reads.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub complexity_score: f64,
    pub estimated_minutes: u32,
    pub energy_required: EnergyRequired,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CurrentState {
    pub attention_state: AttentionState,
    pub energy_level: EnergyLevel,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSuitability {
    pub suitability_score: f64,
    pub energy_match: f64,
    pub cognitive_load: f64,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakUrgency {
    None,
    Recommended,
    StronglyRecommended,
    Mandatory,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakRecommendation {
    pub urgency: BreakUrgency,
    pub work_duration_minutes: u32,
    pub message: String,
}

struct UserState {
    attention_state: AttentionState,
    energy_level: EnergyLevel,
    explicit_state: Option<AttentionState>,
    since: DateTime<Utc>,
    history: Vec<(AttentionState, DateTime<Utc>)>,
}

impl UserState {
    fn fresh(attention_state: AttentionState, energy_level: EnergyLevel, at: DateTime<Utc>) -> Self {
        Self {
            attention_state,
            energy_level,
            explicit_state: None,
            since: at,
            history: Vec::new(),
        }
    }
}

/// Per-user attention/energy classification, scoring, and break policy.
pub struct AttentionEngine {
    config: AttentionConfig,
    states: DashMap<String, UserState>,
    event_bus: EventBus,
}

impl AttentionEngine {
    pub fn new(config: AttentionConfig, event_bus: EventBus) -> Self {
        Self {
            config,
            states: DashMap::new(),
            event_bus,
        }
    }

    /// §4.4 classification rules, tunable via `AttentionConfig`.
    /// `typing_cadence` and `task_switching_rate` are normalized to
    /// `[0,1]`; `session_duration_minutes` is wall-clock minutes.
    fn classify(&self, typing_cadence: f64, session_duration_minutes: f64, task_switching_rate: f64) -> (AttentionState, EnergyLevel) {
        let cfg = &self.config;
        let fast_cadence = typing_cadence >= cfg.hyperfocus_cadence_threshold;
        let high_switching = task_switching_rate > cfg.overwhelm_switch_rate_threshold;

        let attention = if high_switching && !fast_cadence {
            // Erratic switching without the fast, purposeful typing that
            // marks active exploration — thrashing, not scattered work.
            AttentionState::Overwhelmed
        } else if high_switching && fast_cadence {
            AttentionState::Scattered
        } else if session_duration_minutes > 45.0 && task_switching_rate < 0.1 {
            AttentionState::Hyperfocused
        } else if task_switching_rate > cfg.overwhelm_switch_rate_threshold * 0.6 {
            AttentionState::Transitioning
        } else {
            AttentionState::Focused
        };

        let energy = match attention {
            AttentionState::Hyperfocused => EnergyLevel::Hyperfocus,
            AttentionState::Overwhelmed => EnergyLevel::VeryLow,
            AttentionState::Scattered => EnergyLevel::Low,
            AttentionState::Transitioning => EnergyLevel::Medium,
            AttentionState::Focused if fast_cadence => EnergyLevel::High,
            AttentionState::Focused => EnergyLevel::Medium,
        };

        (attention, energy)
    }

    fn emit(&self, data: EventData, priority: EventPriority) {
        if let Err(e) = self.event_bus.publish(Event::new(SOURCE_SYSTEM, data, priority)) {
            tracing::warn!(error = %e, "attention engine event rejected by bus");
        }
    }

    /// Ingest one behavioral sample, updating the user's classification
    /// and history, and emitting `hyperfocus_detected`/`overwhelm_detected`
    /// on a state change into those states.
    pub fn report_sample(
        &self,
        user_id: &str,
        typing_cadence: f64,
        session_duration_minutes: f64,
        task_switching_rate: f64,
    ) -> AttentionSample {
        let (inferred_attention, inferred_energy) =
            self.classify(typing_cadence, session_duration_minutes, task_switching_rate);
        let now = Utc::now();

        let mut entry = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::fresh(inferred_attention, inferred_energy, now));

        let effective = entry.explicit_state.unwrap_or(inferred_attention);
        if effective != entry.attention_state {
            entry.history.push((entry.attention_state, now));
            entry.attention_state = effective;
            entry.since = now;
            match effective {
                AttentionState::Hyperfocused => self.emit(EventData::HyperfocusDetected, EventPriority::Medium),
                AttentionState::Overwhelmed => self.emit(EventData::OverwhelmDetected, EventPriority::High),
                _ => {}
            }
        }
        entry.energy_level = inferred_energy;

        AttentionSample {
            user_id: user_id.to_string(),
            typing_cadence,
            session_duration_minutes,
            task_switching_rate,
            explicit_state: entry.explicit_state,
            derived_attention_state: entry.attention_state,
            derived_energy_level: entry.energy_level,
            timestamp: now,
        }
    }

    /// Record (or clear) an explicit user-asserted state, which overrides
    /// behavioral inference until cleared (§4.4).
    pub fn set_explicit_state(&self, user_id: &str, state: Option<AttentionState>) {
        let now = Utc::now();
        let mut entry = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| UserState::fresh(AttentionState::Focused, EnergyLevel::Medium, now));
        entry.explicit_state = state;
        if let Some(s) = state {
            if s != entry.attention_state {
                entry.history.push((entry.attention_state, now));
                entry.attention_state = s;
                entry.since = now;
            }
        }
    }

    pub fn current_state(&self, user_id: &str) -> CurrentState {
        match self.states.get(user_id) {
            Some(s) => CurrentState {
                attention_state: s.attention_state,
                energy_level: s.energy_level,
                since: s.since,
            },
            None => CurrentState {
                attention_state: AttentionState::Focused,
                energy_level: EnergyLevel::Medium,
                since: Utc::now(),
            },
        }
    }

    /// §4.4 task-assessment scoring.
    pub fn assess_task(&self, user_id: &str, task: &TaskSummary) -> TaskSuitability {
        let state = self.current_state(user_id);

        let energy_diff = (state.energy_level.ordinal() - task.energy_required.ordinal()).abs();
        let energy_match = match energy_diff {
            0 => 1.0,
            1 => 0.5,
            _ => 0.0,
        };

        // Three-valued task-type factor, grounded on the same
        // `EnergyRequired` classification the task already carries
        // rather than inventing a separate task-type taxonomy.
        let task_type_factor = match task.energy_required {
            EnergyRequired::Low => 0.1,
            EnergyRequired::Medium => 0.25,
            EnergyRequired::High => 0.4,
        };
        let cognitive_load = (0.4 * task.complexity_score
            + 0.3 * (task.estimated_minutes as f64 / 60.0).min(1.0)
            + task_type_factor)
            .clamp(0.0, 1.0);

        let mut suitability = 0.6 * energy_match + 0.4 * (1.0 - cognitive_load);
        let mut recommendations = Vec::new();

        match state.attention_state {
            AttentionState::Scattered if task.complexity_score > 0.6 => {
                suitability *= 0.5;
                recommendations.push(
                    "High-complexity task while scattered — consider a smaller task first.".into(),
                );
            }
            AttentionState::Hyperfocused if task.complexity_score > 0.6 => {
                suitability = (suitability * 1.3).min(1.0);
                recommendations.push("Hyperfocus detected — a good window for this task.".into());
            }
            AttentionState::Overwhelmed => {
                suitability *= 0.3;
                recommendations.push("Overwhelmed state — a break before this task is recommended.".into());
            }
            _ => {}
        }
        if energy_match < 1.0 {
            recommendations.push(format!(
                "Task requires {:?} energy; current level is {:?}.",
                task.energy_required, state.energy_level
            ));
        }

        TaskSuitability {
            suitability_score: suitability.clamp(0.0, 1.0),
            energy_match,
            cognitive_load,
            recommendations,
        }
    }

    /// §4.4 break policy: recommended at `break_soft_minutes`, strongly
    /// recommended at `break_firm_minutes`, mandatory at
    /// `break_hard_minutes`. Emits the corresponding event at each
    /// non-`None` urgency.
    pub fn recommend_break(&self, work_duration_minutes: u32) -> BreakRecommendation {
        let cfg = &self.config;
        let (urgency, message) = if work_duration_minutes >= cfg.break_hard_minutes {
            (
                BreakUrgency::Mandatory,
                "You've been at this for over 90 minutes — time for a real break.".to_string(),
            )
        } else if work_duration_minutes >= cfg.break_firm_minutes {
            (
                BreakUrgency::StronglyRecommended,
                "An hour in without a break — strongly consider stepping away.".to_string(),
            )
        } else if work_duration_minutes >= cfg.break_soft_minutes {
            (BreakUrgency::Recommended, "25 minutes in — a short break would help.".to_string())
        } else {
            (BreakUrgency::None, "Still fresh.".to_string())
        };

        match urgency {
            BreakUrgency::Mandatory => self.emit(EventData::BreakRequired, EventPriority::Critical),
            BreakUrgency::StronglyRecommended | BreakUrgency::Recommended => {
                self.emit(EventData::BreakRecommended, EventPriority::Medium)
            }
            BreakUrgency::None => {}
        }

        BreakRecommendation {
            urgency,
            work_duration_minutes,
            message,
        }
    }

    /// Transition-history snapshot for a user, exposed for diagnostics
    /// and tests — mirrors `AgentStateMachine::history`.
    pub fn history(&self, user_id: &str) -> Vec<(AttentionState, DateTime<Utc>)> {
        self.states
            .get(user_id)
            .map(|s| s.history.clone())
            .unwrap_or_default()
    }
}
