//! Mission progress state machine
//!
//! ```text
//!  NotStarted ──start──▶ InProgress ──complete──▶ Completed
//!                            ▲                        │
//!                            └────── start (re-entry, per-user cap permitting)
//! ```
//!
//! The functions here decide whether a transition is allowed. The storage
//! layer runs them inside the same atomic unit that writes the result, and
//! owns the race-safe increment of the global completion counter.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LoyaltyError, LoyaltyResult};
use crate::ledger::PointsTransaction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl MissionStatus {
    pub fn as_i16(&self) -> i16 {
        match self {
            MissionStatus::NotStarted => 0,
            MissionStatus::InProgress => 1,
            MissionStatus::Completed => 2,
        }
    }

    pub fn from_i16(v: i16) -> Option<Self> {
        match v {
            0 => Some(MissionStatus::NotStarted),
            1 => Some(MissionStatus::InProgress),
            2 => Some(MissionStatus::Completed),
            _ => None,
        }
    }
}

/// Schema-less primitive stored in a progress payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Opaque per-mission-type progress state
pub type ProgressPayload = BTreeMap<String, ProgressValue>;

/// Mission definition (admin-managed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: i64,
    pub mission_type: String,
    pub title: String,
    pub is_active: bool,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Global cap on completions across all users
    pub total_limit: Option<i64>,
    pub max_completions_per_user: Option<i32>,
    pub total_steps: i32,
    pub points_reward: i64,
    pub bonus_reward: Option<i64>,
    pub current_completions: i64,
}

impl Mission {
    /// Active flag set and `now` inside the optional date window
    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.start_date.is_none_or(|start| now >= start)
            && self.end_date.is_none_or(|end| now <= end)
    }

    pub fn global_limit_reached(&self) -> bool {
        self.total_limit
            .is_some_and(|limit| self.current_completions >= limit)
    }

    pub fn user_cap_reached(&self, completion_count: i32) -> bool {
        self.max_completions_per_user
            .is_some_and(|cap| completion_count >= cap)
    }

    /// `points_reward` plus the optional bonus
    pub fn total_reward(&self) -> i64 {
        self.points_reward.saturating_add(self.bonus_reward.unwrap_or(0))
    }

    /// Mission-level start checks: availability and the global cap
    pub fn ensure_startable(&self, now: DateTime<Utc>) -> LoyaltyResult<()> {
        if !self.is_available_at(now) {
            return Err(LoyaltyError::MissionInactive(self.id));
        }
        if self.global_limit_reached() {
            return Err(LoyaltyError::MissionLimitReached(self.id));
        }
        Ok(())
    }
}

/// Per-user progress row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMissionProgress {
    pub user_id: String,
    pub mission_id: i64,
    pub status: MissionStatus,
    pub progress: ProgressPayload,
    pub current_step: i32,
    pub total_steps: i32,
    pub completion_count: i32,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// What `start` should do with the (possibly missing) progress row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    /// No row yet: insert one in `InProgress`
    Create,
    /// Row in `NotStarted` or `Completed`: move it to `InProgress`
    Restart,
    /// Already `InProgress`: return the row unchanged
    Unchanged,
}

/// Decide the start transition, enforcing every start precondition
pub fn plan_start(
    mission: &Mission,
    existing: Option<&UserMissionProgress>,
    now: DateTime<Utc>,
) -> LoyaltyResult<StartAction> {
    mission.ensure_startable(now)?;

    match existing {
        None => Ok(StartAction::Create),
        Some(row) if row.status == MissionStatus::InProgress => Ok(StartAction::Unchanged),
        Some(row) => {
            if mission.user_cap_reached(row.completion_count) {
                return Err(LoyaltyError::MaxCompletionsReached(mission.id));
            }
            Ok(StartAction::Restart)
        }
    }
}

impl UserMissionProgress {
    pub fn started(user_id: &str, mission: &Mission, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            mission_id: mission.id,
            status: MissionStatus::InProgress,
            progress: ProgressPayload::new(),
            current_step: 0,
            total_steps: mission.total_steps,
            completion_count: 0,
            started_at: now,
            last_activity_at: now,
            completed_at: None,
        }
    }

    /// Re-enter `InProgress`; steps and payload reset for the new attempt
    pub fn restart(&mut self, mission: &Mission, now: DateTime<Utc>) {
        self.status = MissionStatus::InProgress;
        self.progress.clear();
        self.current_step = 0;
        self.total_steps = mission.total_steps;
        self.started_at = now;
        self.last_activity_at = now;
    }

    /// Per-user completion checks; the global ceiling is the store's job
    pub fn ensure_completable(&self, mission: &Mission) -> LoyaltyResult<()> {
        if self.status != MissionStatus::InProgress {
            return Err(LoyaltyError::MissionNotInProgress(mission.id));
        }
        if mission.user_cap_reached(self.completion_count) {
            return Err(LoyaltyError::MaxCompletionsReached(mission.id));
        }
        Ok(())
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = MissionStatus::Completed;
        self.completion_count += 1;
        self.current_step = self.total_steps;
        self.completed_at = Some(now);
        self.last_activity_at = now;
    }

    /// Merge a payload patch and advance steps (capped at `total_steps`).
    /// Returns true once the final step is reached.
    pub fn apply_progress(
        &mut self,
        mission_id: i64,
        step_delta: i32,
        patch: ProgressPayload,
        now: DateTime<Utc>,
    ) -> LoyaltyResult<bool> {
        if self.status != MissionStatus::InProgress {
            return Err(LoyaltyError::MissionNotInProgress(mission_id));
        }
        if step_delta < 0 {
            return Err(LoyaltyError::InvalidRequest(format!(
                "step delta must not be negative, got {}",
                step_delta
            )));
        }

        self.progress.extend(patch);
        self.current_step = self
            .current_step
            .saturating_add(step_delta)
            .min(self.total_steps);
        self.last_activity_at = now;

        Ok(self.total_steps > 0 && self.current_step >= self.total_steps)
    }
}

/// Result of a completion: updated row, ledger credit, new global count
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionCompletion {
    pub progress: UserMissionProgress,
    pub points_awarded: i64,
    pub transaction: Option<PointsTransaction>,
    pub global_completions: i64,
}
