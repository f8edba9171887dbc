//! Mission Engine service

use serde::{Deserialize, Serialize};
use tracing::info;

use loyalty_core::mission::{MissionCompletion, ProgressPayload};
use loyalty_core::{LoyaltyError, LoyaltyResult, Mission, UserMissionProgress};

use super::{require_user, LoyaltyServices};
use crate::metrics::ServerMetrics;
use crate::storage::repository::{StatCounter, StatEntity};

/// Result of `record_progress`; `completion` is set when the update
/// reached the final step and completed the mission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressOutcome {
    pub progress: UserMissionProgress,
    pub completion: Option<MissionCompletion>,
}

impl LoyaltyServices {
    /// Active missions inside their date window
    pub async fn list_active_missions(&self) -> LoyaltyResult<Vec<Mission>> {
        self.storage().missions.list_active(self.now()).await
    }

    pub async fn start_mission(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> LoyaltyResult<UserMissionProgress> {
        require_user(user_id)?;
        let progress = self
            .storage()
            .missions
            .start(user_id, mission_id, self.now())
            .await
            .inspect_err(|e| self.count_limit_rejection(e))?;

        ServerMetrics::incr(&self.metrics().missions_started);
        self.record_stat(StatEntity::Mission, mission_id, StatCounter::Starts)
            .await;
        info!(user_id, mission_id, completion_count = progress.completion_count, "mission in progress");
        Ok(progress)
    }

    /// Merge payload keys and advance steps; the final step completes the
    /// mission in the same call
    pub async fn record_progress(
        &self,
        user_id: &str,
        mission_id: i64,
        step_delta: i32,
        patch: ProgressPayload,
    ) -> LoyaltyResult<ProgressOutcome> {
        require_user(user_id)?;
        let update = self
            .storage()
            .missions
            .record_progress(user_id, mission_id, step_delta, &patch, self.now())
            .await?;

        if !update.reached_final_step {
            return Ok(ProgressOutcome {
                progress: update.progress,
                completion: None,
            });
        }

        let completion = self.complete_mission(user_id, mission_id).await?;
        Ok(ProgressOutcome {
            progress: completion.progress.clone(),
            completion: Some(completion),
        })
    }

    /// Global ceiling, per-user cap, status flip and reward as one store unit
    pub async fn complete_mission(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> LoyaltyResult<MissionCompletion> {
        require_user(user_id)?;
        let completion = self
            .storage()
            .missions
            .complete(user_id, mission_id, self.now())
            .await
            .inspect_err(|e| self.count_limit_rejection(e))?;

        let metrics = self.metrics();
        ServerMetrics::incr(&metrics.missions_completed);
        ServerMetrics::add_points(&metrics.points_earned, completion.points_awarded);
        self.record_stat(StatEntity::Mission, mission_id, StatCounter::Completions)
            .await;
        info!(
            user_id,
            mission_id,
            points = completion.points_awarded,
            global_completions = completion.global_completions,
            "mission completed"
        );
        Ok(completion)
    }

    /// `MissionNotFound` for unknown missions; `None` when the user has no row
    pub async fn mission_progress(
        &self,
        user_id: &str,
        mission_id: i64,
    ) -> LoyaltyResult<Option<UserMissionProgress>> {
        require_user(user_id)?;
        let missions = &self.storage().missions;
        if missions.get_mission(mission_id).await?.is_none() {
            return Err(LoyaltyError::MissionNotFound(mission_id));
        }
        self.record_stat(StatEntity::Mission, mission_id, StatCounter::Views)
            .await;
        missions.get_progress(user_id, mission_id).await
    }

    pub async fn list_progress(&self, user_id: &str) -> LoyaltyResult<Vec<UserMissionProgress>> {
        require_user(user_id)?;
        self.storage().missions.list_progress(user_id).await
    }

    fn count_limit_rejection(&self, err: &LoyaltyError) {
        if matches!(err, LoyaltyError::MissionLimitReached(_)) {
            ServerMetrics::incr(&self.metrics().mission_limit_rejections);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use chrono::{Duration, Utc};
    use loyalty_core::{ManualClock, MissionStatus, ProgressValue, RulesConfig};
    use std::sync::Arc;

    fn mission(id: i64) -> Mission {
        Mission {
            id,
            mission_type: "scan_receipts".into(),
            title: "Scan receipts".into(),
            is_active: true,
            start_date: None,
            end_date: None,
            total_limit: None,
            max_completions_per_user: None,
            total_steps: 3,
            points_reward: 500,
            bonus_reward: Some(100),
            current_completions: 0,
        }
    }

    async fn services_with(missions: &[Mission]) -> (LoyaltyServices, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let svc = LoyaltyServices::new(
            MemoryStore::new().storage_manager(),
            clock.clone(),
            RulesConfig::default(),
            ServerMetrics::new(),
        )
        .unwrap();
        for m in missions {
            svc.storage().missions.upsert_mission(m).await.unwrap();
        }
        (svc, clock)
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_in_progress() {
        let (svc, _) = services_with(&[mission(1)]).await;
        let first = svc.start_mission("u1", 1).await.unwrap();
        svc.record_progress("u1", 1, 1, ProgressPayload::new()).await.unwrap();
        let again = svc.start_mission("u1", 1).await.unwrap();

        assert_eq!(first.status, MissionStatus::InProgress);
        assert_eq!(again.current_step, 1);
    }

    #[tokio::test]
    async fn test_final_step_completes_and_credits() {
        let (svc, _) = services_with(&[mission(1)]).await;
        svc.start_mission("u1", 1).await.unwrap();

        let mut patch = ProgressPayload::new();
        patch.insert("receipts".into(), ProgressValue::Int(2));
        let partial = svc.record_progress("u1", 1, 2, patch).await.unwrap();
        assert!(partial.completion.is_none());
        assert_eq!(partial.progress.progress.get("receipts"), Some(&ProgressValue::Int(2)));

        let done = svc.record_progress("u1", 1, 5, ProgressPayload::new()).await.unwrap();
        let completion = done.completion.unwrap();
        assert_eq!(completion.points_awarded, 600);
        assert_eq!(done.progress.status, MissionStatus::Completed);
        assert_eq!(done.progress.current_step, 3);
        assert_eq!(svc.balance("u1").await.unwrap(), 600);
    }

    #[tokio::test]
    async fn test_complete_requires_in_progress() {
        let (svc, _) = services_with(&[mission(1)]).await;
        let err = svc.complete_mission("u1", 1).await.unwrap_err();
        assert_eq!(err, LoyaltyError::MissionNotInProgress(1));

        svc.start_mission("u1", 1).await.unwrap();
        svc.complete_mission("u1", 1).await.unwrap();
        let err = svc.complete_mission("u1", 1).await.unwrap_err();
        assert_eq!(err, LoyaltyError::MissionNotInProgress(1));
    }

    #[tokio::test]
    async fn test_per_user_cap() {
        let capped = Mission {
            max_completions_per_user: Some(1),
            ..mission(1)
        };
        let (svc, _) = services_with(&[capped]).await;
        svc.start_mission("u1", 1).await.unwrap();
        svc.complete_mission("u1", 1).await.unwrap();

        let err = svc.start_mission("u1", 1).await.unwrap_err();
        assert_eq!(err, LoyaltyError::MaxCompletionsReached(1));
    }

    #[tokio::test]
    async fn test_restart_resets_steps() {
        let (svc, _) = services_with(&[mission(1)]).await;
        svc.start_mission("u1", 1).await.unwrap();
        svc.record_progress("u1", 1, 3, ProgressPayload::new()).await.unwrap();

        let restarted = svc.start_mission("u1", 1).await.unwrap();
        assert_eq!(restarted.status, MissionStatus::InProgress);
        assert_eq!(restarted.current_step, 0);
        assert_eq!(restarted.completion_count, 1);
    }

    #[tokio::test]
    async fn test_global_limit_is_exact() {
        let limited = Mission {
            total_limit: Some(1),
            ..mission(1)
        };
        let (svc, _) = services_with(&[limited]).await;
        svc.start_mission("u1", 1).await.unwrap();
        svc.start_mission("u2", 1).await.unwrap();

        svc.complete_mission("u1", 1).await.unwrap();
        let err = svc.complete_mission("u2", 1).await.unwrap_err();
        assert_eq!(err, LoyaltyError::MissionLimitReached(1));

        let err = svc.start_mission("u3", 1).await.unwrap_err();
        assert_eq!(err, LoyaltyError::MissionLimitReached(1));
        assert_eq!(
            svc.metrics()
                .mission_limit_rejections
                .load(std::sync::atomic::Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_date_window() {
        let now = Utc::now();
        let windowed = Mission {
            start_date: Some(now + Duration::days(1)),
            end_date: Some(now + Duration::days(2)),
            ..mission(1)
        };
        let (svc, clock) = services_with(&[windowed]).await;
        clock.set(now);

        assert_eq!(
            svc.start_mission("u1", 1).await.unwrap_err(),
            LoyaltyError::MissionInactive(1)
        );
        assert!(svc.list_active_missions().await.unwrap().is_empty());

        clock.advance(Duration::hours(36));
        svc.start_mission("u1", 1).await.unwrap();
        assert_eq!(svc.list_active_missions().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_mission() {
        let (svc, _) = services_with(&[]).await;
        assert_eq!(
            svc.start_mission("u1", 42).await.unwrap_err(),
            LoyaltyError::MissionNotFound(42)
        );
        assert_eq!(
            svc.mission_progress("u1", 42).await.unwrap_err(),
            LoyaltyError::MissionNotFound(42)
        );
    }

    #[tokio::test]
    async fn test_negative_step_delta_rejected() {
        let (svc, _) = services_with(&[mission(1)]).await;
        svc.start_mission("u1", 1).await.unwrap();
        let err = svc
            .record_progress("u1", 1, -1, ProgressPayload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidRequest(_)));
    }
}
