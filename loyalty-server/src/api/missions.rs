//! MissionService: mission engine endpoints
//!
//! Endpoints:
//! - POST /loyalty.MissionService/ListMissions
//! - POST /loyalty.MissionService/StartMission
//! - POST /loyalty.MissionService/RecordProgress
//! - POST /loyalty.MissionService/CompleteMission
//! - POST /loyalty.MissionService/GetMissionProgress

use axum::{extract::rejection::JsonRejection, extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use loyalty_core::mission::MissionCompletion;
use loyalty_core::{Mission, ProgressPayload, UserMissionProgress};

use super::{body, ok, ApiResult, ApiState};
use crate::services::ProgressOutcome;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/loyalty.MissionService/ListMissions", post(list_missions))
        .route("/loyalty.MissionService/StartMission", post(start_mission))
        .route("/loyalty.MissionService/RecordProgress", post(record_progress))
        .route("/loyalty.MissionService/CompleteMission", post(complete_mission))
        .route("/loyalty.MissionService/GetMissionProgress", post(get_mission_progress))
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct MissionRequest {
    pub user_id: String,
    pub mission_id: i64,
}

#[derive(Deserialize)]
pub struct RecordProgressRequest {
    pub user_id: String,
    pub mission_id: i64,
    #[serde(default)]
    pub step_delta: i32,
    /// Keys merged into the stored progress map
    #[serde(default)]
    pub progress: ProgressPayload,
}

#[derive(Serialize)]
pub struct ListMissionsResponse {
    pub missions: Vec<Mission>,
}

/// Progress is nested: its own `status` would clash with the envelope's
#[derive(Serialize)]
pub struct StartMissionResponse {
    pub progress: UserMissionProgress,
}

#[derive(Serialize)]
pub struct MissionProgressResponse {
    /// `null` until the user starts the mission
    pub progress: Option<UserMissionProgress>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Body is ignored; an empty `{}` is accepted
async fn list_missions(State(state): State<ApiState>) -> ApiResult<ListMissionsResponse> {
    let missions = state.services.list_active_missions().await?;
    Ok(ok(ListMissionsResponse { missions }))
}

async fn start_mission(
    State(state): State<ApiState>,
    payload: Result<Json<MissionRequest>, JsonRejection>,
) -> ApiResult<StartMissionResponse> {
    let req = body(payload)?;
    let progress = state.services.start_mission(&req.user_id, req.mission_id).await?;
    Ok(ok(StartMissionResponse { progress }))
}

async fn record_progress(
    State(state): State<ApiState>,
    payload: Result<Json<RecordProgressRequest>, JsonRejection>,
) -> ApiResult<ProgressOutcome> {
    let req = body(payload)?;
    let outcome = state
        .services
        .record_progress(&req.user_id, req.mission_id, req.step_delta, req.progress)
        .await?;
    Ok(ok(outcome))
}

async fn complete_mission(
    State(state): State<ApiState>,
    payload: Result<Json<MissionRequest>, JsonRejection>,
) -> ApiResult<MissionCompletion> {
    let req = body(payload)?;
    let completion = state
        .services
        .complete_mission(&req.user_id, req.mission_id)
        .await?;
    Ok(ok(completion))
}

async fn get_mission_progress(
    State(state): State<ApiState>,
    payload: Result<Json<MissionRequest>, JsonRejection>,
) -> ApiResult<MissionProgressResponse> {
    let req = body(payload)?;
    let progress = state
        .services
        .mission_progress(&req.user_id, req.mission_id)
        .await?;
    Ok(ok(MissionProgressResponse { progress }))
}
