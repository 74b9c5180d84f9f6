//! Administrator decisions on signed instance requests.
//!
//! Approval only verifies the token inline. Provisioning can take minutes,
//! so it runs in a background task tracked by [`AppState`] and the outcome is
//! reported through logs. Shutdown waits for pending provisioning.

use crate::{error::ApiResult, state::AppState};
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use cloud_orchestrator::InstanceRequest;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/requests/approve", post(approve_request))
        .route("/api/v1/requests/deny", post(deny_request))
}

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct RequestSummary {
    pub decision: &'static str,
    pub owner: String,
    pub hostname: String,
    pub kind: String,
    pub template_id: String,
}

impl RequestSummary {
    fn new(decision: &'static str, request: &InstanceRequest) -> Self {
        Self {
            decision,
            owner: request.owner.clone(),
            hostname: request.hostname.clone(),
            kind: request.kind.to_string(),
            template_id: request.detail.template_id.clone(),
        }
    }
}

async fn approve_request(
    State(state): State<AppState>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<(StatusCode, Json<RequestSummary>)> {
    let request = state.manager.signer().verify(&body.token)?;
    let summary = RequestSummary::new("approved", &request);

    let manager = state.manager.clone();
    state.spawn_provisioning(async move {
        match manager.approve_request(&body.token).await {
            Ok(provisioned) => info!(
                fqdn = %provisioned.instance.fqdn,
                node = %provisioned.instance.node,
                "approved instance provisioned"
            ),
            Err(e) => error!(
                owner = %request.owner,
                hostname = %request.hostname,
                "provisioning approved instance failed: {e}"
            ),
        }
    });

    Ok((StatusCode::ACCEPTED, Json(summary)))
}

async fn deny_request(
    State(state): State<AppState>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<RequestSummary>> {
    let request = state.manager.deny_request(&body.token)?;
    Ok(Json(RequestSummary::new("denied", &request)))
}
