//! HTTP routes
//!
//! One `GET` submission route per challenge kind, `GET /result` for polling
//! and `GET /healthz` for pool stats.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::challenges::{ChallengeKind, ChallengeProfiles, ChallengeQuery, ChallengeRequest, RequestError};
use crate::pool::TabPool;
use crate::solver::Solver;
use crate::store::{ResultStore, StoreError, TaskView};
use crate::task::{round_secs, TaskId, TaskState};

#[derive(Clone)]
pub struct AppState {
    pub solver: Solver,
    pub admission: Arc<AdmissionController>,
    pub store: Arc<ResultStore>,
    pub profiles: Arc<ChallengeProfiles>,
    pub pool: TabPool,
}

pub fn router(state: AppState) -> Router {
    let mut router: Router<AppState> = Router::new()
        .route("/result", get(get_result))
        .route("/healthz", get(healthz));

    for kind in ChallengeKind::ALL {
        router = router.route(
            kind.route(),
            get(
                move |State(state): State<AppState>, Query(query): Query<ChallengeQuery>| {
                    submit(state, kind, query)
                },
            ),
        );
    }

    router.with_state(state)
}

/// Rejected submission
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    InvalidRequest(#[from] RequestError),
    #[error("Server at max capacity")]
    CapacityExceeded,
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for SubmitError {
    fn into_response(self) -> Response {
        let status = match &self {
            SubmitError::InvalidRequest(RequestError::Missing(_)) => StatusCode::BAD_REQUEST,
            SubmitError::InvalidRequest(RequestError::Invalid { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            SubmitError::CapacityExceeded => StatusCode::TOO_MANY_REQUESTS,
            SubmitError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "status": "error", "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

async fn submit(
    state: AppState,
    kind: ChallengeKind,
    query: ChallengeQuery,
) -> Result<Response, SubmitError> {
    let request = ChallengeRequest::from_query(kind, query)?;

    let Some(permit) = state.admission.admit() else {
        warn!(
            "Rejected {} task: server at max capacity ({})",
            kind.display_name(),
            state.admission.capacity()
        );
        return Err(SubmitError::CapacityExceeded);
    };

    let id = TaskId::new();
    let deadline = state.profiles.get(kind).deadline;
    if let Err(e) = state
        .store
        .create_pending(&id, format!("solving {}", kind.key()), deadline)
    {
        error!("Failed to register {} task: {}", kind.display_name(), e);
        return Err(e.into());
    }

    info!("New {} task: {}", kind.display_name(), id);
    state.solver.spawn(id.clone(), request, permit);

    let body = json!({ "task_id": id, "status": "accepted" });
    Ok((StatusCode::ACCEPTED, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
struct ResultQuery {
    id: Option<String>,
}

async fn get_result(State(state): State<AppState>, Query(query): Query<ResultQuery>) -> Response {
    let Some(id) = query.id.filter(|id| !id.trim().is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "Missing task_id" })),
        )
            .into_response();
    };

    match state.store.read(&id) {
        Ok(TaskView::Pending { label, elapsed }) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "process",
                "message": label,
                "elapsed_time": round_secs(elapsed),
            })),
        )
            .into_response(),
        Ok(TaskView::Finished(task)) => terminal_response(task),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "status": "error", "message": "Invalid task_id or expired" })),
        )
            .into_response(),
    }
}

fn terminal_response(task: TaskState) -> Response {
    match task {
        TaskState::Success {
            value,
            elapsed,
            extra,
        } => {
            let mut body = json!({
                "status": "success",
                "elapsed_time": round_secs(elapsed),
                "value": value,
            });
            if let Value::Object(fields) = &mut body {
                fields.extend(extra);
            }
            (StatusCode::OK, Json(body)).into_response()
        }
        TaskState::Error { reason, elapsed } => {
            let value = reason.to_string();
            let mut body = json!({
                "status": "error",
                "elapsed_time": round_secs(elapsed),
                "value": value,
            });
            if let Some(message) = reason.message() {
                body["message"] = Value::from(message);
            }
            (error_status(&value), Json(body)).into_response()
        }
        TaskState::Pending { label } => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "process", "message": label })),
        )
            .into_response(),
    }
}

/// HTTP status for a failure code
fn error_status(value: &str) -> StatusCode {
    if value == "timeout" {
        StatusCode::REQUEST_TIMEOUT
    } else if value.contains("fail") {
        StatusCode::UNPROCESSABLE_ENTITY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

async fn healthz(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "pool_size": state.pool.size(),
        "idle": state.pool.idle(),
        "checked_out": state.pool.checked_out(),
        "in_flight": state.admission.in_flight(),
        "capacity": state.pool.capacity(),
    }))
}
