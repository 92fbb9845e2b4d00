//! HTTP API: user directory, history and message persistence.
//!
//! | Method | Path                                 |
//! |--------|--------------------------------------|
//! | GET    | `/chat/users?q=`                     |
//! | GET    | `/chat/history/private/{a}/{b}`      |
//! | GET    | `/chat/history/group/{room}`         |
//! | GET    | `/chat/history/general`              |
//! | POST   | `/chat/messages/private`             |
//! | POST   | `/chat/messages/group`               |
//! | POST   | `/chat/messages/general`             |

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use parley_proto::event::ChatPayload;
use parley_proto::ids::RoomId;
use serde::Deserialize;

use crate::relay::RelayState;
use crate::store::UserRecord;

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
}

/// Routes for the HTTP API.
pub fn routes() -> axum::Router<Arc<RelayState>> {
    axum::Router::new()
        .route("/chat/users", get(search_users))
        .route("/chat/history/private/{a}/{b}", get(private_history))
        .route("/chat/history/group/{room}", get(group_history))
        .route("/chat/history/general", get(general_history))
        .route("/chat/messages/private", post(save_private))
        .route("/chat/messages/group", post(save_group))
        .route("/chat/messages/general", post(save_general))
}

async fn search_users(
    State(state): State<Arc<RelayState>>,
    Query(params): Query<SearchParams>,
) -> Json<Vec<UserRecord>> {
    Json(state.users.search(&params.q).await)
}

async fn private_history(
    State(state): State<Arc<RelayState>>,
    Path((a, b)): Path<(String, String)>,
) -> Json<Vec<ChatPayload>> {
    Json(state.history.private_between(&a, &b).await)
}

async fn group_history(
    State(state): State<Arc<RelayState>>,
    Path(room): Path<u64>,
) -> Json<Vec<ChatPayload>> {
    Json(state.history.group(RoomId::new(room)).await)
}

async fn general_history(State(state): State<Arc<RelayState>>) -> Json<Vec<ChatPayload>> {
    Json(state.history.general().await)
}

async fn save_private(
    State(state): State<Arc<RelayState>>,
    Json(message): Json<ChatPayload>,
) -> ApiResult<StatusCode> {
    if message.recipient_id.is_none() {
        return Err(unprocessable("recipient_id is required"));
    }
    tracing::debug!(correlation_id = %message.correlation_id, "persisting private message");
    state.history.push_private(message).await;
    Ok(StatusCode::CREATED)
}

async fn save_group(
    State(state): State<Arc<RelayState>>,
    Json(message): Json<ChatPayload>,
) -> ApiResult<StatusCode> {
    let Some(room) = message.room.as_ref().and_then(|r| r.parse()) else {
        return Err(unprocessable("a numeric room is required"));
    };
    tracing::debug!(correlation_id = %message.correlation_id, %room, "persisting group message");
    state.history.push_group(room, message).await;
    Ok(StatusCode::CREATED)
}

async fn save_general(
    State(state): State<Arc<RelayState>>,
    Json(message): Json<ChatPayload>,
) -> StatusCode {
    tracing::debug!(correlation_id = %message.correlation_id, "persisting general message");
    state.history.push_general(message).await;
    StatusCode::CREATED
}

fn unprocessable(reason: &str) -> (StatusCode, String) {
    (StatusCode::UNPROCESSABLE_ENTITY, reason.to_string())
}
