//! HTTP route handlers

use axum::{
    extract::{Extension, Json},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::channel::{Channel, ChannelId, LeaseOutcome};
use crate::error::Error;
use crate::server::AppState;

/// Body of create and renew requests
#[derive(Debug, Deserialize)]
pub struct ChannelRequest {
    pub id: String,
}

/// Public view of one lease
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelView {
    pub id: String,
    pub index: u64,
}

impl From<&Channel> for ChannelView {
    fn from(channel: &Channel) -> Self {
        Self {
            id: channel.id.to_string(),
            index: channel.index,
        }
    }
}

/// Every response carries the full list after the operation
#[derive(Debug, Serialize, Deserialize)]
pub struct ChannelListResponse {
    pub channels: Vec<ChannelView>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": message.into(),
        })),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        error_response(status, self.to_string())
    }
}

async fn channel_list(state: &AppState) -> Response {
    match state.coordinator.list().await {
        Ok(channels) => Json(ChannelListResponse {
            channels: channels.iter().map(ChannelView::from).collect(),
        })
        .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to list channels");
            e.into_response()
        }
    }
}

/// Create or renew a lease
#[instrument(skip(state, payload), fields(channel_id = %payload.id))]
pub async fn create_channel(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<ChannelRequest>,
) -> Response {
    let id = match ChannelId::parse(payload.id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match state.coordinator.acquire(&id).await {
        Ok((channel, LeaseOutcome::Created)) => {
            info!(index = channel.index, "Channel created");
        }
        Ok((channel, LeaseOutcome::Renewed)) => {
            info!(index = channel.index, "Channel already leased, renewed");
        }
        Err(e) => {
            error!(error = %e, "Failed to create channel");
            return e.into_response();
        }
    }

    channel_list(&state).await
}

/// Renew an existing lease
#[instrument(skip(state, payload), fields(channel_id = %payload.id))]
pub async fn renew_channel(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<ChannelRequest>,
) -> Response {
    let id = match ChannelId::parse(payload.id) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    match state.coordinator.renew(&id).await {
        Ok(Some(_)) => channel_list(&state).await,
        Ok(None) => {
            warn!("Channel not found");
            Error::NotFound(format!("Channel '{}' has no lease", id)).into_response()
        }
        Err(e) => {
            error!(error = %e, "Failed to renew channel");
            e.into_response()
        }
    }
}

/// List stored leases
#[instrument(skip(state))]
pub async fn list_channels(Extension(state): Extension<Arc<AppState>>) -> Response {
    channel_list(&state).await
}
