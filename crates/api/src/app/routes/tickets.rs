use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::info;

use crate::app::{dto, errors, errors::ApiError, services::AppServices};

/// POST /tickets-confirmation
///
/// For each ticket: append it to the tickets-to-print sheet and issue a
/// receipt. Replies once every task is accepted; a full queue holds the
/// request open.
pub async fn confirm_tickets(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::TicketsConfirmationRequest>, JsonRejection>,
) -> Response {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(rejection.status(), "invalid_request", rejection.body_text());
        }
    };

    match submit(services, body).await {
        Ok(count) => {
            info!(tickets = count, "tickets confirmed");
            StatusCode::OK.into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn submit(
    services: Arc<AppServices>,
    body: dto::TicketsConfirmationRequest,
) -> Result<usize, ApiError> {
    let tickets = body.ticket_ids()?;
    let count = tickets.len();

    // Bounded-queue sends block; keep them off the async workers.
    tokio::task::spawn_blocking(move || services.confirm_tickets(&tickets))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(count)
}
