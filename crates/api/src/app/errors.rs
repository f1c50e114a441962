use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use courier_core::CoreError;
use courier_infra::DispatchError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid ticket: {0}")]
    InvalidTicket(#[from] CoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.to_string();
        match self {
            ApiError::InvalidTicket(_) => json_error(StatusCode::BAD_REQUEST, "invalid_ticket", message),
            ApiError::Dispatch(e) => dispatch_error_to_response(e),
            ApiError::Internal(_) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
            }
        }
    }
}

pub fn dispatch_error_to_response(err: DispatchError) -> Response {
    let message = err.to_string();
    match err {
        DispatchError::NoRoute(_) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "no_route", message),
        DispatchError::ChannelClosed(_) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "channel_closed", message)
        }
        DispatchError::Encoding(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "encoding_error", message)
        }
        DispatchError::Publish { .. } => json_error(StatusCode::BAD_GATEWAY, "publish_error", message),
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
