use axum::{Router, routing::post};

pub mod system;
pub mod tickets;

/// Router for the task-producing endpoints.
pub fn router() -> Router {
    Router::new().route("/tickets-confirmation", post(tickets::confirm_tickets))
}
