//! HTTP API: ticket confirmation endpoint and delivery wiring.

pub mod app;
