//! HTTP API: admin surface for the notification queue.

pub mod app;
pub mod middleware;
