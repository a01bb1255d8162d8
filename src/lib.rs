//! Library crate for secguys-monitor: a client for the SecGuys dashboard API
//! with a cancellable scan-status polling core.
pub mod api;
pub mod dashboard;
pub mod error;
pub mod monitor;
pub mod render;
pub mod target;
pub mod types;
pub mod ui;
