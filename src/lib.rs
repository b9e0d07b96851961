//! Rust SDK for the Colab Track REST API and realtime update channel.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client for auth, profile, notifications, tasks, and projects.
//! - `realtime`: websocket session with named-event fan-out and reconnection.
//! - `credentials`: bearer token store shared by both clients.
//! - `retry`: shared retry, backoff, and timeout utilities.

/// REST API client and request/response types.
pub mod api;
/// Bearer token storage.
pub mod credentials;
/// Realtime update client, event registry, and session state machine.
pub mod realtime;
/// Retry and timeout helpers used across the SDK.
pub mod retry;
