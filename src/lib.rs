// ABOUTME: Library root for feedback-sync
// ABOUTME: Exposes config, Query API client, sync engine and shared utilities

pub mod config;
pub mod remote;
pub mod sync;
pub mod utils;
