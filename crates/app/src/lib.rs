#![deny(unsafe_code)]

/// Line-oriented terminal front-end.
pub mod app;
/// Exchange orchestration and stream reconciliation over the conversation store.
pub mod chat;
/// Settings persistence.
pub mod settings;
