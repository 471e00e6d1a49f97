//! Shared types for the rawi workspace: conversation content blocks,
//! provider stream events, configuration, and the workspace error enum.

pub mod config;
pub mod content;
pub mod error;
pub mod stream;
