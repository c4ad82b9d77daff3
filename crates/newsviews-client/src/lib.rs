//! NewsViews Client - implementations of the engine's external capabilities
//!
//! This crate provides:
//!
//! - [`sheets`] - Google Sheets v4 values API as the submission source
//! - [`moderation`] - chat-completion image moderation
//! - [`images`] - local filesystem image store
//!
//! # Overview
//!
//! The clients handle authentication, request building, response parsing,
//! and error handling for their respective APIs. Each one implements a trait
//! from [`newsviews_core::capabilities`].

pub mod images;
pub mod moderation;
pub mod sheets;

pub use images::LocalImageStore;
pub use moderation::ChatModerationClient;
pub use sheets::{SheetsAuth, SheetsClient};
