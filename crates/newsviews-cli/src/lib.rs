//! NewsViews CLI - Command-line interface for the NewsViews sync engine
//!
//! This crate provides the CLI application that ties together all NewsViews components.

pub mod config;

pub use config::{Command, Config, CursorAction, ExportFormat};
