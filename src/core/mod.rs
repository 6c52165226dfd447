//! Core logic — types, configuration, naming, errors, persistence, settings.

pub mod config;
pub mod error;
pub mod naming;
pub mod settings;
pub mod store;
pub mod types;
