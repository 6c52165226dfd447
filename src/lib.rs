//! Ancile — snippet cards with per-script Python environments.
//!
//! Groups of cards live in SQLite. Running a card writes its document to a
//! script, provisions the card's own virtual environment on first use, and
//! streams stdout/stderr back to the UI thread until the process exits or
//! is stopped.

pub mod app;
pub mod cli;
pub mod core;
pub mod logging;
pub mod provision;
pub mod runner;
