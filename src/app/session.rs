//! AN-041: Editor session — open, edit, save, run, stop, back.
//!
//! The session lives on the UI thread. It owns the console end of the
//! output queue; the runner and its workers only hold the sink end.

use crate::core::error::{AncileError, Result};
use crate::core::store::Store;
use crate::core::types::SinkEvent;
use crate::provision::Provisioner;
use crate::runner::sink::{self, Console};
use crate::runner::{RunHandle, Runner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Text shown for a card that has never been saved.
pub fn default_text(title: &str, description: &str) -> String {
    format!("# {}\n\n{}", title, description)
}

pub struct EditorSession {
    runner: Runner,
    console: Console,
    provisioner: Arc<Provisioner>,
    scripts_dir: PathBuf,
    title: Option<String>,
    text: String,
}

impl EditorSession {
    pub fn new(provisioner: Arc<Provisioner>, scripts_dir: impl Into<PathBuf>, grace: Duration) -> Self {
        let (sink, console) = sink::channel();
        Self {
            runner: Runner::new(Arc::new(sink), grace),
            console,
            provisioner,
            scripts_dir: scripts_dir.into(),
            title: None,
            text: String::new(),
        }
    }

    /// Load the saved document for `title`, or the default text, and clear
    /// the console. A running process is left alone.
    pub fn open(&mut self, store: &Store, title: &str, description: &str) -> Result<()> {
        let text = match store.load_document(title)? {
            Some(saved) => saved,
            None => default_text(title, description),
        };
        debug!(title = %title, "opened document");
        self.title = Some(title.to_string());
        self.text = text;
        self.console.pump();
        self.console.clear();
        Ok(())
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Persist the editor text, trimmed, under the open title.
    pub fn save(&self, store: &Store) -> Result<()> {
        let title = self.title.as_deref().ok_or(AncileError::NoDocument)?;
        store.save_document(title, self.text.trim())
    }

    /// Run the current (unsaved) editor text in the title's environment.
    pub fn run(&mut self) -> Result<RunHandle> {
        let title = self.title.as_deref().ok_or(AncileError::NoDocument)?;
        if self.runner.is_running() {
            return Err(AncileError::RunActive);
        }
        // Leftovers from an earlier run must not land in the fresh console
        self.console.pump();
        self.console.clear();
        let handle =
            self.runner
                .run_document(title, &self.text, &self.scripts_dir, self.provisioner.clone())?;
        self.console.follow(handle.id());
        Ok(handle)
    }

    pub fn stop(&self) -> bool {
        self.runner.stop()
    }

    /// Leave the editor. Whatever is running keeps running.
    pub fn back(&mut self) {
        self.title = None;
        self.text.clear();
    }

    /// Apply queued output on the calling (UI) thread.
    pub fn pump(&mut self) -> Vec<SinkEvent> {
        self.console.pump()
    }

    pub fn next_event(&mut self, timeout: Duration) -> Option<SinkEvent> {
        self.console.next_event(timeout)
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }
}
