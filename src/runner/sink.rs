//! AN-020: Output sinks and the UI-thread console.
//!
//! Drain threads never touch display state. They post [`SinkEvent`]s through
//! a [`ChannelSink`]; the thread that owns the display drains the queue with
//! [`Console::pump`] and applies events in arrival order.

use crate::core::types::{RunStatus, SinkEvent, StreamKind};
use parking_lot::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// Destination for run output. Must be callable from any thread.
pub trait OutputSink: Send + Sync {
    fn send(&self, event: SinkEvent);

    /// Process output, tagged by stream.
    fn write(&self, text: &str, is_error: bool) {
        let kind = if is_error {
            StreamKind::Stderr
        } else {
            StreamKind::Stdout
        };
        self.send(SinkEvent::Output {
            text: text.to_string(),
            kind,
        });
    }

    fn info(&self, text: &str) {
        self.send(SinkEvent::Info(text.to_string()));
    }

    fn error(&self, text: &str) {
        self.send(SinkEvent::Error(text.to_string()));
    }

    fn finished(&self, run_id: u64, status: RunStatus) {
        self.send(SinkEvent::Finished { run_id, status });
    }
}

/// Posts events onto the console queue.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<SinkEvent>,
}

impl OutputSink for ChannelSink {
    fn send(&self, event: SinkEvent) {
        // A closed console just means nobody is watching anymore
        let _ = self.tx.send(event);
    }
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<SinkEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().clone()
    }

    pub fn infos(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Info(t) => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn send(&self, event: SinkEvent) {
        self.events.lock().push(event);
    }
}

/// One applied console entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub text: String,
    pub is_error: bool,
}

/// The display side of the queue. Owned by exactly one thread.
pub struct Console {
    rx: Receiver<SinkEvent>,
    lines: Vec<ConsoleLine>,
    last_status: Option<RunStatus>,
    /// Terminal notifications from any other run are dropped.
    current_run: Option<u64>,
}

/// Create a connected sink/console pair.
pub fn channel() -> (ChannelSink, Console) {
    let (tx, rx) = mpsc::channel();
    (
        ChannelSink { tx },
        Console {
            rx,
            lines: Vec::new(),
            last_status: None,
            current_run: None,
        },
    )
}

/// Render the terminal notification the way the console shows it.
pub fn finished_message(status: &RunStatus) -> String {
    match status {
        RunStatus::Completed { exit_code } => {
            format!("\n=== Process finished (code {}) ===\n", exit_code)
        }
        RunStatus::Stopped => "\n=== Process stopped ===\n".to_string(),
        RunStatus::Failed { reason } => format!("\n=== Run failed: {} ===\n", reason),
        RunStatus::Idle | RunStatus::Running => String::new(),
    }
}

impl Console {
    /// Only show the terminal notification of `run_id` from now on. A run
    /// stopped earlier may still report after the next one has started.
    pub fn follow(&mut self, run_id: u64) {
        self.current_run = Some(run_id);
    }

    fn is_stale(&self, event: &SinkEvent) -> bool {
        match (event, self.current_run) {
            (SinkEvent::Finished { run_id, .. }, Some(current)) => *run_id != current,
            _ => false,
        }
    }

    /// Apply every queued event. Returns them in the order applied.
    pub fn pump(&mut self) -> Vec<SinkEvent> {
        let events: Vec<SinkEvent> = self.rx.try_iter().filter(|e| !self.is_stale(e)).collect();
        for e in &events {
            self.apply(e);
        }
        events
    }

    /// Block up to `timeout` for the next event and apply it.
    pub fn next_event(&mut self, timeout: Duration) -> Option<SinkEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(event) if self.is_stale(&event) => continue,
                Ok(event) => {
                    self.apply(&event);
                    return Some(event);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    return None
                }
            }
        }
    }

    fn apply(&mut self, event: &SinkEvent) {
        let line = match event {
            SinkEvent::Output { text, kind } => ConsoleLine {
                text: text.clone(),
                is_error: kind.is_error(),
            },
            SinkEvent::Info(text) => ConsoleLine {
                text: text.clone(),
                is_error: false,
            },
            SinkEvent::Error(text) => ConsoleLine {
                text: text.clone(),
                is_error: true,
            },
            SinkEvent::Finished { status, .. } => {
                self.last_status = Some(status.clone());
                ConsoleLine {
                    text: finished_message(status),
                    is_error: matches!(status, RunStatus::Failed { .. }),
                }
            }
        };
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[ConsoleLine] {
        &self.lines
    }

    /// Everything shown so far, concatenated.
    pub fn transcript(&self) -> String {
        self.lines.iter().map(|l| l.text.as_str()).collect()
    }

    /// Terminal status of the most recent run seen by this console.
    pub fn last_status(&self) -> Option<&RunStatus> {
        self.last_status.as_ref()
    }

    /// Drop displayed lines. Queued events stay queued.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.last_status = None;
    }
}
