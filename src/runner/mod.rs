//! AN-022: Process runner — one active run, streamed output, stoppable.
//!
//! The runner owns a single run slot. `start`/`run_document` fill it,
//! `stop` empties it, and the supervising worker empties it when the
//! process exits, but only if the slot still holds that worker's run.

pub mod local;
pub mod sink;

use crate::core::error::{AncileError, Result};
use crate::core::naming::safe_name;
use crate::core::types::{RunStatus, StreamKind};
use crate::provision::Provisioner;
use parking_lot::{Condvar, Mutex};
use sink::OutputSink;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

/// Script file written for a document, e.g. `<scripts>/<safe name>.py`.
pub fn script_path(scripts_dir: &Path, title: &str) -> Result<PathBuf> {
    Ok(scripts_dir.join(format!("{}.py", safe_name(title)?)))
}

/// Status shared between the supervising worker and every handle clone.
struct RunState {
    status: Mutex<RunStatus>,
    done: Condvar,
}

impl RunState {
    fn new() -> Self {
        Self {
            status: Mutex::new(RunStatus::Running),
            done: Condvar::new(),
        }
    }

    fn set(&self, status: RunStatus) {
        *self.status.lock() = status;
        self.done.notify_all();
    }
}

/// Caller-side view of one run.
#[derive(Clone)]
pub struct RunHandle {
    id: u64,
    state: Arc<RunState>,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> RunStatus {
        self.state.status.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.state.status.lock().is_terminal()
    }

    /// Block until the run reaches a terminal state.
    pub fn wait(&self) -> RunStatus {
        let mut status = self.state.status.lock();
        while !status.is_terminal() {
            self.state.done.wait(&mut status);
        }
        status.clone()
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RunStatus> {
        let mut status = self.state.status.lock();
        if !status.is_terminal() {
            self.state.done.wait_while_for(&mut status, |s| !s.is_terminal(), timeout);
        }
        status.is_terminal().then(|| status.clone())
    }
}

struct ActiveRun {
    id: u64,
    cancelled: Arc<AtomicBool>,
    /// `None` while the environment is still being provisioned.
    child: Option<Arc<Mutex<Child>>>,
}

struct Slot {
    active: Option<ActiveRun>,
    last: Option<(u64, RunStatus)>,
}

struct Inner {
    sink: Arc<dyn OutputSink>,
    slot: Mutex<Slot>,
    grace: Duration,
}

impl Inner {
    /// Publish a terminal status: sink first, so anyone woken by the
    /// handle finds the notification already queued.
    fn finish(&self, id: u64, state: &RunState, status: RunStatus) {
        {
            let mut slot = self.slot.lock();
            if slot.active.as_ref().is_some_and(|a| a.id == id) {
                slot.active = None;
            }
            if slot.last.as_ref().is_none_or(|(last_id, _)| *last_id <= id) {
                slot.last = Some((id, status.clone()));
            }
        }
        info!(run_id = id, status = %status, "run finished");
        self.sink.finished(id, status.clone());
        state.set(status);
    }

    fn fail(&self, id: u64, state: &RunState, message: &str) {
        error!(run_id = id, error = %message, "run failed");
        self.sink.error(&format!("{}\n", message));
        self.finish(
            id,
            state,
            RunStatus::Failed {
                reason: message.to_string(),
            },
        );
    }

    /// Record the spawned child, unless the run was stopped meanwhile.
    fn attach(&self, id: u64, child: &Arc<Mutex<Child>>) -> bool {
        let mut slot = self.slot.lock();
        match slot.active.as_mut() {
            Some(active) if active.id == id && !active.cancelled.load(Ordering::SeqCst) => {
                active.child = Some(child.clone());
                true
            }
            _ => false,
        }
    }

    /// Drain both pipes, wait for exit, report.
    fn supervise(
        &self,
        id: u64,
        state: &RunState,
        child: Arc<Mutex<Child>>,
        cancelled: Arc<AtomicBool>,
    ) {
        let (stdout, stderr) = {
            let mut guard = child.lock();
            (guard.stdout.take(), guard.stderr.take())
        };

        let mut drains = Vec::with_capacity(2);
        if let Some(out) = stdout {
            match local::drain(out, StreamKind::Stdout, self.sink.clone(), cancelled.clone()) {
                Ok(h) => drains.push(h),
                Err(e) => error!(run_id = id, error = %e, "cannot spawn stdout drain"),
            }
        }
        if let Some(err) = stderr {
            match local::drain(err, StreamKind::Stderr, self.sink.clone(), cancelled.clone()) {
                Ok(h) => drains.push(h),
                Err(e) => error!(run_id = id, error = %e, "cannot spawn stderr drain"),
            }
        }
        for h in drains {
            let _ = h.join();
        }

        let status = match local::wait_exit(&child) {
            _ if cancelled.load(Ordering::SeqCst) => RunStatus::Stopped,
            Ok(exit_code) => RunStatus::Completed { exit_code },
            Err(e) => RunStatus::Failed {
                reason: format!("wait error: {}", e),
            },
        };
        self.finish(id, state, status);
    }
}

/// Runs scripts one at a time, streaming their output to a sink.
pub struct Runner {
    inner: Arc<Inner>,
    next_id: AtomicU64,
}

impl Runner {
    /// `grace` is how long a stopped process gets between SIGTERM and kill.
    pub fn new(sink: Arc<dyn OutputSink>, grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink,
                slot: Mutex::new(Slot {
                    active: None,
                    last: None,
                }),
                grace,
            }),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn sink(&self) -> Arc<dyn OutputSink> {
        self.inner.sink.clone()
    }

    /// Claim the run slot.
    fn reserve(&self) -> Result<(u64, Arc<AtomicBool>, Arc<RunState>)> {
        let mut slot = self.inner.slot.lock();
        if slot.active.is_some() {
            return Err(AncileError::RunActive);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let cancelled = Arc::new(AtomicBool::new(false));
        slot.active = Some(ActiveRun {
            id,
            cancelled: cancelled.clone(),
            child: None,
        });
        slot.last = Some((id, RunStatus::Running));
        Ok((id, cancelled, Arc::new(RunState::new())))
    }

    /// Spawn `interpreter` on an existing `script` and stream its output.
    ///
    /// A spawn failure is reported to the sink, ends the run `Failed`, and
    /// is also returned.
    pub fn start(&self, interpreter: &Path, script: &Path) -> Result<RunHandle> {
        let (id, cancelled, state) = self.reserve()?;
        let child = match local::spawn_interpreter(interpreter, script) {
            Ok(child) => Arc::new(Mutex::new(child)),
            Err(source) => {
                let err = AncileError::SpawnFailure {
                    interpreter: interpreter.to_path_buf(),
                    source,
                };
                self.inner.fail(id, &state, &err.user_message());
                return Err(err);
            }
        };
        if !self.inner.attach(id, &child) {
            // Stopped between reserve and spawn
            local::terminate(child.clone(), Duration::ZERO);
        }
        info!(run_id = id, interpreter = %interpreter.display(), script = %script.display(), "run started");

        let inner = self.inner.clone();
        let worker_state = state.clone();
        self.spawn_worker(id, &state, move || {
            inner.supervise(id, &worker_state, child, cancelled);
        })?;
        Ok(RunHandle { id, state })
    }

    /// The full "Run" flow for a document: provision its environment, write
    /// `content` to its script file, spawn, stream. Everything after the
    /// slot is claimed happens on a worker thread; failures end the run
    /// `Failed` and reach the sink as error text.
    pub fn run_document(
        &self,
        title: &str,
        content: &str,
        scripts_dir: &Path,
        provisioner: Arc<Provisioner>,
    ) -> Result<RunHandle> {
        let script = script_path(scripts_dir, title)?;
        let (id, cancelled, state) = self.reserve()?;

        let inner = self.inner.clone();
        let worker_state = state.clone();
        let title = title.to_string();
        let content = content.to_string();
        let scripts_dir = scripts_dir.to_path_buf();
        self.spawn_worker(id, &state, move || {
            let state = worker_state;
            let interpreter = match provisioner.ensure_environment(&title, inner.sink.as_ref()) {
                Ok(p) => p,
                Err(e) => return inner.fail(id, &state, &e.user_message()),
            };
            if cancelled.load(Ordering::SeqCst) {
                return inner.finish(id, &state, RunStatus::Stopped);
            }

            let written = std::fs::create_dir_all(&scripts_dir)
                .and_then(|_| std::fs::write(&script, content.as_bytes()));
            if let Err(e) = written {
                let err = AncileError::io(format!("cannot write {}", script.display()), e);
                return inner.fail(id, &state, &err.to_string());
            }

            inner.sink.info(&format!("Running {}...\n", script.display()));
            let child = match local::spawn_interpreter(&interpreter, &script) {
                Ok(child) => Arc::new(Mutex::new(child)),
                Err(source) => {
                    let err = AncileError::SpawnFailure {
                        interpreter: interpreter.clone(),
                        source,
                    };
                    return inner.fail(id, &state, &err.user_message());
                }
            };
            if !inner.attach(id, &child) {
                // Stopped between provisioning and spawn
                local::terminate(child.clone(), Duration::ZERO);
            }
            info!(run_id = id, title = %title, "run started");
            inner.supervise(id, &state, child, cancelled);
        })?;
        Ok(RunHandle { id, state })
    }

    fn spawn_worker<F>(&self, id: u64, state: &Arc<RunState>, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = thread::Builder::new()
            .name(format!("ancile-run-{}", id))
            .spawn(work)
        {
            let err = AncileError::io("cannot spawn run worker", e);
            self.inner.fail(id, state, &err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Stop the active run. Returns false, after telling the sink, when
    /// there was nothing to stop. Does not wait for the process to die.
    pub fn stop(&self) -> bool {
        let active = {
            let mut slot = self.inner.slot.lock();
            let exited = slot
                .active
                .as_ref()
                .and_then(|a| a.child.as_ref())
                .is_some_and(|c| matches!(c.lock().try_wait(), Ok(Some(_))));
            if exited {
                None
            } else {
                slot.active.take()
            }
        };

        let Some(active) = active else {
            debug!("stop requested with no active run");
            self.inner.sink.info("\nNo active process.\n");
            return false;
        };

        active.cancelled.store(true, Ordering::SeqCst);
        info!(run_id = active.id, "run stopped by user");
        self.inner.sink.info("\nProcess stopped by user.\n");
        if let Some(child) = active.child {
            local::terminate(child, self.inner.grace);
        }
        true
    }

    pub fn is_running(&self) -> bool {
        self.inner.slot.lock().active.is_some()
    }

    /// Status of the most recently started run, `Idle` before the first.
    pub fn last_status(&self) -> RunStatus {
        self.inner
            .slot
            .lock()
            .last
            .as_ref()
            .map(|(_, s)| s.clone())
            .unwrap_or(RunStatus::Idle)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::types::SinkEvent;
    use crate::provision::EnvBuilder;
    use sink::MemorySink;
    use std::sync::mpsc;
    use std::time::Instant;

    fn runner() -> (Runner, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        (Runner::new(sink.clone(), Duration::from_secs(2)), sink)
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("s.py");
        std::fs::write(&path, body).unwrap();
        path
    }

    fn outputs(events: &[SinkEvent]) -> Vec<(String, StreamKind)> {
        events
            .iter()
            .filter_map(|e| match e {
                SinkEvent::Output { text, kind } => Some((text.clone(), *kind)),
                _ => None,
            })
            .collect()
    }

    /// Stands in for a venv by linking `bin/python` to `/bin/sh`.
    struct ShellEnv;

    impl EnvBuilder for ShellEnv {
        fn create(&self, dir: &Path) -> std::result::Result<(), String> {
            let bin = dir.join("bin");
            std::fs::create_dir_all(&bin).map_err(|e| e.to_string())?;
            std::os::unix::fs::symlink("/bin/sh", bin.join("python")).map_err(|e| e.to_string())
        }
    }

    #[test]
    fn test_an022_streams_both_pipes_then_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(dir.path(), "echo A\necho B >&2\nexit 3\n");
        let (runner, sink) = runner();

        let handle = runner.start(Path::new("/bin/sh"), &s).unwrap();
        assert_eq!(handle.wait(), RunStatus::Completed { exit_code: 3 });

        let events = sink.events();
        let out = outputs(&events);
        assert!(out.contains(&("A\n".to_string(), StreamKind::Stdout)));
        assert!(out.contains(&("B\n".to_string(), StreamKind::Stderr)));
        assert_eq!(
            events.last(),
            Some(&SinkEvent::Finished {
                run_id: handle.id(),
                status: RunStatus::Completed { exit_code: 3 }
            })
        );
        assert!(!runner.is_running());
        assert_eq!(runner.last_status(), RunStatus::Completed { exit_code: 3 });
    }

    #[test]
    fn test_an022_exit_zero() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(dir.path(), "echo ok\nexit 0\n");
        let (runner, _sink) = runner();
        let handle = runner.start(Path::new("/bin/sh"), &s).unwrap();
        assert_eq!(handle.wait().exit_code(), Some(0));
    }

    #[test]
    fn test_an022_per_stream_order() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(
            dir.path(),
            "for i in 1 2 3 4 5; do echo out$i; echo err$i >&2; done\n",
        );
        let (runner, sink) = runner();
        runner.start(Path::new("/bin/sh"), &s).unwrap().wait();

        let out = outputs(&sink.events());
        let stdout: Vec<_> = out
            .iter()
            .filter(|(_, k)| *k == StreamKind::Stdout)
            .map(|(t, _)| t.trim().to_string())
            .collect();
        let stderr: Vec<_> = out
            .iter()
            .filter(|(_, k)| *k == StreamKind::Stderr)
            .map(|(t, _)| t.trim().to_string())
            .collect();
        assert_eq!(stdout, vec!["out1", "out2", "out3", "out4", "out5"]);
        assert_eq!(stderr, vec!["err1", "err2", "err3", "err4", "err5"]);
    }

    #[test]
    fn test_an022_spawn_failure_is_failed_state() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(dir.path(), "true\n");
        let (runner, sink) = runner();

        let err = runner
            .start(Path::new("/nonexistent/bin/python"), &s)
            .err()
            .unwrap();
        assert!(matches!(err, AncileError::SpawnFailure { .. }));
        assert!(matches!(runner.last_status(), RunStatus::Failed { .. }));
        assert!(!runner.is_running());
        let events = sink.events();
        assert!(matches!(events[0], SinkEvent::Error(_)));
        assert!(matches!(
            events.last(),
            Some(SinkEvent::Finished {
                status: RunStatus::Failed { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_an022_stop_without_run_is_informational() {
        let (runner, sink) = runner();
        assert!(!runner.stop());
        assert!(!runner.stop());
        assert_eq!(sink.events().len(), 2);
        assert!(sink.infos().iter().all(|m| m.contains("No active process")));
        assert_eq!(runner.last_status(), RunStatus::Idle);
    }

    #[test]
    fn test_an022_second_start_rejected_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(dir.path(), "sleep 30\n");
        let (runner, _sink) = runner();

        let first = runner.start(Path::new("/bin/sh"), &s).unwrap();
        let err = runner.start(Path::new("/bin/sh"), &s).err().unwrap();
        assert!(matches!(err, AncileError::RunActive));

        assert!(runner.stop());
        assert_eq!(first.wait(), RunStatus::Stopped);
    }

    #[test]
    fn test_an022_stop_halts_forwarding() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(
            dir.path(),
            "i=0\nwhile true; do echo tick $i; i=$((i+1)); sleep 0.02; done\n",
        );
        let (runner, sink) = runner();
        let handle = runner.start(Path::new("/bin/sh"), &s).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while outputs(&sink.events()).len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(runner.stop());
        assert!(!runner.is_running());
        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)),
            Some(RunStatus::Stopped)
        );

        let events = sink.events();
        let stop_at = events
            .iter()
            .position(|e| matches!(e, SinkEvent::Info(t) if t.contains("stopped by user")))
            .unwrap();
        let late = outputs(&events[stop_at..]).len();
        // At most one line per stream can already be in flight
        assert!(late <= 2, "{} chunks forwarded after stop", late);
        assert_eq!(
            events.last(),
            Some(&SinkEvent::Finished {
                run_id: handle.id(),
                status: RunStatus::Stopped
            })
        );
    }

    #[test]
    fn test_an022_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(dir.path(), "sleep 30\n");
        let (runner, sink) = runner();
        let handle = runner.start(Path::new("/bin/sh"), &s).unwrap();
        assert!(runner.stop());
        assert!(!runner.stop());
        handle.wait();
        assert!(sink.infos().iter().any(|m| m.contains("No active process")));
    }

    #[test]
    fn test_an022_new_run_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let slow = script(dir.path(), "sleep 30\n");
        let (runner, _sink) = runner();
        let first = runner.start(Path::new("/bin/sh"), &slow).unwrap();
        runner.stop();

        let fast = dir.path().join("fast.py");
        std::fs::write(&fast, "exit 7\n").unwrap();
        let second = runner.start(Path::new("/bin/sh"), &fast).unwrap();
        assert_eq!(second.wait(), RunStatus::Completed { exit_code: 7 });
        assert_eq!(first.wait(), RunStatus::Stopped);
        // The stopped run finishing late must not clobber the newer status
        assert_eq!(runner.last_status(), RunStatus::Completed { exit_code: 7 });
    }

    #[test]
    fn test_an022_run_document_provisions_writes_and_runs() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(Provisioner::new(dir.path().join("venvs"), Box::new(ShellEnv)));
        let scripts = dir.path().join("scripts");
        let (runner, sink) = runner();

        let handle = runner
            .run_document("hello world", "echo hi\nexit 5\n", &scripts, provisioner.clone())
            .unwrap();
        assert_eq!(handle.wait(), RunStatus::Completed { exit_code: 5 });

        let written = script_path(&scripts, "hello world").unwrap();
        assert_eq!(std::fs::read_to_string(written).unwrap(), "echo hi\nexit 5\n");
        assert!(provisioner.is_provisioned("hello world").unwrap());
        let infos = sink.infos();
        assert!(infos.iter().any(|m| m.contains("Creating virtual environment")));
        assert!(infos.iter().any(|m| m.starts_with("Running ")));
        assert!(outputs(&sink.events()).contains(&("hi\n".to_string(), StreamKind::Stdout)));
    }

    #[test]
    fn test_an022_run_document_provisioning_failure() {
        struct Broken;
        impl EnvBuilder for Broken {
            fn create(&self, _dir: &Path) -> std::result::Result<(), String> {
                Err("disk full".to_string())
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(Provisioner::new(dir.path().join("venvs"), Box::new(Broken)));
        let (runner, sink) = runner();

        let handle = runner
            .run_document("t", "echo x\n", dir.path(), provisioner)
            .unwrap();
        match handle.wait() {
            RunStatus::Failed { reason } => assert!(reason.contains("disk full")),
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, SinkEvent::Error(t) if t.contains("disk full"))));
        assert!(!runner.is_running());
    }

    #[test]
    fn test_an022_run_document_rejects_blank_title() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = Arc::new(Provisioner::new(dir.path().join("venvs"), Box::new(ShellEnv)));
        let (runner, _sink) = runner();
        assert!(matches!(
            runner.run_document("  ", "", dir.path(), provisioner),
            Err(AncileError::InvalidName(_))
        ));
        assert!(!runner.is_running());
    }

    #[test]
    fn test_an022_stop_racing_start_never_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let s = script(dir.path(), "sleep 30\n");
        let (runner, _sink) = runner();
        let runner = Arc::new(runner);

        for _ in 0..20 {
            let stopper = {
                let runner = runner.clone();
                thread::spawn(move || {
                    let deadline = Instant::now() + Duration::from_secs(5);
                    while !runner.stop() && Instant::now() < deadline {}
                })
            };
            let handle = runner.start(Path::new("/bin/sh"), &s).unwrap();
            stopper.join().unwrap();

            assert_eq!(
                handle.wait_timeout(Duration::from_secs(5)),
                Some(RunStatus::Stopped),
                "run {} outlived its stop",
                handle.id()
            );
            assert!(!runner.is_running());
        }
    }

    /// Blocks environment creation until released.
    struct GatedEnv {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl EnvBuilder for GatedEnv {
        fn create(&self, dir: &Path) -> std::result::Result<(), String> {
            let _ = self.entered.lock().send(());
            self.release.lock().recv().map_err(|e| e.to_string())?;
            ShellEnv.create(dir)
        }
    }

    #[test]
    fn test_an022_stop_during_provisioning_ends_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let provisioner = Arc::new(Provisioner::new(
            dir.path().join("venvs"),
            Box::new(GatedEnv {
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            }),
        ));
        let scripts = dir.path().join("scripts");
        let (runner, sink) = runner();

        let handle = runner
            .run_document("gated", "echo leaked\n", &scripts, provisioner.clone())
            .unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(runner.stop());
        assert!(!runner.is_running());
        release_tx.send(()).unwrap();

        assert_eq!(
            handle.wait_timeout(Duration::from_secs(5)),
            Some(RunStatus::Stopped)
        );
        assert!(!runner.is_running());
        assert!(outputs(&sink.events()).is_empty());
        assert!(!script_path(&scripts, "gated").unwrap().exists());
        assert!(!sink.infos().iter().any(|m| m.starts_with("Running ")));
        // The environment itself is kept for the next run
        assert!(provisioner.is_provisioned("gated").unwrap());
    }

    #[test]
    fn test_an022_script_path() {
        let p = script_path(Path::new("/tmp/scripts"), "demo").unwrap();
        assert!(p.starts_with("/tmp/scripts"));
        assert_eq!(p.extension().unwrap(), "py");
    }
}
