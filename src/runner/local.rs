//! AN-021: Local process plumbing — spawn, drain, terminate.
//!
//! On Unix the interpreter leads its own process group so that stop reaches
//! anything the script forked; otherwise a grandchild would keep the pipes
//! open and the drain threads would never see EOF.

use super::sink::OutputSink;
use crate::core::types::StreamKind;
use parking_lot::Mutex;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How often exit status is polled.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Spawn `interpreter <script>` with both output pipes captured.
pub fn spawn_interpreter(interpreter: &Path, script: &Path) -> std::io::Result<Child> {
    let mut cmd = Command::new(interpreter);
    cmd.arg(script)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }
    cmd.spawn()
}

/// Forward `reader` line by line to `sink` until EOF or cancellation.
///
/// Lines keep their trailing newline; invalid UTF-8 is replaced. The flag is
/// checked between lines, so a line already read when it flips is dropped.
pub fn drain<R>(
    reader: R,
    kind: StreamKind,
    sink: Arc<dyn OutputSink>,
    cancelled: Arc<AtomicBool>,
) -> std::io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("ancile-drain-{}", kind))
        .spawn(move || {
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        if cancelled.load(Ordering::SeqCst) {
                            break;
                        }
                        sink.write(&String::from_utf8_lossy(&buf), kind.is_error());
                    }
                    Err(e) => {
                        tracing::warn!(stream = %kind, error = %e, "pipe read failed");
                        break;
                    }
                }
            }
        })
}

/// Poll until the child exits. Returns its exit code, `-1` for a signal death.
pub fn wait_exit(child: &Mutex<Child>) -> std::io::Result<i32> {
    loop {
        if let Some(status) = child.lock().try_wait()? {
            return Ok(status.code().unwrap_or(-1));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Ask the process (group) to exit, then force it after `grace` from a
/// background thread. Returns without waiting.
pub fn terminate(child: Arc<Mutex<Child>>, grace: Duration) {
    {
        let mut guard = child.lock();
        if matches!(guard.try_wait(), Ok(Some(_))) {
            return;
        }
        // Signal while holding the lock so the pid cannot be reaped and reused
        if let Err(e) = signal_group(&mut guard, "TERM") {
            tracing::warn!(pid = guard.id(), error = %e, "graceful termination failed");
        }
    }

    let spawned = thread::Builder::new()
        .name("ancile-reaper".to_string())
        .spawn(move || {
            let start = Instant::now();
            loop {
                let mut guard = child.lock();
                match guard.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) if start.elapsed() < grace => {}
                    _ => {
                        tracing::warn!(pid = guard.id(), "process ignored SIGTERM, killing");
                        if let Err(e) = signal_group(&mut guard, "KILL") {
                            tracing::error!(pid = guard.id(), error = %e, "kill failed");
                        }
                        return;
                    }
                }
                drop(guard);
                thread::sleep(POLL_INTERVAL);
            }
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "cannot spawn reaper thread");
    }
}

#[cfg(unix)]
fn signal_group(child: &mut Child, signal: &str) -> std::io::Result<()> {
    // The child leads its own group, so its pid is the group id
    let status = Command::new("kill")
        .arg(format!("-{}", signal))
        .arg("--")
        .arg(format!("-{}", child.id()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else if signal == "KILL" {
        child.kill()
    } else {
        Err(std::io::Error::other(format!("kill -{} exited with {}", signal, status)))
    }
}

#[cfg(not(unix))]
fn signal_group(child: &mut Child, _signal: &str) -> std::io::Result<()> {
    child.kill()
}
