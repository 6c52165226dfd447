//! AN-031: Python `venv` builder.
//!
//! Runs `<python> -m venv <dir>`, which installs pip by default.

use super::EnvBuilder;
use std::path::Path;
use std::process::{Command, Stdio};

/// Creates environments with the stdlib `venv` module of a base interpreter.
#[derive(Debug, Clone)]
pub struct PythonVenv {
    python: String,
}

impl PythonVenv {
    pub fn new(python: impl Into<String>) -> Self {
        Self {
            python: python.into(),
        }
    }

    pub fn python(&self) -> &str {
        &self.python
    }
}

impl EnvBuilder for PythonVenv {
    fn create(&self, dir: &Path) -> Result<(), String> {
        let output = Command::new(&self.python)
            .arg("-m")
            .arg("venv")
            .arg(dir)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("failed to spawn {}: {}", self.python, e))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}
