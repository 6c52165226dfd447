//! AN-030: Per-script environment provisioning.
//!
//! Each card title owns one environment under the venvs root, at
//! `<root>/<safe name>`. Creation is lazy and serialized; an existing
//! interpreter short-circuits to a stat.

pub mod venv;

use crate::core::error::{AncileError, Result};
use crate::core::naming::safe_name;
use crate::runner::sink::OutputSink;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub use venv::PythonVenv;

/// Something that can lay down an isolated interpreter in a directory.
pub trait EnvBuilder: Send + Sync {
    /// Populate `dir` so that [`interpreter_in`]`(dir)` exists afterwards.
    fn create(&self, dir: &Path) -> std::result::Result<(), String>;
}

/// Interpreter location inside an environment directory.
pub fn interpreter_in(dir: &Path) -> PathBuf {
    if cfg!(windows) {
        dir.join("Scripts").join("python.exe")
    } else {
        dir.join("bin").join("python")
    }
}

pub struct Provisioner {
    root: PathBuf,
    builder: Box<dyn EnvBuilder>,
    creating: Mutex<()>,
}

impl Provisioner {
    pub fn new(root: impl Into<PathBuf>, builder: Box<dyn EnvBuilder>) -> Self {
        Self {
            root: root.into(),
            builder,
            creating: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn env_dir(&self, name: &str) -> Result<PathBuf> {
        Ok(self.root.join(safe_name(name)?))
    }

    pub fn interpreter_path(&self, name: &str) -> Result<PathBuf> {
        Ok(interpreter_in(&self.env_dir(name)?))
    }

    pub fn is_provisioned(&self, name: &str) -> Result<bool> {
        Ok(self.interpreter_path(name)?.exists())
    }

    /// Return the interpreter for `name`, creating its environment first if
    /// needed. Blocks for as long as creation takes.
    pub fn ensure_environment(&self, name: &str, sink: &dyn OutputSink) -> Result<PathBuf> {
        let dir = self.env_dir(name)?;
        let python = interpreter_in(&dir);
        if python.exists() {
            debug!(name = %name, interpreter = %python.display(), "environment present");
            return Ok(python);
        }

        let _guard = self.creating.lock();
        // Another thread may have finished it while we waited
        if python.exists() {
            return Ok(python);
        }

        let failure = |reason: String| {
            error!(name = %name, error = %reason, "provisioning failed");
            AncileError::ProvisioningFailure {
                name: name.to_string(),
                reason,
            }
        };

        std::fs::create_dir_all(&self.root)
            .map_err(|e| failure(format!("cannot create {}: {}", self.root.display(), e)))?;

        sink.info(&format!("Creating virtual environment for '{}'...\n", name));
        info!(name = %name, dir = %dir.display(), "creating environment");

        self.builder.create(&dir).map_err(failure)?;
        if !python.exists() {
            return Err(failure(format!(
                "interpreter missing after creation: {}",
                python.display()
            )));
        }

        sink.info("Virtual environment created.\n");
        info!(name = %name, interpreter = %python.display(), "environment created");
        Ok(python)
    }
}
