//! AN-002: `ancile.yaml` parsing, validation and path resolution.
//!
//! Every field except `version` is optional. Relative paths resolve against
//! `data_dir`, and the defaults reproduce the classic layout: `data.db`,
//! `venvs/`, scripts beside the database, `background.txt`.

use super::error::{AncileError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the config file `init` writes and the CLI looks for.
pub const CONFIG_FILE: &str = "ancile.yaml";

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AncileConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Base directory for every relative path below
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite database holding groups, cards and documents
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Root of the per-script virtual environments
    #[serde(default = "default_venvs_dir")]
    pub venvs_dir: PathBuf,

    /// Where run scripts are written
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// File recording the chosen background image
    #[serde(default = "default_background_file")]
    pub background_file: PathBuf,

    /// Base interpreter used to create environments
    #[serde(default = "default_python")]
    pub python: String,

    /// Grace period between SIGTERM and kill when stopping a run
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_database() -> PathBuf {
    PathBuf::from("data.db")
}

fn default_venvs_dir() -> PathBuf {
    PathBuf::from("venvs")
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_background_file() -> PathBuf {
    PathBuf::from("background.txt")
}

fn default_python() -> String {
    if cfg!(windows) {
        "python".to_string()
    } else {
        "python3".to_string()
    }
}

fn default_stop_grace_ms() -> u64 {
    2000
}

impl Default for AncileConfig {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            data_dir: default_data_dir(),
            database: default_database(),
            venvs_dir: default_venvs_dir(),
            scripts_dir: default_scripts_dir(),
            background_file: default_background_file(),
            python: default_python(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl AncileConfig {
    /// Config rooted at `data_dir` with every other field defaulted.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.data_dir.join(p)
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.resolve(&self.database)
    }

    pub fn venvs_path(&self) -> PathBuf {
        self.resolve(&self.venvs_dir)
    }

    pub fn scripts_path(&self) -> PathBuf {
        self.resolve(&self.scripts_dir)
    }

    pub fn background_path(&self) -> PathBuf {
        self.resolve(&self.background_file)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Parse a config from a YAML string.
pub fn parse_config(yaml: &str) -> Result<AncileConfig> {
    serde_yaml_ng::from_str(yaml).map_err(|e| AncileError::Config(format!("YAML parse error: {}", e)))
}

/// Load the config at `path`. A missing file yields the defaults, with
/// `data_dir` taken relative to the file's directory.
pub fn load_config(path: &Path) -> Result<AncileConfig> {
    let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        let base = if base.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            base
        };
        return Ok(AncileConfig::with_data_dir(base));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| AncileError::io(format!("failed to read {}", path.display()), e))?;
    let mut config = parse_config(&content)?;
    if config.data_dir.is_relative() && !base.as_os_str().is_empty() {
        config.data_dir = base.join(&config.data_dir);
    }

    let errors = validate_config(&config);
    if errors.is_empty() {
        Ok(config)
    } else {
        Err(AncileError::Config(errors.join("; ")))
    }
}

/// Validate a parsed config. Returns a list of problems (empty = valid).
pub fn validate_config(config: &AncileConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "version must be \"1.0\", got \"{}\"",
            config.version
        ));
    }
    if config.python.trim().is_empty() {
        errors.push("python must not be empty".to_string());
    }
    for (field, p) in [
        ("database", &config.database),
        ("venvs_dir", &config.venvs_dir),
        ("background_file", &config.background_file),
    ] {
        if p.as_os_str().is_empty() {
            errors.push(format!("{} must not be empty", field));
        }
    }

    errors
}

/// Template written by `ancile init`.
pub const CONFIG_TEMPLATE: &str = r#"version: "1.0"

# Everything below is optional; relative paths resolve against data_dir.
data_dir: "."
database: data.db
venvs_dir: venvs
scripts_dir: scripts
background_file: background.txt
stop_grace_ms: 2000
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_an002_minimal() {
        let config = parse_config("version: \"1.0\"\n").unwrap();
        assert!(validate_config(&config).is_empty());
        assert_eq!(config.database, PathBuf::from("data.db"));
        assert_eq!(config.venvs_dir, PathBuf::from("venvs"));
        assert_eq!(config.stop_grace(), Duration::from_millis(2000));
    }

    #[test]
    fn test_an002_bad_version() {
        let config = parse_config("version: \"2.0\"\n").unwrap();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("version")));
    }

    #[test]
    fn test_an002_empty_python() {
        let config = parse_config("version: \"1.0\"\npython: \"\"\n").unwrap();
        assert!(validate_config(&config).iter().any(|e| e.contains("python")));
    }

    #[test]
    fn test_an002_parse_error() {
        let err = parse_config("version: [unclosed").unwrap_err();
        assert!(matches!(err, AncileError::Config(_)));
    }

    #[test]
    fn test_an002_paths_resolve_against_data_dir() {
        let config = AncileConfig::with_data_dir("/srv/ancile");
        assert_eq!(config.database_path(), PathBuf::from("/srv/ancile/data.db"));
        assert_eq!(config.venvs_path(), PathBuf::from("/srv/ancile/venvs"));
        assert_eq!(
            config.background_path(),
            PathBuf::from("/srv/ancile/background.txt")
        );
    }

    #[test]
    fn test_an002_absolute_paths_kept() {
        let mut config = AncileConfig::with_data_dir("/srv/ancile");
        config.venvs_dir = PathBuf::from("/opt/venvs");
        assert_eq!(config.venvs_path(), PathBuf::from("/opt/venvs"));
    }

    #[test]
    fn test_an002_load_missing_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(config.data_dir, dir.path());
        assert_eq!(config.database_path(), dir.path().join("data.db"));
    }

    #[test]
    fn test_an002_load_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, CONFIG_TEMPLATE).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.scripts_path(), dir.path().join(".").join("scripts"));
    }

    #[test]
    fn test_an002_load_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "version: \"0.9\"\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("version"));
    }
}
