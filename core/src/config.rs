use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::output_buffer::DEFAULT_OUTPUT_MAX_CHARS;

pub const SCRIPTDECK_HOME_ENV: &str = "SCRIPTDECK_HOME";
const CONFIG_TOML_FILE: &str = "config.toml";
const RUN_INDEX_FILE: &str = "run_index.json";
const DEFAULT_SHELL: &str = "/bin/sh";
pub const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine home directory; set {SCRIPTDECK_HOME_ENV}")]
    NoHome,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Settings handed to `LifecycleController::new`.
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleConfig {
    /// Upper bound, in characters, of each script's captured output.
    pub output_max_chars: usize,
    /// Where the run index lives. `None` keeps it in memory only.
    pub run_index_path: Option<PathBuf>,
    pub shell: PathBuf,
    /// Arguments placed before the command line, e.g. `-l -c`.
    pub shell_args: Vec<String>,
    /// How long a graceful stop may take before SIGKILL. `None` waits forever.
    pub stop_grace_period: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            output_max_chars: DEFAULT_OUTPUT_MAX_CHARS,
            run_index_path: None,
            shell: default_shell(),
            shell_args: vec!["-l".to_string(), "-c".to_string()],
            stop_grace_period: Some(DEFAULT_STOP_GRACE_PERIOD),
        }
    }
}

/// On-disk shape of `config.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigToml {
    output_max_chars: Option<usize>,
    run_index_path: Option<PathBuf>,
    shell: Option<PathBuf>,
    shell_args: Option<Vec<String>>,
    /// `0` disables escalation to SIGKILL.
    stop_grace_period_ms: Option<u64>,
}

impl LifecycleConfig {
    /// Loads `<home>/config.toml`, falling back to defaults for a missing file
    /// or missing keys. The run index defaults to `<home>/run_index.json`.
    pub fn load(home: &Path) -> Result<Self, ConfigError> {
        let path = home.join(CONFIG_TOML_FILE);
        let toml = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str::<ConfigToml>(&contents).map_err(|source| {
                ConfigError::Parse {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => ConfigToml::default(),
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        Self::from_toml(toml, home)
    }

    fn from_toml(toml: ConfigToml, home: &Path) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let output_max_chars = toml.output_max_chars.unwrap_or(defaults.output_max_chars);
        if output_max_chars == 0 {
            return Err(ConfigError::Invalid(
                "output_max_chars must be greater than zero".to_string(),
            ));
        }

        let run_index_path = match toml.run_index_path {
            Some(path) if path.is_relative() => home.join(path),
            Some(path) => path,
            None => home.join(RUN_INDEX_FILE),
        };

        let stop_grace_period = match toml.stop_grace_period_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => defaults.stop_grace_period,
        };

        Ok(Self {
            output_max_chars,
            run_index_path: Some(run_index_path),
            shell: toml.shell.unwrap_or(defaults.shell),
            shell_args: toml.shell_args.unwrap_or(defaults.shell_args),
            stop_grace_period,
        })
    }
}

/// `$SCRIPTDECK_HOME` when set and non-empty, otherwise `~/.scriptdeck`.
pub fn find_scriptdeck_home() -> Result<PathBuf, ConfigError> {
    if let Ok(value) = std::env::var(SCRIPTDECK_HOME_ENV)
        && !value.trim().is_empty()
    {
        return Ok(PathBuf::from(value));
    }
    let mut home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
    home.push(".scriptdeck");
    Ok(home)
}

fn default_shell() -> PathBuf {
    std::env::var_os("SHELL")
        .filter(|shell| !shell.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().expect("tempdir");
        let config = LifecycleConfig::load(home.path()).expect("load");

        assert_eq!(config.output_max_chars, DEFAULT_OUTPUT_MAX_CHARS);
        assert_eq!(
            config.run_index_path,
            Some(home.path().join("run_index.json"))
        );
        assert_eq!(config.stop_grace_period, Some(DEFAULT_STOP_GRACE_PERIOD));
    }

    #[test]
    fn reads_overrides() {
        let home = TempDir::new().expect("tempdir");
        std::fs::write(
            home.path().join("config.toml"),
            r#"
output_max_chars = 256
run_index_path = "state/index.json"
shell = "/bin/bash"
shell_args = ["-c"]
stop_grace_period_ms = 0
"#,
        )
        .expect("write config");

        let config = LifecycleConfig::load(home.path()).expect("load");
        assert_eq!(config.output_max_chars, 256);
        assert_eq!(
            config.run_index_path,
            Some(home.path().join("state/index.json"))
        );
        assert_eq!(config.shell, PathBuf::from("/bin/bash"));
        assert_eq!(config.shell_args, vec!["-c".to_string()]);
        assert_eq!(config.stop_grace_period, None);
    }

    #[test]
    fn rejects_unknown_keys() {
        let home = TempDir::new().expect("tempdir");
        std::fs::write(home.path().join("config.toml"), "buffer = 3\n").expect("write");
        assert_matches!(
            LifecycleConfig::load(home.path()),
            Err(ConfigError::Parse { .. })
        );
    }

    #[test]
    fn rejects_zero_output_bound() {
        let home = TempDir::new().expect("tempdir");
        std::fs::write(home.path().join("config.toml"), "output_max_chars = 0\n")
            .expect("write");
        assert_matches!(
            LifecycleConfig::load(home.path()),
            Err(ConfigError::Invalid(_))
        );
    }
}
