use crate::error::{KeygateError, KeygateResult};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "KEYGATE_CONFIG";
pub const HOME_ENV: &str = "KEYGATE_HOME";
/// Longest session budget or lockout window accepted: one leap year.
pub const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// On-disk locations. Only `root` is required; everything else hangs off it
/// unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Paths {
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default)]
    pub master_key: Option<PathBuf>,

    #[serde(default)]
    pub store: Option<PathBuf>,

    #[serde(default)]
    pub session: Option<PathBuf>,

    #[serde(default)]
    pub lockout: Option<PathBuf>,

    #[serde(default)]
    pub logs: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    if let Ok(home) = env::var(HOME_ENV) {
        return PathBuf::from(home);
    }
    match env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".keygate"),
        Err(_) => PathBuf::from(".keygate"),
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::rooted(default_root())
    }
}

impl Paths {
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            master_key: None,
            store: None,
            session: None,
            lockout: None,
            logs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionCfg {
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Refuse unlock attempts while a fresh lockout marker exists.
    #[serde(default)]
    pub enforce_lockout: bool,

    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,
}

fn default_duration_secs() -> u64 {
    8 * 60 * 60
}

fn default_max_attempts() -> u32 {
    3
}

fn default_lockout_secs() -> u64 {
    300
}

impl Default for SessionCfg {
    fn default() -> Self {
        Self {
            duration_secs: default_duration_secs(),
            max_attempts: default_max_attempts(),
            enforce_lockout: false,
            lockout_secs: default_lockout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct KeysCfg {
    #[serde(default = "default_expiry_days")]
    pub default_expiry_days: u32,

    #[serde(default = "default_secret_bytes")]
    pub secret_bytes: usize,
}

fn default_expiry_days() -> u32 {
    7
}

fn default_secret_bytes() -> usize {
    16
}

impl Default for KeysCfg {
    fn default() -> Self {
        Self {
            default_expiry_days: default_expiry_days(),
            secret_bytes: default_secret_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CryptoCfg {
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,
}

fn default_kdf_iterations() -> u32 {
    10_000
}

impl Default for CryptoCfg {
    fn default() -> Self {
        Self {
            kdf_iterations: default_kdf_iterations(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DaemonCfg {
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

fn default_poll_secs() -> u64 {
    30
}

impl Default for DaemonCfg {
    fn default() -> Self {
        Self {
            poll_secs: default_poll_secs(),
        }
    }
}

/// Supported configuration formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KeygateConfig {
    #[serde(default)]
    pub paths: Paths,

    #[serde(default)]
    pub session: SessionCfg,

    #[serde(default)]
    pub keys: KeysCfg,

    #[serde(default)]
    pub crypto: CryptoCfg,

    #[serde(default)]
    pub daemon: DaemonCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,

    #[serde(skip)]
    pub format: ConfigFormat,
}

impl KeygateConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> KeygateResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(path.extension().and_then(|ext| ext.to_str()), Some(ext) if ext.eq_ignore_ascii_case("toml"));
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = Some(path.to_path_buf());
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        let issues = cfg.validate();
        if let Some(first) = issues.into_iter().next() {
            return Err(KeygateError::InvalidConfig(first));
        }

        Ok(cfg)
    }

    /// Resolve the configuration for a binary: explicit path, then
    /// `KEYGATE_CONFIG`, then built-in defaults.
    pub fn resolve(explicit: Option<&Path>) -> KeygateResult<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match env::var(CONFIG_ENV) {
            Ok(path) if !path.is_empty() => Self::load(path),
            _ => Ok(Self::default()),
        }
    }

    /// Defaults anchored at `root`; used for isolated instances.
    pub fn default_for(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: Paths::rooted(root),
            ..Self::default()
        }
    }

    /// Collect every problem with the current values.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if !self.paths.root.is_absolute() {
            issues.push(format!(
                "paths.root must be absolute (got {})",
                self.paths.root.display()
            ));
        }
        if self.session.duration_secs == 0 {
            issues.push("session.duration_secs must be greater than zero".to_string());
        }
        if self.session.duration_secs > MAX_WINDOW_SECS {
            issues.push(format!("session.duration_secs must be at most {MAX_WINDOW_SECS}"));
        }
        if self.session.lockout_secs > MAX_WINDOW_SECS {
            issues.push(format!("session.lockout_secs must be at most {MAX_WINDOW_SECS}"));
        }
        if self.session.max_attempts == 0 {
            issues.push("session.max_attempts must be at least 1".to_string());
        }
        if self.keys.default_expiry_days == 0 {
            issues.push("keys.default_expiry_days must be at least 1".to_string());
        }
        if self.keys.secret_bytes < 8 {
            issues.push("keys.secret_bytes must be at least 8".to_string());
        }
        if self.crypto.kdf_iterations == 0 {
            issues.push("crypto.kdf_iterations must be at least 1".to_string());
        }
        if self.daemon.poll_secs == 0 {
            issues.push("daemon.poll_secs must be greater than zero".to_string());
        }
        issues
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.paths.root.join("keys")
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.paths
            .master_key
            .clone()
            .unwrap_or_else(|| self.keys_dir().join("master.key"))
    }

    pub fn store_path(&self) -> PathBuf {
        self.paths
            .store
            .clone()
            .unwrap_or_else(|| self.keys_dir().join("keys.db"))
    }

    pub fn session_path(&self) -> PathBuf {
        self.paths
            .session
            .clone()
            .unwrap_or_else(|| self.paths.root.join("run").join("session"))
    }

    pub fn lockout_path(&self) -> PathBuf {
        self.paths
            .lockout
            .clone()
            .unwrap_or_else(|| self.paths.root.join("run").join("lockout"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.paths
            .logs
            .clone()
            .unwrap_or_else(|| self.paths.root.join("logs"))
    }

    pub fn session_duration(&self) -> Duration {
        Duration::from_secs(self.session.duration_secs)
    }

    pub fn daemon_poll(&self) -> Duration {
        Duration::from_secs(self.daemon.poll_secs)
    }
}
