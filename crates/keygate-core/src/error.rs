use std::path::PathBuf;
use thiserror::Error;

/// Result alias for core operations.
pub type KeygateResult<T> = Result<T, KeygateError>;

#[derive(Error, Debug)]
pub enum KeygateError {
    #[error("[KG1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[KG1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[KG1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[KG1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[KG1200] key id `{0}` not found")]
    NotFound(String),

    #[error("[KG1201] missing required argument: {0}")]
    MissingArgument(String),

    #[error("[KG1300] invalid master key at {path}: {reason}")]
    InvalidMasterKey { path: PathBuf, reason: String },

    // Never carries a cause: a wrong passphrase and a mangled blob look the same.
    #[error("[KG1400] decryption failed")]
    Decryption,

    #[error("[KG1500] corrupt key record on line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },

    #[error("[KG1501] corrupt session file: {0}")]
    CorruptSession(String),

    #[error("[KG2000] locked out after {attempts} failed attempts")]
    LockedOut { attempts: u32 },

    #[error("[KG2001] key `{0}` has expired")]
    Expired(String),
}

impl KeygateError {
    pub fn code(&self) -> &'static str {
        match self {
            KeygateError::Io(_) => "KG1000",
            KeygateError::Toml(_) => "KG1001",
            KeygateError::Yaml(_) => "KG1002",
            KeygateError::InvalidConfig(_) => "KG1100",
            KeygateError::NotFound(_) => "KG1200",
            KeygateError::MissingArgument(_) => "KG1201",
            KeygateError::InvalidMasterKey { .. } => "KG1300",
            KeygateError::Decryption => "KG1400",
            KeygateError::CorruptRecord { .. } => "KG1500",
            KeygateError::CorruptSession(_) => "KG1501",
            KeygateError::LockedOut { .. } => "KG2000",
            KeygateError::Expired(_) => "KG2001",
        }
    }
}
