use std::path::PathBuf;

use thiserror::Error;

/// Exit codes 35..=55 are reserved for configuration-class failures and
/// are part of the external contract; do not renumber.
pub const EXIT_CONFIG_PARSE: i32 = 35;
pub const EXIT_MISSING_COMPONENT: i32 = 36;
pub const EXIT_INVALID_BASIS: i32 = 37;
pub const EXIT_CACHE_MISMATCH: i32 = 38;
pub const EXIT_IO_FAILURE: i32 = 39;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("missing required key `{key}` in section:\n{fragment}")]
    MissingKey { key: String, fragment: String },
    #[error("unknown key `{key}` in parameters:\n{fragment}")]
    UnknownKey { key: String, fragment: String },
    #[error("reference to unknown component `{0}`")]
    UnknownComponent(String),
    #[error("unknown force id `{0}`")]
    UnknownForce(String),
}

#[derive(Debug, Error)]
#[error("invalid basis parameters: {0}")]
pub struct InvalidBasisParameters(pub String);

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("cache parameter mismatch: {0}")]
    Mismatch(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Basis(#[from] InvalidBasisParameters),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("coordinate out of domain: {0}")]
    InvalidCoordinate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(e) => e.exit_code(),
            Error::Basis(_) => EXIT_INVALID_BASIS,
            Error::Cache(CacheError::Mismatch(_)) => EXIT_CACHE_MISMATCH,
            Error::Cache(_) => EXIT_IO_FAILURE,
            Error::InvalidCoordinate(_) => EXIT_INVALID_BASIS,
            Error::Io(_) => EXIT_IO_FAILURE,
        }
    }
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::UnknownComponent(_) => EXIT_MISSING_COMPONENT,
            _ => EXIT_CONFIG_PARSE,
        }
    }
}
