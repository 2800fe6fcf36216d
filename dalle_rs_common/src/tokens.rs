use std::{env, fmt, fs, path::PathBuf, str::FromStr};

use thiserror::Error;
use tracing::warn;

/// Environment variable read by `env` without an explicit name.
const DEFAULT_TOKEN_ENV_VAR: &str = "HUGGING_FACE_HUB_TOKEN";

/// Where to read the Hugging Face access token from.
///
/// Parsed from `literal:<token>`, `env[:<VAR>]`, `path:<file>`, `cache` or `none`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Literal(String),
    EnvVar(String),
    Path(String),
    CacheToken,
    None,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenSourceError {
    #[error("Token source `{0}` needs a value, e.g. `{0}:<value>`.")]
    MissingValue(&'static str),
    #[error("Unknown token source `{0}`, expected `literal`, `env`, `path`, `cache` or `none`.")]
    Unknown(String),
    #[error("No home directory to find the cached token in.")]
    HomeDirectoryMissing,
}

impl FromStr for TokenSource {
    type Err = TokenSourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, value) = match s.split_once(':') {
            Some((kind, value)) => (kind, Some(value)),
            None => (s, None),
        };
        match (kind, value) {
            ("literal", Some(value)) => Ok(Self::Literal(value.to_string())),
            ("path", Some(value)) => Ok(Self::Path(value.to_string())),
            ("literal", None) => Err(TokenSourceError::MissingValue("literal")),
            ("path", None) => Err(TokenSourceError::MissingValue("path")),
            ("env", value) => Ok(Self::EnvVar(
                value.unwrap_or(DEFAULT_TOKEN_ENV_VAR).to_string(),
            )),
            ("cache", None) => Ok(Self::CacheToken),
            ("none", None) => Ok(Self::None),
            _ => Err(TokenSourceError::Unknown(s.to_string())),
        }
    }
}

impl fmt::Display for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(_) => write!(f, "literal:<redacted>"),
            Self::EnvVar(var) => write!(f, "env:{var}"),
            Self::Path(path) => write!(f, "path:{path}"),
            Self::CacheToken => write!(f, "cache"),
            Self::None => write!(f, "none"),
        }
    }
}

fn cached_token_path() -> Result<PathBuf, TokenSourceError> {
    let home = dirs::home_dir().ok_or(TokenSourceError::HomeDirectoryMissing)?;
    Ok(home.join(".cache").join("huggingface").join("token"))
}

/// Read the token from `source`. An unreadable environment variable or file logs a warning and
/// yields no token, so public repositories still load.
pub fn get_token(source: &TokenSource) -> Result<Option<String>, TokenSourceError> {
    let read_file = |path: PathBuf| match fs::read_to_string(&path) {
        Ok(token) => Some(token),
        Err(_) => {
            warn!("could not read token from {}, using no token.", path.display());
            None
        }
    };

    let token = match source {
        TokenSource::Literal(token) => Some(token.clone()),
        TokenSource::EnvVar(var) => match env::var(var) {
            Ok(token) => Some(token),
            Err(_) => {
                warn!("environment variable {var} is not set, using no token.");
                None
            }
        },
        TokenSource::Path(path) => read_file(PathBuf::from(path)),
        TokenSource::CacheToken => read_file(cached_token_path()?),
        TokenSource::None => None,
    };

    Ok(token
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty()))
}
