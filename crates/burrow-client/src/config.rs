//! On-disk persistence for the bearer token.
//!
//! A single text file under `~/.burrow/` holds the token. The file is
//! written 0600 since the token is a secret.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

const CONFIG_DIR: &str = ".burrow";
const TOKEN_FILE: &str = "token";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the home directory")]
    NoHomeDir,

    #[error("no saved token; run `burrow client login` first")]
    NoToken,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

fn home_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::NoHomeDir)
}

/// Write the token under the default home directory.
pub fn persist_token(token: &str) -> Result<PathBuf, ConfigError> {
    persist_token_in(&home_dir()?, token)
}

/// Write the token under an explicit base directory.
pub fn persist_token_in(base: &Path, token: &str) -> Result<PathBuf, ConfigError> {
    let dir = base.join(CONFIG_DIR);
    fs::create_dir_all(&dir)?;

    let path = dir.join(TOKEN_FILE);
    fs::write(&path, token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o755))?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
    }

    Ok(path)
}

/// Read the token back from the default home directory.
pub fn load_token() -> Result<String, ConfigError> {
    load_token_in(&home_dir()?)
}

/// Read the token back from an explicit base directory.
pub fn load_token_in(base: &Path) -> Result<String, ConfigError> {
    let path = base.join(CONFIG_DIR).join(TOKEN_FILE);
    match fs::read_to_string(&path) {
        Ok(token) => Ok(token.trim_end().to_string()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ConfigError::NoToken),
        Err(e) => Err(e.into()),
    }
}
