//! Where segbridge looks for worker environments.

use std::path::{Path, PathBuf};

/// Directory under the data dir holding named worker environments.
pub const ENVS_DIR: &str = "envs";

/// Environment used when none is given.
pub const DEFAULT_ENV_NAME: &str = "default";

/// Get the data directory for segbridge.
///
/// - Linux: `~/.local/share/segbridge`
/// - macOS: `~/Library/Application Support/segbridge`
pub fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("segbridge"))
        .unwrap_or_else(|| PathBuf::from(".segbridge"))
}

/// Root of the environment named `name`.
pub fn env_root(name: &str) -> PathBuf {
    data_dir().join(ENVS_DIR).join(name)
}

/// Root of the default environment.
pub fn default_env_root() -> PathBuf {
    env_root(DEFAULT_ENV_NAME)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// Covers `--env-root=~/envs/sam`, where the shell does not expand.
///
/// ```
/// use std::path::PathBuf;
/// use segbridge::paths::expand_tilde;
///
/// let path = PathBuf::from("/opt/envs/sam");
/// assert_eq!(expand_tilde(&path), path);
/// ```
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}
