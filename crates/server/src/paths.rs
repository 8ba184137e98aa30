//! Central path resolution for MegaTrade data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `MEGATRADE_DATA_DIR` env > `~/.megatrade`.
//! All callsites use these helpers instead of constructing paths from `HOME`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Priority: `explicit` arg > `MEGATRADE_DATA_DIR` env > `~/.megatrade` default,
/// falling back to the system temp dir when there is no home directory.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = resolve_data_dir(explicit, std::env::var("MEGATRADE_DATA_DIR").ok());

    let mut guard = DATA_DIR.write().unwrap_or_else(|e| e.into_inner());
    *guard = Some(dir.clone());
    dir
}

fn resolve_data_dir(explicit: Option<&Path>, env_val: Option<String>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    if let Some(env_val) = env_val.filter(|v| !v.trim().is_empty()) {
        return PathBuf::from(env_val);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".megatrade")
}

/// Return the current data directory, resolving the default if
/// `init_data_dir` hasn't been called.
pub fn data_dir() -> PathBuf {
    let current = DATA_DIR
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    current.unwrap_or_else(|| init_data_dir(None))
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn token_file_path() -> PathBuf {
    data_dir().join("auth-token")
}

pub fn client_config_path() -> PathBuf {
    data_dir().join("client.toml")
}

/// Create all required subdirectories under the data dir.
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

/// Read the saved auth token, if any.
pub fn read_token_file() -> Option<String> {
    std::fs::read_to_string(token_file_path())
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
