//! Central path resolution for server data files.
//!
//! Resolved once at startup from: CLI `--data-dir` > `SCRIBBLE_DATA_DIR` env >
//! `~/.scribble`. Callsites use these helpers instead of building paths
//! themselves.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Initialize the global data directory. Returns the resolved path.
///
/// Falls back to the working directory when there is no home directory.
pub fn init_data_dir(explicit: Option<&Path>) -> PathBuf {
    let dir = if let Some(p) = explicit {
        p.to_path_buf()
    } else if let Ok(env_val) = std::env::var("SCRIBBLE_DATA_DIR") {
        PathBuf::from(env_val)
    } else {
        dirs::home_dir()
            .map(|home| home.join(".scribble"))
            .unwrap_or_else(|| PathBuf::from("."))
    };

    *DATA_DIR.write() = Some(dir.clone());
    dir
}

/// The current data directory, or the working directory before `init_data_dir`
pub fn data_dir() -> PathBuf {
    DATA_DIR
        .read()
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn templates_dir() -> PathBuf {
    data_dir().join("templates")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn log_db_path() -> PathBuf {
    data_dir().join("log.db")
}

/// Create the data directory and its log subdirectory
pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_dir_wins() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = init_data_dir(Some(dir.path()));
        assert_eq!(resolved, dir.path());
        assert_eq!(log_db_path(), dir.path().join("log.db"));
        assert_eq!(templates_dir(), dir.path().join("templates"));

        ensure_dirs().unwrap();
        assert!(dir.path().join("logs").is_dir());
    }
}
