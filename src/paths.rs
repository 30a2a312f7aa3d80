//! Path utilities for genpool data storage.

use std::path::{Path, PathBuf};

/// File holding the run timers.
pub const TIMERS_FILENAME: &str = "timers.json";

/// Env var overriding the data directory.
pub const DATA_DIR_ENV: &str = "GENPOOL_DATA_DIR";

/// Get the data directory for genpool.
///
/// `GENPOOL_DATA_DIR` wins; otherwise the platform data dir:
/// - Linux: `~/.local/share/genpool`
/// - macOS: `~/Library/Application Support/genpool`
pub fn get_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.is_empty()
    {
        return expand_tilde(dir);
    }
    dirs::data_dir()
        .map(|d| d.join("genpool"))
        .unwrap_or_else(|| PathBuf::from(".genpool"))
}

/// Path of the run timers file.
pub fn get_timers_path() -> PathBuf {
    get_data_dir().join(TIMERS_FILENAME)
}

/// Expands a leading `~` in a path to the user's home directory.
///
/// Shell expansion does not happen for `--arg=~/path`.
pub fn expand_tilde<P: AsRef<Path>>(path: P) -> PathBuf {
    let path = path.as_ref();
    if let Ok(stripped) = path.strip_prefix("~")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(stripped);
    }
    path.to_path_buf()
}

/// Create `dir` and any missing parents.
pub fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial(env)]
    fn test_data_dir_env_override() {
        let dir = tempfile::tempdir().unwrap();
        // Safety: serialized with every other test touching the environment.
        unsafe { std::env::set_var(DATA_DIR_ENV, dir.path()) };
        assert_eq!(get_data_dir(), dir.path());
        assert_eq!(get_timers_path(), dir.path().join("timers.json"));
        unsafe { std::env::remove_var(DATA_DIR_ENV) };

        let name = get_data_dir().file_name().unwrap().to_str().unwrap().to_string();
        assert!(name == "genpool" || name == ".genpool");
    }

    #[test]
    fn test_expand_tilde() {
        let expanded = expand_tilde("~/Documents/test");
        assert!(!expanded.to_str().unwrap().starts_with('~'));
        assert!(expanded.to_str().unwrap().ends_with("Documents/test"));

        assert_eq!(expand_tilde("/tmp/foo"), PathBuf::from("/tmp/foo"));
        assert_eq!(expand_tilde("./rel"), PathBuf::from("./rel"));
    }

    #[test]
    fn test_ensure_dir_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir(&nested).unwrap();
        assert!(nested.is_dir());
        ensure_dir(&nested).unwrap();
    }
}
