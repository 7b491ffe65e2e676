//! Where the imapsync binary and the per-job logs live.

use std::path::{Path, PathBuf};

pub const BINARY_NAME: &str = if cfg!(windows) {
    "imapsync.exe"
} else {
    "imapsync"
};

/// Pick the imapsync executable: an explicit path wins, then `PATH`, then a copy
/// shipped next to our own executable. Falls back to the bare name, which the
/// runner reports as not found when a job starts.
pub fn resolve_binary(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(found) = std::env::var_os("PATH")
        .and_then(|paths| find_in(std::env::split_paths(&paths), BINARY_NAME))
    {
        return found;
    }
    if let Some(bundled) = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(BINARY_NAME)))
        .filter(|p| p.is_file())
    {
        return bundled;
    }
    PathBuf::from(BINARY_NAME)
}

fn find_in(dirs: impl IntoIterator<Item = PathBuf>, name: &str) -> Option<PathBuf> {
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Log directory: explicit, else the platform data dir.
pub fn resolve_log_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("imapsync-runner")
        .join("logs")
}
