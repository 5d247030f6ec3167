//! Default socket location for the daemon.

use std::path::PathBuf;

/// `$XDG_RUNTIME_DIR/codegraphd.sock`, falling back to the system temp dir.
pub fn default_socket_path() -> String {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(std::env::temp_dir);
    base.join("codegraphd.sock").to_string_lossy().to_string()
}

/// Remove a stale socket file; missing files are fine.
pub fn remove_socket_file(path: &str) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
