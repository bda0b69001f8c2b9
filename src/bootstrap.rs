//! Bootstrap env file for the signing service.
//!
//! Database selection (`DATABASE_*`, `LIBSQL_*`) has to be known before
//! anything else can start, so it lives in a dotenv file rather than in the
//! database itself.
//!
//! File: `~/.moltnet/.env` (standard dotenvy format)

use std::path::{Path, PathBuf};

/// Path to the service `.env` file: `~/.moltnet/.env`.
pub fn moltnet_env_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".moltnet")
        .join(".env")
}

/// Load env vars from `~/.moltnet/.env`.
///
/// Call this **after** `dotenvy::dotenv()` so that `./.env` takes priority.
/// dotenvy never overwrites existing env vars.
pub fn load_moltnet_env() {
    let path = moltnet_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        tracing::warn!("Failed to load {}: {}", path.display(), e);
    }
}

/// Write bootstrap vars to `~/.moltnet/.env`, replacing the file.
pub fn save_bootstrap_env(vars: &[(&str, &str)]) -> std::io::Result<()> {
    write_env_file(&moltnet_env_path(), vars)
}

/// Write `vars` as a dotenv file at `path`, creating parent directories.
///
/// Values are double-quoted so that `#` (common in URL-encoded passwords)
/// survives dotenvy's comment handling.
pub fn write_env_file(path: &Path, vars: &[(&str, &str)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    for (key, value) in vars {
        // Escaped so a value cannot close its quotes and start another var.
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        content.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    std::fs::write(path, content)
}
