//! Bootstrap env loading for authbridge.
//!
//! Env vars are read before any config file so that `AUTHBRIDGE_CONFIG`
//! itself can come from a `.env` file.
//!
//! File: `~/.authbridge/.env` (standard dotenvy format)

use std::path::PathBuf;
use std::sync::Once;

static LOAD_ENV: Once = Once::new();

/// Path to the authbridge-specific `.env` file: `~/.authbridge/.env`.
pub fn bridge_env_path() -> PathBuf {
    crate::config::authbridge_home().join(".env")
}

/// Load `./.env`, then `~/.authbridge/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.authbridge/.env`
///
/// Runs once per process; later calls are no-ops.
pub fn load_bridge_env() {
    LOAD_ENV.call_once(|| {
        match dotenvy::dotenv() {
            Ok(path) => tracing::debug!("Loaded env from {}", path.display()),
            Err(e) if e.not_found() => {}
            Err(e) => eprintln!("Warning: failed to load ./.env: {}", e),
        }

        let path = bridge_env_path();
        if path.exists()
            && let Err(e) = dotenvy::from_path(&path)
        {
            eprintln!("Warning: failed to load {}: {}", path.display(), e);
        }
    });
}
