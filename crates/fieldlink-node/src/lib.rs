//! Fieldlink Node -- library crate for the offline-first coordination node.
//!
//! Re-exports the internal modules so integration tests and main.rs can
//! wire the same tasks: connectivity monitor, mesh link, merge loop,
//! geocode queue, dispatch timers and the local API.

pub mod config;
pub mod connectivity;
pub mod geocode;
pub mod ingest;
pub mod mesh_task;
pub mod node;
pub mod notify;
pub mod remote;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

pub fn load_or_create_token(path: &PathBuf) -> anyhow::Result<String> {
    if path.exists() {
        let token = std::fs::read_to_string(path)?.trim().to_string();
        return Ok(token);
    }

    use rand::Rng;
    let token: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(48)
        .map(char::from)
        .collect();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, &token)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!(path = %path.display(), "generated bearer token");
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        std::env::set_var("HOME", "/home/worker");
        assert_eq!(
            expand_tilde("~/.fieldlink/config.toml"),
            PathBuf::from("/home/worker/.fieldlink/config.toml")
        );
        assert_eq!(expand_tilde("/etc/fieldlink.toml"), PathBuf::from("/etc/fieldlink.toml"));
    }

    #[test]
    fn test_token_created_once_then_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node-token");

        let first = load_or_create_token(&path).unwrap();
        assert_eq!(first.len(), 48);

        let second = load_or_create_token(&path).unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
