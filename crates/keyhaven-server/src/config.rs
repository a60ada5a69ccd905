//! Daemon configuration: an optional JSON file overlaid by command-line flags.

use std::path::{Path, PathBuf};

use keyhaven_core::KeysConfig;
use serde::Deserialize;

use crate::ServerError;

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub socket_path: PathBuf,
    pub keys: KeysConfig,
}

/// Shape of the `--config` file. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    db_path: Option<PathBuf>,
    socket_path: Option<PathBuf>,
    keys: KeysConfig,
}

/// Parse `--db`, `--socket` and `--config` (arguments without the program
/// name). Flags win over the config file; anything unset falls back to the
/// per-user defaults.
pub fn parse_args<I>(args: I) -> Result<ServerConfig, ServerError>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut db_path = None;
    let mut socket_path = None;
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--db" => db_path = Some(flag_value(&arg, args.next())?),
            "--socket" => socket_path = Some(flag_value(&arg, args.next())?),
            "--config" => config_path = Some(flag_value(&arg, args.next())?),
            other => tracing::warn!(arg = other, "ignoring unknown argument"),
        }
    }

    let file = match config_path {
        Some(path) => load_config_file(&path)?,
        None => FileConfig::default(),
    };

    Ok(ServerConfig {
        db_path: db_path
            .or(file.db_path)
            .unwrap_or_else(|| dirs_fallback("keyhaven-server/keys.db")),
        socket_path: socket_path
            .or(file.socket_path)
            .unwrap_or_else(default_socket_path),
        keys: file.keys,
    })
}

fn flag_value(flag: &str, value: Option<String>) -> Result<PathBuf, ServerError> {
    match value {
        Some(v) if !v.is_empty() => Ok(PathBuf::from(v)),
        _ => Err(ServerError::Config(format!("{flag} requires a value"))),
    }
}

fn load_config_file(path: &Path) -> Result<FileConfig, ServerError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw)
        .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))
}

fn dirs_fallback(subpath: &str) -> PathBuf {
    let base = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(format!("{base}/.local/share/{subpath}"))
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join("keyhaven-server.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn defaults_without_flags() {
        let config = parse_args(Vec::new()).unwrap();
        assert!(config.db_path.ends_with("keyhaven-server/keys.db"));
        assert_eq!(config.socket_path, default_socket_path());
        assert_eq!(config.keys, KeysConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(
            &file,
            r#"{"dbPath": "/var/lib/a.db", "socketPath": "/run/a.sock",
                "keys": {"compareSignedPreKeys": true, "preKeysRateLimit": {"bucketSize": 5}}}"#,
        )
        .unwrap();

        let config = parse_args(args(&[
            "--config",
            file.to_str().unwrap(),
            "--db",
            "/tmp/b.db",
        ]))
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/b.db"));
        assert_eq!(config.socket_path, PathBuf::from("/run/a.sock"));
        assert!(config.keys.compare_signed_pre_keys);
        assert_eq!(config.keys.pre_keys_rate_limit.bucket_size, 5);
    }

    #[test]
    fn missing_flag_value_is_an_error() {
        assert!(matches!(
            parse_args(args(&["--db"])),
            Err(ServerError::Config(_))
        ));
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("config.json");
        std::fs::write(&file, "{not json").unwrap();
        assert!(matches!(
            parse_args(args(&["--config", file.to_str().unwrap()])),
            Err(ServerError::Config(_))
        ));
    }
}
