//! Server configuration.
//!
//! Loaded from a TOML file, with every field defaulting so a minimal config
//! (or none at all) still yields a runnable server. Validation reuses the
//! same rule set the public API setters enforce.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::error::{Result, TftpError};
use crate::validation;
use crate::{DEFAULT_MAX_TRANSFER_SIZE, DEFAULT_TFTP_PORT, DEFAULT_TIMEOUT_SECS, MAX_RETRIES};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TftpConfig {
    /// Directory served to clients; all transfers stay inside it.
    pub root_dir: PathBuf,
    pub bind_addr: SocketAddr,
    /// Per-transfer payload cap in bytes (512 ..= 1 GiB).
    pub max_transfer_size: usize,
    /// Per-block receive timeout in seconds (1 ..= 3600).
    pub timeout_seconds: u64,
    pub max_retries: u32,
    /// Session worker count; 0 selects the hardware parallelism.
    pub worker_count: usize,
    /// Path-safety containment check for client filenames (default: on).
    pub secure_mode: bool,
    pub logging: LoggingConfig,
}

impl Default for TftpConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/srv/tftp"),
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_TFTP_PORT),
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            max_retries: MAX_RETRIES,
            worker_count: 0,
            secure_mode: true,
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
    /// Emit structured audit events for security-relevant operations.
    pub audit_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            file: None,
            audit_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Plain text logging for human readability
    Text,
    /// JSON structured logging for log aggregators
    Json,
}

pub fn load_config(path: &std::path::Path) -> Result<TftpConfig> {
    let contents = std::fs::read_to_string(path)?;
    let config: TftpConfig = toml::from_str(&contents)
        .map_err(|e| TftpError::Tftp(format!("Invalid config file {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn write_config(path: &std::path::Path, config: &TftpConfig) -> Result<()> {
    let contents = toml::to_string_pretty(config)
        .map_err(|e| TftpError::Tftp(format!("Failed to serialize config: {}", e)))?;
    std::fs::write(path, contents)?;
    Ok(())
}

/// Validate a configuration before the server starts.
pub fn validate_config(config: &TftpConfig) -> Result<()> {
    let root_str = config.root_dir.to_string_lossy();
    validation::validate_root_dir(&root_str)?;

    match std::fs::metadata(&config.root_dir) {
        Ok(meta) => {
            if !meta.is_dir() {
                return Err(TftpError::Validation(
                    "root_dir must be a directory".to_string(),
                ));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TftpError::Validation(
                "root_dir does not exist; create it or adjust config".to_string(),
            ));
        }
        Err(e) => return Err(TftpError::Io(e)),
    }

    validation::validate_port(config.bind_addr.port())?;
    validation::validate_timeout(config.timeout_seconds)?;
    validation::validate_transfer_size(config.max_transfer_size)?;

    if config.max_retries == 0 {
        return Err(TftpError::Validation("max_retries must be at least 1".to_string()));
    }
    if config.worker_count > 64 {
        return Err(TftpError::Validation(
            "worker_count must be 0 (auto) or at most 64".to_string(),
        ));
    }

    if let Some(ref log_file) = config.logging.file {
        let parent = log_file.parent().ok_or_else(|| {
            TftpError::Validation("logging.file must include a parent directory".to_string())
        })?;
        match std::fs::metadata(parent) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(TftpError::Validation(
                    "logging.file parent must be a directory".to_string(),
                ));
            }
            Err(e) => {
                return Err(TftpError::Validation(format!(
                    "logging.file parent error: {}",
                    e
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_root(root: &std::path::Path) -> TftpConfig {
        TftpConfig {
            root_dir: root.to_path_buf(),
            bind_addr: "127.0.0.1:6969".parse().unwrap(),
            ..TftpConfig::default()
        }
    }

    #[test]
    fn parses_minimal_toml() {
        let dir = tempfile::tempdir().unwrap();
        let toml = format!(
            r#"
root_dir = "{}"
bind_addr = "127.0.0.1:6969"

[logging]
level = "debug"
format = "json"
"#,
            dir.path().display()
        );
        let config: TftpConfig = toml::from_str(&toml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.timeout_seconds, DEFAULT_TIMEOUT_SECS);
        validate_config(&config).unwrap();
    }

    #[test]
    fn round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tftp.toml");
        let config = config_with_root(dir.path());
        write_config(&path, &config).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(loaded.root_dir, config.root_dir);
        assert_eq!(loaded.bind_addr, config.bind_addr);
        assert_eq!(loaded.secure_mode, config.secure_mode);
    }

    #[test]
    fn rejects_missing_root_dir() {
        let config = config_with_root(std::path::Path::new("/nonexistent/kestrel-tftp"));
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{err}").contains("root_dir does not exist"));
    }

    #[test]
    fn rejects_file_as_root_dir() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let config = config_with_root(&file);
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{err}").contains("must be a directory"));
    }

    #[test]
    fn rejects_zero_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_root(dir.path());
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_out_of_range_limits() {
        let dir = tempfile::tempdir().unwrap();

        let mut config = config_with_root(dir.path());
        config.timeout_seconds = 0;
        assert!(validate_config(&config).is_err());

        let mut config = config_with_root(dir.path());
        config.max_transfer_size = 100;
        assert!(validate_config(&config).is_err());

        let mut config = config_with_root(dir.path());
        config.max_retries = 0;
        assert!(validate_config(&config).is_err());

        let mut config = config_with_root(dir.path());
        config.worker_count = 65;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_logging_file_with_missing_parent() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_with_root(dir.path());
        config.logging.file = Some(PathBuf::from("/nonexistent/kestrel/log.json"));
        let err = validate_config(&config).unwrap_err();
        assert!(format!("{err}").contains("logging.file parent"));
    }
}
