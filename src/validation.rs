//! Public-API argument validation.
//!
//! Everything here runs before the core does: invalid arguments surface as
//! explicit `Err` values from constructors and setters instead of failing
//! somewhere inside a transfer.

use std::path::{Component, Path};

use tracing::warn;

use crate::error::{Result, TftpError};
use crate::path::check_filename;

pub const MAX_PATH_LEN: usize = 4096;
pub const MAX_HOSTNAME_LEN: usize = 253;
pub const MIN_TIMEOUT_SECS: u64 = 1;
pub const MAX_TIMEOUT_SECS: u64 = 3600;
pub const MIN_TRANSFER_SIZE: usize = 512;
pub const MAX_TRANSFER_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB

/// Validate the served root directory string.
pub fn validate_root_dir(root_dir: &str) -> Result<()> {
    if root_dir.is_empty() {
        return Err(TftpError::Validation("root_dir must not be empty".to_string()));
    }
    if root_dir.len() > MAX_PATH_LEN {
        return Err(TftpError::Validation(format!(
            "root_dir too long: {} > {}",
            root_dir.len(),
            MAX_PATH_LEN
        )));
    }
    if root_dir.bytes().any(|b| b == 0) {
        return Err(TftpError::Validation(
            "root_dir contains null bytes".to_string(),
        ));
    }
    if normalized_has_parent_component(Path::new(root_dir)) {
        return Err(TftpError::Validation(
            "root_dir contains a parent-directory component".to_string(),
        ));
    }
    Ok(())
}

/// True when a `..` component survives lexical normalization, i.e. the path
/// climbs above its own start.
fn normalized_has_parent_component(path: &Path) -> bool {
    let mut depth: i64 = 0;
    for component in path.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    false
}

/// Validate a server port. Privileged ports are allowed with a warning.
pub fn validate_port(port: u16) -> Result<()> {
    if port == 0 {
        return Err(TftpError::Validation("port must not be 0".to_string()));
    }
    if port < 1024 {
        warn!(port, "binding a privileged port");
    }
    Ok(())
}

/// Validate the per-block timeout in seconds.
pub fn validate_timeout(timeout_seconds: u64) -> Result<()> {
    if !(MIN_TIMEOUT_SECS..=MAX_TIMEOUT_SECS).contains(&timeout_seconds) {
        return Err(TftpError::Validation(format!(
            "timeout {} outside {}..={} seconds",
            timeout_seconds, MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS
        )));
    }
    Ok(())
}

/// Validate the per-transfer payload cap.
pub fn validate_transfer_size(size: usize) -> Result<()> {
    if !(MIN_TRANSFER_SIZE..=MAX_TRANSFER_SIZE).contains(&size) {
        return Err(TftpError::Validation(format!(
            "transfer size {} outside {}..={} bytes",
            size, MIN_TRANSFER_SIZE, MAX_TRANSFER_SIZE
        )));
    }
    Ok(())
}

/// Validate a host string: IPv4 dotted-quad or a DNS-label hostname.
pub fn validate_host(host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(TftpError::Validation("host must not be empty".to_string()));
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(TftpError::Validation(format!(
            "host too long: {} > {}",
            host.len(),
            MAX_HOSTNAME_LEN
        )));
    }
    if host.bytes().any(|b| b == 0) {
        return Err(TftpError::Validation("host contains null bytes".to_string()));
    }

    if looks_like_ipv4(host) {
        return validate_ipv4(host);
    }
    validate_hostname(host)
}

fn looks_like_ipv4(host: &str) -> bool {
    host.split('.').count() == 4
        && host.chars().all(|c| c.is_ascii_digit() || c == '.')
}

fn validate_ipv4(host: &str) -> Result<()> {
    for octet in host.split('.') {
        if octet.is_empty() || octet.len() > 3 {
            return Err(TftpError::Validation(format!("invalid IPv4 address: {}", host)));
        }
        let value: u32 = octet
            .parse()
            .map_err(|_| TftpError::Validation(format!("invalid IPv4 address: {}", host)))?;
        if value > 255 {
            return Err(TftpError::Validation(format!(
                "IPv4 octet out of range in {}",
                host
            )));
        }
    }
    Ok(())
}

fn validate_hostname(host: &str) -> Result<()> {
    for label in host.split('.') {
        let bytes = label.as_bytes();
        let valid = !bytes.is_empty()
            && bytes.len() <= 63
            && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
            && bytes[0] != b'-'
            && bytes[bytes.len() - 1] != b'-';
        if !valid {
            return Err(TftpError::Validation(format!("invalid hostname: {}", host)));
        }
    }
    Ok(())
}

/// Validate a client-facing filename (the lexical rules of the path safety
/// layer, without the filesystem containment check).
pub fn validate_filename(filename: &str) -> Result<()> {
    check_filename(filename).map_err(|reason| TftpError::Validation(reason.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_dir_rules() {
        assert!(validate_root_dir("/srv/tftp").is_ok());
        assert!(validate_root_dir("relative/dir").is_ok());
        assert!(validate_root_dir("").is_err());
        // `..` components that stay below the start normalize away
        assert!(validate_root_dir("/srv/../etc").is_ok());
        assert!(validate_root_dir("a/b/../c").is_ok());
        // climbing above the start does not
        assert!(validate_root_dir("../escape").is_err());
        assert!(validate_root_dir("a/../../escape").is_err());
        assert!(validate_root_dir(&"a".repeat(MAX_PATH_LEN + 1)).is_err());
        assert!(validate_root_dir("bad\0dir").is_err());
    }

    #[test]
    fn port_rules() {
        assert!(validate_port(0).is_err());
        assert!(validate_port(69).is_ok()); // warns, does not reject
        assert!(validate_port(1024).is_ok());
        assert!(validate_port(65535).is_ok());
    }

    #[test]
    fn timeout_rules() {
        assert!(validate_timeout(0).is_err());
        assert!(validate_timeout(1).is_ok());
        assert!(validate_timeout(3600).is_ok());
        assert!(validate_timeout(3601).is_err());
    }

    #[test]
    fn transfer_size_rules() {
        assert!(validate_transfer_size(511).is_err());
        assert!(validate_transfer_size(512).is_ok());
        assert!(validate_transfer_size(MAX_TRANSFER_SIZE).is_ok());
        assert!(validate_transfer_size(MAX_TRANSFER_SIZE + 1).is_err());
    }

    #[test]
    fn ipv4_hosts() {
        assert!(validate_host("127.0.0.1").is_ok());
        assert!(validate_host("255.255.255.255").is_ok());
        assert!(validate_host("256.0.0.1").is_err());
        assert!(validate_host("1.2.3.400").is_err());
        assert!(validate_host("1..2.3").is_err());
        // fewer or more than four all-numeric labels fall through to the
        // hostname rules, where numeric labels are legal
        assert!(validate_host("1.2.3").is_ok());
        assert!(validate_host("1.2.3.4.5").is_ok());
    }

    #[test]
    fn hostname_hosts() {
        assert!(validate_host("localhost").is_ok());
        assert!(validate_host("tftp-01.example.com").is_ok());
        assert!(validate_host("-bad.example.com").is_err());
        assert!(validate_host("bad-.example.com").is_err());
        assert!(validate_host("under_score.example.com").is_err());
        assert!(validate_host("").is_err());
        assert!(validate_host(&"a".repeat(MAX_HOSTNAME_LEN + 1)).is_err());
    }

    #[test]
    fn filename_rules_match_path_layer() {
        assert!(validate_filename("ok.txt").is_ok());
        assert!(validate_filename("../nope").is_err());
        assert!(validate_filename("/abs").is_err());
        assert!(validate_filename("with\0null").is_err());
        assert!(validate_filename("glob*").is_err());
    }
}
