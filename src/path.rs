//! Path safety layer.
//!
//! Every client-supplied filename passes a cheap lexical pre-filter and then
//! a canonicalization-based containment check before the storage layer may
//! touch it. The containment check is the definitive barrier: it catches
//! anything symlinks or encoding smuggle past the lexical pass. All failures
//! are fail-closed.

use std::io;
use std::path::{Component, Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, TftpError};
use crate::MAX_FILENAME_LEN;

/// Substrings that never appear in a legitimate relative request.
const FORBIDDEN_SEQUENCES: [&str; 5] = ["..", "./", ".\\", "/.", "\\."];

/// Characters with shell or glob meaning that have no place in a filename
/// served over TFTP.
const FORBIDDEN_CHARS: [char; 8] = ['<', '>', '|', '?', '*', '~', '$', '%'];

/// Lexical filename rules, shared with the public-API validation layer.
///
/// Checks (in order): non-empty and at most 255 bytes; no NUL or ASCII
/// control bytes; no traversal-shaped substrings or shell-special characters;
/// not absolute in any platform notation (leading separator, drive letter,
/// UNC or double-slash prefix).
pub(crate) fn check_filename(filename: &str) -> std::result::Result<(), &'static str> {
    if filename.is_empty() {
        return Err("filename is empty");
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err("filename too long");
    }
    if filename
        .bytes()
        .any(|b| b == 0 || (0x01..=0x1f).contains(&b) || b == 0x7f)
    {
        return Err("filename contains control characters");
    }
    for seq in FORBIDDEN_SEQUENCES {
        if filename.contains(seq) {
            return Err("filename contains path traversal sequence");
        }
    }
    if filename.contains(FORBIDDEN_CHARS) {
        return Err("filename contains forbidden characters");
    }
    let bytes = filename.as_bytes();
    if bytes[0] == b'/' || bytes[0] == b'\\' {
        return Err("absolute paths are not allowed");
    }
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err("drive letters are not allowed");
    }
    if filename.starts_with("\\\\") || filename.starts_with("//") {
        return Err("UNC paths are not allowed");
    }
    Ok(())
}

/// Canonicalize a path that may not fully exist yet.
///
/// The longest existing ancestor is resolved through the filesystem (symlinks
/// included); the non-existent remainder is appended as-is. Errors if no
/// ancestor exists or a remainder component is not a plain name.
fn weakly_canonicalize(path: &Path) -> io::Result<PathBuf> {
    if let Ok(resolved) = std::fs::canonicalize(path) {
        return Ok(resolved);
    }

    let mut current = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        let Some(name) = current.file_name() else {
            // `..`/`.` endings never reach here from request handling; the
            // lexical filter rejects them. Fail closed regardless.
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "path component is not a plain name",
            ));
        };
        tail.push(name.to_os_string());
        let Some(parent) = current.parent() else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no existing ancestor to canonicalize",
            ));
        };
        if parent.as_os_str().is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "no existing ancestor to canonicalize",
            ));
        }
        if let Ok(resolved) = std::fs::canonicalize(parent) {
            let mut out = resolved;
            for part in tail.iter().rev() {
                out.push(part);
            }
            return Ok(out);
        }
        current = parent.to_path_buf();
    }
}

fn absolute_root(root: &Path) -> io::Result<PathBuf> {
    if root.as_os_str().is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty root"));
    }
    if root.is_absolute() {
        Ok(root.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(root))
    }
}

/// Resolve a requested filename against the root, enforcing containment.
///
/// Returns the canonical target path, or an error when the request is
/// lexically unsafe, escapes the root after canonicalization, or any
/// canonicalization step fails.
pub fn resolve_secure(root: &Path, requested: &str) -> Result<PathBuf> {
    if let Err(reason) = check_filename(requested) {
        debug!(requested, reason, "filename rejected by lexical filter");
        return Err(TftpError::Tftp(reason.to_string()));
    }

    // The root must exist; only the target may be partially nonexistent.
    let canonical_root = std::fs::canonicalize(absolute_root(root).map_err(TftpError::Io)?)
        .map_err(|e| TftpError::Tftp(format!("root directory error: {}", e)))?;
    let canonical_target = weakly_canonicalize(&canonical_root.join(requested))
        .map_err(|e| TftpError::Tftp(format!("path resolution error: {}", e)))?;

    let relative = canonical_target.strip_prefix(&canonical_root).map_err(|_| {
        warn!(
            requested,
            target = %canonical_target.display(),
            "request escapes the served root"
        );
        TftpError::Tftp("access outside root directory".to_string())
    })?;
    if relative.as_os_str().is_empty() {
        return Err(TftpError::Tftp("request resolves to the root itself".to_string()));
    }
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(TftpError::Tftp("access outside root directory".to_string()));
    }

    Ok(canonical_target)
}

/// Resolve a requested filename without the containment check (secure mode
/// disabled). Leading separators are still stripped so the result stays a
/// join against the root.
pub fn resolve_unchecked(root: &Path, requested: &str) -> PathBuf {
    root.join(requested.trim_start_matches(['/', '\\']))
}

/// True only if the requested filename passes both the lexical filter and
/// the canonical containment check against `root`.
pub fn is_path_secure(requested: &str, root: &Path) -> bool {
    resolve_secure(root, requested).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hi").unwrap();
        std::fs::write(dir.path().join("sub/nested.bin"), b"data").unwrap();
        dir
    }

    #[test]
    fn accepts_plain_and_nested_names() {
        let dir = root();
        assert!(is_path_secure("hello.txt", dir.path()));
        assert!(is_path_secure("sub/nested.bin", dir.path()));
        // Targets that do not exist yet (WRQ) are still resolvable
        assert!(is_path_secure("new-file.bin", dir.path()));
        assert!(is_path_secure("sub/new.bin", dir.path()));
    }

    #[test]
    fn rejects_traversal() {
        let dir = root();
        for name in [
            "../secret",
            "..",
            "a/../b",
            "sub/../../etc/passwd",
            "./hello.txt",
            ".\\hello.txt",
            "a/./b",
            "a\\.\\b",
        ] {
            assert!(!is_path_secure(name, dir.path()), "{} should be rejected", name);
        }
    }

    #[test]
    fn rejects_absolute_forms() {
        let dir = root();
        for name in ["/etc/passwd", "\\windows\\system32", "C:file", "c:\\boot.ini", "//share/x", "\\\\server\\share"] {
            assert!(!is_path_secure(name, dir.path()), "{} should be rejected", name);
        }
    }

    #[test]
    fn rejects_control_and_special_characters() {
        let dir = root();
        for name in [
            "file\0name",
            "file\nname",
            "file\x1fname",
            "file\x7fname",
            "a<b",
            "a>b",
            "a|b",
            "a?b",
            "a*b",
            "~root",
            "$HOME",
            "100%done",
        ] {
            assert!(!is_path_secure(name, dir.path()), "{:?} should be rejected", name);
        }
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        let dir = root();
        assert!(!is_path_secure("", dir.path()));
        assert!(is_path_secure(&"a".repeat(MAX_FILENAME_LEN), dir.path()));
        assert!(!is_path_secure(&"a".repeat(MAX_FILENAME_LEN + 1), dir.path()));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_escape() {
        let dir = root();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s3cret").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("exit")).unwrap();

        // Lexically clean, but canonicalization walks through the symlink
        // and lands outside the root.
        assert!(!is_path_secure("exit/secret", dir.path()));
        // The containment theorem: whenever the check passes, the canonical
        // target stays under the canonical root.
        let resolved = resolve_secure(dir.path(), "hello.txt").unwrap();
        let canonical_root = std::fs::canonicalize(dir.path()).unwrap();
        assert!(resolved.starts_with(&canonical_root));
    }

    #[test]
    fn resolves_to_canonical_target() {
        let dir = root();
        let resolved = resolve_secure(dir.path(), "sub/nested.bin").unwrap();
        assert_eq!(resolved, std::fs::canonicalize(dir.path().join("sub/nested.bin")).unwrap());
    }

    #[test]
    fn fails_closed_when_root_is_missing() {
        assert!(!is_path_secure("file", Path::new("/nonexistent/kestrel-tftp-root")));
    }

    #[test]
    fn unchecked_resolution_strips_leading_separators() {
        assert_eq!(
            resolve_unchecked(Path::new("/srv/tftp"), "/boot/img"),
            PathBuf::from("/srv/tftp/boot/img")
        );
    }
}
