//! Zip artifact extraction.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{LifecycleError, Result};

/// Entries packed by macOS Finder that are never part of an artifact.
const IGNORED_ROOTS: &[&str] = &["__MACOSX"];

pub fn is_zip_filename(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".zip")
}

/// Extract `bytes` into `dest` on the blocking pool.
pub async fn extract(bytes: Vec<u8>, dest: PathBuf) -> Result<usize> {
    tokio::task::spawn_blocking(move || extract_sync(&bytes, &dest))
        .await
        .map_err(|e| LifecycleError::Internal(format!("extract task failed: {e}")))?
}

/// Unpack a zip archive into `dest` and return the number of files written.
///
/// Entries whose path would land outside `dest` reject the whole archive.
/// If everything sits under one top-level folder, that folder is hoisted
/// so its contents become the artifact root.
pub fn extract_sync(bytes: &[u8], dest: &Path) -> Result<usize> {
    let mut archive = zip::ZipArchive::new(io::Cursor::new(bytes))
        .map_err(|e| LifecycleError::InvalidInput(format!("Invalid zip archive: {e}")))?;
    fs::create_dir_all(dest)?;

    let mut files = 0;
    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| LifecycleError::InvalidInput(format!("Invalid zip archive: {e}")))?;
        let Some(relative) = entry.enclosed_name() else {
            return Err(LifecycleError::InvalidInput(format!(
                "Archive entry escapes the target directory: {}",
                entry.name()
            )));
        };
        if is_ignored(&relative) {
            continue;
        }

        let out = dest.join(&relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&out)?;
        io::copy(&mut entry, &mut file)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out, fs::Permissions::from_mode((mode & 0o777) | 0o600))?;
            }
        }
        files += 1;
    }

    if files == 0 {
        return Err(LifecycleError::InvalidInput("Archive is empty".to_string()));
    }
    hoist_single_root(dest)?;
    debug!(dest = %dest.display(), files, "archive extracted");
    Ok(files)
}

fn is_ignored(relative: &Path) -> bool {
    relative
        .components()
        .next()
        .and_then(|c| c.as_os_str().to_str())
        .is_some_and(|root| IGNORED_ROOTS.contains(&root))
}

/// `dest/<wrapper>/{...}` becomes `dest/{...}` when `wrapper` is the only
/// entry in `dest`.
fn hoist_single_root(dest: &Path) -> io::Result<()> {
    let entries = fs::read_dir(dest)?.collect::<io::Result<Vec<_>>>()?;
    let [only] = entries.as_slice() else {
        return Ok(());
    };
    if !only.file_type()?.is_dir() {
        return Ok(());
    }

    // Move aside first: the wrapper may contain a child with its own name.
    let wrapper = dest.join(".hoist");
    fs::rename(only.path(), &wrapper)?;
    for child in fs::read_dir(&wrapper)? {
        let child = child?;
        fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    fs::remove_dir(&wrapper)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    /// Build a zip in memory from `(path, contents)` pairs.
    fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buf = io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            for (name, contents) in entries {
                zip.start_file(*name, SimpleFileOptions::default()).unwrap();
                zip.write_all(contents.as_bytes()).unwrap();
            }
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn zip_filename_check() {
        assert!(is_zip_filename("etl.zip"));
        assert!(is_zip_filename("ETL.ZIP"));
        assert!(!is_zip_filename("etl.tar.gz"));
        assert!(!is_zip_filename("zip"));
    }

    #[test]
    fn extracts_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_of(&[("main.py", "print(1)"), ("tests/test_main.py", "")]);
        let n = extract_sync(&bytes, dir.path()).unwrap();
        assert_eq!(n, 2);
        assert_eq!(
            fs::read_to_string(dir.path().join("main.py")).unwrap(),
            "print(1)"
        );
        assert!(dir.path().join("tests/test_main.py").is_file());
    }

    #[test]
    fn hoists_single_wrapper_folder() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_of(&[
            ("etl/main.py", ""),
            ("etl/etl/helpers.py", ""),
            ("__MACOSX/etl/._main.py", ""),
        ]);
        extract_sync(&bytes, dir.path()).unwrap();
        assert!(dir.path().join("main.py").is_file());
        assert!(dir.path().join("etl/helpers.py").is_file());
        assert!(!dir.path().join("__MACOSX").exists());
        assert!(!dir.path().join(".hoist").exists());
    }

    #[test]
    fn rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_of(&[("main.py", ""), ("../escape.py", "")]);
        let err = extract_sync(&bytes, &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidInput(_)));
        assert!(!dir.path().join("escape.py").exists());
    }

    #[test]
    fn rejects_garbage_and_empty_archives() {
        let dir = tempfile::tempdir().unwrap();
        let err = extract_sync(b"definitely not a zip", dir.path()).unwrap_err();
        assert!(err.to_string().starts_with("Invalid zip archive"));

        let err = extract_sync(&zip_of(&[]), dir.path()).unwrap_err();
        assert_eq!(err.to_string(), "Archive is empty");
    }
}
