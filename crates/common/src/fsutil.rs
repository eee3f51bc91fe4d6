// Atomic file replacement and private permissions for state and SSH config files

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Ensure a directory exists with owner-only permissions (0700)
pub fn ensure_private_dir(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
        debug!("Created directory: {}", path.display());

        #[cfg(unix)]
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// Set file permissions to 0600 (owner read/write only)
pub fn set_file_permissions_private(path: &Path) -> std::io::Result<()> {
    #[cfg(unix)]
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// New file contents written next to the target but not yet visible
///
/// Dropping a staged write without calling [`StagedWrite::commit`] removes
/// the temp file and leaves the target untouched.
#[derive(Debug)]
pub struct StagedWrite {
    temp: NamedTempFile,
    target: PathBuf,
}

impl StagedWrite {
    /// Write `contents` to a temp file in the target's directory
    pub fn stage(target: &Path, contents: &[u8]) -> std::io::Result<Self> {
        let dir = match target.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        ensure_private_dir(&dir)?;

        let mut temp = NamedTempFile::new_in(&dir)?;
        temp.write_all(contents)?;
        temp.as_file().sync_all()?;
        set_file_permissions_private(temp.path())?;

        Ok(Self {
            temp,
            target: target.to_path_buf(),
        })
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically replace the target with the staged contents
    pub fn commit(self) -> std::io::Result<()> {
        let target = self.target;
        self.temp.persist(&target).map_err(|e| e.error)?;
        debug!("Replaced {}", target.display());
        Ok(())
    }
}

/// Write a file atomically with 0600 permissions
pub fn write_atomic(target: &Path, contents: &[u8]) -> std::io::Result<()> {
    StagedWrite::stage(target, contents)?.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_creates_parent_and_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.toml");

        write_atomic(&path, b"hello").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");

        #[cfg(unix)]
        {
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode();
            assert_eq!(dir_mode & 0o777, 0o700);
        }
    }

    #[test]
    fn test_uncommitted_stage_leaves_target_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config");
        write_atomic(&path, b"original").unwrap();

        let staged = StagedWrite::stage(&path, b"replacement").unwrap();
        drop(staged);

        assert_eq!(fs::read_to_string(&path).unwrap(), "original");
        // Only the target remains in the directory
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }
}
