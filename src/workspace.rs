use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{trace, warn};

const PREFIX: &str = "judger_";

/// Private scratch directory of one judge request.
///
/// Created with mode 0700 and removed recursively when dropped. The program
/// under test runs inside it with the judge's uid, so directory permissions
/// are restored before removal.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Creates a workspace under the system temp directory.
    pub fn create() -> Result<Self> {
        Self::create_in(std::env::temp_dir())
    }

    pub fn create_in(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let dir = tempfile::Builder::new()
            .prefix(PREFIX)
            .tempdir_in(root)
            .with_context(|| format!("failed to create workspace in {}", root.display()))?;
        trace!(path = ?dir.path(), "workspace created");
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Removes the directory now, reporting failure instead of ignoring it.
    pub fn close(self) -> io::Result<()> {
        let path = self.dir.path().to_owned();
        make_removable(&path);
        let ret = fs::remove_dir_all(&path);
        match ret {
            Ok(()) => trace!(?path, "workspace removed"),
            Err(ref err) => warn!(?path, %err, "failed to remove workspace"),
        }
        ret
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        // `TempDir` removes the tree right after this
        make_removable(self.dir.path());
    }
}

/// Gives the owner `rwx` on `dir` and every directory below it, without
/// following symlinks.
fn make_removable(dir: &Path) {
    if fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).is_err() {
        return;
    }
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        if entry.file_type().map_or(false, |t| t.is_dir()) {
            make_removable(&entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_and_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create_in(root.path()).unwrap();
        let path = ws.path().to_owned();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert!(path.file_name().unwrap().to_string_lossy().starts_with(PREFIX));

        fs::write(ws.file("out.txt"), b"x").unwrap();
        drop(ws);
        assert!(!path.exists());
    }

    #[test]
    fn close_removes_contents() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create_in(root.path()).unwrap();
        fs::create_dir(ws.file("sub")).unwrap();
        fs::write(ws.file("sub/a"), b"a").unwrap();
        let path = ws.path().to_owned();
        ws.close().unwrap();
        assert!(!path.exists());
    }

    fn lock_subtree(ws: &Workspace) {
        fs::create_dir_all(ws.file("d/e")).unwrap();
        fs::write(ws.file("d/e/f"), b"f").unwrap();
        fs::set_permissions(ws.file("d/e"), fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(ws.file("d"), fs::Permissions::from_mode(0o000)).unwrap();
        fs::set_permissions(ws.path(), fs::Permissions::from_mode(0o500)).unwrap();
    }

    #[test]
    fn close_restores_permissions() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create_in(root.path()).unwrap();
        lock_subtree(&ws);
        let path = ws.path().to_owned();
        ws.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn drop_restores_permissions() {
        let root = tempfile::tempdir().unwrap();
        let ws = Workspace::create_in(root.path()).unwrap();
        lock_subtree(&ws);
        let path = ws.path().to_owned();
        drop(ws);
        assert!(!path.exists());
    }
}
