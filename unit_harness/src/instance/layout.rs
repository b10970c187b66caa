//! Instance – on-disk layout
//! =========================
//!
//! ```text
//! $TMPDIR/unit-harness-<uuid>/
//!   ├── control.unit.sock   control API (created by the server)
//!   ├── state/              persistent config store
//!   ├── unit.pid            main process pid
//!   ├── unit.log            diagnostic stream
//!   └── …                   per-test artefacts, purged at teardown
//! ```
//!
//! Directories are opened up to mode 0777 so a server running application
//! processes as another user can still traverse them.

use std::{
    os::unix::fs::{FileTypeExt, PermissionsExt},
    path::{Path, PathBuf},
    time::Duration,
};

use super::*;
use crate::{
    error::{HarnessError, HarnessResult},
    ipc::ControlAddr,
    log::LOG_FILE,
};

const DIR_PREFIX: &str = "unit-harness-";
const PUBLIC_MODE: u32 = 0o777;
const EBUSY_RETRIES: u32 = 10;
const EBUSY_BACKOFF: Duration = Duration::from_secs(1);

/// Files and directories a cleanup leaves in place.
pub const RESIDUAL_SET: [&str; 4] = [CONTROL_SOCKET, STATE_DIR, PID_FILE, LOG_FILE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    root: PathBuf,
}

impl InstanceLayout {
    /// Fresh, uniquely named directory under the system temp dir.
    pub fn create() -> HarnessResult<Self> {
        Self::create_in(&std::env::temp_dir())
    }

    pub fn create_in(base: &Path) -> HarnessResult<Self> {
        let root = base.join(format!("{DIR_PREFIX}{}", uuid::Uuid::new_v4().simple()));
        std::fs::create_dir(&root).map_err(|e| HarnessError::file_system("create dir", &root, e))?;
        make_public(&root)?;
        let layout = Self { root };
        debug_assert!(layout.root.is_dir());
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.path(STATE_DIR)
    }

    pub fn control_socket(&self) -> PathBuf {
        self.path(CONTROL_SOCKET)
    }

    pub fn control_addr(&self) -> ControlAddr {
        ControlAddr::unix(self.control_socket())
    }

    pub fn pid_file(&self) -> PathBuf {
        self.path(PID_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.path(LOG_FILE)
    }

    /// Removes everything but [`RESIDUAL_SET`]. Directory removal is retried
    /// while the kernel reports the tree busy (a mount still draining).
    pub fn purge(&self) -> HarnessResult<()> {
        let entries = std::fs::read_dir(&self.root)
            .map_err(|e| HarnessError::file_system("list dir", &self.root, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::file_system("list dir", &self.root, e))?;
            let name = entry.file_name();
            if RESIDUAL_SET.iter().any(|keep| name == *keep) {
                continue;
            }
            let path = entry.path();
            make_public(&path)?;
            let ft = entry
                .file_type()
                .map_err(|e| HarnessError::file_system("stat", &path, e))?;
            if ft.is_dir() {
                remove_dir_retrying(&path)?;
            } else {
                debug_assert!(ft.is_file() || ft.is_socket() || ft.is_symlink() || ft.is_fifo());
                std::fs::remove_file(&path)
                    .map_err(|e| HarnessError::file_system("remove file", &path, e))?;
            }
            crate::trace!("purged {}", path.display());
        }
        Ok(())
    }

    /// Deletes the whole directory.
    pub fn remove(self) -> HarnessResult<()> {
        if !self.root.exists() {
            return Ok(());
        }
        make_public(&self.root)?;
        remove_dir_retrying(&self.root)
    }
}

fn remove_dir_retrying(path: &Path) -> HarnessResult<()> {
    let mut attempt = 0;
    loop {
        match std::fs::remove_dir_all(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e)
                if e.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32)
                    && attempt + 1 < EBUSY_RETRIES =>
            {
                attempt += 1;
                crate::debug!("{} busy, retry {attempt}/{EBUSY_RETRIES}", path.display());
                std::thread::sleep(EBUSY_BACKOFF);
            }
            Err(e) => return Err(HarnessError::file_system("remove dir", path, e)),
        }
    }
}

/// Sets mode 0777 on `path` and, for directories, everything below it.
/// Symlinks are not followed.
pub fn make_public(path: &Path) -> HarnessResult<()> {
    let meta = std::fs::symlink_metadata(path)
        .map_err(|e| HarnessError::file_system("stat", path, e))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(PUBLIC_MODE))
        .map_err(|e| HarnessError::file_system("chmod", path, e))?;
    if meta.is_dir() {
        let entries =
            std::fs::read_dir(path).map_err(|e| HarnessError::file_system("list dir", path, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| HarnessError::file_system("list dir", path, e))?;
            make_public(&entry.path())?;
        }
    }
    Ok(())
}

/// Opens the build directory up unless it already is mode 0777.
pub fn ensure_public(path: &Path) -> HarnessResult<()> {
    let mode = std::fs::metadata(path)
        .map_err(|e| HarnessError::file_system("stat", path, e))?
        .permissions()
        .mode()
        & 0o7777;
    if mode != PUBLIC_MODE {
        crate::debug!("{} has mode {mode:o}, opening it up", path.display());
        make_public(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixListener;

    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn create_is_unique_and_public() -> HarnessResult<()> {
        let base = tempfile::tempdir().unwrap();
        let a = InstanceLayout::create_in(base.path())?;
        let b = InstanceLayout::create_in(base.path())?;
        assert_ne!(a, b);
        assert!(a.root().file_name().unwrap().to_string_lossy().starts_with(DIR_PREFIX));
        let mode = std::fs::metadata(a.root()).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o777);
        Ok(())
    }

    #[test]
    fn purge_keeps_residual_set() -> HarnessResult<()> {
        let base = tempfile::tempdir().unwrap();
        let layout = InstanceLayout::create_in(base.path())?;

        std::fs::create_dir_all(layout.state_dir().join("certs")).unwrap();
        touch(&layout.pid_file());
        touch(&layout.log_file());
        let _listener = UnixListener::bind(layout.control_socket()).unwrap();

        touch(&layout.path("app.py"));
        let _stray = UnixListener::bind(layout.path("peer.sock")).unwrap();
        std::fs::create_dir_all(layout.path("static/a/b")).unwrap();
        touch(&layout.path("static/a/b/index.html"));
        std::fs::set_permissions(layout.path("static/a"), std::fs::Permissions::from_mode(0o500))
            .unwrap();

        layout.purge()?;

        let mut left: Vec<String> = std::fs::read_dir(layout.root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, ["control.unit.sock", "state", "unit.log", "unit.pid"]);
        assert!(layout.state_dir().join("certs").is_dir());

        let root = layout.root().to_path_buf();
        layout.remove()?;
        assert!(!root.exists());
        Ok(())
    }

    #[test]
    fn ensure_public_opens_restricted_dir() -> HarnessResult<()> {
        let td = tempfile::tempdir().unwrap();
        let dir = td.path().join("build");
        std::fs::create_dir_all(dir.join("sbin")).unwrap();
        std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o755)).unwrap();

        ensure_public(&dir)?;
        let mode = |p: &Path| std::fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&dir), 0o777);
        assert_eq!(mode(&dir.join("sbin")), 0o777);
        Ok(())
    }
}
