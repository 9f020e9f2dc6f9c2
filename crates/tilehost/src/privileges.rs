//! One-time process setup: daemonizing, pidfile, umask, chroot, and the
//! switch to an unprivileged user.
//!
//! Order matters. [`daemonize`] forks, so it must run before the Tokio
//! runtime starts any threads. [`drop_privileges`] runs after the
//! listeners are bound so privileged ports still work.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tilehost_config::ProcessSettings;
use tracing::{debug, info};

use crate::TilehostError;

fn startup(what: &str, e: io::Error) -> TilehostError {
    TilehostError::Startup(format!("{what}: {e}"))
}

fn check(rc: libc::c_int, what: &str) -> Result<(), TilehostError> {
    if rc == -1 {
        return Err(startup(what, io::Error::last_os_error()));
    }
    Ok(())
}

fn c_path(path: &Path) -> Result<CString, TilehostError> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| TilehostError::Startup(format!("path contains NUL: {}", path.display())))
}

/// Detaches from the controlling terminal: fork, exit the parent,
/// `setsid`, point the standard streams at `/dev/null`.
///
/// # Errors
/// [`TilehostError::Startup`] if any step fails.
pub fn daemonize() -> Result<(), TilehostError> {
    // SAFETY: called from `main` before the runtime or any other thread
    // exists, so the child inherits a consistent single-threaded process.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => return Err(startup("fork", io::Error::last_os_error())),
        0 => {}
        // SAFETY: `_exit` skips destructors and atexit handlers the child
        // still needs.
        _ => unsafe { libc::_exit(0) },
    }

    // SAFETY: plain syscall with no pointer arguments.
    check(unsafe { libc::setsid() }, "setsid")?;

    let devnull = c"/dev/null";
    // SAFETY: `devnull` is a valid NUL-terminated string.
    let fd = unsafe { libc::open(devnull.as_ptr(), libc::O_RDWR) };
    check(fd, "open /dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        // SAFETY: both descriptors are open.
        check(unsafe { libc::dup2(fd, target) }, "dup2")?;
    }
    if fd > libc::STDERR_FILENO {
        // SAFETY: `fd` is ours and no longer needed.
        unsafe { libc::close(fd) };
    }
    Ok(())
}

/// Sets the file mode creation mask. Returns the previous mask.
pub fn apply_umask(mask: u32) -> u32 {
    // SAFETY: umask cannot fail.
    let old = unsafe { libc::umask(mask as libc::mode_t) };
    debug!(umask = format!("{mask:04o}"), "umask set");
    old as u32
}

/// A written pidfile, removed again on drop.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Writes the current pid to `path`.
    ///
    /// # Errors
    /// [`TilehostError::Startup`] if the file cannot be written.
    pub fn create(path: &Path) -> Result<Self, TilehostError> {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| startup(&format!("pidfile {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Where the file is seen from inside `root` after a chroot. A file
    /// outside the new root cannot be removed later.
    pub fn rebase(&mut self, root: &Path) {
        if let Ok(inside) = self.path.strip_prefix(root) {
            self.path = Path::new("/").join(inside);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(path = %self.path.display(), error = %e, "pidfile not removed");
        }
    }
}

/// Applies `chroot`, then `gid`, then `uid` from `[process]`.
///
/// The group is switched before the user, while we still may.
///
/// # Errors
/// [`TilehostError::Startup`] naming the step that failed.
pub fn drop_privileges(settings: &ProcessSettings, pidfile: Option<&mut PidFile>) -> Result<(), TilehostError> {
    if let Some(root) = &settings.chroot {
        let c_root = c_path(root)?;
        // SAFETY: `c_root` is a valid NUL-terminated path.
        check(unsafe { libc::chroot(c_root.as_ptr()) }, "chroot")?;
        // SAFETY: literal NUL-terminated path.
        check(unsafe { libc::chdir(c"/".as_ptr()) }, "chdir /")?;
        if let Some(pidfile) = pidfile {
            pidfile.rebase(root);
        }
        info!(root = %root.display(), "changed root directory");
    }
    if let Some(gid) = settings.gid {
        // SAFETY: an empty list needs no valid pointer.
        check(unsafe { libc::setgroups(0, std::ptr::null()) }, "setgroups")?;
        // SAFETY: plain syscall with no pointer arguments.
        check(unsafe { libc::setgid(gid as libc::gid_t) }, "setgid")?;
        info!(gid, "switched group");
    }
    if let Some(uid) = settings.uid {
        // SAFETY: plain syscall with no pointer arguments.
        check(unsafe { libc::setuid(uid as libc::uid_t) }, "setuid")?;
        info!(uid, "switched user");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pidfile_create_writes_pid_and_drop_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tilehost.pid");
        {
            let pidfile = PidFile::create(&path).unwrap();
            let content = std::fs::read_to_string(pidfile.path()).unwrap();
            assert_eq!(content.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_pidfile_rebase_inside_root_strips_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run/tilehost.pid");
        let mut pidfile = PidFile { path };
        pidfile.rebase(dir.path());
        assert_eq!(pidfile.path(), Path::new("/run/tilehost.pid"));
        std::mem::forget(pidfile);
    }

    #[test]
    fn test_pidfile_rebase_outside_root_keeps_path() {
        let mut pidfile = PidFile {
            path: PathBuf::from("/var/run/tilehost.pid"),
        };
        pidfile.rebase(Path::new("/srv/chroot"));
        assert_eq!(pidfile.path(), Path::new("/var/run/tilehost.pid"));
        std::mem::forget(pidfile);
    }

    #[test]
    fn test_drop_privileges_nothing_configured_is_ok() {
        assert!(drop_privileges(&ProcessSettings::default(), None).is_ok());
    }

    #[test]
    fn test_apply_umask_returns_previous() {
        let old = apply_umask(0o022);
        assert_eq!(apply_umask(old), 0o022);
    }
}
