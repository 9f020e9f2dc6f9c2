//! Turning a launch request into a concrete command line.
//!
//! Nothing here has side effects apart from `stat` calls, so the
//! supervisor's spawn path stays easy to test.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tilehost_config::{GameDefinition, ResolvedPaths, Username};

use crate::{ProcessError, SupervisorConfig};

/// Longest path `sockaddr_un` can hold, leaving room for the NUL.
pub const MAX_SOCKET_PATH: usize = 107;

/// Characters of the session id kept in the socket file name.
const SOCKET_ID_LEN: usize = 12;

/// Everything needed to start one game.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub session_id: String,
    pub username: Username,
    pub game: Arc<GameDefinition>,
}

/// A request with every path resolved.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub paths: ResolvedPaths,
    pub rcfile: PathBuf,
    pub socket_path: PathBuf,
}

impl LaunchPlan {
    /// Resolves paths and checks that the per-user directories exist.
    ///
    /// # Errors
    /// [`ProcessError::MissingDirectory`] naming the first missing
    /// directory, or [`ProcessError::SocketPathTooLong`].
    pub async fn prepare(request: &LaunchRequest, config: &SupervisorConfig) -> Result<Self, ProcessError> {
        let paths = request.game.resolve(&request.username);
        let socket_dir = config
            .server_socket_path
            .clone()
            .unwrap_or_else(|| paths.socket_dir.clone());

        for (what, dir) in [
            ("rc file", &paths.rcfile_dir),
            ("macro", &paths.macro_dir),
            ("morgue", &paths.morgue_dir),
            ("in-progress", &paths.inprogress_dir),
            ("ttyrec", &paths.ttyrec_dir),
            ("socket", &socket_dir),
        ] {
            let is_dir = tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir());
            if !is_dir {
                return Err(ProcessError::MissingDirectory {
                    what,
                    path: dir.clone(),
                    hint: config.init_player_program.clone(),
                });
            }
        }

        let short_id: String = request.session_id.chars().take(SOCKET_ID_LEN).collect();
        let socket_path = socket_dir.join(format!("{}:{short_id}.sock", request.username));
        let len = socket_path.as_os_str().len();
        if len > MAX_SOCKET_PATH {
            return Err(ProcessError::SocketPathTooLong {
                path: socket_path,
                len,
                max: MAX_SOCKET_PATH,
            });
        }

        Ok(Self {
            rcfile: paths.rcfile(&request.username),
            paths,
            socket_path,
        })
    }

    /// Arguments passed to the game, configured options last.
    pub fn args(&self, request: &LaunchRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "-name".into(),
            request.username.as_str().into(),
            "-rc".into(),
            self.rcfile.clone().into(),
            "-macro".into(),
            self.paths.macro_dir.clone().into(),
            "-morgue".into(),
            self.paths.morgue_dir.clone().into(),
            "-webtiles-socket".into(),
            self.socket_path.clone().into(),
            "-await-connection".into(),
        ];
        args.extend(request.game.options.iter().map(OsString::from));
        args
    }

    /// `<inprogress>/<user>:<timestamp>.ttyrec`
    pub fn inprogress_marker(&self, filename: &str) -> PathBuf {
        self.paths.inprogress_dir.join(filename)
    }

}

/// Removes a file, treating "already gone" as success.
pub(crate) async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove file"),
    }
}
