//! The process supervisor: starts games and hands back their handles.

use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tilehost_record::{ttyrec_filename, TtyrecWriter};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::actor::{spawn_actor, ActorParts};
use crate::launch::remove_if_present;
use crate::{
    LaunchPlan, LaunchRequest, ProcessError, ProcessHandle, SupervisorConfig,
    TerminationOutcome, TerminationReason,
};

/// Starts game processes.
///
/// Stateless apart from its configuration: each process is owned by its
/// own actor, and the session registry owns the handles.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    config: Arc<SupervisorConfig>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Launches the game for `request` and waits for it to connect.
    ///
    /// Steps: resolve and check the user's directories, bind the game
    /// socket, create the in-progress marker, start the binary, wait for
    /// its connection, open the recording. A recording that cannot be
    /// opened is logged and skipped; every other failure is returned and
    /// leaves nothing behind.
    pub async fn spawn(&self, request: LaunchRequest) -> Result<ProcessHandle, ProcessError> {
        let plan = LaunchPlan::prepare(&request, &self.config)
            .await
            .inspect_err(|e| {
                warn!(
                    session_id = %request.session_id,
                    username = %request.username,
                    game = %request.game.id,
                    error = %e,
                    "cannot launch game"
                );
            })?;

        remove_if_present(&plan.socket_path).await;
        let listener = UnixListener::bind(&plan.socket_path).map_err(|source| ProcessError::Socket {
            path: plan.socket_path.clone(),
            source,
        })?;

        let started = Utc::now();
        let record_name = ttyrec_filename(request.username.as_str(), started);
        let inprogress = plan.inprogress_marker(&record_name);

        let result = self.start(&request, &plan, listener, &inprogress).await;
        remove_if_present(&plan.socket_path).await;
        let (child, stream) = match result {
            Ok(parts) => parts,
            Err(e) => {
                remove_if_present(&inprogress).await;
                warn!(
                    session_id = %request.session_id,
                    username = %request.username,
                    game = %request.game.id,
                    error = %e,
                    "game launch failed"
                );
                return Err(e);
            }
        };

        let recorder = match TtyrecWriter::create_in(
            &plan.paths.ttyrec_dir,
            request.username.as_str(),
            started,
            self.config.term_size,
        )
        .await
        {
            Ok(writer) => Some(writer),
            Err(e) => {
                warn!(session_id = %request.session_id, error = %e, "recording disabled for this session");
                None
            }
        };

        info!(
            session_id = %request.session_id,
            username = %request.username,
            game = %request.game.id,
            pid = ?child.id(),
            socket = %plan.socket_path.display(),
            "game connected"
        );

        let (reader, writer) = stream.into_split();
        Ok(spawn_actor(ActorParts {
            session_id: Arc::from(request.session_id.as_str()),
            username: request.username.into_inner(),
            child,
            reader,
            writer,
            recorder,
            inprogress,
            socket_path: plan.socket_path,
            kill_timeout: self.config.kill_timeout,
            channel_size: self.config.channel_size,
            input_buffer: self.config.input_buffer,
        }))
    }

    /// Starts the binary and waits for it to connect to `listener`.
    async fn start(
        &self,
        request: &LaunchRequest,
        plan: &LaunchPlan,
        listener: UnixListener,
        inprogress: &std::path::Path,
    ) -> Result<(Child, tokio::net::UnixStream), ProcessError> {
        let binary = &request.game.binary;
        let mut child = Command::new(binary)
            .args(plan.args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                binary: binary.clone(),
                source,
            })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr, request.session_id.clone()));
        }

        let marker = format!("{}\n", child.id().unwrap_or_default());
        if let Err(e) = tokio::fs::write(inprogress, marker).await {
            warn!(path = %inprogress.display(), error = %e, "cannot create in-progress marker");
        }

        let timeout = self.config.connect_timeout;
        tokio::select! {
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Ok(Ok((stream, _))) => Ok((child, stream)),
                Ok(Err(source)) => Err(ProcessError::Socket {
                    path: plan.socket_path.clone(),
                    source,
                }),
                Err(_) => Err(ProcessError::ConnectTimeout(timeout)),
            },
            status = child.wait() => Err(ProcessError::ExitedDuringStartup(match status {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            })),
        }
        // On error `child` is dropped here and `kill_on_drop` reaps it.
    }

    /// Terminates a process through its handle.
    pub async fn terminate(
        &self,
        handle: &ProcessHandle,
        graceful: bool,
        reason: TerminationReason,
    ) -> TerminationOutcome {
        handle.terminate(graceful, reason).await
    }
}

async fn forward_stderr(stderr: ChildStderr, session_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(%session_id, "game stderr: {line}");
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use tilehost_config::{GameDefinition, UsernamePolicy};

    use super::*;

    fn request(base: &Path, binary: &str) -> LaunchRequest {
        for dir in ["home/Alice", "running", "sockets"] {
            std::fs::create_dir_all(base.join(dir)).unwrap();
        }
        let b = base.display();
        LaunchRequest {
            session_id: "feedfacefeedface".into(),
            username: UsernamePolicy::default().parse("Alice").unwrap(),
            game: Arc::new(GameDefinition {
                id: "dcss-test".into(),
                name: "Test".into(),
                binary: binary.into(),
                rcfile_path: format!("{b}/home/%n"),
                macro_path: format!("{b}/home/%n"),
                morgue_path: format!("{b}/home/%n"),
                inprogress_path: format!("{b}/running"),
                ttyrec_path: format!("{b}/home/%n"),
                socket_path: format!("{b}/sockets"),
                client_path: String::new(),
                morgue_url: None,
                send_json_options: false,
                options: vec![],
            }),
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            connect_timeout: Duration::from_secs(5),
            ..SupervisorConfig::default()
        })
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "/nonexistent/crawl");
        let err = supervisor().spawn(req).await.unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        // Nothing left behind.
        assert_eq!(std::fs::read_dir(dir.path().join("sockets")).unwrap().count(), 0);
        assert_eq!(std::fs::read_dir(dir.path().join("running")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_binary_that_exits_is_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "/bin/false");
        let err = supervisor().spawn(req).await.unwrap_err();
        assert!(matches!(err, ProcessError::ExitedDuringStartup(_)));
        assert_eq!(std::fs::read_dir(dir.path().join("running")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_missing_directory_never_starts_process() {
        let dir = tempfile::tempdir().unwrap();
        let req = request(dir.path(), "/bin/false");
        std::fs::remove_dir(dir.path().join("sockets")).unwrap();
        let err = supervisor().spawn(req).await.unwrap_err();
        assert!(matches!(err, ProcessError::MissingDirectory { what: "socket", .. }));
    }
}
