// src/provision/local.rs

//! Local environment provider.
//!
//! Each environment is a working directory under the provider root. The
//! artifact is written into that directory and the start command runs as a
//! shell child process there. Useful for development and as the default
//! provider of the `launchpad` binary.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use super::{
    EnvState, Environment, EnvironmentAgent, EnvironmentHandle, EnvironmentRequest,
    ProviderFuture, ProvisionError, Provisioner, RunSignal, StartAck,
};

/// Internal handle for a running command.
///
/// - `cancel` asks the runner task to kill the child.
/// - `exit` is filled in once the child exits (or is killed).
struct RunningProcess {
    cancel: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<RunSignal>>,
}

struct LocalEnv {
    dir: PathBuf,
    state: EnvState,
    process: Option<RunningProcess>,
}

#[derive(Clone)]
pub struct LocalProvider {
    root: PathBuf,
    max_environments: usize,
    next_id: Arc<AtomicU64>,
    envs: Arc<Mutex<HashMap<EnvironmentHandle, LocalEnv>>>,
}

impl std::fmt::Debug for LocalProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProvider")
            .field("root", &self.root)
            .field("max_environments", &self.max_environments)
            .finish_non_exhaustive()
    }
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>, max_environments: usize) -> Self {
        Self {
            root: root.into(),
            max_environments,
            next_id: Arc::new(AtomicU64::new(1)),
            envs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock_envs(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<EnvironmentHandle, LocalEnv>>, ProvisionError>
    {
        self.envs
            .lock()
            .map_err(|_| ProvisionError::Unavailable("local provider state poisoned".into()))
    }

    fn env_dir(&self, handle: &EnvironmentHandle) -> Result<PathBuf, ProvisionError> {
        let envs = self.lock_envs()?;
        envs.get(handle)
            .map(|e| e.dir.clone())
            .ok_or_else(|| ProvisionError::UnknownEnvironment(handle.clone()))
    }
}

/// Keep only the final path component of a declared filename.
fn sanitize_filename(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("artifact")
        .to_string()
}

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

/// Always consume child output so pipe buffers don't fill; log at debug.
fn spawn_line_logger<R>(env: EnvironmentHandle, stream: &'static str, reader: R)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(env = %env, stream, "{}", line);
        }
    });
}

impl Provisioner for LocalProvider {
    fn create(&self, request: EnvironmentRequest) -> ProviderFuture<'_, EnvironmentHandle> {
        Box::pin(async move {
            // Reserve the slot under the lock so concurrent creates cannot
            // both pass the quota check.
            let (handle, dir) = {
                let mut envs = self.lock_envs()?;
                let active = envs
                    .values()
                    .filter(|e| e.state != EnvState::Terminated)
                    .count();
                if active >= self.max_environments {
                    return Err(ProvisionError::QuotaExceeded(format!(
                        "{active} local environments already active (max {})",
                        self.max_environments
                    )));
                }

                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let handle = EnvironmentHandle(format!("local-{id}"));
                let dir = self.root.join(&handle.0);
                envs.insert(
                    handle.clone(),
                    LocalEnv {
                        dir: dir.clone(),
                        state: EnvState::Provisioning,
                        process: None,
                    },
                );
                (handle, dir)
            };

            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                self.lock_envs()?.remove(&handle);
                return Err(ProvisionError::Unavailable(format!(
                    "creating {}: {e}",
                    dir.display()
                )));
            }

            if let Some(env) = self.lock_envs()?.get_mut(&handle) {
                if env.state == EnvState::Provisioning {
                    env.state = EnvState::Ready;
                }
            }

            info!(
                env = %handle,
                job_id = %request.job_id,
                owner = %request.owner,
                dir = ?dir,
                "created local environment"
            );
            Ok(handle)
        })
    }

    fn poll(&self, handle: EnvironmentHandle) -> ProviderFuture<'_, Environment> {
        Box::pin(async move {
            let envs = self.lock_envs()?;
            let env = envs
                .get(&handle)
                .ok_or_else(|| ProvisionError::UnknownEnvironment(handle.clone()))?;
            let endpoint = (env.state == EnvState::Ready)
                .then(|| format!("file://{}", env.dir.display()));
            Ok(Environment {
                handle: handle.clone(),
                state: env.state,
                endpoint,
            })
        })
    }

    fn terminate(&self, handle: EnvironmentHandle) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let dir = {
                let mut envs = self.lock_envs()?;
                let Some(env) = envs.get_mut(&handle) else {
                    debug!(env = %handle, "terminate on unknown environment; nothing to do");
                    return Ok(());
                };
                if env.state == EnvState::Terminated {
                    return Ok(());
                }
                env.state = EnvState::Terminated;
                if let Some(cancel) = env.process.as_mut().and_then(|p| p.cancel.take()) {
                    if cancel.send(()).is_err() {
                        debug!(env = %handle, "process already exited before terminate");
                    }
                }
                env.dir.clone()
            };

            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(env = %handle, error = %e, "failed to remove environment directory");
            }
            info!(env = %handle, "terminated local environment");
            Ok(())
        })
    }
}

impl EnvironmentAgent for LocalProvider {
    fn push_artifact(
        &self,
        environment: Environment,
        filename: String,
        bytes: Vec<u8>,
    ) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let dir = self.env_dir(&environment.handle)?;
            let path = dir.join(sanitize_filename(&filename));

            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|e| ProvisionError::Transfer(format!("writing {}: {e}", path.display())))?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                tokio::fs::set_permissions(&path, perms).await.map_err(|e| {
                    ProvisionError::Transfer(format!("chmod {}: {e}", path.display()))
                })?;
            }

            debug!(env = %environment.handle, path = ?path, size = bytes.len(), "artifact pushed");
            Ok(())
        })
    }

    fn start(&self, environment: Environment, command: String) -> ProviderFuture<'_, StartAck> {
        Box::pin(async move {
            let handle = environment.handle.clone();
            let dir = self.env_dir(&handle)?;

            let mut cmd = shell_command(&command);
            cmd.current_dir(&dir)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|e| ProvisionError::Start(format!("spawning '{command}': {e}")))?;
            let pid = child.id();

            if let Some(stdout) = child.stdout.take() {
                spawn_line_logger(handle.clone(), "stdout", stdout);
            }
            if let Some(stderr) = child.stderr.take() {
                spawn_line_logger(handle.clone(), "stderr", stderr);
            }

            let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
            let (exit_tx, exit_rx) = watch::channel::<Option<RunSignal>>(None);
            let env_name = handle.clone();

            tokio::spawn(async move {
                let signal = tokio::select! {
                    status = child.wait() => match status {
                        Ok(status) => {
                            let code = status.code().unwrap_or(-1);
                            info!(env = %env_name, exit_code = code, "command process exited");
                            RunSignal::Exited { code }
                        }
                        Err(e) => RunSignal::HealthCheckFailed {
                            detail: format!("waiting for process: {e}"),
                        },
                    },
                    _ = &mut cancel_rx => {
                        info!(env = %env_name, "killing command process");
                        if let Err(e) = child.kill().await {
                            warn!(env = %env_name, error = %e, "failed to kill command process");
                        }
                        RunSignal::HealthCheckFailed {
                            detail: "process killed by terminate".to_string(),
                        }
                    }
                };
                let _ = exit_tx.send(Some(signal));
            });

            {
                let mut envs = self.lock_envs()?;
                let env = envs
                    .get_mut(&handle)
                    .ok_or_else(|| ProvisionError::UnknownEnvironment(handle.clone()))?;
                env.process = Some(RunningProcess {
                    cancel: Some(cancel_tx),
                    exit: exit_rx,
                });
            }

            info!(env = %handle, pid = ?pid, cmd = %command, "started command process");
            Ok(StartAck {
                detail: match pid {
                    Some(pid) => format!("pid {pid}"),
                    None => "process started".to_string(),
                },
            })
        })
    }

    fn observe(&self, environment: Environment) -> ProviderFuture<'_, RunSignal> {
        Box::pin(async move {
            let mut exit = {
                let envs = self.lock_envs()?;
                let env = envs
                    .get(&environment.handle)
                    .ok_or_else(|| ProvisionError::UnknownEnvironment(environment.handle.clone()))?;
                env.process
                    .as_ref()
                    .map(|p| p.exit.clone())
                    .ok_or_else(|| ProvisionError::Start("no command started".to_string()))?
            };

            let signal = match exit.wait_for(|s| s.is_some()).await {
                Ok(signal) => signal.clone(),
                Err(_) => None,
            };
            Ok(signal.unwrap_or(RunSignal::HealthCheckFailed {
                detail: "process handle dropped".to_string(),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> EnvironmentRequest {
        EnvironmentRequest {
            job_id: "job".to_string(),
            owner: "alice".to_string(),
        }
    }

    #[test]
    fn filenames_cannot_escape_environment() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".."), "artifact");
        assert_eq!(sanitize_filename("server.jar"), "server.jar");
    }

    #[tokio::test]
    async fn quota_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), 1);

        let first = provider.create(request()).await.unwrap();
        let err = provider.create(request()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::QuotaExceeded(_)));

        provider.terminate(first).await.unwrap();
        provider.create(request()).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_respect_quota() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), 1);

        let (a, b) = tokio::join!(provider.create(request()), provider.create(request()));
        let created = [&a, &b].iter().filter(|r| r.is_ok()).count();
        assert_eq!(created, 1, "results: {a:?} / {b:?}");
        assert!(
            [a, b]
                .into_iter()
                .any(|r| matches!(r, Err(ProvisionError::QuotaExceeded(_))))
        );
    }

    #[tokio::test]
    async fn failed_directory_creation_releases_the_slot() {
        let dir = tempfile::tempdir().unwrap();
        // A file where the provider root should be makes create_dir_all fail.
        let root = dir.path().join("not-a-dir");
        std::fs::write(&root, b"").unwrap();
        let provider = LocalProvider::new(&root, 1);

        let err = provider.create(request()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Unavailable(_)));
        let err = provider.create(request()).await.unwrap_err();
        assert!(matches!(err, ProvisionError::Unavailable(_)), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_command_against_pushed_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path(), 4);

        let handle = provider.create(request()).await.unwrap();
        let env = provider.poll(handle.clone()).await.unwrap();
        assert_eq!(env.state, EnvState::Ready);

        provider
            .push_artifact(env.clone(), "run.sh".into(), b"#!/bin/sh\nexit 3\n".to_vec())
            .await
            .unwrap();
        provider.start(env.clone(), "sh ./run.sh".into()).await.unwrap();

        let signal = provider.observe(env).await.unwrap();
        assert_eq!(signal, RunSignal::Exited { code: 3 });

        provider.terminate(handle.clone()).await.unwrap();
        provider.terminate(handle).await.unwrap();
    }
}
