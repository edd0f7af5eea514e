use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::watch;

use launchpad::provision::{
    EnvState, Environment, EnvironmentAgent, EnvironmentHandle, EnvironmentRequest,
    ProviderFuture, ProvisionError, Provisioner, RunSignal, StartAck,
};

/// How `create` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateScript {
    Succeed,
    /// Transient `Unavailable` on every call.
    AlwaysUnavailable,
    /// `Unavailable` for the first `n` calls, then success.
    UnavailableTimes(u32),
    QuotaExceeded,
    Unauthorized,
    /// Never answers.
    Hang,
}

/// What `poll` reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyScript {
    Immediately,
    /// `Provisioning` for the first `n` polls, then `Ready`.
    AfterPolls(u32),
    Never,
    Failed,
}

/// How `push_artifact` answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferScript {
    Succeed,
    /// Transient failure on the first `n` pushes, then success.
    FailTimes(u32),
    AlwaysFail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartScript {
    Succeed,
    Fail,
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateScript {
    Succeed,
    /// Count the call, then never answer.
    Hang,
}

/// What `observe` reports once the command runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunScript {
    Exit(i32),
    HealthCheckFailed(String),
    /// Keep running until [`ScriptedProvider::release`] is called.
    Hold,
    /// Never report anything.
    Silent,
}

/// In-memory provider that plays both [`Provisioner`] and
/// [`EnvironmentAgent`] from a fixed script and counts every call.
pub struct ScriptedProvider {
    create: CreateScript,
    ready: ReadyScript,
    transfer: TransferScript,
    start: StartScript,
    run: RunScript,
    terminate: TerminateScript,

    create_calls: AtomicU32,
    poll_calls: AtomicU32,
    push_calls: AtomicU32,
    start_calls: AtomicU32,
    terminated: watch::Sender<u32>,
    released: watch::Sender<Option<i32>>,
    pushed: Mutex<Vec<(String, usize)>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Everything succeeds and the command exits 0.
    pub fn new() -> Self {
        Self {
            create: CreateScript::Succeed,
            ready: ReadyScript::Immediately,
            transfer: TransferScript::Succeed,
            start: StartScript::Succeed,
            run: RunScript::Exit(0),
            terminate: TerminateScript::Succeed,
            create_calls: AtomicU32::new(0),
            poll_calls: AtomicU32::new(0),
            push_calls: AtomicU32::new(0),
            start_calls: AtomicU32::new(0),
            terminated: watch::channel(0).0,
            released: watch::channel(None).0,
            pushed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_create(mut self, script: CreateScript) -> Self {
        self.create = script;
        self
    }

    pub fn with_ready(mut self, script: ReadyScript) -> Self {
        self.ready = script;
        self
    }

    pub fn with_transfer(mut self, script: TransferScript) -> Self {
        self.transfer = script;
        self
    }

    pub fn with_start(mut self, script: StartScript) -> Self {
        self.start = script;
        self
    }

    pub fn with_run(mut self, script: RunScript) -> Self {
        self.run = script;
        self
    }

    pub fn with_terminate(mut self, script: TerminateScript) -> Self {
        self.terminate = script;
        self
    }

    /// Let a [`RunScript::Hold`] command exit with `code`.
    pub fn release(&self, code: i32) {
        self.released.send_replace(Some(code));
    }

    pub fn create_calls(&self) -> u32 {
        self.create_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> u32 {
        self.poll_calls.load(Ordering::SeqCst)
    }

    pub fn push_calls(&self) -> u32 {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> u32 {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> u32 {
        *self.terminated.borrow()
    }

    /// Wait until `terminate` has been called at least `n` times.
    pub async fn wait_for_terminations(&self, n: u32) {
        let mut rx = self.terminated.subscribe();
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// `(filename, size)` of every successful push.
    pub fn pushed(&self) -> Vec<(String, usize)> {
        self.pushed.lock().unwrap().clone()
    }

    fn environment(&self, handle: EnvironmentHandle, state: EnvState) -> Environment {
        let endpoint = (state == EnvState::Ready).then(|| format!("scripted://{handle}"));
        Environment {
            handle,
            state,
            endpoint,
        }
    }
}

impl Provisioner for ScriptedProvider {
    fn create(&self, request: EnvironmentRequest) -> ProviderFuture<'_, EnvironmentHandle> {
        let call = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            let ok = || Ok(EnvironmentHandle(format!("env-{}-{call}", request.job_id)));
            match self.create {
                CreateScript::Succeed => ok(),
                CreateScript::AlwaysUnavailable => {
                    Err(ProvisionError::Unavailable("503 from provider".into()))
                }
                CreateScript::UnavailableTimes(n) if call <= n => {
                    Err(ProvisionError::Unavailable("503 from provider".into()))
                }
                CreateScript::UnavailableTimes(_) => ok(),
                CreateScript::QuotaExceeded => {
                    Err(ProvisionError::QuotaExceeded("environment limit reached".into()))
                }
                CreateScript::Unauthorized => {
                    Err(ProvisionError::Unauthorized("token lacks scope".into()))
                }
                CreateScript::Hang => std::future::pending().await,
            }
        })
    }

    fn poll(&self, handle: EnvironmentHandle) -> ProviderFuture<'_, Environment> {
        let call = self.poll_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            let state = match self.ready {
                ReadyScript::Immediately => EnvState::Ready,
                ReadyScript::AfterPolls(n) if call > n => EnvState::Ready,
                ReadyScript::AfterPolls(_) | ReadyScript::Never => EnvState::Provisioning,
                ReadyScript::Failed => EnvState::Failed,
            };
            Ok(self.environment(handle, state))
        })
    }

    fn terminate(&self, _handle: EnvironmentHandle) -> ProviderFuture<'_, ()> {
        self.terminated.send_modify(|count| *count += 1);
        let script = self.terminate;
        Box::pin(async move {
            if script == TerminateScript::Hang {
                std::future::pending::<()>().await;
            }
            Ok(())
        })
    }
}

impl EnvironmentAgent for ScriptedProvider {
    fn push_artifact(
        &self,
        _environment: Environment,
        filename: String,
        bytes: Vec<u8>,
    ) -> ProviderFuture<'_, ()> {
        let call = self.push_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Box::pin(async move {
            let fail = match self.transfer {
                TransferScript::Succeed => false,
                TransferScript::FailTimes(n) => call <= n,
                TransferScript::AlwaysFail => true,
            };
            if fail {
                return Err(ProvisionError::Transfer("connection reset".into()));
            }
            self.pushed.lock().unwrap().push((filename, bytes.len()));
            Ok(())
        })
    }

    fn start(&self, _environment: Environment, command: String) -> ProviderFuture<'_, StartAck> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            match self.start {
                StartScript::Succeed => Ok(StartAck {
                    detail: format!("pid 4242 running {command}"),
                }),
                StartScript::Fail => Err(ProvisionError::Start("exec format error".into())),
                StartScript::Hang => std::future::pending().await,
            }
        })
    }

    fn observe(&self, _environment: Environment) -> ProviderFuture<'_, RunSignal> {
        Box::pin(async move {
            match &self.run {
                RunScript::Exit(code) => Ok(RunSignal::Exited { code: *code }),
                RunScript::HealthCheckFailed(detail) => Ok(RunSignal::HealthCheckFailed {
                    detail: detail.clone(),
                }),
                RunScript::Hold => {
                    let mut rx = self.released.subscribe();
                    let code = rx.wait_for(Option::is_some).await.ok().and_then(|c| *c);
                    match code {
                        Some(code) => Ok(RunSignal::Exited { code }),
                        None => std::future::pending().await,
                    }
                }
                RunScript::Silent => std::future::pending().await,
            }
        })
    }
}
