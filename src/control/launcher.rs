//! Process spawning and socket connection seams.
//!
//! The supervisor only talks to [`ProcessLauncher`] and [`Transport`], so
//! tests can substitute in-memory processes and streams.

use crate::error::ControlError;
use crate::ipc::IpcStream;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Everything needed to start one execution process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub account_id: String,
    pub socket_path: PathBuf,
    /// Config file passed through to the child, if any.
    pub config_path: Option<String>,
}

/// A running (or exited) execution process.
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check.
    fn has_exited(&mut self) -> bool;

    /// Wait up to `timeout` for the process to exit on its own.
    async fn wait_exit(&mut self, timeout: Duration) -> bool;

    /// Force-terminate and reap.
    async fn kill(&mut self);
}

/// Starts execution processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, ControlError>;
}

/// Opens a byte stream to an execution process socket.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, path: &Path) -> std::io::Result<Box<dyn IpcStream>>;
}

/// Launches `<binary> trader --account-id <id> --socket <path>`.
pub struct CommandLauncher {
    binary: PathBuf,
}

impl CommandLauncher {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }
}

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, ControlError> {
        let mut command = Command::new(&self.binary);
        command
            .arg("trader")
            .arg("--account-id")
            .arg(&spec.account_id)
            .arg("--socket")
            .arg(&spec.socket_path)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(config_path) = &spec.config_path {
            command.arg("--config").arg(config_path);
        }

        let child = command.spawn().map_err(|e| ControlError::Spawn {
            account_id: spec.account_id.clone(),
            reason: e.to_string(),
        })?;

        info!(
            account_id = %spec.account_id,
            pid = ?child.id(),
            socket = %spec.socket_path.display(),
            "Spawned execution process"
        );

        Ok(Box::new(ChildProcess { child }))
    }
}

struct ChildProcess {
    child: Child,
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                debug!(%status, "Execution process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Failed to poll execution process");
                false
            }
        }
    }

    async fn wait_exit(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.child.wait()).await, Ok(Ok(_)))
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Kill failed, process already gone");
        }
    }
}

/// Unix domain socket transport.
pub struct UnixTransport;

#[async_trait]
impl Transport for UnixTransport {
    async fn connect(&self, path: &Path) -> std::io::Result<Box<dyn IpcStream>> {
        let stream = tokio::net::UnixStream::connect(path).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory launcher and transport for supervisor tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;

    /// Shared flags a fake process and its test driver both see.
    #[derive(Clone, Default)]
    pub struct FakeProcessState {
        pub exited: Arc<Mutex<bool>>,
        pub killed: Arc<Mutex<bool>>,
    }

    pub struct FakeProcess {
        pid: u32,
        state: FakeProcessState,
    }

    #[async_trait]
    impl ProcessHandle for FakeProcess {
        fn pid(&self) -> Option<u32> {
            Some(self.pid)
        }

        fn has_exited(&mut self) -> bool {
            *self.state.exited.lock().unwrap()
        }

        async fn wait_exit(&mut self, timeout: Duration) -> bool {
            let deadline = tokio::time::Instant::now() + timeout;
            while tokio::time::Instant::now() < deadline {
                if *self.state.exited.lock().unwrap() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            *self.state.exited.lock().unwrap()
        }

        async fn kill(&mut self) {
            *self.state.killed.lock().unwrap() = true;
            *self.state.exited.lock().unwrap() = true;
        }
    }

    /// A launch observed by the test, with the server half of its socket.
    pub struct Launched {
        pub spec: LaunchSpec,
        pub state: FakeProcessState,
        pub stream: DuplexStream,
    }

    /// Every launch creates a duplex pair; the client half is parked for the
    /// transport, the server half goes to the test through `launches`.
    pub struct FakeWorld {
        next_pid: Mutex<u32>,
        sockets: Mutex<HashMap<PathBuf, DuplexStream>>,
        launches: mpsc::UnboundedSender<Launched>,
        pub fail_spawn: Mutex<bool>,
    }

    impl FakeWorld {
        pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Launched>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let world = Arc::new(Self {
                next_pid: Mutex::new(1000),
                sockets: Mutex::new(HashMap::new()),
                launches: tx,
                fail_spawn: Mutex::new(false),
            });
            (world, rx)
        }
    }

    impl ProcessLauncher for FakeWorld {
        fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn ProcessHandle>, ControlError> {
            if *self.fail_spawn.lock().unwrap() {
                return Err(ControlError::Spawn {
                    account_id: spec.account_id.clone(),
                    reason: "no such binary".into(),
                });
            }
            let pid = {
                let mut next = self.next_pid.lock().unwrap();
                *next += 1;
                *next
            };
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.sockets
                .lock()
                .unwrap()
                .insert(spec.socket_path.clone(), client);

            let state = FakeProcessState::default();
            let _ = self.launches.send(Launched {
                spec: spec.clone(),
                state: state.clone(),
                stream: server,
            });
            Ok(Box::new(FakeProcess { pid, state }))
        }
    }

    #[async_trait]
    impl Transport for FakeWorld {
        async fn connect(&self, path: &Path) -> std::io::Result<Box<dyn IpcStream>> {
            match self.sockets.lock().unwrap().remove(path) {
                Some(stream) => Ok(Box::new(stream)),
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "socket not bound",
                )),
            }
        }
    }
}
