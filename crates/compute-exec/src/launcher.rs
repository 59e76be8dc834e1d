//! Process-group launcher over `tokio::process`.

use std::{
    ffi::OsString,
    io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use compute_core::{LaunchError, LaunchRequest, LaunchedProcess, ProcessLauncher};
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    sync::mpsc,
    task::JoinHandle,
};

use crate::resolve::resolve_executable;

const PUMP_CHUNK_SIZE: usize = 16 * 1024;
const OUTPUT_QUEUE_DEPTH: usize = 64;

type OutputChunk = io::Result<Vec<u8>>;

/// Launches processes as process groups so `kill` takes their children too.
///
/// stdout and stderr are merged into a single output stream in arrival order.
#[derive(Debug, Clone)]
pub struct TokioLauncher {
    sandbox: PathBuf,
}

impl TokioLauncher {
    /// Create a launcher resolving executables against `sandbox` first.
    #[must_use]
    pub fn new(sandbox: impl Into<PathBuf>) -> Self {
        Self {
            sandbox: sandbox.into(),
        }
    }

    /// The sandbox root.
    #[must_use]
    pub fn sandbox(&self) -> &std::path::Path {
        &self.sandbox
    }
}

/// `PATH` the child will see, if the request overrides it.
fn search_path(request: &LaunchRequest) -> Option<OsString> {
    match request.env.get("PATH") {
        Some(Some(value)) => Some(OsString::from(value)),
        Some(None) => Some(OsString::new()),
        None if request.clear_env => Some(OsString::new()),
        None => None,
    }
}

fn describe(executable: &std::path::Path, arguments: &[String]) -> String {
    let program = executable.to_string_lossy();
    shlex::try_join(std::iter::once(program.as_ref()).chain(arguments.iter().map(String::as_str)))
        .unwrap_or_else(|_| program.into_owned())
}

#[async_trait]
impl ProcessLauncher for TokioLauncher {
    async fn spawn(&self, request: LaunchRequest) -> Result<Box<dyn LaunchedProcess>, LaunchError> {
        let executable = resolve_executable(
            &self.sandbox,
            &request.executable.to_string_lossy(),
            search_path(&request),
        )
        .await?;

        let mut command = Command::new(&executable);
        command
            .args(&request.arguments)
            .current_dir(&request.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.clear_env {
            command.env_clear();
        }
        for (name, value) in &request.env {
            match value {
                Some(value) => command.env(name, value),
                None => command.env_remove(name),
            };
        }

        let mut child = command.group_spawn().map_err(|err| {
            LaunchError::SpawnFailed(format!("{}: {err}", executable.display()))
        })?;

        tracing::debug!(
            pid = ?child.id(),
            command = %describe(&executable, &request.arguments),
            cwd = %request.working_dir.display(),
            "Spawned process group"
        );

        let (sink, output) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.inner().stdout.take() {
            pumps.push(spawn_pump(stdout, sink.clone()));
        }
        if let Some(stderr) = child.inner().stderr.take() {
            pumps.push(spawn_pump(stderr, sink.clone()));
        }
        drop(sink);

        Ok(Box::new(GroupProcess {
            child,
            output,
            pending: Vec::new(),
            pending_offset: 0,
            pumps,
            exited: false,
        }))
    }
}

fn spawn_pump<R>(mut source: R, sink: mpsc::Sender<OutputChunk>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; PUMP_CHUNK_SIZE];
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if sink.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    let _ = sink.send(Err(err)).await;
                    break;
                }
            }
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal().map_or(-1, |signal| 128 + signal)
    }
    #[cfg(not(unix))]
    {
        -1
    }
}

struct GroupProcess {
    child: AsyncGroupChild,
    output: mpsc::Receiver<OutputChunk>,
    pending: Vec<u8>,
    pending_offset: usize,
    pumps: Vec<JoinHandle<()>>,
    exited: bool,
}

#[async_trait]
impl LaunchedProcess for GroupProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, LaunchError> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pending_offset >= self.pending.len() {
            match self.output.recv().await {
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pending_offset = 0;
                }
                Some(Err(err)) => return Err(err.into()),
                None => return Ok(0),
            }
        }
        let available = &self.pending[self.pending_offset..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.pending_offset += n;
        Ok(n)
    }

    async fn wait(&mut self) -> Result<i32, LaunchError> {
        let status = self.child.wait().await?;
        self.exited = true;
        Ok(exit_code(status))
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        if self.exited {
            return Ok(());
        }
        self.child.kill().await?;
        self.exited = true;
        Ok(())
    }
}

impl Drop for GroupProcess {
    fn drop(&mut self) {
        if !self.exited {
            if let Err(err) = self.child.start_kill() {
                tracing::debug!(?err, "Failed to kill abandoned process group");
            }
        }
        for pump in &self.pumps {
            pump.abort();
        }
    }
}
