//! `Execute`: run a process and stream its output.

use std::{path::PathBuf, time::Duration};

use bytes::Bytes;
use compute_core::{ExecuteRequest, LaunchRequest, LaunchedProcess, resolve_in_sandbox};
use compute_transport::{WORKER_IPC_ENV_VAR, WorkerBridge};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ComputeHandler, request_error};
use crate::{
    catalog::{ExecuteOutput, ExecuteResult},
    channel::MessageChannel,
    error::{ProtocolError, ProtocolResult},
};

/// How long a worker relay may keep draining after its process exits.
const WORKER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

struct WorkerRelay {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

impl WorkerRelay {
    /// Stop waiting for a connection and give an established relay a grace
    /// period to drain.
    fn finish(self) {
        self.cancel.cancel();
        let mut task = self.task;
        tokio::spawn(async move {
            if tokio::time::timeout(WORKER_DRAIN_TIMEOUT, &mut task).await.is_err() {
                tracing::debug!("Worker relay still open after process exit; aborting");
                task.abort();
            }
        });
    }
}

impl ComputeHandler {
    pub(super) async fn execute(
        &self,
        channel: &MessageChannel,
        request: ExecuteRequest,
    ) -> ProtocolResult<()> {
        let sandbox = &self.config.sandbox;
        let working_dir = match &request.working_dir {
            Some(dir) => resolve_in_sandbox(sandbox, dir)?,
            None => sandbox.clone(),
        };

        let mut env = request.env.clone();
        let relay = match request.worker_channel {
            Some(channel_id) => {
                let (address, relay) = self.start_worker_relay(channel_id).await?;
                env.insert(WORKER_IPC_ENV_VAR.to_string(), Some(address));
                Some(relay)
            }
            None => None,
        };

        let launch = LaunchRequest {
            executable: PathBuf::from(&request.executable),
            arguments: request.arguments.clone(),
            working_dir,
            env,
            clear_env: request.replaces_environment(),
        };
        let result = match self.launcher.spawn(launch).await {
            Ok(process) => self.stream_process(channel, process).await,
            Err(err) => Err(err.into()),
        };
        if let Some(relay) = relay {
            relay.finish();
        }

        let exit_code = result?;
        tracing::debug!(
            channel_id = channel.id(),
            executable = %request.executable,
            exit_code,
            "Process exited"
        );
        channel.send(&ExecuteResult { exit_code }).await
    }

    /// Bind a worker bridge relayed over `channel_id`, returning the address
    /// to export and the running relay.
    async fn start_worker_relay(&self, channel_id: i32) -> ProtocolResult<(String, WorkerRelay)> {
        let bridge = WorkerBridge::bind().await.map_err(request_error)?;
        let address = bridge.address().to_string();
        let worker_channel = self
            .socket
            .create_channel(channel_id, self.config.channel_options)
            .map_err(request_error)?;

        let cancel = self.cancel.child_token();
        let serving = bridge.serve(worker_channel, cancel.clone());
        let task = tokio::spawn(async move {
            if let Err(err) = serving.await {
                tracing::warn!(channel_id, %err, "Worker relay failed");
            }
        });
        tracing::debug!(channel_id, %address, "Worker bridge listening");
        Ok((address, WorkerRelay { task, cancel }))
    }

    /// Relay output until the process closes it, then wait for the exit code.
    /// The process is killed if relaying fails or the handler is cancelled.
    async fn stream_process(
        &self,
        channel: &MessageChannel,
        mut process: Box<dyn LaunchedProcess>,
    ) -> ProtocolResult<i32> {
        tracing::debug!(channel_id = channel.id(), pid = ?process.id(), "Process started");
        let result = self.relay_output(channel, process.as_mut()).await;
        if result.is_err() {
            if let Err(err) = process.kill().await {
                tracing::warn!(channel_id = channel.id(), %err, "Failed to kill process");
            }
        }
        result
    }

    async fn relay_output(
        &self,
        channel: &MessageChannel,
        process: &mut dyn LaunchedProcess,
    ) -> ProtocolResult<i32> {
        let mut buf = vec![0u8; self.config.output_chunk_size.max(1)];
        loop {
            let read = tokio::select! {
                () = self.cancel.cancelled() => None,
                read = process.read_output(&mut buf) => Some(read),
            };
            let Some(read) = read else {
                return Err(ProtocolError::Cancelled);
            };
            let len = read?;
            if len == 0 {
                break;
            }
            channel
                .send(&ExecuteOutput {
                    data: Bytes::copy_from_slice(&buf[..len]),
                })
                .await?;
        }

        tokio::select! {
            () = self.cancel.cancelled() => Err(ProtocolError::Cancelled),
            exit_code = process.wait() => Ok(exit_code?),
        }
    }
}
