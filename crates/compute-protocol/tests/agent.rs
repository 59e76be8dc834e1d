//! End-to-end tests: a client and an agent over an in-memory socket pair.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bytes::Bytes;
use compute_buffer::BufferOptions;
use compute_core::{
    BlobStorage, ExecuteRequest, LaunchError, LaunchRequest, LaunchedProcess, ProcessLauncher,
};
use compute_exec::TokioLauncher;
use compute_protocol::{
    AgentConfig, ComputeClient, ComputeHandler, MessageType, ProcessError, ProtocolError,
    ProtocolResult, ROOT_CHANNEL_ID,
    catalog::XorResponse,
};
use compute_storage::{MemoryStorage, upload_directory};
use compute_transport::ComputeSocket;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Process that replays canned output chunks.
struct ScriptedProcess {
    chunks: VecDeque<&'static [u8]>,
    exit_code: i32,
    hang: bool,
    killed: Arc<AtomicBool>,
}

#[async_trait]
impl LaunchedProcess for ScriptedProcess {
    fn id(&self) -> Option<u32> {
        Some(42)
    }

    async fn read_output(&mut self, buf: &mut [u8]) -> Result<usize, LaunchError> {
        match self.chunks.pop_front() {
            Some(chunk) => {
                buf[..chunk.len()].copy_from_slice(chunk);
                Ok(chunk.len())
            }
            None if self.hang => std::future::pending().await,
            None => Ok(0),
        }
    }

    async fn wait(&mut self) -> Result<i32, LaunchError> {
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> Result<(), LaunchError> {
        self.killed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct ScriptedLauncher {
    chunks: Vec<&'static [u8]>,
    exit_code: i32,
    hang: bool,
    killed: Arc<AtomicBool>,
    requests: Mutex<Vec<LaunchRequest>>,
}

impl ScriptedLauncher {
    fn new(chunks: &[&'static [u8]], exit_code: i32) -> Self {
        Self {
            chunks: chunks.to_vec(),
            exit_code,
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessLauncher for ScriptedLauncher {
    async fn spawn(&self, request: LaunchRequest) -> Result<Box<dyn LaunchedProcess>, LaunchError> {
        self.requests.lock().unwrap().push(request);
        Ok(Box::new(ScriptedProcess {
            chunks: self.chunks.iter().copied().collect(),
            exit_code: self.exit_code,
            hang: self.hang,
            killed: Arc::clone(&self.killed),
        }))
    }
}

struct Harness {
    client: ComputeClient,
    storage: Arc<MemoryStorage>,
    sandbox: TempDir,
    cancel: CancellationToken,
    agent: JoinHandle<ProtocolResult<()>>,
}

fn options() -> BufferOptions {
    BufferOptions::default().chunk_length(64 * 1024)
}

fn start(launcher: Arc<dyn ProcessLauncher>) -> Harness {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let initiator = ComputeSocket::new(a);
    let agent_socket = ComputeSocket::new(b);
    let storage = Arc::new(MemoryStorage::new());
    let sandbox = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();

    let mut config = AgentConfig::new(sandbox.path());
    config.channel_options = options();
    let serving = ComputeHandler::new(agent_socket, storage.clone(), launcher, config)
        .with_cancellation(cancel.clone())
        .serve_root()
        .unwrap();
    let agent = tokio::spawn(serving);
    let client = ComputeClient::connect(&initiator, ROOT_CHANNEL_ID, options()).unwrap();

    Harness {
        client,
        storage,
        sandbox,
        cancel,
        agent,
    }
}

fn write(root: &Path, relative: &str, data: &[u8]) {
    let path = root.join(relative);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, data).unwrap();
}

#[tokio::test]
async fn test_execute_streams_lines_and_exit_code() {
    let harness = start(Arc::new(ScriptedLauncher::new(&[b"hi\n"], 0)));

    let mut process = harness.client.execute(ExecuteRequest::new("tool")).await.unwrap();
    let (lines, exit_code) = process.output().await.unwrap();

    assert_eq!(lines, vec!["hi"]);
    assert_eq!(exit_code, 0);
}

#[tokio::test]
async fn test_execute_joins_lines_split_across_chunks() {
    let launcher = Arc::new(ScriptedLauncher::new(&[b"ab", b"c\n"], 3));
    let harness = start(launcher.clone());

    let request = ExecuteRequest::new("tool")
        .args(["--flag"])
        .working_dir("work")
        .env("MODE", "fast")
        .replace_environment();
    let mut process = harness.client.execute(request).await.unwrap();
    let (lines, exit_code) = process.output().await.unwrap();

    assert_eq!(lines, vec!["abc"]);
    assert_eq!(exit_code, 3);

    let requests = launcher.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].executable, Path::new("tool"));
    assert_eq!(requests[0].arguments, vec!["--flag"]);
    assert_eq!(requests[0].working_dir, harness.sandbox.path().join("work"));
    assert_eq!(requests[0].env.get("MODE"), Some(&Some("fast".to_string())));
    assert!(requests[0].clear_env);
}

#[tokio::test]
async fn test_execute_outside_sandbox_is_an_exception() {
    let harness = start(Arc::new(ScriptedLauncher::default()));

    let request = ExecuteRequest::new("tool").working_dir("../elsewhere");
    let mut process = harness.client.execute(request).await.unwrap();
    assert!(matches!(
        process.wait().await,
        Err(ProcessError::Remote { ref message, .. }) if message.contains("escapes sandbox")
    ));

    let reply = harness.client.xor(1, vec![1, 2]).await.unwrap();
    assert_eq!(&reply[..], &[0, 3]);
}

#[tokio::test]
async fn test_xor_round_trip() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let reply = harness.client.xor(0x0f, vec![0x00, 0xff, 0x0f]).await.unwrap();
    assert_eq!(&reply[..], &[0x0f, 0xf0, 0x00]);

    let empty = harness.client.xor(0xaa, Bytes::new()).await.unwrap();
    assert!(empty.is_empty());
}

#[tokio::test]
async fn test_write_files_then_read_blob() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let source = tempfile::tempdir().unwrap();
    write(source.path(), "a.txt", b"hello");
    write(source.path(), "sub/b.txt", b"nested");
    let tree = upload_directory(harness.storage.as_ref(), source.path())
        .await
        .unwrap();

    harness.client.write_files("out", &tree).await.unwrap();
    let out = harness.sandbox.path().join("out");
    assert_eq!(std::fs::read(out.join("a.txt")).unwrap(), b"hello");
    assert_eq!(std::fs::read(out.join("sub/b.txt")).unwrap(), b"nested");

    let node = harness.storage.read_tree(&tree).await.unwrap();
    let file = &node.files[0].locator;
    let whole = harness.client.read_blob(file, 0, 0).await.unwrap();
    assert_eq!(&whole[..], b"hello");
    let range = harness.client.read_blob(file, 1, 3).await.unwrap();
    assert_eq!(&range[..], b"ell");
}

#[tokio::test]
async fn test_read_blob_larger_than_a_response() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let data: Vec<u8> = (0..1_300_000u32).map(|i| (i % 251) as u8).collect();
    let locator = harness
        .storage
        .write_blob(Bytes::from(data.clone()))
        .await
        .unwrap();

    let read = harness.client.read_blob(&locator, 0, 0).await.unwrap();
    assert_eq!(read.len(), data.len());
    assert!(read[..] == data[..]);

    let empty = harness
        .storage
        .write_blob(Bytes::new())
        .await
        .unwrap();
    assert!(harness.client.read_blob(&empty, 0, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_requests_keep_the_channel_open() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let tree = harness
        .storage
        .write_tree(&compute_core::DirectoryNode::default())
        .await
        .unwrap();

    let escaped = harness.client.write_files("../escape", &tree).await;
    assert!(matches!(
        escaped,
        Err(ProtocolError::Remote { ref message, .. }) if message.contains("escapes sandbox")
    ));

    let missing = compute_core::BlobLocator::for_content(b"never stored");
    assert!(matches!(
        harness.client.read_blob(&missing, 0, 0).await,
        Err(ProtocolError::Remote { .. })
    ));
    assert!(matches!(
        harness.client.read_blob(&missing, -1, 4).await,
        Err(ProtocolError::Remote { ref message, .. }) if message.contains("negative offset")
    ));

    assert_eq!(&harness.client.xor(1, vec![1]).await.unwrap()[..], &[0]);
}

#[tokio::test]
async fn test_delete_files() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let root = harness.sandbox.path();
    write(root, "keep.txt", b"k");
    write(root, "drop.log", b"d");
    write(root, "build/out.o", b"o");

    harness
        .client
        .delete_files(["*.log", "build"])
        .await
        .unwrap();
    // Deletes are not acknowledged; the next reply orders them.
    harness.client.xor(0, vec![0]).await.unwrap();

    assert!(root.join("keep.txt").exists());
    assert!(!root.join("drop.log").exists());
    assert!(!root.join("build").exists());
}

#[tokio::test]
async fn test_forked_channel_is_served() {
    let harness = start(Arc::new(ScriptedLauncher::new(&[b"forked\n"], 0)));

    let forked = harness.client.fork(5, 64 * 1024).await.unwrap();
    forked.wait_for_attach().await.unwrap();

    let reply = forked.xor(0xff, vec![0xff]).await.unwrap();
    assert_eq!(&reply[..], &[0x00]);
    let (lines, _) = forked
        .execute(ExecuteRequest::new("tool"))
        .await
        .unwrap()
        .output()
        .await
        .unwrap();
    assert_eq!(lines, vec!["forked"]);

    let root_reply = harness.client.xor(1, vec![1]).await.unwrap();
    assert_eq!(&root_reply[..], &[0]);

    forked.close().await;
    harness.client.close().await;
    harness.agent.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_fork_onto_open_channel_is_rejected() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let first = harness.client.fork(3, 4096).await.unwrap();
    first.wait_for_attach().await.unwrap();

    // The agent already serves channel 3, so the second fork fails there.
    harness
        .client
        .channel()
        .send(&compute_protocol::catalog::Fork {
            channel_id: 3,
            buffer_size: 0,
        })
        .await
        .unwrap();
    assert!(matches!(
        harness.client.xor(0, vec![0]).await,
        Err(ProtocolError::Remote { ref message, .. }) if message.contains("already in use")
    ));
}

#[tokio::test]
async fn test_unknown_message_closes_channel() {
    let harness = start(Arc::new(ScriptedLauncher::default()));
    let channel = harness.client.channel();
    channel
        .send_raw(MessageType::from_tag(0x7f), b"junk")
        .await
        .unwrap();

    assert!(matches!(
        channel.receive_as::<XorResponse>().await,
        Err(ProtocolError::Remote { .. })
    ));
    assert!(channel.receive().await.unwrap().is_none());
    assert!(matches!(
        harness.agent.await.unwrap(),
        Err(ProtocolError::UnexpectedMessage { .. })
    ));
}

#[tokio::test]
async fn test_cancellation_kills_running_process() {
    let launcher = Arc::new(ScriptedLauncher {
        chunks: vec![&b"started\n"[..]],
        hang: true,
        ..ScriptedLauncher::default()
    });
    let harness = start(launcher.clone());

    let mut process = harness.client.execute(ExecuteRequest::new("tool")).await.unwrap();
    assert_eq!(process.next_line().await, Ok(Some("started".to_string())));

    harness.cancel.cancel();
    assert!(matches!(
        harness.agent.await.unwrap(),
        Err(ProtocolError::Cancelled)
    ));
    assert!(launcher.killed.load(Ordering::SeqCst));
    assert_eq!(process.wait().await, Err(ProcessError::ChannelClosed));
}

#[tokio::test]
async fn test_missing_executable_is_an_exception() {
    let sandbox = tempfile::tempdir().unwrap();
    let harness = start(Arc::new(TokioLauncher::new(sandbox.path())));

    let mut process = harness
        .client
        .execute(ExecuteRequest::new("definitely-not-an-installed-tool"))
        .await
        .unwrap();
    assert!(matches!(
        process.wait().await,
        Err(ProcessError::Remote { .. })
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_real_process_output() {
    let sandbox = tempfile::tempdir().unwrap();
    let harness = start(Arc::new(TokioLauncher::new(sandbox.path())));

    let request = ExecuteRequest::new("/bin/sh").args(["-c", "printf ab; echo c; exit 4"]);
    let mut process = harness.client.execute(request).await.unwrap();
    let (lines, exit_code) = process.output().await.unwrap();

    assert_eq!(lines, vec!["abc"]);
    assert_eq!(exit_code, 4);
}
