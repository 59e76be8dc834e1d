//! Initiator-side handle for a remotely executed process.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_stream::{Stream, StreamExt, wrappers::UnboundedReceiverStream};

use crate::{
    catalog::TypedMessage,
    channel::MessageChannel,
    error::{ProcessError, ProtocolError},
};

type LineResult = Result<String, ProcessError>;
type ExitResult = Result<i32, ProcessError>;

/// Reassembles output chunks into lines.
///
/// Splits on `\n`, strips a trailing `\r`, and carries an unterminated tail
/// over to the next chunk.
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Feed a chunk and return the lines it completes.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            lines.push(Self::decode(&std::mem::take(&mut self.partial)));
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// Take the unterminated tail, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(Self::decode(&std::mem::take(&mut self.partial)))
        }
    }

    fn decode(line: &[u8]) -> String {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }
}

/// A process running on the remote agent.
///
/// A background relay task turns the channel's `ExecuteOutput` messages into
/// lines and its `ExecuteResult` into the exit code. An `Exception`, an
/// unexpected message or the end of the channel faults both: consumers see
/// every line received so far, then the error.
///
/// The handle is also a [`Stream`] of lines.
#[derive(Debug)]
pub struct ManagedProcess {
    lines: UnboundedReceiverStream<LineResult>,
    exit: Option<oneshot::Receiver<ExitResult>>,
    outcome: Option<ExitResult>,
    relay: JoinHandle<()>,
}

impl ManagedProcess {
    /// Start relaying messages from `channel`, which must carry nothing but
    /// this process's output until it finishes.
    #[must_use]
    pub fn spawn(channel: Arc<MessageChannel>) -> Self {
        let (line_tx, lines) = mpsc::unbounded_channel();
        let (exit_tx, exit) = oneshot::channel();
        let relay = tokio::spawn(relay(channel, line_tx, exit_tx));
        Self {
            lines: UnboundedReceiverStream::new(lines),
            exit: Some(exit),
            outcome: None,
            relay,
        }
    }

    /// Next line of output, or `None` once the process has exited.
    ///
    /// # Errors
    /// Returns the fault that ended the relay, after all buffered lines.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProcessError> {
        match self.lines.next().await {
            Some(Ok(line)) => Ok(Some(line)),
            Some(Err(fault)) => Err(fault),
            None => Ok(None),
        }
    }

    /// Wait for the exit code.
    ///
    /// # Errors
    /// Returns the fault that ended the relay.
    pub async fn wait(&mut self) -> Result<i32, ProcessError> {
        if let Some(exit) = self.exit.take() {
            let outcome = exit.await.unwrap_or(Err(ProcessError::ChannelClosed));
            self.outcome = Some(outcome);
        }
        self.outcome
            .clone()
            .unwrap_or(Err(ProcessError::ChannelClosed))
    }

    /// Read every line, then the exit code.
    ///
    /// # Errors
    /// Returns the fault that ended the relay.
    pub async fn output(&mut self) -> Result<(Vec<String>, i32), ProtocolError> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await? {
            lines.push(line);
        }
        let exit_code = self.wait().await?;
        Ok((lines, exit_code))
    }
}

impl Stream for ManagedProcess {
    type Item = LineResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().lines).poll_next(cx)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.relay.abort();
    }
}

async fn relay(
    channel: Arc<MessageChannel>,
    lines: mpsc::UnboundedSender<LineResult>,
    exit: oneshot::Sender<ExitResult>,
) {
    let mut splitter = LineSplitter::default();
    let outcome = loop {
        let message = match channel.receive().await {
            Ok(message) => message,
            Err(err) => break Err(ProcessError::Malformed(err.to_string())),
        };
        match TypedMessage::parse(&message) {
            Ok(TypedMessage::ExecuteOutput(output)) => {
                for line in splitter.push(&output.data) {
                    let _ = lines.send(Ok(line));
                }
            }
            Ok(TypedMessage::ExecuteResult(result)) => break Ok(result.exit_code),
            Ok(TypedMessage::Exception(exception)) => {
                break Err(ProcessError::Remote {
                    message: exception.message,
                    trace: exception.trace,
                });
            }
            Ok(TypedMessage::None) => break Err(ProcessError::ChannelClosed),
            Ok(other) => break Err(ProcessError::UnexpectedMessage(other.message_type())),
            Err(ProtocolError::UnexpectedMessage { actual, .. }) => {
                break Err(ProcessError::UnexpectedMessage(actual));
            }
            Err(err) => break Err(ProcessError::Malformed(err.to_string())),
        }
    };

    if let Some(line) = splitter.finish() {
        let _ = lines.send(Ok(line));
    }
    match &outcome {
        Ok(exit_code) => tracing::debug!(channel_id = channel.id(), exit_code, "Remote process exited"),
        Err(fault) => {
            tracing::debug!(channel_id = channel.id(), %fault, "Remote process faulted");
            let _ = lines.send(Err(fault.clone()));
        }
    }
    let _ = exit.send(outcome);
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use compute_buffer::RingBuffer;

    use super::*;
    use crate::catalog::{Exception, ExecuteOutput, ExecuteResult, XorResponse};

    #[test]
    fn test_splitter_reassembles_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"ab").is_empty());
        assert_eq!(splitter.push(b"c\r\nd\n\nef"), vec!["abc", "d", ""]);
        assert_eq!(splitter.finish().as_deref(), Some("ef"));
        assert_eq!(splitter.finish(), None);
    }

    fn pair() -> (MessageChannel, Arc<MessageChannel>) {
        let forward = RingBuffer::create(1, 2, 256).unwrap();
        let backward = RingBuffer::create(1, 2, 256).unwrap();
        let agent = MessageChannel::from_parts(
            1,
            backward.create_reader().unwrap(),
            forward.create_writer().unwrap(),
        );
        let initiator = MessageChannel::from_parts(
            1,
            forward.create_reader().unwrap(),
            backward.create_writer().unwrap(),
        );
        (agent, Arc::new(initiator))
    }

    fn output(data: &'static [u8]) -> ExecuteOutput {
        ExecuteOutput {
            data: Bytes::from_static(data),
        }
    }

    #[tokio::test]
    async fn test_lines_then_exit_code() {
        let (agent, initiator) = pair();
        let mut process = ManagedProcess::spawn(initiator);

        agent.send(&output(b"ab")).await.unwrap();
        agent.send(&output(b"c\n")).await.unwrap();
        agent.send(&ExecuteResult { exit_code: 0 }).await.unwrap();

        let (lines, exit_code) = process.output().await.unwrap();
        assert_eq!(lines, vec!["abc"]);
        assert_eq!(exit_code, 0);
        assert_eq!(process.wait().await, Ok(0));
    }

    #[tokio::test]
    async fn test_lines_as_stream() {
        let (agent, initiator) = pair();
        let process = ManagedProcess::spawn(initiator);

        agent.send(&output(b"one\ntwo\nthr")).await.unwrap();
        agent.send(&ExecuteResult { exit_code: 1 }).await.unwrap();

        let lines: Vec<_> = process.collect().await;
        assert_eq!(
            lines,
            vec![Ok("one".to_string()), Ok("two".into()), Ok("thr".into())]
        );
    }

    #[tokio::test]
    async fn test_exception_faults_lines_and_exit() {
        let (agent, initiator) = pair();
        let mut process = ManagedProcess::spawn(initiator);

        agent.send(&output(b"partial")).await.unwrap();
        agent
            .send(&Exception {
                message: "spawn failed".into(),
                trace: "caused by: no such file".into(),
            })
            .await
            .unwrap();

        assert_eq!(process.next_line().await, Ok(Some("partial".into())));
        let fault = process.next_line().await.unwrap_err();
        assert!(matches!(fault, ProcessError::Remote { ref message, .. } if message == "spawn failed"));
        assert_eq!(process.wait().await, Err(fault));
    }

    #[tokio::test]
    async fn test_unexpected_message_is_a_fault() {
        let (agent, initiator) = pair();
        let mut process = ManagedProcess::spawn(initiator);
        agent
            .send(&XorResponse {
                data: Bytes::new(),
            })
            .await
            .unwrap();
        assert!(matches!(
            process.wait().await,
            Err(ProcessError::UnexpectedMessage(_))
        ));
    }

    #[tokio::test]
    async fn test_channel_end_is_a_fault() {
        let (agent, initiator) = pair();
        let mut process = ManagedProcess::spawn(initiator);
        agent.close().await;
        assert_eq!(process.wait().await, Err(ProcessError::ChannelClosed));
        assert_eq!(process.next_line().await, Err(ProcessError::ChannelClosed));
        assert_eq!(process.next_line().await, Ok(None));
    }
}
