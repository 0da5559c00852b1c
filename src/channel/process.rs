//! Child-process transport.
//!
//! The worker runs as a child process and speaks NDJSON (newline-delimited
//! JSON) over stdin/stdout: one [`CommandEnvelope`] per line in, one
//! [`WorkerMessage`] per line out. Worker stderr is inherited.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::error::{ChannelError, ChannelResult};
use super::protocol::{CommandEnvelope, WorkerMessage};
use super::transport::{InboundSink, Transport, TransportSpawner};

/// Spawns the worker executable for each new session.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new<P: AsRef<Path>>(program: P) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
        }
    }

    /// Command-line arguments passed to the worker.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

#[async_trait]
impl TransportSpawner for ProcessSpawner {
    async fn spawn(&self, inbound: InboundSink) -> ChannelResult<Box<dyn Transport>> {
        let transport = ProcessTransport::spawn(&self.program, &self.args, inbound)?;
        Ok(Box::new(transport))
    }
}

/// A running worker process.
pub struct ProcessTransport {
    /// Writer for sending commands to worker stdin. `None` once terminated.
    stdin: Mutex<Option<BufWriter<ChildStdin>>>,

    /// Handle to the worker child process.
    child: Mutex<Option<Child>>,

    /// Handle to the background reader task.
    reader_task: JoinHandle<()>,
}

impl ProcessTransport {
    /// Spawn the worker and start forwarding its stdout to `inbound`.
    pub fn spawn<P: AsRef<Path>>(
        program: P,
        args: &[String],
        inbound: InboundSink,
    ) -> ChannelResult<Self> {
        let program = program.as_ref();
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ChannelError::SpawnFailed(format!("{}: {e}", program.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ChannelError::SpawnFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ChannelError::SpawnFailed("stdout not captured".to_string()))?;

        tracing::debug!(program = %program.display(), pid = ?child.id(), "worker process started");

        Ok(Self {
            stdin: Mutex::new(Some(BufWriter::new(stdin))),
            child: Mutex::new(Some(child)),
            reader_task: Self::spawn_reader_task(stdout, inbound),
        })
    }

    /// Spawn the background task that reads worker messages.
    ///
    /// The task owns the sink; when stdout closes the sink is dropped, which
    /// the channel observes as the worker going away.
    fn spawn_reader_task(stdout: ChildStdout, inbound: InboundSink) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout);
            let mut line = String::new();

            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) if line.trim().is_empty() => continue,
                    Ok(_) => match WorkerMessage::from_line(&line) {
                        Ok(message) => {
                            if !inbound.deliver(message) {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, line = line.trim_end(), "unparseable worker message");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "worker read error");
                        break;
                    }
                }
            }
            tracing::debug!("worker stdout closed");
        })
    }

    /// Whether the reader is still attached to the worker.
    pub fn is_alive(&self) -> bool {
        !self.reader_task.is_finished()
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn send(&self, envelope: &CommandEnvelope) -> ChannelResult<()> {
        let line = envelope
            .to_line()
            .map_err(|e| ChannelError::SerializeFailed(e.to_string()))?;

        if !self.is_alive() {
            return Err(ChannelError::SendFailed("worker output closed".to_string()));
        }

        let mut stdin = self.stdin.lock().await;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| ChannelError::SendFailed("worker terminated".to_string()))?;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| ChannelError::SendFailed(e.to_string()))
    }

    async fn terminate(&self) {
        // Closing stdin lets a well-behaved worker exit on its own.
        self.stdin.lock().await.take();

        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                tracing::debug!(error = %e, "worker already exited");
            }
        }
        self.reader_task.abort();
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        // The child is killed by `kill_on_drop`.
        self.reader_task.abort();
    }
}
