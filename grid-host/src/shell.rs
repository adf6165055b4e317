//! Command execution on remote login shells.
//!
//! Commands run inside long-lived shells, so there is no exit
//! notification to wait for. Instead every command is followed by a
//! sentinel: guard lines that neutralize an unbalanced backtick or quote
//! left open by the command, then an `echo` of a unique marker. The reader
//! collects output lines until the marker comes back.
//!
//! Two kinds of stream carry such shells: the raw session stream of the
//! frontend shell, and logical connections to compute nodes.

use crate::session::SessionStream;
use async_trait::async_trait;
use gridtest_mux::connection::LogicalConnection;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, MutexGuard};

/// Errors from running commands on a remote shell.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// I/O failure on a raw shell stream.
    #[error("shell I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure underneath a multiplexed shell.
    #[error("shell transport error: {0}")]
    Mux(#[from] gridtest_mux::error::MuxError),

    /// The shell produced output that is not valid UTF-8.
    #[error("shell output is not valid UTF-8")]
    InvalidUtf8,

    /// The stream ended before the command's marker came back.
    #[error("shell stream ended before the command finished")]
    UnexpectedEof,
}

/// Anything that can run a shell command and return its output.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` and return its trimmed output.
    async fn run(&self, command: &str) -> Result<String, ShellError>;
}

static MARKER_SEQ: AtomicU64 = AtomicU64::new(0);

fn next_marker() -> String {
    let seq = MARKER_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("gridtest-done-{seq:08x}")
}

/// The command plus its sentinel tail.
///
/// The three guard comments close a stray backtick, single quote or double
/// quote the command may have left open, so the echo that follows always
/// runs. The echo's quote spans the line break, putting the marker on a
/// line of its own.
fn sentinel_block(command: &str, marker: &str) -> String {
    format!("{command}\n# `\n# '\n# \"\necho \"\n{marker}\"\n")
}

fn collect_until_marker(output: &mut String, line: &[u8], marker: &str) -> Result<bool, ShellError> {
    let line = std::str::from_utf8(line).map_err(|_| ShellError::InvalidUtf8)?;
    if line.trim() == marker {
        return Ok(true);
    }
    output.push_str(line);
    Ok(false)
}

/// Send a sentinel-guarded command over a logical connection.
///
/// Returns the marker; pass it to [`finish_command`] to collect the
/// output. Nothing else may read from the connection in between.
pub async fn start_command(
    conn: &LogicalConnection,
    command: &str,
) -> Result<String, ShellError> {
    let marker = next_marker();
    conn.write(sentinel_block(command, &marker).as_bytes())
        .await?;
    Ok(marker)
}

/// Collect a started command's output, up to its marker.
pub async fn finish_command(
    conn: &LogicalConnection,
    marker: &str,
) -> Result<String, ShellError> {
    let mut output = String::new();
    loop {
        let line = conn.read_line().await?;
        if line.is_empty() {
            return Err(ShellError::UnexpectedEof);
        }
        if collect_until_marker(&mut output, &line, marker)? {
            break;
        }
    }
    Ok(output.trim().to_string())
}

/// Run one sentinel-guarded command over a logical connection.
pub async fn run_command(
    conn: &LogicalConnection,
    command: &str,
) -> Result<String, ShellError> {
    let marker = start_command(conn, command).await?;
    finish_command(conn, &marker).await
}

/// The stream carrying a master shell.
enum ShellIo {
    Raw {
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    },
    Mux(LogicalConnection),
}

impl ShellIo {
    async fn send(&mut self, data: &[u8]) -> Result<(), ShellError> {
        match self {
            ShellIo::Raw { writer, .. } => {
                writer.write_all(data).await?;
                writer.flush().await?;
                Ok(())
            }
            ShellIo::Mux(conn) => Ok(conn.write(data).await?),
        }
    }

    async fn recv_line(&mut self) -> Result<Vec<u8>, ShellError> {
        match self {
            ShellIo::Raw { reader, .. } => {
                let mut line = Vec::new();
                reader.read_until(b'\n', &mut line).await?;
                Ok(line)
            }
            ShellIo::Mux(conn) => Ok(conn.read_line().await?),
        }
    }
}

/// A long-lived remote shell that commands are funneled through.
///
/// Serializes commands: only one runs at a time, and a command started
/// with [`start`] holds the shell until it is finished.
///
/// [`start`]: MasterShell::start
pub struct MasterShell {
    io: Mutex<ShellIo>,
}

impl MasterShell {
    /// Wrap the raw stream of a shell started on the frontend.
    pub fn from_stream(stream: SessionStream) -> Self {
        Self {
            io: Mutex::new(ShellIo::Raw {
                writer: stream.writer,
                reader: BufReader::new(stream.reader),
            }),
        }
    }

    /// Wrap a logical connection carrying a shell.
    pub fn from_connection(conn: LogicalConnection) -> Self {
        Self {
            io: Mutex::new(ShellIo::Mux(conn)),
        }
    }

    /// Start a command without waiting for it to finish.
    ///
    /// The shell stays locked until the returned handle is finished or
    /// dropped.
    pub async fn start(&self, command: &str) -> Result<PendingCommand<'_>, ShellError> {
        let mut io = self.io.lock().await;
        let marker = next_marker();
        io.send(sentinel_block(command, &marker).as_bytes()).await?;
        Ok(PendingCommand { io, marker })
    }

    /// Shut the shell's stream down.
    pub async fn close(&self) {
        let mut io = self.io.lock().await;
        match &mut *io {
            ShellIo::Raw { writer, .. } => {
                if let Err(err) = writer.shutdown().await {
                    tracing::warn!(error = %err, "error shutting down master shell stream");
                }
            }
            ShellIo::Mux(conn) => conn.close().await,
        }
    }
}

#[async_trait]
impl CommandRunner for MasterShell {
    async fn run(&self, command: &str) -> Result<String, ShellError> {
        let pending = self.start(command).await?;
        pending.finish().await
    }
}

/// A command sent but not yet finished.
pub struct PendingCommand<'a> {
    io: MutexGuard<'a, ShellIo>,
    marker: String,
}

impl PendingCommand<'_> {
    /// Wait for the command to finish and return its trimmed output.
    pub async fn finish(mut self) -> Result<String, ShellError> {
        let mut output = String::new();
        loop {
            let line = self.io.recv_line().await?;
            if line.is_empty() {
                return Err(ShellError::UnexpectedEof);
            }
            if collect_until_marker(&mut output, &line, &self.marker)? {
                break;
            }
        }
        Ok(output.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{HeadSession, MockCommandHandler, MockHeadSession};
    use gridtest_mux::channel::{Channel, ConnectionIds};
    use std::sync::Arc;

    async fn raw_shell(handler: MockCommandHandler) -> (MasterShell, Arc<MockHeadSession>) {
        let session = Arc::new(MockHeadSession::new("fs0.grid.example.org", handler));
        let stream = session.exec("bash -l").await.unwrap();
        (MasterShell::from_stream(stream), session)
    }

    async fn mux_shell(handler: MockCommandHandler) -> (MasterShell, Arc<MockHeadSession>) {
        let session = Arc::new(MockHeadSession::new("fs0.grid.example.org", handler));
        let stream = session.exec("gridtest-demux").await.unwrap();
        let channel = Channel::new(stream.writer, stream.reader, Arc::new(ConnectionIds::new()));
        let conn = channel
            .open("fs0.grid.example.org", "bash -l")
            .await
            .unwrap();
        (MasterShell::from_connection(conn), session)
    }

    #[tokio::test]
    async fn raw_shell_returns_trimmed_output() {
        let (shell, _session) = raw_shell(Arc::new(|_, command| {
            assert_eq!(command, "preserve -llist");
            "id\tstate\n42\tR\n".to_string()
        }))
        .await;
        let output = shell.run("preserve -llist").await.unwrap();
        assert_eq!(output, "id\tstate\n42\tR");
    }

    #[tokio::test]
    async fn mux_shell_returns_trimmed_output() {
        let (shell, _session) = mux_shell(Arc::new(|_, command| {
            format!("ran: {command}")
        }))
        .await;
        let output = shell.run("module load prun").await.unwrap();
        assert_eq!(output, "ran: module load prun");
    }

    #[tokio::test]
    async fn empty_output_comes_back_empty() {
        let (shell, _session) = raw_shell(Arc::new(|_, _| String::new())).await;
        let output = shell.run("true").await.unwrap();
        assert_eq!(output, "");
    }

    #[tokio::test]
    async fn commands_with_unbalanced_quotes_still_finish() {
        let (shell, session) = raw_shell(Arc::new(|_, _| "ok".to_string())).await;
        let output = shell.run("echo 'half open").await.unwrap();
        assert_eq!(output, "ok");
        assert_eq!(session.shell_commands()[0].1, "echo 'half open");
    }

    #[tokio::test]
    async fn started_command_holds_the_shell_until_finished() {
        let (shell, _session) = raw_shell(Arc::new(|_, command| {
            format!("out: {command}")
        }))
        .await;
        let pending = shell.start("sleep-ish").await.unwrap();
        assert!(shell.io.try_lock().is_err());
        let output = pending.finish().await.unwrap();
        assert_eq!(output, "out: sleep-ish");
        assert!(shell.io.try_lock().is_ok());
    }

    #[tokio::test]
    async fn sequential_commands_share_one_shell() {
        let (shell, session) = raw_shell(Arc::new(|_, command| {
            format!("ran {command}")
        }))
        .await;
        assert_eq!(shell.run("first").await.unwrap(), "ran first");
        assert_eq!(shell.run("second").await.unwrap(), "ran second");
        let commands: Vec<String> =
            session.shell_commands().into_iter().map(|(_, c)| c).collect();
        assert_eq!(commands, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn connection_helpers_run_commands_directly() {
        let session = Arc::new(MockHeadSession::new(
            "fs0.grid.example.org",
            Arc::new(|addr: &str, command: &str| format!("{addr} ran {command}")),
        ));
        let stream = session.exec("gridtest-demux").await.unwrap();
        let channel = Channel::new(stream.writer, stream.reader, Arc::new(ConnectionIds::new()));
        let conn = channel.open("node101", "bash -l").await.unwrap();

        let output = run_command(&conn, "hostname").await.unwrap();
        assert_eq!(output, "node101 ran hostname");

        let marker = start_command(&conn, "uptime").await.unwrap();
        let output = finish_command(&conn, &marker).await.unwrap();
        assert_eq!(output, "node101 ran uptime");
        conn.close().await;
    }
}
