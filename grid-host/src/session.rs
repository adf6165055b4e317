//! Sessions to the cluster frontend.
//!
//! All traffic to a cluster goes through one physical session to its
//! frontend machine. [`HeadSession`] abstracts that session so the rest of
//! the crate never touches SSH directly, and [`MockHeadSession`] stands in
//! for a whole cluster in tests: it speaks the mux wire protocol on one
//! side and emulates per-node shells on the other.

use async_trait::async_trait;
use gridtest_mux::frame::{Reply, Request};
use gridtest_mux::subchannel::{FileTransferFactory, MockFileTransferFactory};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Errors from frontend sessions.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport failure on the session.
    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frontend refused the login.
    #[error("authentication to {headnode} failed: {message}")]
    Auth {
        /// The frontend that refused.
        headnode: String,
        /// What went wrong.
        message: String,
    },

    /// A remote command could not be started.
    #[error("could not start '{command}' on the frontend: {message}")]
    Exec {
        /// The command that failed to start.
        command: String,
        /// What went wrong.
        message: String,
    },

    /// Operation on a session that was already closed.
    #[error("session is closed")]
    Closed,
}

/// The stdio of one remote command, as owned duplex halves.
pub struct SessionStream {
    /// Writes reach the remote command's stdin.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Reads come from the remote command's stdout.
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

/// One established session to a cluster frontend.
#[async_trait]
pub trait HeadSession: Send + Sync {
    /// Start `command` on the frontend and return its stdio.
    async fn exec(&self, command: &str) -> Result<SessionStream, SessionError>;

    /// Copy a local file onto the frontend.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError>;

    /// Factory for file-transfer subchannels tunneled through this session.
    fn file_transfers(&self) -> Arc<dyn FileTransferFactory>;

    /// Close the session.
    async fn close(&self) -> Result<(), SessionError>;
}

/// Establishes sessions to cluster frontends.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Connect to `headnode` as `user`.
    async fn connect(
        &self,
        headnode: &str,
        user: &str,
    ) -> Result<Arc<dyn HeadSession>, SessionError>;
}

/// Responds to a command executed on a fake node.
///
/// Arguments are the node's address and the command text; the return value
/// becomes the command's output.
pub type MockCommandHandler = Arc<dyn Fn(&str, &str) -> String + Send + Sync>;

/// Fake frontend session for tests.
///
/// [`exec`] of the mux command returns a stream whose far end is a fake
/// remote demuxer: it accepts logical connections to any node and runs a
/// fake shell per connection, answering commands through the session's
/// [`MockCommandHandler`]. Any other command gets a single fake shell
/// directly on the stream.
///
/// [`exec`]: HeadSession::exec
pub struct MockHeadSession {
    headnode: String,
    handler: MockCommandHandler,
    transfers: Arc<MockFileTransferFactory>,
    execs: std::sync::Mutex<Vec<String>>,
    uploads: std::sync::Mutex<Vec<(PathBuf, String)>>,
    shell_log: Arc<std::sync::Mutex<Vec<(String, String)>>>,
    closed: AtomicBool,
}

impl MockHeadSession {
    /// Create a fake session to `headnode` answering with `handler`.
    pub fn new(headnode: &str, handler: MockCommandHandler) -> Self {
        Self {
            headnode: headnode.to_string(),
            handler,
            transfers: Arc::new(MockFileTransferFactory::new()),
            execs: std::sync::Mutex::new(Vec::new()),
            uploads: std::sync::Mutex::new(Vec::new()),
            shell_log: Arc::new(std::sync::Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
        }
    }

    /// The headnode this fake session points at.
    pub fn headnode(&self) -> &str {
        &self.headnode
    }

    /// Commands passed to [`HeadSession::exec`], in call order.
    pub fn execs(&self) -> Vec<String> {
        lock_ignore_poison(&self.execs).clone()
    }

    /// Files passed to [`HeadSession::upload`], in call order.
    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        lock_ignore_poison(&self.uploads).clone()
    }

    /// Every `(node, command)` the fake shells have run, in call order.
    pub fn shell_commands(&self) -> Vec<(String, String)> {
        lock_ignore_poison(&self.shell_log).clone()
    }

    /// The mock subchannel factory behind [`HeadSession::file_transfers`].
    pub fn transfer_factory(&self) -> Arc<MockFileTransferFactory> {
        Arc::clone(&self.transfers)
    }

    /// True once the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

fn lock_ignore_poison<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl HeadSession for MockHeadSession {
    async fn exec(&self, command: &str) -> Result<SessionStream, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        lock_ignore_poison(&self.execs).push(command.to_string());
        let (local, remote) = tokio::io::duplex(256 * 1024);
        let (local_read, local_write) = tokio::io::split(local);
        let (remote_read, remote_write) = tokio::io::split(remote);
        let handler = Arc::clone(&self.handler);
        let log = Arc::clone(&self.shell_log);
        if command.contains("demux") {
            tokio::spawn(run_fake_demuxer(remote_read, remote_write, handler, log));
        } else {
            let headnode = self.headnode.clone();
            tokio::spawn(run_fake_shell_stream(
                remote_read,
                remote_write,
                headnode,
                handler,
                log,
            ));
        }
        Ok(SessionStream {
            writer: Box::new(local_write),
            reader: Box::new(local_read),
        })
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        lock_ignore_poison(&self.uploads).push((local.to_path_buf(), remote.to_string()));
        Ok(())
    }

    fn file_transfers(&self) -> Arc<dyn FileTransferFactory> {
        Arc::clone(&self.transfers) as Arc<dyn FileTransferFactory>
    }

    async fn close(&self) -> Result<(), SessionError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Fake shell state for one logical connection.
struct FakeShell {
    addr: String,
    pending: String,
}

impl FakeShell {
    fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            pending: String::new(),
        }
    }

    /// Feed input to the shell and produce any resulting output.
    fn feed(
        &mut self,
        data: &[u8],
        handler: &MockCommandHandler,
        log: &std::sync::Mutex<Vec<(String, String)>>,
    ) -> Vec<u8> {
        self.pending.push_str(&String::from_utf8_lossy(data));
        let mut output = Vec::new();
        loop {
            if let Some((command, marker, consumed)) = parse_sentinel_block(&self.pending) {
                self.pending.drain(..consumed);
                lock_ignore_poison(log).push((self.addr.clone(), command.clone()));
                let result = handler(&self.addr, &command);
                if !result.is_empty() {
                    output.extend_from_slice(result.as_bytes());
                    if !result.ends_with('\n') {
                        output.push(b'\n');
                    }
                }
                // echo prints the quoted newline, the marker, and its own
                // trailing newline.
                output.push(b'\n');
                output.extend_from_slice(marker.as_bytes());
                output.push(b'\n');
                continue;
            }
            // An incomplete guard block: wait for the rest.
            if self.pending.contains("\n# `\n") || self.pending.starts_with("# `\n") {
                break;
            }
            match self.pending.find('\n') {
                Some(pos) => {
                    let line: String = self.pending.drain(..=pos).collect();
                    let line = line.trim_end_matches('\n').to_string();
                    if line.is_empty() {
                        continue;
                    }
                    lock_ignore_poison(log).push((self.addr.clone(), line.clone()));
                    let result = handler(&self.addr, &line);
                    if !result.is_empty() {
                        output.extend_from_slice(result.as_bytes());
                        if !result.ends_with('\n') {
                            output.push(b'\n');
                        }
                    }
                }
                None => break,
            }
        }
        output
    }
}

/// Recognize one complete sentinel-guarded command block.
///
/// The block is the command text, three comment guard lines, an `echo "`
/// line, and the marker line closing the quote. Returns the command, the
/// marker, and how many bytes of input the block consumed.
fn parse_sentinel_block(input: &str) -> Option<(String, String, usize)> {
    let mut offset = 0;
    let mut lines = Vec::new();
    for line in input.split_inclusive('\n') {
        if !line.ends_with('\n') {
            break;
        }
        lines.push((offset, line.trim_end_matches('\n')));
        offset += line.len();
    }
    let echo_at = lines.iter().position(|(_, line)| *line == "echo \"")?;
    if echo_at < 3 || echo_at + 1 >= lines.len() {
        return None;
    }
    let (_, marker_line) = lines[echo_at + 1];
    let marker = marker_line.strip_suffix('"')?;
    let guards = [lines[echo_at - 3].1, lines[echo_at - 2].1, lines[echo_at - 1].1];
    if guards != ["# `", "# '", "# \""] {
        return None;
    }
    let (command_end, _) = lines[echo_at - 3];
    let command = input[..command_end].trim_end_matches('\n').to_string();
    let consumed = lines[echo_at + 1].0 + lines[echo_at + 1].1.len() + 1;
    Some((command, marker.to_string(), consumed))
}

/// Drive a fake remote demuxer over one stream pair.
async fn run_fake_demuxer<R, W>(
    reader: R,
    mut writer: W,
    handler: MockCommandHandler,
    log: Arc<std::sync::Mutex<Vec<(String, String)>>>,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut shells: HashMap<u32, FakeShell> = HashMap::new();
    loop {
        let request = match Request::read_from(&mut reader).await {
            Ok(request) => request,
            Err(_) => break,
        };
        let replies: Vec<Reply> = match request {
            Request::Open { conn, addr, .. } => {
                shells.insert(conn, FakeShell::new(&addr));
                vec![Reply::OpenOk]
            }
            Request::Close { conn } => {
                shells.remove(&conn);
                vec![Reply::Closed { conn }]
            }
            Request::Line { conn, data } | Request::Data { conn, data } => {
                match shells.get_mut(&conn) {
                    Some(shell) => {
                        let output = shell.feed(&data, &handler, &log);
                        if output.is_empty() {
                            Vec::new()
                        } else {
                            vec![Reply::Data { conn, data: output }]
                        }
                    }
                    None => Vec::new(),
                }
            }
            Request::Quit => break,
            Request::Noop => Vec::new(),
        };
        for reply in replies {
            if writer.write_all(&reply.encode()).await.is_err() {
                return;
            }
        }
    }
}

/// Drive a single fake shell directly over one stream pair.
async fn run_fake_shell_stream<R, W>(
    reader: R,
    mut writer: W,
    addr: String,
    handler: MockCommandHandler,
    log: Arc<std::sync::Mutex<Vec<(String, String)>>>,
) where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    use tokio::io::AsyncReadExt;
    let mut reader = reader;
    let mut shell = FakeShell::new(&addr);
    let mut chunk = vec![0u8; 4096];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let output = shell.feed(&chunk[..n], &handler, &log);
        if !output.is_empty() && writer.write_all(&output).await.is_err() {
            break;
        }
    }
}

/// [`SessionFactory`] producing [`MockHeadSession`]s.
pub struct MockSessionFactory {
    handler: MockCommandHandler,
    sessions: std::sync::Mutex<Vec<(String, Arc<MockHeadSession>)>>,
}

impl MockSessionFactory {
    /// Create a factory whose sessions answer with `handler`.
    pub fn new(handler: MockCommandHandler) -> Self {
        Self {
            handler,
            sessions: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Every session this factory has opened, in connect order.
    pub fn sessions(&self) -> Vec<(String, Arc<MockHeadSession>)> {
        lock_ignore_poison(&self.sessions).clone()
    }
}

#[async_trait]
impl SessionFactory for MockSessionFactory {
    async fn connect(
        &self,
        headnode: &str,
        _user: &str,
    ) -> Result<Arc<dyn HeadSession>, SessionError> {
        let session = Arc::new(MockHeadSession::new(headnode, Arc::clone(&self.handler)));
        lock_ignore_poison(&self.sessions).push((headnode.to_string(), Arc::clone(&session)));
        Ok(session as Arc<dyn HeadSession>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridtest_mux::channel::{Channel, ConnectionIds};

    fn echo_handler() -> MockCommandHandler {
        Arc::new(|_addr, command| {
            if command == "cd; echo \"READY\"" {
                "READY".to_string()
            } else {
                format!("ran: {command}")
            }
        })
    }

    #[test]
    fn sentinel_block_is_recognized() {
        let marker = "MARK-1234";
        let input = format!("preserve -llist\n# `\n# '\n# \"\necho \"\n{marker}\"\n");
        let (command, parsed_marker, consumed) = parse_sentinel_block(&input).unwrap();
        assert_eq!(command, "preserve -llist");
        assert_eq!(parsed_marker, marker);
        assert_eq!(consumed, input.len());
    }

    #[test]
    fn multi_line_command_survives_the_sentinel() {
        let input = "line one\nline two\n# `\n# '\n# \"\necho \"\nM\"\n";
        let (command, _, _) = parse_sentinel_block(input).unwrap();
        assert_eq!(command, "line one\nline two");
    }

    #[test]
    fn incomplete_block_is_not_parsed() {
        assert!(parse_sentinel_block("preserve -llist\n# `\n# '\n").is_none());
        assert!(parse_sentinel_block("just a line\n").is_none());
    }

    #[tokio::test]
    async fn fake_demuxer_answers_plain_commands() {
        let session = MockHeadSession::new("fs0.grid.example.org", echo_handler());
        let stream = session.exec("gridtest-demux").await.unwrap();
        let channel = Channel::new(stream.writer, stream.reader, Arc::new(ConnectionIds::new()));

        let conn = channel.open("node101", "bash -l").await.unwrap();
        conn.write(b"cd; echo \"READY\"\n").await.unwrap();
        assert_eq!(conn.read_line().await.unwrap(), b"READY\n");
        conn.close().await;
        channel.send_quit().await.unwrap();

        assert_eq!(
            session.shell_commands(),
            vec![("node101".to_string(), "cd; echo \"READY\"".to_string())]
        );
    }

    #[tokio::test]
    async fn fake_demuxer_keeps_connections_independent() {
        let session = MockHeadSession::new("fs0.grid.example.org", echo_handler());
        let stream = session.exec("gridtest-demux").await.unwrap();
        let channel = Channel::new(stream.writer, stream.reader, Arc::new(ConnectionIds::new()));

        let conn1 = channel.open("node101", "bash -l").await.unwrap();
        let conn2 = channel.open("node102", "bash -l").await.unwrap();
        conn2.write(b"hostname\n").await.unwrap();
        assert_eq!(conn2.read_line().await.unwrap(), b"ran: hostname\n");
        conn1.write(b"uptime\n").await.unwrap();
        assert_eq!(conn1.read_line().await.unwrap(), b"ran: uptime\n");
        conn1.close().await;
        conn2.close().await;
    }

    #[tokio::test]
    async fn exec_after_close_fails() {
        let session = MockHeadSession::new("fs0.grid.example.org", echo_handler());
        session.close().await.unwrap();
        assert!(matches!(
            session.exec("gridtest-demux").await,
            Err(SessionError::Closed)
        ));
    }
}
