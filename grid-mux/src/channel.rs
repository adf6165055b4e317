//! The multiplexed channel and its demultiplex loop.
//!
//! One [`Channel`] wraps the duplex byte stream of a single physical
//! multiplexed session. Many logical connections share it: frame emission
//! is serialized by the write-lock, and the demultiplex loop by the
//! read-lock. There is no background dispatcher task; whichever logical
//! connection needs data takes the read-lock and drains frames, filling
//! other connections' buffers along the way, until its own expectation is
//! satisfied. Fairness across connections is not guaranteed.

use crate::buffer::ByteBuffer;
use crate::connection::LogicalConnection;
use crate::error::{MuxError, MuxResult, ProtocolError};
use crate::frame::{Reply, Request};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

/// Connection-number allocator, scoped to one run.
///
/// Injected into every [`Channel`] of a run so numbers stay unique across
/// all channels sharing it; strictly increasing, never reused.
#[derive(Debug, Default)]
pub struct ConnectionIds {
    next: AtomicU32,
}

impl ConnectionIds {
    /// Create an allocator starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand out the next connection number.
    pub fn allocate(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Shared state of one logical connection.
///
/// The registry holds only a weak reference; ownership stays with the
/// caller that opened the connection.
#[derive(Debug)]
pub(crate) struct ConnectionState {
    pub(crate) id: u32,
    pub(crate) buffer: StdMutex<ByteBuffer>,
    pub(crate) no_more_input: AtomicBool,
    pub(crate) closed: AtomicBool,
}

impl ConnectionState {
    fn new(id: u32) -> Self {
        Self {
            id,
            buffer: StdMutex::new(ByteBuffer::new()),
            no_more_input: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Lock the input buffer, recovering from poisoning.
    pub(crate) fn lock_buffer(&self) -> std::sync::MutexGuard<'_, ByteBuffer> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

pub(crate) type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type ChannelReader = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// What a demultiplex pass is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expect {
    /// The result of an open request.
    OpenAck,
    /// The close acknowledgement for a connection.
    CloseAck(u32),
    /// A complete line (or end of input) for a connection.
    LineData(u32),
    /// At least this many buffered bytes (or end of input) for a
    /// connection. `usize::MAX` waits for end of input.
    ExactData(u32, usize),
}

impl Expect {
    fn describe(&self) -> &'static str {
        match self {
            Expect::OpenAck => "open acknowledgement",
            Expect::CloseAck(_) => "close acknowledgement",
            Expect::LineData(_) => "line data",
            Expect::ExactData(_, _) => "data",
        }
    }
}

pub(crate) struct ChannelShared {
    /// Write-lock: serializes frame emission only.
    pub(crate) writer: Mutex<ChannelWriter>,
    /// Read-lock: serializes the demultiplex loop.
    pub(crate) reader: Mutex<ChannelReader>,
    /// Connection registry; weak back-references, no ownership.
    pub(crate) registry: DashMap<u32, Weak<ConnectionState>>,
    ids: Arc<ConnectionIds>,
    pub(crate) closed: AtomicBool,
}

impl ChannelShared {
    /// Emit one frame under the write-lock.
    pub(crate) async fn send(&self, frame: &Request) -> MuxResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MuxError::ChannelClosed);
        }
        let bytes = frame.encode();
        let mut writer = self.writer.lock().await;
        writer.write_all(&bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Drain frames off the channel until `expect` is satisfied.
    ///
    /// The caller must hold the read-lock and pass its guard in. Data for
    /// other connections is routed into their buffers as a side effect;
    /// data for an unregistered connection number is a protocol error.
    pub(crate) async fn demux(
        &self,
        reader: &mut ChannelReader,
        expect: Expect,
    ) -> MuxResult<()> {
        loop {
            let reply = Reply::read_from(reader).await?;
            match reply {
                Reply::OpenOk => {
                    if expect == Expect::OpenAck {
                        return Ok(());
                    }
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: expect.describe(),
                        actual: "open acknowledgement",
                    }
                    .into());
                }
                Reply::OpenFailed { reason } => {
                    if expect == Expect::OpenAck {
                        return Err(ProtocolError::OpenRejected { reason }.into());
                    }
                    return Err(ProtocolError::UnexpectedFrame {
                        expected: expect.describe(),
                        actual: "open failure",
                    }
                    .into());
                }
                Reply::Closed { conn } => {
                    if let Some(entry) = self.registry.get(&conn) {
                        if let Some(state) = entry.upgrade() {
                            state.no_more_input.store(true, Ordering::Release);
                        }
                    }
                    match expect {
                        Expect::CloseAck(c)
                        | Expect::LineData(c)
                        | Expect::ExactData(c, _)
                            if c == conn =>
                        {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                Reply::Line { conn, data } | Reply::Data { conn, data } => {
                    let state = match self.registry.get(&conn) {
                        Some(entry) => match entry.upgrade() {
                            Some(state) => state,
                            None => {
                                drop(entry);
                                self.registry.remove(&conn);
                                tracing::warn!(
                                    conn,
                                    "dropping data for connection without a live owner"
                                );
                                continue;
                            }
                        },
                        None => {
                            return Err(ProtocolError::UnknownConnection { conn }.into());
                        }
                    };
                    let got_line = data.contains(&b'\n');
                    let buffered = {
                        let mut buffer = state.lock_buffer();
                        buffer.write(&data);
                        buffer.len()
                    };
                    match expect {
                        Expect::LineData(c) if c == conn && got_line => return Ok(()),
                        Expect::ExactData(c, min) if c == conn && buffered >= min => {
                            return Ok(());
                        }
                        _ => {}
                    }
                }
                Reply::Quit { reason } => {
                    return Err(ProtocolError::RemoteQuit { reason }.into());
                }
            }
        }
    }
}

/// One physical multiplexed session shared by many logical connections.
///
/// Cheap to clone; clones share the same underlying channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Wrap the duplex halves of an established multiplexed session.
    pub fn new<W, R>(writer: W, reader: R, ids: Arc<ConnectionIds>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            shared: Arc::new(ChannelShared {
                writer: Mutex::new(Box::new(writer) as ChannelWriter),
                reader: Mutex::new(BufReader::new(
                    Box::new(reader) as Box<dyn AsyncRead + Send + Unpin>
                )),
                registry: DashMap::new(),
                ids,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Open a new logical connection running `command` on `addr`.
    ///
    /// Holds the read-lock across the open acknowledgement and the registry
    /// insert, so no data frame for the new connection can arrive before it
    /// is registered.
    pub async fn open(&self, addr: &str, command: &str) -> MuxResult<LogicalConnection> {
        let conn = self.shared.ids.allocate();
        self.shared
            .send(&Request::Open {
                conn,
                addr: addr.to_string(),
                command: command.to_string(),
            })
            .await?;
        let mut reader = self.shared.reader.lock().await;
        self.shared.demux(&mut reader, Expect::OpenAck).await?;
        let state = Arc::new(ConnectionState::new(conn));
        self.shared.registry.insert(conn, Arc::downgrade(&state));
        drop(reader);
        tracing::debug!(conn, addr, command, "logical connection opened");
        Ok(LogicalConnection::new(state, Arc::clone(&self.shared)))
    }

    /// Send a keepalive no-op frame.
    pub async fn send_noop(&self) -> MuxResult<()> {
        self.shared.send(&Request::Noop).await
    }

    /// Send the quit opcode and shut the channel down.
    ///
    /// Any later send fails with [`MuxError::ChannelClosed`]. The channel is
    /// marked shut down even if the quit frame itself could not be sent.
    pub async fn send_quit(&self) -> MuxResult<()> {
        let result = self.shared.send(&Request::Quit).await;
        self.shared.closed.store(true, Ordering::Release);
        result
    }

    /// True once the channel has been shut down.
    pub fn is_shut_down(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Number of currently registered logical connections.
    pub fn registered_connections(&self) -> usize {
        self.shared.registry.len()
    }
}
