//! Logical connections carried over a mux channel.

use crate::channel::{ChannelShared, ConnectionState, Expect};
use crate::error::{MuxError, MuxResult};
use crate::frame::Request;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

/// How long to back off before re-trying the channel read-lock.
const READ_POLL_PERIOD: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
enum ReadMode {
    /// Up to and including the next newline.
    Line,
    /// Exactly this many bytes.
    Exact(usize),
    /// Everything until the remote side closes the connection.
    ToEnd,
}

impl ReadMode {
    fn expectation(self, conn: u32) -> Expect {
        match self {
            ReadMode::Line => Expect::LineData(conn),
            ReadMode::Exact(n) => Expect::ExactData(conn, n),
            // Only a close notice can satisfy this.
            ReadMode::ToEnd => Expect::ExactData(conn, usize::MAX),
        }
    }
}

/// One bidirectional command stream multiplexed over a [`Channel`].
///
/// Reads return an empty buffer once the remote side has closed the
/// connection and all buffered data has been consumed. Connections are
/// owned: the holder is responsible for calling [`close`] when done.
///
/// [`Channel`]: crate::channel::Channel
/// [`close`]: LogicalConnection::close
pub struct LogicalConnection {
    state: Arc<ConnectionState>,
    channel: Arc<ChannelShared>,
}

impl LogicalConnection {
    pub(crate) fn new(state: Arc<ConnectionState>, channel: Arc<ChannelShared>) -> Self {
        Self { state, channel }
    }

    /// The connection number on the wire.
    pub fn id(&self) -> u32 {
        self.state.id
    }

    /// True once [`close`](Self::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    /// Take data from the local buffer if `mode` can already be satisfied.
    fn try_take(&self, mode: ReadMode) -> Option<Vec<u8>> {
        let ended = self.state.no_more_input.load(Ordering::Acquire);
        let mut buffer = self.state.lock_buffer();
        match mode {
            ReadMode::Line if buffer.has_line() => Some(buffer.read_line()),
            ReadMode::Exact(n) if buffer.len() >= n => Some(buffer.read(n)),
            _ if ended => Some(buffer.read_all()),
            _ => None,
        }
    }

    async fn read(&self, mode: ReadMode) -> MuxResult<Vec<u8>> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed {
                conn: self.state.id,
            });
        }
        let expect = mode.expectation(self.state.id);
        loop {
            if let Some(data) = self.try_take(mode) {
                return Ok(data);
            }
            match self.channel.reader.try_lock() {
                Ok(mut reader) => {
                    // Another demux pass may have filled the buffer while
                    // we raced for the lock.
                    if let Some(data) = self.try_take(mode) {
                        return Ok(data);
                    }
                    self.channel.demux(&mut reader, expect).await?;
                    return Ok(self.try_take(mode).unwrap_or_default());
                }
                Err(_) => tokio::time::sleep(READ_POLL_PERIOD).await,
            }
        }
    }

    /// Read one line, including its newline.
    ///
    /// Returns whatever remains (possibly empty, possibly without a
    /// newline) once the remote side has closed the connection.
    pub async fn read_line(&self) -> MuxResult<Vec<u8>> {
        self.read(ReadMode::Line).await
    }

    /// Read exactly `n` bytes, or fewer if the remote side closes first.
    pub async fn read_exact(&self, n: usize) -> MuxResult<Vec<u8>> {
        self.read(ReadMode::Exact(n)).await
    }

    /// Read everything until the remote side closes the connection.
    pub async fn read_to_end(&self) -> MuxResult<Vec<u8>> {
        self.read(ReadMode::ToEnd).await
    }

    /// Send `data` to the remote end of this connection.
    ///
    /// Only a payload that ends with its single newline travels as a
    /// newline-terminated frame; an interior newline or a missing
    /// terminator needs the length-prefixed frame to decode intact.
    pub async fn write(&self, data: &[u8]) -> MuxResult<()> {
        if self.is_closed() {
            return Err(MuxError::ConnectionClosed {
                conn: self.state.id,
            });
        }
        let line_framed =
            data.last() == Some(&b'\n') && !data[..data.len() - 1].contains(&b'\n');
        let frame = if line_framed {
            Request::Line {
                conn: self.state.id,
                data: data.to_vec(),
            }
        } else {
            Request::Data {
                conn: self.state.id,
                data: data.to_vec(),
            }
        };
        self.channel.send(&frame).await
    }

    /// Close the connection; idempotent.
    ///
    /// Sends the close request (unless the channel is already shut down)
    /// and waits for the acknowledgement, skipping the wait when another
    /// reader's demux pass already routed the close notice. Teardown
    /// failures are logged and swallowed: a connection that cannot close
    /// cleanly is still gone.
    pub async fn close(&self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if !self.channel.closed.load(Ordering::Acquire) {
            match self
                .channel
                .send(&Request::Close {
                    conn: self.state.id,
                })
                .await
            {
                Ok(()) => self.await_close_notice().await,
                Err(err) => {
                    tracing::warn!(
                        conn = self.state.id,
                        error = %err,
                        "could not send close request"
                    );
                }
            }
        }
        self.channel.registry.remove(&self.state.id);
        tracing::debug!(conn = self.state.id, "logical connection closed");
    }

    /// Wait for this connection's close notice.
    ///
    /// A notice consumed by another connection's demux pass sets
    /// `no_more_input` without satisfying anyone's expectation, so the flag
    /// is checked both before and after taking the read-lock; waiting for a
    /// notice that was already routed would block forever.
    async fn await_close_notice(&self) {
        if self.state.no_more_input.load(Ordering::Acquire) {
            return;
        }
        let mut reader = self.channel.reader.lock().await;
        if self.state.no_more_input.load(Ordering::Acquire) {
            return;
        }
        if let Err(err) = self
            .channel
            .demux(&mut reader, Expect::CloseAck(self.state.id))
            .await
        {
            tracing::warn!(
                conn = self.state.id,
                error = %err,
                "error while waiting for close acknowledgement"
            );
        }
    }
}

impl Drop for LogicalConnection {
    fn drop(&mut self) {
        if !self.is_closed() {
            tracing::warn!(
                conn = self.state.id,
                "logical connection dropped without being closed"
            );
            self.channel.registry.remove(&self.state.id);
        }
    }
}

impl std::fmt::Debug for LogicalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalConnection")
            .field("id", &self.state.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::channel::{Channel, ConnectionIds};
    use crate::connection::LogicalConnection;
    use crate::error::MuxError;
    use crate::frame::{Reply, Request};
    use std::sync::Arc;
    use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

    struct Peer {
        reader: BufReader<ReadHalf<tokio::io::DuplexStream>>,
        writer: WriteHalf<tokio::io::DuplexStream>,
    }

    impl Peer {
        async fn expect_request(&mut self) -> Request {
            Request::read_from(&mut self.reader).await.unwrap()
        }

        async fn reply(&mut self, reply: Reply) {
            self.writer.write_all(&reply.encode()).await.unwrap();
        }
    }

    fn pipe() -> (Channel, Peer) {
        let (local, remote) = tokio::io::duplex(64 * 1024);
        let (lr, lw) = tokio::io::split(local);
        let channel = Channel::new(lw, lr, Arc::new(ConnectionIds::new()));
        let (rr, rw) = tokio::io::split(remote);
        (
            channel,
            Peer {
                reader: BufReader::new(rr),
                writer: rw,
            },
        )
    }

    async fn open_acked(channel: &Channel, peer: &mut Peer) -> LogicalConnection {
        let open = tokio::spawn({
            let channel = channel.clone();
            async move { channel.open("node101", "bash -l").await }
        });
        assert!(matches!(peer.expect_request().await, Request::Open { .. }));
        peer.reply(Reply::OpenOk).await;
        open.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn trailing_newline_goes_as_a_line_frame() {
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;
        conn.write(b"ls\n").await.unwrap();
        match peer.expect_request().await {
            Request::Line { conn: c, data } => {
                assert_eq!(c, conn.id());
                assert_eq!(data, b"ls\n");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn interior_newline_forces_a_length_prefixed_frame() {
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;
        conn.write(b"line one\nline two\n").await.unwrap();
        match peer.expect_request().await {
            Request::Data { conn: c, data } => {
                assert_eq!(c, conn.id());
                assert_eq!(data, b"line one\nline two\n");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bare_newline_stays_a_line_frame() {
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;
        conn.write(b"\n").await.unwrap();
        assert!(matches!(
            peer.expect_request().await,
            Request::Line { .. }
        ));
    }

    #[tokio::test]
    async fn missing_terminator_forces_a_length_prefixed_frame() {
        // A line frame must end with its newline to decode; a payload
        // without one has to go length-prefixed.
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;
        conn.write(b"raw bytes").await.unwrap();
        match peer.expect_request().await {
            Request::Data { conn: c, data } => {
                assert_eq!(c, conn.id());
                assert_eq!(data, b"raw bytes");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;

        // Queue the acknowledgement up front so close() finds it waiting.
        peer.reply(Reply::Closed { conn: conn.id() }).await;
        conn.close().await;
        assert!(conn.is_closed());
        assert_eq!(channel.registered_connections(), 0);

        // Second close sends nothing; the next frame the peer sees is the
        // keepalive we send afterwards.
        conn.close().await;
        channel.send_noop().await.unwrap();
        assert!(matches!(peer.expect_request().await, Request::Close { .. }));
        assert_eq!(peer.expect_request().await, Request::Noop);
    }

    #[tokio::test]
    async fn io_after_close_is_rejected() {
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;
        peer.reply(Reply::Closed { conn: conn.id() }).await;
        conn.close().await;

        let err = conn.write(b"late\n").await.unwrap_err();
        assert!(matches!(err, MuxError::ConnectionClosed { .. }));
        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, MuxError::ConnectionClosed { .. }));
    }

    #[tokio::test]
    async fn close_after_channel_shutdown_skips_the_wire() {
        let (channel, mut peer) = pipe();
        let conn = open_acked(&channel, &mut peer).await;
        channel.send_quit().await.unwrap();
        conn.close().await;
        assert!(conn.is_closed());
        // Only the quit frame ever reached the peer.
        assert_eq!(peer.expect_request().await, Request::Quit);
    }

    #[tokio::test]
    async fn concurrent_readers_share_the_demux_loop() {
        let (channel, mut peer) = pipe();
        let conn1 = Arc::new(open_acked(&channel, &mut peer).await);
        let conn2 = Arc::new(open_acked(&channel, &mut peer).await);

        let r1 = tokio::spawn({
            let conn1 = Arc::clone(&conn1);
            async move { conn1.read_line().await }
        });
        let r2 = tokio::spawn({
            let conn2 = Arc::clone(&conn2);
            async move { conn2.read_line().await }
        });

        // Whichever reader holds the lock routes both frames; the other
        // finds its line buffered on a later poll.
        peer.reply(Reply::Line {
            conn: conn2.id(),
            data: b"second\n".to_vec(),
        })
        .await;
        peer.reply(Reply::Line {
            conn: conn1.id(),
            data: b"first\n".to_vec(),
        })
        .await;

        assert_eq!(r1.await.unwrap().unwrap(), b"first\n");
        assert_eq!(r2.await.unwrap().unwrap(), b"second\n");
    }

    #[tokio::test]
    async fn close_skips_the_wait_when_the_notice_was_already_routed() {
        let (channel, mut peer) = pipe();
        let conn1 = Arc::new(open_acked(&channel, &mut peer).await);
        let conn2 = Arc::new(open_acked(&channel, &mut peer).await);

        let reader = tokio::spawn({
            let conn1 = Arc::clone(&conn1);
            async move { conn1.read_line().await }
        });

        // conn2's close notice arrives while conn1's read drives the demux
        // loop, so conn1's pass consumes it.
        peer.reply(Reply::Closed { conn: conn2.id() }).await;
        peer.reply(Reply::Line {
            conn: conn1.id(),
            data: b"done\n".to_vec(),
        })
        .await;
        assert_eq!(reader.await.unwrap().unwrap(), b"done\n");

        // close() must notice the already-consumed acknowledgement instead
        // of demuxing for a frame that will never arrive again.
        tokio::time::timeout(std::time::Duration::from_secs(1), conn2.close())
            .await
            .unwrap();
        assert!(conn2.is_closed());
        assert_eq!(channel.registered_connections(), 1);
    }
}
