//! Error types for gridtest-mux.

/// Wire-level protocol violations on the mux channel.
///
/// Any of these is fatal for the whole channel: once the frame stream is
/// out of sync there is no way to resynchronize with the remote demuxer.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The stream ended in the middle of a frame.
    #[error("unexpected end of stream while reading {context}")]
    Truncated {
        /// What was being read when the stream ended.
        context: &'static str,
    },

    /// An opcode outside the protocol vocabulary.
    #[error("unexpected opcode {opcode:#04x} on mux channel")]
    UnexpectedOpcode {
        /// The offending opcode byte.
        opcode: u8,
    },

    /// A declared payload length above the sanity cap.
    #[error("frame payload too large: {len} bytes (max {max})")]
    Oversized {
        /// Declared payload length.
        len: usize,
        /// Maximum accepted length.
        max: usize,
    },

    /// Data arrived for a connection number that was never registered.
    #[error("received data for unknown connection {conn}")]
    UnknownConnection {
        /// The unknown connection number.
        conn: u32,
    },

    /// A frame that makes no sense for the current read expectation.
    #[error("unexpected frame while waiting for {expected}: got {actual}")]
    UnexpectedFrame {
        /// What the demultiplex loop was waiting for.
        expected: &'static str,
        /// Short description of the frame that arrived instead.
        actual: &'static str,
    },

    /// The remote demuxer refused to open a connection.
    #[error("connection setup rejected by remote demuxer: {reason}")]
    OpenRejected {
        /// The error message reported by the remote side.
        reason: String,
    },

    /// The remote demuxer quit and reported why.
    #[error("remote demuxer quit: {reason}")]
    RemoteQuit {
        /// The error message reported by the remote side.
        reason: String,
    },

    /// An address or command field that is not valid UTF-8.
    #[error("invalid UTF-8 in {context}")]
    InvalidUtf8 {
        /// The field that failed to decode.
        context: &'static str,
    },
}

/// Main error type for mux channel operations.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// Wire protocol violation; the channel is unusable afterwards.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O failure on the underlying physical stream.
    #[error("I/O error on mux channel: {0}")]
    Io(#[from] std::io::Error),

    /// Operation on a logical connection that was already closed.
    #[error("logical connection {conn} is closed")]
    ConnectionClosed {
        /// The closed connection's number.
        conn: u32,
    },

    /// Operation on a channel that was already shut down.
    #[error("mux channel is shut down")]
    ChannelClosed,
}

/// Result type alias for mux operations.
pub type MuxResult<T> = std::result::Result<T, MuxError>;
