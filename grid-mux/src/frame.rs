//! Frame codec for the mux wire protocol.
//!
//! Every frame starts with a one-byte opcode; all integers are 4-byte
//! big-endian. The muxer (local side) sends [`Request`] frames, the remote
//! demuxer answers with [`Reply`] frames. Both directions share the opcode
//! vocabulary for data frames but attach different payloads to `+` and `X`.
//!
//! Decoding treats a premature end of stream at any point as a protocol
//! error; frames are never silently truncated.

use crate::error::ProtocolError;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Sanity cap on any declared payload length.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const OP_OPEN: u8 = b'+';
const OP_CLOSE: u8 = b'-';
const OP_LINE: u8 = b'0';
const OP_DATA: u8 = b'1';
const OP_QUIT: u8 = b'X';
const OP_NOOP: u8 = b'\n';

/// A frame sent by the muxer to the remote demuxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Open a new logical connection: run `command` on `addr`.
    Open {
        /// Connection number for the new connection.
        conn: u32,
        /// Node address to connect to.
        addr: String,
        /// Command to run on the node.
        command: String,
    },
    /// Close a logical connection.
    Close {
        /// Connection number of the connection to close.
        conn: u32,
    },
    /// Newline-terminated data; `data` ends with `\n` and contains no
    /// other newline.
    Line {
        /// Target connection number.
        conn: u32,
        /// Payload, up to and including the terminating newline.
        data: Vec<u8>,
    },
    /// Length-prefixed data; may contain embedded newlines.
    Data {
        /// Target connection number.
        conn: u32,
        /// Payload bytes.
        data: Vec<u8>,
    },
    /// Tell the remote demuxer to quit. No payload in this direction.
    Quit,
    /// Keepalive no-op.
    Noop,
}

/// A frame sent by the remote demuxer back to the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// A connection was opened successfully.
    OpenOk,
    /// A connection could not be opened.
    OpenFailed {
        /// Error message from the remote side.
        reason: String,
    },
    /// A connection was closed; no more data will arrive for it.
    Closed {
        /// Connection number of the closed connection.
        conn: u32,
    },
    /// Newline-terminated data for a connection.
    Line {
        /// Source connection number.
        conn: u32,
        /// Payload, up to and including the terminating newline.
        data: Vec<u8>,
    },
    /// Length-prefixed data for a connection.
    Data {
        /// Source connection number.
        conn: u32,
        /// Payload bytes.
        data: Vec<u8>,
    },
    /// The remote demuxer quit, reporting why.
    Quit {
        /// Error message from the remote side.
        reason: String,
    },
}

impl Request {
    /// Encode this frame to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Request::Open {
                conn,
                addr,
                command,
            } => {
                let mut out = Vec::with_capacity(13 + addr.len() + command.len());
                out.push(OP_OPEN);
                out.extend_from_slice(&conn.to_be_bytes());
                out.extend_from_slice(&(addr.len() as u32).to_be_bytes());
                out.extend_from_slice(&(command.len() as u32).to_be_bytes());
                out.extend_from_slice(addr.as_bytes());
                out.extend_from_slice(command.as_bytes());
                out
            }
            Request::Close { conn } => {
                let mut out = Vec::with_capacity(5);
                out.push(OP_CLOSE);
                out.extend_from_slice(&conn.to_be_bytes());
                out
            }
            Request::Line { conn, data } => {
                let mut out = Vec::with_capacity(5 + data.len());
                out.push(OP_LINE);
                out.extend_from_slice(&conn.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Request::Data { conn, data } => {
                let mut out = Vec::with_capacity(9 + data.len());
                out.push(OP_DATA);
                out.extend_from_slice(&conn.to_be_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Request::Quit => vec![OP_QUIT],
            Request::Noop => vec![OP_NOOP],
        }
    }

    /// Decode one request frame from the stream.
    ///
    /// This is the remote demuxer's view of the wire; locally it is used
    /// by tests and in-process demuxer emulations.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let opcode = read_u8(reader, "opcode").await?;
        match opcode {
            OP_OPEN => {
                let conn = read_u32(reader, "connection number").await?;
                let addr_len = read_len(reader, "address length").await?;
                let cmd_len = read_len(reader, "command length").await?;
                let addr = read_vec(reader, addr_len, "address").await?;
                let command = read_vec(reader, cmd_len, "command").await?;
                Ok(Request::Open {
                    conn,
                    addr: utf8(addr, "address")?,
                    command: utf8(command, "command")?,
                })
            }
            OP_CLOSE => {
                let conn = read_u32(reader, "connection number").await?;
                Ok(Request::Close { conn })
            }
            OP_LINE => {
                let conn = read_u32(reader, "connection number").await?;
                let data = read_line(reader).await?;
                Ok(Request::Line { conn, data })
            }
            OP_DATA => {
                let conn = read_u32(reader, "connection number").await?;
                let len = read_len(reader, "data length").await?;
                let data = read_vec(reader, len, "data").await?;
                Ok(Request::Data { conn, data })
            }
            OP_QUIT => Ok(Request::Quit),
            OP_NOOP => Ok(Request::Noop),
            other => Err(ProtocolError::UnexpectedOpcode { opcode: other }),
        }
    }
}

impl Reply {
    /// Encode this frame to wire bytes.
    ///
    /// Used by tests and in-process demuxer emulations; the production
    /// remote counterpart produces the same bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Reply::OpenOk => vec![OP_OPEN, OP_OPEN],
            Reply::OpenFailed { reason } => {
                let mut out = Vec::with_capacity(6 + reason.len());
                out.push(OP_OPEN);
                out.push(OP_CLOSE);
                out.extend_from_slice(&(reason.len() as u32).to_be_bytes());
                out.extend_from_slice(reason.as_bytes());
                out
            }
            Reply::Closed { conn } => {
                let mut out = Vec::with_capacity(5);
                out.push(OP_CLOSE);
                out.extend_from_slice(&conn.to_be_bytes());
                out
            }
            Reply::Line { conn, data } => {
                let mut out = Vec::with_capacity(5 + data.len());
                out.push(OP_LINE);
                out.extend_from_slice(&conn.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Reply::Data { conn, data } => {
                let mut out = Vec::with_capacity(9 + data.len());
                out.push(OP_DATA);
                out.extend_from_slice(&conn.to_be_bytes());
                out.extend_from_slice(&(data.len() as u32).to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            Reply::Quit { reason } => {
                let mut out = Vec::with_capacity(5 + reason.len());
                out.push(OP_QUIT);
                out.extend_from_slice(&(reason.len() as u32).to_be_bytes());
                out.extend_from_slice(reason.as_bytes());
                out
            }
        }
    }

    /// Decode one reply frame from the stream.
    ///
    /// This is what the demultiplex loop reads off the channel.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncBufRead + Unpin,
    {
        let opcode = read_u8(reader, "opcode").await?;
        match opcode {
            OP_OPEN => match read_u8(reader, "open result").await? {
                OP_OPEN => Ok(Reply::OpenOk),
                OP_CLOSE => {
                    let len = read_len(reader, "error message length").await?;
                    let msg = read_vec(reader, len, "error message").await?;
                    Ok(Reply::OpenFailed {
                        reason: String::from_utf8_lossy(&msg).into_owned(),
                    })
                }
                other => Err(ProtocolError::UnexpectedOpcode { opcode: other }),
            },
            OP_CLOSE => {
                let conn = read_u32(reader, "connection number").await?;
                Ok(Reply::Closed { conn })
            }
            OP_LINE => {
                let conn = read_u32(reader, "connection number").await?;
                let data = read_line(reader).await?;
                Ok(Reply::Line { conn, data })
            }
            OP_DATA => {
                let conn = read_u32(reader, "connection number").await?;
                let len = read_len(reader, "data length").await?;
                let data = read_vec(reader, len, "data").await?;
                Ok(Reply::Data { conn, data })
            }
            OP_QUIT => {
                let len = read_len(reader, "error message length").await?;
                let msg = read_vec(reader, len, "error message").await?;
                Ok(Reply::Quit {
                    reason: String::from_utf8_lossy(&msg).into_owned(),
                })
            }
            other => Err(ProtocolError::UnexpectedOpcode { opcode: other }),
        }
    }
}

async fn read_u8<R>(reader: &mut R, context: &'static str) -> Result<u8, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut byte = [0u8; 1];
    reader
        .read_exact(&mut byte)
        .await
        .map_err(|_| ProtocolError::Truncated { context })?;
    Ok(byte[0])
}

async fn read_u32<R>(reader: &mut R, context: &'static str) -> Result<u32, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = [0u8; 4];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|_| ProtocolError::Truncated { context })?;
    Ok(u32::from_be_bytes(bytes))
}

async fn read_len<R>(reader: &mut R, context: &'static str) -> Result<usize, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let len = read_u32(reader, context).await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

async fn read_vec<R>(
    reader: &mut R,
    len: usize,
    context: &'static str,
) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|_| ProtocolError::Truncated { context })?;
    Ok(buf)
}

async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    reader
        .read_until(b'\n', &mut buf)
        .await
        .map_err(|_| ProtocolError::Truncated { context: "line data" })?;
    if buf.last() != Some(&b'\n') {
        return Err(ProtocolError::Truncated { context: "line data" });
    }
    if buf.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized {
            len: buf.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(buf)
}

fn utf8(bytes: Vec<u8>, context: &'static str) -> Result<String, ProtocolError> {
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8 { context })
}
