//! Multiplexed command and file-transfer transport for gridtest cluster
//! hosts.
//!
//! A cluster frontend usually allows only one SSH session per user, so
//! every command stream to every compute node is multiplexed over that
//! single session. This crate implements the muxer side of that wire
//! protocol: framed logical connections over one physical byte stream,
//! plus keepalives and per-node file-transfer subchannels.
//!
//! The demultiplexing model is cooperative. There is no dispatcher task;
//! the reader that needs data drains frames off the shared stream, routing
//! other connections' data into their buffers as it goes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod error;
pub mod frame;
pub mod keepalive;
pub mod subchannel;

pub use buffer::ByteBuffer;
pub use channel::{Channel, ConnectionIds};
pub use connection::LogicalConnection;
pub use error::{MuxError, MuxResult, ProtocolError};
pub use frame::{Reply, Request};
pub use keepalive::{spawn_keepalive, Keepalive, DEFAULT_KEEPALIVE_PERIOD};
pub use subchannel::{
    FileTransfer, FileTransferError, FileTransferFactory, MockFileTransfer,
    MockFileTransferFactory, SubchannelManager,
};
