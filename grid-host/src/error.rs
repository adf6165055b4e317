//! Error types for gridtest-host.

use crate::config::ConfigError;
use crate::partition::PartitionError;
use crate::scheduler::SchedulerError;
use crate::session::SessionError;
use crate::shell::ShellError;
use gridtest_mux::error::MuxError;
use gridtest_mux::subchannel::FileTransferError;

/// Main error type for cluster host operations.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// Bad host configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Frontend session failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Scheduler interaction failure.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Mux channel failure.
    #[error(transparent)]
    Mux(#[from] MuxError),

    /// Remote shell failure.
    #[error(transparent)]
    Shell(#[from] ShellError),

    /// Granted nodes did not match the host declarations.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// File-transfer subchannel failure.
    #[error(transparent)]
    FileTransfer(#[from] FileTransferError),

    /// Hosts in one group pointing at different frontends.
    #[error("host {host} uses headnode {found}, but the group reserves through {expected}")]
    MixedHeadnodes {
        /// The host with the differing headnode.
        host: String,
        /// The headnode the group is using.
        expected: String,
        /// The headnode this host asked for.
        found: String,
    },

    /// Operation that needs a prepared host.
    #[error("host {host} has not been prepared")]
    NotPrepared {
        /// The unprepared host.
        host: String,
    },

    /// Preparing a host twice.
    #[error("host {host} is already prepared")]
    AlreadyPrepared {
        /// The host that was prepared before.
        host: String,
    },

    /// A group with no hosts in it.
    #[error("cluster group has no hosts")]
    NoHosts,

    /// A fresh node connection that never reported ready.
    #[error("connection to node {node} did not become ready (observed '{output}')")]
    ConnectionNotReady {
        /// The node being connected to.
        node: String,
        /// What came back instead of the ready line.
        output: String,
    },

    /// A remote directory that could not be created or checked.
    #[error("remote directory problem: {message}")]
    RemoteDir {
        /// What went wrong.
        message: String,
    },

    /// A file-transfer destination that cannot be written.
    #[error("bad transfer destination {path}: {reason}")]
    BadDestination {
        /// The offending destination path.
        path: String,
        /// Why it cannot be used.
        reason: &'static str,
    },

    /// Operation attempted while the host is tearing down.
    #[error("host {host} is cleaning up")]
    InCleanup {
        /// The host in teardown.
        host: String,
    },
}

/// Result type alias for host operations.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Aggregate of everything that went wrong during teardown.
///
/// Teardown never stops at the first failure; each one is recorded and
/// the rest of the teardown still runs.
#[derive(Debug, thiserror::Error)]
#[error("cleanup finished with {count} failure(s): {summary}", count = failures.len(), summary = failures.join("; "))]
pub struct CleanupError {
    /// One message per failed teardown step.
    pub failures: Vec<String>,
}
