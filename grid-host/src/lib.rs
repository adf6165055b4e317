//! Cluster host management for gridtest.
//!
//! Runs on clusters work through a single frontend machine: hosts reserve
//! compute nodes through the batch scheduler, talk to every node over one
//! multiplexed session (see `gridtest-mux`), and tear everything down
//! again afterwards. This crate covers that lifecycle: configuration,
//! frontend sessions, the sentinel shell protocol, the scheduler client,
//! supervisor election, node partitioning, and per-host command and file
//! operations.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod execution;
pub mod host;
pub mod partition;
pub mod role;
pub mod scheduler;
pub mod session;
pub mod shell;

pub use config::{ConfigError, HostConfig};
pub use error::{CleanupError, HostError, HostResult};
pub use execution::ExecutionDescriptor;
pub use host::{ClusterGroup, ClusterHost};
pub use partition::{partition_nodes, PartitionError};
pub use role::Role;
pub use scheduler::{ReservationId, SchedulerClient, SchedulerError};
pub use session::{
    HeadSession, MockCommandHandler, MockHeadSession, MockSessionFactory, SessionError,
    SessionFactory, SessionStream,
};
pub use shell::{run_command, CommandRunner, MasterShell, ShellError};
