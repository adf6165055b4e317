//! Cluster hosts and the group that prepares them.
//!
//! A run declares one [`ClusterHost`] per cluster it wants nodes on; all
//! declarations pointing at the same frontend form a [`ClusterGroup`].
//! Preparation is strictly sequential: the group elects the first host as
//! supervisor, the supervisor makes one aggregated reservation for all of
//! them, and the granted nodes are handed out as contiguous subsets in
//! declaration order. A host given more than one node spawns a slave host
//! per extra node so every host drives exactly one node afterwards.

use crate::config::HostConfig;
use crate::error::{CleanupError, HostError, HostResult};
use crate::execution::ExecutionDescriptor;
use crate::partition::partition_nodes;
use crate::role::Role;
use crate::scheduler::SchedulerClient;
use crate::session::{HeadSession, SessionFactory};
use crate::shell::{self, run_command, CommandRunner, MasterShell};
use gridtest_mux::channel::{Channel, ConnectionIds};
use gridtest_mux::connection::LogicalConnection;
use gridtest_mux::keepalive::{spawn_keepalive, Keepalive};
use gridtest_mux::subchannel::SubchannelManager;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Infrastructure shared by every host of a group after election.
#[derive(Clone)]
struct SharedInfra {
    session: Arc<dyn HeadSession>,
    channel: Channel,
    shell: Arc<MasterShell>,
    scheduler: Arc<SchedulerClient>,
    subchannels: Arc<SubchannelManager>,
    keepalives: Arc<std::sync::Mutex<Vec<Keepalive>>>,
    suspend: Arc<AtomicBool>,
}

struct HostState {
    role: Role,
    node_set: Vec<String>,
    shared: Option<SharedInfra>,
    executions: Vec<ExecutionDescriptor>,
    slaves: Vec<Arc<ClusterHost>>,
    connection: Option<Arc<LogicalConnection>>,
    extra_connections: Vec<Arc<LogicalConnection>>,
    persistent_dir: Option<String>,
    owns_persistent_dir: bool,
    local_temp_dir: Option<String>,
}

/// One host on the cluster, driving one node once prepared.
pub struct ClusterHost {
    name: String,
    config: HostConfig,
    in_cleanup: AtomicBool,
    state: Mutex<HostState>,
}

impl ClusterHost {
    /// Declare a host with its configuration and planned executions.
    pub fn new(
        name: &str,
        config: HostConfig,
        executions: Vec<ExecutionDescriptor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            config,
            in_cleanup: AtomicBool::new(false),
            state: Mutex::new(HostState {
                role: Role::UnpreparedMaster,
                node_set: Vec::new(),
                shared: None,
                executions,
                slaves: Vec::new(),
                connection: None,
                extra_connections: Vec::new(),
                persistent_dir: None,
                owns_persistent_dir: false,
                local_temp_dir: None,
            }),
        })
    }

    /// The host's declared name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host's configuration.
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// True once teardown has started.
    pub fn is_in_cleanup(&self) -> bool {
        self.in_cleanup.load(Ordering::Acquire)
    }

    /// The host's current role.
    pub async fn role(&self) -> Role {
        self.state.lock().await.role.clone()
    }

    /// The nodes assigned to this host.
    pub async fn nodes(&self) -> Vec<String> {
        self.state.lock().await.node_set.clone()
    }

    /// The slaves this host spawned during preparation.
    pub async fn slaves(&self) -> Vec<Arc<ClusterHost>> {
        self.state.lock().await.slaves.clone()
    }

    /// The execution descriptors bound to this host.
    pub async fn executions(&self) -> Vec<ExecutionDescriptor> {
        self.state.lock().await.executions.clone()
    }

    async fn install(&self, role: Role, nodes: Vec<String>, shared: SharedInfra) {
        let mut state = self.state.lock().await;
        state.role = role;
        state.node_set = nodes;
        state.shared = Some(shared);
    }

    /// Prepare this host and then its slaves, sequentially.
    ///
    /// Requires the group to have elected a supervisor and handed out
    /// nodes first.
    pub async fn prepare(&self) -> HostResult<()> {
        self.prepare_parts().await?;
        let slaves = { self.state.lock().await.slaves.clone() };
        for slave in slaves {
            if self.is_in_cleanup() {
                return Ok(());
            }
            slave.prepare_parts().await?;
        }
        Ok(())
    }

    async fn prepare_parts(&self) -> HostResult<()> {
        if self.is_in_cleanup() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        let shared = state.shared.clone().ok_or_else(|| HostError::NotPrepared {
            host: self.name.clone(),
        })?;
        if state.node_set.is_empty() {
            return Err(HostError::NotPrepared {
                host: self.name.clone(),
            });
        }
        if state.connection.is_some() {
            return Err(HostError::AlreadyPrepared {
                host: self.name.clone(),
            });
        }

        if !state.role.is_slave() {
            self.prepare_master_part(&mut state, &shared).await?;
        }

        // Every host, slave or not, drives one node through its own
        // logical connection.
        if self.is_in_cleanup() {
            return Ok(());
        }
        let node = state.node_set[0].clone();
        let conn = Arc::new(open_ready_connection(&shared, &node).await?);
        state.connection = Some(Arc::clone(&conn));
        if self.config.remote_dir.is_none() {
            let user = &self.config.user;
            let dir = run_command(
                &conn,
                &format!("mkdir -p /local/{user}; mktemp -d --tmpdir=/local/{user}"),
            )
            .await?;
            if dir.is_empty() {
                return Err(HostError::RemoteDir {
                    message: format!("could not create a local temp dir on node {node}"),
                });
            }
            let check = run_command(
                &conn,
                &format!("[ -d \"{dir}\" ] && [ `ls -a \"{dir}\" | wc -l` -eq 2 ] && echo \"OK\""),
            )
            .await?;
            if check.trim() != "OK" {
                return Err(HostError::RemoteDir {
                    message: format!(
                        "local temp dir {dir} on node {node} failed verification (got '{check}')"
                    ),
                });
            }
            state.local_temp_dir = Some(dir);
        }
        tracing::info!(host = %self.name, role = %state.role, node = %node, "host prepared");
        Ok(())
    }

    /// Master-only preparation: headnode temp dir, slaves, forwarding
    /// scripts.
    async fn prepare_master_part(
        &self,
        state: &mut HostState,
        shared: &SharedInfra,
    ) -> HostResult<()> {
        if self.config.remote_dir.is_none() && state.persistent_dir.is_none() {
            let dir = shared.shell.run("mktemp -d --tmpdir=\"`pwd`\"").await?;
            if dir.is_empty() {
                return Err(HostError::RemoteDir {
                    message: format!(
                        "could not create a persistent dir on the headnode for {}",
                        self.name
                    ),
                });
            }
            let check = shared
                .shell
                .run(&format!("[ -d \"{dir}\" ] && echo \"OK\" || echo \"ERR\""))
                .await?;
            if check.lines().last() != Some("OK") {
                return Err(HostError::RemoteDir {
                    message: format!(
                        "persistent dir {dir} on the headnode failed verification (got '{check}')"
                    ),
                });
            }
            state.persistent_dir = Some(dir);
            state.owns_persistent_dir = true;
        }

        // One slave per node beyond the first, inheriting this host's
        // executions retargeted at the slave.
        let mut slaves = Vec::new();
        for (i, node) in state.node_set.iter().enumerate().skip(1) {
            let name = format!("{}!{}", self.name, i);
            let executions = state
                .executions
                .iter()
                .map(|e| e.retarget(&name))
                .collect();
            let slave = Arc::new(ClusterHost {
                name: name.clone(),
                config: self.config.clone(),
                in_cleanup: AtomicBool::new(false),
                state: Mutex::new(HostState {
                    role: Role::Slave {
                        master: self.name.clone(),
                    },
                    node_set: vec![node.clone()],
                    shared: Some(shared.clone()),
                    executions,
                    slaves: Vec::new(),
                    connection: None,
                    extra_connections: Vec::new(),
                    persistent_dir: state.persistent_dir.clone(),
                    owns_persistent_dir: false,
                    local_temp_dir: None,
                }),
            });
            tracing::info!(master = %self.name, slave = %name, node = %node, "slave host spawned");
            slaves.push(slave);
        }
        state.slaves = slaves;

        // Per-node forwarding scripts let the file-transfer layer reach
        // compute nodes through the frontend.
        let persistent = persistent_dir_of(&self.config, state).ok_or_else(|| {
            HostError::RemoteDir {
                message: format!("no persistent dir available for {}", self.name),
            }
        })?;
        let res = shared
            .shell
            .run(&format!("mkdir -p \"{persistent}/grid_sftp\" && echo \"OK\""))
            .await?;
        if res.lines().last() != Some("OK") {
            return Err(HostError::RemoteDir {
                message: format!("could not create {persistent}/grid_sftp (got '{res}')"),
            });
        }
        for node in &state.node_set {
            if self.is_in_cleanup() {
                return Ok(());
            }
            let script = format!("{persistent}/grid_sftp/sftp_fwd_{node}");
            let res = shared
                .shell
                .run(&format!(
                    "echo \"ssh -o BatchMode=yes -s {node} sftp\" > \"{script}\" \
                     && chmod +x \"{script}\" && echo \"OK\""
                ))
                .await?;
            if res.lines().last() != Some("OK") {
                return Err(HostError::RemoteDir {
                    message: format!(
                        "could not create forwarding script for {node} (got '{res}')"
                    ),
                });
            }
        }
        Ok(())
    }

    /// Open an additional logical connection to this host's node.
    ///
    /// The host owns the connection and closes it during teardown.
    pub async fn setup_new_connection(&self) -> HostResult<Arc<LogicalConnection>> {
        if self.is_in_cleanup() {
            return Err(HostError::InCleanup {
                host: self.name.clone(),
            });
        }
        let (shared, node) = {
            let state = self.state.lock().await;
            let shared = state.shared.clone().ok_or_else(|| HostError::NotPrepared {
                host: self.name.clone(),
            })?;
            let node = state
                .node_set
                .first()
                .cloned()
                .ok_or_else(|| HostError::NotPrepared {
                    host: self.name.clone(),
                })?;
            (shared, node)
        };
        let conn = Arc::new(open_ready_connection(&shared, &node).await?);
        self.state
            .lock()
            .await
            .extra_connections
            .push(Arc::clone(&conn));
        Ok(conn)
    }

    /// Run a command on this host's node over its primary connection.
    pub async fn send_command(&self, command: &str) -> HostResult<String> {
        let conn = self.primary_connection().await?;
        Ok(run_command(&conn, command).await?)
    }

    /// Start a command on a specific connection; returns the marker for
    /// [`finish_command`](Self::finish_command).
    pub async fn start_command(
        &self,
        conn: &LogicalConnection,
        command: &str,
    ) -> HostResult<String> {
        Ok(shell::start_command(conn, command).await?)
    }

    /// Collect the output of a command started with
    /// [`start_command`](Self::start_command).
    pub async fn finish_command(
        &self,
        conn: &LogicalConnection,
        marker: &str,
    ) -> HostResult<String> {
        Ok(shell::finish_command(conn, marker).await?)
    }

    async fn primary_connection(&self) -> HostResult<Arc<LogicalConnection>> {
        self.state
            .lock()
            .await
            .connection
            .clone()
            .ok_or_else(|| HostError::NotPrepared {
                host: self.name.clone(),
            })
    }

    async fn shared_and_node(&self) -> HostResult<(SharedInfra, String)> {
        let state = self.state.lock().await;
        let shared = state.shared.clone().ok_or_else(|| HostError::NotPrepared {
            host: self.name.clone(),
        })?;
        let node = state
            .node_set
            .first()
            .cloned()
            .ok_or_else(|| HostError::NotPrepared {
                host: self.name.clone(),
            })?;
        Ok((shared, node))
    }

    /// Upload a single file to this host's node.
    pub async fn send_file(
        &self,
        local: &Path,
        remote: &str,
        overwrite: bool,
    ) -> HostResult<()> {
        if self.is_in_cleanup() {
            return Err(HostError::InCleanup {
                host: self.name.clone(),
            });
        }
        let (shared, node) = self.shared_and_node().await?;
        let transfer = shared.subchannels.acquire(&node).await?;
        if transfer.exists(remote).await? {
            if !overwrite {
                return Err(HostError::BadDestination {
                    path: remote.to_string(),
                    reason: "destination exists and overwriting was not allowed",
                });
            }
            if transfer.is_dir(remote).await? {
                return Err(HostError::BadDestination {
                    path: remote.to_string(),
                    reason: "destination is a directory",
                });
            }
        }
        transfer.put(local, remote).await?;
        transfer
            .chmod(remote, local_file_mode(local).map_err(HostError::from_io)?)
            .await?;
        Ok(())
    }

    /// Upload a directory tree to this host's node, overwriting files.
    pub async fn send_files(&self, local: &Path, remote: &str) -> HostResult<()> {
        let (shared, node) = self.shared_and_node().await?;
        let transfer = shared.subchannels.acquire(&node).await?;
        let mut paths = vec![(local.to_path_buf(), remote.to_string())];
        while let Some((local_path, remote_path)) = paths.pop() {
            if self.is_in_cleanup() {
                return Ok(());
            }
            if local_path.is_dir() {
                if !transfer.exists(&remote_path).await? {
                    transfer.mkdir(&remote_path).await?;
                    transfer
                        .chmod(
                            &remote_path,
                            local_file_mode(&local_path).map_err(HostError::from_io)?,
                        )
                        .await?;
                }
                let entries = std::fs::read_dir(&local_path).map_err(HostError::from_io)?;
                for entry in entries {
                    let entry = entry.map_err(HostError::from_io)?;
                    let name = entry.file_name().to_string_lossy().into_owned();
                    paths.push((entry.path(), format!("{remote_path}/{name}")));
                }
            } else {
                if transfer.exists(&remote_path).await? && transfer.is_dir(&remote_path).await? {
                    return Err(HostError::BadDestination {
                        path: remote_path,
                        reason: "destination is a directory",
                    });
                }
                transfer.put(&local_path, &remote_path).await?;
                transfer
                    .chmod(
                        &remote_path,
                        local_file_mode(&local_path).map_err(HostError::from_io)?,
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Download a file from this host's node.
    pub async fn get_file(
        &self,
        remote: &str,
        local: &Path,
        overwrite: bool,
    ) -> HostResult<()> {
        if local.exists() {
            if !overwrite {
                return Err(HostError::BadDestination {
                    path: local.display().to_string(),
                    reason: "destination exists and overwriting was not allowed",
                });
            }
            if local.is_dir() {
                return Err(HostError::BadDestination {
                    path: local.display().to_string(),
                    reason: "destination is a directory",
                });
            }
        }
        if self.is_in_cleanup() {
            return Ok(());
        }
        let (shared, node) = self.shared_and_node().await?;
        let transfer = shared.subchannels.acquire(&node).await?;
        transfer.get(remote, local).await?;
        Ok(())
    }

    /// Directory for files that only need to live while a client runs.
    pub async fn test_dir(&self) -> Option<String> {
        if let Some(dir) = &self.config.remote_dir {
            return Some(dir.clone());
        }
        self.state.lock().await.local_temp_dir.clone()
    }

    /// Directory for files that must survive until teardown.
    pub async fn persistent_test_dir(&self) -> Option<String> {
        let state = self.state.lock().await;
        persistent_dir_of(&self.config, &state)
    }

    /// The address of this host's node.
    pub async fn address(&self) -> Option<String> {
        self.state.lock().await.node_set.first().cloned()
    }

    /// The subnet this host's traffic comes from, as its node address.
    pub async fn subnet(&self) -> Option<String> {
        self.address().await
    }

    /// Tear this host down: slaves first, then itself. Best-effort;
    /// returns descriptions of every step that failed.
    pub async fn cleanup(&self) -> Vec<String> {
        self.in_cleanup.store(true, Ordering::Release);
        let mut failures = Vec::new();
        let slaves = { self.state.lock().await.slaves.clone() };
        for slave in &slaves {
            failures.extend(slave.cleanup_parts().await);
        }
        failures.extend(self.cleanup_parts().await);
        failures
    }

    async fn cleanup_parts(&self) -> Vec<String> {
        self.in_cleanup.store(true, Ordering::Release);
        let mut failures = Vec::new();
        let mut state = self.state.lock().await;

        // The node-local temp dir goes first, while the connection to the
        // node still works.
        if let Some(dir) = state.local_temp_dir.take() {
            if let Some(conn) = state.connection.as_ref() {
                if let Err(err) = run_command(conn, &format!("rm -rf \"{dir}\"")).await {
                    failures.push(format!(
                        "removing temp dir {dir} on node of {}: {err}",
                        self.name
                    ));
                }
            }
        }
        if let Some(conn) = state.connection.take() {
            conn.close().await;
        }
        for conn in state.extra_connections.drain(..) {
            conn.close().await;
        }

        // The supervisor keeps its persistent dir and infrastructure for
        // the group's final teardown.
        if !state.role.is_supervisor() {
            if state.owns_persistent_dir {
                if let (Some(dir), Some(shared)) =
                    (state.persistent_dir.take(), state.shared.clone())
                {
                    match shared
                        .shell
                        .run(&format!("rm -rf \"{dir}\" && echo \"OK\""))
                        .await
                    {
                        Ok(res) if res.lines().last() == Some("OK") => {}
                        Ok(res) => failures.push(format!(
                            "removing persistent dir {dir} for {}: unexpected response '{res}'",
                            self.name
                        )),
                        Err(err) => failures.push(format!(
                            "removing persistent dir {dir} for {}: {err}",
                            self.name
                        )),
                    }
                }
            }
            state.shared = None;
        }
        tracing::debug!(host = %self.name, failures = failures.len(), "host cleaned up");
        failures
    }
}

impl std::fmt::Debug for ClusterHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHost")
            .field("name", &self.name)
            .field("headnode", &self.config.headnode)
            .finish()
    }
}

fn persistent_dir_of(config: &HostConfig, state: &HostState) -> Option<String> {
    if let Some(dir) = &state.persistent_dir {
        return Some(dir.clone());
    }
    if let Some(dir) = &config.remote_dir {
        return Some(dir.clone());
    }
    state.local_temp_dir.clone()
}

async fn open_ready_connection(
    shared: &SharedInfra,
    node: &str,
) -> HostResult<LogicalConnection> {
    let conn = shared.channel.open(node, "bash -l").await?;
    // The cd forces automounts to settle before any real command runs.
    let res = run_command(&conn, "cd; echo \"READY\"").await?;
    if !res.ends_with("READY") {
        conn.close().await;
        return Err(HostError::ConnectionNotReady {
            node: node.to_string(),
            output: res,
        });
    }
    Ok(conn)
}

fn local_file_mode(path: &Path) -> std::io::Result<u32> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(std::fs::metadata(path)?.permissions().mode() & 0o7777)
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(0o644)
    }
}

impl HostError {
    fn from_io(err: std::io::Error) -> Self {
        HostError::FileTransfer(err.into())
    }
}

/// The declared cluster hosts of one run, in declaration order.
pub struct ClusterGroup {
    hosts: Vec<Arc<ClusterHost>>,
    factory: Arc<dyn SessionFactory>,
    election: Mutex<Option<usize>>,
}

impl ClusterGroup {
    /// Group the declared hosts with the session factory to reach their
    /// frontend.
    pub fn new(hosts: Vec<Arc<ClusterHost>>, factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            hosts,
            factory,
            election: Mutex::new(None),
        }
    }

    /// The group's hosts in declaration order.
    pub fn hosts(&self) -> &[Arc<ClusterHost>] {
        &self.hosts
    }

    /// Prepare every host, strictly sequentially.
    ///
    /// Elects the first host as supervisor exactly once: a second call
    /// fails instead of racing a second reservation into existence.
    pub async fn prepare_all(&self) -> HostResult<()> {
        if self.hosts.is_empty() {
            return Err(HostError::NoHosts);
        }
        {
            let mut election = self.election.lock().await;
            if election.is_some() {
                return Err(HostError::AlreadyPrepared {
                    host: self.hosts[0].name().to_string(),
                });
            }
            let expected = &self.hosts[0].config().headnode;
            for host in &self.hosts[1..] {
                if &host.config().headnode != expected {
                    return Err(HostError::MixedHeadnodes {
                        host: host.name().to_string(),
                        expected: expected.clone(),
                        found: host.config().headnode.clone(),
                    });
                }
            }
            self.elect_supervisor().await?;
            *election = Some(0);
        }
        for host in &self.hosts {
            if host.is_in_cleanup() {
                return Ok(());
            }
            host.prepare().await?;
        }
        Ok(())
    }

    /// Supervisor phase: one session, one channel, one reservation for
    /// the whole group, granted nodes handed out in declaration order.
    async fn elect_supervisor(&self) -> HostResult<()> {
        let supervisor = &self.hosts[0];
        let config = supervisor.config();
        let session = self
            .factory
            .connect(&config.headnode, &config.user)
            .await?;
        let shell = Arc::new(MasterShell::from_stream(session.exec("bash -l").await?));

        if let Some(helper) = &config.demux_helper {
            let target = helper
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| config.mux_command.clone());
            session.upload(helper, &target).await?;
        }
        let stream = session.exec(&config.mux_command).await?;
        let channel = Channel::new(stream.writer, stream.reader, Arc::new(ConnectionIds::new()));
        let suspend = Arc::new(AtomicBool::new(false));
        let keepalive = spawn_keepalive(
            channel.clone(),
            Duration::from_secs(config.keepalive_secs),
            Arc::clone(&suspend),
        );

        let scheduler = Arc::new(SchedulerClient::new(
            Arc::clone(&shell) as Arc<dyn CommandRunner>,
            config.max_poll_attempts,
            Duration::from_millis(config.poll_sleep_ms),
        ));
        scheduler.initialize().await?;

        let requests: Vec<usize> = self.hosts.iter().map(|h| h.config().node_count).collect();
        let total: usize = requests.iter().sum();
        let duration = self
            .hosts
            .iter()
            .map(|h| h.config().reserve_secs)
            .max()
            .unwrap_or(config.reserve_secs);
        let reservation = scheduler.submit(total, duration).await?;
        scheduler.wait_ready(&reservation).await?;
        let nodes = scheduler.granted_nodes(&reservation).await?;
        for node in &nodes {
            scheduler.probe_node(&reservation, node).await?;
        }
        let subsets = partition_nodes(&nodes, &requests)?;

        let shared = SharedInfra {
            subchannels: Arc::new(SubchannelManager::new(session.file_transfers())),
            session,
            channel,
            shell,
            scheduler,
            keepalives: Arc::new(std::sync::Mutex::new(vec![keepalive])),
            suspend,
        };
        for (i, (host, subset)) in self.hosts.iter().zip(subsets).enumerate() {
            let role = if i == 0 {
                Role::Supervisor {
                    reservation: reservation.clone(),
                }
            } else {
                Role::Master
            };
            host.install(role, subset, shared.clone()).await;
        }
        tracing::info!(
            reservation = %reservation,
            nodes = nodes.len(),
            hosts = self.hosts.len(),
            "supervisor elected, nodes granted"
        );
        Ok(())
    }

    /// Tear the whole group down: non-supervisors first, the supervisor
    /// and its shared infrastructure last.
    ///
    /// Best-effort; every failure is collected and at most one aggregated
    /// error comes back.
    pub async fn cleanup_all(&self) -> Result<(), CleanupError> {
        for host in &self.hosts {
            host.in_cleanup.store(true, Ordering::Release);
        }
        let mut failures = Vec::new();
        for host in self.hosts.iter().skip(1) {
            failures.extend(host.cleanup().await);
        }
        if let Some(supervisor) = self.hosts.first() {
            failures.extend(supervisor.cleanup().await);
            failures.extend(self.supervisor_teardown(supervisor).await);
        }
        if failures.is_empty() {
            Ok(())
        } else {
            tracing::warn!(failures = failures.len(), "group cleanup finished with failures");
            Err(CleanupError { failures })
        }
    }

    async fn supervisor_teardown(&self, supervisor: &Arc<ClusterHost>) -> Vec<String> {
        let mut failures = Vec::new();
        let (shared, reservation, persistent, owns) = {
            let mut state = supervisor.state.lock().await;
            (
                state.shared.take(),
                state.role.reservation().cloned(),
                state.persistent_dir.take(),
                state.owns_persistent_dir,
            )
        };
        let Some(shared) = shared else {
            return failures;
        };
        // The keepalive keeps running while siblings clean up over the
        // channel; it is quiesced only once the channel itself goes away.
        shared.suspend.store(true, Ordering::Release);

        if let Some(reservation) = reservation {
            if let Err(err) = shared.scheduler.cancel(&reservation).await {
                failures.push(format!("cancelling reservation {reservation}: {err}"));
            }
        }
        {
            let mut keepalives = match shared.keepalives.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for keepalive in keepalives.drain(..) {
                keepalive.cancel();
            }
        }
        if let Err(err) = shared.channel.send_quit().await {
            tracing::warn!(error = %err, "could not send quit on the mux channel");
            failures.push(format!("quitting the mux channel: {err}"));
        }
        if owns {
            if let Some(dir) = persistent {
                match shared
                    .shell
                    .run(&format!("rm -rf \"{dir}\" && echo \"OK\""))
                    .await
                {
                    Ok(res) if res.lines().last() == Some("OK") => {}
                    Ok(res) => failures.push(format!(
                        "removing persistent dir {dir}: unexpected response '{res}'"
                    )),
                    Err(err) => {
                        failures.push(format!("removing persistent dir {dir}: {err}"))
                    }
                }
            }
        }
        shared.subchannels.close_all().await;
        shared.shell.close().await;
        if let Err(err) = shared.session.close().await {
            failures.push(format!("closing the head session: {err}"));
        }
        tracing::info!("supervisor teardown finished");
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{MockCommandHandler, MockSessionFactory};

    fn handler() -> MockCommandHandler {
        Arc::new(|addr: &str, command: &str| {
            if command.starts_with("preserve -1 -# ") {
                return "77".to_string();
            }
            if command.starts_with("ERR=0; COUNT=0;") {
                return "OK".to_string();
            }
            if command.starts_with("preserve -llist") {
                return "node201 node202".to_string();
            }
            if command.starts_with("if ! qstat") {
                return "OK".to_string();
            }
            if command.starts_with("mktemp -d --tmpdir=\"`pwd`\"") {
                return "/home/tester/tmp.x".to_string();
            }
            if command.starts_with("mkdir -p /local/") {
                return format!("/local/tester/tmp.{addr}");
            }
            if command == "cd; echo \"READY\"" {
                return "READY".to_string();
            }
            if command.starts_with("[ -d ")
                || command.starts_with("mkdir -p \"")
                || command.starts_with("echo \"ssh -o BatchMode")
                || command.starts_with("rm -rf ")
            {
                return "OK".to_string();
            }
            String::new()
        })
    }

    fn test_config(node_count: usize) -> HostConfig {
        HostConfig {
            headnode: "fs0.grid.example.org".to_string(),
            headnode_override: false,
            node_count,
            reserve_secs: 600,
            user: "tester".to_string(),
            remote_dir: None,
            keepalive_secs: 30,
            mux_command: "gridtest-demux".to_string(),
            demux_helper: None,
            max_poll_attempts: 3,
            poll_sleep_ms: 10,
        }
    }

    #[tokio::test]
    async fn sibling_cleanup_leaves_the_keepalive_running() {
        let host_a = ClusterHost::new("clusterA", test_config(1), Vec::new());
        let host_b = ClusterHost::new("clusterB", test_config(1), Vec::new());
        let factory = Arc::new(MockSessionFactory::new(handler()));
        let group = ClusterGroup::new(
            vec![host_a, host_b],
            factory as Arc<dyn SessionFactory>,
        );
        group.prepare_all().await.unwrap();

        let suspend = {
            let state = group.hosts()[0].state.lock().await;
            Arc::clone(&state.shared.as_ref().unwrap().suspend)
        };

        // A sibling tearing down must not silence the keepalive the
        // supervisor's channel still depends on.
        let failures = group.hosts()[1].cleanup().await;
        assert!(failures.is_empty(), "sibling cleanup failed: {failures:?}");
        assert!(!suspend.load(Ordering::Acquire));

        group.cleanup_all().await.unwrap();
        assert!(suspend.load(Ordering::Acquire));
    }
}
