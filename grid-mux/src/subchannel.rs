//! File-transfer subchannels.
//!
//! Bulk file transfer does not go over the mux channel; each target node
//! gets its own transfer subchannel, opened lazily and cached by the
//! [`SubchannelManager`]. The manager owns every subchannel it opens and
//! closes them all during teardown; nothing else closes them.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors from file-transfer subchannels.
#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    /// Local filesystem failure.
    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failure reported by the remote side.
    #[error("remote file transfer error: {message}")]
    Remote {
        /// What the remote side reported.
        message: String,
    },

    /// Operation on a subchannel that was already closed.
    #[error("file transfer subchannel is closed")]
    Closed,
}

/// One file-transfer subchannel to a single node.
#[async_trait]
pub trait FileTransfer: Send + Sync {
    /// True if `remote` exists on the node.
    async fn exists(&self, remote: &str) -> Result<bool, FileTransferError>;

    /// True if `remote` exists and is a directory.
    async fn is_dir(&self, remote: &str) -> Result<bool, FileTransferError>;

    /// Upload a local file to `remote`, overwriting any existing file.
    async fn put(&self, local: &Path, remote: &str) -> Result<(), FileTransferError>;

    /// Download `remote` into a local file, overwriting it.
    async fn get(&self, remote: &str, local: &Path) -> Result<(), FileTransferError>;

    /// Create the directory `remote`.
    async fn mkdir(&self, remote: &str) -> Result<(), FileTransferError>;

    /// Set the permission bits of `remote`.
    async fn chmod(&self, remote: &str, mode: u32) -> Result<(), FileTransferError>;

    /// Close the subchannel.
    async fn close(&self) -> Result<(), FileTransferError>;
}

/// Opens file-transfer subchannels to nodes.
#[async_trait]
pub trait FileTransferFactory: Send + Sync {
    /// Open a fresh subchannel to `node`.
    async fn open(&self, node: &str) -> Result<Arc<dyn FileTransfer>, FileTransferError>;
}

/// Lazily opens and caches one file-transfer subchannel per node.
pub struct SubchannelManager {
    factory: Arc<dyn FileTransferFactory>,
    channels: Mutex<HashMap<String, Arc<dyn FileTransfer>>>,
}

impl SubchannelManager {
    /// Create a manager that opens subchannels through `factory`.
    pub fn new(factory: Arc<dyn FileTransferFactory>) -> Self {
        Self {
            factory,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Get the subchannel for `node`, opening it on first use.
    ///
    /// The cache lock is held across the open, so concurrent callers for
    /// the same node never race two subchannels into existence.
    pub async fn acquire(
        &self,
        node: &str,
    ) -> Result<Arc<dyn FileTransfer>, FileTransferError> {
        let mut channels = self.channels.lock().await;
        if let Some(channel) = channels.get(node) {
            return Ok(Arc::clone(channel));
        }
        let channel = self.factory.open(node).await?;
        channels.insert(node.to_string(), Arc::clone(&channel));
        tracing::debug!(node, "file transfer subchannel opened");
        Ok(channel)
    }

    /// Number of currently open subchannels.
    pub async fn open_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    /// Close every cached subchannel.
    ///
    /// Close failures are logged and swallowed; after this the cache is
    /// empty and later acquires open fresh subchannels.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut channels = self.channels.lock().await;
            channels.drain().collect()
        };
        for (node, channel) in drained {
            if let Err(err) = channel.close().await {
                tracing::warn!(node, error = %err, "error closing file transfer subchannel");
            }
        }
    }
}

/// In-memory [`FileTransfer`] for tests.
///
/// Keeps a fake remote filesystem and a log of every operation in call
/// order.
#[derive(Default)]
pub struct MockFileTransfer {
    state: std::sync::Mutex<MockTransferState>,
}

#[derive(Default)]
struct MockTransferState {
    files: HashMap<String, Vec<u8>>,
    dirs: Vec<String>,
    operations: Vec<String>,
    closed: bool,
}

impl MockFileTransfer {
    /// Create an empty mock subchannel.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockTransferState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn check_open(state: &MockTransferState) -> Result<(), FileTransferError> {
        if state.closed {
            Err(FileTransferError::Closed)
        } else {
            Ok(())
        }
    }

    /// Seed a file on the fake remote filesystem.
    pub fn insert_remote_file(&self, remote: &str, contents: &[u8]) {
        self.lock().files.insert(remote.to_string(), contents.to_vec());
    }

    /// Contents of a file on the fake remote filesystem, if present.
    pub fn remote_file(&self, remote: &str) -> Option<Vec<u8>> {
        self.lock().files.get(remote).cloned()
    }

    /// The operations performed so far, in call order.
    pub fn operations(&self) -> Vec<String> {
        self.lock().operations.clone()
    }

    /// True once [`FileTransfer::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[async_trait]
impl FileTransfer for MockFileTransfer {
    async fn exists(&self, remote: &str) -> Result<bool, FileTransferError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.operations.push(format!("exists {remote}"));
        Ok(state.files.contains_key(remote) || state.dirs.iter().any(|d| d == remote))
    }

    async fn is_dir(&self, remote: &str) -> Result<bool, FileTransferError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.operations.push(format!("is_dir {remote}"));
        Ok(state.dirs.iter().any(|d| d == remote))
    }

    async fn put(&self, local: &Path, remote: &str) -> Result<(), FileTransferError> {
        let contents = std::fs::read(local)?;
        let mut state = self.lock();
        Self::check_open(&state)?;
        state
            .operations
            .push(format!("put {} {remote}", local.display()));
        state.files.insert(remote.to_string(), contents);
        Ok(())
    }

    async fn get(&self, remote: &str, local: &Path) -> Result<(), FileTransferError> {
        let contents = {
            let mut state = self.lock();
            Self::check_open(&state)?;
            state
                .operations
                .push(format!("get {remote} {}", local.display()));
            state
                .files
                .get(remote)
                .cloned()
                .ok_or_else(|| FileTransferError::Remote {
                    message: format!("no such file: {remote}"),
                })?
        };
        std::fs::write(local, contents)?;
        Ok(())
    }

    async fn mkdir(&self, remote: &str) -> Result<(), FileTransferError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.operations.push(format!("mkdir {remote}"));
        state.dirs.push(remote.to_string());
        Ok(())
    }

    async fn chmod(&self, remote: &str, mode: u32) -> Result<(), FileTransferError> {
        let mut state = self.lock();
        Self::check_open(&state)?;
        state.operations.push(format!("chmod {mode:o} {remote}"));
        Ok(())
    }

    async fn close(&self) -> Result<(), FileTransferError> {
        let mut state = self.lock();
        state.operations.push("close".to_string());
        state.closed = true;
        Ok(())
    }
}

/// Factory producing [`MockFileTransfer`]s, one per node.
#[derive(Default)]
pub struct MockFileTransferFactory {
    opened: std::sync::Mutex<Vec<(String, Arc<MockFileTransfer>)>>,
}

impl MockFileTransferFactory {
    /// Create an empty mock factory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subchannel this factory has opened, in open order.
    pub fn opened(&self) -> Vec<(String, Arc<MockFileTransfer>)> {
        match self.opened.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl FileTransferFactory for MockFileTransferFactory {
    async fn open(&self, node: &str) -> Result<Arc<dyn FileTransfer>, FileTransferError> {
        let transfer = Arc::new(MockFileTransfer::new());
        match self.opened.lock() {
            Ok(mut guard) => guard.push((node.to_string(), Arc::clone(&transfer))),
            Err(poisoned) => poisoned
                .into_inner()
                .push((node.to_string(), Arc::clone(&transfer))),
        }
        Ok(transfer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_caches_per_node() {
        let factory = Arc::new(MockFileTransferFactory::new());
        let manager = SubchannelManager::new(Arc::clone(&factory) as Arc<dyn FileTransferFactory>);

        let a1 = manager.acquire("node101").await.unwrap();
        let a2 = manager.acquire("node101").await.unwrap();
        let b = manager.acquire("node102").await.unwrap();

        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
        assert_eq!(factory.opened().len(), 2);
        assert_eq!(manager.open_count().await, 2);
    }

    #[tokio::test]
    async fn close_all_closes_and_empties_the_cache() {
        let factory = Arc::new(MockFileTransferFactory::new());
        let manager = SubchannelManager::new(Arc::clone(&factory) as Arc<dyn FileTransferFactory>);

        manager.acquire("node101").await.unwrap();
        manager.acquire("node102").await.unwrap();
        manager.close_all().await;

        assert_eq!(manager.open_count().await, 0);
        for (_, transfer) in factory.opened() {
            assert!(transfer.is_closed());
        }

        // Re-acquire opens a fresh subchannel.
        manager.acquire("node101").await.unwrap();
        assert_eq!(factory.opened().len(), 3);
    }

    #[tokio::test]
    async fn operations_on_a_closed_subchannel_fail() {
        let transfer = MockFileTransfer::new();
        transfer.close().await.unwrap();
        let err = transfer.mkdir("/tmp/x").await.unwrap_err();
        assert!(matches!(err, FileTransferError::Closed));
    }

    #[tokio::test]
    async fn mock_tracks_a_remote_filesystem() {
        let transfer = MockFileTransfer::new();
        transfer.insert_remote_file("/remote/a", b"data");
        assert!(transfer.exists("/remote/a").await.unwrap());
        assert!(!transfer.exists("/remote/b").await.unwrap());
        transfer.mkdir("/remote/dir").await.unwrap();
        assert!(transfer.is_dir("/remote/dir").await.unwrap());
        assert!(!transfer.is_dir("/remote/a").await.unwrap());
        assert_eq!(
            transfer.operations(),
            vec![
                "exists /remote/a",
                "exists /remote/b",
                "mkdir /remote/dir",
                "is_dir /remote/dir",
                "is_dir /remote/a",
            ]
        );
    }
}
