//! FastDFS Rust Client
//!
//! Main client struct for interacting with FastDFS distributed file system.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::instrument;

use crate::connection::{ConnectionPool, PoolMode};
use crate::errors::{FastDFSError, Result};
use crate::operations::Operations;
use crate::types::{
    ClientConfig, Endpoint, FileInfo, Metadata, MetadataFlag, FDFS_FILE_EXT_NAME_MAX_LEN,
    FDFS_FILE_PREFIX_MAX_LEN,
};

/// FastDFS client for file operations
///
/// This client provides a high-level, async Rust API for interacting with FastDFS servers.
/// It handles connection pooling, automatic retries, and error handling.
///
/// # Example
///
/// ```no_run
/// use fastdfs::{Client, ClientConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ClientConfig::new(vec!["192.168.1.100:22122".to_string()]);
///     let client = Client::new(config)?;
///
///     let file_id = client.upload_file("test.jpg", None).await?;
///     let data = client.download_file(&file_id).await?;
///     client.delete_file(&file_id).await?;
///
///     client.close().await;
///     Ok(())
/// }
/// ```
pub struct Client {
    config: ClientConfig,
    tracker_pool: Arc<ConnectionPool>,
    storage_pool: Arc<ConnectionPool>,
    ops: Arc<Operations>,
    closed: Arc<RwLock<bool>>,
}

impl Client {
    /// Creates a new FastDFS client with the given configuration
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::validate_config(&config)?;

        let tracker_endpoints = config
            .tracker_addrs
            .iter()
            .map(|addr| {
                Endpoint::parse(addr).ok_or_else(|| {
                    FastDFSError::InvalidArgument(format!("invalid tracker address: {}", addr))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let tracker_pool = Arc::new(ConnectionPool::new(
            PoolMode::Strict,
            tracker_endpoints,
            config.max_conns,
            Duration::from_millis(config.connect_timeout),
            config.network_timeout,
            Duration::from_millis(config.idle_timeout),
        ));

        let storage_pool = Arc::new(ConnectionPool::new(
            PoolMode::Dynamic,
            Vec::new(),
            config.max_conns,
            Duration::from_millis(config.connect_timeout),
            config.network_timeout,
            Duration::from_millis(config.idle_timeout),
        ));

        let ops = Arc::new(Operations::new(
            tracker_pool.clone(),
            storage_pool.clone(),
            config.network_timeout,
            config.retry_count,
        ));

        Ok(Self {
            config,
            tracker_pool,
            storage_pool,
            ops,
            closed: Arc::new(RwLock::new(false)),
        })
    }

    /// The configuration this client was constructed with
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Validates the client configuration
    fn validate_config(config: &ClientConfig) -> Result<()> {
        if config.tracker_addrs.is_empty() {
            return Err(FastDFSError::InvalidArgument(
                "Tracker addresses are required".to_string(),
            ));
        }

        for addr in &config.tracker_addrs {
            if addr.is_empty() || !addr.contains(':') {
                return Err(FastDFSError::InvalidArgument(format!(
                    "Invalid tracker address: {}",
                    addr
                )));
            }
        }

        Ok(())
    }

    /// Checks if the client is closed
    async fn check_closed(&self) -> Result<()> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(FastDFSError::ClientClosed);
        }
        Ok(())
    }

    fn validate_file_id(file_id: &str) -> Result<()> {
        if file_id.is_empty() {
            return Err(FastDFSError::InvalidArgument(
                "file id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_ext_name(ext: &str) -> Result<()> {
        if ext.len() > FDFS_FILE_EXT_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "file extension {:?} exceeds {} bytes",
                ext, FDFS_FILE_EXT_NAME_MAX_LEN
            )));
        }
        Ok(())
    }

    /// Uploads a file from the local filesystem to FastDFS
    #[instrument(skip(self, metadata))]
    pub async fn upload_file(&self, local_filename: &str, metadata: Option<&Metadata>) -> Result<String> {
        self.check_closed().await?;
        self.ops.upload_file(local_filename, metadata, false).await
    }

    /// Uploads data from a buffer to FastDFS
    #[instrument(skip(self, data, metadata))]
    pub async fn upload_buffer(
        &self,
        data: &[u8],
        file_ext_name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed().await?;
        Self::validate_ext_name(file_ext_name)?;
        self.ops.upload_buffer(data, file_ext_name, metadata, false).await
    }

    /// Uploads an appender file that can be modified later
    #[instrument(skip(self, metadata))]
    pub async fn upload_appender_file(
        &self,
        local_filename: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed().await?;
        self.ops.upload_file(local_filename, metadata, true).await
    }

    /// Uploads an appender file from buffer
    #[instrument(skip(self, data, metadata))]
    pub async fn upload_appender_buffer(
        &self,
        data: &[u8],
        file_ext_name: &str,
        metadata: Option<&Metadata>,
    ) -> Result<String> {
        self.check_closed().await?;
        Self::validate_ext_name(file_ext_name)?;
        self.ops.upload_buffer(data, file_ext_name, metadata, true).await
    }

    /// Uploads a slave file (e.g. a thumbnail) attached to an existing master file
    #[instrument(skip(self, data))]
    pub async fn upload_slave_file(
        &self,
        master_file_id: &str,
        prefix: &str,
        file_ext_name: &str,
        data: &[u8],
    ) -> Result<String> {
        self.check_closed().await?;
        Self::validate_file_id(master_file_id)?;
        Self::validate_ext_name(file_ext_name)?;
        if prefix.len() > FDFS_FILE_PREFIX_MAX_LEN {
            return Err(FastDFSError::InvalidArgument(format!(
                "prefix {:?} exceeds {} bytes",
                prefix, FDFS_FILE_PREFIX_MAX_LEN
            )));
        }
        self.ops
            .upload_slave(master_file_id, prefix, file_ext_name, data)
            .await
    }

    /// Downloads a file from FastDFS and returns its content
    #[instrument(skip(self))]
    pub async fn download_file(&self, file_id: &str) -> Result<Bytes> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.download_file(file_id, 0, 0).await
    }

    /// Downloads a specific range of bytes from a file
    #[instrument(skip(self))]
    pub async fn download_file_range(&self, file_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.download_file(file_id, offset, length).await
    }

    /// Downloads a file and saves it to the local filesystem
    #[instrument(skip(self))]
    pub async fn download_to_file(&self, file_id: &str, local_filename: &str) -> Result<()> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.download_to_file(file_id, local_filename).await
    }

    /// Deletes a file from FastDFS
    #[instrument(skip(self))]
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.delete_file(file_id).await
    }

    /// Appends data to the end of an appender file
    #[instrument(skip(self, data))]
    pub async fn append_file(&self, file_id: &str, data: &[u8]) -> Result<()> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.append_file(file_id, data).await
    }

    /// Overwrites a region of an appender file starting at `offset`
    #[instrument(skip(self, data))]
    pub async fn modify_file(&self, file_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.modify_file(file_id, offset, data).await
    }

    /// Truncates an appender file to `new_size` bytes
    #[instrument(skip(self))]
    pub async fn truncate_file(&self, file_id: &str, new_size: u64) -> Result<()> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.truncate_file(file_id, new_size).await
    }

    /// Sets metadata for a file
    #[instrument(skip(self, metadata))]
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.set_metadata(file_id, metadata, flag).await
    }

    /// Retrieves metadata for a file
    #[instrument(skip(self))]
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.get_metadata(file_id).await
    }

    /// Retrieves file information including size, create time, and CRC32
    #[instrument(skip(self))]
    pub async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        self.ops.get_file_info(file_id).await
    }

    /// Checks if a file exists on the storage server
    ///
    /// Only `FileNotFound` is folded into `false`; any other error (e.g. a
    /// network failure or a closed client) propagates, since swallowing it
    /// would tell the caller "does not exist" about a cluster that was
    /// never actually queried successfully.
    pub async fn file_exists(&self, file_id: &str) -> Result<bool> {
        self.check_closed().await?;
        Self::validate_file_id(file_id)?;
        match self.ops.get_file_info(file_id).await {
            Ok(_) => Ok(true),
            Err(FastDFSError::FileNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Closes the client and releases all resources
    ///
    /// After calling close, all operations will return ClientClosed error.
    /// It's safe to call close multiple times.
    pub async fn close(&self) {
        let mut closed = self.closed.write().await;
        if *closed {
            return;
        }
        *closed = true;
        drop(closed);

        self.tracker_pool.close().await;
        self.storage_pool.close().await;
    }
}
