//! FastDFS Operations
//!
//! This module implements all file operations (upload, download, delete,
//! metadata, append/modify/truncate, slave upload) for the FastDFS client.
//! Every operation composes a tracker dispatch (which nominates a storage
//! endpoint) with a storage dispatch (which carries the payload).

use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::instrument;

use crate::connection::{Connection, ConnectionPool};
use crate::dispatcher::Dispatcher;
use crate::errors::{map_status_to_error, FastDFSError, Result};
use crate::protocol::*;
use crate::types::*;

/// Handles all FastDFS file operations
///
/// This struct is used internally by the Client.
pub struct Operations {
    tracker: Dispatcher,
    storage: Dispatcher,
    network_timeout: u64,
}

impl Operations {
    /// Creates a new Operations handler
    pub fn new(
        tracker_pool: Arc<ConnectionPool>,
        storage_pool: Arc<ConnectionPool>,
        network_timeout: u64,
        retry_count: usize,
    ) -> Self {
        Self {
            tracker: Dispatcher::new(tracker_pool, retry_count),
            storage: Dispatcher::new(storage_pool, retry_count),
            network_timeout,
        }
    }

    /// Runs one request/response exchange: sends `header ++ body`, then reads
    /// the response header and, unless the status maps to an error or the
    /// body is empty, the response body.
    async fn do_exchange(
        conn: &mut Connection,
        header: Bytes,
        body: Bytes,
        network_timeout: u64,
    ) -> Result<Bytes> {
        conn.send(&header, network_timeout).await?;
        if !body.is_empty() {
            conn.send(&body, network_timeout).await?;
        }

        let resp_header_data = conn
            .receive_full(FDFS_PROTO_HEADER_LEN, network_timeout)
            .await?;
        let resp_header = decode_header(&resp_header_data)?;

        if let Some(err) = map_status_to_error(resp_header.status) {
            return Err(err);
        }

        if resp_header.length == 0 {
            return Ok(Bytes::new());
        }

        conn.receive_full(resp_header.length as usize, network_timeout)
            .await
    }

    /// Parses a `group[16] ++ ip[16] ++ port(tail)` tracker response, with
    /// `trailer` extra bytes after the port field (1 for a path index, 0
    /// otherwise).
    fn parse_storage_target(body: &[u8], trailer: usize) -> Result<(StorageTarget, &[u8])> {
        if body.len() < FDFS_GROUP_NAME_MAX_LEN + IP_ADDRESS_SIZE + trailer {
            return Err(FastDFSError::InvalidResponse(
                "tracker response too short for group+ip".to_string(),
            ));
        }

        let group_name = unpad_string(&body[..FDFS_GROUP_NAME_MAX_LEN]);
        let ip_rest = &body[FDFS_GROUP_NAME_MAX_LEN..];
        let ip_addr = unpad_string(&ip_rest[..IP_ADDRESS_SIZE]);

        let port_bytes_len = ip_rest.len() - IP_ADDRESS_SIZE - trailer;
        let port_field = &ip_rest[IP_ADDRESS_SIZE..IP_ADDRESS_SIZE + port_bytes_len];
        let port = decode_port_tail(port_field);
        let trailer_slice = &ip_rest[IP_ADDRESS_SIZE + port_bytes_len..];

        let endpoint = Endpoint {
            host: ip_addr,
            port: if port == 0 {
                STORAGE_DEFAULT_PORT
            } else {
                port
            },
        };

        Ok((
            StorageTarget {
                group_name,
                endpoint,
                store_path_index: 0,
            },
            trailer_slice,
        ))
    }

    /// Tracker query: `ServiceQueryStoreWithoutGroupOne` / `ServiceQueryStoreWithGroupOne`.
    async fn query_store(&self, group_name: Option<&str>) -> Result<StorageTarget> {
        let (cmd, group_bytes): (u8, Bytes) = match group_name {
            Some(g) => (
                TrackerCommand::ServiceQueryStoreWithGroupOne.into(),
                pad_string(g, FDFS_GROUP_NAME_MAX_LEN),
            ),
            None => (TrackerCommand::ServiceQueryStoreWithoutGroupOne.into(), Bytes::new()),
        };

        let network_timeout = self.network_timeout;
        let body_clone = group_bytes.clone();
        let resp = self
            .tracker
            .exchange_tracker(move |mut conn| {
                let header = encode_header(body_clone.len() as u64, cmd, 0);
                let body = body_clone.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;

        if resp.is_empty() {
            return Err(FastDFSError::NoStorageServer);
        }

        let (mut target, trailer) = Self::parse_storage_target(&resp, 1)?;
        if let Some(&idx) = trailer.first() {
            target.store_path_index = idx;
        }
        Ok(target)
    }

    /// Tracker query: `ServiceQueryFetchOne` (read-class operations).
    async fn query_fetch(&self, group_name: &str, remote_filename: &str) -> Result<StorageTarget> {
        self.query_by_cmd(
            TrackerCommand::ServiceQueryFetchOne.into(),
            group_name,
            remote_filename,
        )
        .await
    }

    /// Tracker query: `ServiceQueryUpdate` (mutating operations).
    async fn query_update(&self, group_name: &str, remote_filename: &str) -> Result<StorageTarget> {
        self.query_by_cmd(
            TrackerCommand::ServiceQueryUpdate.into(),
            group_name,
            remote_filename,
        )
        .await
    }

    async fn query_by_cmd(
        &self,
        cmd: u8,
        group_name: &str,
        remote_filename: &str,
    ) -> Result<StorageTarget> {
        let mut body = BytesMut::new();
        body.put(pad_string(group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(remote_filename.as_bytes());
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let resp = self
            .tracker
            .exchange_tracker(move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;

        let (target, _) = Self::parse_storage_target(&resp, 0)?;
        Ok(target)
    }

    /// Uploads a file from the local filesystem
    #[instrument(skip(self, metadata))]
    pub async fn upload_file(
        &self,
        local_filename: &str,
        metadata: Option<&Metadata>,
        is_appender: bool,
    ) -> Result<String> {
        let file_data = read_file_content(local_filename)?;
        let ext_name = get_file_ext_name(local_filename);
        self.upload_buffer(&file_data, &ext_name, metadata, is_appender)
            .await
    }

    /// Uploads data from a buffer
    #[instrument(skip(self, data, metadata))]
    pub async fn upload_buffer(
        &self,
        data: &[u8],
        file_ext_name: &str,
        metadata: Option<&Metadata>,
        is_appender: bool,
    ) -> Result<String> {
        let target = self.query_store(None).await?;

        let cmd: u8 = if is_appender {
            StorageCommand::UploadAppenderFile.into()
        } else {
            StorageCommand::UploadFile.into()
        };

        let ext_name_bytes = pad_string(file_ext_name, FDFS_FILE_EXT_NAME_MAX_LEN);
        let store_path_index = target.store_path_index;

        let mut body = BytesMut::with_capacity(1 + FDFS_FILE_EXT_NAME_MAX_LEN + data.len());
        body.put_u8(store_path_index);
        body.put(ext_name_bytes.as_ref());
        body.put_slice(data);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let resp = self
            .storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;

        if resp.len() < FDFS_GROUP_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidResponse(
                "upload response too short".to_string(),
            ));
        }

        let group_name = unpad_string(&resp[..FDFS_GROUP_NAME_MAX_LEN]);
        let remote_filename = String::from_utf8_lossy(&resp[FDFS_GROUP_NAME_MAX_LEN..]).to_string();
        let file_id = join_file_id(&group_name, &remote_filename);

        if let Some(meta) = metadata {
            if !meta.is_empty() {
                let _ = self.set_metadata(&file_id, meta, MetadataFlag::Overwrite).await;
            }
        }

        Ok(file_id)
    }

    /// Uploads a slave file (e.g. a thumbnail) attached to an existing master file
    #[instrument(skip(self, data))]
    pub async fn upload_slave(
        &self,
        master_file_id: &str,
        prefix: &str,
        file_ext_name: &str,
        data: &[u8],
    ) -> Result<String> {
        let (group_name, master_path) = split_file_id(master_file_id)?;

        let target = self.query_fetch(&group_name, &master_path).await?;

        let prefix_bytes = pad_string(prefix, FDFS_FILE_PREFIX_MAX_LEN);
        let ext_bytes = pad_string(file_ext_name, FDFS_FILE_EXT_NAME_MAX_LEN);
        let master_path_bytes = pad_string(&master_path, FDFS_MASTER_FILENAME_MAX_LEN);

        let mut body = BytesMut::with_capacity(
            FDFS_FILE_PREFIX_MAX_LEN + FDFS_FILE_EXT_NAME_MAX_LEN + FDFS_MASTER_FILENAME_MAX_LEN + data.len(),
        );
        body.put(prefix_bytes.as_ref());
        body.put(ext_bytes.as_ref());
        body.put(master_path_bytes.as_ref());
        body.put_slice(data);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::UploadSlaveFile.into();
        let resp = self
            .storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;

        if resp.len() < FDFS_GROUP_NAME_MAX_LEN {
            return Err(FastDFSError::InvalidResponse(
                "upload slave response too short".to_string(),
            ));
        }

        let resp_group = unpad_string(&resp[..FDFS_GROUP_NAME_MAX_LEN]);
        let remote_filename = String::from_utf8_lossy(&resp[FDFS_GROUP_NAME_MAX_LEN..]).to_string();
        Ok(join_file_id(&resp_group, &remote_filename))
    }

    /// Downloads a byte range from a file. `offset=0, length=0` means the whole file.
    #[instrument(skip(self))]
    pub async fn download_file(&self, file_id: &str, offset: u64, length: u64) -> Result<Bytes> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_fetch(&group_name, &remote_filename).await?;

        let remote_filename_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(16 + FDFS_GROUP_NAME_MAX_LEN + remote_filename_bytes.len());
        body.put(encode_int64(offset).as_ref());
        body.put(encode_int64(length).as_ref());
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(remote_filename_bytes);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::DownloadFile.into();
        self.storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await
    }

    /// Downloads a file and saves it to the local filesystem
    pub async fn download_to_file(&self, file_id: &str, local_filename: &str) -> Result<()> {
        let data = self.download_file(file_id, 0, 0).await?;
        write_file_content(local_filename, &data)?;
        Ok(())
    }

    /// Deletes a file from FastDFS
    #[instrument(skip(self))]
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_update(&group_name, &remote_filename).await?;

        let remote_filename_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + remote_filename_bytes.len());
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(remote_filename_bytes);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::DeleteFile.into();
        self.storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;
        Ok(())
    }

    /// Appends data to the end of an appender file
    #[instrument(skip(self, data))]
    pub async fn append_file(&self, file_id: &str, data: &[u8]) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_update(&group_name, &remote_filename).await?;

        let path_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(
            FDFS_GROUP_NAME_MAX_LEN + 8 + path_bytes.len() + data.len(),
        );
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put(encode_int64(path_bytes.len() as u64).as_ref());
        body.put_slice(path_bytes);
        body.put_slice(data);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::AppendFile.into();
        self.storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;
        Ok(())
    }

    /// Overwrites a region of an appender file starting at `offset`
    #[instrument(skip(self, data))]
    pub async fn modify_file(&self, file_id: &str, offset: u64, data: &[u8]) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_update(&group_name, &remote_filename).await?;

        let path_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(
            FDFS_GROUP_NAME_MAX_LEN + 8 + path_bytes.len() + 8 + data.len(),
        );
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put(encode_int64(path_bytes.len() as u64).as_ref());
        body.put_slice(path_bytes);
        body.put(encode_int64(offset).as_ref());
        body.put_slice(data);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::ModifyFile.into();
        self.storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;
        Ok(())
    }

    /// Truncates an appender file to `new_size` bytes
    #[instrument(skip(self))]
    pub async fn truncate_file(&self, file_id: &str, new_size: u64) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_update(&group_name, &remote_filename).await?;

        let path_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + path_bytes.len() + 8);
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(path_bytes);
        body.put(encode_int64(new_size).as_ref());
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::TruncateFile.into();
        self.storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;
        Ok(())
    }

    /// Sets metadata for a file
    #[instrument(skip(self, metadata))]
    pub async fn set_metadata(
        &self,
        file_id: &str,
        metadata: &Metadata,
        flag: MetadataFlag,
    ) -> Result<()> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_update(&group_name, &remote_filename).await?;

        let metadata_bytes = encode_metadata(metadata);
        let remote_filename_bytes = remote_filename.as_bytes();

        let mut body = BytesMut::with_capacity(
            17 + FDFS_GROUP_NAME_MAX_LEN + remote_filename_bytes.len() + metadata_bytes.len(),
        );
        body.put(encode_int64(remote_filename_bytes.len() as u64).as_ref());
        body.put(encode_int64(metadata_bytes.len() as u64).as_ref());
        body.put_u8(flag.into());
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(remote_filename_bytes);
        body.put(metadata_bytes.as_ref());
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::SetMetadata.into();
        self.storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;
        Ok(())
    }

    /// Retrieves metadata for a file
    #[instrument(skip(self))]
    pub async fn get_metadata(&self, file_id: &str) -> Result<Metadata> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_fetch(&group_name, &remote_filename).await?;

        let remote_filename_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + remote_filename_bytes.len());
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(remote_filename_bytes);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::GetMetadata.into();
        let resp = self
            .storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;

        if resp.is_empty() {
            return Ok(Metadata::new());
        }

        decode_metadata(&resp)
    }

    /// Retrieves file information (size, creation time, CRC32, source IP)
    #[instrument(skip(self))]
    pub async fn get_file_info(&self, file_id: &str) -> Result<FileInfo> {
        let (group_name, remote_filename) = split_file_id(file_id)?;
        let target = self.query_fetch(&group_name, &remote_filename).await?;

        let remote_filename_bytes = remote_filename.as_bytes();
        let mut body = BytesMut::with_capacity(FDFS_GROUP_NAME_MAX_LEN + remote_filename_bytes.len());
        body.put(pad_string(&group_name, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put_slice(remote_filename_bytes);
        let body = body.freeze();

        let network_timeout = self.network_timeout;
        let endpoint = target.endpoint.clone();
        let cmd: u8 = StorageCommand::QueryFileInfo.into();
        let resp = self
            .storage
            .exchange(&endpoint, move |mut conn| {
                let header = encode_header(body.len() as u64, cmd, 0);
                let body = body.clone();
                async move {
                    let result = Self::do_exchange(&mut conn, header, body, network_timeout).await;
                    (conn, result)
                }
            })
            .await?;

        if resp.len() < 8 + 8 + 4 + IP_ADDRESS_SIZE {
            return Err(FastDFSError::InvalidResponse(
                "file info response too short".to_string(),
            ));
        }

        let file_size = decode_int64(&resp[0..8]);
        let create_timestamp = decode_int64(&resp[8..16]);
        let crc32 = decode_int32(&resp[16..20]);
        let source_ip = unpad_string(&resp[20..20 + IP_ADDRESS_SIZE]);

        let create_time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(create_timestamp);

        Ok(FileInfo {
            file_size,
            create_time,
            crc32,
            source_ip_addr: source_ip,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_store_response(group: &str, ip: &str, port: u64, path_index: u8) -> BytesMut {
        let mut body = BytesMut::new();
        body.put(pad_string(group, FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put(pad_string(ip, IP_ADDRESS_SIZE).as_ref());
        body.put(encode_int64(port).as_ref());
        body.put_u8(path_index);
        body
    }

    #[test]
    fn parses_query_store_response_with_8_byte_port() {
        let body = tracker_store_response("group1", "10.0.0.5", 23000, 2);
        let (target, trailer) = Operations::parse_storage_target(&body, 1).unwrap();

        assert_eq!(target.group_name, "group1");
        assert_eq!(target.endpoint.host, "10.0.0.5");
        assert_eq!(target.endpoint.port, 23000);
        assert_eq!(trailer, &[2]);
    }

    #[test]
    fn parses_query_fetch_response_with_no_trailer() {
        let mut body = BytesMut::new();
        body.put(pad_string("group1", FDFS_GROUP_NAME_MAX_LEN).as_ref());
        body.put(pad_string("10.0.0.5", IP_ADDRESS_SIZE).as_ref());
        body.put(encode_int64(23000).as_ref());

        let (target, trailer) = Operations::parse_storage_target(&body, 0).unwrap();
        assert_eq!(target.endpoint.port, 23000);
        assert!(trailer.is_empty());
    }

    #[test]
    fn parse_storage_target_rejects_short_body() {
        let body = BytesMut::from(&b"short"[..]);
        assert!(Operations::parse_storage_target(&body, 0).is_err());
    }

    #[test]
    fn zero_port_falls_back_to_storage_default() {
        let body = tracker_store_response("group1", "10.0.0.5", 0, 0);
        let (target, _) = Operations::parse_storage_target(&body, 1).unwrap();
        assert_eq!(target.endpoint.port, STORAGE_DEFAULT_PORT);
    }
}
