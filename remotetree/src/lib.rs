//! HTTP-backed `RemoteTree` (spec §6), generalizing the teacher's
//! `client/src/api_client.rs` from whole-file GET/PUT into the full
//! list/stat/byte-range/create/update/delete/rename surface the RQ
//! processor needs.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use damshare_core::error::{ShareError, ShareResult};
use damshare_core::remote::{RemoteStat, RemoteTree};

#[derive(Debug, Serialize, Deserialize)]
struct StatDto {
    path: String,
    is_dir: bool,
    size: u64,
    last_modified: i64,
}

impl From<StatDto> for RemoteStat {
    fn from(d: StatDto) -> Self {
        RemoteStat { path: d.path, is_dir: d.is_dir, size: d.size, last_modified: d.last_modified }
    }
}

#[derive(Debug, Serialize)]
struct RenameRequest<'a> {
    destination: &'a str,
}

/// Talks to the reference `remoteserver` (or any server implementing the
/// same contract) over `reqwest`.
pub struct HttpRemoteTree {
    client: Client,
    base_url: String,
}

impl HttpRemoteTree {
    /// `timeout` bounds every request (§5 "Timeouts"); an expiry surfaces to
    /// the caller as `reqwest::Error::is_timeout`, which `classify` maps to
    /// `NetworkTransient` the same as a 5xx.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self { client, base_url: base_url.into() }
    }

    fn url(&self, segment: &str, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            segment,
            path.trim_start_matches('/')
        )
    }

    fn classify(&self, path: &str, err: reqwest::Error) -> ShareError {
        ShareError::from_status(path, err.status().map(|s| s.as_u16()), err.to_string())
    }

    async fn read_staged(&self, local_bytes_path: &Path) -> ShareResult<Vec<u8>> {
        tokio::fs::read(local_bytes_path).await.map_err(|e| {
            ShareError::Corrupted(format!(
                "cannot read staged upload {}: {e}",
                local_bytes_path.display()
            ))
        })
    }
}

#[async_trait]
impl RemoteTree for HttpRemoteTree {
    async fn list(&self, path: &str) -> ShareResult<Vec<RemoteStat>> {
        let url = self.url("list", path);
        let resp = self.client.get(&url).send().await.map_err(|e| self.classify(path, e))?;
        let resp = resp.error_for_status().map_err(|e| self.classify(path, e))?;
        let entries: Vec<StatDto> = resp
            .json()
            .await
            .map_err(|e| ShareError::Corrupted(format!("malformed list response for {path}: {e}")))?;
        Ok(entries.into_iter().map(RemoteStat::from).collect())
    }

    async fn stat(&self, path: &str) -> ShareResult<RemoteStat> {
        let url = self.url("stat", path);
        let resp = self.client.get(&url).send().await.map_err(|e| self.classify(path, e))?;
        let resp = resp.error_for_status().map_err(|e| self.classify(path, e))?;
        let dto: StatDto = resp
            .json()
            .await
            .map_err(|e| ShareError::Corrupted(format!("malformed stat response for {path}: {e}")))?;
        Ok(dto.into())
    }

    async fn read_range(&self, path: &str, offset: u64, len: u64) -> ShareResult<Bytes> {
        let url = self.url("files", path);
        let range = format!("bytes={}-{}", offset, offset + len.saturating_sub(1));
        let resp = self
            .client
            .get(&url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await
            .map_err(|e| self.classify(path, e))?;
        let resp = resp.error_for_status().map_err(|e| self.classify(path, e))?;
        resp.bytes().await.map_err(|e| self.classify(path, e))
    }

    async fn create_file_resource(&self, remote_path: &str, local_bytes_path: &Path) -> ShareResult<()> {
        let data = self.read_staged(local_bytes_path).await?;
        let url = self.url("files", remote_path);
        self.client
            .put(&url)
            .body(data)
            .send()
            .await
            .map_err(|e| self.classify(remote_path, e))?
            .error_for_status()
            .map_err(|e| self.classify(remote_path, e))?;
        Ok(())
    }

    async fn update_resource(&self, remote_path: &str, local_bytes_path: &Path) -> ShareResult<()> {
        let data = self.read_staged(local_bytes_path).await?;
        let url = self.url("files", remote_path);
        self.client
            .post(&url)
            .body(data)
            .send()
            .await
            .map_err(|e| self.classify(remote_path, e))?
            .error_for_status()
            .map_err(|e| self.classify(remote_path, e))?;
        Ok(())
    }

    async fn delete_resource(&self, path: &str, _is_file: bool) -> ShareResult<()> {
        let url = self.url("files", path);
        self.client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.classify(path, e))?
            .error_for_status()
            .map_err(|e| self.classify(path, e))?;
        Ok(())
    }

    async fn rename_resource(&self, old: &str, new: &str) -> ShareResult<()> {
        let url = self.url("files", old);
        self.client
            .patch(&url)
            .json(&RenameRequest { destination: new })
            .send()
            .await
            .map_err(|e| self.classify(old, e))?
            .error_for_status()
            .map_err(|e| self.classify(old, e))?;
        Ok(())
    }

    async fn create_directory_resource(&self, path: &str) -> ShareResult<()> {
        let url = self.url("mkdir", path);
        self.client
            .post(&url)
            .send()
            .await
            .map_err(|e| self.classify(path, e))?
            .error_for_status()
            .map_err(|e| self.classify(path, e))?;
        Ok(())
    }
}
