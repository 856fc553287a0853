//! Azure Blob Storage uploader.
//!
//! Uses the Put Blob REST operation with a pre-issued SAS token, so no
//! account key ever reaches the sidecar. Archives larger than one block are
//! sent as Put Block requests and committed with Put Block List.

use super::progress::{format_bytes, format_speed, ProgressStream};
use super::Uploader;
use crate::archive::ArchiveArtifact;
use crate::config::StorageSettings;
use crate::utils::UploadError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, IF_NONE_MATCH};
use reqwest::{Client, Response, Url};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;
use tracing::debug;

const BLOB_API_VERSION: &str = "2021-08-06";

/// Most blocks a single block blob may hold.
const MAX_BLOCKS: u64 = 50_000;

/// Transfer limits for one uploader.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Archives up to this size go out as one Put Blob; larger ones are
    /// split into blocks of this size.
    pub block_size: usize,

    pub connect_timeout: Duration,

    /// Longest silence tolerated while waiting on the store
    pub read_timeout: Duration,

    /// Ceiling for any single request (one block, one small blob, or the
    /// block list commit)
    pub request_timeout: Duration,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            block_size: 16 * 1024 * 1024,
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(600),
        }
    }
}

/// Uploads archives as block blobs under `{account_url}/{container}/{name}`.
#[derive(Clone)]
pub struct BlobUploader {
    client: Client,
    account_url: String,
    sas_token: String,
    options: UploadOptions,
}

impl BlobUploader {
    pub fn new(account_url: impl Into<String>, sas_token: &str) -> Result<Self, UploadError> {
        Self::with_options(account_url, sas_token, UploadOptions::default())
    }

    pub fn with_options(
        account_url: impl Into<String>,
        sas_token: &str,
        options: UploadOptions,
    ) -> Result<Self, UploadError> {
        let client = Client::builder()
            .user_agent(concat!("backup-sidecar/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(options.connect_timeout)
            .read_timeout(options.read_timeout)
            .build()?;

        Ok(Self {
            client,
            account_url: account_url.into(),
            sas_token: sas_token.trim().trim_start_matches('?').to_string(),
            options,
        })
    }

    pub fn from_settings(settings: &StorageSettings) -> Result<Self, UploadError> {
        Self::new(settings.account_url(), &settings.sas_token)
    }

    /// Full blob URL including the SAS query string.
    pub fn blob_url(&self, container: &str, name: &str) -> Result<Url, UploadError> {
        let mut url = Url::parse(&self.account_url)
            .map_err(|e| UploadError::Endpoint(format!("{}: {}", self.account_url, e)))?;

        url.path_segments_mut()
            .map_err(|_| UploadError::Endpoint(self.account_url.clone()))?
            .pop_if_empty()
            .push(container)
            .push(name);

        if !self.sas_token.is_empty() {
            url.set_query(Some(&self.sas_token));
        }
        Ok(url)
    }

    /// Block size for an archive of `size` bytes, grown when needed to stay
    /// within the per-blob block limit.
    fn block_size_for(&self, size: u64) -> usize {
        let needed = usize::try_from(size.div_ceil(MAX_BLOCKS)).unwrap_or(usize::MAX);
        self.options.block_size.max(needed).max(1)
    }

    async fn put_whole(&self, url: Url, file: File, size: u64, blob: &str) -> Result<(), UploadError> {
        let blob = blob.to_string();
        let body = ProgressStream::new(
            ReaderStream::new(file),
            Arc::new(move |sent| debug!(blob = %blob, sent = %format_bytes(sent), "Upload progress")),
        );

        let response = self
            .client
            .put(url)
            .timeout(self.options.request_timeout)
            .header("x-ms-blob-type", "BlockBlob")
            .header("x-ms-version", BLOB_API_VERSION)
            .header(CONTENT_TYPE, "application/gzip")
            .header(CONTENT_LENGTH, size)
            // Refuse to overwrite an existing blob with the same name.
            .header(IF_NONE_MATCH, "*")
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;

        ensure_success(response).await
    }

    async fn put_blocks(&self, url: Url, mut file: File, size: u64, blob: &str) -> Result<(), UploadError> {
        let mut buf = vec![0u8; self.block_size_for(size)];
        let mut block_ids = Vec::new();
        let mut sent = 0u64;

        loop {
            let filled = read_block(&mut file, &mut buf).await?;
            if filled == 0 {
                break;
            }

            let id = block_id(block_ids.len());
            let mut block_url = url.clone();
            block_url
                .query_pairs_mut()
                .append_pair("comp", "block")
                .append_pair("blockid", &id);

            let response = self
                .client
                .put(block_url)
                .timeout(self.options.request_timeout)
                .header("x-ms-version", BLOB_API_VERSION)
                .body(Bytes::copy_from_slice(&buf[..filled]))
                .send()
                .await?;
            ensure_success(response).await?;

            sent += filled as u64;
            block_ids.push(id);
            debug!(blob, block = block_ids.len(), sent = %format_bytes(sent), "Upload progress");
        }

        let mut list_url = url;
        list_url.query_pairs_mut().append_pair("comp", "blocklist");

        // Uncommitted blocks are discarded by the store if the commit never lands.
        let response = self
            .client
            .put(list_url)
            .timeout(self.options.request_timeout)
            .header("x-ms-version", BLOB_API_VERSION)
            .header("x-ms-blob-content-type", "application/gzip")
            .header(CONTENT_TYPE, "application/xml")
            .header(IF_NONE_MATCH, "*")
            .body(block_list_xml(&block_ids))
            .send()
            .await?;

        ensure_success(response).await
    }
}

/// Block ids must all have the same length before encoding.
fn block_id(index: usize) -> String {
    BASE64.encode(format!("{index:06}"))
}

fn block_list_xml(ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Fill `buf` from `file`, returning fewer bytes only at end of file.
async fn read_block(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn ensure_success(response: Response) -> Result<(), UploadError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(UploadError::Rejected {
        status: status.as_u16(),
        body: body.trim().to_string(),
    })
}

#[async_trait]
impl Uploader for BlobUploader {
    async fn upload(&self, artifact: &ArchiveArtifact, container: &str) -> Result<(), UploadError> {
        let url = self.blob_url(container, &artifact.name)?;
        let file = File::open(&artifact.file_path).await?;
        let size = file.metadata().await?.len();

        let started = Instant::now();
        if size <= self.options.block_size as u64 {
            self.put_whole(url, file, size, &artifact.name).await?;
        } else {
            self.put_blocks(url, file, size, &artifact.name).await?;
        }

        debug!(
            blob = %artifact.name,
            container,
            size = %format_bytes(size),
            speed = %format_speed(size, started.elapsed()),
            "Uploaded archive"
        );
        Ok(())
    }
}
