//! Asynchronous file download with integrity checking.
//!
//! Downloads are streamed to a temporary sibling of the destination and
//! renamed into place on success, so an interrupted download never leaves
//! a partial file behind. When an expected SHA1 digest is supplied, a
//! mismatch aborts the download and removes the temporary file.

use std::path::Path;

use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ProvdError, Result};
use crate::operation::{OipState, OperationInProgress};

/// Proxy configuration applied to outgoing downloads.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub http: Option<String>,
    pub https: Option<String>,
    /// Kept for completeness; plugin repositories are HTTP-only here.
    pub ftp: Option<String>,
}

/// HTTP downloader for plugin indexes and packages.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(proxies: &ProxyConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(http_proxy) = &proxies.http {
            builder = builder.proxy(
                reqwest::Proxy::http(http_proxy)
                    .map_err(|e| ProvdError::InvalidParameter(format!("http proxy: {e}")))?,
            );
        }
        if let Some(https_proxy) = &proxies.https {
            builder = builder.proxy(
                reqwest::Proxy::https(https_proxy)
                    .map_err(|e| ProvdError::InvalidParameter(format!("https proxy: {e}")))?,
            );
        }
        Ok(Self {
            client: builder.build()?,
        })
    }

    /// Download `url` into `dest`, reporting progress through `oip`.
    ///
    /// When `expected_sha1` is given (hex digest), the downloaded bytes
    /// are verified before the file reaches `dest`.
    pub async fn download_file(
        &self,
        url: &str,
        dest: &Path,
        oip: &OperationInProgress,
        expected_sha1: Option<&str>,
    ) -> Result<()> {
        info!("Downloading {} to {:?}", url, dest);
        oip.set_state(OipState::Progress);
        oip.set_current(0);

        let result = self.do_download(url, dest, oip, expected_sha1).await;
        match &result {
            Ok(()) => oip.set_state(OipState::Success),
            Err(e) => {
                warn!("Download of {} failed: {}", url, e);
                oip.set_state(OipState::Fail);
            }
        }
        result
    }

    async fn do_download(
        &self,
        url: &str,
        dest: &Path,
        oip: &OperationInProgress,
        expected_sha1: Option<&str>,
    ) -> Result<()> {
        let mut response = self.client.get(url).send().await?.error_for_status()?;
        oip.set_end(response.content_length());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = dest.with_extension("part");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        let mut hasher = Sha1::new();

        let write_result: Result<()> = async {
            while let Some(chunk) = response.chunk().await? {
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                oip.advance(chunk.len() as u64);
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        drop(file);

        if let Some(expected) = expected_sha1 {
            let actual = hex::encode(hasher.finalize());
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(ProvdError::Integrity {
                    filename: dest
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default(),
                    expected: expected.to_string(),
                });
            }
            debug!("SHA1 digest verified for {:?}", dest);
        }

        tokio::fs::rename(&tmp_path, dest).await?;
        Ok(())
    }
}
