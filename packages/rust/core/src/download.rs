//! Daily package downloads.
//!
//! Packages live at `{base_url}/packages/daily/{year}00{id:03}` and are saved
//! as `{year}00{id:03}{extension}`. Bytes are streamed to a `.part` file that
//! is renamed into place only once the body has been fully written, so a
//! package file on disk is always complete.

use std::path::{Path, PathBuf};

use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

use tedsync_shared::{DownloadConfig, Package, Publication, Result, TedSyncError};

/// User-Agent string for package downloads.
const USER_AGENT: &str = concat!("tedsync/", env!("CARGO_PKG_VERSION"));

/// Largest OJS number the five-digit package suffix can carry.
const MAX_OJS_NUMBER: u32 = 999;

/// Five-character package suffix for an OJS number: `"00"` + three digits.
///
/// `"7"` → `"00007"`, `"103"` → `"00103"`. Numbers above 999 do not fit the
/// archive naming scheme and are rejected.
pub fn formatted_id(id: &str) -> Result<String> {
    let trimmed = id.trim();
    let n: u32 = trimmed
        .parse()
        .map_err(|_| TedSyncError::validation(format!("publication id is not numeric: {id:?}")))?;
    if n > MAX_OJS_NUMBER {
        return Err(TedSyncError::validation(format!(
            "publication id {n} exceeds {MAX_OJS_NUMBER}"
        )));
    }
    Ok(format!("00{n:03}"))
}

/// Archive URL for publication `id` of `year`.
pub fn archive_url(base_url: &str, year: i32, id: &str) -> Result<String> {
    Ok(format!(
        "{}/packages/daily/{year}{}",
        base_url.trim_end_matches('/'),
        formatted_id(id)?
    ))
}

/// Local file name for publication `id` of `year`.
pub fn package_file_name(year: i32, id: &str, extension: &str) -> Result<String> {
    Ok(format!("{year}{}{extension}", formatted_id(id)?))
}

/// Streams packages into the download directory.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    base_url: String,
    download_dir: PathBuf,
    file_extension: String,
}

impl Downloader {
    pub fn new(config: &DownloadConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(std::time::Duration::from_secs(30)))
            .build()
            .map_err(|e| TedSyncError::Transport(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            download_dir: config.download_dir.clone(),
            file_extension: config.file_extension.clone(),
        })
    }

    /// Download the package of `publication` and describe it as a [`Package`].
    #[instrument(skip_all, fields(token = %publication.package_token()))]
    pub async fn download(&self, publication: &Publication) -> Result<Package> {
        let url = archive_url(&self.base_url, publication.year, &publication.id)?;
        let file_name =
            package_file_name(publication.year, &publication.id, &self.file_extension)?;
        let target = self.download_dir.join(&file_name);

        tokio::fs::create_dir_all(&self.download_dir)
            .await
            .map_err(|e| TedSyncError::io(&self.download_dir, e))?;

        info!(%url, date = %publication.release_date, "downloading package");
        let bytes = match self.fetch_to(&url, &target).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = tokio::fs::remove_file(part_path(&target)).await;
                return Err(e);
            }
        };
        info!(path = %target.display(), bytes, "download complete");

        let mut package = Package::from_path(target);
        package.year = Some(publication.year);
        package.publication_id = Some(publication.id.clone());
        Ok(package)
    }

    async fn fetch_to(&self, url: &str, target: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TedSyncError::Transport(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TedSyncError::Transport(format!("{url}: HTTP {status}")));
        }

        let part = part_path(target);
        let mut file = tokio::fs::File::create(&part)
            .await
            .map_err(|e| TedSyncError::io(&part, e))?;

        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| TedSyncError::Transport(format!("{url}: {e}")))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|e| TedSyncError::io(&part, e))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|e| TedSyncError::io(&part, e))?;
        drop(file);

        if written == 0 {
            warn!(%url, "server returned an empty package");
        }

        tokio::fs::rename(&part, target)
            .await
            .map_err(|e| TedSyncError::io(target, e))?;
        Ok(written)
    }
}

fn part_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}
