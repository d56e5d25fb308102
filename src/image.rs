use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::CanneryError;
use crate::options::Options;
use crate::paths;

/// Latest installer the hypervisor supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub url: String,
    pub version: String,
}

/// Find an installer that is already on disk: the configured override
/// (relative paths resolve against the instance directory), then the cached
/// download.
pub fn resolve_local(dir: &Path, options: &Options) -> Option<PathBuf> {
    if let Some(custom) = options.installer_path.as_deref().filter(|p| !p.is_empty()) {
        let path = Path::new(custom);
        let path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            dir.join(path)
        };
        if path.is_file() {
            tracing::info!(path = %path.display(), "using installer override");
            return Some(path);
        }
        tracing::warn!(path = %path.display(), "installer override not found, ignoring");
    }

    let cached = paths::restore_image_path(dir);
    if cached.is_file() {
        tracing::info!(path = %cached.display(), "using cached installer");
        return Some(cached);
    }
    None
}

/// Fetch `url` into the instance's installer cache.
///
/// Data goes to `restore.iso.part` and is renamed over `restore.iso` only
/// once complete. Fractions in `[0, 1]` are published on `progress`; if the
/// server sends no length the fraction stays at 0 until the end. When
/// `cancel` fires the partial file is removed and `DownloadCancelled` is
/// returned. URLs without an http(s) scheme are treated as local files.
pub async fn download(
    url: &str,
    dir: &Path,
    progress: &watch::Sender<f64>,
    cancel: &CancellationToken,
) -> Result<PathBuf, CanneryError> {
    let dest = paths::restore_image_path(dir);
    let tmp_path = paths::restore_image_part_path(dir);

    // Remove any stale .part file from a previous failed download
    let _ = tokio::fs::remove_file(&tmp_path).await;
    progress.send_replace(0.0);

    tracing::info!(%url, dest = %dest.display(), "downloading installer");

    let result = tokio::select! {
        r = fetch_to_file(url, &tmp_path, progress) => r,
        _ = cancel.cancelled() => Err(CanneryError::DownloadCancelled),
    };

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        if matches!(e, CanneryError::DownloadCancelled) {
            tracing::info!(%url, "installer download cancelled");
        }
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| CanneryError::io(
            format!("renaming {} to {}", tmp_path.display(), dest.display()),
            e,
        ))?;

    progress.send_replace(1.0);
    tracing::info!(path = %dest.display(), "installer cached");
    Ok(dest)
}

async fn fetch_to_file(
    url: &str,
    tmp_path: &Path,
    progress: &watch::Sender<f64>,
) -> Result<(), CanneryError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return copy_local(Path::new(url.trim_start_matches("file://")), tmp_path).await;
    }

    let response = reqwest::get(url)
        .await
        .map_err(|e| CanneryError::DownloadFailed {
            message: format!("request to {url} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(CanneryError::DownloadFailed {
            message: format!("HTTP {} from {url}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);

    let mut file = tokio::fs::File::create(tmp_path)
        .await
        .map_err(|e| CanneryError::io(format!("creating temp file {}", tmp_path.display()), e))?;

    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| CanneryError::DownloadFailed {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| CanneryError::io("writing installer data", e))?;
        written += chunk.len() as u64;
        if total_size > 0 {
            progress.send_replace((written as f64 / total_size as f64).min(1.0));
        }
    }

    file.flush()
        .await
        .map_err(|e| CanneryError::io("flushing installer file", e))?;
    file.sync_all()
        .await
        .map_err(|e| CanneryError::io("syncing installer file", e))?;

    if written == 0 {
        return Err(CanneryError::RestoreImageBad {
            message: format!("{url} returned an empty body"),
        });
    }
    if total_size > 0 && written < total_size {
        return Err(CanneryError::DownloadFailed {
            message: format!("{url} ended after {written} of {total_size} bytes"),
            source: "truncated response".into(),
        });
    }
    Ok(())
}

async fn copy_local(source: &Path, tmp_path: &Path) -> Result<(), CanneryError> {
    let copied = tokio::fs::copy(source, tmp_path)
        .await
        .map_err(|e| CanneryError::DownloadFailed {
            message: format!("copying installer from {}", source.display()),
            source: Box::new(e),
        })?;
    if copied == 0 {
        return Err(CanneryError::RestoreImageBad {
            message: format!("{} is empty", source.display()),
        });
    }
    Ok(())
}
