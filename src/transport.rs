use std::{path::Path, time::Duration};

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::{StatusCode, redirect};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::config::Secret;

const MIB: f64 = 1024.0 * 1024.0;

fn build_client(
    user_agent: &str,
    timeout: Duration,
    redirects: redirect::Policy,
) -> Result<ClientWithMiddleware> {
    let base_client = reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(4) // Limit connection reuse per host.
        .pool_idle_timeout(Duration::from_secs(30))
        .tcp_keepalive(Duration::from_secs(60))
        .redirect(redirects)
        .build()
        .context("Failed to create HTTP client")?;

    let retry_policy = ExponentialBackoff::builder()
        .retry_bounds(Duration::from_millis(100), Duration::from_secs(5))
        .build_with_max_retries(3);

    Ok(ClientBuilder::new(base_client)
        .with(RetryTransientMiddleware::new_with_policy(retry_policy))
        .build())
}

/// Client for provider listing APIs.
///
/// Redirects are not followed: a moved listing means the build's artifacts
/// expired, and callers treat it as an empty result.
pub fn api_client(user_agent: &str) -> Result<ClientWithMiddleware> {
    build_client(user_agent, Duration::from_secs(60), redirect::Policy::none())
}

/// Client for artifact and archive downloads, which usually redirect to blob
/// storage.
pub fn download_client(user_agent: &str, timeout: Duration) -> Result<ClientWithMiddleware> {
    build_client(user_agent, timeout, redirect::Policy::limited(10))
}

/// True for the "gone" answers that mean there is nothing left to list.
pub fn is_gone(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY | StatusCode::NOT_FOUND | StatusCode::GONE
    )
}

/// Streams `url` into `dest` chunk by chunk, logging progress every
/// `progress_interval` bytes. Returns the number of bytes written.
pub async fn download_to_file(
    client: &ClientWithMiddleware,
    url: &str,
    token: Option<&Secret>,
    dest: &Path,
    progress_interval: u64,
) -> Result<u64> {
    let mut request = client.get(url);
    if let Some(token) = token {
        request = request.bearer_auth(token.expose());
    }
    let response = request
        .send()
        .await
        .with_context(|| format!("Download request failed: {}", url))?;

    if !response.status().is_success() {
        anyhow::bail!("HTTP {} from {}", response.status(), url);
    }

    let mut file = tokio::fs::File::create(dest)
        .await
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut stream = response.bytes_stream();
    let mut loaded: u64 = 0;
    let mut logged: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("Failed to read body of {}", url))?;
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
        loaded += chunk.len() as u64;
        if progress_interval > 0 && loaded - logged >= progress_interval {
            info!(url, "Downloaded {:.0} MiB", (loaded as f64 / MIB).max(1.0));
            logged = loaded;
        }
    }
    file.flush().await?;

    info!(url, "Downloaded {:.0} MiB", (loaded as f64 / MIB).max(1.0));
    Ok(loaded)
}

/// Names of the entries of a zip archive on disk.
pub async fn zip_entries(path: &Path) -> Result<Vec<String>> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
        let file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let archive = zip::ZipArchive::new(file)
            .with_context(|| format!("{} is not a zip archive", path.display()))?;
        Ok(archive.file_names().map(str::to_string).collect())
    })
    .await
    .context("Zip listing task panicked")?
}

/// Copies one member of a zip archive to `dest`.
pub async fn extract_zip_member(archive: &Path, member: &str, dest: &Path) -> Result<u64> {
    let archive = archive.to_path_buf();
    let member = member.to_string();
    let dest = dest.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<u64> {
        let file = std::fs::File::open(&archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut zip = zip::ZipArchive::new(file)
            .with_context(|| format!("{} is not a zip archive", archive.display()))?;
        let mut entry = zip
            .by_name(&member)
            .with_context(|| format!("{} has no member {}", archive.display(), member))?;
        let mut out = std::fs::File::create(&dest)
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let copied = std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to extract {}", member))?;
        Ok(copied)
    })
    .await
    .context("Zip extraction task panicked")?
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, data) in entries {
            zip.start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[tokio::test]
    async fn lists_and_extracts_zip_members() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bundle.zip");
        write_zip(
            &archive,
            &[
                ("packages/linux-64/a-1-0.tar.bz2", &b"package"[..]),
                ("packages/linux-64/repodata.json", &b"{}"[..]),
            ],
        );

        let names = zip_entries(&archive).await.unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"packages/linux-64/a-1-0.tar.bz2".to_string()));

        let dest = dir.path().join("a-1-0.tar.bz2");
        let copied = extract_zip_member(&archive, "packages/linux-64/a-1-0.tar.bz2", &dest)
            .await
            .unwrap();
        assert_eq!(copied, 7);
        assert_eq!(std::fs::read(&dest).unwrap(), b"package");
    }

    #[tokio::test]
    async fn non_zip_input_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.zip");
        std::fs::write(&bogus, b"not a zip").unwrap();
        assert!(zip_entries(&bogus).await.is_err());
    }

    #[test]
    fn gone_statuses() {
        assert!(is_gone(StatusCode::MOVED_PERMANENTLY));
        assert!(is_gone(StatusCode::NOT_FOUND));
        assert!(!is_gone(StatusCode::OK));
    }
}
