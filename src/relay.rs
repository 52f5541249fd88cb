//! Artifact relay: pushes the build outputs of a pull request to the package
//! and container registries before it is merged.

use std::{fmt, path::Path, sync::Arc};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use tracing::{debug, info, warn};

use crate::{
    aggregator::discover_artifacts,
    config::{BotConfig, Credentials, RetryPolicy, Secret},
    error::{BotError, Lookup},
    github::Forge,
    providers::ProviderRegistry,
    transport,
    types::{ArtifactRecord, Provider, UploadTarget},
};

/// An external tool invocation.
#[derive(Clone, Default)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Values masked when the invocation is displayed.
    secrets: Vec<Secret>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn secret_arg(mut self, secret: &Secret) -> Self {
        self.args.push(secret.expose().to_string());
        self.secrets.push(secret.clone());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(arg);
        }
        for secret in &self.secrets {
            if !secret.expose().is_empty() {
                rendered = rendered.replace(secret.expose(), "***");
            }
        }
        f.write_str(&rendered)
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invocation({})", self)
    }
}

/// Runs external tools to completion.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Fails with [`BotError::ToolFailed`] on a non-zero exit.
    async fn run(&self, invocation: &Invocation) -> Result<()>;
}

/// Runs tools as child processes, inheriting stdout and stderr.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, invocation: &Invocation) -> Result<()> {
        debug!(command = %invocation, "Spawning");
        let status = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("Failed to spawn {}", invocation.program))?;

        if !status.success() {
            return Err(BotError::ToolFailed {
                command: invocation.to_string(),
                status: status.to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Container registry API calls made after an image push.
#[async_trait]
pub trait ContainerRegistry: Send + Sync {
    /// Makes `repository` publicly pullable.
    async fn make_public(&self, repository: &str) -> Lookup<()>;
}

/// quay.io repository API.
pub struct Quay {
    client: ClientWithMiddleware,
    api: String,
    namespace: String,
    token: Option<Secret>,
}

impl Quay {
    pub fn new(client: ClientWithMiddleware, config: &BotConfig) -> Self {
        Self {
            client,
            api: config.endpoints.quay_api.trim_end_matches('/').to_string(),
            namespace: config.container_namespace.clone(),
            token: config.credentials.quay_oauth_token.clone(),
        }
    }
}

#[async_trait]
impl ContainerRegistry for Quay {
    async fn make_public(&self, repository: &str) -> Lookup<()> {
        let token = match Credentials::require(&self.token, "QUAY_OAUTH_TOKEN") {
            Ok(token) => token,
            Err(err) => return Lookup::Transient(err.into()),
        };
        let url = format!(
            "{}/repository/{}/{}/changevisibility",
            self.api, self.namespace, repository
        );
        let response = match self
            .client
            .post(&url)
            .bearer_auth(token.expose())
            .json(&serde_json::json!({ "visibility": "public" }))
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return Lookup::Transient(
                    anyhow::Error::new(err).context(format!("Visibility request failed: {}", url)),
                );
            }
        };

        let status = response.status();
        if status.is_success() {
            Lookup::Found(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Lookup::NotFound
        } else {
            Lookup::Transient(anyhow::anyhow!("HTTP {} from {}", status, url))
        }
    }
}

/// One artifact selected for upload.
#[derive(Debug, Clone)]
struct Upload {
    provider: Provider,
    record: ArtifactRecord,
    target: UploadTarget,
    /// Position in the selection; names the upload's staging directory.
    slot: usize,
}

impl Upload {
    /// Staging path of the downloaded file. Each upload gets its own
    /// directory since package names repeat across platform subdirs.
    fn staged_path(&self, staging: &Path) -> std::path::PathBuf {
        staging.join(self.slot.to_string()).join(self.target.file_name())
    }
}

/// `{subdir}/{file}` of an artifact path. The same package built for two
/// platforms differs only in the subdir.
fn upload_key(record: &ArtifactRecord, target: &UploadTarget) -> String {
    let mut segments = record.path.rsplit('/');
    segments.next();
    match segments.next() {
        Some(subdir) => format!("{}/{}", subdir, target.file_name()),
        None => target.file_name().to_string(),
    }
}

/// Artifacts sharing a download, in discovery order.
#[derive(Debug)]
struct DownloadGroup {
    provider: Provider,
    source_url: String,
    bundled: bool,
    uploads: Vec<Upload>,
}

/// Keeps the first artifact per subdir and file name, so a package listed by
/// two providers is uploaded once, and drops everything that is neither a
/// package nor a tagged container archive.
fn select_uploads<'a>(records: impl Iterator<Item = (Provider, &'a ArtifactRecord)>) -> Vec<Upload> {
    let mut selected: Vec<Upload> = Vec::new();
    let mut keys: Vec<String> = Vec::new();
    for (provider, record) in records {
        let Some(target) = UploadTarget::from_path(&record.path) else {
            continue;
        };
        let key = upload_key(record, &target);
        if keys.contains(&key) {
            debug!(%provider, path = %record.path, "Already selected from another provider");
            continue;
        }
        keys.push(key);
        selected.push(Upload {
            provider,
            record: record.clone(),
            target,
            slot: selected.len(),
        });
    }
    selected
}

fn group_downloads(uploads: Vec<Upload>) -> Vec<DownloadGroup> {
    let mut groups: Vec<DownloadGroup> = Vec::new();
    for upload in uploads {
        let bundled = upload.record.is_bundled();
        match groups
            .iter_mut()
            .find(|g| bundled && g.bundled && g.source_url == upload.record.source_url)
        {
            Some(group) => group.uploads.push(upload),
            None => groups.push(DownloadGroup {
                provider: upload.provider,
                source_url: upload.record.source_url.clone(),
                bundled,
                uploads: vec![upload],
            }),
        }
    }
    groups
}

/// Downloads artifacts and pushes them to their registries.
pub struct ArtifactRelay {
    config: Arc<BotConfig>,
    providers: ProviderRegistry,
    downloads: ClientWithMiddleware,
    runner: Arc<dyn CommandRunner>,
    registry: Arc<dyn ContainerRegistry>,
}

impl ArtifactRelay {
    pub fn new(
        config: Arc<BotConfig>,
        providers: ProviderRegistry,
        downloads: ClientWithMiddleware,
        runner: Arc<dyn CommandRunner>,
        registry: Arc<dyn ContainerRegistry>,
    ) -> Self {
        Self {
            config,
            providers,
            downloads,
            runner,
            registry,
        }
    }

    /// Relay wired to the live registries and external tools.
    pub fn standard(config: Arc<BotConfig>, providers: ProviderRegistry) -> Result<Self> {
        let downloads =
            transport::download_client(&config.user_agent, config.tuning.download_timeout)?;
        let registry = Quay::new(transport::api_client(&config.user_agent)?, &config);
        Ok(Self::new(
            config,
            providers,
            downloads,
            Arc::new(ProcessRunner),
            Arc::new(registry),
        ))
    }

    /// Uploads the artifacts of the pull request's current head and returns
    /// that head's SHA.
    ///
    /// Fails with [`BotError::NoArtifacts`] when nothing qualifies. Uploads
    /// run one at a time and the first failure aborts the rest.
    pub async fn upload_artifacts<F>(&self, forge: &F, pr: u64) -> Result<String>
    where
        F: Forge + ?Sized,
    {
        let sha = forge.pull_request(pr).await?.head_sha;
        let artifacts = discover_artifacts(forge, &self.providers, &sha).await?;
        let uploads = select_uploads(artifacts.records());
        if uploads.is_empty() {
            return Err(BotError::NoArtifacts { pr, sha }.into());
        }
        info!(pr, %sha, count = uploads.len(), "Uploading artifacts");

        let staging = tempfile::Builder::new()
            .prefix("bioconda-bot-")
            .tempdir_in(&self.config.work_dir)
            .with_context(|| {
                format!("Failed to create staging directory in {}", self.config.work_dir.display())
            })?;

        for group in group_downloads(uploads) {
            if group.bundled {
                self.relay_bundle(&group, staging.path()).await?;
            } else {
                for upload in &group.uploads {
                    self.relay_direct(upload, staging.path()).await?;
                }
            }
        }

        Ok(sha)
    }

    fn download_token(&self, provider: Provider) -> Option<&Secret> {
        match provider {
            Provider::GithubActions => self.config.credentials.github_token.as_ref(),
            Provider::Azure | Provider::CircleCi => None,
        }
    }

    async fn download(&self, provider: Provider, url: &str, dest: &Path) -> Result<u64> {
        transport::download_to_file(
            &self.downloads,
            url,
            self.download_token(provider),
            dest,
            self.config.tuning.progress_interval_bytes,
        )
        .await
    }

    async fn relay_direct(&self, upload: &Upload, staging: &Path) -> Result<()> {
        let local = upload.staged_path(staging);
        info!(url = %upload.record.source_url, "Downloading artifact");
        let result: Result<()> = async {
            create_parent(&local).await?;
            self.download(upload.provider, &upload.record.source_url, &local)
                .await?;
            self.push(&upload.target, &local).await
        }
        .await;
        remove_staged(&local).await;
        result
    }

    async fn relay_bundle(&self, group: &DownloadGroup, staging: &Path) -> Result<()> {
        let archive = staging.join("bundle.zip");
        info!(url = %group.source_url, members = group.uploads.len(), "Downloading bundle");
        let result: Result<()> = async {
            self.download(group.provider, &group.source_url, &archive).await?;
            for upload in &group.uploads {
                let local = upload.staged_path(staging);
                create_parent(&local).await?;
                let pushed =
                    match transport::extract_zip_member(&archive, &upload.record.path, &local).await
                    {
                        Ok(_) => self.push(&upload.target, &local).await,
                        Err(err) => Err(err),
                    };
                remove_staged(&local).await;
                pushed?;
            }
            Ok(())
        }
        .await;
        remove_staged(&archive).await;
        result
    }

    async fn push(&self, target: &UploadTarget, local: &Path) -> Result<()> {
        match target {
            UploadTarget::Package { .. } => self.upload_package(local).await,
            UploadTarget::Container {
                image, repository, ..
            } => {
                self.push_image(local, image).await?;
                match self.registry.make_public(repository).await {
                    Lookup::Found(()) => info!(%repository, "Repository made public"),
                    Lookup::NotFound => warn!(%repository, "Repository not found for visibility change"),
                    Lookup::Transient(err) => warn!(
                        %repository,
                        error = %format!("{:#}", err),
                        "Failed to make repository public"
                    ),
                }
                Ok(())
            }
        }
    }

    async fn upload_package(&self, local: &Path) -> Result<()> {
        let token = Credentials::require(&self.config.credentials.anaconda_token, "ANACONDA_TOKEN")?;
        let invocation = Invocation::new("anaconda")
            .arg("-t")
            .secret_arg(token)
            .arg("upload")
            .arg(local.display().to_string())
            .arg("--force");
        info!(file = %local.display(), "Uploading package");
        self.runner.run(&invocation).await
    }

    async fn push_image(&self, local: &Path, image: &str) -> Result<()> {
        let login = Credentials::require(&self.config.credentials.quay_login, "QUAY_LOGIN")?;
        let mut invocation = Invocation::new("skopeo")
            .arg("--command-timeout")
            .arg("600s")
            .arg("copy")
            .arg(format!("docker-archive:{}", local.display()))
            .arg(format!(
                "docker://{}/{}/{}",
                self.config.container_registry, self.config.container_namespace, image
            ))
            .arg("--dest-creds")
            .secret_arg(login);
        if let Some(cert_dir) = &self.config.skopeo_cert_dir {
            invocation = invocation.env("SSL_CERT_DIR", cert_dir.display().to_string());
        }
        info!(image, "Pushing image");
        retry_fixed(self.config.tuning.image_push, || self.runner.run(&invocation)).await
    }
}

/// Calls `op` until it succeeds or `policy.attempts` calls have failed, in
/// which case the last error is returned.
pub async fn retry_fixed<T, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= attempts => {
                return Err(err.context(format!("Giving up after {} attempts", attempts)));
            }
            Err(err) => {
                warn!(
                    attempt,
                    attempts,
                    error = %format!("{:#}", err),
                    "Attempt failed, retrying in {:?}",
                    policy.delay
                );
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

async fn create_parent(path: &Path) -> Result<()> {
    let Some(dir) = path.parent() else {
        return Ok(());
    };
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("Failed to create {}", dir.display()))
}

async fn remove_staged(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), error = %err, "Failed to remove staged file"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn invocation_display_masks_secrets() {
        let secret = Secret::new("user:hunter2");
        let invocation = Invocation::new("skopeo")
            .arg("copy")
            .arg("--dest-creds")
            .secret_arg(&secret);
        assert_eq!(invocation.to_string(), "skopeo copy --dest-creds ***");
        assert_eq!(invocation.args.last().unwrap(), "user:hunter2");
    }

    #[test]
    fn same_package_for_two_platforms_is_kept() {
        let linux = ArtifactRecord::new(
            "https://circle/0/packages/linux-64/samtools-1.19-h50ea8bc_0.tar.bz2",
            "packages/linux-64/samtools-1.19-h50ea8bc_0.tar.bz2",
        );
        let osx = ArtifactRecord::new(
            "https://circle/0/packages/osx-64/samtools-1.19-h50ea8bc_0.tar.bz2",
            "packages/osx-64/samtools-1.19-h50ea8bc_0.tar.bz2",
        );
        let uploads = select_uploads([(Provider::CircleCi, &linux), (Provider::CircleCi, &osx)].into_iter());
        assert_eq!(uploads.len(), 2);

        let staging = Path::new("/stage");
        assert_ne!(uploads[0].staged_path(staging), uploads[1].staged_path(staging));
        assert!(uploads[1]
            .staged_path(staging)
            .ends_with("samtools-1.19-h50ea8bc_0.tar.bz2"));
    }

    #[test]
    fn uploads_deduplicate_across_providers() {
        let circle = ArtifactRecord::new(
            "https://circle/0/packages/linux-64/a-1-0.tar.bz2",
            "packages/linux-64/a-1-0.tar.bz2",
        );
        let azure = ArtifactRecord::new("https://azure/zip", "packages/linux-64/a-1-0.tar.bz2");
        let repodata = ArtifactRecord::new("https://azure/zip", "packages/linux-64/repodata.json");
        let records = vec![
            (Provider::CircleCi, &circle),
            (Provider::Azure, &azure),
            (Provider::Azure, &repodata),
        ];
        let uploads = select_uploads(records.into_iter());
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].provider, Provider::CircleCi);
    }

    #[test]
    fn bundled_members_share_one_download() {
        let records = [
            ArtifactRecord::new("https://azure/a.zip", "packages/linux-64/a-1-0.tar.bz2"),
            ArtifactRecord::new("https://azure/a.zip", "images/a%3A1--0.tar.gz"),
            ArtifactRecord::new("https://circle/b-1-0.tar.bz2", "packages/noarch/b-1-0.tar.bz2"),
        ];
        let uploads = select_uploads(records.iter().map(|r| (Provider::Azure, r)));
        let groups = group_downloads(uploads);
        assert_eq!(groups.len(), 2);
        assert!(groups[0].bundled);
        assert_eq!(groups[0].uploads.len(), 2);
        assert!(!groups[1].bundled);
    }

    #[tokio::test]
    async fn retry_stops_after_last_attempt() {
        let mut calls = 0;
        let result: Result<()> = retry_fixed(RetryPolicy::new(3, Duration::ZERO), || {
            calls += 1;
            async { anyhow::bail!("nope") }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let mut calls = 0;
        let value = retry_fixed(RetryPolicy::new(5, Duration::ZERO), || {
            calls += 1;
            let current = calls;
            async move {
                if current < 2 {
                    anyhow::bail!("flaky");
                }
                Ok(current)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 2);
        assert_eq!(calls, 2);
    }
}
