use std::{path::PathBuf, sync::LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ArtifactProvider, BuildRef, list_zip_bundles};
use crate::{
    config::{BotConfig, Secret},
    transport::is_gone,
    types::{ArtifactRecord, CheckRun, Provider, Repo},
};

#[derive(Debug, Deserialize)]
struct RunArtifacts {
    #[serde(default)]
    total_count: u64,
    #[serde(default)]
    artifacts: Vec<RunArtifact>,
}

#[derive(Debug, Deserialize)]
struct RunArtifact {
    #[serde(default)]
    name: String,
    archive_download_url: Option<String>,
    #[serde(default)]
    expired: bool,
}

/// GitHub Actions: workflow run artifacts, downloaded as zip archives with
/// the bot token.
pub struct GithubActions {
    client: ClientWithMiddleware,
    downloads: ClientWithMiddleware,
    api: String,
    repo: Repo,
    token: Option<Secret>,
    work_dir: PathBuf,
}

impl GithubActions {
    pub fn new(
        client: ClientWithMiddleware,
        downloads: ClientWithMiddleware,
        config: &BotConfig,
    ) -> Self {
        Self {
            client,
            downloads,
            api: config.endpoints.github_api.trim_end_matches('/').to_string(),
            repo: config.repo.clone(),
            token: config.credentials.github_token.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    async fn zip_urls(&self, run_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/repos/{}/{}/actions/runs/{}/artifacts",
            self.api, self.repo.owner, self.repo.name, run_id
        );
        debug!(url, "Contacting GitHub Actions");
        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GitHub Actions request failed: {}", url))?;
        if is_gone(response.status()) {
            info!(url, status = %response.status(), "Workflow run artifacts are gone");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            anyhow::bail!("HTTP {} from {}", response.status(), url);
        }

        let body = response.text().await?;
        let listing: RunArtifacts = match serde_json::from_str(&body) {
            Ok(listing) => listing,
            Err(err) => {
                warn!(url, error = %err, "Malformed workflow run artifact listing");
                return Ok(Vec::new());
            }
        };
        if listing.total_count == 0 {
            return Ok(Vec::new());
        }

        Ok(listing
            .artifacts
            .into_iter()
            .filter(|artifact| !artifact.expired)
            .filter_map(|artifact| {
                debug!(name = %artifact.name, "Workflow run artifact");
                artifact.archive_download_url
            })
            .collect())
    }
}

pub(crate) fn parse_run_id(url: &str) -> Option<String> {
    static RUN_ID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"runs/(\d+)/").expect("run id pattern is valid"));
    RUN_ID.captures(url).map(|c| c[1].to_string())
}

#[async_trait]
impl ArtifactProvider for GithubActions {
    fn provider(&self) -> Provider {
        Provider::GithubActions
    }

    fn app_slugs(&self) -> &[&'static str] {
        &["github-actions"]
    }

    fn build_ref(&self, run: &CheckRun) -> Option<BuildRef> {
        run.details_url
            .as_deref()
            .and_then(parse_run_id)
            .map(BuildRef::Single)
    }

    async fn list_artifacts(&self, build: &BuildRef) -> Result<Vec<ArtifactRecord>> {
        let BuildRef::Single(run_id) = build else {
            return Ok(Vec::new());
        };
        let zip_urls = self.zip_urls(run_id).await?;
        Ok(list_zip_bundles(&self.downloads, &zip_urls, self.token.as_ref(), &self.work_dir).await)
    }
}
