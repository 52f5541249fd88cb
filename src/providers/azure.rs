use std::{path::PathBuf, sync::LazyLock};

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ArtifactProvider, BuildRef, list_zip_bundles};
use crate::{
    config::BotConfig,
    transport::is_gone,
    types::{ArtifactRecord, CheckRun, Provider, Repo},
};

#[derive(Debug, Deserialize)]
struct BuildArtifacts {
    #[serde(default)]
    count: u64,
    #[serde(default)]
    value: Vec<BuildArtifact>,
}

#[derive(Debug, Deserialize)]
struct BuildArtifact {
    #[serde(default)]
    name: String,
    resource: ArtifactResource,
}

#[derive(Debug, Deserialize)]
struct ArtifactResource {
    #[serde(rename = "downloadUrl")]
    download_url: Option<String>,
}

/// Azure Pipelines: build artifacts are published as zip archives.
pub struct Azure {
    client: ClientWithMiddleware,
    downloads: ClientWithMiddleware,
    api: String,
    repo: Repo,
    /// Name prefix of the pipeline's test check runs.
    check_prefix: String,
    work_dir: PathBuf,
}

impl Azure {
    pub fn new(
        client: ClientWithMiddleware,
        downloads: ClientWithMiddleware,
        config: &BotConfig,
    ) -> Self {
        Self {
            client,
            downloads,
            api: config.endpoints.azure_api.trim_end_matches('/').to_string(),
            check_prefix: format!("{}.{} (test_", config.repo.owner, config.repo.name),
            repo: config.repo.clone(),
            work_dir: config.work_dir.clone(),
        }
    }

    /// Zip download URLs of a build's artifacts.
    async fn zip_urls(&self, build_id: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/{}/{}/_apis/build/builds/{}/artifacts?api-version=4.1",
            self.api, self.repo.owner, self.repo.name, build_id
        );
        debug!(url, "Contacting Azure");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Azure request failed: {}", url))?;
        if is_gone(response.status()) {
            info!(url, status = %response.status(), "Azure artifacts are gone");
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            anyhow::bail!("HTTP {} from {}", response.status(), url);
        }

        let body = response.text().await?;
        let listing: BuildArtifacts = match serde_json::from_str(&body) {
            Ok(listing) => listing,
            Err(err) => {
                warn!(url, error = %err, "Malformed Azure artifact listing");
                return Ok(Vec::new());
            }
        };
        if listing.count == 0 {
            return Ok(Vec::new());
        }

        Ok(listing
            .value
            .into_iter()
            .filter_map(|artifact| {
                debug!(name = %artifact.name, "Azure artifact");
                artifact.resource.download_url
            })
            .collect())
    }
}

pub(crate) fn parse_build_id(url: &str) -> Option<String> {
    static BUILD_ID: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"buildId=(\d+)").expect("build id pattern is valid"));
    BUILD_ID.captures(url).map(|c| c[1].to_string())
}

#[async_trait]
impl ArtifactProvider for Azure {
    fn provider(&self) -> Provider {
        Provider::Azure
    }

    fn app_slugs(&self) -> &[&'static str] {
        &["azure-pipelines"]
    }

    fn build_ref(&self, run: &CheckRun) -> Option<BuildRef> {
        if !run.name.starts_with(&self.check_prefix) {
            return None;
        }
        run.details_url
            .as_deref()
            .and_then(parse_build_id)
            .map(BuildRef::Single)
    }

    async fn list_artifacts(&self, build: &BuildRef) -> Result<Vec<ArtifactRecord>> {
        let BuildRef::Single(build_id) = build else {
            return Ok(Vec::new());
        };
        let zip_urls = self.zip_urls(build_id).await?;
        Ok(list_zip_bundles(&self.downloads, &zip_urls, None, &self.work_dir).await)
    }
}
