//! Artifact discovery, one adapter per CI provider.
//!
//! Every adapter turns a provider's own listing format into
//! [`ArtifactRecord`]s. Adapters are looked up by the application slug the
//! provider reports its check runs under.

mod azure;
mod circleci;
mod github_actions;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use tracing::{debug, warn};

pub use azure::Azure;
pub use circleci::CircleCi;
pub use github_actions::GithubActions;

use crate::{
    config::{BotConfig, Secret},
    transport,
    types::{ArtifactRecord, CheckRun, Provider, is_artifact_path},
};

/// Build identifier extracted from a check run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildRef {
    /// A single build, run, or workflow identifier.
    Single(String),
    /// Job numbers scraped from a free-text summary.
    Jobs(Vec<String>),
}

#[async_trait]
pub trait ArtifactProvider: Send + Sync {
    fn provider(&self) -> Provider;

    /// Check-run application slugs this adapter handles.
    fn app_slugs(&self) -> &[&'static str];

    /// Build reference carried by `run`, or `None` when the run is not one
    /// this adapter can list artifacts for.
    fn build_ref(&self, run: &CheckRun) -> Option<BuildRef>;

    /// Lists the artifacts of a build. Expired or malformed listings yield an
    /// empty list; transport failures are errors.
    async fn list_artifacts(&self, build: &BuildRef) -> Result<Vec<ArtifactRecord>>;
}

/// Adapters keyed by check-run application slug.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    by_slug: HashMap<&'static str, Arc<dyn ArtifactProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the CircleCI, Azure and GitHub Actions adapters.
    pub fn standard(config: &BotConfig) -> Result<Self> {
        let api = transport::api_client(&config.user_agent)?;
        let downloads =
            transport::download_client(&config.user_agent, config.tuning.download_timeout)?;

        let mut registry = Self::new();
        registry.register(Arc::new(CircleCi::new(api.clone(), config)));
        registry.register(Arc::new(Azure::new(api.clone(), downloads.clone(), config)));
        registry.register(Arc::new(GithubActions::new(api, downloads, config)));
        Ok(registry)
    }

    pub fn register(&mut self, adapter: Arc<dyn ArtifactProvider>) {
        for slug in adapter.app_slugs() {
            self.by_slug.insert(*slug, adapter.clone());
        }
    }

    pub fn lookup(&self, slug: &str) -> Option<&Arc<dyn ArtifactProvider>> {
        self.by_slug.get(slug)
    }
}

/// Downloads each zip archive and records the members that look like
/// artifacts as `(zip_url, member_path)`.
pub(crate) async fn list_zip_bundles(
    client: &ClientWithMiddleware,
    zip_urls: &[String],
    token: Option<&Secret>,
    work_dir: &std::path::Path,
) -> Vec<ArtifactRecord> {
    let mut artifacts = Vec::new();

    for zip_url in zip_urls {
        debug!(zip_url, "Listing zip bundle");
        let listed: Result<Vec<String>> = async {
            let staging = tempfile::Builder::new()
                .prefix("bundle-")
                .suffix(".zip")
                .tempfile_in(work_dir)?;
            transport::download_to_file(client, zip_url, token, staging.path(), 0).await?;
            transport::zip_entries(staging.path()).await
        }
        .await;

        match listed {
            Ok(names) => artifacts.extend(
                names
                    .into_iter()
                    .filter(|name| is_artifact_path(name))
                    .map(|name| ArtifactRecord::new(zip_url.clone(), name)),
            ),
            Err(err) => warn!(zip_url, error = %format!("{:#}", err), "Skipping unreadable zip bundle"),
        }
    }

    artifacts
}
