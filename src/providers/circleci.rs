use std::sync::LazyLock;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ArtifactProvider, BuildRef};
use crate::{
    config::BotConfig,
    transport::is_gone,
    types::{ArtifactRecord, CheckRun, Provider, Repo, is_artifact_path},
};

/// Check runs of the legacy integration are recognised by this title.
const LEGACY_WORKFLOW_TITLE: &str = "Workflow: bioconda-test";

/// Only jobs that build packages publish artifacts.
const BUILD_JOB_PREFIX: &str = "build_and_test-";

#[derive(Debug, Deserialize)]
struct WorkflowJobs {
    #[serde(default)]
    items: Vec<WorkflowJob>,
}

#[derive(Debug, Deserialize)]
struct WorkflowJob {
    #[serde(default)]
    name: String,
    #[serde(default)]
    job_number: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct JobArtifacts {
    #[serde(default)]
    items: Vec<JobArtifact>,
}

#[derive(Debug, Deserialize)]
struct JobArtifact {
    #[serde(default)]
    path: String,
    url: String,
}

#[derive(Debug, Deserialize)]
struct LegacyArtifact {
    url: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default, rename = "pretty-path")]
    pretty_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExternalId {
    #[serde(rename = "workflow-id")]
    workflow_id: Option<String>,
}

/// CircleCI: v2 workflow/job APIs, with the v1.1 build API for check runs
/// that only carry build numbers in their summary.
pub struct CircleCi {
    client: ClientWithMiddleware,
    api: String,
    repo: Repo,
    summary_pattern: Regex,
}

impl CircleCi {
    pub fn new(client: ClientWithMiddleware, config: &BotConfig) -> Self {
        let summary_pattern = Regex::new(&format!(
            r"gh/{}/{}/(\d+)",
            regex::escape(&config.repo.owner),
            regex::escape(&config.repo.name)
        ))
        .expect("escaped repository pattern is valid");
        Self {
            client,
            api: config.endpoints.circleci_api.trim_end_matches('/').to_string(),
            repo: config.repo.clone(),
            summary_pattern,
        }
    }

    /// Build numbers embedded in a legacy check-run summary.
    pub fn parse_summary(&self, summary: &str) -> Vec<String> {
        self.summary_pattern
            .captures_iter(summary)
            .map(|c| c[1].to_string())
            .collect()
    }

    async fn get_text(&self, url: &str) -> Result<Option<String>> {
        debug!(url, "Contacting CircleCI");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("CircleCI request failed: {}", url))?;
        if is_gone(response.status()) {
            info!(url, status = %response.status(), "CircleCI artifacts are gone");
            return Ok(None);
        }
        if !response.status().is_success() {
            anyhow::bail!("HTTP {} from {}", response.status(), url);
        }
        Ok(Some(response.text().await?))
    }

    async fn workflow_artifacts(&self, workflow_id: &str) -> Result<Vec<ArtifactRecord>> {
        let url = format!("{}/v2/workflow/{}/job", self.api, workflow_id);
        let Some(body) = self.get_text(&url).await? else {
            return Ok(Vec::new());
        };
        let jobs: WorkflowJobs = match serde_json::from_str(&body) {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(url, error = %err, "Malformed CircleCI workflow listing");
                return Ok(Vec::new());
            }
        };

        let mut artifacts = Vec::new();
        for job in jobs.items {
            let Some(job_number) = job.job_number else {
                continue;
            };
            if !job.name.starts_with(BUILD_JOB_PREFIX) {
                continue;
            }
            let url = format!(
                "{}/v2/project/gh/{}/{}/{}/artifacts",
                self.api, self.repo.owner, self.repo.name, job_number
            );
            let Some(body) = self.get_text(&url).await? else {
                continue;
            };
            match serde_json::from_str::<JobArtifacts>(&body) {
                Ok(listing) => artifacts.extend(
                    listing
                        .items
                        .into_iter()
                        .filter(|a| is_artifact_path(&a.url))
                        .map(|a| ArtifactRecord::new(a.url, a.path)),
                ),
                Err(err) => warn!(url, error = %err, "Malformed CircleCI job artifacts"),
            }
        }
        Ok(artifacts)
    }

    async fn legacy_artifacts(&self, build: &str) -> Result<Vec<ArtifactRecord>> {
        let url = format!(
            "{}/v1.1/project/github/{}/{}/{}/artifacts",
            self.api, self.repo.owner, self.repo.name, build
        );
        let Some(body) = self.get_text(&url).await? else {
            return Ok(Vec::new());
        };
        Ok(parse_legacy_listing(&body)
            .into_iter()
            .filter(|a| is_artifact_path(&a.url))
            .map(|a| {
                let path = a.path.or(a.pretty_path).unwrap_or_else(|| a.url.clone());
                ArtifactRecord::new(a.url, path)
            })
            .collect())
    }
}

/// Parses a v1.1 artifact listing, which may come back as JSON or as an
/// EDN-style rendering of the same data.
fn parse_legacy_listing(body: &str) -> Vec<LegacyArtifact> {
    if body.trim().len() < 3 {
        return Vec::new();
    }
    if let Ok(listing) = serde_json::from_str::<Vec<LegacyArtifact>>(body) {
        return listing;
    }

    static KEYWORD: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r":([a-z][a-z-]*)\s").expect("keyword pattern is valid"));
    static OBJECT_GAP: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\}\s+\{").expect("gap pattern is valid"));
    static FIELD_GAP: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"("|\d)\s*,?\s+(")"#).expect("field gap pattern is valid")
    });

    let normalised = body.trim().replace('(', "[").replace(')', "]");
    let normalised = KEYWORD.replace_all(&normalised, "\"$1\": ");
    let normalised = OBJECT_GAP.replace_all(&normalised, "}, {");
    let normalised = FIELD_GAP.replace_all(&normalised, "$1, $2");

    match serde_json::from_str::<Vec<LegacyArtifact>>(&normalised) {
        Ok(listing) => listing,
        Err(err) => {
            warn!(error = %err, "Unparseable CircleCI v1.1 artifact listing");
            Vec::new()
        }
    }
}

#[async_trait]
impl ArtifactProvider for CircleCi {
    fn provider(&self) -> Provider {
        Provider::CircleCi
    }

    fn app_slugs(&self) -> &[&'static str] {
        &["circleci-checks", "circleci"]
    }

    fn build_ref(&self, run: &CheckRun) -> Option<BuildRef> {
        if let Some(workflow_id) = run
            .external_id
            .as_deref()
            .and_then(|raw| serde_json::from_str::<ExternalId>(raw).ok())
            .and_then(|id| id.workflow_id)
        {
            return Some(BuildRef::Single(workflow_id));
        }

        if run.output.title.as_deref() == Some(LEGACY_WORKFLOW_TITLE) {
            let builds = self.parse_summary(run.output.summary.as_deref().unwrap_or_default());
            if !builds.is_empty() {
                return Some(BuildRef::Jobs(builds));
            }
        }
        None
    }

    async fn list_artifacts(&self, build: &BuildRef) -> Result<Vec<ArtifactRecord>> {
        match build {
            BuildRef::Single(workflow_id) => self.workflow_artifacts(workflow_id).await,
            BuildRef::Jobs(builds) => {
                let mut artifacts = Vec::new();
                for build in builds {
                    match self.legacy_artifacts(build).await {
                        Ok(listed) => artifacts.extend(listed),
                        Err(err) => {
                            warn!(build = %build, error = %format!("{:#}", err), "Skipping CircleCI build")
                        }
                    }
                }
                Ok(artifacts)
            }
        }
    }
}
