//! Bot configuration.
//!
//! Everything the bot needs from its environment is read once into
//! [`BotConfig`] and handed to each component. Nothing below this module
//! looks at process environment variables.

use std::{fmt, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::{error::BotError, types::Repo};

pub const DEFAULT_REPOSITORY: &str = "bioconda/bioconda-recipes";
pub const DEFAULT_USER_AGENT: &str = "BiocondaCommentResponder";
pub const DEFAULT_GITTER_ROOM: &str = "57f3b80cd73408ce4f2bba26";

/// A credential whose value never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Credentials, all optional at load time.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub github_token: Option<Secret>,
    /// `user:password` handed to the image copy tool.
    pub quay_login: Option<Secret>,
    pub quay_oauth_token: Option<Secret>,
    pub anaconda_token: Option<Secret>,
    pub gitter_token: Option<Secret>,
}

impl Credentials {
    pub fn require<'a>(
        field: &'a Option<Secret>,
        name: &'static str,
    ) -> std::result::Result<&'a Secret, BotError> {
        field.as_ref().ok_or(BotError::MissingCredential(name))
    }
}

/// API endpoints. Overridable so the bot can be pointed at mirrors or mocks.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub github_api: String,
    pub github_web: String,
    pub circleci_api: String,
    pub azure_api: String,
    pub quay_api: String,
    pub gitter_api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            github_api: "https://api.github.com".to_string(),
            github_web: "https://github.com".to_string(),
            circleci_api: "https://circleci.com/api".to_string(),
            azure_api: "https://dev.azure.com".to_string(),
            quay_api: "https://quay.io/api/v1".to_string(),
            gitter_api: "https://api.gitter.im/v1".to_string(),
        }
    }
}

/// Fixed-delay retry bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

/// Settings for the merge and relay flows.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// Reads of the mergeable flag before giving up on it.
    pub mergeability: RetryPolicy,
    /// Invocations of the image copy tool per container.
    pub image_push: RetryPolicy,
    pub pr_page_size: u32,
    pub pr_max_pages: u32,
    pub download_timeout: Duration,
    pub progress_interval_bytes: u64,
    /// Upper bound on commit messages carried into the squash commit.
    pub max_commit_messages: usize,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            mergeability: RetryPolicy::new(2, Duration::from_secs(3)),
            image_push: RetryPolicy::new(5, Duration::from_secs(5)),
            pr_page_size: 100,
            pr_max_pages: 20,
            download_timeout: Duration::from_secs(30 * 60),
            progress_interval_bytes: 50 * 1024 * 1024,
            max_commit_messages: 250,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub repo: Repo,
    /// Organisation whose members may approve and whose team mentions are
    /// reposted.
    pub org: String,
    /// Host of the container registry images are pushed to.
    pub container_registry: String,
    /// Namespace on the container registry images are pushed to.
    pub container_namespace: String,
    pub user_agent: String,
    /// Lower-cased comment prefixes that address the bot.
    pub mention_prefixes: Vec<String>,
    pub automerge_label: String,
    pub review_label: String,
    pub gitter_room: String,
    pub endpoints: Endpoints,
    pub credentials: Credentials,
    pub tuning: Tuning,
    /// Directory downloads are staged in.
    pub work_dir: PathBuf,
    pub skopeo_cert_dir: Option<PathBuf>,
}

impl BotConfig {
    /// Configuration with defaults for `repo` and no credentials.
    pub fn new(repo: Repo) -> Self {
        let org = repo.owner.clone();
        Self {
            mention_prefixes: vec![format!("@{org}-bot"), format!("@{org}bot")],
            container_registry: "quay.io".to_string(),
            container_namespace: "biocontainers".to_string(),
            org,
            repo,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            automerge_label: "automerge".to_string(),
            review_label: "please review & merge".to_string(),
            gitter_room: DEFAULT_GITTER_ROOM.to_string(),
            endpoints: Endpoints::default(),
            credentials: Credentials::default(),
            tuning: Tuning::default(),
            work_dir: std::env::temp_dir(),
            skopeo_cert_dir: None,
        }
    }

    /// Reads the configuration from process environment variables.
    pub fn from_env() -> Result<Self> {
        let repo_str =
            std::env::var("BOT_REPOSITORY").unwrap_or_else(|_| DEFAULT_REPOSITORY.to_string());
        let repo = Repo::parse(&repo_str)
            .map_err(|e| anyhow::anyhow!(e))
            .with_context(|| format!("Invalid BOT_REPOSITORY '{}'", repo_str))?;

        let mut config = Self::new(repo);
        let secret = |name: &str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(Secret::new)
        };
        config.credentials = Credentials {
            github_token: secret("BOT_TOKEN").or_else(|| secret("GITHUB_TOKEN")),
            quay_login: secret("QUAY_LOGIN"),
            quay_oauth_token: secret("QUAY_OAUTH_TOKEN"),
            anaconda_token: secret("ANACONDA_TOKEN"),
            gitter_token: secret("GITTER_TOKEN"),
        };

        if let Ok(dir) = std::env::var("BOT_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        config.skopeo_cert_dir = std::env::var("SKOPEO_CERT_DIR").ok().map(PathBuf::from);
        if let Ok(api) = std::env::var("GITHUB_API_URL") {
            config.endpoints.github_api = api.trim_end_matches('/').to_string();
        }

        Ok(config)
    }

    /// Whether a lower-cased comment body addresses the bot.
    pub fn is_addressed(&self, comment: &str) -> bool {
        self.mention_prefixes
            .iter()
            .any(|prefix| comment.starts_with(prefix.as_str()))
    }

    /// Team mention prefix (`@org/`) that triggers reposting.
    pub fn team_mention(&self) -> String {
        format!("@{}/", self.org.to_lowercase())
    }

    pub fn pull_request_url(&self, number: u64) -> String {
        format!("{}/{}/pull/{}", self.endpoints.github_web, self.repo, number)
    }
}
