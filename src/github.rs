use anyhow::{Context, Result};
use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::{BotConfig, Credentials},
    error::{BotError, Lookup},
    types::{CheckRun, PullRequestInfo, PullRequestRef, Repo, Review},
};

/// Parameters of the squash merge issued once artifacts are uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeRequest {
    #[serde(skip)]
    pub number: u64,
    pub sha: String,
    pub commit_title: String,
    pub commit_message: String,
    pub merge_method: String,
}

impl MergeRequest {
    pub fn squash(number: u64, sha: impl Into<String>, commit_messages: &[String]) -> Self {
        let listed: String = commit_messages
            .iter()
            .rev()
            .map(|message| format!(" * {}\n", message))
            .collect();
        Self {
            number,
            sha: sha.into(),
            commit_title: format!("[ci skip] Merge PR {}", number),
            commit_message: format!("Merge PR #{}, commits were: \n{}", number, listed),
            merge_method: "squash".to_string(),
        }
    }
}

/// The GitHub operations the bot performs against its repository.
#[async_trait]
pub trait Forge: Send + Sync {
    /// Check runs reported for a commit.
    async fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>>;

    async fn pull_request(&self, number: u64) -> Result<PullRequestInfo>;

    /// One page (1-based) of open pull requests.
    async fn open_pull_requests(&self, page: u32, per_page: u32) -> Result<Vec<PullRequestRef>>;

    async fn reviews(&self, number: u64) -> Result<Vec<Review>>;

    /// Organisation membership of `user`. Only a 204 answer counts as found.
    async fn org_membership(&self, user: &str) -> Lookup<()>;

    async fn labels(&self, number: u64) -> Result<Vec<String>>;

    /// Commit messages of a pull request in listing order, at most `limit`.
    async fn commit_messages(&self, number: u64, limit: usize) -> Result<Vec<String>>;

    /// Posts an issue comment. A rejected post is a [`BotError::CommentRejected`].
    async fn post_comment(&self, number: u64, body: &str) -> Result<()>;

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()>;

    async fn merge(&self, request: &MergeRequest) -> Result<()>;

    /// Merges the base branch into the pull request branch.
    async fn update_branch(&self, number: u64) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct RawHead {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RawPull {
    number: u64,
    head: RawHead,
    #[serde(default)]
    mergeable: Option<bool>,
    #[serde(default)]
    mergeable_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawReview {
    #[serde(default)]
    state: String,
    #[serde(default)]
    user: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawLabel {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawCommitDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct RawCommit {
    commit: RawCommitDetail,
}

#[derive(Debug, Deserialize)]
struct CheckRunList {
    #[serde(default)]
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Serialize)]
struct Pagination {
    per_page: u32,
    page: u32,
}

#[derive(Debug, Serialize)]
struct PullListing {
    state: &'static str,
    per_page: u32,
    page: u32,
}

/// Live [`Forge`] backed by the GitHub REST API.
pub struct GitHub {
    client: Octocrab,
    repo: Repo,
    org: String,
}

/// Creates an authenticated GitHub client from the bot configuration.
pub fn setup_github_client(config: &BotConfig) -> Result<Octocrab> {
    let token = Credentials::require(&config.credentials.github_token, "BOT_TOKEN")?;
    Octocrab::builder()
        .personal_token(token.expose().to_string())
        .base_uri(config.endpoints.github_api.as_str())
        .context("Invalid GitHub API base URL")?
        .add_header(http::header::USER_AGENT, config.user_agent.clone())
        .build()
        .context("Failed to create GitHub client")
}

impl GitHub {
    pub fn new(client: Octocrab, repo: Repo, org: impl Into<String>) -> Self {
        Self {
            client,
            repo,
            org: org.into(),
        }
    }

    pub fn from_config(config: &BotConfig) -> Result<Self> {
        let client = setup_github_client(config)?;
        Ok(Self::new(client, config.repo.clone(), config.org.clone()))
    }

    fn route(&self, tail: &str) -> String {
        format!("/repos/{}/{}/{}", self.repo.owner, self.repo.name, tail)
    }
}

#[async_trait]
impl Forge for GitHub {
    async fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>> {
        let list: CheckRunList = self
            .client
            .get(
                self.route(&format!("commits/{}/check-runs", sha)),
                Some(&Pagination {
                    per_page: 100,
                    page: 1,
                }),
            )
            .await
            .with_context(|| format!("Failed to list check runs for {}", sha))?;
        info!(sha, count = list.check_runs.len(), "Fetched check runs");
        Ok(list.check_runs)
    }

    async fn pull_request(&self, number: u64) -> Result<PullRequestInfo> {
        let pull: RawPull = self
            .client
            .get(self.route(&format!("pulls/{}", number)), None::<&()>)
            .await
            .with_context(|| format!("Failed to fetch PR #{}", number))?;
        Ok(PullRequestInfo {
            number: pull.number,
            head_sha: pull.head.sha,
            mergeable: pull.mergeable,
            mergeable_state: pull.mergeable_state,
        })
    }

    async fn open_pull_requests(&self, page: u32, per_page: u32) -> Result<Vec<PullRequestRef>> {
        let pulls: Vec<RawPull> = self
            .client
            .get(
                self.route("pulls"),
                Some(&PullListing {
                    state: "open",
                    per_page,
                    page,
                }),
            )
            .await
            .with_context(|| format!("Failed to list open PRs (page {})", page))?;
        Ok(pulls
            .into_iter()
            .map(|pull| PullRequestRef {
                number: pull.number,
                head_sha: pull.head.sha,
            })
            .collect())
    }

    async fn reviews(&self, number: u64) -> Result<Vec<Review>> {
        let reviews: Vec<RawReview> = self
            .client
            .get(
                self.route(&format!("pulls/{}/reviews", number)),
                Some(&Pagination {
                    per_page: 100,
                    page: 1,
                }),
            )
            .await
            .with_context(|| format!("Failed to list reviews of PR #{}", number))?;
        Ok(reviews
            .into_iter()
            .map(|review| Review {
                author: review.user.map(|user| user.login),
                state: review.state,
            })
            .collect())
    }

    async fn org_membership(&self, user: &str) -> Lookup<()> {
        match self.client.orgs(&self.org).check_membership(user).await {
            Ok(true) => Lookup::Found(()),
            Ok(false) => Lookup::NotFound,
            Err(err) => Lookup::Transient(anyhow::Error::new(err).context(format!(
                "Failed to check {} membership of {}",
                self.org, user
            ))),
        }
    }

    async fn labels(&self, number: u64) -> Result<Vec<String>> {
        let labels: Vec<RawLabel> = self
            .client
            .get(
                self.route(&format!("issues/{}/labels", number)),
                Some(&Pagination {
                    per_page: 100,
                    page: 1,
                }),
            )
            .await
            .with_context(|| format!("Failed to list labels of #{}", number))?;
        Ok(labels.into_iter().map(|label| label.name).collect())
    }

    async fn commit_messages(&self, number: u64, limit: usize) -> Result<Vec<String>> {
        const PER_PAGE: u32 = 100;
        let mut messages = Vec::new();
        let mut page = 1;

        while messages.len() < limit {
            let commits: Vec<RawCommit> = self
                .client
                .get(
                    self.route(&format!("pulls/{}/commits", number)),
                    Some(&Pagination {
                        per_page: PER_PAGE,
                        page,
                    }),
                )
                .await
                .with_context(|| format!("Failed to list commits of PR #{}", number))?;
            let short_page = commits.len() < PER_PAGE as usize;
            messages.extend(commits.into_iter().map(|c| c.commit.message));
            if short_page {
                break;
            }
            page += 1;
        }

        messages.truncate(limit);
        Ok(messages)
    }

    async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        debug!(issue = number, body, "Sending comment");
        self.client
            .issues(&self.repo.owner, &self.repo.name)
            .create_comment(number, body)
            .await
            .map_err(|err| BotError::CommentRejected {
                issue: number,
                reason: err.to_string(),
            })?;
        info!(issue = number, "Comment posted");
        Ok(())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .post(
                self.route(&format!("issues/{}/labels", number)),
                Some(&serde_json::json!({ "labels": labels })),
            )
            .await
            .with_context(|| format!("Failed to label #{}", number))?;
        Ok(())
    }

    async fn merge(&self, request: &MergeRequest) -> Result<()> {
        info!(pr = request.number, sha = %request.sha, "Putting merge commit");
        let response: serde_json::Value = self
            .client
            .put(
                self.route(&format!("pulls/{}/merge", request.number)),
                Some(request),
            )
            .await
            .with_context(|| format!("Failed to merge PR #{}", request.number))?;
        debug!(pr = request.number, ?response, "Merge response");
        Ok(())
    }

    async fn update_branch(&self, number: u64) -> Result<()> {
        let _: serde_json::Value = self
            .client
            .put(
                self.route(&format!("pulls/{}/update-branch", number)),
                Some(&serde_json::json!({})),
            )
            .await
            .with_context(|| format!("Failed to update branch of PR #{}", number))?;
        Ok(())
    }
}
