//! Entry flows: routing a trigger payload to automerge, comment responses,
//! or an explicit merge.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    comment::post_artifact_comment,
    config::BotConfig,
    error::Lookup,
    events::{JobContext, Trigger},
    github::{Forge, GitHub},
    merge::request_merge,
    notify::{Gitter, Notifier},
    providers::ProviderRegistry,
    relay::ArtifactRelay,
    transport,
    types::MergeState,
};

pub const HELLO_REPLY: &str = "Yes?";
pub const UPDATE_FAILED_MESSAGE: &str =
    "Sorry, I was unable to update this PR with the latest changes from the base branch.";

/// A request parsed from a pull request comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Merge the base branch into the PR branch.
    Update,
    Hello,
    FetchArtifacts,
    Merge,
    /// Mark the PR ready for review and announce it.
    AddLabel,
    /// Quote a team mention by a non-member so the team gets pinged.
    Repost,
}

impl Command {
    /// Parses a comment body. Only comments that start with a bot mention
    /// carry commands; the first matching phrase wins.
    pub fn parse(config: &BotConfig, body: &str) -> Option<Self> {
        let comment = body.to_lowercase();
        if config.is_addressed(&comment) {
            if comment.contains("please update") {
                Some(Command::Update)
            } else if comment.contains(" hello") {
                Some(Command::Hello)
            } else if comment.contains(" please fetch artifacts")
                || comment.contains(" please fetch artefacts")
            {
                Some(Command::FetchArtifacts)
            } else if comment.contains(" please merge") {
                Some(Command::Merge)
            } else if comment.contains(" please add label") {
                Some(Command::AddLabel)
            } else {
                None
            }
        } else if comment.contains(&config.team_mention()) {
            Some(Command::Repost)
        } else {
            None
        }
    }
}

pub struct Bot {
    config: Arc<BotConfig>,
    forge: Arc<dyn Forge>,
    providers: ProviderRegistry,
    relay: ArtifactRelay,
    notifier: Arc<dyn Notifier>,
}

impl Bot {
    pub fn new(
        config: Arc<BotConfig>,
        forge: Arc<dyn Forge>,
        providers: ProviderRegistry,
        relay: ArtifactRelay,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            forge,
            providers,
            relay,
            notifier,
        }
    }

    /// Bot talking to the live services named in `config`.
    pub fn standard(config: Arc<BotConfig>) -> Result<Self> {
        let forge = Arc::new(GitHub::from_config(&config)?);
        let providers = ProviderRegistry::standard(&config)?;
        let relay = ArtifactRelay::standard(config.clone(), providers.clone())?;
        let notifier = Arc::new(Gitter::new(
            transport::api_client(&config.user_agent)?,
            &config,
        ));
        Ok(Self::new(config, forge, providers, relay, notifier))
    }

    /// Merges the labelled PR whose build just succeeded or was approved.
    pub async fn automerge(&self, context: &JobContext) -> Result<Option<u64>> {
        let sha = match context.trigger() {
            Trigger::StatusSuccess { sha }
            | Trigger::CheckSuiteSuccess { sha }
            | Trigger::WorkflowRunSuccess { sha }
            | Trigger::ReviewApproved { sha } => sha,
            other => {
                info!(event = %context.event_name, ?other, "Nothing to automerge");
                return Ok(None);
            }
        };
        self.merge_automerge_passed(&sha).await
    }

    /// Posts artifact comments after successful builds and answers bot
    /// commands.
    pub async fn comment(&self, context: &JobContext) -> Result<()> {
        let trigger = context.trigger();
        if let Some(sha) = trigger.success_sha() {
            for pr in self.prs_for_sha(sha).await? {
                self.artifact_checker(pr).await?;
            }
            return Ok(());
        }
        match trigger {
            Trigger::IssueComment {
                issue,
                body,
                author,
            } => self.respond(issue, &body, author.as_deref()).await,
            other => {
                info!(event = %context.event_name, ?other, "Nothing to respond to");
                Ok(())
            }
        }
    }

    /// Handles explicit `please merge` comments.
    pub async fn merge(&self, context: &JobContext) -> Result<Option<MergeState>> {
        let Trigger::IssueComment { issue, body, .. } = context.trigger() else {
            info!(event = %context.event_name, "Not a comment, nothing to merge");
            return Ok(None);
        };
        if Command::parse(&self.config, &body) != Some(Command::Merge) {
            debug!(issue, "Comment does not request a merge");
            return Ok(None);
        }
        let state = request_merge(&*self.forge, &self.relay, &self.config, issue).await?;
        Ok(Some(state))
    }

    /// Runs a comment command on `issue`.
    pub async fn respond(&self, issue: u64, body: &str, author: Option<&str>) -> Result<()> {
        let Some(command) = Command::parse(&self.config, body) else {
            debug!(issue, "Comment carries no command");
            return Ok(());
        };
        info!(issue, ?command, "Handling comment command");

        match command {
            Command::Update => self.update_from_upstream(issue).await,
            Command::Hello => self.forge.post_comment(issue, HELLO_REPLY).await,
            Command::FetchArtifacts => self.artifact_checker(issue).await,
            Command::Merge => {
                request_merge(&*self.forge, &self.relay, &self.config, issue).await?;
                Ok(())
            }
            Command::AddLabel => {
                self.forge
                    .add_labels(issue, std::slice::from_ref(&self.config.review_label))
                    .await?;
                self.notify_ready(issue).await;
                Ok(())
            }
            Command::Repost => match author {
                Some(author) => self.comment_reposter(author, issue, body).await,
                None => {
                    warn!(issue, "Team mention without a known author");
                    Ok(())
                }
            },
        }
    }

    /// Open pull requests whose head is `sha`, in listing order.
    pub async fn prs_for_sha(&self, sha: &str) -> Result<Vec<u64>> {
        let per_page = self.config.tuning.pr_page_size;
        let mut prs = Vec::new();

        for page in 1..=self.config.tuning.pr_max_pages {
            let listed = self.forge.open_pull_requests(page, per_page).await?;
            let short_page = listed.len() < per_page as usize;
            prs.extend(
                listed
                    .into_iter()
                    .filter(|pr| pr.head_sha == sha)
                    .map(|pr| pr.number),
            );
            if short_page {
                break;
            }
        }

        if prs.is_empty() {
            info!(sha, "No open PRs found for SHA");
        }
        Ok(prs)
    }

    /// True when every check run of `sha` concluded successfully.
    pub async fn all_checks_passed(&self, sha: &str) -> Result<bool> {
        let check_runs = self.forge.check_runs(sha).await?;
        let total = check_runs.len();
        let mut passed = true;
        for (i, run) in check_runs.iter().enumerate() {
            if !run.is_success() {
                passed = false;
                info!(
                    sha,
                    "check_run {} / {}: {} is {} ({})",
                    i + 1,
                    total,
                    run.name,
                    run.status,
                    run.conclusion.as_deref().unwrap_or("none")
                );
            }
        }
        if !passed {
            info!(sha, "Some check runs are not successful yet");
        }
        Ok(passed)
    }

    /// Tries the automerge-labelled PRs of `sha` in order and stops at the
    /// first one that gets merged.
    pub async fn merge_automerge_passed(&self, sha: &str) -> Result<Option<u64>> {
        if !self.all_checks_passed(sha).await? {
            return Ok(None);
        }
        for pr in self.prs_for_sha(sha).await? {
            let state = self.merge_if_labeled(pr).await?;
            info!(pr, %state, "Merge state");
            if state == MergeState::Merged {
                return Ok(Some(pr));
            }
        }
        Ok(None)
    }

    async fn merge_if_labeled(&self, pr: u64) -> Result<MergeState> {
        let labels = self.forge.labels(pr).await?;
        if !labels.contains(&self.config.automerge_label) {
            debug!(pr, "PR is not labelled for automerge");
            return Ok(MergeState::Unknown);
        }
        request_merge(&*self.forge, &self.relay, &self.config, pr).await
    }

    async fn artifact_checker(&self, pr: u64) -> Result<()> {
        let info = self.forge.pull_request(pr).await?;
        post_artifact_comment(&*self.forge, &self.providers, pr, &info.head_sha).await
    }

    async fn update_from_upstream(&self, pr: u64) -> Result<()> {
        match self.forge.update_branch(pr).await {
            Ok(()) => {
                info!(pr, "Branch updated");
                Ok(())
            }
            Err(err) => {
                warn!(pr, error = %format!("{:#}", err), "Branch update failed");
                self.forge.post_comment(pr, UPDATE_FAILED_MESSAGE).await
            }
        }
    }

    async fn comment_reposter(&self, user: &str, pr: u64, message: &str) -> Result<()> {
        match self.forge.org_membership(user).await {
            Lookup::Found(()) => {
                info!(user, "Not reposting for member");
                return Ok(());
            }
            Lookup::NotFound => {}
            Lookup::Transient(err) => {
                warn!(user, error = %format!("{:#}", err), "Membership check failed, reposting anyway");
            }
        }
        info!(user, pr, "Reposting");
        let repost = format!(
            "Reposting for @{user} to enable pings (courtesy of the BiocondaBot):\n\n> {message}"
        );
        self.forge.post_comment(pr, &repost).await
    }

    async fn notify_ready(&self, pr: u64) {
        let message = format!("PR ready for review: {}", self.config.pull_request_url(pr));
        match self.notifier.notify(&message).await {
            Lookup::Found(()) => info!(pr, "Announced PR"),
            Lookup::NotFound => warn!(pr, "Chat room not found"),
            Lookup::Transient(err) => warn!(pr, error = %format!("{:#}", err), "Posting to chat failed"),
        }
    }
}
