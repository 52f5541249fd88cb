//! Merge eligibility and the upload-then-merge flow.

use anyhow::Result;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::{
    config::{BotConfig, RetryPolicy},
    error::Lookup,
    github::{Forge, MergeRequest},
    relay::ArtifactRelay,
    types::MergeState,
};

pub const MERGE_STARTED_MESSAGE: &str = "I will attempt to upload artifacts and merge this PR. \
     This may take some time, please have patience.";
pub const MERGE_REFUSED_MESSAGE: &str = "Sorry, this PR cannot be merged at this time.";
pub const MERGE_FAILED_MESSAGE: &str =
    "I received an error uploading the build artifacts or merging the PR!";

/// Result of polling GitHub's mergeability computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mergeability {
    /// Still not computed after the last read.
    Pending,
    /// Mergeable and in the `clean` state.
    Clean,
    /// Computed, but conflicting or blocked.
    Blocked,
}

/// Reads the pull request until GitHub reports a mergeable flag, at most
/// `policy.attempts` times with `policy.delay` between reads.
pub async fn poll_mergeability<F>(forge: &F, pr: u64, policy: RetryPolicy) -> Result<Mergeability>
where
    F: Forge + ?Sized,
{
    for attempt in 1..=policy.attempts.max(1) {
        if attempt > 1 {
            tokio::time::sleep(policy.delay).await;
        }
        let info = forge.pull_request(pr).await?;
        match info.mergeable {
            None => debug!(pr, attempt, "Mergeability not computed yet"),
            Some(_) if info.is_clean() => return Ok(Mergeability::Clean),
            Some(_) => {
                info!(pr, state = ?info.mergeable_state, "PR is not cleanly mergeable");
                return Ok(Mergeability::Blocked);
            }
        }
    }
    Ok(Mergeability::Pending)
}

/// True when at least one approving review comes from an organisation
/// member. Failed membership lookups count as non-members.
pub async fn has_member_approval<F>(forge: &F, pr: u64) -> Result<bool>
where
    F: Forge + ?Sized,
{
    let reviews = forge.reviews(pr).await?;
    let mut approvers: Vec<String> = Vec::new();
    for author in reviews
        .into_iter()
        .filter(|review| review.is_approval())
        .filter_map(|review| review.author)
    {
        if !approvers.contains(&author) {
            approvers.push(author);
        }
    }
    if approvers.is_empty() {
        return Ok(false);
    }

    let lookups = join_all(approvers.iter().map(|user| forge.org_membership(user))).await;
    let approved = lookups
        .into_iter()
        .zip(&approvers)
        .any(|(lookup, user)| match lookup {
            Lookup::Found(()) => true,
            Lookup::NotFound => {
                debug!(pr, user = %user, "Approver is not an organisation member");
                false
            }
            Lookup::Transient(err) => {
                warn!(pr, user = %user, error = %format!("{:#}", err), "Membership check failed");
                false
            }
        });
    Ok(approved)
}

/// Decides whether `pr` may be merged right now.
pub async fn evaluate<F>(forge: &F, pr: u64, policy: RetryPolicy) -> Result<MergeState>
where
    F: Forge + ?Sized,
{
    let state = match poll_mergeability(forge, pr, policy).await? {
        Mergeability::Pending | Mergeability::Blocked => MergeState::NotMergeable,
        Mergeability::Clean => {
            if has_member_approval(forge, pr).await? {
                MergeState::Mergeable
            } else {
                MergeState::NeedsReview
            }
        }
    };
    info!(pr, %state, "Evaluated PR");
    Ok(state)
}

/// Uploads the artifacts of `pr` and squash-merges it.
async fn upload_and_merge<F>(forge: &F, relay: &ArtifactRelay, config: &BotConfig, pr: u64) -> Result<()>
where
    F: Forge + ?Sized,
{
    let sha = relay.upload_artifacts(forge, pr).await?;
    let messages = forge
        .commit_messages(pr, config.tuning.max_commit_messages)
        .await?;
    forge.merge(&MergeRequest::squash(pr, sha, &messages)).await
}

/// Evaluates `pr` and, when it is mergeable, relays its artifacts and merges
/// it.
///
/// Returns the evaluated state, or [`MergeState::Merged`] once the merge was
/// issued. Relay and merge failures are reported on the PR and logged; the
/// state stays [`MergeState::Mergeable`] in that case.
pub async fn merge_pr<F>(
    forge: &F,
    relay: &ArtifactRelay,
    config: &BotConfig,
    pr: u64,
    started_message: Option<&str>,
) -> Result<MergeState>
where
    F: Forge + ?Sized,
{
    let state = evaluate(forge, pr, config.tuning.mergeability).await?;
    if state != MergeState::Mergeable {
        return Ok(state);
    }

    if let Some(message) = started_message {
        forge.post_comment(pr, message).await?;
    }

    match upload_and_merge(forge, relay, config, pr).await {
        Ok(()) => {
            info!(pr, "PR merged");
            Ok(MergeState::Merged)
        }
        Err(err) => {
            error!(pr, error = ?err, "Upload or merge failed");
            forge.post_comment(pr, MERGE_FAILED_MESSAGE).await?;
            Ok(MergeState::Mergeable)
        }
    }
}

/// Merge requested explicitly through a comment.
pub async fn request_merge<F>(
    forge: &F,
    relay: &ArtifactRelay,
    config: &BotConfig,
    pr: u64,
) -> Result<MergeState>
where
    F: Forge + ?Sized,
{
    let state = merge_pr(forge, relay, config, pr, Some(MERGE_STARTED_MESSAGE)).await?;
    if state == MergeState::NotMergeable {
        forge.post_comment(pr, MERGE_REFUSED_MESSAGE).await?;
    }
    Ok(state)
}
