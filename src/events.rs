//! The trigger payload a workflow hands to the bot, and what it asks for.

use anyhow::Result;
use serde::Deserialize;

use crate::error::BotError;

#[derive(Debug, Clone, Default, Deserialize)]
struct CommitRef {
    sha: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Branch {
    commit: CommitRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct PullPayload {
    head: CommitRef,
}

/// The `check_suite` or `workflow_run` object of a completion event.
#[derive(Debug, Clone, Default, Deserialize)]
struct Completion {
    #[serde(default)]
    conclusion: Option<String>,
    #[serde(default)]
    head_sha: Option<String>,
    #[serde(default)]
    pull_requests: Vec<PullPayload>,
}

impl Completion {
    fn successful_sha(&self) -> Option<String> {
        if self.conclusion.as_deref() != Some("success") {
            return None;
        }
        self.head_sha
            .clone()
            .filter(|sha| !sha.is_empty())
            .or_else(|| self.pull_requests.first().map(|pr| pr.head.sha.clone()))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Issue {
    number: u64,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct User {
    login: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Comment {
    #[serde(default)]
    body: String,
    #[serde(default)]
    user: Option<User>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReviewPayload {
    #[serde(default)]
    state: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct EventPayload {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    branches: Vec<Branch>,
    #[serde(default)]
    check_suite: Option<Completion>,
    #[serde(default)]
    workflow_run: Option<Completion>,
    #[serde(default)]
    issue: Option<Issue>,
    #[serde(default)]
    comment: Option<Comment>,
    #[serde(default)]
    review: Option<ReviewPayload>,
    #[serde(default)]
    pull_request: Option<PullPayload>,
}

/// The workflow's `github` context serialised as JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct JobContext {
    pub event_name: String,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    event: EventPayload,
}

/// What a trigger payload asks the bot to look at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    StatusSuccess { sha: String },
    CheckSuiteSuccess { sha: String },
    WorkflowRunSuccess { sha: String },
    /// An approving review was submitted on the PR whose head is `sha`.
    ReviewApproved { sha: String },
    /// A comment on a pull request.
    IssueComment {
        issue: u64,
        body: String,
        author: Option<String>,
    },
    /// Nothing to act on; carries the reason.
    Ignored(String),
}

impl Trigger {
    /// The commit a successful build event refers to.
    pub fn success_sha(&self) -> Option<&str> {
        match self {
            Trigger::StatusSuccess { sha }
            | Trigger::CheckSuiteSuccess { sha }
            | Trigger::WorkflowRunSuccess { sha } => Some(sha),
            Trigger::ReviewApproved { .. } | Trigger::IssueComment { .. } | Trigger::Ignored(_) => {
                None
            }
        }
    }
}

impl JobContext {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|err| BotError::InvalidEvent(format!("malformed job context: {}", err)).into())
    }

    /// Classifies the event. Exactly one trigger results from any payload.
    pub fn trigger(&self) -> Trigger {
        let event = &self.event;
        match self.event_name.as_str() {
            "status" => match event.state.as_deref() {
                // With several branches only the first one is considered.
                Some("success") => match event.branches.first() {
                    Some(branch) => Trigger::StatusSuccess {
                        sha: branch.commit.sha.clone(),
                    },
                    None => Trigger::Ignored("status event without branches".to_string()),
                },
                other => Trigger::Ignored(format!("status is {:?}", other)),
            },
            "check_suite" => match event.check_suite.as_ref().and_then(Completion::successful_sha) {
                Some(sha) => Trigger::CheckSuiteSuccess { sha },
                None => Trigger::Ignored("check suite did not succeed".to_string()),
            },
            "workflow_run" => match event.workflow_run.as_ref().and_then(Completion::successful_sha) {
                Some(sha) => Trigger::WorkflowRunSuccess { sha },
                None => Trigger::Ignored("workflow run did not succeed".to_string()),
            },
            "pull_request_review" => {
                let approved = event
                    .review
                    .as_ref()
                    .is_some_and(|review| review.state.eq_ignore_ascii_case("approved"));
                match (approved, &event.pull_request) {
                    (true, Some(pull)) => Trigger::ReviewApproved {
                        sha: pull.head.sha.clone(),
                    },
                    _ => Trigger::Ignored("review is not an approval".to_string()),
                }
            }
            name => match (&event.issue, &event.comment) {
                (Some(issue), Some(comment)) if issue.pull_request.is_some() => {
                    Trigger::IssueComment {
                        issue: issue.number,
                        body: comment.body.clone(),
                        author: self
                            .actor
                            .clone()
                            .or_else(|| comment.user.as_ref().map(|user| user.login.clone())),
                    }
                }
                (Some(_), Some(_)) => Trigger::Ignored("comment is not on a pull request".to_string()),
                _ => Trigger::Ignored(format!("unhandled event {}", name)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn context(value: serde_json::Value) -> JobContext {
        JobContext::from_json(&value.to_string()).unwrap()
    }

    #[test]
    fn status_success_takes_first_branch() {
        let ctx = context(json!({
            "event_name": "status",
            "event": {
                "state": "success",
                "branches": [
                    { "name": "a", "commit": { "sha": "abc123" } },
                    { "name": "b", "commit": { "sha": "def456" } }
                ]
            }
        }));
        assert_eq!(
            ctx.trigger(),
            Trigger::StatusSuccess {
                sha: "abc123".to_string()
            }
        );
    }

    #[test]
    fn pending_status_is_ignored() {
        let ctx = context(json!({
            "event_name": "status",
            "event": { "state": "pending", "branches": [{ "commit": { "sha": "abc" } }] }
        }));
        assert!(matches!(ctx.trigger(), Trigger::Ignored(_)));
        assert_eq!(ctx.trigger().success_sha(), None);
    }

    #[test]
    fn check_suite_falls_back_to_pull_request_head() {
        let ctx = context(json!({
            "event_name": "check_suite",
            "event": {
                "check_suite": {
                    "conclusion": "success",
                    "head_sha": null,
                    "pull_requests": [{ "number": 3, "head": { "sha": "fromthepr" } }]
                }
            }
        }));
        assert_eq!(ctx.trigger().success_sha(), Some("fromthepr"));
    }

    #[test]
    fn failed_workflow_run_is_ignored() {
        let ctx = context(json!({
            "event_name": "workflow_run",
            "event": { "workflow_run": { "conclusion": "failure", "head_sha": "abc" } }
        }));
        assert!(matches!(ctx.trigger(), Trigger::Ignored(_)));

        let ctx = context(json!({
            "event_name": "workflow_run",
            "event": { "workflow_run": { "conclusion": "success", "head_sha": "abc" } }
        }));
        assert_eq!(
            ctx.trigger(),
            Trigger::WorkflowRunSuccess {
                sha: "abc".to_string()
            }
        );
    }

    #[test]
    fn pull_request_comment() {
        let ctx = context(json!({
            "event_name": "issue_comment",
            "actor": "someone",
            "event": {
                "issue": { "number": 42, "pull_request": { "url": "x" } },
                "comment": { "body": "@BiocondaBot Hello", "user": { "login": "other" } }
            }
        }));
        assert_eq!(
            ctx.trigger(),
            Trigger::IssueComment {
                issue: 42,
                body: "@BiocondaBot Hello".to_string(),
                author: Some("someone".to_string()),
            }
        );
    }

    #[test]
    fn plain_issue_comment_is_ignored() {
        let ctx = context(json!({
            "event_name": "issue_comment",
            "event": {
                "issue": { "number": 42 },
                "comment": { "body": "@bioconda-bot hello" }
            }
        }));
        assert!(matches!(ctx.trigger(), Trigger::Ignored(_)));
    }

    #[test]
    fn approved_review_carries_head() {
        let ctx = context(json!({
            "event_name": "pull_request_review",
            "event": {
                "review": { "state": "approved" },
                "pull_request": { "number": 9, "head": { "sha": "cafe" } }
            }
        }));
        assert_eq!(
            ctx.trigger(),
            Trigger::ReviewApproved {
                sha: "cafe".to_string()
            }
        );
    }

    #[test]
    fn malformed_context_is_invalid_event() {
        let err = JobContext::from_json("{\"event\": 1}").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BotError>(),
            Some(BotError::InvalidEvent(_))
        ));
    }
}
