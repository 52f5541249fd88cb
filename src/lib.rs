//! bioconda-bot: CI-event-driven automation for a recipe repository.
//!
//! Reacts to build completions and pull request comments: posts comments
//! listing the artifacts each CI provider built, relays packages and
//! container images to their registries, and squash-merges approved pull
//! requests labelled for automerge.

pub mod aggregator;
pub mod cli;
pub mod comment;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod github;
pub mod merge;
pub mod notify;
pub mod providers;
pub mod relay;
pub mod transport;
pub mod types;

pub use aggregator::{collect_artifacts, discover_artifacts};
pub use cli::{Cli, Flow, load_job_context, parse_args};
pub use comment::compose_artifact_comment;
pub use config::{BotConfig, Credentials, Endpoints, RetryPolicy, Secret, Tuning};
pub use dispatch::{Bot, Command};
pub use error::{BotError, Lookup, exit_code};
pub use events::{JobContext, Trigger};
pub use github::{Forge, GitHub, MergeRequest};
pub use merge::{Mergeability, evaluate, merge_pr, request_merge};
pub use notify::{Gitter, Notifier};
pub use providers::{ArtifactProvider, BuildRef, ProviderRegistry};
pub use relay::{ArtifactRelay, CommandRunner, ContainerRegistry, Invocation, ProcessRunner, Quay};
pub use types::{
    ArtifactRecord, ArtifactSet, CheckRun, MergeState, Provider, PullRequestInfo, PullRequestRef,
    Repo, RepoError, Review, UploadTarget,
};
