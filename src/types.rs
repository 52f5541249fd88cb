use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffixes of package archives accepted by the package registry.
pub const PACKAGE_SUFFIXES: [&str; 2] = [".tar.bz2", ".conda"];

/// Suffix of container image archives produced by the builds.
pub const CONTAINER_SUFFIX: &str = ".tar.gz";

/// Channel index written next to the packages of each subdirectory.
pub const REPODATA_SUFFIX: &str = "repodata.json";

/// A GitHub repository in `owner/name` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    #[error("repository must be in format 'owner/repo', got: '{0}'")]
    InvalidFormat(String),
    #[error("repository has an empty component: '{0}'")]
    EmptyComponent(String),
}

impl Repo {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, RepoError> {
        let owner = owner.into();
        let name = name.into();
        if owner.trim().is_empty() || name.trim().is_empty() {
            return Err(RepoError::EmptyComponent(format!("{owner}/{name}")));
        }
        Ok(Self { owner, name })
    }

    pub fn parse(s: &str) -> Result<Self, RepoError> {
        let mut parts = s.trim().split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(owner), Some(name), None) => Self::new(owner, name),
            _ => Err(RepoError::InvalidFormat(s.to_string())),
        }
    }
}

impl fmt::Display for Repo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A pull request number together with the commit it currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestRef {
    pub number: u64,
    pub head_sha: String,
}

/// Snapshot of the fields of a pull request the bot decides on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub number: u64,
    pub head_sha: String,
    /// `None` while GitHub is still computing mergeability in the background.
    pub mergeable: Option<bool>,
    pub mergeable_state: Option<String>,
}

impl PullRequestInfo {
    pub fn to_ref(&self) -> PullRequestRef {
        PullRequestRef {
            number: self.number,
            head_sha: self.head_sha.clone(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.mergeable == Some(true) && self.mergeable_state.as_deref() == Some("clean")
    }
}

/// A submitted pull request review.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub author: Option<String>,
    pub state: String,
}

impl Review {
    pub fn is_approval(&self) -> bool {
        self.state.eq_ignore_ascii_case("APPROVED")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunApp {
    #[serde(default)]
    pub slug: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRunOutput {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// A CI provider's reported outcome for a commit, as returned by the
/// check-runs listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRun {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub details_url: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub app: Option<CheckRunApp>,
    #[serde(default)]
    pub output: CheckRunOutput,
}

impl CheckRun {
    pub fn app_slug(&self) -> Option<&str> {
        self.app.as_ref().map(|app| app.slug.as_str())
    }

    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }

    pub fn is_success(&self) -> bool {
        self.conclusion.as_deref() == Some("success")
    }
}

/// The fixed set of CI providers artifacts are collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Provider {
    Azure,
    CircleCi,
    GithubActions,
}

impl Provider {
    pub fn key(&self) -> &'static str {
        match self {
            Provider::Azure => "azure",
            Provider::CircleCi => "circleci",
            Provider::GithubActions => "github-actions",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::Azure => "Azure",
            Provider::CircleCi => "CircleCI",
            Provider::GithubActions => "GitHub Actions",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// A build output located by a provider.
///
/// `source_url` is where the bytes are downloaded from; `path` is the
/// provider-relative archive path. For zip-bundled providers the source is the
/// zip and `path` names the member inside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactRecord {
    pub source_url: String,
    pub path: String,
}

impl ArtifactRecord {
    pub fn new(source_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            path: path.into(),
        }
    }

    /// Trailing segment of the archive path.
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// True when the bytes live inside an archive rather than at `source_url`
    /// directly.
    pub fn is_bundled(&self) -> bool {
        let url_tail = self
            .source_url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .rsplit('/')
            .next()
            .unwrap_or_default();
        decode_tag_separator(url_tail) != decode_tag_separator(self.file_name())
    }
}

fn decode_tag_separator(s: &str) -> String {
    s.replace("%3A", ":").replace("%3a", ":")
}

/// Whether a listed path is worth reporting at all.
pub fn is_artifact_path(path: &str) -> bool {
    PACKAGE_SUFFIXES.iter().any(|suffix| path.ends_with(suffix))
        || path.ends_with(CONTAINER_SUFFIX)
        || path.ends_with(REPODATA_SUFFIX)
}

/// Artifacts for one provider, in the provider's listing order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderArtifacts {
    pub provider: Provider,
    pub artifacts: Vec<ArtifactRecord>,
}

/// Provider to artifacts mapping with at most one entry per provider.
///
/// Entries keep the order in which providers were first resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactSet {
    entries: Vec<ProviderArtifacts>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, provider: Provider) -> bool {
        self.entries.iter().any(|e| e.provider == provider)
    }

    /// Records the artifacts for `provider` unless it was already resolved.
    /// Returns whether the entry was stored.
    pub fn insert(&mut self, provider: Provider, artifacts: Vec<ArtifactRecord>) -> bool {
        if self.contains(provider) {
            return false;
        }
        self.entries.push(ProviderArtifacts {
            provider,
            artifacts,
        });
        true
    }

    pub fn get(&self, provider: Provider) -> Option<&[ArtifactRecord]> {
        self.entries
            .iter()
            .find(|e| e.provider == provider)
            .map(|e| e.artifacts.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProviderArtifacts> {
        self.entries.iter()
    }

    pub fn providers(&self) -> Vec<Provider> {
        self.entries.iter().map(|e| e.provider).collect()
    }

    /// All records across providers, provider order first.
    pub fn records(&self) -> impl Iterator<Item = (Provider, &ArtifactRecord)> {
        self.entries
            .iter()
            .flat_map(|e| e.artifacts.iter().map(move |a| (e.provider, a)))
    }

    /// True when no provider contributed a single artifact.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.artifacts.is_empty())
    }
}

/// Outcome of evaluating a pull request for merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Unknown,
    Mergeable,
    NotMergeable,
    NeedsReview,
    Merged,
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MergeState::Unknown => "UNKNOWN",
            MergeState::Mergeable => "MERGEABLE",
            MergeState::NotMergeable => "NOT_MERGEABLE",
            MergeState::NeedsReview => "NEEDS_REVIEW",
            MergeState::Merged => "MERGED",
        };
        f.write_str(s)
    }
}

/// Where a downloaded artifact gets pushed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// A package archive for the package registry.
    Package { file_name: String },
    /// A container image archive for the container registry.
    Container {
        file_name: String,
        /// `name:tag` reference to push as.
        image: String,
        /// Repository whose visibility is toggled after the push.
        repository: String,
    },
}

impl UploadTarget {
    /// Classifies an archive path by its trailing segment. Paths that are
    /// neither packages nor tagged container archives yield `None`.
    pub fn from_path(path: &str) -> Option<Self> {
        let base = path.rsplit('/').next()?.trim();
        if base.is_empty() {
            return None;
        }
        // Local file names must not carry the tag separator.
        let file_name = decode_tag_separator(base).replace(':', "_");

        if PACKAGE_SUFFIXES.iter().any(|s| base.ends_with(s)) {
            return Some(UploadTarget::Package { file_name });
        }

        let image = decode_tag_separator(base.strip_suffix(CONTAINER_SUFFIX)?);
        let (repository, tag) = image.split_once(':')?;
        if repository.is_empty() || tag.is_empty() {
            return None;
        }
        Some(UploadTarget::Container {
            file_name,
            repository: repository.to_string(),
            image,
        })
    }

    pub fn file_name(&self) -> &str {
        match self {
            UploadTarget::Package { file_name } | UploadTarget::Container { file_name, .. } => {
                file_name
            }
        }
    }
}
