#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use bioconda_bot::{
    ArtifactProvider, ArtifactRecord, ArtifactRelay, BotConfig, BotError, BuildRef, CheckRun,
    CommandRunner, ContainerRegistry, Forge, Invocation, Lookup, MergeRequest, Notifier, Provider,
    ProviderRegistry, PullRequestInfo, PullRequestRef, Repo, RetryPolicy, Review, Secret,
    transport,
    types::{CheckRunApp, CheckRunOutput},
};

/// A GitHub call observed by [`MockHub`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CheckRuns(String),
    PullRequest(u64),
    OpenPulls(u32),
    Reviews(u64),
    Membership(String),
    Labels(u64),
    Commits(u64),
    Comment(u64, String),
    AddLabels(u64, Vec<String>),
    Merge(MergeRequest),
    UpdateBranch(u64),
}

/// In-memory forge that records every call.
#[derive(Default)]
pub struct MockHub {
    pub check_runs: Vec<CheckRun>,
    pub open_prs: Vec<PullRequestRef>,
    /// Successive answers per PR; the last one repeats.
    pulls: Mutex<HashMap<u64, VecDeque<PullRequestInfo>>>,
    pub reviews: HashMap<u64, Vec<Review>>,
    pub members: Vec<String>,
    /// Users whose membership lookup fails.
    pub unreachable_members: Vec<String>,
    pub labels: HashMap<u64, Vec<String>>,
    pub commits: Vec<String>,
    pub reject_comments: bool,
    pub fail_update: bool,
    /// PRs whose merge call fails.
    pub fail_merge: Vec<u64>,
    calls: Mutex<Vec<Call>>,
}

impl MockHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pull(&self, info: PullRequestInfo) {
        self.pulls
            .lock()
            .unwrap()
            .entry(info.number)
            .or_default()
            .push_back(info);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn comments(&self) -> Vec<(u64, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Comment(issue, body) => Some((issue, body)),
                _ => None,
            })
            .collect()
    }

    pub fn merges(&self) -> Vec<MergeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Merge(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Forge for MockHub {
    async fn check_runs(&self, sha: &str) -> Result<Vec<CheckRun>> {
        self.record(Call::CheckRuns(sha.to_string()));
        Ok(self.check_runs.clone())
    }

    async fn pull_request(&self, number: u64) -> Result<PullRequestInfo> {
        self.record(Call::PullRequest(number));
        let mut pulls = self.pulls.lock().unwrap();
        let queue = pulls
            .get_mut(&number)
            .ok_or_else(|| anyhow::anyhow!("no such PR #{}", number))?;
        let info = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        info.ok_or_else(|| anyhow::anyhow!("no state for PR #{}", number))
    }

    async fn open_pull_requests(&self, page: u32, per_page: u32) -> Result<Vec<PullRequestRef>> {
        self.record(Call::OpenPulls(page));
        let start = ((page - 1) * per_page) as usize;
        Ok(self
            .open_prs
            .iter()
            .skip(start)
            .take(per_page as usize)
            .cloned()
            .collect())
    }

    async fn reviews(&self, number: u64) -> Result<Vec<Review>> {
        self.record(Call::Reviews(number));
        Ok(self.reviews.get(&number).cloned().unwrap_or_default())
    }

    async fn org_membership(&self, user: &str) -> Lookup<()> {
        self.record(Call::Membership(user.to_string()));
        if self.unreachable_members.iter().any(|u| u == user) {
            return Lookup::Transient(anyhow::anyhow!("HTTP 502"));
        }
        if self.members.iter().any(|u| u == user) {
            Lookup::Found(())
        } else {
            Lookup::NotFound
        }
    }

    async fn labels(&self, number: u64) -> Result<Vec<String>> {
        self.record(Call::Labels(number));
        Ok(self.labels.get(&number).cloned().unwrap_or_default())
    }

    async fn commit_messages(&self, number: u64, limit: usize) -> Result<Vec<String>> {
        self.record(Call::Commits(number));
        Ok(self.commits.iter().take(limit).cloned().collect())
    }

    async fn post_comment(&self, number: u64, body: &str) -> Result<()> {
        self.record(Call::Comment(number, body.to_string()));
        if self.reject_comments {
            return Err(BotError::CommentRejected {
                issue: number,
                reason: "HTTP 403".to_string(),
            }
            .into());
        }
        Ok(())
    }

    async fn add_labels(&self, number: u64, labels: &[String]) -> Result<()> {
        self.record(Call::AddLabels(number, labels.to_vec()));
        Ok(())
    }

    async fn merge(&self, request: &MergeRequest) -> Result<()> {
        self.record(Call::Merge(request.clone()));
        if self.fail_merge.contains(&request.number) {
            anyhow::bail!("HTTP 405 from merge of #{}", request.number);
        }
        Ok(())
    }

    async fn update_branch(&self, number: u64) -> Result<()> {
        self.record(Call::UpdateBranch(number));
        if self.fail_update {
            anyhow::bail!("HTTP 422 from update-branch");
        }
        Ok(())
    }
}

/// Provider whose build reference is the check run's details URL.
pub struct MockProvider {
    pub provider: Provider,
    pub slugs: Vec<&'static str>,
    pub listings: HashMap<String, Vec<ArtifactRecord>>,
    /// Builds whose listing fails.
    pub failing: Vec<String>,
    listed: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(provider: Provider, slug: &'static str) -> Self {
        Self {
            provider,
            slugs: vec![slug],
            listings: HashMap::new(),
            failing: Vec::new(),
            listed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_listing(mut self, build: &str, records: Vec<ArtifactRecord>) -> Self {
        self.listings.insert(build.to_string(), records);
        self
    }

    pub fn failing(mut self, build: &str) -> Self {
        self.failing.push(build.to_string());
        self
    }

    pub fn listed(&self) -> Vec<String> {
        self.listed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactProvider for MockProvider {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn app_slugs(&self) -> &[&'static str] {
        &self.slugs
    }

    fn build_ref(&self, run: &CheckRun) -> Option<BuildRef> {
        run.details_url.clone().map(BuildRef::Single)
    }

    async fn list_artifacts(&self, build: &BuildRef) -> Result<Vec<ArtifactRecord>> {
        let BuildRef::Single(id) = build else {
            return Ok(Vec::new());
        };
        self.listed.lock().unwrap().push(id.clone());
        if self.failing.contains(id) {
            anyhow::bail!("HTTP 500 from {}", id);
        }
        Ok(self.listings.get(id).cloned().unwrap_or_default())
    }
}

/// Records tool invocations; a program listed in `failures` fails that many
/// times before succeeding.
#[derive(Default)]
pub struct RecordingRunner {
    pub failures: Mutex<HashMap<String, u32>>,
    invocations: Mutex<Vec<Invocation>>,
    /// Whether the input file existed when the tool ran.
    saw_input: Mutex<Vec<bool>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(program: &str, times: u32) -> Self {
        let runner = Self::default();
        runner
            .failures
            .lock()
            .unwrap()
            .insert(program.to_string(), times);
        runner
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.invocations()
            .into_iter()
            .map(|invocation| invocation.program)
            .collect()
    }

    pub fn saw_input(&self) -> Vec<bool> {
        self.saw_input.lock().unwrap().clone()
    }
}

fn input_path(invocation: &Invocation) -> Option<String> {
    match invocation.program.as_str() {
        "anaconda" => invocation.args.get(3).cloned(),
        "skopeo" => invocation
            .args
            .iter()
            .find_map(|a| a.strip_prefix("docker-archive:").map(str::to_string)),
        _ => None,
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, invocation: &Invocation) -> Result<()> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let exists = input_path(invocation).is_some_and(|p| Path::new(&p).exists());
        self.saw_input.lock().unwrap().push(exists);

        let mut failures = self.failures.lock().unwrap();
        let left = failures.get_mut(&invocation.program);
        if let Some(left) = left.filter(|left| **left > 0) {
            *left -= 1;
            return Err(BotError::ToolFailed {
                command: invocation.to_string(),
                status: "exit status: 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Container registry that records visibility changes.
pub struct MockRegistry {
    pub answer: fn() -> Lookup<()>,
    made_public: Mutex<Vec<String>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::answering(|| Lookup::Found(()))
    }

    pub fn answering(answer: fn() -> Lookup<()>) -> Self {
        Self {
            answer,
            made_public: Mutex::new(Vec::new()),
        }
    }

    pub fn made_public(&self) -> Vec<String> {
        self.made_public.lock().unwrap().clone()
    }
}

#[async_trait]
impl ContainerRegistry for MockRegistry {
    async fn make_public(&self, repository: &str) -> Lookup<()> {
        self.made_public.lock().unwrap().push(repository.to_string());
        (self.answer)()
    }
}

#[derive(Default)]
pub struct MockNotifier {
    messages: Mutex<Vec<String>>,
}

impl MockNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn notify(&self, text: &str) -> Lookup<()> {
        self.messages.lock().unwrap().push(text.to_string());
        Lookup::Found(())
    }
}

/// Configuration with credentials, no delays, and `work_dir` for staging.
pub fn test_config(work_dir: &Path) -> BotConfig {
    let mut config = BotConfig::new(Repo::parse("bioconda/bioconda-recipes").unwrap());
    config.credentials.github_token = Some(Secret::new("ghp_test"));
    config.credentials.anaconda_token = Some(Secret::new("anaconda-secret"));
    config.credentials.quay_login = Some(Secret::new("bot:quay-secret"));
    config.tuning.mergeability = RetryPolicy::new(2, Duration::ZERO);
    config.tuning.image_push = RetryPolicy::new(5, Duration::ZERO);
    config.work_dir = work_dir.to_path_buf();
    config
}

pub fn registry_with(providers: Vec<Arc<MockProvider>>) -> ProviderRegistry {
    let mut registry = ProviderRegistry::new();
    for provider in providers {
        registry.register(provider);
    }
    registry
}

pub fn relay(
    config: Arc<BotConfig>,
    providers: ProviderRegistry,
    runner: Arc<RecordingRunner>,
    registry: Arc<MockRegistry>,
) -> ArtifactRelay {
    let downloads = transport::download_client("test", Duration::from_secs(30)).unwrap();
    ArtifactRelay::new(config, providers, downloads, runner, registry)
}

pub fn check_run(id: u64, slug: &str, details_url: &str) -> CheckRun {
    CheckRun {
        id,
        name: format!("check {}", id),
        status: "completed".to_string(),
        conclusion: Some("success".to_string()),
        details_url: Some(details_url.to_string()),
        external_id: None,
        app: Some(CheckRunApp {
            slug: slug.to_string(),
        }),
        output: CheckRunOutput::default(),
    }
}

pub fn clean_pull(number: u64, sha: &str) -> PullRequestInfo {
    PullRequestInfo {
        number,
        head_sha: sha.to_string(),
        mergeable: Some(true),
        mergeable_state: Some("clean".to_string()),
    }
}

pub fn approval(user: &str) -> Review {
    Review {
        author: Some(user.to_string()),
        state: "APPROVED".to_string(),
    }
}

/// Zip archive bytes with the given members.
pub fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    use std::io::Write;

    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in entries {
        zip.start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap().into_inner()
}
