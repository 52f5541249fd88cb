use anyhow::Result;
use tracing::{debug, info, warn};

use crate::{
    github::Forge,
    providers::ProviderRegistry,
    types::{ArtifactSet, CheckRun},
};

/// Collects the artifacts every provider published for a commit.
///
/// The first check run of each provider that carries a usable build
/// reference decides that provider's artifacts; later runs of the same
/// provider are skipped. A provider whose listing fails contributes an empty
/// list so the others are still reported.
pub async fn discover_artifacts<F>(
    forge: &F,
    registry: &ProviderRegistry,
    sha: &str,
) -> Result<ArtifactSet>
where
    F: Forge + ?Sized,
{
    let check_runs = forge.check_runs(sha).await?;
    Ok(collect_artifacts(registry, &check_runs).await)
}

/// Aggregation over an already fetched list of check runs.
pub async fn collect_artifacts(registry: &ProviderRegistry, check_runs: &[CheckRun]) -> ArtifactSet {
    let mut artifacts = ArtifactSet::new();

    for run in check_runs {
        let Some(adapter) = run.app_slug().and_then(|slug| registry.lookup(slug)) else {
            continue;
        };
        let provider = adapter.provider();
        if artifacts.contains(provider) {
            debug!(check_run = run.id, %provider, "Provider already resolved, skipping");
            continue;
        }
        let Some(build) = adapter.build_ref(run) else {
            continue;
        };

        let listed = match adapter.list_artifacts(&build).await {
            Ok(listed) => listed,
            Err(err) => {
                warn!(
                    check_run = run.id,
                    %provider,
                    error = %format!("{:#}", err),
                    "Artifact listing failed"
                );
                Vec::new()
            }
        };
        info!(%provider, count = listed.len(), ?build, "Discovered artifacts");
        artifacts.insert(provider, listed);
    }

    artifacts
}
