//! Markdown rendering of discovered artifacts.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use tracing::info;

use crate::{
    aggregator::discover_artifacts,
    github::Forge,
    providers::ProviderRegistry,
    types::{ArtifactRecord, ArtifactSet, CONTAINER_SUFFIX, Provider},
};

pub const NO_ARTIFACTS_MESSAGE: &str = "No artifacts found on the most recent builds. \
     Either the builds failed, the artifacts have been removed due to age, \
     or the recipe was blacklisted/skipped.";

const PACKAGE_HEADER: &str = "Package(s) built are ready for inspection:\n\n\
     Arch | Package | Zip File / Repodata | CI | Instructions\n\
     -----|---------|---------|-----|---------\n";

const IMAGE_HEADER: &str = "***\n\nDocker image(s) built:\n\n\
     Package | Tag | CI | Install with `docker`\n\
     ---------|---------|-----|---------\n";

const ZIP_INSTALL_HINT: &str = "You may also use `conda` to install after downloading and \
     extracting the zip file.";

/// `{archive}/{base}/{subdir}/{package}` inside a zip bundle.
static BUNDLED_PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)/(.+)/(.+)/(.+\.conda|.+\.tar\.bz2)$").expect("bundled package pattern is valid")
});

/// `{base}/{subdir}/{package}`.
static PACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)/(.+)/(.+\.conda|.+\.tar\.bz2)$").expect("package pattern is valid")
});

fn azure_row(artifact: &ArtifactRecord) -> Option<String> {
    let caps = BUNDLED_PACKAGE.captures(&artifact.path)?;
    let (archive, subdir, package) = (&caps[1], &caps[3], &caps[4]);
    Some(format!(
        "{subdir} | {package} | [{archive}.zip]({url}) | Azure | \
         <details><summary>show</summary>{ZIP_INSTALL_HINT} From the {archive} directory: \
         `conda install -c ./packages <package name>`</details>\n",
        url = artifact.source_url,
    ))
}

fn circleci_row(artifact: &ArtifactRecord) -> Option<String> {
    let caps = PACKAGE.captures(&artifact.source_url)?;
    let (base, subdir, package) = (&caps[1], &caps[2], &caps[3]);
    Some(format!(
        "{subdir} | [{package}]({url}) | [repodata.json]({base}/{subdir}/repodata.json) | CircleCI | \
         <details><summary>show</summary>You may also use `conda` to install:\
         `conda install -c {base} <package name>`</details>\n",
        url = artifact.source_url,
    ))
}

fn github_actions_row(artifact: &ArtifactRecord) -> Option<String> {
    let caps = PACKAGE.captures(&artifact.path)?;
    let (subdir, package) = (&caps[2], &caps[3]);
    Some(format!(
        "{subdir} | {package} | [{subdir}.zip]({url}) | GitHub Actions | \
         <details><summary>show</summary>{ZIP_INSTALL_HINT} \
         `conda install -c ./packages <package name>`</details>\n",
        url = artifact.source_url,
    ))
}

fn package_row(provider: Provider, artifact: &ArtifactRecord) -> Option<String> {
    match provider {
        Provider::Azure => azure_row(artifact),
        Provider::CircleCi => circleci_row(artifact),
        Provider::GithubActions => github_actions_row(artifact),
    }
}

/// `(name, tag)` of a container archive, `None` for anything else.
fn image_reference(artifact: &ArtifactRecord) -> Option<(String, String)> {
    let base = artifact.path.rsplit('/').next()?;
    let image = base
        .strip_suffix(CONTAINER_SUFFIX)?
        .replace("%3A", ":")
        .replace("%3a", ":");
    let (name, tag) = image.split_once(':')?;
    Some((name.to_string(), tag.to_string()))
}

fn image_row(provider: Provider, artifact: &ArtifactRecord) -> Option<String> {
    let (name, tag) = image_reference(artifact)?;
    let row = match provider {
        Provider::Azure => format!(
            "{name} | {tag} | Azure | <details><summary>show</summary>Images for Azure are in \
             the LinuxArtifacts zip file above.\
             `gzip -dc LinuxArtifacts/images/{name}:{tag}.tar.gz \\| docker load`</details>\n"
        ),
        Provider::CircleCi => format!(
            "[{name}]({url}) | {tag} | CircleCI | <details><summary>show</summary>\
             `curl -L \"{url}\" \\| gzip -dc \\| docker load`</details>\n",
            url = artifact.source_url,
        ),
        Provider::GithubActions => format!(
            "{name} | {tag} | GitHub Actions | <details><summary>show</summary>Images for \
             GitHub Actions are in the zip file above.\
             `gzip -dc images/{name}:{tag}.tar.gz \\| docker load`</details>\n"
        ),
    };
    Some(row)
}

/// Renders the artifact comment. Paths that match no known layout are left
/// out.
pub fn compose_artifact_comment(artifacts: &ArtifactSet) -> String {
    let packages: String = artifacts
        .records()
        .filter_map(|(provider, artifact)| package_row(provider, artifact))
        .collect();
    let images: String = artifacts
        .records()
        .filter_map(|(provider, artifact)| image_row(provider, artifact))
        .collect();

    let mut comment = if packages.is_empty() {
        NO_ARTIFACTS_MESSAGE.to_string()
    } else {
        format!("{PACKAGE_HEADER}{packages}")
    };
    if !images.is_empty() {
        comment.push_str(IMAGE_HEADER);
        comment.push_str(&images);
    }
    comment.push_str("\n\n");
    comment
}

/// Discovers the artifacts of `sha` and posts them on `pr`.
pub async fn post_artifact_comment<F>(
    forge: &F,
    registry: &ProviderRegistry,
    pr: u64,
    sha: &str,
) -> Result<()>
where
    F: Forge + ?Sized,
{
    let artifacts = discover_artifacts(forge, registry, sha).await?;
    let comment = compose_artifact_comment(&artifacts);
    info!(pr, sha, providers = ?artifacts.providers(), "Posting artifact comment");
    forge.post_comment(pr, &comment).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(entries: Vec<(Provider, Vec<ArtifactRecord>)>) -> ArtifactSet {
        let mut artifacts = ArtifactSet::new();
        for (provider, records) in entries {
            artifacts.insert(provider, records);
        }
        artifacts
    }

    #[test]
    fn empty_set_uses_fallback() {
        let comment = compose_artifact_comment(&ArtifactSet::new());
        assert!(comment.starts_with(NO_ARTIFACTS_MESSAGE));
        assert!(!comment.contains("Docker image(s) built"));
    }

    #[test]
    fn circleci_rows_link_package_and_repodata() {
        let url = "https://output.circle-artifacts.com/output/job/j1/artifacts/0/tmp/artifacts/packages/linux-64/samtools-1.19-h50ea8bc_0.tar.bz2";
        let artifacts = set(vec![(
            Provider::CircleCi,
            vec![ArtifactRecord::new(
                url,
                "tmp/artifacts/packages/linux-64/samtools-1.19-h50ea8bc_0.tar.bz2",
            )],
        )]);
        let comment = compose_artifact_comment(&artifacts);
        assert!(comment.starts_with(PACKAGE_HEADER));
        assert!(comment.contains(&format!(
            "linux-64 | [samtools-1.19-h50ea8bc_0.tar.bz2]({url}) | \
             [repodata.json](https://output.circle-artifacts.com/output/job/j1/artifacts/0/tmp/artifacts/packages/linux-64/repodata.json) | CircleCI"
        )));
        assert!(comment.contains(
            "`conda install -c https://output.circle-artifacts.com/output/job/j1/artifacts/0/tmp/artifacts/packages <package name>`"
        ));
    }

    #[test]
    fn azure_rows_name_the_zip() {
        let artifacts = set(vec![(
            Provider::Azure,
            vec![ArtifactRecord::new(
                "https://dev.azure.com/zip?format=zip",
                "LinuxArtifacts/packages/noarch/pysam-0.22-pyh_0.conda",
            )],
        )]);
        let comment = compose_artifact_comment(&artifacts);
        assert!(comment.contains(
            "noarch | pysam-0.22-pyh_0.conda | [LinuxArtifacts.zip](https://dev.azure.com/zip?format=zip) | Azure"
        ));
        assert!(comment.contains("From the LinuxArtifacts directory"));
    }

    #[test]
    fn images_get_a_second_table() {
        let artifacts = set(vec![(
            Provider::CircleCi,
            vec![
                ArtifactRecord::new(
                    "https://c/0/packages/linux-64/a-1-0.tar.bz2",
                    "packages/linux-64/a-1-0.tar.bz2",
                ),
                ArtifactRecord::new("https://c/0/images/a%3A1--0.tar.gz", "images/a%3A1--0.tar.gz"),
            ],
        )]);
        let comment = compose_artifact_comment(&artifacts);
        assert_eq!(comment.matches("Docker image(s) built").count(), 1);
        assert!(comment.contains("[a](https://c/0/images/a%3A1--0.tar.gz) | 1--0 | CircleCI"));
    }

    #[test]
    fn unparsable_paths_are_skipped() {
        let artifacts = set(vec![
            (
                Provider::GithubActions,
                vec![
                    ArtifactRecord::new("https://gh/zip", "a.tar.bz2"),
                    ArtifactRecord::new("https://gh/zip", "packages/linux-64/repodata.json"),
                    ArtifactRecord::new("https://gh/zip", "images/untagged.tar.gz"),
                ],
            ),
            (Provider::Azure, vec![ArtifactRecord::new("", "")]),
        ]);
        let comment = compose_artifact_comment(&artifacts);
        assert!(comment.starts_with(NO_ARTIFACTS_MESSAGE));
        assert!(!comment.contains("Docker image(s) built"));
    }
}
