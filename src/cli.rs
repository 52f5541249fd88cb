use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::{error::BotError, events::JobContext};

/// Environment variable the workflow stores its `github` context in.
pub const JOB_CONTEXT_VAR: &str = "JOB_CONTEXT";

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Merge automerge-labelled PRs once their checks pass
    Automerge,
    /// Post artifact comments and answer bot commands
    Comment,
    /// Upload artifacts and merge a PR on request
    Merge,
}

#[derive(Parser, Debug)]
#[command(
    name = "bioconda-bot",
    version,
    about = "Respond to CI and comment events on a recipe repository"
)]
pub struct Cli {
    #[command(subcommand)]
    pub flow: Flow,

    /// Read the trigger payload from FILE instead of $JOB_CONTEXT
    #[arg(long, global = true, value_name = "FILE")]
    pub context: Option<PathBuf>,
}

/// Parses command-line arguments.
pub fn parse_args<I, T>(args: I) -> Result<Cli>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Ok(Cli::try_parse_from(args)?)
}

/// Loads the trigger payload from `path`, or from `$JOB_CONTEXT` when no
/// path is given.
pub fn load_job_context(path: Option<&Path>) -> Result<JobContext> {
    let raw = match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job context from {}", path.display()))?,
        None => std::env::var(JOB_CONTEXT_VAR)
            .map_err(|_| BotError::InvalidEvent(format!("{} is not set", JOB_CONTEXT_VAR)))?,
    };
    JobContext::from_json(&raw)
}
