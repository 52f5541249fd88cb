use std::sync::Arc;

use anyhow::Result;
use bioconda_bot::{Bot, BotConfig, Cli, Flow, exit_code, load_job_context, parse_args};
use tracing::{error, info};

fn handle_clap_help_version(clap_err: &clap::Error) -> ! {
    use clap::error::ErrorKind;
    match clap_err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            print!("{clap_err}");
            std::process::exit(0);
        }
        _ => {
            eprint!("{clap_err}");
            std::process::exit(2);
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(BotConfig::from_env()?);
    let context = load_job_context(cli.context.as_deref())?;
    info!(flow = ?cli.flow, event = %context.event_name, repo = %config.repo, "Starting");

    let bot = Bot::standard(config)?;
    match cli.flow {
        Flow::Automerge => {
            if let Some(pr) = bot.automerge(&context).await? {
                info!(pr, "Merged");
            }
        }
        Flow::Comment => bot.comment(&context).await?,
        Flow::Merge => {
            if let Some(state) = bot.merge(&context).await? {
                info!(%state, "Merge request handled");
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = match parse_args(std::env::args()) {
        Ok(cli) => cli,
        Err(err) => match err.downcast_ref::<clap::Error>() {
            Some(clap_err) => handle_clap_help_version(clap_err),
            None => {
                eprintln!("{err:#}");
                std::process::exit(2);
            }
        },
    };

    if let Err(err) = run(cli).await {
        error!("{:#}", err);
        std::process::exit(exit_code(&err));
    }
}
