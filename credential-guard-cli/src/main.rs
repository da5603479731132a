mod cli;
mod commands;

use std::process;

use clap::Parser;
use credential_guard::GuardConfig;
use credential_guard::logging::{LogFormat, init_logging};
use tracing::error;

use crate::cli::{Args, Commands};
use crate::commands::CommandExecutor;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = run(args).await {
        error!("Application error: {:#}", e);
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let directive = if args.quiet {
        Some("error")
    } else if args.verbose {
        Some("credential_guard=debug,credguard=debug")
    } else {
        None
    };
    let format = if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    init_logging(directive, format)?;

    let mut config = GuardConfig::from_env()?;
    if let Some(path) = args.key_file {
        config = config.with_key_path(path);
    }
    let executor = CommandExecutor::new(config);

    match args.command {
        Commands::Encrypt { text } => executor.encrypt(text)?,
        Commands::Decrypt { blob } => executor.decrypt(blob)?,
        Commands::Keygen => executor.keygen()?,
        Commands::Check { cookie, json } => executor.check(&cookie, json).await?,
        Commands::Intent { cookie } => executor.intent(&cookie).await?,
        Commands::BoundToken { cookie, url, body } => {
            executor.bound_token(&cookie, &url, body).await?
        }
    }

    Ok(())
}
