//! CLI entry point: parse options, set up logging, run the bot until a
//! shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use tokio_util::sync::CancellationToken;

use mr_lander::config::{BotConfig, Options};
use mr_lander::error::BotError;
use mr_lander::services::api::GitlabApi;
use mr_lander::services::bot::Bot;
use mr_lander::services::gitlab_client::{GitLabClient, GitLabClientConfig};

fn init_logging(level: &str) -> Result<(), BotError> {
    let filter = match level {
        "off" => LevelFilter::Off,
        "error" => LevelFilter::Error,
        "warn" => LevelFilter::Warn,
        "info" => LevelFilter::Info,
        "debug" => LevelFilter::Debug,
        "trace" => LevelFilter::Trace,
        other => {
            return Err(BotError::config(format!("unknown log level {:?}", other)));
        }
    };
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .build();
    TermLogger::init(filter, config, TerminalMode::Mixed, ColorChoice::Auto)
        .map_err(|e| BotError::config(format!("failed to initialize logging: {}", e)))
}

#[tokio::main]
async fn main() -> ExitCode {
    let options = Options::parse();

    if let Err(err) = init_logging(&options.log_level) {
        eprintln!("{}", err);
        return ExitCode::from(2);
    }

    let config = match BotConfig::assemble(options) {
        Ok(config) => config,
        Err(err) => {
            log::error!("{}", err);
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(BotError::Config { message }) => {
            log::error!("Configuration error: {}", message);
            ExitCode::from(2)
        }
        Err(err) => {
            log::error!("fatal: {}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: BotConfig) -> Result<(), BotError> {
    let client = GitLabClient::new(GitLabClientConfig::from_bot_config(&config))?;
    let api: Arc<dyn GitlabApi> = Arc::new(client);

    // Startup checks: the token must work and the platform must be there.
    let bot_user = api.current_user().await.map_err(|err| match err {
        BotError::Unauthorized { message } => BotError::config(format!(
            "auth token rejected by {}: {}",
            config.gitlab_url, message
        )),
        BotError::Network { message } => BotError::config(format!(
            "cannot reach {}: {}",
            config.gitlab_url, message
        )),
        other => other,
    })?;
    log::info!(
        "running as @{} ({}) against {}",
        bot_user.username,
        bot_user.name,
        config.gitlab_url
    );

    // Impersonation and reviewer lookups need admin (sudo, email access).
    if (config.merge_opts.impersonate_approvers || config.merge_opts.add_reviewers)
        && !bot_user.is_admin()
    {
        return Err(BotError::config(format!(
            "@{} is not an admin; --impersonate-approvers and --add-reviewers need sudo",
            bot_user.username
        )));
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::info!("shutdown signal received, cancelling all loops");
        signal_cancel.cancel();
    });

    Bot::new(api, config, bot_user, cancel).run().await
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(
            tokio::signal::unix::SignalKind::terminate(),
        ) {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("cannot install SIGTERM handler: {}", err);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
