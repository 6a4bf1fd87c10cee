use clap::Parser;
use dataset_journal::{
    config::{AppConfig, Cli},
    errors::AppError,
};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod handlers;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- Resolve config (CLI > env > settings file > defaults) ---
    let cfg = AppConfig::from_env_and_args(&cli.global);

    // --- Logging setup ---
    let echo = cfg.as_ref().is_ok_and(|cfg| cfg.registry.echo);
    init_logging(cli.global.verbose, echo);

    let cfg = match cfg {
        Ok(cfg) => cfg,
        Err(err) => {
            let err = AppError::validation(format!("{err:#}"));
            tracing::error!("{}", err);
            return err.exit_code();
        }
    };
    tracing::debug!("effective configuration: {:?}", cfg);

    match handlers::commands::run(cli.command, &cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            err.exit_code()
        }
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`.
fn init_logging(verbose: bool, echo: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        if echo {
            EnvFilter::new(format!("{level},sqlx::query=debug"))
        } else {
            EnvFilter::new(level)
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
