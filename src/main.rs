use std::process::ExitCode;

use clap::Parser;
use db_backup_lib::backup::Orchestrator;
use db_backup_lib::cli::{Action, BackupArgs, Cli, EncryptArgs};
use db_backup_lib::config::BackupConfig;
use db_backup_lib::credentials::{self, CredentialStore};
use db_backup_lib::remote::OpenSsh;

const EXIT_FATAL: u8 = 1;
const EXIT_BACKUP_FAILED: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    } else {
        env_logger.filter_level(log::LevelFilter::Info).parse_default_env();
    }
    env_logger.try_init().expect("env_logger should not fail");

    match cli.action.unwrap_or_default() {
        Action::Backup => backup(&cli.config, cli.backup).await,
        Action::Encrypt(args) => encrypt(args),
    }
}

async fn backup(config_path: &std::path::Path, args: BackupArgs) -> ExitCode {
    let config = match BackupConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Loading {} failed: {e}", config_path.display());
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let credentials = match CredentialStore::unlock(&args.credentials, &config.private_key_path) {
        Ok(credentials) => credentials,
        Err(e) => {
            log::error!("Loading credentials failed: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    let orchestrator = Orchestrator::from_config(OpenSsh::default(), credentials, &config);
    let limits = orchestrator.limits();
    log::info!(
        "Starting backup of {} server(s), at most {} at once with up to {} dumps in flight",
        config.servers.len(),
        limits.max_concurrent_servers,
        limits.max_concurrent_dumps()
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Listening for Ctrl-C failed: {e}");
            std::future::pending::<()>().await;
        }
    };
    let report = orchestrator.run_until(&config.servers, shutdown).await;

    if args.json {
        println!("{:#}", report.to_json());
    } else {
        for result in &report.results {
            println!("{result}");
        }
        println!();
        println!("{report}");
    }

    if report.interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if args.fail_on_error && report.failures() > 0 {
        ExitCode::from(EXIT_BACKUP_FAILED)
    } else {
        ExitCode::SUCCESS
    }
}

fn encrypt(args: EncryptArgs) -> ExitCode {
    match credentials::seal(&args.input, &args.output, &args.public_key) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Encrypting credentials failed: {e}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
