use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use log::LevelFilter;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Verbosity of the command output.
    #[arg(long, env = "DB_BACKUP_LOG")]
    pub verbose: Option<LevelFilter>,

    /// Configuration of servers and limits.
    #[arg(long, short = 'c', default_value = "config.toml", env = "DB_BACKUP_CONFIG")]
    pub config: PathBuf,

    #[command(flatten)]
    pub backup: BackupArgs,

    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand, Debug, Default)]
pub enum Action {
    /// Back up all configured servers. (Default)
    #[default]
    Backup,
    /// Encrypt a plain text credentials file with age.
    Encrypt(EncryptArgs),
}

/// Options of the backup, accepted with and without the `backup` subcommand.
#[derive(Args, Debug)]
pub struct BackupArgs {
    /// Encrypted credentials.
    #[arg(
        long,
        global = true,
        default_value = "credentials.toml.age",
        env = "DB_BACKUP_CREDENTIALS"
    )]
    pub credentials: PathBuf,

    /// Print the report as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    /// Exit with a non-zero status if any backup failed.
    #[arg(long, global = true)]
    pub fail_on_error: bool,
}

#[derive(Args, Debug)]
pub struct EncryptArgs {
    /// Plain text credentials.
    #[arg(long = "in", default_value = "credentials.toml")]
    pub input: PathBuf,

    /// Encrypted output.
    #[arg(long = "out", default_value = "credentials.toml.age")]
    pub output: PathBuf,

    /// File containing the age recipient.
    #[arg(long = "pubkey", default_value = "public-key.txt")]
    pub public_key: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_default_to_backup() {
        let cli = Cli::try_parse_from(["db_backup"]).unwrap();
        assert!(cli.action.is_none());
        assert!(matches!(cli.action.unwrap_or_default(), Action::Backup));
        assert_eq!(cli.config, PathBuf::from("config.toml"));
        assert_eq!(cli.backup.credentials, PathBuf::from("credentials.toml.age"));
        assert!(!cli.backup.json);
    }

    #[test]
    fn should_accept_backup_options_without_subcommand() {
        let cli = Cli::try_parse_from([
            "db_backup",
            "--credentials",
            "prod.toml.age",
            "--json",
        ])
        .unwrap();

        assert!(cli.action.is_none());
        assert_eq!(cli.backup.credentials, PathBuf::from("prod.toml.age"));
        assert!(cli.backup.json);
    }

    #[test]
    fn should_parse_encrypt_flags() {
        let cli = Cli::try_parse_from([
            "db_backup",
            "encrypt",
            "--in",
            "c.toml",
            "--out",
            "c.age",
            "--pubkey",
            "pub.txt",
        ])
        .unwrap();

        let Some(Action::Encrypt(args)) = cli.action else {
            panic!("expected encrypt action");
        };
        assert_eq!(args.input, PathBuf::from("c.toml"));
        assert_eq!(args.output, PathBuf::from("c.age"));
        assert_eq!(args.public_key, PathBuf::from("pub.txt"));
    }

    #[test]
    fn should_parse_backup_flags() {
        let cli = Cli::try_parse_from([
            "db_backup",
            "--verbose",
            "debug",
            "backup",
            "--json",
            "--fail-on-error",
        ])
        .unwrap();

        assert_eq!(cli.verbose, Some(LevelFilter::Debug));
        assert!(matches!(cli.action, Some(Action::Backup)));
        assert!(cli.backup.json);
        assert!(cli.backup.fail_on_error);
    }
}
