//! Configuration of a backup run.
//!
//! The configuration is read from a TOML file. A minimal file looks like this:
//!
//! ```toml
//! private_key_path = "key.txt"
//! max_concurrent_servers = 2
//! max_concurrent_databases = 4
//!
//! [[servers]]
//! name = "db-01"
//! host = "db-01.example.org"
//! user = "backup"
//! output_path = "/srv/backups"
//! retention_days = 14
//! credentials_key = "db-01-ssh"
//! auth = { type = "key", key_path = "/root/.ssh/id_ed25519" }
//!
//! [servers.database]
//! user = "dump"
//! backup_all = true
//! credentials_key = "db-01-mysql"
//! ```

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use derive_more::{Display, Error, From};

/// Characters replaced by `_` in directory names derived from server names.
const HOSTILE_DIR_CHARS: [char; 11] = [' ', '/', '\\', ':', '*', '?', '"', '<', '>', '|', '&'];

/// Top level configuration of a backup run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BackupConfig {
    /// Identity used to unlock the credential envelope.
    pub private_key_path: PathBuf,

    /// Upper bound of servers backed up at the same time.
    #[serde(default = "default_concurrency")]
    pub max_concurrent_servers: usize,

    /// Upper bound of simultaneous database dumps, see [DumpLimitScope].
    #[serde(default = "default_concurrency")]
    pub max_concurrent_databases: usize,

    /// Whether [max_concurrent_databases](Self::max_concurrent_databases)
    /// applies per server or to the whole run.
    #[serde(default)]
    pub dump_limit_scope: DumpLimitScope,

    /// What to do if the credential of a database can't be found.
    #[serde(default)]
    pub database_credential_policy: DatabaseCredentialPolicy,

    /// Where finished dumps are buffered before they are published.
    #[serde(default)]
    pub spool: Spool,

    /// Deadline for establishing a remote session.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,

    /// Deadline for a single database dump.
    #[serde(default)]
    pub dump_timeout_secs: Option<u64>,

    /// Servers to back up.
    #[serde(default)]
    pub servers: Vec<ServerDefinition>,
}

fn default_concurrency() -> usize {
    1
}

impl BackupConfig {
    /// Reads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
        config_str.parse()
    }

    /// Checks constraints serde can't express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_servers == 0 {
            return Err(ConfigError::ZeroLimit("max_concurrent_servers"));
        }
        if self.max_concurrent_databases == 0 {
            return Err(ConfigError::ZeroLimit("max_concurrent_databases"));
        }

        for server in &self.servers {
            if !server.database.backup_all
                && server.database.name.as_deref().is_none_or(str::is_empty)
            {
                return Err(ConfigError::MissingDatabaseName(server.name.clone()));
            }
        }

        // names are unique once they became directory names
        let mut seen = HashMap::new();
        for server in &self.servers {
            let dir_name = sanitize_directory_name(&server.name);
            if let Some(other) = seen.insert(dir_name, &server.name) {
                return Err(ConfigError::DuplicateServer {
                    first: other.clone(),
                    second: server.name.clone(),
                });
            }
        }

        Ok(())
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn dump_timeout(&self) -> Option<Duration> {
        self.dump_timeout_secs.map(Duration::from_secs)
    }
}

impl std::str::FromStr for BackupConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: BackupConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}

/// Scope of the database dump concurrency limit.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DumpLimitScope {
    /// Every server gets its own limit, so up to
    /// `max_concurrent_servers * max_concurrent_databases` dumps run at once.
    #[default]
    PerServer,
    /// One limit shared by all servers.
    Global,
}

/// Handling of a missing database credential.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DatabaseCredentialPolicy {
    /// Warn and dump without a password.
    #[default]
    AllowEmpty,
    /// Fail the server.
    Require,
}

/// Buffer of a dump until it is complete.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Spool {
    /// Keep the compressed dump in memory.
    #[default]
    Memory,
    /// Stream the compressed dump into a temporary file next to the artifact.
    Disk,
}

/// A remote server hosting one database instance.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServerDefinition {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    pub auth: AuthConfig,
    /// Root of the backups. Every server gets its own subdirectory.
    pub output_path: PathBuf,
    /// Days to keep artifacts. `0` disables cleanup.
    #[serde(default)]
    pub retention_days: u32,
    /// Key of the SSH secret in the credential store.
    pub credentials_key: String,
    pub database: DatabaseDefinition,
}

fn default_ssh_port() -> u16 {
    22
}

impl ServerDefinition {
    /// Directory receiving the artifacts of this server.
    pub fn output_dir(&self) -> PathBuf {
        self.output_path.join(sanitize_directory_name(&self.name))
    }
}

/// Authentication against the SSH server.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// Private key, optionally protected by the passphrase of the credential.
    Key { key_path: PathBuf },
    /// Password of the credential.
    Password,
}

/// The database instance on a [ServerDefinition].
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct DatabaseDefinition {
    #[serde(default)]
    pub engine: EngineKind,
    /// Database host as seen from the remote server.
    #[serde(default = "default_db_host")]
    pub host: String,
    #[serde(default = "default_db_port")]
    pub port: u16,
    /// Database to back up if [backup_all](Self::backup_all) is unset.
    #[serde(default)]
    pub name: Option<String>,
    pub user: String,
    /// Discover and back up every database of the instance.
    #[serde(default)]
    pub backup_all: bool,
    /// Key of the database password in the credential store.
    pub credentials_key: String,
    /// Write a transient client config on the server instead of passing the
    /// password on the command line.
    #[serde(default = "default_stage_credentials")]
    pub stage_credentials: bool,
}

fn default_db_host() -> String {
    "127.0.0.1".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_stage_credentials() -> bool {
    true
}

/// Supported database engines.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Mysql,
}

/// Replaces characters that are hostile to file systems by `_`.
pub fn sanitize_directory_name(name: &str) -> String {
    name.replace(HOSTILE_DIR_CHARS, "_")
}

#[derive(Debug, Display, Error, From)]
/// Errors while loading the [BackupConfig].
pub enum ConfigError {
    /// The config file can't be read.
    #[display("Reading the config file failed: {_0}")]
    Read(io::Error),
    /// The config file isn't valid TOML or misses fields.
    #[display("Parsing the config file failed: {_0}")]
    #[from]
    Parse(toml::de::Error),
    /// A concurrency limit is zero.
    #[display("{_0} must be at least 1")]
    ZeroLimit(#[error(ignore)] &'static str),
    /// A server backs up a single database without naming it.
    #[display("Server {_0} has neither a database name nor backup_all set")]
    MissingDatabaseName(#[error(ignore)] String),
    /// Two servers map to the same output directory.
    #[display("Servers {first} and {second} would share an output directory")]
    DuplicateServer {
        #[error(ignore)]
        first: String,
        #[error(ignore)]
        second: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        private_key_path = "key.txt"

        [[servers]]
        name = "db 01"
        host = "db-01.example.org"
        user = "backup"
        output_path = "/srv/backups"
        credentials_key = "db-01-ssh"
        auth = { type = "key", key_path = "/root/.ssh/id_ed25519" }

        [servers.database]
        name = "orders"
        user = "dump"
        credentials_key = "db-01-mysql"
    "#;

    #[test]
    fn should_apply_defaults() {
        let config: BackupConfig = MINIMAL.parse().unwrap();
        assert_eq!(config.max_concurrent_servers, 1);
        assert_eq!(config.max_concurrent_databases, 1);
        assert_eq!(config.dump_limit_scope, DumpLimitScope::PerServer);
        assert_eq!(
            config.database_credential_policy,
            DatabaseCredentialPolicy::AllowEmpty
        );
        assert_eq!(config.spool, Spool::Memory);

        let server = &config.servers[0];
        assert_eq!(server.port, 22);
        assert_eq!(server.retention_days, 0);
        assert_eq!(server.database.port, 3306);
        assert_eq!(server.database.host, "127.0.0.1");
        assert!(server.database.stage_credentials);
        assert!(!server.database.backup_all);
        assert_eq!(server.output_dir(), PathBuf::from("/srv/backups/db_01"));
    }

    #[test]
    fn should_parse_password_auth_and_policies() {
        let config: BackupConfig = r#"
            private_key_path = "key.txt"
            dump_limit_scope = "global"
            database_credential_policy = "require"
            spool = "disk"

            [[servers]]
            name = "b"
            host = "b"
            user = "root"
            output_path = "out"
            credentials_key = "b"
            auth = { type = "password" }

            [servers.database]
            user = "root"
            backup_all = true
            credentials_key = "b-db"
        "#
        .parse()
        .unwrap();

        assert_eq!(config.dump_limit_scope, DumpLimitScope::Global);
        assert_eq!(
            config.database_credential_policy,
            DatabaseCredentialPolicy::Require
        );
        assert_eq!(config.spool, Spool::Disk);
        assert_eq!(config.servers[0].auth, AuthConfig::Password);
    }

    #[test]
    fn should_reject_missing_database_name() {
        let config = MINIMAL.replace(r#"name = "orders""#, "");
        let err = config.parse::<BackupConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseName(name) if name == "db 01"));
    }

    #[test]
    fn should_reject_zero_limits() {
        let config = format!("max_concurrent_servers = 0\n{MINIMAL}");
        let err = config.parse::<BackupConfig>().unwrap_err();
        assert!(matches!(err, ConfigError::ZeroLimit("max_concurrent_servers")));
    }

    #[test]
    fn should_reject_servers_sharing_a_directory() {
        let second = MINIMAL
            .split_once("[[servers]]")
            .unwrap()
            .1
            .replace(r#"name = "db 01""#, r#"name = "db_01""#);
        let config = format!("{MINIMAL}\n[[servers]]{second}");

        let err = config.parse::<BackupConfig>().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::DuplicateServer { first, second } if first == "db 01" && second == "db_01"
        ));
    }

    #[test]
    fn should_sanitize_directory_names() {
        assert_eq!(
            sanitize_directory_name(r#"prod/db: "main" <eu>|a&b*?\c"#),
            "prod_db___main___eu__a_b___c"
        );
        assert_eq!(sanitize_directory_name("plain-name.1"), "plain-name.1");
    }
}
