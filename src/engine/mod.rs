//! Database engines.
//!
//! An engine only knows how to build remote shell commands. Running them is
//! up to the backup pipeline, so adding an engine means implementing
//! [DatabaseEngine] and nothing else.
//!
//! Passwords never become part of a command. They reach the client through
//! a config file, either staged on the server or fed through standard input.

use std::sync::Arc;

use crate::config::{DatabaseDefinition, EngineKind};

pub mod mysql;

pub use mysql::MySql;

/// Connection parameters of a database as seen from its server.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Connection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Remote client config holding the credentials, if they were staged.
    pub staged_config: Option<String>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("staged_config", &self.staged_config)
            .finish()
    }
}

impl Connection {
    pub fn new(database: &DatabaseDefinition, password: Option<String>) -> Self {
        Self {
            host: database.host.clone(),
            port: database.port,
            user: database.user.clone(),
            password,
            staged_config: None,
        }
    }
}

/// Remote commands of a database engine.
pub trait DatabaseEngine: Send + Sync + 'static {
    /// Writes the whole database to stdout.
    fn dump_command(&self, conn: &Connection, database: &str) -> String;

    /// Lists the databases of the instance, one per line.
    fn discovery_command(&self, conn: &Connection) -> String;

    /// Prints the estimated size of `database` in bytes.
    fn size_query(&self, conn: &Connection, database: &str) -> String;

    /// Schemas internal to the engine which are never backed up.
    fn internal_schemas(&self) -> &'static [&'static str];

    /// Remote path of the staged client config of `server`.
    fn staged_config_path(&self, server: &str) -> String;

    /// Client config holding the user and password of `conn`.
    fn client_config(&self, conn: &Connection) -> String;

    /// Writes its standard input, the [client_config](Self::client_config),
    /// to `path` with permissions only for the remote user.
    fn stage_credentials_command(&self, path: &str) -> String {
        format!("umask 077 && cat > {}", shell_quote(path))
    }

    /// Removes the client config at `path`.
    fn cleanup_credentials_command(&self, path: &str) -> String {
        format!("rm -f {}", shell_quote(path))
    }

    /// Standard input of every command built for `conn`. Carries the client
    /// config unless it was staged or there is no password to pass.
    fn command_input(&self, conn: &Connection) -> Vec<u8> {
        match (&conn.staged_config, &conn.password) {
            (None, Some(_)) => self.client_config(conn).into_bytes(),
            _ => Vec::new(),
        }
    }

    /// Parses the output of the [discovery_command](Self::discovery_command).
    fn parse_discovery(&self, output: &str) -> Vec<String> {
        let internal = self.internal_schemas();
        output
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .filter(|name| !internal.iter().any(|schema| schema == name))
            .map(str::to_string)
            .collect()
    }
}

/// Creates the engine configured for a database.
pub fn engine_for(kind: EngineKind) -> Arc<dyn DatabaseEngine> {
    match kind {
        EngineKind::Mysql => Arc::new(MySql),
    }
}

/// Quotes `s` as a single POSIX shell word.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_quote_shell_words() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn should_parse_discovery_output() {
        let output = "information_schema\napp\n  logs  \n\nmysql\nperformance_schema\nsys\nmetrics\n";
        assert_eq!(MySql.parse_discovery(output), ["app", "logs", "metrics"]);
    }

    #[test]
    fn should_parse_empty_discovery_output() {
        assert!(MySql.parse_discovery("").is_empty());
        assert!(MySql.parse_discovery("  \n\t\n").is_empty());
    }
}
