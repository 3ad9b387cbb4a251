//! MySQL and MariaDB.

use super::{shell_quote, Connection, DatabaseEngine};
use crate::config::sanitize_directory_name;

const INTERNAL_SCHEMAS: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

/// Option file read from the standard input of the client.
const STDIN_CONFIG: &str = "/dev/stdin";

/// Dumps with `mysqldump` and queries with the `mysql` client.
#[derive(Debug, Default, Clone, Copy)]
pub struct MySql;

impl MySql {
    /// Client arguments shared by `mysql` and `mysqldump`.
    ///
    /// `--defaults-extra-file` has to come first, so the result is meant to be
    /// placed right after the program name.
    fn client_args(conn: &Connection) -> String {
        let mut args = Vec::new();
        match (&conn.staged_config, &conn.password) {
            (Some(path), _) => args.push(format!("--defaults-extra-file={}", shell_quote(path))),
            (None, Some(_)) => args.push(format!("--defaults-extra-file={STDIN_CONFIG}")),
            (None, None) => args.push(format!("--user={}", shell_quote(&conn.user))),
        }
        args.push(format!("--host={}", shell_quote(&conn.host)));
        args.push(format!("--port={}", conn.port));
        args.join(" ")
    }
}

impl DatabaseEngine for MySql {
    fn dump_command(&self, conn: &Connection, database: &str) -> String {
        format!(
            "mysqldump {} --opt --single-transaction {}",
            Self::client_args(conn),
            shell_quote(database),
        )
    }

    fn discovery_command(&self, conn: &Connection) -> String {
        format!(
            "mysql {} --skip-column-names --batch --execute='SHOW DATABASES'",
            Self::client_args(conn),
        )
    }

    fn size_query(&self, conn: &Connection, database: &str) -> String {
        let query = format!(
            "SELECT SUM(data_length + index_length) FROM information_schema.tables WHERE table_schema = '{}'",
            database.replace('\\', "\\\\").replace('\'', "''"),
        );
        format!(
            "mysql {} --skip-column-names --batch --execute={}",
            Self::client_args(conn),
            shell_quote(&query),
        )
    }

    fn internal_schemas(&self) -> &'static [&'static str] {
        INTERNAL_SCHEMAS
    }

    fn staged_config_path(&self, server: &str) -> String {
        // relative to the login directory of the remote user
        format!(".db_backup_{}.cnf", sanitize_directory_name(server))
    }

    fn client_config(&self, conn: &Connection) -> String {
        let mut config = format!("[client]\nuser={}\n", option_value(&conn.user));
        if let Some(password) = &conn.password {
            config.push_str(&format!("password={}\n", option_value(password)));
        }
        config
    }
}

/// Quotes a value of a MySQL option file.
fn option_value(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        Connection {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "dump".to_string(),
            password: Some("p'w".to_string()),
            staged_config: None,
        }
    }

    #[test]
    fn should_pass_password_through_stdin() {
        let cmd = MySql.dump_command(&conn(), "orders");
        assert_eq!(
            cmd,
            "mysqldump --defaults-extra-file=/dev/stdin --host='127.0.0.1' --port=3306 --opt --single-transaction 'orders'"
        );
        assert_eq!(
            MySql.command_input(&conn()),
            b"[client]\nuser=\"dump\"\npassword=\"p'w\"\n"
        );
    }

    #[test]
    fn should_connect_without_password() {
        let mut conn = conn();
        conn.password = None;

        let cmd = MySql.discovery_command(&conn);
        assert!(cmd.starts_with("mysql --user='dump' --host='127.0.0.1' "));
        assert!(MySql.command_input(&conn).is_empty());
    }

    #[test]
    fn should_use_staged_config_instead_of_password() {
        let mut conn = conn();
        conn.staged_config = Some(MySql.staged_config_path("db 01"));

        let cmd = MySql.dump_command(&conn, "orders");
        assert!(!cmd.contains("p'w"));
        assert!(cmd.starts_with("mysqldump --defaults-extra-file='.db_backup_db_01.cnf' "));
        assert!(MySql.command_input(&conn).is_empty());

        let discovery = MySql.discovery_command(&conn);
        assert!(discovery.starts_with("mysql --defaults-extra-file="));
        assert!(discovery.ends_with("--execute='SHOW DATABASES'"));
    }

    #[test]
    fn should_stage_credentials_through_stdin() {
        let cmd = MySql.stage_credentials_command(".db_backup_a.cnf");
        assert_eq!(cmd, "umask 077 && cat > '.db_backup_a.cnf'");
        assert!(!cmd.contains("p'w"));
        assert_eq!(
            MySql.client_config(&conn()),
            "[client]\nuser=\"dump\"\npassword=\"p'w\"\n"
        );
        assert_eq!(
            MySql.cleanup_credentials_command(".db_backup_a.cnf"),
            "rm -f '.db_backup_a.cnf'"
        );
    }

    #[test]
    fn should_escape_option_values() {
        let mut conn = conn();
        conn.password = Some(r#"a"b\c"#.to_string());
        assert!(MySql
            .client_config(&conn)
            .ends_with("password=\"a\\\"b\\\\c\"\n"));
    }

    #[test]
    fn should_escape_database_name_in_size_query() {
        let cmd = MySql.size_query(&conn(), "o'rders");
        assert!(cmd.contains(r"table_schema = '\''o'\'''\''rders'\''"));
    }
}
