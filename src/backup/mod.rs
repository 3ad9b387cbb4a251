//! The backup engine.
//!
//! - [orchestrator]: runs all servers under a concurrency limit and
//!   aggregates their [BackupResult]s into a [Report].
//! - [server]: backs up one server.
//! - [dump]: dumps one database into a compressed artifact.
//! - [writer]: gzip compression with progress accounting.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::{Display, Error, From};

use crate::credentials::CredentialError;
use crate::remote::SessionError;

pub mod dump;
pub mod orchestrator;
pub mod server;
pub mod writer;

pub use dump::DumpError;
pub use orchestrator::{Limits, Orchestrator};
pub use server::ServerCoordinator;

/// A published backup file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    /// Size of the compressed file in bytes.
    pub size: u64,
}

/// Outcome of one backup job, or of a server that failed before its jobs
/// were created.
#[derive(Debug)]
pub struct BackupResult {
    pub server: String,
    /// `None` if the server failed as a whole.
    pub database: Option<String>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub outcome: Result<Artifact, BackupError>,
}

impl BackupResult {
    /// Result of a server that failed before any database was dumped.
    pub fn server_failure(server: &str, started: DateTime<Utc>, error: BackupError) -> Self {
        Self {
            server: server.to_string(),
            database: None,
            started,
            finished: Utc::now(),
            outcome: Err(error),
        }
    }

    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Size of the artifact, only known on success.
    pub fn size(&self) -> Option<u64> {
        self.outcome.as_ref().ok().map(|artifact| artifact.size)
    }

    pub fn error(&self) -> Option<&BackupError> {
        self.outcome.as_ref().err()
    }

    pub fn duration(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }

    fn record(&self) -> ResultRecord<'_> {
        ResultRecord {
            server: &self.server,
            database: self.database.as_deref(),
            success: self.success(),
            error: self.error().map(ToString::to_string),
            started: self.started.to_rfc3339(),
            finished: self.finished.to_rfc3339(),
            size: self.size(),
            path: self.outcome.as_ref().ok().map(|artifact| &artifact.path),
        }
    }
}

impl fmt::Display for BackupResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let database = self.database.as_deref().unwrap_or("(server)");
        match &self.outcome {
            Ok(artifact) => write!(
                f,
                "✅ {} - {} backed up successfully ({}, took {:.1}s)",
                self.server,
                database,
                format_size(artifact.size),
                self.duration().as_secs_f64()
            ),
            Err(e) => write!(f, "❌ {} - {} failed: {e}", self.server, database),
        }
    }
}

/// JSON form of a [BackupResult].
#[derive(serde::Serialize)]
struct ResultRecord<'a> {
    server: &'a str,
    database: Option<&'a str>,
    success: bool,
    error: Option<String>,
    started: String,
    finished: String,
    size: Option<u64>,
    path: Option<&'a PathBuf>,
}

#[derive(Debug, Display, Error, From)]
/// Errors of a single [BackupResult].
pub enum BackupError {
    /// The output directory of the server can't be created.
    #[display("Creating the output directory failed: {_0}")]
    OutputDir(io::Error),
    /// The server credential or, depending on the policy, the database
    /// credential is missing.
    #[display("Missing credential: {_0}")]
    MissingCredential(CredentialError),
    /// No session could be established.
    #[display("Connecting failed: {_0}")]
    Connect(SessionError),
    /// The session wasn't established in time.
    #[display("Connecting timed out after {}s", _0.as_secs())]
    ConnectTimeout(#[error(ignore)] Duration),
    /// Writing the remote client config failed.
    #[display("Staging database credentials failed: {_0}")]
    StageCredentials(DumpError),
    /// Listing the databases of the server failed.
    #[display("Listing databases failed: {_0}")]
    Discovery(DumpError),
    /// Dumping the database failed.
    #[display("{_0}")]
    #[from]
    Dump(DumpError),
    /// Writing the artifact to disk failed.
    #[display("Writing the backup file failed: {_0}")]
    Persist(io::Error),
    /// The dump task panicked.
    #[display("Dump task crashed: {_0}")]
    Crashed(#[error(ignore)] String),
}

impl BackupError {
    /// Whether the error affected the whole server instead of one database.
    pub fn is_server_level(&self) -> bool {
        !matches!(
            self,
            BackupError::Dump(_) | BackupError::Persist(_) | BackupError::Crashed(_)
        )
    }
}

/// Aggregated results of a backup run.
#[derive(Debug, Default)]
pub struct Report {
    pub results: Vec<BackupResult>,
    pub elapsed: Duration,
    /// The run was cancelled before every server finished.
    pub interrupted: bool,
}

impl Report {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.success()).count()
    }

    pub fn failures(&self) -> usize {
        self.results.len() - self.successes()
    }

    /// Sum of the sizes of all successful artifacts.
    pub fn total_size(&self) -> u64 {
        self.results.iter().filter_map(BackupResult::size).sum()
    }

    /// Results of one server.
    pub fn for_server<'a>(&'a self, server: &'a str) -> impl Iterator<Item = &'a BackupResult> {
        self.results.iter().filter(move |r| r.server == server)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "results": self.results.iter().map(BackupResult::record).collect::<Vec<_>>(),
            "successes": self.successes(),
            "failures": self.failures(),
            "total_size": self.total_size(),
            "elapsed_secs": self.elapsed.as_secs_f64(),
            "interrupted": self.interrupted,
        })
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Backup Summary:")?;
        if self.interrupted {
            writeln!(f, "Run was interrupted, results are incomplete")?;
        }
        writeln!(f, "Total time: {}s", self.elapsed.as_secs())?;
        writeln!(
            f,
            "Successful backups: {} / {}",
            self.successes(),
            self.results.len()
        )?;
        writeln!(f, "Failed backups: {}", self.failures())?;
        write!(f, "Total backup size: {}", format_size(self.total_size()))
    }
}

fn format_size(bytes: u64) -> String {
    humansize::format_size(bytes, humansize::BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ExitStatus;

    fn ok(server: &str, database: &str, size: u64) -> BackupResult {
        let started = Utc::now();
        BackupResult {
            server: server.to_string(),
            database: Some(database.to_string()),
            started,
            finished: started + chrono::TimeDelta::milliseconds(1500),
            outcome: Ok(Artifact {
                path: PathBuf::from(format!("{server}/{database}.sql.gz")),
                size,
            }),
        }
    }

    fn failed(server: &str, database: &str) -> BackupResult {
        let started = Utc::now();
        BackupResult {
            server: server.to_string(),
            database: Some(database.to_string()),
            started,
            finished: started,
            outcome: Err(BackupError::Dump(DumpError::CommandFailed {
                status: ExitStatus::Failed(Some(1)),
                stderr: "access denied".to_string(),
            })),
        }
    }

    #[test]
    fn should_aggregate_results() {
        let report = Report {
            results: vec![ok("a", "x", 1024), ok("b", "y", 2048), failed("b", "z")],
            elapsed: Duration::from_secs(3),
            interrupted: false,
        };

        assert_eq!(report.successes(), 2);
        assert_eq!(report.failures(), 1);
        assert_eq!(report.total_size(), 3072);
        assert_eq!(report.for_server("b").count(), 2);

        let summary = report.to_string();
        assert!(summary.contains("Successful backups: 2 / 3"));
        assert!(summary.contains("Failed backups: 1"));
        assert!(summary.contains("Total backup size: 3 KiB"));
    }

    #[test]
    fn should_render_result_lines() {
        let line = ok("a", "orders", 1024).to_string();
        assert_eq!(line, "✅ a - orders backed up successfully (1 KiB, took 1.5s)");

        let line = failed("a", "orders").to_string();
        assert!(line.starts_with("❌ a - orders failed: "));
        assert!(line.contains("access denied"));

        let server = BackupResult::server_failure(
            "c",
            Utc::now(),
            BackupError::OutputDir(io::Error::other("read-only")),
        );
        assert!(server.to_string().starts_with("❌ c - (server) failed"));
        assert!(server.error().unwrap().is_server_level());
        assert_eq!(server.size(), None);
    }

    #[test]
    fn should_serialize_report() {
        let report = Report {
            results: vec![ok("a", "x", 10), failed("a", "y")],
            elapsed: Duration::from_secs(1),
            interrupted: false,
        };

        let json = report.to_json();
        assert_eq!(json["successes"], 1);
        assert_eq!(json["failures"], 1);
        assert_eq!(json["results"][0]["size"], 10);
        assert!(json["results"][1]["size"].is_null());
        assert!(json["results"][1]["error"]
            .as_str()
            .unwrap()
            .contains("access denied"));
    }
}
