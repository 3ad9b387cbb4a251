//! Backup of all databases of one server.

use std::collections::HashMap;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tempfile::NamedTempFile;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::dump::{dump, run_captured, DumpRequest};
use super::writer::LogProgress;
use super::{Artifact, BackupError, BackupResult};
use crate::config::{ServerDefinition, Spool};
use crate::engine::{engine_for, Connection, DatabaseEngine};
use crate::remote::{ConnectParams, Session, SessionProvider};
use crate::util::retention::{artifact_file_name, cleanup_old_backups, Retention};

/// Per-run settings shared by all coordinators.
#[derive(Copy, Clone, Debug, Default)]
pub struct CoordinatorSettings {
    pub spool: Spool,
    pub connect_timeout: Option<Duration>,
    pub dump_timeout: Option<Duration>,
}

/// Backs up one [ServerDefinition] and reports every outcome as a
/// [BackupResult].
pub struct ServerCoordinator<P: SessionProvider> {
    provider: Arc<P>,
    engine: Arc<dyn DatabaseEngine>,
    server: ServerDefinition,
    connect: ConnectParams,
    database_password: Option<String>,
    dump_slots: Arc<Semaphore>,
    settings: CoordinatorSettings,
    results: mpsc::Sender<BackupResult>,
}

impl<P: SessionProvider> ServerCoordinator<P> {
    /// Creates a coordinator dumping at most as many databases at once as
    /// `dump_slots` has permits.
    pub fn new(
        provider: Arc<P>,
        server: ServerDefinition,
        connect: ConnectParams,
        database_password: Option<String>,
        dump_slots: Arc<Semaphore>,
        settings: CoordinatorSettings,
        results: mpsc::Sender<BackupResult>,
    ) -> Self {
        let engine = engine_for(server.database.engine);
        Self {
            provider,
            engine,
            server,
            connect,
            database_password,
            dump_slots,
            settings,
            results,
        }
    }

    /// Runs the backup. A failure before the databases were resolved is
    /// reported as a single server level [BackupResult].
    pub async fn run(self) {
        let started = Utc::now();
        log::info!(target: "backup::server", "Starting backup of server {}", self.server.name);

        match self.backup().await {
            Ok(()) => {
                log::info!(target: "backup::server", "Finished backup of server {}", self.server.name)
            }
            Err(e) => {
                log::error!(target: "backup::server", "Backup of server {} failed: {e}", self.server.name);
                let result = BackupResult::server_failure(&self.server.name, started, e);
                let _ = self.results.send(result).await;
            }
        }
    }

    async fn backup(&self) -> Result<(), BackupError> {
        let output_dir = self.server.output_dir();
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(BackupError::OutputDir)?;

        let session = Arc::new(self.open_session().await?);
        let outcome = self.with_staged_credentials(&session, &output_dir).await;

        match Arc::try_unwrap(session) {
            Ok(session) => {
                if let Err(e) = session.close().await {
                    log::warn!(target: "backup::server", "Closing session to {} failed: {e}", self.server.name);
                }
            }
            Err(_) => {
                log::warn!(target: "backup::server", "Session to {} is still in use", self.server.name)
            }
        }
        outcome?;

        let retention = Retention::new(self.server.retention_days);
        if retention.enabled() {
            let cleanup = tokio::task::spawn_blocking(move || {
                cleanup_old_backups(&output_dir, retention, SystemTime::now())
            });
            match cleanup.await {
                Ok(Ok(deleted)) if !deleted.is_empty() => {
                    log::info!(target: "backup::server", "Removed {} old backup(s) of {}", deleted.len(), self.server.name)
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    log::warn!(target: "backup::server", "Cleaning up old backups of {} failed: {e}", self.server.name)
                }
                Err(e) => {
                    log::warn!(target: "backup::server", "Cleaning up old backups of {} crashed: {e}", self.server.name)
                }
            }
        }

        Ok(())
    }

    async fn open_session(&self) -> Result<P::Session, BackupError> {
        log::debug!(target: "backup::server", "Connecting to {}", self.connect);
        let connecting = self.provider.connect(&self.connect);
        let session = match self.settings.connect_timeout {
            Some(timeout) => tokio::time::timeout(timeout, connecting)
                .await
                .map_err(|_| BackupError::ConnectTimeout(timeout))?,
            None => connecting.await,
        };
        session.map_err(BackupError::Connect)
    }

    /// Stages the database credentials on the server if configured and
    /// removes them again once the databases were dumped, successfully or not.
    async fn with_staged_credentials(
        &self,
        session: &Arc<P::Session>,
        output_dir: &Path,
    ) -> Result<(), BackupError> {
        let mut connection = Connection::new(&self.server.database, self.database_password.clone());
        if !self.server.database.stage_credentials {
            return self.dump_databases(session, connection, output_dir).await;
        }

        let path = self.engine.staged_config_path(&self.server.name);
        let stage = self.engine.stage_credentials_command(&path);
        let config = self.engine.client_config(&connection);
        run_captured(session.as_ref(), &stage, config.as_bytes(), self.settings.dump_timeout)
            .await
            .map_err(BackupError::StageCredentials)?;
        log::debug!(target: "backup::server", "Staged database credentials on {} at {path}", self.server.name);
        connection.staged_config = Some(path.clone());

        let outcome = self.dump_databases(session, connection, output_dir).await;

        let cleanup = self.engine.cleanup_credentials_command(&path);
        if let Err(e) = run_captured(session.as_ref(), &cleanup, &[], self.settings.dump_timeout).await {
            log::warn!(target: "backup::server", "Removing staged credentials from {} failed: {e}", self.server.name);
        }

        outcome
    }

    async fn resolve_databases(
        &self,
        session: &P::Session,
        connection: &Connection,
    ) -> Result<Vec<String>, BackupError> {
        let database = &self.server.database;
        if !database.backup_all {
            return Ok(database.name.iter().cloned().collect());
        }

        let discovery = self.engine.discovery_command(connection);
        let input = self.engine.command_input(connection);
        let output = run_captured(session, &discovery, &input, self.settings.dump_timeout)
            .await
            .map_err(BackupError::Discovery)?;
        let databases = self.engine.parse_discovery(&output);
        log::debug!(target: "backup::server", "Discovered databases on {}: {databases:?}", self.server.name);

        Ok(databases)
    }

    /// Dumps every resolved database and waits for all of them.
    async fn dump_databases(
        &self,
        session: &Arc<P::Session>,
        connection: Connection,
        output_dir: &Path,
    ) -> Result<(), BackupError> {
        let databases = self.resolve_databases(session, &connection).await?;
        if databases.is_empty() {
            log::warn!(target: "backup::server", "No databases to back up on {}", self.server.name);
            return Ok(());
        }

        let connection = Arc::new(connection);
        let mut jobs = JoinSet::new();
        let mut job_names = HashMap::new();
        for database in databases {
            let job = DatabaseJob {
                server: self.server.name.clone(),
                database: database.clone(),
                session: Arc::clone(session),
                engine: Arc::clone(&self.engine),
                connection: Arc::clone(&connection),
                output_dir: output_dir.to_path_buf(),
                settings: self.settings,
            };
            let slots = Arc::clone(&self.dump_slots);
            let results = self.results.clone();

            let handle = jobs.spawn(async move {
                // the semaphore is never closed
                let _permit = slots.acquire_owned().await.ok();
                let result = job.run().await;
                let _ = results.send(result).await;
            });
            job_names.insert(handle.id(), database);
        }

        // all jobs have to finish before the session can be closed
        while let Some(joined) = jobs.join_next_with_id().await {
            if let Err(e) = joined {
                let database = job_names.remove(&e.id()).unwrap_or_default();
                log::error!(target: "backup::server", "Dump of {}/{database} crashed: {e}", self.server.name);
                let now = Utc::now();
                let result = BackupResult {
                    server: self.server.name.clone(),
                    database: Some(database),
                    started: now,
                    finished: now,
                    outcome: Err(BackupError::Crashed(e.to_string())),
                };
                let _ = self.results.send(result).await;
            }
        }

        Ok(())
    }
}

/// Dump of one database into an artifact.
struct DatabaseJob<S> {
    server: String,
    database: String,
    session: Arc<S>,
    engine: Arc<dyn DatabaseEngine>,
    connection: Arc<Connection>,
    output_dir: PathBuf,
    settings: CoordinatorSettings,
}

impl<S: Session> DatabaseJob<S> {
    async fn run(self) -> BackupResult {
        let started = Utc::now();
        let outcome = self.dump_and_publish().await;
        match &outcome {
            Ok(artifact) => {
                log::debug!(target: "backup::server", "Saved {}/{} to {}", self.server, self.database, artifact.path.display())
            }
            Err(e) => {
                log::error!(target: "backup::server", "Backup of {}/{} failed: {e}", self.server, self.database)
            }
        }

        BackupResult {
            server: self.server,
            database: Some(self.database),
            started,
            finished: Utc::now(),
            outcome,
        }
    }

    async fn dump_and_publish(&self) -> Result<Artifact, BackupError> {
        let request = DumpRequest {
            engine: self.engine.as_ref(),
            connection: &self.connection,
            database: &self.database,
            timeout: self.settings.dump_timeout,
        };
        let progress = LogProgress::new(format!("{}/{}", self.server, self.database));
        let output_dir = self.output_dir.clone();
        let database = self.database.clone();

        match self.settings.spool {
            Spool::Memory => {
                let (compressed, _) = dump(self.session.as_ref(), request, Vec::new(), progress).await?;
                blocking(move || {
                    let mut partial = partial_file(&output_dir, &database)?;
                    partial.write_all(&compressed).map_err(BackupError::Persist)?;
                    publish(&output_dir, &database, partial)
                })
                .await
            }
            Spool::Disk => {
                let partial = {
                    let (output_dir, database) = (output_dir.clone(), database.clone());
                    blocking(move || partial_file(&output_dir, &database)).await?
                };
                let (partial, _) = dump(self.session.as_ref(), request, BufWriter::new(partial), progress).await?;
                blocking(move || {
                    let partial = partial
                        .into_inner()
                        .map_err(|e| BackupError::Persist(e.into_error()))?;
                    publish(&output_dir, &database, partial)
                })
                .await
            }
        }
    }
}

/// Runs file system work on the blocking thread pool.
async fn blocking<T, F>(work: F) -> Result<T, BackupError>
where
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BackupError::Persist(io::Error::other(e)))?
}

/// Temporary file next to the artifact that doesn't match the artifact
/// naming convention.
fn partial_file(output_dir: &Path, database: &str) -> Result<NamedTempFile, BackupError> {
    tempfile::Builder::new()
        .prefix(&format!(".{database}-"))
        .suffix(".sql.gz.partial")
        .tempfile_in(output_dir)
        .map_err(BackupError::Persist)
}

/// Moves the finished file to its final name.
fn publish(output_dir: &Path, database: &str, partial: NamedTempFile) -> Result<Artifact, BackupError> {
    partial.as_file().sync_all().map_err(BackupError::Persist)?;

    let path = output_dir.join(artifact_file_name(database, Utc::now()));
    let file = partial
        .persist_noclobber(&path)
        .map_err(|e| BackupError::Persist(e.error))?;
    let size = file.metadata().map_err(BackupError::Persist)?.len();

    Ok(Artifact { path, size })
}
