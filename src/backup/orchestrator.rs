//! Runs the backups of all servers.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;

use super::server::{CoordinatorSettings, ServerCoordinator};
use super::{BackupError, BackupResult, Report};
use crate::config::{
    AuthConfig, BackupConfig, DatabaseCredentialPolicy, DumpLimitScope, ServerDefinition,
};
use crate::credentials::CredentialStore;
use crate::remote::{AuthMethod, ConnectParams, SessionProvider};

const RESULT_CHANNEL_CAPACITY: usize = 64;

/// Concurrency limits of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Limits {
    /// Servers backed up at the same time.
    pub max_concurrent_servers: usize,
    /// Databases dumped at the same time, scoped by
    /// [dump_limit_scope](Self::dump_limit_scope).
    pub max_concurrent_databases: usize,
    pub dump_limit_scope: DumpLimitScope,
}

impl Limits {
    pub fn new(max_concurrent_servers: usize, max_concurrent_databases: usize) -> Self {
        Self {
            max_concurrent_servers: max_concurrent_servers.max(1),
            max_concurrent_databases: max_concurrent_databases.max(1),
            dump_limit_scope: DumpLimitScope::PerServer,
        }
    }

    pub fn with_scope(mut self, dump_limit_scope: DumpLimitScope) -> Self {
        self.dump_limit_scope = dump_limit_scope;
        self
    }

    /// Upper bound of dumps running at the same time across all servers.
    pub fn max_concurrent_dumps(&self) -> usize {
        match self.dump_limit_scope {
            DumpLimitScope::PerServer => self.max_concurrent_servers * self.max_concurrent_databases,
            DumpLimitScope::Global => self.max_concurrent_databases,
        }
    }
}

impl From<&BackupConfig> for Limits {
    fn from(config: &BackupConfig) -> Self {
        Limits::new(config.max_concurrent_servers, config.max_concurrent_databases)
            .with_scope(config.dump_limit_scope)
    }
}

/// What to do with a server after resolving its credentials.
enum Admission {
    Run {
        connect: ConnectParams,
        database_password: Option<String>,
    },
    /// Not backed up at all and not part of the report.
    Skip,
    /// Reported as failed without being contacted.
    Fail(BackupError),
}

/// Backs up many servers at once and collects their results.
pub struct Orchestrator<P: SessionProvider> {
    provider: Arc<P>,
    credentials: Arc<CredentialStore>,
    limits: Limits,
    credential_policy: DatabaseCredentialPolicy,
    settings: CoordinatorSettings,
}

impl<P: SessionProvider> Orchestrator<P> {
    pub fn new(provider: P, credentials: CredentialStore, limits: Limits) -> Self {
        Self {
            provider: Arc::new(provider),
            credentials: Arc::new(credentials),
            limits,
            credential_policy: DatabaseCredentialPolicy::default(),
            settings: CoordinatorSettings::default(),
        }
    }

    /// Orchestrator with limits, policy and settings taken from `config`.
    pub fn from_config(provider: P, credentials: CredentialStore, config: &BackupConfig) -> Self {
        Self::new(provider, credentials, Limits::from(config))
            .with_credential_policy(config.database_credential_policy)
            .with_settings(CoordinatorSettings {
                spool: config.spool,
                connect_timeout: config.connect_timeout(),
                dump_timeout: config.dump_timeout(),
            })
    }

    pub fn with_credential_policy(mut self, credential_policy: DatabaseCredentialPolicy) -> Self {
        self.credential_policy = credential_policy;
        self
    }

    pub fn with_settings(mut self, settings: CoordinatorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    /// Backs up all `servers`.
    pub async fn run(&self, servers: &[ServerDefinition]) -> Report {
        self.run_until(servers, std::future::pending()).await
    }

    /// Backs up all `servers` unless `shutdown` completes first. On shutdown
    /// running backups are aborted and the results received so far are
    /// reported.
    pub async fn run_until(
        &self,
        servers: &[ServerDefinition],
        shutdown: impl Future<Output = ()>,
    ) -> Report {
        let started = Instant::now();
        let (results_tx, mut results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);
        let server_slots = Arc::new(Semaphore::new(self.limits.max_concurrent_servers));
        let global_dump_slots = match self.limits.dump_limit_scope {
            DumpLimitScope::Global => Some(Arc::new(Semaphore::new(
                self.limits.max_concurrent_databases,
            ))),
            DumpLimitScope::PerServer => None,
        };

        let mut report = Report::default();
        let mut coordinators = JoinSet::new();
        for server in servers {
            let (connect, database_password) = match self.admit(server) {
                Admission::Run {
                    connect,
                    database_password,
                } => (connect, database_password),
                Admission::Skip => continue,
                Admission::Fail(e) => {
                    let result = BackupResult::server_failure(&server.name, chrono::Utc::now(), e);
                    log::error!(target: "backup", "{result}");
                    report.results.push(result);
                    continue;
                }
            };

            // a fresh semaphore per server unless the limit is global
            let dump_slots = global_dump_slots.clone().unwrap_or_else(|| {
                Arc::new(Semaphore::new(self.limits.max_concurrent_databases))
            });
            let coordinator = ServerCoordinator::new(
                Arc::clone(&self.provider),
                server.clone(),
                connect,
                database_password,
                dump_slots,
                self.settings,
                results_tx.clone(),
            );
            let server_slots = Arc::clone(&server_slots);
            coordinators.spawn(async move {
                // the semaphore is never closed
                let _permit = server_slots.acquire_owned().await.ok();
                coordinator.run().await;
            });
        }
        drop(results_tx);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                received = results_rx.recv() => match received {
                    Some(result) => {
                        if result.success() {
                            log::info!(target: "backup", "{result}");
                        } else {
                            log::error!(target: "backup", "{result}");
                        }
                        report.results.push(result);
                    }
                    None => break,
                },
                _ = &mut shutdown, if !report.interrupted => {
                    log::warn!(target: "backup", "Interrupted, aborting running backups");
                    report.interrupted = true;
                    coordinators.abort_all();
                }
            }
        }

        while let Some(joined) = coordinators.join_next().await {
            match joined {
                Err(e) if e.is_panic() => {
                    log::error!(target: "backup", "Server backup crashed: {e}")
                }
                _ => {}
            }
        }

        report.elapsed = started.elapsed();
        report
    }

    fn admit(&self, server: &ServerDefinition) -> Admission {
        let credential = match self.credentials.lookup(&server.credentials_key) {
            Ok(credential) => credential,
            Err(e) => {
                log::warn!(target: "backup", "Failed to load credentials for {}: {e}", server.name);
                return Admission::Skip;
            }
        };

        let auth = match &server.auth {
            AuthConfig::Key { key_path } => AuthMethod::Key {
                key_path: key_path.clone(),
                passphrase: credential.passphrase.clone(),
            },
            AuthConfig::Password => match &credential.password {
                Some(password) => AuthMethod::Password(password.clone()),
                None => {
                    log::warn!(
                        target: "backup",
                        "Credential {} of {} has no password",
                        server.credentials_key,
                        server.name
                    );
                    return Admission::Skip;
                }
            },
        };

        let database_password = match self.credentials.lookup(&server.database.credentials_key) {
            Ok(credential) => credential.password.clone(),
            Err(e) => match self.credential_policy {
                DatabaseCredentialPolicy::AllowEmpty => {
                    log::warn!(
                        target: "backup",
                        "Failed to load database credentials for {}: {e}, continuing without password",
                        server.name
                    );
                    None
                }
                DatabaseCredentialPolicy::Require => {
                    return Admission::Fail(BackupError::MissingCredential(e));
                }
            },
        };

        Admission::Run {
            connect: ConnectParams {
                host: server.host.clone(),
                port: server.port,
                user: server.user.clone(),
                auth,
            },
            database_password,
        }
    }
}
