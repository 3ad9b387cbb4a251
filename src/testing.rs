//! In-memory [SessionProvider] for exercising the backup engine without a
//! network. Only built for tests and with the `testing` feature.
//!
//! A [FakeServer] answers remote commands with scripted [Reply]s: the first
//! rule whose pattern is contained in the command wins, unmatched commands
//! fail with status 127.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::remote::{ConnectParams, ExitStatus, Session, SessionError, SessionProvider};

/// Scripted answer to a remote command.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    stdout: Vec<u8>,
    stderr: String,
    code: i32,
    delay: Option<Duration>,
    panic: bool,
}

impl Reply {
    /// Successful command printing `stdout`.
    pub fn stdout(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    /// Failed command printing `stderr`.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            code,
            ..Default::default()
        }
    }

    /// Panics the caller instead of answering.
    pub fn panicking() -> Self {
        Self {
            panic: true,
            ..Default::default()
        }
    }

    /// The command takes `delay` before it exits.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Tracks how many commands run at the same time.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    total: Arc<AtomicUsize>,
}

impl Gauge {
    fn enter(&self) -> GaugeGuard<'_> {
        let current = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
        GaugeGuard { gauge: self }
    }

    /// Highest number of simultaneous commands seen.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Number of commands seen.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

struct GaugeGuard<'a> {
    gauge: &'a Gauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct ServerState {
    rules: Vec<(String, Reply)>,
    commands: Vec<String>,
    inputs: Vec<Vec<u8>>,
    connect_error: Option<String>,
    connects: usize,
    closes: usize,
}

/// A scripted remote host.
#[derive(Debug, Clone, Default)]
pub struct FakeServer {
    state: Arc<Mutex<ServerState>>,
    dumps: Gauge,
}

impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers commands containing `pattern` with `reply`.
    pub fn on(self, pattern: &str, reply: Reply) -> Self {
        self.lock().rules.push((pattern.to_string(), reply));
        self
    }

    /// Rejects every connection attempt.
    pub fn refuse_connections(self, error: &str) -> Self {
        self.lock().connect_error = Some(error.to_string());
        self
    }

    /// Counts dump commands in `gauge`, which may be shared between servers.
    pub fn with_dump_gauge(mut self, gauge: Gauge) -> Self {
        self.dumps = gauge;
        self
    }

    /// A session to this server, bypassing the provider.
    pub fn session(&self) -> FakeSession {
        FakeSession {
            server: self.clone(),
        }
    }

    /// Commands run so far, in order of their start.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Standard input of every command that got some, in order of their start.
    pub fn inputs(&self) -> Vec<Vec<u8>> {
        self.lock().inputs.clone()
    }

    pub fn dump_gauge(&self) -> &Gauge {
        &self.dumps
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// [SessionProvider] resolving hosts to [FakeServer]s.
#[derive(Debug, Clone, Default)]
pub struct FakeProvider {
    servers: HashMap<String, FakeServer>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, host: &str, server: FakeServer) -> Self {
        self.servers.insert(host.to_string(), server);
        self
    }
}

#[async_trait]
impl SessionProvider for FakeProvider {
    type Session = FakeSession;

    async fn connect(&self, params: &ConnectParams) -> Result<FakeSession, SessionError> {
        let server = self
            .servers
            .get(&params.host)
            .ok_or_else(|| SessionError::Connect {
                target: params.to_string(),
                error: "Name or service not known".to_string(),
            })?;

        let mut state = server.lock();
        if let Some(error) = &state.connect_error {
            return Err(SessionError::Connect {
                target: params.to_string(),
                error: error.clone(),
            });
        }
        state.connects += 1;
        drop(state);

        Ok(server.session())
    }
}

/// Session to a [FakeServer].
#[derive(Debug)]
pub struct FakeSession {
    server: FakeServer,
}

#[async_trait]
impl Session for FakeSession {
    async fn run(
        &self,
        command: &str,
        input: &[u8],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<ExitStatus, SessionError> {
        let reply = {
            let mut state = self.server.lock();
            state.commands.push(command.to_string());
            if !input.is_empty() {
                state.inputs.push(input.to_vec());
            }
            state
                .rules
                .iter()
                .find(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, reply)| reply.clone())
                .unwrap_or_else(|| Reply::failure(127, "command not found"))
        };

        let _guard = command
            .contains("mysqldump")
            .then(|| self.server.dumps.enter());
        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }
        if reply.panic {
            panic!("scripted panic running {command}");
        }

        for chunk in reply.stdout.chunks(1024) {
            stdout.write_all(chunk)?;
        }
        stderr.write_all(reply.stderr.as_bytes())?;

        Ok(ExitStatus::from_code(Some(reply.code)))
    }

    async fn close(self) -> Result<(), SessionError> {
        self.server.lock().closes += 1;
        Ok(())
    }
}
