//! Dump of a single database.

use std::io::{self, Write};
use std::time::Duration;

use derive_more::{Display, Error, From};

use super::writer::{CompressingWriter, ProgressObserver};
use crate::engine::{Connection, DatabaseEngine};
use crate::remote::{ExitStatus, Session, SessionError};

#[derive(Debug, Display, Error, From)]
/// Errors of a remote command, most notably of a database dump.
pub enum DumpError {
    /// The session failed while running the command.
    #[display("Remote session failed: {_0}")]
    #[from]
    Session(SessionError),
    /// The command exited unsuccessfully.
    #[display("Remote command {status}: {stderr}")]
    CommandFailed {
        status: ExitStatus,
        #[error(ignore)]
        stderr: String,
    },
    /// Finalizing the compressed stream failed.
    #[display("Compressing the dump failed: {_0}")]
    Compress(io::Error),
    /// The command didn't finish in time.
    #[display("Remote command timed out after {}s", _0.as_secs())]
    Timeout(#[error(ignore)] Duration),
}

/// A database to dump over an established session.
#[derive(Clone, Copy)]
pub struct DumpRequest<'a> {
    pub engine: &'a dyn DatabaseEngine,
    pub connection: &'a Connection,
    pub database: &'a str,
    pub timeout: Option<Duration>,
}

/// Dumps the requested database into `sink`, compressed with gzip.
///
/// Returns the sink with the compressed length once the dump exited
/// successfully and the gzip stream was finalized. On error the content of
/// the sink is incomplete and must be discarded, which is why it isn't
/// returned. The timeout of the request covers the size estimate as well as
/// the dump itself.
pub async fn dump<S, W, P>(
    session: &S,
    request: DumpRequest<'_>,
    sink: W,
    progress: P,
) -> Result<(W, u64), DumpError>
where
    S: Session + ?Sized,
    W: Write + Send,
    P: ProgressObserver,
{
    with_timeout(request.timeout, dump_unbounded(session, request, sink, progress)).await?
}

async fn dump_unbounded<S, W, P>(
    session: &S,
    request: DumpRequest<'_>,
    sink: W,
    mut progress: P,
) -> Result<(W, u64), DumpError>
where
    S: Session + ?Sized,
    W: Write + Send,
    P: ProgressObserver,
{
    let DumpRequest {
        engine,
        connection,
        database,
        ..
    } = request;
    let input = engine.command_input(connection);

    progress.set_total(estimate_size(session, engine, connection, database, &input).await);

    let mut writer = CompressingWriter::new(sink, progress);
    let mut stderr = Vec::new();
    let command = engine.dump_command(connection, database);
    log::debug!(target: "backup::dump", "Dumping database {database}");

    let status = session.run(&command, &input, &mut writer, &mut stderr).await?;
    if !status.success() {
        return Err(DumpError::CommandFailed {
            status,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }
    relay_stderr(database, &stderr);

    let (sink, len) = writer.finish().map_err(DumpError::Compress)?;
    log::debug!(target: "backup::dump", "Finished dump of {database} ({len} bytes compressed)");
    Ok((sink, len))
}

/// Runs `command` with `input` as its standard input and returns its
/// standard output.
pub async fn run_captured<S>(
    session: &S,
    command: &str,
    input: &[u8],
    timeout: Option<Duration>,
) -> Result<String, DumpError>
where
    S: Session + ?Sized,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let status = with_timeout(timeout, session.run(command, input, &mut stdout, &mut stderr)).await??;
    if !status.success() {
        return Err(DumpError::CommandFailed {
            status,
            stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Best-effort size estimate, `None` if it can't be determined.
async fn estimate_size<S>(
    session: &S,
    engine: &dyn DatabaseEngine,
    connection: &Connection,
    database: &str,
    input: &[u8],
) -> Option<u64>
where
    S: Session + ?Sized,
{
    let query = engine.size_query(connection, database);
    match run_captured(session, &query, input, None).await {
        Ok(output) => {
            let size = output.trim().parse().ok();
            if size.is_none() {
                log::debug!(target: "backup::dump", "Unusable size estimate for {database}: {:?}", output.trim());
            }
            size
        }
        Err(e) => {
            log::debug!(target: "backup::dump", "Estimating the size of {database} failed: {e}");
            None
        }
    }
}

async fn with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Result<T, DumpError>
where
    F: std::future::Future<Output = T>,
{
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| DumpError::Timeout(timeout)),
        None => Ok(fut.await),
    }
}

fn relay_stderr(database: &str, stderr: &[u8]) {
    let stderr = String::from_utf8_lossy(stderr);
    for line in stderr.lines().filter(|line| !line.trim().is_empty()) {
        log::warn!(target: "backup::dump", "{database}: {line}");
    }
}
