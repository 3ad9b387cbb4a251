//! [SessionProvider] backed by the OpenSSH client.
//!
//! Connecting starts a control master (`ssh -M -f -N`) that authenticates once
//! and then multiplexes every command of the session over the same connection.
//! The SSH secret is handed to `ssh` through an `SSH_ASKPASS` helper reading
//! the child's environment. Secrets of remote commands travel as their
//! standard input, see [Session::run].

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::runtime::{Handle, RuntimeFlavor};

use super::{AuthMethod, ConnectParams, ExitStatus, Session, SessionError, SessionProvider};

const ASKPASS_ENV: &str = "DB_BACKUP_ASKPASS_SECRET";
const ASKPASS_SCRIPT: &str = "#!/bin/sh\nprintf '%s\\n' \"$DB_BACKUP_ASKPASS_SECRET\"\n";
const READ_CHUNK: usize = 64 * 1024;

/// Opens [OpenSshSession]s with the `ssh` binary.
#[derive(Debug, Clone)]
pub struct OpenSsh {
    ssh_program: PathBuf,
    options: Vec<String>,
}

impl Default for OpenSsh {
    fn default() -> Self {
        Self {
            ssh_program: PathBuf::from("ssh"),
            options: vec![
                "StrictHostKeyChecking=accept-new".to_string(),
                "ServerAliveInterval=30".to_string(),
            ],
        }
    }
}

impl OpenSsh {
    /// Use another `ssh` binary.
    pub fn with_program(mut self, ssh_program: impl Into<PathBuf>) -> Self {
        self.ssh_program = ssh_program.into();
        self
    }

    /// Adds an `-o` option passed to every `ssh` invocation.
    pub fn with_option(mut self, option: impl Into<String>) -> Self {
        self.options.push(option.into());
        self
    }
}

#[async_trait]
impl SessionProvider for OpenSsh {
    type Session = OpenSshSession;

    async fn connect(&self, params: &ConnectParams) -> Result<OpenSshSession, SessionError> {
        let runtime_dir = tempfile::Builder::new()
            .prefix("db_backup-ssh-")
            .tempdir()
            .map_err(SessionError::Spawn)?;
        let control_path = runtime_dir.path().join("control");
        let log_path = runtime_dir.path().join("ssh.log");

        let mut master = Command::new(&self.ssh_program);
        master
            .arg("-M")
            .arg("-f")
            .arg("-N")
            .arg("-S")
            .arg(&control_path)
            .arg("-E")
            .arg(&log_path)
            .arg("-p")
            .arg(params.port.to_string())
            .arg("-l")
            .arg(&params.user);
        for option in &self.options {
            master.arg("-o").arg(option);
        }

        let secret = match &params.auth {
            AuthMethod::Key {
                key_path,
                passphrase,
            } => {
                master
                    .arg("-i")
                    .arg(key_path)
                    .arg("-o")
                    .arg("IdentitiesOnly=yes");
                passphrase.as_deref()
            }
            AuthMethod::Password(password) => {
                master
                    .arg("-o")
                    .arg("PubkeyAuthentication=no")
                    .arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive");
                Some(password.as_str())
            }
        };

        match secret {
            Some(secret) => {
                let askpass = write_askpass(runtime_dir.path()).map_err(SessionError::Spawn)?;
                master
                    .arg("-o")
                    .arg("NumberOfPasswordPrompts=1")
                    .env("SSH_ASKPASS", askpass)
                    .env("SSH_ASKPASS_REQUIRE", "force")
                    .env("DISPLAY", ":0")
                    .env(ASKPASS_ENV, secret);
            }
            None => {
                master.arg("-o").arg("BatchMode=yes");
            }
        }

        master
            .arg(&params.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        log::debug!(target: "remote::openssh", "Connecting to {params}");
        let status = master.status().await.map_err(SessionError::Spawn)?;
        if !status.success() {
            let error = std::fs::read_to_string(&log_path).unwrap_or_default();
            return Err(SessionError::Connect {
                target: params.to_string(),
                error: error.trim().to_string(),
            });
        }
        log::trace!(target: "remote::openssh", "Control master for {params} is up");

        Ok(OpenSshSession {
            ssh_program: self.ssh_program.clone(),
            control_path,
            host: params.host.clone(),
            runtime_dir: Some(runtime_dir),
            closed: false,
        })
    }
}

fn write_askpass(dir: &Path) -> io::Result<PathBuf> {
    let askpass = dir.join("askpass");
    std::fs::write(&askpass, ASKPASS_SCRIPT)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&askpass, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(askpass)
}

/// A multiplexed OpenSSH connection.
#[derive(Debug)]
pub struct OpenSshSession {
    ssh_program: PathBuf,
    control_path: PathBuf,
    host: String,
    /// Holds the control socket. Taken by [Drop] so it outlives the exit
    /// request sent to the master.
    runtime_dir: Option<TempDir>,
    closed: bool,
}

impl OpenSshSession {
    fn control_command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_program);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes");
        cmd
    }
}

/// Writes into a synchronous sink without stalling the other tasks of a
/// multi-threaded runtime. Sinks compress and may hit the disk.
fn write_to_sink(sink: &mut (dyn Write + Send), buf: &[u8]) -> io::Result<()> {
    match Handle::try_current().map(|handle| handle.runtime_flavor()) {
        Ok(RuntimeFlavor::MultiThread) => tokio::task::block_in_place(|| sink.write_all(buf)),
        _ => sink.write_all(buf),
    }
}

#[async_trait]
impl Session for OpenSshSession {
    async fn run(
        &self,
        command: &str,
        input: &[u8],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<ExitStatus, SessionError> {
        let stdin = if input.is_empty() {
            Stdio::null()
        } else {
            Stdio::piped()
        };
        let mut ssh = self.control_command();
        ssh.arg(&self.host)
            .arg("--")
            .arg(command)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = ssh.spawn().map_err(SessionError::Spawn)?;
        let child_stdin = child.stdin.take();
        let mut child_stdout = child.stdout.take().ok_or(SessionError::Closed)?;
        let mut child_stderr = child.stderr.take().ok_or(SessionError::Closed)?;

        let feed_stdin = async {
            let Some(mut child_stdin) = child_stdin else {
                return Ok(());
            };
            // dropping the pipe afterwards signals end of input
            match child_stdin.write_all(input).await {
                // the command doesn't care about its input
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
                res => res,
            }
        };
        let stdout_copy = async {
            let mut buf = vec![0; READ_CHUNK];
            loop {
                let n = child_stdout.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                write_to_sink(stdout, &buf[..n])?;
            }
            Ok::<_, io::Error>(())
        };
        let stderr_copy = async {
            let mut captured = Vec::new();
            child_stderr.read_to_end(&mut captured).await?;
            stderr.write_all(&captured)?;
            Ok::<_, io::Error>(())
        };
        // all pipes are served together, a full stderr pipe would stall stdout.
        // The first error returns right away and dropping the child kills ssh.
        tokio::try_join!(feed_stdin, stdout_copy, stderr_copy)?;

        let status = child.wait().await?;
        Ok(ExitStatus::from_code(status.code()))
    }

    async fn close(mut self) -> Result<(), SessionError> {
        let mut ssh = self.control_command();
        ssh.arg("-O")
            .arg("exit")
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let output = ssh.output().await.map_err(SessionError::Spawn)?;
        self.closed = true;
        if !output.status.success() {
            log::warn!(
                target: "remote::openssh",
                "Stopping control master for {} failed: {}",
                self.host,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        log::trace!(target: "remote::openssh", "Closed session to {}", self.host);
        Ok(())
    }
}

impl Drop for OpenSshSession {
    fn drop(&mut self) {
        if self.closed {
            return;
        }

        // the master is detached, so it has to be told to exit
        let mut exit = std::process::Command::new(&self.ssh_program);
        exit.arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("exit")
            .arg(&self.host)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let runtime_dir = self.runtime_dir.take();

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = Command::from(exit).status().await;
                    drop(runtime_dir);
                });
            }
            Err(_) => {
                let _ = exit.status();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    /// Sink of a full disk.
    struct FullDisk;

    impl Write for FullDisk {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("no space left on device"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Stand-in for the `ssh` binary running `script` instead of connecting.
    fn fake_ssh(dir: &Path, script: &str) -> PathBuf {
        let program = dir.join("ssh");
        std::fs::write(&program, format!("#!/bin/sh\n{script}\n")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&program, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        program
    }

    fn session(ssh_program: PathBuf) -> OpenSshSession {
        OpenSshSession {
            ssh_program,
            control_path: PathBuf::from("/nonexistent/control"),
            host: "db.example.org".to_string(),
            runtime_dir: None,
            closed: true,
        }
    }

    #[test]
    fn should_write_executable_askpass() {
        let dir = tempfile::tempdir().unwrap();
        let askpass = write_askpass(dir.path()).unwrap();

        let script = std::fs::read_to_string(&askpass).unwrap();
        assert!(script.starts_with("#!/bin/sh"));
        assert!(script.contains(ASKPASS_ENV));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&askpass).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }

    #[tokio::test]
    async fn should_report_missing_ssh_binary() {
        let provider = OpenSsh::default().with_program("/nonexistent/ssh");
        let params = ConnectParams {
            host: "localhost".to_string(),
            port: 22,
            user: "nobody".to_string(),
            auth: AuthMethod::Password("secret".to_string()),
        };

        let err = provider.connect(&params).await.unwrap_err();
        assert!(matches!(err, SessionError::Spawn(_)));
    }

    #[tokio::test]
    async fn should_give_up_on_failing_sink() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = fake_ssh(dir.path(), "head -c 10000000 /dev/zero\necho done >&2");
        let session = session(ssh);

        let mut stderr = Vec::new();
        let res = tokio::time::timeout(
            Duration::from_secs(10),
            session.run("mysqldump 'orders'", b"", &mut FullDisk, &mut stderr),
        )
        .await
        .expect("run should return once the sink failed");

        match res {
            Err(SessionError::Io(e)) => assert_eq!(e.to_string(), "no space left on device"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_stream_stdout_on_multi_threaded_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let ssh = fake_ssh(dir.path(), "printf 'CREATE TABLE t;'\necho warning >&2\nexit 3");
        let session = session(ssh);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = session
            .run("mysqldump 'orders'", b"", &mut stdout, &mut stderr)
            .await
            .unwrap();

        assert_eq!(status, ExitStatus::Failed(Some(3)));
        assert_eq!(stdout, b"CREATE TABLE t;");
        assert_eq!(stderr, b"warning\n");
    }

    #[tokio::test]
    async fn should_pass_input_through_stdin_only() {
        let dir = tempfile::tempdir().unwrap();
        let argv_log = dir.path().join("argv");
        let stdin_log = dir.path().join("stdin");
        let ssh = fake_ssh(
            dir.path(),
            &format!(
                "printf '%s\\n' \"$@\" > '{}'\ncat > '{}'",
                argv_log.display(),
                stdin_log.display()
            ),
        );
        let session = session(ssh);
        let input = b"[client]\nuser=\"dump\"\npassword=\"hunter2\"\n";

        let status = session
            .run("umask 077 && cat > '.db_backup_a.cnf'", input, &mut Vec::new(), &mut Vec::new())
            .await
            .unwrap();

        assert!(status.success());
        let argv = std::fs::read_to_string(&argv_log).unwrap();
        assert!(argv.contains("umask 077 && cat > '.db_backup_a.cnf'"));
        assert!(!argv.contains("hunter2"));
        assert_eq!(std::fs::read(&stdin_log).unwrap(), input);
    }
}
