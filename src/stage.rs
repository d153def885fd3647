//! Stage runner: one named list of shell commands sharing one log file.
//!
//! Commands run through `bash -c` in order with an explicitly assembled
//! environment. The first failing command ends the stage. In tty mode each
//! command becomes a session leader whose controlling terminal is a freshly
//! allocated pty, and the master side is drained into the log file.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::sys::termios::Termios;
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Mode of newly created stage logs.
const LOG_FILE_MODE: u32 = 0o664;

/// How long to wait for the pty drain once the last command has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(10);

/// A named, ordered list of shell commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: String,
    pub commands: Vec<String>,
}

/// Everything a stage needs besides its commands.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Directory commands run in.
    pub working_dir: PathBuf,
    /// Complete child environment; nothing is inherited.
    pub env: Vec<(String, String)>,
    /// Directory holding one log file per stage.
    pub log_dir: PathBuf,
    /// Run commands under a pseudo-terminal.
    pub tty: bool,
    /// Per-command limit; `None` waits forever.
    pub command_timeout: Option<Duration>,
}

/// Result of a stage that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageResult {
    pub stage: String,
    /// Combined output log, or `None` when the stage was skipped.
    pub log_file: Option<PathBuf>,
}

impl StageResult {
    pub fn skipped(&self) -> bool {
        self.log_file.is_none()
    }
}

impl Stage {
    pub fn new(name: impl Into<String>, commands: Vec<String>) -> Self {
        Self {
            name: name.into(),
            commands,
        }
    }

    /// Runs every command in order.
    ///
    /// An empty command list is skipped and leaves no log file behind.
    pub async fn run(&self, config: &StageConfig) -> Result<StageResult> {
        if self.commands.is_empty() {
            tracing::debug!(stage = %self.name, "no commands, skipping stage");
            return Ok(StageResult {
                stage: self.name.clone(),
                log_file: None,
            });
        }

        tracing::debug!(stage = %self.name, commands = self.commands.len(), "running stage");

        let log_file = config.log_dir.join(&self.name);
        let output = open_log(&log_file)
            .map_err(|e| self.error(None, format!("failed to open {}: {}", log_file.display(), e)))?;

        if config.tty {
            self.run_tty(config, &output).await?;
        } else {
            self.run_plain(config, &output).await?;
        }

        Ok(StageResult {
            stage: self.name.clone(),
            log_file: Some(log_file),
        })
    }

    async fn run_plain(&self, config: &StageConfig, output: &File) -> Result<()> {
        for command in &self.commands {
            let child = {
                let mut cmd = shell(command, config);
                cmd.stdin(Stdio::null())
                    .stdout(self.clone_fd(command, output)?)
                    .stderr(self.clone_fd(command, output)?);
                cmd.spawn()
                    .map_err(|e| self.error(Some(command), format!("failed to start: {}", e)))?
            };

            self.wait(command, child, config.command_timeout, false)
                .await?;
        }

        Ok(())
    }

    async fn run_tty(&self, config: &StageConfig, output: &File) -> Result<()> {
        let pty = openpty(None::<&Winsize>, None::<&Termios>)
            .map_err(|e| self.error(None, format!("failed to allocate a pty: {}", e)))?;
        let master = File::from(pty.master);
        let slave = File::from(pty.slave);

        let log = output
            .try_clone()
            .map_err(|e| self.error(None, format!("failed to duplicate log file: {}", e)))?;
        let mut drain = spawn_drain(master, log)
            .map_err(|e| self.error(None, format!("failed to watch pty: {}", e)))?;

        let result = self.run_tty_commands(config, &slave).await;

        // Last slave reference; the drain sees EIO once every child has exited.
        drop(slave);

        match tokio::time::timeout(DRAIN_GRACE, &mut drain).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                tracing::warn!(stage = %self.name, error = %e, "failed to copy pty output");
            }
            Ok(Err(e)) => {
                tracing::warn!(stage = %self.name, error = %e, "pty drain task failed");
            }
            Err(_) => {
                drain.abort();
                tracing::warn!(
                    stage = %self.name,
                    "a background process still holds the pty, output may be truncated"
                );
            }
        }

        result
    }

    async fn run_tty_commands(&self, config: &StageConfig, slave: &File) -> Result<()> {
        for command in &self.commands {
            let child = {
                let mut cmd = shell(command, config);
                cmd.stdin(self.clone_fd(command, slave)?)
                    .stdout(self.clone_fd(command, slave)?)
                    .stderr(self.clone_fd(command, slave)?);

                // SAFETY: only async-signal-safe calls between fork and exec.
                unsafe {
                    cmd.pre_exec(|| {
                        nix::unistd::setsid()?;
                        if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) == -1 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }

                cmd.spawn()
                    .map_err(|e| self.error(Some(command), format!("failed to start: {}", e)))?
            };

            self.wait(command, child, config.command_timeout, true)
                .await?;
        }

        Ok(())
    }

    async fn wait(
        &self,
        command: &str,
        mut child: Child,
        limit: Option<Duration>,
        session_leader: bool,
    ) -> Result<()> {
        let status = match limit {
            None => child.wait().await,
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    terminate(&mut child, session_leader).await;
                    return Err(self.error(Some(command), format!("timed out after {:?}", limit)));
                }
            },
        }
        .map_err(|e| self.error(Some(command), format!("failed to wait: {}", e)))?;

        if !status.success() {
            tracing::debug!(stage = %self.name, command = %command, %status, "command failed");
            return Err(self.error(Some(command), status.to_string()));
        }

        Ok(())
    }

    fn clone_fd(&self, command: &str, file: &File) -> Result<Stdio> {
        file.try_clone()
            .map(Stdio::from)
            .map_err(|e| self.error(Some(command), format!("failed to duplicate descriptor: {}", e)))
    }

    fn error(&self, command: Option<&str>, reason: String) -> Error {
        Error::Stage {
            stage: self.name.clone(),
            command: command.map(str::to_string),
            reason,
        }
    }
}

fn open_log(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .mode(LOG_FILE_MODE)
        .open(path)
}

fn shell(command: &str, config: &StageConfig) -> Command {
    let mut cmd = Command::new("bash");
    cmd.arg("-c")
        .arg(command)
        .current_dir(&config.working_dir)
        .env_clear()
        .envs(config.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .kill_on_drop(true);
    cmd
}

async fn terminate(child: &mut Child, session_leader: bool) {
    match (session_leader, child.id()) {
        (true, Some(pid)) => {
            // Session leader, so its pid is also its process group id.
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                tracing::warn!(pid, error = %e, "failed to kill process group");
            }
            let _ = child.wait().await;
        }
        _ => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill command");
            }
        }
    }
}

/// Copies everything written to the pty into `log` until the slave side is gone.
fn spawn_drain(master: File, log: File) -> std::io::Result<JoinHandle<std::io::Result<()>>> {
    let fd = master.as_raw_fd();
    fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK)).map_err(std::io::Error::from)?;
    let master = AsyncFd::try_new(master).map_err(std::io::Error::from)?;
    let mut log = tokio::fs::File::from_std(log);

    Ok(tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let mut guard = master.readable().await?;
            let read = guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut buf)
            });

            match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => log.write_all(&buf[..n]).await?,
                // Linux reports EIO on the master once no slave is open.
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::EIO) => break,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        log.flush().await
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir, tty: bool) -> StageConfig {
        let working_dir = dir.path().join("work");
        let log_dir = dir.path().join("logs");
        std::fs::create_dir_all(&working_dir).unwrap();
        std::fs::create_dir_all(&log_dir).unwrap();

        StageConfig {
            working_dir,
            env: vec![
                ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
                ("GREETING".to_string(), "hello".to_string()),
            ],
            log_dir,
            tty,
            command_timeout: None,
        }
    }

    fn stage(name: &str, commands: &[&str]) -> Stage {
        Stage::new(name, commands.iter().map(|c| c.to_string()).collect())
    }

    fn read_log(config: &StageConfig, name: &str) -> String {
        std::fs::read_to_string(config.log_dir.join(name)).unwrap()
    }

    #[tokio::test]
    async fn empty_stage_is_skipped_without_log() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);

        let result = stage("setup", &[]).run(&config).await.unwrap();

        assert!(result.skipped());
        assert!(!config.log_dir.join("setup").exists());
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);

        let result = stage("run", &["echo out", "echo err >&2"])
            .run(&config)
            .await
            .unwrap();

        assert_eq!(result.log_file, Some(config.log_dir.join("run")));
        assert_eq!(read_log(&config, "run"), "out\nerr\n");
    }

    #[tokio::test]
    async fn first_failure_stops_the_stage() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);

        let err = stage("run", &["echo first; exit 3", "echo second"])
            .run(&config)
            .await
            .unwrap_err();

        match err {
            Error::Stage { stage, command, .. } => {
                assert_eq!(stage, "run");
                assert_eq!(command.as_deref(), Some("echo first; exit 3"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(read_log(&config, "run"), "first\n");
    }

    #[tokio::test]
    async fn environment_is_not_inherited() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);

        stage("run", &["echo $GREETING ${HOME:-nohome}", "pwd"])
            .run(&config)
            .await
            .unwrap();

        let log = read_log(&config, "run");
        let mut lines = log.lines();
        assert_eq!(lines.next(), Some("hello nohome"));
        assert!(lines.next().unwrap().ends_with("work"));
    }

    #[tokio::test]
    async fn log_file_is_appended() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, false);

        stage("run", &["echo one"]).run(&config).await.unwrap();
        stage("run", &["echo two"]).run(&config).await.unwrap();

        assert_eq!(read_log(&config, "run"), "one\ntwo\n");
    }

    #[tokio::test]
    async fn timeout_kills_the_command() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir, false);
        config.command_timeout = Some(Duration::from_millis(200));

        let err = stage("run", &["sleep 30", "echo never"])
            .run(&config)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("timed out"));
        assert_eq!(read_log(&config, "run"), "");
    }

    #[tokio::test]
    async fn tty_mode_gives_commands_a_terminal() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, true);

        stage("run", &["test -t 0 && test -t 1 && echo interactive"])
            .run(&config)
            .await
            .unwrap();

        assert!(read_log(&config, "run").contains("interactive"));
    }

    #[tokio::test]
    async fn tty_mode_reports_failures() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir, true);

        let err = stage("teardown", &["echo partial; false", "echo never"])
            .run(&config)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Stage { ref stage, .. } if stage == "teardown"));
        let log = read_log(&config, "teardown");
        assert!(log.contains("partial"));
        assert!(!log.contains("never"));
    }
}
