//! Command runtime — executes one approved command.
//!
//! Execution goes through the injected `ProcessRunner` port. The default
//! runner spawns `shell -c run` in its own process group, drains stdout and
//! stderr on reader threads, and enforces the timeout by killing the group
//! and reporting `killed = true`. Any error the runner returns is converted
//! into a failed `CommandResult`; the drain loop never sees an execution
//! error. Each execution also bumps the command-usage counter, and counter
//! failures are logged and swallowed.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::plan::{Command, CommandResult};
use crate::usage::UsageCounter;

/// Port for process execution. The runner owns timeout enforcement: it must
/// terminate the process forcibly and report `killed = true` on expiry.
pub trait ProcessRunner: Send + Sync {
    fn run(&self, run: &str, cwd: &Path, timeout: Duration, shell: &str) -> Result<CommandResult>;
}

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Default runner: `shell -c run` with pipes and a kill-on-timeout deadline.
#[derive(Debug, Default, Clone)]
pub struct ShellProcessRunner;

impl ProcessRunner for ShellProcessRunner {
    fn run(&self, run: &str, cwd: &Path, timeout: Duration, shell: &str) -> Result<CommandResult> {
        let started = Instant::now();

        let mut command = std::process::Command::new(shell);
        command
            .arg("-c")
            .arg(run)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group so a timeout kill reaches the shell's children.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("failed to spawn `{shell} -c …` in {}", cwd.display()))?;

        let stdout = child.stdout.take().context("child stdout missing")?;
        let stderr = child.stderr.take().context("child stderr missing")?;
        let stdout_thread = thread::spawn(move || drain(stdout));
        let stderr_thread = thread::spawn(move || drain(stderr));

        let deadline = started + timeout;
        let mut killed = false;
        let status = loop {
            match child.try_wait().context("failed to poll child process")? {
                Some(status) => break Some(status),
                None if Instant::now() >= deadline => {
                    kill_process_group(&mut child);
                    killed = true;
                    break child.wait().ok();
                }
                None => thread::sleep(POLL_INTERVAL),
            }
        };

        let stdout = stdout_thread.join().unwrap_or_default();
        let stderr = stderr_thread.join().unwrap_or_default();
        let exit_code = if killed {
            None
        } else {
            status.and_then(|s| s.code())
        };

        Ok(CommandResult {
            stdout,
            stderr,
            exit_code,
            killed,
            runtime_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn drain(mut stream: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

#[cfg(unix)]
fn kill_process_group(child: &mut Child) {
    let pid = child.id() as i32;
    // The child is its own group leader; negative pid addresses the group.
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_process_group(child: &mut Child) {
    let _ = child.kill();
}

/// Executes approved commands and records usage.
pub struct CommandRuntime {
    runner: Arc<dyn ProcessRunner>,
    usage: Arc<dyn UsageCounter>,
    default_shell: String,
    default_timeout: Duration,
}

impl CommandRuntime {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        usage: Arc<dyn UsageCounter>,
        default_shell: String,
        default_timeout: Duration,
    ) -> Self {
        Self {
            runner,
            usage,
            default_shell,
            default_timeout,
        }
    }

    /// Run one command. Errors from the runner become failed results; this
    /// never returns an error.
    pub fn execute(&self, command: &Command) -> CommandResult {
        let started = Instant::now();
        let run = command.run.as_deref().unwrap_or("").trim();
        let shell = command
            .shell
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.default_shell);
        let cwd = command.cwd.as_deref().map(str::trim).filter(|s| !s.is_empty()).unwrap_or(".");
        let timeout = command
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        debug!(run, shell, cwd, ?timeout, "executing command");

        let result = match self.runner.run(run, Path::new(cwd), timeout, shell) {
            Ok(result) => result,
            Err(err) => CommandResult::from_error(
                &format!("command execution failed: {err:#}"),
                started.elapsed().as_millis() as u64,
            ),
        };

        if let Some(key) = command.usage_key()
            && let Err(err) = self.usage.increment(&key)
        {
            warn!(key, %err, "usage counter update failed");
        }

        result
    }
}
