//! Shell provisioning backend
//!
//! Runs one `sh` script per provisioning step from a scripts directory:
//! - `create-workspace.sh <name>`: exit 0 when created, 3 when it already exists
//! - `delete-workspace.sh <name>`: exit 0 when deleted or missing, 4 when not empty
//! - `unlock.sh <name>`: releases a stale state lock
//! - `apply.sh` / `destroy.sh`: run inside the working directory with the
//!   provisioning variables in their environment
//!
//! Output of apply and destroy is streamed line by line into the job log.

use async_trait::async_trait;
use keel_core::{ControlError, Result};
use keel_runner::LogSink;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::ProvisioningBackend;

/// Exit code signalling that a workspace already exists
pub const EXIT_ALREADY_EXISTS: i32 = 3;

/// Exit code signalling that a workspace still holds resources
pub const EXIT_NOT_EMPTY: i32 = 4;

/// Provisioning backend invoking scripts with `tokio::process`
#[derive(Debug, Clone)]
pub struct ShellProvisioner {
    scripts_dir: PathBuf,
}

impl ShellProvisioner {
    /// Creates a provisioner running scripts from `scripts_dir`
    pub fn new(scripts_dir: PathBuf) -> Self {
        Self { scripts_dir }
    }

    fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }

    /// Runs a management script and returns its exit code and combined output
    async fn run_captured(&self, script: &str, name: &str) -> Result<(i32, String)> {
        let path = self.script(script);
        debug!("Running {} {}", path.display(), name);

        let output = Command::new("sh")
            .arg(&path)
            .arg(name)
            .output()
            .await
            .map_err(|e| {
                ControlError::Internal(format!("failed to run {}: {}", path.display(), e))
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok((exit_code(output.status), text))
    }

    /// Runs a step script, streaming stdout and stderr into `log`
    async fn run_streamed(
        &self,
        script: &str,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32> {
        let path = self.script(script);
        info!(
            "Running {} in {}",
            path.display(),
            working_dir.display()
        );
        log.line(format!("$ {}", path.display()));

        let mut child = Command::new("sh")
            .arg(&path)
            .current_dir(working_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| {
                ControlError::Internal(format!("failed to start {}: {}", path.display(), e))
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (_, _, status) = tokio::join!(
            pipe_lines(stdout, log.clone()),
            pipe_lines(stderr, log.clone()),
            child.wait()
        );

        let status = status.map_err(|e| {
            ControlError::Internal(format!("failed to wait for {}: {}", path.display(), e))
        })?;

        let code = exit_code(status);
        log.line(format!("{} exited with code {}", script, code));
        Ok(code)
    }
}

/// Copies lines from a child pipe into the log until EOF
async fn pipe_lines<R>(pipe: Option<R>, log: LogSink)
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return;
    };

    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        log.line(line);
    }
}

/// Exit code of a finished process; killed processes report -1
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl ProvisioningBackend for ShellProvisioner {
    async fn create_workspace(&self, name: &str) -> Result<()> {
        let (code, output) = self.run_captured("create-workspace.sh", name).await?;
        match code {
            0 => Ok(()),
            EXIT_ALREADY_EXISTS => Err(ControlError::AlreadyExists(name.to_string())),
            _ => {
                debug!("create-workspace.sh output: {}", output.trim());
                Err(ControlError::external("create-workspace", code))
            }
        }
    }

    async fn delete_workspace_if_empty(&self, name: &str) -> Result<bool> {
        let (code, output) = self.run_captured("delete-workspace.sh", name).await?;
        match code {
            0 => Ok(true),
            EXIT_NOT_EMPTY => Ok(false),
            _ => {
                debug!("delete-workspace.sh output: {}", output.trim());
                Err(ControlError::external("delete-workspace", code))
            }
        }
    }

    async fn force_unlock(&self, name: &str) -> Result<()> {
        let (code, output) = self.run_captured("unlock.sh", name).await?;
        if code != 0 {
            debug!("unlock.sh output: {}", output.trim());
            return Err(ControlError::external("unlock", code));
        }
        Ok(())
    }

    async fn apply(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32> {
        self.run_streamed("apply.sh", working_dir, env, log).await
    }

    async fn destroy(
        &self,
        working_dir: &Path,
        env: &BTreeMap<String, String>,
        log: &LogSink,
    ) -> Result<i32> {
        self.run_streamed("destroy.sh", working_dir, env, log).await
    }
}
