use crate::error::{Error, Result};

use std::net::SocketAddr;

use async_trait::async_trait;
use tracing::{debug, info};

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Host process execution, swappable in tests.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<ProcessOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::Process(format!("failed to run {program}: {e}")))?;

        Ok(ProcessOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// `adb connect host:port`.
///
/// adb exits 0 even when it could not connect, so stdout is checked too.
pub async fn adb_connect(runner: &dyn ProcessRunner, adb: &str, addr: SocketAddr) -> Result<()> {
    let target = addr.to_string();
    let args = vec!["connect".to_string(), target.clone()];
    debug!(adb, %target, "Running adb connect");
    let output = runner.run(adb, &args).await?;

    let stdout = output.stdout.trim();
    let refused = stdout.contains("failed to connect")
        || stdout.contains("cannot connect")
        || stdout.contains("unable to connect");
    if !output.success || refused {
        let detail = if output.stderr.trim().is_empty() {
            stdout
        } else {
            output.stderr.trim()
        };
        return Err(Error::Process(format!(
            "adb connect {target} failed: {detail}"
        )));
    }

    info!(%target, "ADB connected");
    Ok(())
}
