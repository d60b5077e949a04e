//! External Tool Gateway
//!
//! One verb per external operation, behind a trait so protocol code can be
//! exercised against a scripted double. The real implementation shells out to
//! `python -m esptool`, `pio` and `git`; launch failures, non-zero exits and
//! deadline overruns all normalize into [`ToolError`] so callers never see
//! raw OS errors.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Per-region flash read budget.
pub const READ_REGION_TIMEOUT: Duration = Duration::from_secs(120);
/// Whole-flash dump budget.
pub const READ_ALL_TIMEOUT: Duration = Duration::from_secs(600);
/// Whole-flash erase budget.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(60);
/// Per-region flash write budget.
pub const WRITE_REGION_TIMEOUT: Duration = Duration::from_secs(120);
/// Firmware build budget.
pub const BUILD_TIMEOUT: Duration = Duration::from_secs(300);
/// Version-control operation budget.
pub const GIT_TIMEOUT: Duration = Duration::from_secs(60);

/// PlatformIO environment holding the device build configuration.
const BUILD_ENV: &str = "waveshare_7in";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{tool} failed: {message}")]
    Failure { tool: String, message: String },
    #[error("{tool} timed out after {seconds}s")]
    TimedOut { tool: String, seconds: u64 },
}

impl ToolError {
    fn failure(tool: &str, message: impl Into<String>) -> Self {
        Self::Failure { tool: tool.to_string(), message: message.into() }
    }
}

/// Uniform interface over the external flasher, builder and VCS.
pub trait ToolGateway {
    /// Read `size` bytes of flash at `offset` into `dest`.
    fn read_region(&self, offset: u32, size: u32, dest: &Path) -> Result<(), ToolError>;

    /// Read the entire flash (`size` bytes from offset 0) into `dest`.
    fn read_all(&self, size: u32, dest: &Path) -> Result<(), ToolError>;

    /// Erase the entire flash.
    fn erase_flash(&self) -> Result<(), ToolError>;

    /// Write `image` to flash at `offset`.
    fn write_region(&self, offset: u32, image: &Path) -> Result<(), ToolError>;

    /// Run the external firmware build, streaming its output.
    fn build_firmware(&self, project_dir: &Path) -> Result<(), ToolError>;

    /// Stage and commit the whole project tree.
    fn git_commit_all(&self, project_dir: &Path, message: &str) -> Result<(), ToolError>;

    /// Push the current branch to the default remote.
    fn git_push(&self, project_dir: &Path) -> Result<(), ToolError>;
}

/// Gateway that invokes the concrete command-line tools over a serial port.
pub struct ShellGateway {
    port: String,
    baud: u32,
}

impl ShellGateway {
    pub fn new(port: impl Into<String>, baud: u32) -> Self {
        Self { port: port.into(), baud }
    }

    fn esptool(&self, with_baud: bool) -> Command {
        let mut cmd = Command::new("python");
        cmd.args(["-m", "esptool", "--chip", super::flash::CHIP, "--port", &self.port]);
        if with_baud {
            cmd.args(["--baud", &self.baud.to_string()]);
        }
        cmd
    }
}

impl ToolGateway for ShellGateway {
    fn read_region(&self, offset: u32, size: u32, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = self.esptool(true);
        cmd.args(["read_flash", &format!("0x{offset:X}"), &size.to_string()])
            .arg(dest);
        invoke("esptool", cmd, READ_REGION_TIMEOUT)
    }

    fn read_all(&self, size: u32, dest: &Path) -> Result<(), ToolError> {
        let mut cmd = self.esptool(true);
        cmd.args(["read_flash", "0x0", &size.to_string()]).arg(dest);
        invoke("esptool", cmd, READ_ALL_TIMEOUT)
    }

    fn erase_flash(&self) -> Result<(), ToolError> {
        let mut cmd = self.esptool(false);
        cmd.arg("erase_flash");
        invoke("esptool", cmd, ERASE_TIMEOUT)
    }

    fn write_region(&self, offset: u32, image: &Path) -> Result<(), ToolError> {
        let mut cmd = self.esptool(true);
        cmd.args(["write_flash", &format!("0x{offset:X}")]).arg(image);
        invoke("esptool", cmd, WRITE_REGION_TIMEOUT)
    }

    fn build_firmware(&self, project_dir: &Path) -> Result<(), ToolError> {
        // Resolve up front so a missing toolchain reports as a normal failure
        // instead of a spawn error.
        let pio = which::which("pio")
            .map_err(|_| ToolError::failure("pio", "PlatformIO not found on PATH"))?;
        let mut cmd = Command::new(pio);
        cmd.args(["run", "-e", BUILD_ENV]).current_dir(project_dir);
        invoke_streaming("pio", cmd, BUILD_TIMEOUT)
    }

    fn git_commit_all(&self, project_dir: &Path, message: &str) -> Result<(), ToolError> {
        let mut add = Command::new("git");
        add.args(["add", "-A"]).current_dir(project_dir);
        invoke("git", add, GIT_TIMEOUT)?;

        let mut commit = Command::new("git");
        commit.args(["commit", "-m", message]).current_dir(project_dir);
        invoke("git", commit, GIT_TIMEOUT)
    }

    fn git_push(&self, project_dir: &Path) -> Result<(), ToolError> {
        let mut push = Command::new("git");
        push.arg("push").current_dir(project_dir);
        invoke("git", push, GIT_TIMEOUT)
    }
}

/// Run a command to completion, capturing output, bounded by `timeout`.
fn invoke(tool: &str, mut cmd: Command, timeout: Duration) -> Result<(), ToolError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

    tracing::debug!(%tool, ?cmd, "invoking");
    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::failure(tool, format!("failed to launch: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = std::thread::spawn(move || drain(stdout));
    let err_handle = std::thread::spawn(move || drain(stderr));

    let status = wait_with_deadline(tool, &mut child, timeout)?;

    let _stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    if status_ok(status) {
        Ok(())
    } else {
        let message = if stderr.trim().is_empty() {
            format!("exit code {}", status.map_or(-1, |c| c))
        } else {
            stderr.trim().to_string()
        };
        Err(ToolError::failure(tool, message))
    }
}

/// Like [`invoke`], but forwards output line-by-line as it is produced, for
/// long-running builds.
fn invoke_streaming(tool: &str, mut cmd: Command, timeout: Duration) -> Result<(), ToolError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());

    tracing::debug!(%tool, ?cmd, "invoking (streaming)");
    let mut child = cmd
        .spawn()
        .map_err(|e| ToolError::failure(tool, format!("failed to launch: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = std::thread::spawn(move || {
        if let Some(stdout) = stdout {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                println!("{line}");
            }
        }
    });
    let err_handle = std::thread::spawn(move || drain(stderr));

    let status = wait_with_deadline(tool, &mut child, timeout)?;

    let _ = out_handle.join();
    let stderr = err_handle.join().unwrap_or_default();

    if status_ok(status) {
        Ok(())
    } else {
        let message = if stderr.trim().is_empty() {
            format!("exit code {}", status.map_or(-1, |c| c))
        } else {
            stderr.trim().to_string()
        };
        Err(ToolError::failure(tool, message))
    }
}

/// Poll the child until it exits or the deadline passes; a deadline hit kills
/// the process and reports [`ToolError::TimedOut`].
fn wait_with_deadline(
    tool: &str,
    child: &mut std::process::Child,
    timeout: Duration,
) -> Result<Option<i32>, ToolError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code()),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ToolError::TimedOut {
                        tool: tool.to_string(),
                        seconds: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(ToolError::failure(tool, format!("wait failed: {e}"))),
        }
    }
}

fn status_ok(code: Option<i32>) -> bool {
    code == Some(0)
}

fn drain<R: Read>(source: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut source) = source {
        let _ = source.read_to_string(&mut buf);
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_normalizes_to_failure() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo boom >&2; exit 3"]);
        let err = invoke("sh", cmd, Duration::from_secs(5)).unwrap_err();
        match err {
            ToolError::Failure { tool, message } => {
                assert_eq!(tool, "sh");
                assert!(message.contains("boom"));
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn deadline_overrun_normalizes_to_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let err = invoke("sleep", cmd, Duration::from_millis(200)).unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }

    #[test]
    fn launch_failure_normalizes_to_failure() {
        let cmd = Command::new("definitely-not-a-real-tool-9e7b");
        let err = invoke("flasher", cmd, Duration::from_secs(1)).unwrap_err();
        match err {
            ToolError::Failure { tool, message } => {
                assert_eq!(tool, "flasher");
                assert!(message.contains("failed to launch"));
            }
            other => panic!("expected Failure, got {other:?}"),
        }
    }
}
