//! Sandbox Executor reference implementation (SPEC_FULL.md §6.2, §1.1).
//! `LocalSandboxExecutor` runs the command on the host via `std::process::Command`
//! under a watchdog timeout; `DockerSandboxExecutor` wraps the same command in a
//! `docker run` invocation. Neither ever raises for a non-zero exit — failure is
//! always surfaced through `ToolResult::exit_code`, per the external contract.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use wait_timeout::ChildExt;
use wardloop_core::{clip_tool_output, SandboxExecOptions, SandboxMode, SandboxRunner, ToolResult};

/// Exit code reported on timeout, matching GNU `timeout`'s convention.
const TIMEOUT_EXIT_CODE: i32 = 124;

pub trait SandboxExecutor {
    fn run(&self, cmd: &str, workspace_group_id: &str, options: &SandboxExecOptions) -> ToolResult;
}

pub struct LocalSandboxExecutor {
    workspace_root: PathBuf,
}

impl LocalSandboxExecutor {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }
}

impl SandboxExecutor for LocalSandboxExecutor {
    fn run(&self, cmd: &str, workspace_group_id: &str, options: &SandboxExecOptions) -> ToolResult {
        let mut command = Command::new(&options.shell_path);
        command.arg("-c").arg(cmd).current_dir(&self.workspace_root);
        let (exit_code, stdout, stderr) = spawn_and_wait(command, options.timeout_ms, options.max_buffer_bytes);
        ToolResult {
            cmd: cmd.to_string(),
            exit_code,
            stdout: clip_tool_output(&stdout),
            stderr: clip_tool_output(&stderr),
            runner: SandboxRunner::Local,
            workspace_group_id: workspace_group_id.to_string(),
        }
    }
}

pub struct DockerSandboxExecutor {
    host_workspace_root: PathBuf,
}

impl DockerSandboxExecutor {
    pub fn new(host_workspace_root: PathBuf) -> Self {
        Self { host_workspace_root }
    }
}

impl SandboxExecutor for DockerSandboxExecutor {
    fn run(&self, cmd: &str, workspace_group_id: &str, options: &SandboxExecOptions) -> ToolResult {
        let shell = options.docker_shell_path.clone().unwrap_or_else(|| options.shell_path.clone());
        let container_name = format!("{}-{}", options.docker_container_prefix, workspace_group_id);
        let mount = format!(
            "{}:{}",
            self.host_workspace_root.display(),
            options.docker_workspace_root
        );

        let mut command = Command::new("docker");
        command
            .arg("run")
            .arg("--rm")
            .arg("--network")
            .arg(&options.docker_network)
            .arg("--memory")
            .arg(&options.docker_memory)
            .arg("--cpus")
            .arg(&options.docker_cpus)
            .arg("--pids-limit")
            .arg(options.docker_pids_limit.to_string())
            .arg("--name")
            .arg(&container_name)
            .arg("-v")
            .arg(&mount)
            .arg(&options.docker_image)
            .arg(&shell)
            .arg("-c")
            .arg(cmd);

        let (exit_code, stdout, stderr) = spawn_and_wait(command, options.timeout_ms, options.max_buffer_bytes);
        ToolResult {
            cmd: cmd.to_string(),
            exit_code,
            stdout: clip_tool_output(&stdout),
            stderr: clip_tool_output(&stderr),
            runner: SandboxRunner::Docker,
            workspace_group_id: workspace_group_id.to_string(),
        }
    }
}

/// Dispatches to the local or Docker executor based on `options.mode`, so callers
/// can wire one `SandboxExecutor` regardless of which runner a given call needs.
pub struct CompositeSandboxExecutor {
    local: LocalSandboxExecutor,
    docker: DockerSandboxExecutor,
}

impl CompositeSandboxExecutor {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self {
            local: LocalSandboxExecutor::new(workspace_root.clone()),
            docker: DockerSandboxExecutor::new(workspace_root),
        }
    }
}

impl SandboxExecutor for CompositeSandboxExecutor {
    fn run(&self, cmd: &str, workspace_group_id: &str, options: &SandboxExecOptions) -> ToolResult {
        match options.mode {
            SandboxMode::Local => self.local.run(cmd, workspace_group_id, options),
            SandboxMode::Docker => self.docker.run(cmd, workspace_group_id, options),
        }
    }
}

/// Spawn `command` with piped stdout/stderr, drain both concurrently (so a
/// full pipe can never deadlock the child), and wait for completion against
/// `timeout_ms` via `wait_timeout`. Returns `(exit_code, stdout, stderr)`; a
/// timeout kills the child and reports exit code 124; a spawn failure reports
/// 127.
fn spawn_and_wait(mut command: Command, timeout_ms: u64, max_buffer_bytes: usize) -> (i32, String, String) {
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => return (127, String::new(), format!("failed to spawn command: {err}")),
    };

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let stdout_handle = thread::spawn(move || read_capped(stdout, max_buffer_bytes));
    let stderr_handle = thread::spawn(move || read_capped(stderr, max_buffer_bytes));

    let (timed_out, captured_code) = match child.wait_timeout(Duration::from_millis(timeout_ms)) {
        Ok(Some(status)) => (false, status.code()),
        Ok(None) => {
            let _ = child.kill();
            let _ = child.wait();
            (true, None)
        }
        Err(_) => (false, None),
    };

    let stdout_buf = stdout_handle.join().unwrap_or_default();
    let stderr_buf = stderr_handle.join().unwrap_or_default();
    let exit_code = if timed_out { TIMEOUT_EXIT_CODE } else { captured_code.unwrap_or(-1) };
    (exit_code, stdout_buf, stderr_buf)
}

fn read_capped(mut pipe: impl Read, max_bytes: usize) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0_u8; 4096];
    loop {
        match pipe.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let remaining = max_bytes.saturating_sub(buf.len());
                if remaining > 0 {
                    let take = n.min(remaining);
                    buf.extend_from_slice(&chunk[..take]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(timeout_ms: u64) -> SandboxExecOptions {
        SandboxExecOptions { timeout_ms, ..SandboxExecOptions::default() }
    }

    #[test]
    fn local_executor_captures_stdout_and_exit_code() {
        let executor = LocalSandboxExecutor::new(std::env::temp_dir());
        let result = executor.run("echo hello", "g1", &options(5_000));
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello"));
        assert_eq!(result.runner, SandboxRunner::Local);
        assert_eq!(result.workspace_group_id, "g1");
    }

    #[test]
    fn local_executor_surfaces_nonzero_exit_code_without_erroring() {
        let executor = LocalSandboxExecutor::new(std::env::temp_dir());
        let result = executor.run("exit 3", "g1", &options(5_000));
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn local_executor_captures_stderr() {
        let executor = LocalSandboxExecutor::new(std::env::temp_dir());
        let result = executor.run("echo oops 1>&2", "g1", &options(5_000));
        assert!(result.stderr.contains("oops"));
    }

    #[test]
    fn local_executor_times_out_with_exit_code_124() {
        let executor = LocalSandboxExecutor::new(std::env::temp_dir());
        let result = executor.run("sleep 5", "g1", &options(100));
        assert_eq!(result.exit_code, 124);
    }

    #[test]
    fn composite_executor_dispatches_to_local_for_local_mode() {
        let executor = CompositeSandboxExecutor::new(std::env::temp_dir());
        let result = executor.run("echo hi", "g1", &options(5_000));
        assert_eq!(result.runner, SandboxRunner::Local);
    }
}
