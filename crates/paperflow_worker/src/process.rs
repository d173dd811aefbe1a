//! Starting worker processes and completing the stdout handshake.
//!
//! A worker host prints exactly one line once its channel is listening:
//! `ready` on success, `error` if it could not start. Anything else, or
//! EOF, means the executable is not a worker host.

use paperflow_protocol::defaults::{HANDSHAKE_ERROR, HANDSHAKE_READY, WORKER_SUBCOMMAND};
use paperflow_protocol::WorkerType;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::error::WorkerError;
use crate::transport;

/// Default time a worker has to print its handshake line.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Ties a worker process's lifetime to the parent.
///
/// [`ProcessGroup::prepare`] runs on the command before spawning and
/// [`ProcessGroup::adopt`] right after; an adopt failure kills the new
/// process and fails worker creation.
pub trait ProcessGroup: Send + Sync + fmt::Debug {
    fn prepare(&self, _command: &mut Command) {}

    fn adopt(&self, child: &Child) -> io::Result<()>;
}

/// Lifetime via the stdin lifeline, plus `PR_SET_PDEATHSIG` on Linux.
///
/// The worker host exits when its stdin reaches EOF, which happens however
/// the parent dies. On Linux the kernel also sends SIGKILL to the worker
/// when the spawning thread exits, covering a worker stuck inside a driver
/// call that never looks at stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParentLifetimeGroup;

impl ProcessGroup for ParentLifetimeGroup {
    #[cfg(target_os = "linux")]
    fn prepare(&self, command: &mut Command) {
        let parent = std::process::id() as libc::pid_t;
        // SAFETY: only async-signal-safe calls between fork and exec.
        unsafe {
            command.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                    return Err(io::Error::last_os_error());
                }
                // The parent may have died before the signal was armed.
                if libc::getppid() != parent {
                    return Err(io::Error::new(io::ErrorKind::Other, "parent already exited"));
                }
                Ok(())
            });
        }
    }

    fn adopt(&self, child: &Child) -> io::Result<()> {
        if child.stdin.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "worker stdin lifeline is not attached",
            ));
        }
        if child.id().is_none() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "worker exited before it could be adopted",
            ));
        }
        Ok(())
    }
}

/// How to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerLaunch {
    pub worker_type: WorkerType,
    pub executable: PathBuf,
    pub parent_pid: u32,
    pub handshake_timeout: Duration,
    /// Merged into the inherited environment of the child.
    pub environment: HashMap<String, String>,
}

/// Command-line arguments for a worker of the given type.
///
/// The native worker is the main executable in worker mode; the x86 host is
/// a dedicated executable that only takes the parent pid.
pub fn launch_args(worker_type: WorkerType, parent_pid: u32) -> Vec<String> {
    match worker_type {
        WorkerType::Native => vec![WORKER_SUBCOMMAND.to_string(), parent_pid.to_string()],
        WorkerType::WinX86 => vec![parent_pid.to_string()],
    }
}

/// A worker that completed its handshake.
#[derive(Debug)]
pub struct StartedWorker {
    pub pid: u32,
    pub child: Child,
    /// Parent end of the lifeline. Dropping it tells the worker to exit.
    pub stdin: ChildStdin,
}

/// Spawn a worker and wait for its handshake line.
pub async fn start_worker_process(
    launch: &WorkerLaunch,
    group: &dyn ProcessGroup,
) -> Result<StartedWorker, WorkerError> {
    let mut command = Command::new(&launch.executable);
    command
        .args(launch_args(launch.worker_type, launch.parent_pid))
        .envs(&launch.environment)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    group.prepare(&mut command);
    let mut child = command.spawn().map_err(WorkerError::Spawn)?;

    let Some(pid) = child.id() else {
        abandon(&mut child).await;
        return Err(WorkerError::Handshake("<exited immediately>".to_string()));
    };
    debug!(
        "[Worker {}] Spawned {} worker: {}",
        pid,
        launch.worker_type,
        launch.executable.display()
    );

    if let Err(source) = group.adopt(&child) {
        warn!("[Worker {}] Could not attach to parent lifetime: {}", pid, source);
        abandon(&mut child).await;
        return Err(WorkerError::ProcessGroup { pid, source });
    }

    let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
        abandon(&mut child).await;
        return Err(WorkerError::Spawn(io::Error::new(
            io::ErrorKind::Other,
            "worker stdio was not captured",
        )));
    };

    let mut lines = BufReader::new(stdout).lines();
    let handshake = tokio::time::timeout(launch.handshake_timeout, lines.next_line()).await;

    let line = match handshake {
        Ok(Ok(Some(line))) => line,
        Ok(Ok(None)) => {
            abandon(&mut child).await;
            return Err(WorkerError::Handshake("<eof>".to_string()));
        }
        Ok(Err(e)) => {
            abandon(&mut child).await;
            return Err(WorkerError::Handshake(format!("<unreadable: {}>", e)));
        }
        Err(_) => {
            abandon(&mut child).await;
            return Err(WorkerError::HandshakeTimeout(launch.handshake_timeout));
        }
    };

    match line.trim() {
        HANDSHAKE_READY => {}
        HANDSHAKE_ERROR => {
            abandon(&mut child).await;
            return Err(WorkerError::StartupFailed);
        }
        other => {
            let other = other.to_string();
            abandon(&mut child).await;
            return Err(WorkerError::Handshake(other));
        }
    }

    drain_stdout(pid, lines);
    info!("[Worker {}] Ready ({})", pid, launch.worker_type);

    Ok(StartedWorker { pid, child, stdin })
}

/// Keep reading the worker's stdout so it never blocks on a full pipe.
fn drain_stdout(pid: u32, mut lines: tokio::io::Lines<BufReader<ChildStdout>>) {
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            debug!("[Worker {}] stdout: {}", pid, line);
        }
    });
}

async fn abandon(child: &mut Child) {
    let pid = child.id();
    let _ = child.start_kill();
    let _ = child.wait().await;
    if let Some(pid) = pid {
        transport::remove_channel(pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_workers_use_the_worker_subcommand() {
        assert_eq!(launch_args(WorkerType::Native, 41), vec!["worker", "41"]);
        assert_eq!(launch_args(WorkerType::WinX86, 41), vec!["41"]);
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let launch = WorkerLaunch {
            worker_type: WorkerType::Native,
            executable: PathBuf::from("/definitely/not/a/worker/host"),
            parent_pid: std::process::id(),
            handshake_timeout: Duration::from_secs(1),
            environment: HashMap::new(),
        };
        let err = start_worker_process(&launch, &ParentLifetimeGroup)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_worker_output_fails_the_handshake() {
        // `echo <ppid>` prints the pid instead of a handshake line.
        let parent_pid = std::process::id();
        let launch = WorkerLaunch {
            worker_type: WorkerType::WinX86,
            executable: PathBuf::from("/bin/echo"),
            parent_pid,
            handshake_timeout: Duration::from_secs(5),
            environment: HashMap::new(),
        };
        let err = start_worker_process(&launch, &ParentLifetimeGroup)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Handshake(ref line) if *line == parent_pid.to_string()));
    }

    #[cfg(unix)]
    fn script(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-worker");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    async fn start_script(executable: PathBuf, handshake_timeout: Duration) -> WorkerError {
        const ETXTBSY: i32 = 26;

        let launch = WorkerLaunch {
            worker_type: WorkerType::WinX86,
            executable,
            parent_pid: std::process::id(),
            handshake_timeout,
            environment: HashMap::new(),
        };
        // A concurrent fork elsewhere in the test binary can briefly hold the
        // freshly written script open.
        for _ in 0..20 {
            match start_worker_process(&launch, &ParentLifetimeGroup).await {
                Err(WorkerError::Spawn(e)) if e.raw_os_error() == Some(ETXTBSY) => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                Err(e) => return e,
                Ok(_) => panic!("script completed the handshake"),
            }
        }
        panic!("script stayed busy");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_handshake_is_a_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = start_script(script(dir.path(), "echo error"), Duration::from_secs(5)).await;
        assert!(matches!(err, WorkerError::StartupFailed), "unexpected error: {err}");
        assert!(err.is_startup());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn silent_worker_hits_the_handshake_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let timeout = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = start_script(script(dir.path(), "exec sleep 30"), timeout).await;
        assert!(matches!(err, WorkerError::HandshakeTimeout(t) if t == timeout));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn adopt_requires_the_stdin_lifeline() {
        let mut child = Command::new(std::env::current_exe().unwrap())
            .arg("--list")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let err = ParentLifetimeGroup.adopt(&child).unwrap_err();
        assert!(err.to_string().contains("lifeline"));
        let _ = child.wait().await;
    }
}
