//! Starting, signalling and reaping worker processes.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getuid, Pid};
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("illegal '..' in process name or config: {0}")]
    IllegalPath(String),
    #[error("uid {0} does not exist on this system")]
    UnknownUser(u16),
    #[error("no environment configured for user {0}")]
    NoEnvironment(String),
    #[error("executable {} does not exist", .0.display())]
    MissingExecutable(PathBuf),
    #[error("failed to start {}: {source}", .path.display())]
    Exec {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid signal {0}")]
    BadSignal(i32),
    #[error("signalling pid {pid}: {errno}")]
    Signal { pid: u32, errno: Errno },
}

/// Everything needed to exec one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub exe: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub env: Vec<(String, String)>,
}

pub trait ProcessLauncher {
    /// Start the process and return its pid without waiting on it.
    fn spawn(&mut self, spec: &LaunchSpec) -> Result<u32, SpawnError>;
    fn signal(&mut self, pid: u32, signal: i32) -> Result<(), SpawnError>;
    /// Collect exited children; returns how many were reaped.
    fn reap(&mut self) -> usize;
}

#[derive(Debug, Default)]
pub struct OsLauncher;

impl ProcessLauncher for OsLauncher {
    fn spawn(&mut self, spec: &LaunchSpec) -> Result<u32, SpawnError> {
        if !spec.exe.is_file() {
            return Err(SpawnError::MissingExecutable(spec.exe.clone()));
        }
        let mut cmd = Command::new(&spec.exe);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // group first, then user, so the group change is still permitted
        if getuid().as_raw() != spec.uid {
            cmd.gid(spec.gid).uid(spec.uid);
        }
        let child = cmd.spawn().map_err(|source| SpawnError::Exec {
            path: spec.exe.clone(),
            source,
        })?;
        let pid = child.id();
        info!(pid, uid = spec.uid, exe = %spec.exe.display(), "started process");
        // reaped later via waitpid
        drop(child);
        Ok(pid)
    }

    fn signal(&mut self, pid: u32, signal: i32) -> Result<(), SpawnError> {
        let sig = Signal::try_from(signal).map_err(|_| SpawnError::BadSignal(signal))?;
        let raw = i32::try_from(pid)
            .ok()
            .filter(|&p| p > 0)
            .ok_or(SpawnError::Signal {
                pid,
                errno: Errno::ESRCH,
            })?;
        kill(Pid::from_raw(raw), sig).map_err(|errno| SpawnError::Signal { pid, errno })
    }

    fn reap(&mut self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(status) => {
                    debug!(?status, "reaped child");
                    reaped += 1;
                }
            }
        }
        reaped
    }
}
