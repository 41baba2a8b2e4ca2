//! Process supervisor: owns the ssh child processes behind running tunnels.
//!
//! This module is split into focused submodules:
//! - `spawn`: ssh invocation, spawning, and the per-process exit waiter
//! - `terminate`: graceful-then-forceful termination and bulk shutdown
//!
//! The supervisor never looks at tunnel status. It knows processes, keyed by
//! tunnel id, and nothing else.

mod spawn;
mod terminate;

pub use spawn::{STABILITY_OPTIONS, build_ssh_args};

use crate::output::{NullSink, OutputSink};
use crate::procs;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long a tunnel gets between SIGTERM and SIGKILL.
pub const GRACE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub ssh_program: String,
    pub grace: Duration,
    /// Pass `-v` to ssh and forward its output to the sink
    pub verbose: bool,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            grace: GRACE_WINDOW,
            verbose: false,
        }
    }
}

/// A process owned by the supervisor. Dropping the handle stops its waiter.
pub struct ProcessHandle {
    pub pid: u32,
    pub tunnel_id: String,
    pub started_at: DateTime<Utc>,
    cancel: CancellationToken,
    exited: watch::Receiver<bool>,
    streams: Vec<JoinHandle<()>>,
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        for stream in &self.streams {
            stream.abort();
        }
    }
}

/// Result of a successful spawn. `exit` resolves when the waiter sees the
/// process go away; it is dropped unresolved if the handle is torn down first.
#[derive(Debug)]
pub struct Spawned {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub exit: oneshot::Receiver<ProcessExit>,
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub tunnel_id: String,
    pub pid: u32,
    pub status: Option<ExitStatus>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.status.is_some_and(|s| s.success())
    }

    /// Human readable reason for an unsuccessful exit.
    pub fn error(&self) -> Option<String> {
        match self.status {
            Some(status) if status.success() => None,
            Some(status) => Some(format!("ssh exited with {status}")),
            None => Some("ssh exit status unavailable".to_string()),
        }
    }
}

#[derive(Clone)]
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
}

struct Inner {
    opts: SupervisorOptions,
    sink: Arc<dyn OutputSink>,
    handles: Mutex<HashMap<String, ProcessHandle>>,
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(SupervisorOptions::default(), Arc::new(NullSink))
    }
}

impl ProcessSupervisor {
    pub fn new(opts: SupervisorOptions, sink: Arc<dyn OutputSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                opts,
                sink,
                handles: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.inner.opts
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        procs::is_alive(pid)
    }

    /// Pid of the process owned for `tunnel_id`, if any.
    pub fn tracked_pid(&self, tunnel_id: &str) -> Option<u32> {
        self.lock_handles().get(tunnel_id).map(|h| h.pid)
    }

    pub fn tracked(&self) -> Vec<(String, u32)> {
        let mut tracked: Vec<_> = self
            .lock_handles()
            .values()
            .map(|h| (h.tunnel_id.clone(), h.pid))
            .collect();
        tracked.sort();
        tracked
    }

    fn lock_handles(&self) -> MutexGuard<'_, HashMap<String, ProcessHandle>> {
        self.inner.handles.lock().unwrap_or_else(|poisoned| {
            warn!("handle table mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Removes the handle for `tunnel_id` only if it still refers to `pid`;
    /// a newer process for the same tunnel is left alone.
    fn take_handle(&self, tunnel_id: &str, pid: u32) -> Option<ProcessHandle> {
        let mut handles = self.lock_handles();
        match handles.get(tunnel_id) {
            Some(handle) if handle.pid == pid => handles.remove(tunnel_id),
            _ => None,
        }
    }
}
