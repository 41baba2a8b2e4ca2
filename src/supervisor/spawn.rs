use super::{ProcessExit, ProcessHandle, ProcessSupervisor, Spawned};
use crate::error::{TunnelError, TunnelResult};
use crate::output::OutputStream;
use crate::tunnel::TunnelSpec;
use crate::tunnel_status::TunnelStatus;
use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Options appended to every invocation, ahead of the operator's extra args
/// so those can still override them.
pub const STABILITY_OPTIONS: &[&str] = &[
    "-N",
    "-T",
    "-o",
    "ServerAliveInterval=60",
    "-o",
    "ServerAliveCountMax=3",
    "-o",
    "ExitOnForwardFailure=yes",
    "-o",
    "StrictHostKeyChecking=accept-new",
    "-o",
    "ControlMaster=no",
    "-o",
    "ControlPath=none",
];

/// How long the exit waiter keeps draining output after the process is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Arguments for ssh (program name excluded). The destination host is always last.
pub fn build_ssh_args(spec: &TunnelSpec, verbose: bool) -> Vec<String> {
    let mut args = vec![spec.kind.flag().to_string(), spec.forward_arg()];
    args.extend(STABILITY_OPTIONS.iter().map(|s| s.to_string()));
    args.extend(spec.extra_args.iter().cloned());
    if verbose {
        args.push("-v".to_string());
    }
    args.push(spec.ssh_host.clone());
    args
}

impl ProcessSupervisor {
    /// Starts ssh for `spec` in its own process group and begins watching it.
    ///
    /// Must be called from within a tokio runtime. Nothing is registered
    /// when the spawn fails.
    pub fn spawn(&self, spec: &TunnelSpec) -> TunnelResult<Spawned> {
        let id = spec.id.clone();
        if self.tracked_pid(&id).is_some() {
            return Err(TunnelError::AlreadyActive {
                id,
                status: TunnelStatus::Running,
            });
        }
        let opts = &self.inner.opts;
        let args = build_ssh_args(spec, opts.verbose);
        if opts.verbose {
            let argv: Vec<String> = std::iter::once(opts.ssh_program.clone())
                .chain(args.iter().cloned())
                .collect();
            self.inner.sink.command(&id, &argv);
        }
        let output = || {
            if opts.verbose {
                Stdio::piped()
            } else {
                Stdio::null()
            }
        };
        let mut cmd = tokio::process::Command::new(&opts.ssh_program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(output())
            .stderr(output())
            // a new group lets termination reach ssh's own descendants too
            .process_group(0);

        let mut child = cmd.spawn().map_err(|source| TunnelError::Spawn {
            id: id.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(TunnelError::Spawn {
                id,
                source: std::io::Error::other("ssh exited before its pid could be captured"),
            });
        };
        let started_at = Utc::now();
        let streams = self.forward_output(&id, &mut child);
        let cancel = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (exit_tx, exit_rx) = oneshot::channel();

        self.lock_handles().insert(
            id.clone(),
            ProcessHandle {
                pid,
                tunnel_id: id.clone(),
                started_at,
                cancel: cancel.clone(),
                exited: exited_rx,
                streams,
            },
        );
        info!("started tunnel {id} with pid {pid}");
        tokio::spawn(
            self.clone()
                .wait_for_exit(id, pid, child, cancel, exited_tx, exit_tx),
        );
        Ok(Spawned {
            pid,
            started_at,
            exit: exit_rx,
        })
    }

    fn forward_output(&self, id: &str, child: &mut Child) -> Vec<JoinHandle<()>> {
        let mut streams = vec![];
        if let Some(stdout) = child.stdout.take() {
            streams.push(self.forward_stream(id, OutputStream::Stdout, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            streams.push(self.forward_stream(id, OutputStream::Stderr, stderr));
        }
        streams
    }

    fn forward_stream<R>(&self, id: &str, stream: OutputStream, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let sink = self.inner.sink.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => sink.line(&id, stream, &line),
                    Ok(None) => break,
                    Err(err) => {
                        debug!("{stream} of tunnel {id} closed: {err}");
                        break;
                    }
                }
            }
        })
    }

    /// The one long-blocking task per process. Ends when the process exits or
    /// when its handle is torn down.
    async fn wait_for_exit(
        self,
        id: String,
        pid: u32,
        mut child: Child,
        cancel: CancellationToken,
        exited_tx: watch::Sender<bool>,
        exit_tx: oneshot::Sender<ProcessExit>,
    ) {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                debug!("stopped watching tunnel {id} (pid {pid})");
                return;
            }
        };
        let status = match status {
            Ok(status) => Some(status),
            Err(err) => {
                warn!("failed to wait on tunnel {id} (pid {pid}): {err}");
                None
            }
        };
        let streams = match self.take_handle(&id, pid) {
            Some(mut handle) => std::mem::take(&mut handle.streams),
            None => vec![],
        };
        let _ = exited_tx.send(true);
        for stream in streams {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, stream).await;
        }
        let exit = ProcessExit {
            tunnel_id: id,
            pid,
            status,
        };
        match exit.error() {
            Some(err) => info!("tunnel {} (pid {pid}): {err}", exit.tunnel_id),
            None => info!("tunnel {} (pid {pid}) exited", exit.tunnel_id),
        }
        let _ = exit_tx.send(exit);
    }
}
