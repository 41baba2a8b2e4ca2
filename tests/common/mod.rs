#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tunnelman::output::{OutputSink, OutputStream};
use tunnelman::pid_ledger::PidLedger;
use tunnelman::registry::{RegistryOptions, TunnelRegistry};
use tunnelman::supervisor::{ProcessSupervisor, SupervisorOptions};
use tunnelman::tunnel::{ForwardKind, TunnelSpec};
use std::sync::atomic::{AtomicBool, Ordering};
use tunnelman::error::FileError;
use tunnelman::tunnels_toml::SpecStore;

/// Stands in for ssh: stays up until signalled.
pub const SSH_OK: &str = "#!/bin/sh\nexec sleep 30\n";
/// Ignores SIGTERM, so only SIGKILL gets rid of it.
pub const SSH_STUBBORN: &str = "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n";
/// Gives up on its own shortly after starting.
pub const SSH_FAILS: &str = "#!/bin/sh\nsleep 0.3\nexit 3\n";
/// Talks on both streams before settling down.
pub const SSH_CHATTY: &str = "#!/bin/sh\necho \"args: $*\"\necho 'debug1: Connecting' >&2\nexec sleep 30\n";

/// Isolated directory holding a fake ssh program and the pid ledger.
pub struct TestEnv {
    temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            temp_dir: TempDir::new().unwrap(),
        }
    }

    pub fn path(&self) -> PathBuf {
        self.temp_dir.path().to_path_buf()
    }

    /// Writes an executable script and returns its path.
    pub fn fake_ssh(&self, name: &str, script: &str) -> String {
        let path = self.temp_dir.path().join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    pub fn ledger(&self) -> PidLedger {
        PidLedger::new(self.temp_dir.path().join("pids.toml"))
    }

    pub fn supervisor(&self, script: &str) -> ProcessSupervisor {
        self.supervisor_with(script, Arc::new(tunnelman::output::NullSink), false)
    }

    pub fn supervisor_with(
        &self,
        script: &str,
        sink: Arc<dyn OutputSink>,
        verbose: bool,
    ) -> ProcessSupervisor {
        ProcessSupervisor::new(
            SupervisorOptions {
                ssh_program: self.fake_ssh("ssh", script),
                grace: Duration::from_millis(500),
                verbose,
            },
            sink,
        )
    }

    pub fn registry(&self, store: Arc<MemorySpecStore>, script: &str) -> TunnelRegistry {
        TunnelRegistry::new(store, self.ledger(), self.supervisor(script), fast_options()).unwrap()
    }
}

pub fn fast_options() -> RegistryOptions {
    RegistryOptions {
        start_spacing: Duration::from_millis(100),
        restart_pause: Duration::from_millis(50),
    }
}

/// A complete local forward through "bastion".
pub fn local_spec(id: &str, port: u16) -> TunnelSpec {
    let mut spec = TunnelSpec::new(id, ForwardKind::Local, "bastion");
    spec.bind_port = Some(port);
    spec.dest_host = Some("localhost".to_string());
    spec.dest_port = Some(80);
    spec
}

/// Keeps polling `check` for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Spawns a plain `sleep` that is reaped as soon as it dies, so that it does
/// not linger as a zombie and fool liveness probes.
pub fn spawn_sleeper() -> u32 {
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .unwrap();
    let pid = child.id();
    std::thread::spawn(move || child.wait());
    pid
}

/// Records everything the supervisor reports.
#[derive(Default)]
pub struct RecordingSink {
    pub commands: Mutex<Vec<Vec<String>>>,
    pub lines: Mutex<Vec<(OutputStream, String)>>,
}

impl OutputSink for RecordingSink {
    fn command(&self, _tunnel_id: &str, argv: &[String]) {
        self.commands.lock().unwrap().push(argv.to_vec());
    }

    fn line(&self, _tunnel_id: &str, stream: OutputStream, line: &str) {
        self.lines.lock().unwrap().push((stream, line.to_string()));
    }
}

/// In-memory spec store. `fail_saves` makes every later save fail and
/// `slow_saves` makes each save block its thread for a while.
#[derive(Debug, Default)]
pub struct MemorySpecStore {
    specs: Mutex<Vec<TunnelSpec>>,
    fail_saves: AtomicBool,
    save_delay: Mutex<Duration>,
}

impl MemorySpecStore {
    pub fn new(specs: Vec<TunnelSpec>) -> Self {
        Self {
            specs: Mutex::new(specs),
            ..Default::default()
        }
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn slow_saves(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    pub fn specs(&self) -> Vec<TunnelSpec> {
        self.specs.lock().unwrap().clone()
    }
}

impl SpecStore for MemorySpecStore {
    fn load_specs(&self) -> Result<Vec<TunnelSpec>, FileError> {
        Ok(self.specs())
    }

    fn save_specs(&self, specs: &[TunnelSpec]) -> Result<(), FileError> {
        let delay = *self.save_delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(FileError::WriteError {
                path: PathBuf::from("<memory>"),
                details: Some("saves are disabled".to_string()),
            });
        }
        for spec in specs {
            if let Err(err) = spec.validate_storable() {
                return Err(FileError::InvalidEntry {
                    path: PathBuf::from("<memory>"),
                    id: spec.id.clone(),
                    reason: err.to_string(),
                });
            }
        }
        *self.specs.lock().unwrap() = specs.to_vec();
        Ok(())
    }
}
