use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use std::sync::Mutex;
use sysinfo::ProcessesToUpdate;

pub struct Procs {
    system: Mutex<sysinfo::System>,
}

pub static PROCS: Lazy<Procs> = Lazy::new(Procs::new);

impl Default for Procs {
    fn default() -> Self {
        Self::new()
    }
}

impl Procs {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }

    fn lock_system(&self) -> std::sync::MutexGuard<'_, sysinfo::System> {
        self.system.lock().unwrap_or_else(|poisoned| {
            warn!("System mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Executable name of `pid`, refreshed on demand.
    pub fn title(&self, pid: u32) -> Option<String> {
        let pid = sysinfo::Pid::from_u32(pid);
        let mut system = self.lock_system();
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| p.name().to_string_lossy().to_string())
    }
}

/// Zero-effect liveness probe. Never fails: anything other than a clean
/// delivery counts as "not alive".
pub fn is_alive(pid: u32) -> bool {
    // pid 0 and negative values address process groups
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            debug!("liveness probe for pid {pid} failed: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_alive_rejects_group_pids() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }

    #[test]
    fn test_is_alive_self() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn test_title_of_self() {
        let procs = Procs::new();
        assert!(procs.title(std::process::id()).is_some());
    }
}
