use once_cell::sync::Lazy;
pub use std::env::*;
use std::path::PathBuf;
use std::time::Duration;

pub static HOME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    dirs::home_dir().unwrap_or_else(|| {
        eprintln!("Warning: Could not determine home directory");
        PathBuf::from("/tmp")
    })
});
pub static TUNNELMAN_CONFIG_DIR: Lazy<PathBuf> = Lazy::new(|| {
    var_path("TUNNELMAN_CONFIG_DIR").unwrap_or(HOME_DIR.join(".config").join("tunnelman"))
});
pub static TUNNELMAN_CONFIG_FILE: Lazy<PathBuf> =
    Lazy::new(|| TUNNELMAN_CONFIG_DIR.join("tunnels.toml"));
pub static TUNNELMAN_STATE_DIR: Lazy<PathBuf> = Lazy::new(|| {
    var_path("TUNNELMAN_STATE_DIR").unwrap_or(
        dirs::state_dir()
            .unwrap_or(HOME_DIR.join(".local").join("state"))
            .join("tunnelman"),
    )
});
pub static TUNNELMAN_PID_FILE: Lazy<PathBuf> = Lazy::new(|| TUNNELMAN_STATE_DIR.join("pids.toml"));
pub static TUNNELMAN_LOG: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level("TUNNELMAN_LOG").unwrap_or(log::LevelFilter::Info));
pub static TUNNELMAN_LOG_FILE_LEVEL: Lazy<log::LevelFilter> =
    Lazy::new(|| var_log_level("TUNNELMAN_LOG_FILE_LEVEL").unwrap_or(*TUNNELMAN_LOG));
pub static TUNNELMAN_LOGS_DIR: Lazy<PathBuf> =
    Lazy::new(|| var_path("TUNNELMAN_LOGS_DIR").unwrap_or(TUNNELMAN_STATE_DIR.join("logs")));
pub static TUNNELMAN_LOG_FILE: Lazy<PathBuf> =
    Lazy::new(|| TUNNELMAN_LOGS_DIR.join("tunnelman.log"));

pub static SSH_CONFIG_FILE: Lazy<PathBuf> = Lazy::new(|| HOME_DIR.join(".ssh").join("config"));

// The ssh client used for every tunnel
pub static TUNNELMAN_SSH_BIN: Lazy<String> =
    Lazy::new(|| var("TUNNELMAN_SSH_BIN").unwrap_or_else(|_| "ssh".to_string()));

// Deadline for stopping everything at once (watch --stop-on-exit, stop --all)
pub static TUNNELMAN_STOP_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    Duration::from_secs(var_u64("TUNNELMAN_STOP_TIMEOUT_SECS").unwrap_or(10))
});

// How often `watch` sweeps recovered tunnels for dead processes.
// Lower values are useful for testing.
pub static TUNNELMAN_REFRESH_INTERVAL: Lazy<Duration> = Lazy::new(|| {
    Duration::from_secs(var_u64("TUNNELMAN_REFRESH_SECS").unwrap_or(5).max(1))
});

fn var_path(name: &str) -> Option<PathBuf> {
    var(name).map(PathBuf::from).ok()
}

fn var_u64(name: &str) -> Option<u64> {
    var(name).ok().and_then(|val| val.parse().ok())
}

fn var_log_level(name: &str) -> Option<log::LevelFilter> {
    var(name).ok().and_then(|level| level.parse().ok())
}
