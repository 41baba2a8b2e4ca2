use crate::env;
use log::{Level, LevelFilter, Metadata, Record};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

struct Logger {
    level: LevelFilter,
    file_level: LevelFilter,
    log_file: Option<Mutex<File>>,
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        // keep chatty dependencies out of debug output
        if metadata.level() > Level::Info && !metadata.target().starts_with("tunnelman") {
            return false;
        }
        metadata.level() <= self.level.max(self.file_level)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if record.level() <= self.file_level
            && let Some(log_file) = &self.log_file
        {
            let mut log_file = log_file.lock().unwrap_or_else(|p| p.into_inner());
            let line = format!(
                "{} {} {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.args()
            );
            let _ = writeln!(log_file, "{line}");
        }
        if record.level() <= self.level {
            eprintln!("{}", render(record));
        }
    }

    fn flush(&self) {}
}

fn render(record: &Record) -> String {
    let prefix = console::style("tunnelman").dim();
    let msg = record.args().to_string();
    match record.level() {
        Level::Error => format!("{prefix} {} {msg}", console::style("ERROR").red().bold()),
        Level::Warn => format!("{prefix} {} {msg}", console::style("WARN").yellow().bold()),
        Level::Info => format!("{prefix} {msg}"),
        Level::Debug => format!("{prefix} {}", console::style(msg).dim()),
        Level::Trace => format!("{prefix} {}", console::style(msg).dim().italic()),
    }
}

fn open_log_file() -> Option<Mutex<File>> {
    let path = &*env::TUNNELMAN_LOG_FILE;
    if let Some(dir) = path.parent()
        && let Err(err) = std::fs::create_dir_all(dir)
    {
        eprintln!("Warning: could not create log directory {}: {err}", dir.display());
        return None;
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(Mutex::new(file)),
        Err(err) => {
            eprintln!("Warning: could not open log file {}: {err}", path.display());
            None
        }
    }
}

/// Installs the process-wide `log` backend. `debug` raises the terminal level
/// to Debug regardless of TUNNELMAN_LOG.
pub fn init(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        *env::TUNNELMAN_LOG
    };
    let file_level = if debug {
        LevelFilter::Debug.max(*env::TUNNELMAN_LOG_FILE_LEVEL)
    } else {
        *env::TUNNELMAN_LOG_FILE_LEVEL
    };
    let logger = Logger {
        level,
        file_level,
        log_file: open_log_file(),
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(level.max(file_level));
    }
}
