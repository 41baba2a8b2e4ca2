use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives verbose ssh diagnostics: the exact invocation of every spawn and
/// each line the child writes. Handed to the supervisor at construction.
pub trait OutputSink: Send + Sync {
    fn command(&self, tunnel_id: &str, argv: &[String]);
    fn line(&self, tunnel_id: &str, stream: OutputStream, line: &str);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn command(&self, _tunnel_id: &str, _argv: &[String]) {}
    fn line(&self, _tunnel_id: &str, _stream: OutputStream, _line: &str) {}
}

/// Appends to `<dir>/<tunnel id>.log`, one timestamped line per entry.
#[derive(Debug)]
pub struct TunnelLogs {
    dir: PathBuf,
    files: Mutex<HashMap<String, File>>,
}

impl TunnelLogs {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn path_for(dir: &Path, tunnel_id: &str) -> PathBuf {
        dir.join(format!("{tunnel_id}.log"))
    }

    fn append(&self, tunnel_id: &str, msg: &str) {
        let mut files = self.files.lock().unwrap_or_else(|p| p.into_inner());
        if !files.contains_key(tunnel_id) {
            match self.open(tunnel_id) {
                Ok(file) => {
                    files.insert(tunnel_id.to_string(), file);
                }
                Err(err) => {
                    warn!("could not open log for tunnel {tunnel_id}: {err}");
                    return;
                }
            }
        }
        if let Some(file) = files.get_mut(tunnel_id) {
            let _ = writeln!(file, "{}", format_line(tunnel_id, msg));
        }
    }

    fn open(&self, tunnel_id: &str) -> std::io::Result<File> {
        std::fs::create_dir_all(&self.dir)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(Self::path_for(&self.dir, tunnel_id))
    }
}

fn format_line(tunnel_id: &str, msg: &str) -> String {
    format!(
        "{} {tunnel_id} {msg}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S")
    )
}

impl OutputSink for TunnelLogs {
    fn command(&self, tunnel_id: &str, argv: &[String]) {
        debug!("{tunnel_id}: {}", shell_words::join(argv));
        self.append(tunnel_id, &format!("$ {}", shell_words::join(argv)));
    }

    fn line(&self, tunnel_id: &str, stream: OutputStream, line: &str) {
        match stream {
            OutputStream::Stdout => self.append(tunnel_id, line),
            OutputStream::Stderr => self.append(tunnel_id, &format!("[stderr] {line}")),
        }
    }
}
